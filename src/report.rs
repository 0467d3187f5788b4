//! Report Rendering
//!
//! Turns inspection results into human-readable text blocks or JSON. The
//! renderers are pure functions of their inputs; nothing here touches
//! cgroupfs or `/proc`.
//!
//! Text reports flag two conditions worth acting on: throttling in more than
//! half of all CPU periods, and memory usage above 90% of a configured limit.

use std::fmt::Write as _;

use crate::executor::{ExecutionReport, ExitStatus};
use crate::metrics::{
    BlkioMetrics, CgroupMetricsSnapshot, CpuMetrics, MemoryMetrics, PidsMetrics,
};
use crate::namespace::{NamespaceComparison, NamespaceStatistics, ProcessNamespaceSet};
use crate::{Pid, UNLIMITED};

const RULE: &str = "---------------------------------------";

// ============================================================================
// Error Types
// ============================================================================

/// Report serialization errors
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("json serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Cgroup Snapshot Rendering
// ============================================================================

/// Render a full metrics snapshot as a text report, one section per
/// collected record plus a summary
pub fn render_snapshot(snapshot: &CgroupMetricsSnapshot) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Cgroup Utilization Report");
    let _ = writeln!(out, "Process ID: {}", snapshot.pid);
    let _ = writeln!(out);

    if let Some(cpu) = &snapshot.cpu {
        render_cpu(&mut out, cpu);
    }
    if let Some(memory) = &snapshot.memory {
        render_memory(&mut out, memory);
    }
    if let Some(blkio) = &snapshot.blkio {
        render_blkio(&mut out, blkio);
    }
    if let Some(pids) = &snapshot.pids {
        render_pids(&mut out, pids);
    }

    let _ = writeln!(out, "Summary:");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "  Cgroup Path:     {}", snapshot.path.display());
    let _ = writeln!(out, "  Cgroup Version:  {}", snapshot.version);
    let mut collected = Vec::new();
    if snapshot.cpu.is_some() {
        collected.push("CPU");
    }
    if snapshot.memory.is_some() {
        collected.push("Memory");
    }
    if snapshot.blkio.is_some() {
        collected.push("BlkIO");
    }
    if snapshot.pids.is_some() {
        collected.push("PIDs");
    }
    let _ = writeln!(out, "  Controllers:     {}", collected.join(" "));

    out
}

fn render_cpu(out: &mut String, cpu: &CpuMetrics) {
    let _ = writeln!(out, "CPU Resource Usage:");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "  Total Usage:     {:.2} seconds", seconds(cpu.usage_usec));
    let _ = writeln!(out, "  User Mode:       {:.2} seconds", seconds(cpu.user_usec));
    let _ = writeln!(out, "  System Mode:     {:.2} seconds", seconds(cpu.system_usec));

    match cpu.limit_cores() {
        Some(cores) => {
            let _ = writeln!(out, "  Configured Limit: {cores:.2} cores");
            if cpu.nr_periods > 0 {
                let throttle_pct = cpu.nr_throttled as f64 * 100.0 / cpu.nr_periods as f64;
                let _ = writeln!(
                    out,
                    "  Throttling:      {:.2}% ({}/{} periods)",
                    throttle_pct, cpu.nr_throttled, cpu.nr_periods
                );
                let _ = writeln!(
                    out,
                    "  Throttle Time:   {:.2} seconds",
                    seconds(cpu.throttled_usec)
                );
                if throttle_pct > 50.0 {
                    let _ = writeln!(out, "  WARNING: heavy throttling detected");
                }
            }
        }
        None => {
            let _ = writeln!(out, "  Configured Limit: Unlimited");
        }
    }
    let _ = writeln!(out);
}

fn render_memory(out: &mut String, memory: &MemoryMetrics) {
    let _ = writeln!(out, "Memory Resource Usage:");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "  Current:         {:.2} MB", mebibytes(memory.current));
    let _ = writeln!(out, "  Peak:            {:.2} MB", mebibytes(memory.peak));
    let _ = writeln!(out, "  RSS:             {:.2} MB", mebibytes(memory.rss));
    let _ = writeln!(out, "  Cache:           {:.2} MB", mebibytes(memory.cache));

    if memory.limit < UNLIMITED {
        let usage_pct = memory.current as f64 * 100.0 / memory.limit as f64;
        let _ = writeln!(out, "  Configured Limit: {:.2} MB", mebibytes(memory.limit));
        let _ = writeln!(out, "  Usage:           {usage_pct:.2}%");
        if usage_pct > 90.0 {
            let _ = writeln!(out, "  WARNING: near memory limit");
        }
        if memory.pgmajfault > 100 {
            let _ = writeln!(
                out,
                "  WARNING: high major page faults ({})",
                memory.pgmajfault
            );
        }
    } else {
        let _ = writeln!(out, "  Configured Limit: Unlimited");
    }
    let _ = writeln!(out);
}

fn render_blkio(out: &mut String, blkio: &BlkioMetrics) {
    let _ = writeln!(out, "Block I/O Usage:");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(
        out,
        "  Total Read:      {:.2} MB ({} ops)",
        mebibytes(blkio.rbytes),
        blkio.rios
    );
    let _ = writeln!(
        out,
        "  Total Write:     {:.2} MB ({} ops)",
        mebibytes(blkio.wbytes),
        blkio.wios
    );
    if blkio.rios > 0 {
        let _ = writeln!(
            out,
            "  Avg Read Size:   {:.2} KB",
            blkio.rbytes as f64 / blkio.rios as f64 / 1024.0
        );
    }
    if blkio.wios > 0 {
        let _ = writeln!(
            out,
            "  Avg Write Size:  {:.2} KB",
            blkio.wbytes as f64 / blkio.wios as f64 / 1024.0
        );
    }
    let _ = writeln!(out);
}

fn render_pids(out: &mut String, pids: &PidsMetrics) {
    let _ = writeln!(out, "Process Limits:");
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "  Current PIDs:    {}", pids.current);
    if pids.limit < UNLIMITED {
        let _ = writeln!(out, "  PID Limit:       {}", pids.limit);
        let _ = writeln!(
            out,
            "  Usage:           {:.2}%",
            pids.current as f64 * 100.0 / pids.limit as f64
        );
    } else {
        let _ = writeln!(out, "  PID Limit:       Unlimited");
    }
    let _ = writeln!(out);
}

fn seconds(usec: u64) -> f64 {
    usec as f64 / 1_000_000.0
}

fn mebibytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

// ============================================================================
// Namespace Rendering
// ============================================================================

/// Render the namespace membership of one process as a fixed-order table
pub fn render_namespace_set(set: &ProcessNamespaceSet) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Namespaces for PID {}:", set.pid);
    let _ = writeln!(out, "{:<10} {:<12} {:<20}", "Type", "Available", "Inode");
    let _ = writeln!(out, "{RULE}");

    for entry in &set.entries {
        if entry.available {
            let _ = writeln!(out, "{:<10} {:<12} {:<20}", entry.kind, "Yes", entry.inode);
        } else {
            let _ = writeln!(out, "{:<10} {:<12} {:<20}", entry.kind, "No", "N/A");
        }
    }

    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "Total available: {}/8", set.available_count());

    out
}

/// Render a pairwise namespace comparison with shared/isolated totals
pub fn render_comparison(pid_a: Pid, pid_b: Pid, comparisons: &[NamespaceComparison]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Namespace Comparison: PID {pid_a} vs PID {pid_b}");
    let _ = writeln!(
        out,
        "{:<10} {:<12} {:<20} {:<20}",
        "Type", "Status", "PID1 Inode", "PID2 Inode"
    );
    let _ = writeln!(out, "{RULE}");

    let mut shared = 0;
    let mut isolated = 0;
    for comp in comparisons {
        let status = if comp.shared { "Shared" } else { "Isolated" };
        let _ = writeln!(
            out,
            "{:<10} {:<12} {:<20} {:<20}",
            comp.kind, status, comp.inode_a, comp.inode_b
        );
        if comp.shared {
            shared += 1;
        } else {
            isolated += 1;
        }
    }

    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(
        out,
        "Shared: {shared} | Isolated: {isolated} | Total: {}",
        comparisons.len()
    );

    out
}

/// Render the system-wide namespace census
pub fn render_statistics(stats: &NamespaceStatistics) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "System Namespace Statistics");
    let _ = writeln!(out, "Total Processes Analyzed: {}", stats.processes_analyzed);
    let _ = writeln!(out);
    let _ = writeln!(out, "Unique Namespaces per Type:");

    for kind in crate::namespace::NamespaceKind::ALL {
        let suffix = if stats.truncated[kind.index()] {
            " (truncated)"
        } else {
            ""
        };
        let _ = writeln!(out, "  {:<7} {}{suffix}", format!("{kind}:"), stats.unique(kind));
    }

    out
}

// ============================================================================
// Execution Report Rendering
// ============================================================================

/// Render the outcome of a confined execution
pub fn render_execution(report: &ExecutionReport) -> String {
    let mut out = String::new();

    match report.status {
        ExitStatus::Exited(code) => {
            let _ = writeln!(out, "Child exited with code {code}");
        }
        ExitStatus::Signaled(sig) => {
            let _ = writeln!(out, "Child killed by signal {sig}");
        }
    }
    let _ = writeln!(out);

    if let Some(cpu) = &report.cpu {
        render_cpu(&mut out, cpu);
    }
    if let Some(memory) = &report.memory {
        render_memory(&mut out, memory);
    }
    if let Some(blkio) = &report.blkio {
        render_blkio(&mut out, blkio);
    }
    if let Some(pids) = &report.pids {
        render_pids(&mut out, pids);
    }

    out
}

// ============================================================================
// JSON Export
// ============================================================================

/// Serialize any report value as pretty-printed JSON to a writer, followed by
/// a trailing newline
pub fn write_json<T: serde::Serialize, W: std::io::Write>(
    value: &T,
    writer: &mut W,
) -> Result<(), ReportError> {
    serde_json::to_writer_pretty(&mut *writer, value)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Serialize any report value as a pretty-printed JSON string
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ReportError> {
    Ok(serde_json::to_string_pretty(value)?)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupVersion;
    use crate::namespace::{NamespaceIdentity, NamespaceKind};
    use std::path::PathBuf;

    fn sample_snapshot() -> CgroupMetricsSnapshot {
        CgroupMetricsSnapshot {
            pid: 4242,
            path: PathBuf::from("/sys/fs/cgroup/workload"),
            version: CgroupVersion::V2,
            cpu: Some(CpuMetrics {
                usage_usec: 5_000_000,
                user_usec: 3_000_000,
                system_usec: 2_000_000,
                nr_periods: 100,
                nr_throttled: 60,
                throttled_usec: 1_500_000,
                quota: Some(50_000),
                period: 100_000,
            }),
            memory: Some(MemoryMetrics {
                current: 95 * 1024 * 1024,
                peak: 100 * 1024 * 1024,
                limit: 100 * 1024 * 1024,
                ..MemoryMetrics::default()
            }),
            blkio: Some(BlkioMetrics {
                rbytes: 1024 * 1024,
                wbytes: 2 * 1024 * 1024,
                rios: 256,
                wios: 512,
                ..BlkioMetrics::default()
            }),
            pids: Some(PidsMetrics {
                current: 5,
                limit: UNLIMITED,
            }),
        }
    }

    #[test]
    fn test_render_snapshot_sections() {
        let text = render_snapshot(&sample_snapshot());
        assert!(text.contains("Process ID: 4242"));
        assert!(text.contains("CPU Resource Usage:"));
        assert!(text.contains("Memory Resource Usage:"));
        assert!(text.contains("Block I/O Usage:"));
        assert!(text.contains("Process Limits:"));
        assert!(text.contains("Controllers:     CPU Memory BlkIO PIDs"));
    }

    #[test]
    fn test_render_snapshot_throttle_warning() {
        // 60 of 100 periods throttled crosses the 50% threshold
        let text = render_snapshot(&sample_snapshot());
        assert!(text.contains("Throttling:      60.00% (60/100 periods)"));
        assert!(text.contains("WARNING: heavy throttling detected"));
    }

    #[test]
    fn test_render_snapshot_memory_warning() {
        // 95 MB of a 100 MB limit crosses the 90% threshold
        let text = render_snapshot(&sample_snapshot());
        assert!(text.contains("Usage:           95.00%"));
        assert!(text.contains("WARNING: near memory limit"));
    }

    #[test]
    fn test_render_snapshot_unlimited() {
        let mut snapshot = sample_snapshot();
        snapshot.cpu.as_mut().unwrap().quota = None;
        snapshot.memory.as_mut().unwrap().limit = UNLIMITED;

        let text = render_snapshot(&snapshot);
        assert!(text.contains("Configured Limit: Unlimited"));
        assert!(!text.contains("WARNING"));
    }

    #[test]
    fn test_render_snapshot_missing_records() {
        let snapshot = CgroupMetricsSnapshot {
            pid: 1,
            path: PathBuf::from("/sys/fs/cgroup"),
            version: CgroupVersion::V2,
            cpu: None,
            memory: None,
            blkio: None,
            pids: None,
        };
        let text = render_snapshot(&snapshot);
        assert!(!text.contains("CPU Resource Usage:"));
        assert!(text.contains("Summary:"));
    }

    #[test]
    fn test_render_namespace_set() {
        let entries = NamespaceKind::ALL.map(|kind| NamespaceIdentity {
            kind,
            inode: if kind == NamespaceKind::Time { 0 } else { 4026531840 },
            available: kind != NamespaceKind::Time,
        });
        let set = ProcessNamespaceSet { pid: 77, entries };

        let text = render_namespace_set(&set);
        assert!(text.contains("Namespaces for PID 77:"));
        assert!(text.contains("Total available: 7/8"));
        assert!(text.contains("N/A"));
    }

    #[test]
    fn test_render_comparison_counts() {
        let comparisons = vec![
            NamespaceComparison {
                kind: NamespaceKind::Mount,
                inode_a: 1,
                inode_b: 1,
                shared: true,
            },
            NamespaceComparison {
                kind: NamespaceKind::Net,
                inode_a: 1,
                inode_b: 2,
                shared: false,
            },
        ];

        let text = render_comparison(10, 20, &comparisons);
        assert!(text.contains("PID 10 vs PID 20"));
        assert!(text.contains("Shared: 1 | Isolated: 1 | Total: 2"));
    }

    #[test]
    fn test_render_statistics_truncation_marker() {
        let mut stats = NamespaceStatistics {
            processes_analyzed: 300,
            ..NamespaceStatistics::default()
        };
        stats.unique_counts[NamespaceKind::Net.index()] = 1024;
        stats.truncated[NamespaceKind::Net.index()] = true;

        let text = render_statistics(&stats);
        assert!(text.contains("Total Processes Analyzed: 300"));
        assert!(text.contains("1024 (truncated)"));
    }

    #[test]
    fn test_json_snapshot_shape() {
        let json = to_json(&sample_snapshot()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["pid"], 4242);
        assert_eq!(value["cpu"]["usage_usec"], 5_000_000);
        assert_eq!(value["cpu"]["quota"], 50_000);
        assert_eq!(value["memory"]["current"], 95 * 1024 * 1024);
        assert_eq!(value["pids"]["limit"], u64::MAX);
    }

    #[test]
    fn test_json_unlimited_quota_is_null() {
        let mut snapshot = sample_snapshot();
        snapshot.cpu.as_mut().unwrap().quota = None;

        let json = to_json(&snapshot).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["cpu"]["quota"].is_null());
    }

    #[test]
    fn test_write_json_appends_newline() {
        let mut buf = Vec::new();
        write_json(&sample_snapshot(), &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
    }
}
