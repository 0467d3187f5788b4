//! Typed Cgroup Metrics
//!
//! Per-controller interpreters for the heterogeneous text files exposed by
//! cgroupfs, producing flat records of unsigned counters. Each record is
//! sourced from one coherent set of file reads and is either fully collected
//! or absent; missing optional files degrade individual fields, a missing
//! required file drops the whole record.
//!
//! ## File sets
//!
//! | Record | v2 | v1 |
//! |--------|----|----|
//! | CPU | `cpu.stat`, `cpu.max` | `cpuacct.usage`, `cpu.stat`, `cpu.cfs_quota_us`, `cpu.cfs_period_us` |
//! | Memory | `memory.{current,peak,max,swap.current,swap.max,stat}` | `memory.{usage,max_usage,limit,memsw.usage,memsw.limit}_in_bytes`, `memory.stat` |
//! | Block I/O | `io.stat` | `blkio.throttle.io_service_bytes`, `blkio.throttle.io_serviced` |
//! | PIDs | `pids.current`, `pids.max` | same |
//!
//! All counters are unsigned 64-bit; "unlimited" is [`UNLIMITED`], never a
//! negative number. The on-disk `-1`/`"max"` CPU quota convention is
//! normalized to `quota: None` on read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cgroup::{
    read_file, read_scalar_u64, resolve_cgroup_path, CgroupError, CgroupVersion, Controller,
};
use crate::{Pid, DEFAULT_CPU_PERIOD_US, UNLIMITED};

// ============================================================================
// Metric Records
// ============================================================================

/// CPU accounting and throttling counters, all in microseconds or counts
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CpuMetrics {
    /// Total CPU time consumed
    pub usage_usec: u64,
    /// Time spent in user mode
    pub user_usec: u64,
    /// Time spent in kernel mode
    pub system_usec: u64,
    /// Scheduling periods the group was eligible to run
    pub nr_periods: u64,
    /// Periods in which the group was throttled
    pub nr_throttled: u64,
    /// Total time spent throttled
    pub throttled_usec: u64,
    /// Configured quota per period; `None` means unlimited
    pub quota: Option<u64>,
    /// Enforcement period
    pub period: u64,
}

impl Default for CpuMetrics {
    fn default() -> Self {
        Self {
            usage_usec: 0,
            user_usec: 0,
            system_usec: 0,
            nr_periods: 0,
            nr_throttled: 0,
            throttled_usec: 0,
            quota: None,
            period: DEFAULT_CPU_PERIOD_US,
        }
    }
}

impl CpuMetrics {
    /// Configured limit in cores, if any
    pub fn limit_cores(&self) -> Option<f64> {
        match (self.quota, self.period) {
            (Some(q), p) if p > 0 => Some(q as f64 / p as f64),
            _ => None,
        }
    }
}

/// Memory usage counters in bytes (fault counters are event counts)
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MemoryMetrics {
    pub current: u64,
    pub peak: u64,
    /// Configured limit; [`UNLIMITED`] when none is set
    pub limit: u64,
    pub swap_current: u64,
    pub swap_limit: u64,
    pub cache: u64,
    pub rss: u64,
    pub rss_huge: u64,
    pub mapped_file: u64,
    pub dirty: u64,
    pub writeback: u64,
    pub pgfault: u64,
    pub pgmajfault: u64,
    pub anon: u64,
    pub file: u64,
}

/// Block I/O counters, summed across all devices
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BlkioMetrics {
    pub rbytes: u64,
    pub wbytes: u64,
    pub rios: u64,
    pub wios: u64,
    pub dbytes: u64,
    pub dios: u64,
}

/// Process-count accounting
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PidsMetrics {
    pub current: u64,
    /// Configured limit; [`UNLIMITED`] when `pids.max` holds `"max"`
    pub limit: u64,
}

/// One point-in-time read of a process's cgroup.
///
/// Immutable once constructed; rate metrics are computed by the caller from
/// two snapshots (see [`cpu_utilization`]).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CgroupMetricsSnapshot {
    pub pid: Pid,
    /// Path the CPU record was read from (the unified path under v2)
    pub path: PathBuf,
    pub version: CgroupVersion,
    pub cpu: Option<CpuMetrics>,
    pub memory: Option<MemoryMetrics>,
    pub blkio: Option<BlkioMetrics>,
    pub pids: Option<PidsMetrics>,
}

// ============================================================================
// File Tables
// ============================================================================

// File names keyed by hierarchy version, so the readers below stay free of
// per-field version branches.

struct MemoryFileSet {
    current: &'static str,
    peak: &'static str,
    limit: &'static str,
    swap_current: &'static str,
    swap_limit: &'static str,
}

const V2_MEMORY_FILES: MemoryFileSet = MemoryFileSet {
    current: "memory.current",
    peak: "memory.peak",
    limit: "memory.max",
    swap_current: "memory.swap.current",
    swap_limit: "memory.swap.max",
};

const V1_MEMORY_FILES: MemoryFileSet = MemoryFileSet {
    current: "memory.usage_in_bytes",
    peak: "memory.max_usage_in_bytes",
    limit: "memory.limit_in_bytes",
    swap_current: "memory.memsw.usage_in_bytes",
    swap_limit: "memory.memsw.limit_in_bytes",
};

fn memory_files(version: CgroupVersion) -> Result<&'static MemoryFileSet, CgroupError> {
    match version {
        CgroupVersion::V2 => Ok(&V2_MEMORY_FILES),
        CgroupVersion::V1 => Ok(&V1_MEMORY_FILES),
        CgroupVersion::Unknown => Err(CgroupError::UnsupportedVersion),
    }
}

// ============================================================================
// Readers
// ============================================================================

/// Read CPU accounting, throttling, and limit state from a cgroup directory.
///
/// Under v2 `cpu.stat` is required and `cpu.max` optional; under v1 every
/// file is optional and a directory with none of them yields zeroed counters.
pub fn read_cpu_metrics(path: &Path, version: CgroupVersion) -> Result<CpuMetrics, CgroupError> {
    let mut metrics = CpuMetrics::default();

    match version {
        CgroupVersion::V2 => {
            let stat = read_file(&path.join("cpu.stat"))?;
            for_each_counter(&stat, |key, value| match key {
                "usage_usec" => metrics.usage_usec = value,
                "user_usec" => metrics.user_usec = value,
                "system_usec" => metrics.system_usec = value,
                "nr_periods" => metrics.nr_periods = value,
                "nr_throttled" => metrics.nr_throttled = value,
                "throttled_usec" => metrics.throttled_usec = value,
                _ => {}
            });

            if let Ok(limit) = read_file(&path.join("cpu.max")) {
                let (quota, period) = parse_cpu_max(&limit);
                metrics.quota = quota;
                metrics.period = period;
            }
        }
        CgroupVersion::V1 => {
            // cpuacct keeps nanoseconds
            if let Ok(usage_ns) = read_scalar_u64(&path.join("cpuacct.usage")) {
                metrics.usage_usec = usage_ns / 1000;
            }

            if let Ok(stat) = read_file(&path.join("cpu.stat")) {
                for_each_counter(&stat, |key, value| match key {
                    "nr_periods" => metrics.nr_periods = value,
                    "nr_throttled" => metrics.nr_throttled = value,
                    "throttled_time" => metrics.throttled_usec = value / 1000,
                    _ => {}
                });
            }

            // quota is the one file carrying -1 as its unlimited sentinel
            if let Ok(content) = read_file(&path.join("cpu.cfs_quota_us")) {
                metrics.quota = content.trim().parse::<i64>().ok().and_then(|q| {
                    if q < 0 {
                        None
                    } else {
                        Some(q as u64)
                    }
                });
            }
            if let Ok(period) = read_scalar_u64(&path.join("cpu.cfs_period_us")) {
                metrics.period = period;
            }
        }
        CgroupVersion::Unknown => return Err(CgroupError::UnsupportedVersion),
    }

    Ok(metrics)
}

/// Read memory usage, limits, and detailed stats from a cgroup directory.
///
/// Every file is optional; a v1 `memory.stat` simply lacks the
/// `dirty`/`writeback`/`anon`/`file` keys and leaves those fields zero.
pub fn read_memory_metrics(
    path: &Path,
    version: CgroupVersion,
) -> Result<MemoryMetrics, CgroupError> {
    let files = memory_files(version)?;
    let mut metrics = MemoryMetrics::default();

    metrics.current = read_scalar_u64(&path.join(files.current)).unwrap_or(0);
    metrics.peak = read_scalar_u64(&path.join(files.peak)).unwrap_or(0);
    // "max" or a missing file both mean no limit
    metrics.limit = read_scalar_u64(&path.join(files.limit)).unwrap_or(UNLIMITED);
    metrics.swap_current = read_scalar_u64(&path.join(files.swap_current)).unwrap_or(0);
    metrics.swap_limit = read_scalar_u64(&path.join(files.swap_limit)).unwrap_or(UNLIMITED);

    if let Ok(stat) = read_file(&path.join("memory.stat")) {
        for_each_counter(&stat, |key, value| match key {
            "cache" => metrics.cache = value,
            "rss" => metrics.rss = value,
            "rss_huge" => metrics.rss_huge = value,
            "mapped_file" => metrics.mapped_file = value,
            "dirty" => metrics.dirty = value,
            "writeback" => metrics.writeback = value,
            "pgfault" => metrics.pgfault = value,
            "pgmajfault" => metrics.pgmajfault = value,
            "anon" => metrics.anon = value,
            "file" => metrics.file = value,
            _ => {}
        });
    }

    Ok(metrics)
}

/// Read block I/O counters, summed across devices.
///
/// The v2 `io.stat` (and the v1 byte-count file) are required; the v1
/// operation-count file is optional.
pub fn read_blkio_metrics(
    path: &Path,
    version: CgroupVersion,
) -> Result<BlkioMetrics, CgroupError> {
    match version {
        CgroupVersion::V2 => {
            let stat = read_file(&path.join("io.stat"))?;
            Ok(parse_io_stat(&stat))
        }
        CgroupVersion::V1 => {
            let mut metrics = BlkioMetrics::default();

            let bytes = read_file(&path.join("blkio.throttle.io_service_bytes"))?;
            let (read, write) = sum_blkio_rows(&bytes);
            metrics.rbytes = read;
            metrics.wbytes = write;

            if let Ok(ops) = read_file(&path.join("blkio.throttle.io_serviced")) {
                let (read, write) = sum_blkio_rows(&ops);
                metrics.rios = read;
                metrics.wios = write;
            }

            Ok(metrics)
        }
        CgroupVersion::Unknown => Err(CgroupError::UnsupportedVersion),
    }
}

/// Read process-count accounting. The file names are the same under both
/// hierarchy versions.
pub fn read_pids_metrics(path: &Path) -> Result<PidsMetrics, CgroupError> {
    Ok(PidsMetrics {
        current: read_scalar_u64(&path.join("pids.current")).unwrap_or(0),
        // pids.max holds the literal "max" when no limit is configured
        limit: read_scalar_u64(&path.join("pids.max")).unwrap_or(UNLIMITED),
    })
}

// ============================================================================
// Snapshot Assembly
// ============================================================================

/// Read a full point-in-time snapshot of the cgroup(s) governing `pid`.
///
/// Under v1 a process can belong to a different path per controller, so
/// memory, blkio, and pids are resolved through their own hierarchies; under
/// v2 everything comes from the single unified path. A record that cannot be
/// read is left out of the snapshot rather than failing it.
pub fn snapshot(pid: Pid) -> Result<CgroupMetricsSnapshot, CgroupError> {
    let version = CgroupVersion::detect();
    if version == CgroupVersion::Unknown {
        return Err(CgroupError::UnsupportedVersion);
    }

    let handle = resolve_cgroup_path(pid, None)
        .or_else(|_| resolve_cgroup_path(pid, Some(Controller::Cpu)))?;

    let cpu = collect(pid, "cpu", read_cpu_metrics(&handle.path, version));

    let (memory, blkio, pids) = match version {
        CgroupVersion::V1 => {
            let memory = resolve_cgroup_path(pid, Some(Controller::Memory))
                .and_then(|h| read_memory_metrics(&h.path, version));
            let blkio = resolve_cgroup_path(pid, Some(Controller::BlockIo))
                .and_then(|h| read_blkio_metrics(&h.path, version));
            let pids_rec = resolve_cgroup_path(pid, Some(Controller::Pids))
                .and_then(|h| read_pids_metrics(&h.path));
            (
                collect(pid, "memory", memory),
                collect(pid, "blkio", blkio),
                collect(pid, "pids", pids_rec),
            )
        }
        _ => (
            collect(pid, "memory", read_memory_metrics(&handle.path, version)),
            collect(pid, "blkio", read_blkio_metrics(&handle.path, version)),
            collect(pid, "pids", read_pids_metrics(&handle.path)),
        ),
    };

    Ok(CgroupMetricsSnapshot {
        pid,
        path: handle.path,
        version,
        cpu,
        memory,
        blkio,
        pids,
    })
}

fn collect<T>(pid: Pid, what: &str, result: Result<T, CgroupError>) -> Option<T> {
    match result {
        Ok(record) => Some(record),
        Err(e) => {
            log::debug!("pid {pid}: {what} metrics not collected: {e}");
            None
        }
    }
}

/// CPU utilization in cores over the interval between two snapshots.
///
/// A pure function of its arguments; callers own the sampling state. `None`
/// when either snapshot lacks a CPU record or the interval is empty.
pub fn cpu_utilization(
    prev: &CgroupMetricsSnapshot,
    curr: &CgroupMetricsSnapshot,
    elapsed: Duration,
) -> Option<f64> {
    let prev_cpu = prev.cpu.as_ref()?;
    let curr_cpu = curr.cpu.as_ref()?;
    let elapsed_usec = elapsed.as_micros() as u64;
    if elapsed_usec == 0 {
        return None;
    }
    let delta = curr_cpu.usage_usec.saturating_sub(prev_cpu.usage_usec);
    Some(delta as f64 / elapsed_usec as f64)
}

// ============================================================================
// Line Parsers
// ============================================================================

/// Apply `(key, value)` pairs from a flat stat file, one pair per line.
/// Lines that do not start with `key value` are skipped.
fn for_each_counter(content: &str, mut apply: impl FnMut(&str, u64)) {
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        if let (Some(key), Some(raw)) = (tokens.next(), tokens.next()) {
            if let Ok(value) = raw.parse::<u64>() {
                apply(key, value);
            }
        }
    }
}

/// Parse a `cpu.max` line: `"<quota> <period>"` where quota may be `"max"`.
fn parse_cpu_max(content: &str) -> (Option<u64>, u64) {
    let mut tokens = content.split_whitespace();
    let quota = match tokens.next() {
        Some("max") | None => None,
        Some(raw) => raw.parse::<u64>().ok(),
    };
    let period = tokens
        .next()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_CPU_PERIOD_US);
    (quota, period)
}

/// Parse a v2 `io.stat` file and sum counters across devices.
///
/// Each line is `<major>:<minor>` followed by `key=value` pairs; a single
/// tokenizer pass handles lines with or without the discard counters.
fn parse_io_stat(content: &str) -> BlkioMetrics {
    let mut metrics = BlkioMetrics::default();

    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        // leading device identifier
        if tokens.next().is_none() {
            continue;
        }
        for token in tokens {
            let Some((key, raw)) = token.split_once('=') else {
                continue;
            };
            let Ok(value) = raw.parse::<u64>() else {
                continue;
            };
            match key {
                "rbytes" => metrics.rbytes += value,
                "wbytes" => metrics.wbytes += value,
                "rios" => metrics.rios += value,
                "wios" => metrics.wios += value,
                "dbytes" => metrics.dbytes += value,
                "dios" => metrics.dios += value,
                _ => {}
            }
        }
    }

    metrics
}

/// Sum the `Read` and `Write` rows of a v1 blkio throttle file
/// (`"<major>:<minor> <op> <value>"`, one row per device and operation).
fn sum_blkio_rows(content: &str) -> (u64, u64) {
    let mut read = 0u64;
    let mut write = 0u64;

    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        let (Some(device), Some(op), Some(raw)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            continue;
        };
        if !device.contains(':') {
            continue;
        }
        let Ok(value) = raw.parse::<u64>() else {
            continue;
        };
        match op {
            "Read" => read += value,
            "Write" => write += value,
            _ => {}
        }
    }

    (read, write)
}

// ============================================================================
// Tests
// ============================================================================
