//! # isoscope
//!
//! **Inspection and control of Linux resource-isolation primitives**
//!
//! A Rust library for examining the cgroup and namespace membership of
//! arbitrary processes, and for launching commands confined inside a freshly
//! created cgroup with enforced CPU/memory/IO limits.
//!
//! ## Subsystems
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`cgroup`] | Hierarchy version detection, path resolution, create/limit/destroy |
//! | [`metrics`] | Typed per-controller metric records read from cgroupfs |
//! | [`namespace`] | Namespace identity, pairwise comparison, system-wide statistics |
//! | [`executor`] | Create cgroup → move child → exec → wait → collect → destroy |
//! | [`report`] | Text rendering and JSON export of inspection results |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use isoscope::prelude::*;
//!
//! // Point-in-time resource usage of a process, via its cgroup
//! let snapshot = isoscope::metrics::snapshot(1234)?;
//!
//! // Run a command limited to half a core and 256 MB
//! let config = ExecutionConfig::builder("demo")
//!     .cpu_cores(0.5)
//!     .memory_bytes(256 * 1024 * 1024)
//!     .build();
//! let report = ConfinedExecutor::new().run(&config, &["stress", "--cpu", "1"])?;
//! println!("exit: {:?}", report.status);
//! ```
//!
//! ## Requirements
//!
//! - Linux with cgroup v1 or v2 mounted at `/sys/fs/cgroup`
//! - Root privileges for cgroup creation and limit writes; inspection of
//!   other users' processes degrades gracefully without them
//!
//! Both hierarchy versions are supported; the version is re-detected per
//! operation and never cached for the lifetime of the process.

// Core modules
pub mod cgroup;
pub mod executor;
pub mod metrics;
pub mod namespace;
pub mod report;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cgroup::{
        resolve_cgroup_path, CgroupController, CgroupError, CgroupHandle, CgroupVersion,
        Controller,
    };
    pub use crate::executor::{
        ChildProcess, ConfinedExecutor, ExecError, ExecutionConfig, ExecutionReport, ExitStatus,
        IoLimit,
    };
    pub use crate::metrics::{
        BlkioMetrics, CgroupMetricsSnapshot, CpuMetrics, MemoryMetrics, PidsMetrics,
    };
    pub use crate::namespace::{
        NamespaceComparison, NamespaceIdentity, NamespaceKind, NamespaceStatistics,
        ProcessNamespaceSet,
    };
}

pub use prelude::*;

// ============================================================================
// Common Types
// ============================================================================

/// Process ID type
pub type Pid = u32;

// ============================================================================
// Constants
// ============================================================================

/// Cgroup mount point (v2 unified root; v1 per-controller roots live below it)
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// CFS enforcement period used when writing CPU limits (100ms)
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

/// Sentinel for "no limit configured" in metric records
pub const UNLIMITED: u64 = u64::MAX;

/// Per-kind cap on distinct namespace inodes recorded by a statistics scan.
/// Reaching it sets the kind's `truncated` flag instead of failing.
pub const NAMESPACE_UNIQUE_CAP: usize = 1024;

// ============================================================================
// Tests
// ============================================================================
