//! Cgroup Hierarchy Control
//!
//! Direct manipulation of the Linux cgroup filesystem, covering both the
//! v1 split hierarchies and the v2 unified hierarchy, without systemd or
//! other intermediaries.
//!
//! ## Interface Files
//!
//! | File | Version | Description |
//! |------|---------|-------------|
//! | `cgroup.controllers` | v2 | Existence marks a unified hierarchy |
//! | `cpu.max` | v2 | CPU quota and period, `"quota period"` |
//! | `cpu.cfs_quota_us` / `cpu.cfs_period_us` | v1 | CPU quota and period, one scalar each |
//! | `memory.max` | v2 | Memory limit in bytes |
//! | `memory.limit_in_bytes` | v1 | Memory limit in bytes |
//! | `io.max` | v2 | Per-device bandwidth, `"<maj>:<min> rbps=.. wbps=.."` |
//! | `blkio.throttle.{read,write}_bps_device` | v1 | Per-device bandwidth, one file per direction |
//! | `cgroup.procs` | both | Process membership; write a PID to move it |
//!
//! The hierarchy version is re-detected on every operation that needs it;
//! nothing is cached for the lifetime of the process.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{Pid, CGROUP_ROOT, DEFAULT_CPU_PERIOD_US};

// ============================================================================
// Error Types
// ============================================================================

/// Cgroup operation errors
#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    /// Neither a v1 nor a v2 hierarchy is mounted
    #[error("no supported cgroup hierarchy detected")]
    UnsupportedVersion,
    /// Process or cgroup path could not be resolved
    #[error("cgroup not found: {0}")]
    NotFound(String),
    /// Permission denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// A file existed but its content did not match the expected shape
    #[error("malformed data in {path}: {content:?}")]
    MalformedData { path: String, content: String },
    /// Invalid limit argument
    #[error("precondition violated: {0}")]
    PreconditionViolated(&'static str),
    /// Cgroup removal while member processes remain
    #[error("cgroup busy: {0}")]
    ResourceBusy(String),
    /// Other I/O failure
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CgroupError {
    fn from_io(path: &Path, e: std::io::Error) -> Self {
        let p = path.to_string_lossy().into_owned();
        match e.kind() {
            std::io::ErrorKind::NotFound => CgroupError::NotFound(p),
            std::io::ErrorKind::PermissionDenied => CgroupError::PermissionDenied(p),
            _ => CgroupError::Io { path: p, source: e },
        }
    }
}

// ============================================================================
// Hierarchy Version
// ============================================================================

/// Cgroup hierarchy version present on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CgroupVersion {
    /// Split per-controller hierarchies
    V1,
    /// Unified hierarchy
    V2,
    /// No cgroup support detected
    Unknown,
}

impl CgroupVersion {
    /// Probe the mount point for the hierarchy version.
    ///
    /// `/sys/fs/cgroup/cgroup.controllers` marks a v2 unified hierarchy; a
    /// `cpu` directory below the mount point marks v1. `Unknown` is a
    /// legitimate result that callers must check, not an error by itself.
    pub fn detect() -> Self {
        Self::detect_at(Path::new(CGROUP_ROOT))
    }

    pub(crate) fn detect_at(root: &Path) -> Self {
        if root.join("cgroup.controllers").exists() {
            CgroupVersion::V2
        } else if root.join("cpu").exists() {
            CgroupVersion::V1
        } else {
            CgroupVersion::Unknown
        }
    }
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupVersion::V1 => write!(f, "v1"),
            CgroupVersion::V2 => write!(f, "v2"),
            CgroupVersion::Unknown => write!(f, "unknown"),
        }
    }
}

// ============================================================================
// Controllers
// ============================================================================

/// A resource dimension managed by cgroups.
///
/// Doubles as a v1 hierarchy selector and a v2 file-set selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Controller {
    Cpu,
    Memory,
    BlockIo,
    Pids,
    CpuSet,
    Io,
}

impl Controller {
    /// Kernel name: the v1 mount directory and `/proc/<pid>/cgroup` token
    pub const fn as_str(&self) -> &'static str {
        match self {
            Controller::Cpu => "cpu",
            Controller::Memory => "memory",
            Controller::BlockIo => "blkio",
            Controller::Pids => "pids",
            Controller::CpuSet => "cpuset",
            Controller::Io => "io",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "cpu" => Some(Controller::Cpu),
            "memory" => Some(Controller::Memory),
            "blkio" => Some(Controller::BlockIo),
            "pids" => Some(Controller::Pids),
            "cpuset" => Some(Controller::CpuSet),
            "io" => Some(Controller::Io),
            _ => None,
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Path Resolution
// ============================================================================

/// A resolved cgroup directory.
///
/// Valid only as long as the underlying directory exists; nothing here is
/// refreshed after resolution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CgroupHandle {
    /// Absolute cgroupfs path governing the process
    pub path: PathBuf,
    /// Hierarchy version the path belongs to
    pub version: CgroupVersion,
    /// Controllers attached to this path
    pub controllers: Vec<Controller>,
}

/// Resolve the cgroup directory governing `pid`.
///
/// Reads `/proc/<pid>/cgroup` (one `hierarchy:controllers:path` line per
/// hierarchy). On v2 the unified hierarchy-0 entry is used and `controller`
/// is ignored; on v1 the entry whose controller list contains the requested
/// controller is used, defaulting to hierarchy 0 when none is requested.
///
/// The root cgroup (empty or `/` relative path) resolves to the mount point
/// itself, never to a path with a trailing slash.
pub fn resolve_cgroup_path(
    pid: Pid,
    controller: Option<Controller>,
) -> Result<CgroupHandle, CgroupError> {
    let record = PathBuf::from(format!("/proc/{pid}/cgroup"));
    let content = fs::read_to_string(&record).map_err(|e| CgroupError::from_io(&record, e))?;
    let version = CgroupVersion::detect();

    // The unified hierarchy has no per-controller paths to select between.
    let controller = match version {
        CgroupVersion::V2 => None,
        _ => controller,
    };

    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let (Some(hierarchy), Some(ctrl_list), Some(rel)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        match controller {
            None => {
                if hierarchy != "0" {
                    continue;
                }
                let path = join_mount_path(Path::new(CGROUP_ROOT), rel);
                let controllers = match version {
                    // The v2 record carries no controller list; the file set
                    // enabled at the path does.
                    CgroupVersion::V2 => read_v2_controllers(&path),
                    _ => parse_controller_list(ctrl_list),
                };
                return Ok(CgroupHandle {
                    path,
                    version,
                    controllers,
                });
            }
            Some(wanted) => {
                let names: Vec<&str> = ctrl_list.split(',').collect();
                if !names.contains(&wanted.as_str()) {
                    continue;
                }
                let root = Path::new(CGROUP_ROOT).join(wanted.as_str());
                return Ok(CgroupHandle {
                    path: join_mount_path(&root, rel),
                    version,
                    controllers: parse_controller_list(ctrl_list),
                });
            }
        }
    }

    Err(CgroupError::NotFound(format!(
        "no matching hierarchy for pid {pid}"
    )))
}

fn join_mount_path(root: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() || rel == "/" {
        root.to_path_buf()
    } else {
        // rel starts with '/' in the kernel record
        PathBuf::from(format!("{}{}", root.display(), rel))
    }
}

fn parse_controller_list(list: &str) -> Vec<Controller> {
    list.split(',').filter_map(Controller::from_name).collect()
}

fn read_v2_controllers(path: &Path) -> Vec<Controller> {
    match fs::read_to_string(path.join("cgroup.controllers")) {
        Ok(content) => content
            .split_whitespace()
            .filter_map(Controller::from_name)
            .collect(),
        Err(_) => Vec::new(),
    }
}

// ============================================================================
// Limit Controller
// ============================================================================

/// An owned cgroup directory with version-correct limit writes.
///
/// All writes are open-write-close and best-effort: the kernel validates the
/// value, nothing is read back to confirm it.
pub struct CgroupController {
    path: PathBuf,
    version: CgroupVersion,
}

impl CgroupController {
    /// Create a cgroup directory named `name`.
    ///
    /// Under v2 this is `/sys/fs/cgroup/<name>`; under v1 it lives in the
    /// requested controller's hierarchy, `/sys/fs/cgroup/<controller>/<name>`.
    /// An already existing directory counts as success.
    pub fn create(name: &str, controller: Controller) -> Result<Self, CgroupError> {
        let version = CgroupVersion::detect();
        let path = match version {
            CgroupVersion::V2 => Path::new(CGROUP_ROOT).join(name),
            CgroupVersion::V1 => Path::new(CGROUP_ROOT).join(controller.as_str()).join(name),
            CgroupVersion::Unknown => return Err(CgroupError::UnsupportedVersion),
        };

        if let Err(e) = fs::create_dir(&path) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(CgroupError::from_io(&path, e));
            }
        }

        Ok(Self { path, version })
    }

    /// Wrap an existing cgroup directory
    pub fn open(path: impl Into<PathBuf>, version: CgroupVersion) -> Result<Self, CgroupError> {
        let path = path.into();
        if !path.exists() {
            return Err(CgroupError::NotFound(path.to_string_lossy().into_owned()));
        }
        Ok(Self { path, version })
    }

    /// Remove the cgroup directory.
    ///
    /// Fails with [`CgroupError::ResourceBusy`] while member processes
    /// remain; move them out or wait for them to exit first.
    pub fn remove(self) -> Result<(), CgroupError> {
        fs::remove_dir(&self.path).map_err(|e| {
            match e.raw_os_error() {
                Some(code) if code == libc::EBUSY || code == libc::ENOTEMPTY => {
                    CgroupError::ResourceBusy(self.path.to_string_lossy().into_owned())
                }
                _ => CgroupError::from_io(&self.path, e),
            }
        })
    }

    /// Move a process into this cgroup.
    ///
    /// `cgroup.procs` does not support reading back the value just written;
    /// success is the write call succeeding, nothing more.
    pub fn add_process(&self, pid: Pid) -> Result<(), CgroupError> {
        write_file(&self.path.join("cgroup.procs"), &pid.to_string())
    }

    /// Limit CPU usage to `cores` cores (e.g. `0.5`, `2.0`).
    ///
    /// Writes `quota = cores * period` with a fixed 100ms period: one
    /// combined `"quota period"` line under v2, two scalar files under v1.
    pub fn set_cpu_limit(&self, cores: f64) -> Result<(), CgroupError> {
        if !(cores > 0.0) {
            return Err(CgroupError::PreconditionViolated(
                "cpu limit requires a positive core count",
            ));
        }

        let period = DEFAULT_CPU_PERIOD_US;
        let quota = (cores * period as f64) as u64;

        match self.version {
            CgroupVersion::V2 => {
                write_file(&self.path.join("cpu.max"), &format!("{quota} {period}"))
            }
            CgroupVersion::V1 => {
                write_file(&self.path.join("cpu.cfs_period_us"), &period.to_string())?;
                write_file(&self.path.join("cpu.cfs_quota_us"), &quota.to_string())
            }
            CgroupVersion::Unknown => Err(CgroupError::UnsupportedVersion),
        }
    }

    /// Limit memory usage to `bytes`.
    ///
    /// Zero is rejected: it is ambiguous with "no limit" and no kernel
    /// accepts it anyway.
    pub fn set_memory_limit(&self, bytes: u64) -> Result<(), CgroupError> {
        if bytes == 0 {
            return Err(CgroupError::PreconditionViolated(
                "memory limit requires a non-zero byte count",
            ));
        }

        let file = match self.version {
            CgroupVersion::V2 => "memory.max",
            CgroupVersion::V1 => "memory.limit_in_bytes",
            CgroupVersion::Unknown => return Err(CgroupError::UnsupportedVersion),
        };
        write_file(&self.path.join(file), &bytes.to_string())
    }

    /// Limit block I/O bandwidth for a device (`"<major>:<minor>"`).
    pub fn set_io_limit(&self, device: &str, rbps: u64, wbps: u64) -> Result<(), CgroupError> {
        match self.version {
            CgroupVersion::V2 => write_file(
                &self.path.join("io.max"),
                &format!("{device} rbps={rbps} wbps={wbps}"),
            ),
            CgroupVersion::V1 => {
                write_file(
                    &self.path.join("blkio.throttle.read_bps_device"),
                    &format!("{device} {rbps}"),
                )?;
                write_file(
                    &self.path.join("blkio.throttle.write_bps_device"),
                    &format!("{device} {wbps}"),
                )
            }
            CgroupVersion::Unknown => Err(CgroupError::UnsupportedVersion),
        }
    }

    /// Absolute path of this cgroup directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hierarchy version the directory belongs to
    pub fn version(&self) -> CgroupVersion {
        self.version
    }
}

impl fmt::Debug for CgroupController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupController")
            .field("path", &self.path)
            .field("version", &self.version)
            .finish()
    }
}

// ============================================================================
// File Helpers
// ============================================================================

/// Write to a cgroup interface file: write-only open, no read-back.
pub(crate) fn write_file(path: &Path, content: &str) -> Result<(), CgroupError> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| CgroupError::from_io(path, e))?;

    file.write_all(content.as_bytes())
        .map_err(|e| CgroupError::from_io(path, e))
}

/// Read a cgroup interface file to a string.
pub(crate) fn read_file(path: &Path) -> Result<String, CgroupError> {
    fs::read_to_string(path).map_err(|e| CgroupError::from_io(path, e))
}

/// Read a single unsigned scalar from a cgroup interface file.
pub(crate) fn read_scalar_u64(path: &Path) -> Result<u64, CgroupError> {
    let content = read_file(path)?;
    content
        .trim()
        .parse::<u64>()
        .map_err(|_| CgroupError::MalformedData {
            path: path.to_string_lossy().into_owned(),
            content: content.trim().to_string(),
        })
}

// ============================================================================
// Tests
// ============================================================================
