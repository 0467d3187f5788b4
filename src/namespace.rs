//! Linux Namespace Identity
//!
//! Observes which namespaces processes belong to by reading the inode numbers
//! behind the `/proc/<pid>/ns/*` symlinks. Two processes share a namespace
//! exactly when their inodes for that kind are equal; no namespace is ever
//! entered or created here.
//!
//! ## Namespace Kinds
//!
//! | Kind | `/proc/<pid>/ns/` entry | Isolates |
//! |------|-------------------------|----------|
//! | Cgroup | `cgroup` | Cgroup root |
//! | IPC | `ipc` | IPC primitives |
//! | Mount | `mnt` | Mount points |
//! | Network | `net` | Network stack |
//! | PID | `pid` | Process IDs |
//! | Time | `time` | Clock offsets |
//! | User | `user` | User/Group IDs |
//! | UTS | `uts` | Hostname |
//!
//! Individual entries can be unobservable (old kernel without time namespaces,
//! or insufficient permission on another user's process); such entries are
//! reported as unavailable rather than failing the whole listing.

use std::collections::HashSet;
use std::ffi::CString;
use std::fmt;

use crate::{Pid, NAMESPACE_UNIQUE_CAP};

// ============================================================================
// Namespace Kinds
// ============================================================================

/// The eight namespace kinds, in the fixed order reports and statistics use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Cgroup,
    Ipc,
    Mount,
    Net,
    Pid,
    Time,
    User,
    Uts,
}

impl NamespaceKind {
    /// All kinds, in report order
    pub const ALL: [NamespaceKind; 8] = [
        NamespaceKind::Cgroup,
        NamespaceKind::Ipc,
        NamespaceKind::Mount,
        NamespaceKind::Net,
        NamespaceKind::Pid,
        NamespaceKind::Time,
        NamespaceKind::User,
        NamespaceKind::Uts,
    ];

    /// The `/proc/<pid>/ns/` entry name
    pub const fn as_str(&self) -> &'static str {
        match self {
            NamespaceKind::Cgroup => "cgroup",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Mount => "mnt",
            NamespaceKind::Net => "net",
            NamespaceKind::Pid => "pid",
            NamespaceKind::Time => "time",
            NamespaceKind::User => "user",
            NamespaceKind::Uts => "uts",
        }
    }

    /// Position within [`Self::ALL`]
    pub const fn index(&self) -> usize {
        *self as usize
    }

    /// Parse an entry name (`"mnt"`, `"net"`, ...)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Namespace inspection errors
#[derive(Debug, thiserror::Error)]
pub enum NamespaceError {
    /// The target process does not exist (or already exited)
    #[error("process {0} not found")]
    ProcessNotFound(Pid),

    /// A specific namespace entry could not be observed
    #[error("namespace {kind} of pid {pid} is not observable")]
    Unavailable { pid: Pid, kind: NamespaceKind },

    /// Underlying I/O failure (e.g. /proc not mounted)
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Identity Types
// ============================================================================

/// Identity of one namespace of one process.
///
/// `inode` is only meaningful when `available` is true; an unavailable entry
/// keeps `inode == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct NamespaceIdentity {
    pub kind: NamespaceKind,
    pub inode: u64,
    pub available: bool,
}

/// The full namespace membership of one process, one entry per kind in
/// [`NamespaceKind::ALL`] order
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessNamespaceSet {
    pub pid: Pid,
    pub entries: [NamespaceIdentity; 8],
}

impl ProcessNamespaceSet {
    /// Entry for a given kind
    pub fn get(&self, kind: NamespaceKind) -> &NamespaceIdentity {
        &self.entries[kind.index()]
    }

    /// Number of observable entries
    pub fn available_count(&self) -> usize {
        self.entries.iter().filter(|e| e.available).count()
    }
}

/// Per-kind verdict from comparing two processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct NamespaceComparison {
    pub kind: NamespaceKind,
    pub inode_a: u64,
    pub inode_b: u64,
    pub shared: bool,
}

/// System-wide namespace census over `/proc`
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NamespaceStatistics {
    /// Number of `/proc/<pid>` directories visited
    pub processes_analyzed: u64,
    /// Distinct inodes seen per kind, in [`NamespaceKind::ALL`] order
    pub unique_counts: [usize; 8],
    /// Set per kind when the distinct-inode count hit [`NAMESPACE_UNIQUE_CAP`]
    /// and further inodes stopped being recorded
    pub truncated: [bool; 8],
}

impl NamespaceStatistics {
    /// Distinct-inode count for a given kind
    pub fn unique(&self, kind: NamespaceKind) -> usize {
        self.unique_counts[kind.index()]
    }
}

// ============================================================================
// Inode Reads
// ============================================================================

/// Stat one `/proc/<pid>/ns/<kind>` entry and return its inode
fn read_ns_inode(pid: Pid, kind: NamespaceKind) -> Option<u64> {
    let path = format!("/proc/{}/ns/{}", pid, kind.as_str());
    let c_path = CString::new(path).ok()?;

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated CString and st is a properly
    // sized, writable stat buffer; stat(2) does not retain either pointer.
    let ret = unsafe { libc::stat(c_path.as_ptr(), &mut st) };
    if ret == 0 {
        Some(st.st_ino)
    } else {
        None
    }
}

fn process_exists(pid: Pid) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).is_dir()
}

// ============================================================================
// Inspection Operations
// ============================================================================

/// List all eight namespace identities of a process.
///
/// Always returns eight entries; kinds whose symlink cannot be statted are
/// marked unavailable instead of failing the listing.
pub fn list(pid: Pid) -> Result<ProcessNamespaceSet, NamespaceError> {
    if !process_exists(pid) {
        return Err(NamespaceError::ProcessNotFound(pid));
    }

    let entries = NamespaceKind::ALL.map(|kind| match read_ns_inode(pid, kind) {
        Some(inode) => NamespaceIdentity {
            kind,
            inode,
            available: true,
        },
        None => NamespaceIdentity {
            kind,
            inode: 0,
            available: false,
        },
    });

    Ok(ProcessNamespaceSet { pid, entries })
}

/// Compare the namespaces of two processes.
///
/// Only kinds observable for both processes produce a verdict; the result is
/// symmetric in its arguments up to the inode column order.
pub fn compare(pid_a: Pid, pid_b: Pid) -> Result<Vec<NamespaceComparison>, NamespaceError> {
    let set_a = list(pid_a)?;
    let set_b = list(pid_b)?;

    let mut comparisons = Vec::with_capacity(8);
    for kind in NamespaceKind::ALL {
        let a = set_a.get(kind);
        let b = set_b.get(kind);
        if a.available && b.available {
            comparisons.push(NamespaceComparison {
                kind,
                inode_a: a.inode,
                inode_b: b.inode,
                shared: a.inode == b.inode,
            });
        }
    }

    Ok(comparisons)
}

/// Whether a process sits in a different namespace of the given kind than
/// PID 1.
///
/// Fails when either side is unobservable; isolation is never guessed.
pub fn is_isolated(pid: Pid, kind: NamespaceKind) -> Result<bool, NamespaceError> {
    let init_inode =
        read_ns_inode(1, kind).ok_or(NamespaceError::Unavailable { pid: 1, kind })?;
    let pid_inode = read_ns_inode(pid, kind).ok_or(NamespaceError::Unavailable { pid, kind })?;
    Ok(init_inode != pid_inode)
}

/// Find up to `limit` processes whose namespace of the given kind has the
/// given inode.
///
/// Processes that disappear mid-scan or cannot be statted are skipped.
pub fn find_in_namespace(
    inode: u64,
    kind: NamespaceKind,
    limit: usize,
) -> Result<Vec<Pid>, NamespaceError> {
    let mut pids = Vec::new();

    for pid in scan_proc_pids()? {
        if pids.len() >= limit {
            break;
        }
        if read_ns_inode(pid, kind) == Some(inode) {
            pids.push(pid);
        }
    }

    Ok(pids)
}

/// Census of distinct namespaces across every visible process.
///
/// Distinct-inode tracking per kind is capped at [`NAMESPACE_UNIQUE_CAP`];
/// hitting the cap sets the kind's `truncated` flag and the reported count
/// becomes a lower bound.
pub fn statistics() -> Result<NamespaceStatistics, NamespaceError> {
    let mut stats = NamespaceStatistics::default();
    let mut seen: [HashSet<u64>; 8] = Default::default();

    for pid in scan_proc_pids()? {
        stats.processes_analyzed += 1;

        for kind in NamespaceKind::ALL {
            let Some(inode) = read_ns_inode(pid, kind) else {
                continue;
            };
            let set = &mut seen[kind.index()];
            if set.len() >= NAMESPACE_UNIQUE_CAP {
                if !set.contains(&inode) {
                    stats.truncated[kind.index()] = true;
                }
                continue;
            }
            set.insert(inode);
        }
    }

    for kind in NamespaceKind::ALL {
        stats.unique_counts[kind.index()] = seen[kind.index()].len();
    }

    Ok(stats)
}

/// Numeric process directories under `/proc`
fn scan_proc_pids() -> Result<Vec<Pid>, NamespaceError> {
    let entries = std::fs::read_dir("/proc").map_err(|e| NamespaceError::Io {
        path: "/proc".to_string(),
        source: e,
    })?;

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        if let Ok(pid) = entry.file_name().to_string_lossy().parse::<Pid>() {
            pids.push(pid);
        }
    }
    Ok(pids)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn self_pid() -> Pid {
        std::process::id()
    }

    #[test]
    fn test_kind_names_and_order() {
        let names: Vec<&str> = NamespaceKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            ["cgroup", "ipc", "mnt", "net", "pid", "time", "user", "uts"]
        );
        for (i, kind) in NamespaceKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(NamespaceKind::from_name("mnt"), Some(NamespaceKind::Mount));
        assert_eq!(NamespaceKind::from_name("net"), Some(NamespaceKind::Net));
        assert_eq!(NamespaceKind::from_name("bogus"), None);
    }

    #[test]
    fn test_list_self_has_eight_entries() {
        let set = list(self_pid()).unwrap();
        assert_eq!(set.pid, self_pid());
        assert_eq!(set.entries.len(), 8);
        // mnt and pid namespaces exist on any kernel this runs on
        assert!(set.get(NamespaceKind::Mount).available);
        assert!(set.get(NamespaceKind::Mount).inode != 0);
        assert!(set.get(NamespaceKind::Pid).available);
    }

    #[test]
    fn test_list_unavailable_entries_have_zero_inode() {
        let set = list(self_pid()).unwrap();
        for entry in &set.entries {
            if !entry.available {
                assert_eq!(entry.inode, 0);
            }
        }
    }

    #[test]
    fn test_list_nonexistent_process() {
        // pid_max caps real pids well below this
        assert!(matches!(
            list(Pid::MAX - 1),
            Err(NamespaceError::ProcessNotFound(_))
        ));
    }

    #[test]
    fn test_compare_self_with_self_all_shared() {
        let comparisons = compare(self_pid(), self_pid()).unwrap();
        assert!(!comparisons.is_empty());
        for comp in &comparisons {
            assert!(comp.shared);
            assert_eq!(comp.inode_a, comp.inode_b);
        }
    }

    #[test]
    fn test_compare_is_symmetric() {
        let ab = compare(self_pid(), 1);
        let ba = compare(1, self_pid());
        // /proc/1/ns may be unreadable without privileges
        let (Ok(ab), Ok(ba)) = (ab, ba) else {
            return;
        };
        assert_eq!(ab.len(), ba.len());
        for (x, y) in ab.iter().zip(ba.iter()) {
            assert_eq!(x.kind, y.kind);
            assert_eq!(x.shared, y.shared);
            assert_eq!(x.inode_a, y.inode_b);
            assert_eq!(x.inode_b, y.inode_a);
        }
    }

    #[test]
    fn test_find_in_namespace_contains_self() {
        let set = list(self_pid()).unwrap();
        let mnt = set.get(NamespaceKind::Mount);
        assert!(mnt.available);

        let pids = find_in_namespace(mnt.inode, NamespaceKind::Mount, 4096).unwrap();
        assert!(pids.contains(&self_pid()));
    }

    #[test]
    fn test_find_in_namespace_respects_limit() {
        let set = list(self_pid()).unwrap();
        let mnt = set.get(NamespaceKind::Mount);
        let pids = find_in_namespace(mnt.inode, NamespaceKind::Mount, 1).unwrap();
        assert_eq!(pids.len(), 1);
    }

    #[test]
    fn test_statistics_bounds() {
        let stats = statistics().unwrap();
        assert!(stats.processes_analyzed >= 1);
        for kind in NamespaceKind::ALL {
            assert!(stats.unique(kind) <= NAMESPACE_UNIQUE_CAP);
        }
        // at least one mount namespace exists: our own
        assert!(stats.unique(NamespaceKind::Mount) >= 1);
    }

    #[test]
    fn test_statistics_not_truncated_on_normal_systems() {
        let stats = statistics().unwrap();
        for kind in NamespaceKind::ALL {
            if stats.unique(kind) < NAMESPACE_UNIQUE_CAP {
                assert!(!stats.truncated[kind.index()]);
            }
        }
    }
}
