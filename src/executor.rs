//! Confined Command Execution
//!
//! Runs a command inside a freshly created cgroup with resource limits
//! applied, then reports its exit status together with the final resource
//! usage of the group.
//!
//! ## Lifecycle
//!
//! 1. Detect the hierarchy version
//! 2. Create the cgroup(s) (one unified group under v2, one per controller
//!    under v1)
//! 3. Apply configured limits, best-effort
//! 4. Fork; the child moves itself into every group before `execvp(3)`
//! 5. Wait for the child to exit
//! 6. Read a final metrics snapshot from the group(s)
//! 7. Remove the group(s) unconditionally
//!
//! A child that fails to exec reports exit code 127, the shell convention for
//! "command not found".

use std::ffi::CString;

use crate::cgroup::{CgroupController, CgroupError, CgroupVersion, Controller};
use crate::metrics::{
    read_blkio_metrics, read_cpu_metrics, read_memory_metrics, read_pids_metrics, BlkioMetrics,
    CpuMetrics, MemoryMetrics, PidsMetrics,
};
use crate::Pid;

// ============================================================================
// Error Types
// ============================================================================

/// Confined execution errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Cgroup setup or teardown failed
    #[error(transparent)]
    Cgroup(#[from] CgroupError),

    /// No command given
    #[error("command line is empty")]
    EmptyCommand,

    /// An argument contained an interior NUL byte
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// fork(2) failed
    #[error("failed to spawn child: {0}")]
    Spawn(std::io::Error),

    /// waitpid(2) failed
    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        pid: Pid,
        source: std::io::Error,
    },

    /// kill(2) failed
    #[error("failed to signal pid {pid}: {source}")]
    Kill {
        pid: Pid,
        source: std::io::Error,
    },
}

// ============================================================================
// Configuration
// ============================================================================

/// Block I/O throughput limit for one device
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct IoLimit {
    /// Device as `major:minor` (e.g. `"8:0"`)
    pub device: String,
    /// Read bytes per second
    pub rbps: u64,
    /// Write bytes per second
    pub wbps: u64,
}

/// Limits and identity for one confined execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Cgroup name, created directly under the hierarchy root(s)
    pub name: String,
    /// CPU limit in cores; `None` leaves the group unlimited
    pub cpu_cores: Option<f64>,
    /// Memory limit in bytes
    pub memory_bytes: Option<u64>,
    /// Block I/O limit
    pub io: Option<IoLimit>,
}

impl ExecutionConfig {
    /// Start building a config for a group with the given name
    pub fn builder(name: impl Into<String>) -> ExecutionConfigBuilder {
        ExecutionConfigBuilder {
            config: ExecutionConfig {
                name: name.into(),
                cpu_cores: None,
                memory_bytes: None,
                io: None,
            },
        }
    }
}

/// Builder for [`ExecutionConfig`]
pub struct ExecutionConfigBuilder {
    config: ExecutionConfig,
}

impl ExecutionConfigBuilder {
    /// Limit CPU to a fractional core count
    pub fn cpu_cores(mut self, cores: f64) -> Self {
        self.config.cpu_cores = Some(cores);
        self
    }

    /// Limit memory to a byte count
    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.config.memory_bytes = Some(bytes);
        self
    }

    /// Limit block I/O throughput on one device
    pub fn io_limit(mut self, device: impl Into<String>, rbps: u64, wbps: u64) -> Self {
        self.config.io = Some(IoLimit {
            device: device.into(),
            rbps,
            wbps,
        });
        self
    }

    /// Finish building
    pub fn build(self) -> ExecutionConfig {
        self.config
    }
}

// ============================================================================
// Exit Status
// ============================================================================

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "code", rename_all = "lowercase")]
pub enum ExitStatus {
    /// Normal termination with an exit code
    Exited(i32),
    /// Killed by a signal
    Signaled(i32),
}

impl ExitStatus {
    /// Decode a raw wait status from waitpid(2)
    pub fn from_raw(raw: i32) -> Self {
        if libc::WIFEXITED(raw) {
            ExitStatus::Exited(libc::WEXITSTATUS(raw))
        } else if libc::WIFSIGNALED(raw) {
            ExitStatus::Signaled(libc::WTERMSIG(raw))
        } else {
            // stopped/continued states are not observed without WUNTRACED
            ExitStatus::Exited(raw)
        }
    }

    /// Clean exit with code zero
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// Exit code to mirror from a wrapper process: the child's own code, or
    /// 128 plus the signal number when it was killed
    pub fn shell_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(sig) => 128 + sig,
        }
    }
}

// ============================================================================
// Child Process Handle
// ============================================================================

/// Owned handle to a forked child.
///
/// The handle tracks whether the child has been reaped; [`wait`](Self::wait)
/// is idempotent and later calls return the cached status.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    /// Child PID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Exit status if the child has already been reaped
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Block until the child exits and reap it
    pub fn wait(&mut self) -> Result<ExitStatus, ExecError> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        let mut raw: libc::c_int = 0;
        loop {
            // SAFETY: raw is a valid writable c_int; waitpid(2) blocks until
            // the child changes state and writes the wait status into raw.
            let ret = unsafe { libc::waitpid(self.pid as libc::pid_t, &mut raw, 0) };
            if ret >= 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(ExecError::Wait {
                pid: self.pid,
                source: err,
            });
        }

        let status = ExitStatus::from_raw(raw);
        self.status = Some(status);
        Ok(status)
    }

    /// Send SIGKILL to a child that has not been reaped yet
    pub fn kill(&self) -> Result<(), ExecError> {
        if self.status.is_some() {
            return Ok(());
        }
        // SAFETY: pid refers to our own forked child; kill(2) takes no
        // pointers and returns -1 with errno on failure.
        let ret = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGKILL) };
        if ret < 0 {
            return Err(ExecError::Kill {
                pid: self.pid,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Fork a child that enrolls itself into each group's `cgroup.procs` and then
/// execs the command.
///
/// All allocations happen before the fork; the child only runs
/// async-signal-safe calls (open/write/close, execvp, _exit). Exec failure
/// surfaces as exit code 127.
pub fn spawn(command: &[String], cgroups: &[CgroupController]) -> Result<ChildProcess, ExecError> {
    if command.is_empty() {
        return Err(ExecError::EmptyCommand);
    }

    let argv_owned: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_str()).map_err(|_| ExecError::InvalidArgument(arg.clone())))
        .collect::<Result<_, _>>()?;
    let mut argv: Vec<*const libc::c_char> = argv_owned.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    let procs_paths: Vec<CString> = cgroups
        .iter()
        .map(|cg| {
            let path = cg.path().join("cgroup.procs");
            CString::new(path.as_os_str().as_encoded_bytes())
                .map_err(|_| ExecError::InvalidArgument(path.to_string_lossy().into_owned()))
        })
        .collect::<Result<_, _>>()?;

    // SAFETY: fork(2) takes no arguments; the child branch below only uses
    // async-signal-safe functions and never returns.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(ExecError::Spawn(std::io::Error::last_os_error()));
    }

    if pid == 0 {
        // SAFETY: child side of a successful fork; enroll_and_exec only calls
        // async-signal-safe functions and ends in _exit.
        unsafe { enroll_and_exec(&procs_paths, &argv) }
    }

    Ok(ChildProcess {
        pid: pid as Pid,
        status: None,
    })
}

/// Child-side continuation after fork. Never returns.
///
/// # Safety
///
/// Must only be called in the child of a fork. `argv` must be a
/// NULL-terminated array of pointers into valid NUL-terminated strings.
unsafe fn enroll_and_exec(procs_paths: &[CString], argv: &[*const libc::c_char]) -> ! {
    let mut buf = [0u8; 16];
    let len = format_decimal(libc::getpid() as u64, &mut buf);

    for path in procs_paths {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY);
        if fd >= 0 {
            libc::write(fd, buf.as_ptr() as *const libc::c_void, len);
            libc::close(fd);
        }
    }

    libc::execvp(argv[0], argv.as_ptr());
    libc::_exit(127)
}

/// Render a decimal number into a byte buffer without allocating.
/// Returns the number of bytes written.
fn format_decimal(mut value: u64, buf: &mut [u8; 16]) -> usize {
    let mut digits = [0u8; 16];
    let mut n = 0;
    loop {
        digits[n] = b'0' + (value % 10) as u8;
        value /= 10;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in 0..n {
        buf[i] = digits[n - 1 - i];
    }
    n
}

// ============================================================================
// Executor
// ============================================================================

/// Final resource usage of a finished confined execution
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionReport {
    pub status: ExitStatus,
    pub cpu: Option<CpuMetrics>,
    pub memory: Option<MemoryMetrics>,
    pub blkio: Option<BlkioMetrics>,
    pub pids: Option<PidsMetrics>,
}

/// Runs commands through the full create/limit/exec/wait/collect/destroy
/// lifecycle
#[derive(Debug, Default)]
pub struct ConfinedExecutor;

impl ConfinedExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run a command confined to a fresh cgroup named by the config.
    ///
    /// Limit writes are best-effort and logged on failure; cgroup creation
    /// and the fork itself are not. The group(s) are removed before
    /// returning, whatever the outcome of the run.
    pub fn run(
        &self,
        config: &ExecutionConfig,
        command: &[String],
    ) -> Result<ExecutionReport, ExecError> {
        if command.is_empty() {
            return Err(ExecError::EmptyCommand);
        }

        let version = CgroupVersion::detect();
        if version == CgroupVersion::Unknown {
            return Err(CgroupError::UnsupportedVersion.into());
        }

        let cgroups = create_groups(&config.name, version)?;

        let result = self.run_in_groups(config, command, version, &cgroups);

        for cg in cgroups {
            let path = cg.path().to_path_buf();
            if let Err(e) = cg.remove() {
                log::warn!("failed to remove cgroup {}: {e}", path.display());
            }
        }

        result
    }

    fn run_in_groups(
        &self,
        config: &ExecutionConfig,
        command: &[String],
        version: CgroupVersion,
        cgroups: &[CgroupController],
    ) -> Result<ExecutionReport, ExecError> {
        apply_limits(config, version, cgroups);

        let mut child = spawn(command, cgroups)?;
        log::info!(
            "running {:?} as pid {} in cgroup {}",
            command[0],
            child.pid(),
            config.name
        );
        let status = child.wait()?;

        Ok(collect_report(status, version, cgroups))
    }
}

/// Create the cgroup(s) for one execution: a single unified group under v2,
/// one group per relevant controller under v1.
fn create_groups(name: &str, version: CgroupVersion) -> Result<Vec<CgroupController>, ExecError> {
    let controllers = match version {
        CgroupVersion::V2 => &[Controller::Cpu][..],
        _ => &[Controller::Cpu, Controller::Memory, Controller::BlockIo][..],
    };

    let mut cgroups = Vec::with_capacity(controllers.len());
    for controller in controllers {
        match CgroupController::create(name, *controller) {
            Ok(cg) => cgroups.push(cg),
            Err(e) => {
                // roll back groups created so far
                for cg in cgroups {
                    let _ = cg.remove();
                }
                return Err(e.into());
            }
        }
    }
    Ok(cgroups)
}

/// Select the group serving one controller: the single unified group under
/// v2, the group inside that controller's hierarchy under v1 (identified by
/// its parent directory name).
fn group_for(
    cgroups: &[CgroupController],
    version: CgroupVersion,
    controller: Controller,
) -> Option<&CgroupController> {
    match version {
        CgroupVersion::V2 => cgroups.first(),
        _ => cgroups.iter().find(|cg| {
            cg.path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                == Some(controller.as_str())
        }),
    }
}

/// Write the configured limits into the right group. Failures downgrade to
/// warnings so an unprivileged run still executes the command.
fn apply_limits(config: &ExecutionConfig, version: CgroupVersion, cgroups: &[CgroupController]) {
    if let Some(cores) = config.cpu_cores {
        match group_for(cgroups, version, Controller::Cpu) {
            Some(cg) => {
                if let Err(e) = cg.set_cpu_limit(cores) {
                    log::warn!("cpu limit not applied: {e}");
                }
            }
            None => log::warn!("no cpu group to apply limit to"),
        }
    }

    if let Some(bytes) = config.memory_bytes {
        match group_for(cgroups, version, Controller::Memory) {
            Some(cg) => {
                if let Err(e) = cg.set_memory_limit(bytes) {
                    log::warn!("memory limit not applied: {e}");
                }
            }
            None => log::warn!("no memory group to apply limit to"),
        }
    }

    if let Some(io) = &config.io {
        match group_for(cgroups, version, Controller::BlockIo) {
            Some(cg) => {
                if let Err(e) = cg.set_io_limit(&io.device, io.rbps, io.wbps) {
                    log::warn!("io limit not applied: {e}");
                }
            }
            None => log::warn!("no blkio group to apply limit to"),
        }
    }
}

/// Final snapshot of the group(s), read after the child exited but before
/// teardown. Individual records degrade to `None`.
fn collect_report(
    status: ExitStatus,
    version: CgroupVersion,
    cgroups: &[CgroupController],
) -> ExecutionReport {
    let path_for =
        |controller: Controller| group_for(cgroups, version, controller).map(|cg| cg.path());

    ExecutionReport {
        status,
        cpu: path_for(Controller::Cpu).and_then(|p| read_cpu_metrics(p, version).ok()),
        memory: path_for(Controller::Memory).and_then(|p| read_memory_metrics(p, version).ok()),
        blkio: path_for(Controller::BlockIo).and_then(|p| read_blkio_metrics(p, version).ok()),
        // v1 keeps pids accounting in its own hierarchy, which none of the
        // created groups belong to
        pids: match version {
            CgroupVersion::V2 => path_for(Controller::Cpu).and_then(|p| read_pids_metrics(p).ok()),
            _ => None,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_defaults() {
        let config = ExecutionConfig::builder("job").build();
        assert_eq!(config.name, "job");
        assert_eq!(config.cpu_cores, None);
        assert_eq!(config.memory_bytes, None);
        assert_eq!(config.io, None);
    }

    #[test]
    fn test_config_builder_limits() {
        let config = ExecutionConfig::builder("job")
            .cpu_cores(0.5)
            .memory_bytes(256 * 1024 * 1024)
            .io_limit("8:0", 1_000_000, 2_000_000)
            .build();
        assert_eq!(config.cpu_cores, Some(0.5));
        assert_eq!(config.memory_bytes, Some(268_435_456));
        let io = config.io.unwrap();
        assert_eq!(io.device, "8:0");
        assert_eq!(io.rbps, 1_000_000);
        assert_eq!(io.wbps, 2_000_000);
    }

    #[test]
    fn test_exit_status_from_raw() {
        // exit(1): status in bits 8..16
        assert_eq!(ExitStatus::from_raw(0x0100), ExitStatus::Exited(1));
        assert_eq!(ExitStatus::from_raw(0), ExitStatus::Exited(0));
        // SIGKILL: signal number in the low bits
        assert_eq!(ExitStatus::from_raw(9), ExitStatus::Signaled(9));
    }

    #[test]
    fn test_exit_status_success_and_shell_code() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(1).success());
        assert!(!ExitStatus::Signaled(9).success());

        assert_eq!(ExitStatus::Exited(3).shell_code(), 3);
        assert_eq!(ExitStatus::Signaled(15).shell_code(), 143);
    }

    #[test]
    fn test_format_decimal() {
        let mut buf = [0u8; 16];
        assert_eq!(format_decimal(0, &mut buf), 1);
        assert_eq!(&buf[..1], b"0");

        let len = format_decimal(41287, &mut buf);
        assert_eq!(&buf[..len], b"41287");
    }

    #[test]
    fn test_spawn_empty_command() {
        assert!(matches!(spawn(&[], &[]), Err(ExecError::EmptyCommand)));
    }

    #[test]
    fn test_spawn_nul_in_argument() {
        let command = vec!["echo".to_string(), "a\0b".to_string()];
        assert!(matches!(
            spawn(&command, &[]),
            Err(ExecError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_spawn_and_wait_without_cgroups() {
        let command = vec!["true".to_string()];
        let mut child = spawn(&command, &[]).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status, ExitStatus::Exited(0));
        // wait is idempotent
        assert_eq!(child.wait().unwrap(), ExitStatus::Exited(0));
        assert_eq!(child.status(), Some(ExitStatus::Exited(0)));
    }

    #[test]
    fn test_spawn_failing_command() {
        let command = vec!["false".to_string()];
        let mut child = spawn(&command, &[]).unwrap();
        assert_eq!(child.wait().unwrap(), ExitStatus::Exited(1));
    }

    #[test]
    fn test_exec_failure_is_127() {
        let command = vec!["/nonexistent/definitely-not-a-binary".to_string()];
        let mut child = spawn(&command, &[]).unwrap();
        assert_eq!(child.wait().unwrap(), ExitStatus::Exited(127));
    }

    #[test]
    fn test_kill_child() {
        let command = vec!["sleep".to_string(), "30".to_string()];
        let mut child = spawn(&command, &[]).unwrap();
        child.kill().unwrap();
        assert_eq!(child.wait().unwrap(), ExitStatus::Signaled(libc::SIGKILL));
        // signaling a reaped child is a no-op
        child.kill().unwrap();
    }

    // Requires root and a writable cgroupfs; skipped elsewhere.
    #[test]
    fn test_run_confined_true() {
        // SAFETY: geteuid takes no arguments and cannot fail.
        if unsafe { libc::geteuid() } != 0 {
            return;
        }
        if CgroupVersion::detect() == CgroupVersion::Unknown {
            return;
        }

        let config = ExecutionConfig::builder("isoscope-test-run").build();
        let command = vec!["true".to_string()];
        match ConfinedExecutor::new().run(&config, &command) {
            Ok(report) => assert!(report.status.success()),
            // container environments often mount cgroupfs read-only
            Err(ExecError::Cgroup(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    fn expected_group_paths(name: &str, version: CgroupVersion) -> Vec<std::path::PathBuf> {
        let root = std::path::Path::new(crate::CGROUP_ROOT);
        match version {
            CgroupVersion::V2 => vec![root.join(name)],
            _ => [Controller::Cpu, Controller::Memory, Controller::BlockIo]
                .iter()
                .map(|c| root.join(c.as_str()).join(name))
                .collect(),
        }
    }

    // Requires root and a writable cgroupfs; skipped elsewhere.
    #[test]
    fn test_run_removes_groups_on_exec_failure() {
        // SAFETY: geteuid takes no arguments and cannot fail.
        if unsafe { libc::geteuid() } != 0 {
            return;
        }
        let version = CgroupVersion::detect();
        if version == CgroupVersion::Unknown {
            return;
        }

        let name = "isoscope-test-cleanup";
        let config = ExecutionConfig::builder(name).build();
        let command = vec!["/nonexistent/definitely-not-a-binary".to_string()];
        match ConfinedExecutor::new().run(&config, &command) {
            Ok(report) => {
                assert_eq!(report.status, ExitStatus::Exited(127));
                // teardown happens even when the child never exec'd
                for path in expected_group_paths(name, version) {
                    assert!(!path.exists(), "cgroup left behind: {}", path.display());
                }
            }
            Err(ExecError::Cgroup(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_collect_report_v1_reads_per_hierarchy_groups() {
        let root = tempfile::tempdir().unwrap();
        let mut cgroups = Vec::new();
        for controller in ["cpu", "memory", "blkio"] {
            let dir = root.path().join(controller).join("job");
            std::fs::create_dir_all(&dir).unwrap();
            cgroups.push(CgroupController::open(dir, CgroupVersion::V1).unwrap());
        }
        let cpu_dir = root.path().join("cpu/job");
        std::fs::write(cpu_dir.join("cpuacct.usage"), "7000000000\n").unwrap();
        // pids files in the cpu hierarchy are not pids accounting
        std::fs::write(cpu_dir.join("pids.current"), "3\n").unwrap();
        std::fs::write(
            root.path().join("memory/job/memory.usage_in_bytes"),
            "4096\n",
        )
        .unwrap();
        std::fs::write(
            root.path().join("blkio/job/blkio.throttle.io_service_bytes"),
            "8:0 Read 100\n8:0 Write 200\n",
        )
        .unwrap();

        let report = collect_report(ExitStatus::Exited(0), CgroupVersion::V1, &cgroups);
        assert_eq!(report.cpu.unwrap().usage_usec, 7_000_000);
        assert_eq!(report.memory.unwrap().current, 4096);
        assert_eq!(report.blkio.unwrap().rbytes, 100);
        assert!(report.pids.is_none());
    }

    #[test]
    fn test_collect_report_v2_single_group() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cpu.stat"), "usage_usec 100\n").unwrap();
        std::fs::write(dir.path().join("pids.current"), "2\n").unwrap();
        std::fs::write(dir.path().join("pids.max"), "max\n").unwrap();
        let cgroups = vec![CgroupController::open(dir.path(), CgroupVersion::V2).unwrap()];

        let report = collect_report(ExitStatus::Exited(0), CgroupVersion::V2, &cgroups);
        assert_eq!(report.cpu.unwrap().usage_usec, 100);
        let pids = report.pids.unwrap();
        assert_eq!(pids.current, 2);
        assert_eq!(pids.limit, crate::UNLIMITED);
        // io.stat absent, so no blkio record
        assert!(report.blkio.is_none());
    }
}
