//! Process supervisor: turns a validated spec into a running, isolated OS
//! process and ultimately into a terminal job state.
//!
//! Launch is two-stage: the supervisor spawns this same binary in init mode
//! (`jobward _init`), which joins the job's cgroup and sets up namespaces
//! before executing the payload. The init image learns everything it needs
//! from injected environment variables. A readiness pipe is inherited down
//! to the payload with close-on-exec set: EOF on the parent side means the
//! exec happened, bytes mean a setup failure, silence past the launch
//! deadline means the launch is killed.
//!
//! Each launch runs on its own dedicated OS thread from spawn through the
//! readiness handshake; the same thread then waits for the child and drives
//! the terminal transition.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, info, warn};

use crate::cgroup::CgroupController;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{Job, JobSpec, JobStatus};
use crate::output;
use crate::store::JobStore;

/// Environment contract of the init-mode child, injected on top of the
/// inherited parent environment.
pub const ENV_JOB_ID: &str = "JOB_ID";
pub const ENV_JOB_COMMAND: &str = "JOB_COMMAND";
pub const ENV_JOB_CGROUP_PATH: &str = "JOB_CGROUP_PATH";
pub const ENV_JOB_ARGS_COUNT: &str = "JOB_ARGS_COUNT";
pub const ENV_JOB_ARG_PREFIX: &str = "JOB_ARG_";
pub const ENV_JOB_NAMESPACES: &str = "JOB_NAMESPACES";
pub const ENV_JOB_READY_FD: &str = "JOB_READY_FD";

/// Name of the hidden init-mode subcommand.
pub const INIT_SUBCOMMAND: &str = "_init";

/// Exit code of the init image when setup fails before the exec.
pub const INIT_EXIT_SETUP: i32 = 126;
/// Exit code of the init image when the exec itself fails.
pub const INIT_EXIT_EXEC: i32 = 127;

/// Bounds of the environment contract.
pub const MAX_ENV_ENTRIES: usize = 1000;
pub const MAX_ENV_ENTRY_BYTES: usize = 8192;

/// Fallback directories searched after `PATH`.
const FALLBACK_PATH: &[&str] = &["/bin", "/usr/bin", "/usr/local/bin", "/sbin", "/usr/sbin"];

/// Poll interval for liveness and terminal-state waits.
const STOP_POLL: Duration = Duration::from_millis(5);

/// Extra time granted for the waiter to observe an exit after SIGKILL.
const REAP_SLACK: Duration = Duration::from_secs(5);

pub struct Supervisor {
    store: Arc<JobStore>,
    cgroups: Arc<CgroupController>,
    config: Arc<Config>,
}

impl Supervisor {
    pub fn new(
        store: Arc<JobStore>,
        cgroups: Arc<CgroupController>,
        config: Arc<Config>,
    ) -> Supervisor {
        Supervisor {
            store,
            cgroups,
            config,
        }
    }

    /// Validate the spec, register the job, create its cgroup, and hand the
    /// launch to a dedicated thread. Returns a copy of the job record,
    /// still `Initializing`; the transition to `Running` happens once the
    /// payload has actually exec'd.
    pub fn launch(&self, spec: JobSpec) -> Result<Job> {
        spec.validate()?;
        let command_path = resolve_command(&spec.command)?;
        let init_image = self.resolve_init_image()?;
        let injected = injected_env(&spec);
        validate_env(&injected)?;

        let job = self.store.create_pending(&spec)?;
        let effective = spec.limits.or_defaults(&self.config.defaults.as_limits());
        let cgroup_path = match self.cgroups.create(&job.id, &effective) {
            Ok(path) => path,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "resource setup failed");
                let _ = self
                    .store
                    .mark_terminal(&job.id, JobStatus::Failed, None, SystemTime::now());
                return Err(e);
            }
        };
        self.store.record_cgroup(&job.id, &cgroup_path)?;

        let ctx = LaunchContext {
            store: Arc::clone(&self.store),
            cgroups: Arc::clone(&self.cgroups),
            job_id: job.id.clone(),
            init_image,
            command_path,
            cgroup_path: cgroup_path.clone(),
            injected,
            namespaces: self.config.isolation.namespaces,
            launch_timeout: self.config.launch_timeout(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("launch-{}", job.id))
            .spawn(move || ctx.run());
        if let Err(e) = spawned {
            let _ = self
                .store
                .mark_terminal(&job.id, JobStatus::Failed, None, SystemTime::now());
            self.cgroups.cleanup_background(cgroup_path);
            return Err(Error::internal(format!("spawn launch thread: {e}")));
        }

        let (job, _, _) = self.store.snapshot(&job.id)?;
        Ok(job)
    }

    /// Stop a job: SIGTERM to its process group, a grace period, then
    /// SIGKILL. Synchronous and idempotent — returns the job as it stands
    /// once the dust settles, and stopping a job that is already terminal
    /// just reports its current state.
    pub fn stop(&self, id: &str) -> Result<Job> {
        let entry = self.store.entry(id)?;
        let (mut job, _, _) = self.store.snapshot(id)?;

        if job.status == JobStatus::Initializing {
            // Request stop-before-run and wait for the launch to settle
            // either way.
            entry.stop_requested.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + self.config.launch_timeout() + REAP_SLACK;
            loop {
                let (j, _, _) = self.store.snapshot(id)?;
                if j.status != JobStatus::Initializing {
                    job = j;
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(Error::deadline_exceeded(format!(
                        "job {id} stuck in initializing"
                    )));
                }
                std::thread::sleep(STOP_POLL);
            }
        }

        if job.status.is_terminal() {
            return Ok(job);
        }

        // Running. Record intent, and make sure only one caller signals.
        entry.stop_requested.store(true, Ordering::SeqCst);
        let first = !entry.stop_signaled.swap(true, Ordering::SeqCst);
        let pid = job.pid;
        if first && pid > 0 {
            info!(job_id = %id, pid, "stopping job");
            signal_group(pid, libc::SIGTERM);
            let grace_deadline = Instant::now() + self.config.stop_grace();
            while Instant::now() < grace_deadline {
                if !probe_alive(pid) {
                    break;
                }
                std::thread::sleep(STOP_POLL);
            }
            if probe_alive(pid) {
                info!(job_id = %id, pid, "grace period elapsed, sending SIGKILL");
                signal_group(pid, libc::SIGKILL);
            }
        }

        self.wait_terminal(id, self.config.stop_grace() + REAP_SLACK)
    }

    fn wait_terminal(&self, id: &str, bound: Duration) -> Result<Job> {
        let deadline = Instant::now() + bound;
        loop {
            let (job, _, _) = self.store.snapshot(id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if Instant::now() >= deadline {
                return Err(Error::internal(format!(
                    "job {id} did not terminate after SIGKILL"
                )));
            }
            std::thread::sleep(STOP_POLL);
        }
    }

    fn resolve_init_image(&self) -> Result<PathBuf> {
        let path = match &self.config.isolation.init_path {
            Some(p) => p.clone(),
            None => std::env::current_exe()
                .map_err(|e| Error::internal(format!("resolve current exe: {e}")))?,
        };
        validate_init_image(&path)?;
        Ok(path)
    }
}

/// Everything the launch thread needs, detached from the supervisor.
struct LaunchContext {
    store: Arc<JobStore>,
    cgroups: Arc<CgroupController>,
    job_id: String,
    init_image: PathBuf,
    command_path: PathBuf,
    cgroup_path: PathBuf,
    injected: Vec<(String, String)>,
    namespaces: bool,
    launch_timeout: Duration,
}

enum ReadyOutcome {
    Ready,
    Failed(String),
    TimedOut,
}

impl LaunchContext {
    fn run(self) {
        if let Err(e) = self.launch_and_wait() {
            error!(job_id = %self.job_id, error = %e, "launch failed");
            let _ = self.store.mark_terminal(
                &self.job_id,
                JobStatus::Failed,
                None,
                SystemTime::now(),
            );
            self.cgroups.cleanup_background(self.cgroup_path.clone());
        }
    }

    fn launch_and_wait(&self) -> Result<()> {
        let (ready_rx, ready_wr) = ready_pipe()?;
        let ready_wr_fd = ready_wr.as_raw_fd();

        let mut cmd = Command::new(&self.init_image);
        cmd.arg(INIT_SUBCOMMAND)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .env(ENV_JOB_ID, &self.job_id)
            .env(ENV_JOB_COMMAND, &self.command_path)
            .env(ENV_JOB_CGROUP_PATH, &self.cgroup_path)
            .env(ENV_JOB_NAMESPACES, if self.namespaces { "1" } else { "0" })
            .env(ENV_JOB_READY_FD, ready_wr_fd.to_string());
        for (key, value) in &self.injected {
            cmd.env(key, value);
        }
        // Both pipe ends are close-on-exec so concurrent launches cannot
        // leak this pipe into their own children; the flag is cleared in
        // this child only, between fork and exec.
        // SAFETY: fcntl(2) is async-signal-safe, fine between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::fcntl(ready_wr_fd, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::internal(format!("spawn init image: {e}")))?;
        // The child holds its own copy of the write end now.
        drop(ready_wr);

        let pid = child.id();
        debug!(job_id = %self.job_id, pid, "init child spawned");

        if let Err(e) = self.cgroups.attach(&self.cgroup_path, pid) {
            signal_group(pid, libc::SIGKILL);
            let _ = child.wait();
            return Err(e);
        }

        let stdout = child.stdout.take().ok_or_else(|| Error::internal("child stdout missing"))?;
        let stderr = child.stderr.take().ok_or_else(|| Error::internal("child stderr missing"))?;
        let t_stdout = output::spawn_reader(stdout, Arc::clone(&self.store), self.job_id.clone(), "stdout");
        let t_stderr = output::spawn_reader(stderr, Arc::clone(&self.store), self.job_id.clone(), "stderr");

        let entry = self.store.entry(&self.job_id)?;
        if entry.stop_requested.load(Ordering::SeqCst) {
            info!(job_id = %self.job_id, "stop requested before launch completed");
            signal_group(pid, libc::SIGKILL);
            let _ = child.wait();
            let _ = t_stdout.join();
            let _ = t_stderr.join();
            self.store
                .mark_terminal(&self.job_id, JobStatus::Failed, None, SystemTime::now())?;
            self.cgroups.cleanup_background(self.cgroup_path.clone());
            return Ok(());
        }

        match wait_ready(&ready_rx, self.launch_timeout) {
            ReadyOutcome::Ready => {
                self.store
                    .mark_running(&self.job_id, pid, SystemTime::now())?;
                info!(job_id = %self.job_id, pid, "job running");
            }
            ReadyOutcome::Failed(msg) => {
                warn!(job_id = %self.job_id, pid, error = %msg, "payload setup failed");
                let status = child
                    .wait()
                    .map_err(|e| Error::internal(format!("wait init child: {e}")))?;
                let _ = t_stdout.join();
                let _ = t_stderr.join();
                self.store.mark_terminal(
                    &self.job_id,
                    JobStatus::Failed,
                    Some(exit_code_of(status)),
                    SystemTime::now(),
                )?;
                self.cgroups.cleanup_background(self.cgroup_path.clone());
                return Ok(());
            }
            ReadyOutcome::TimedOut => {
                warn!(job_id = %self.job_id, pid, "launch deadline exceeded, killing");
                signal_group(pid, libc::SIGKILL);
                let _ = child.wait();
                let _ = t_stdout.join();
                let _ = t_stderr.join();
                self.store
                    .mark_terminal(&self.job_id, JobStatus::Failed, None, SystemTime::now())?;
                self.cgroups.cleanup_background(self.cgroup_path.clone());
                return Ok(());
            }
        }
        drop(ready_rx);

        // This thread is now the job's waiter.
        let status = child
            .wait()
            .map_err(|e| Error::internal(format!("wait child: {e}")))?;
        // Let the output drain fully before the buffer is frozen.
        let _ = t_stdout.join();
        let _ = t_stderr.join();

        let exit_code = exit_code_of(status);
        let stopped = entry.stop_requested.load(Ordering::SeqCst);
        let final_status = final_status(stopped, status);
        self.store.mark_terminal(
            &self.job_id,
            final_status,
            Some(exit_code),
            SystemTime::now(),
        )?;
        info!(
            job_id = %self.job_id,
            status = final_status.as_str(),
            exit_code,
            "job finished"
        );
        self.cgroups.cleanup_background(self.cgroup_path.clone());
        Ok(())
    }
}

/// The environment injected on top of the inherited one, per the init-mode
/// contract.
fn injected_env(spec: &JobSpec) -> Vec<(String, String)> {
    let mut vars = Vec::with_capacity(spec.args.len() + 1);
    vars.push((ENV_JOB_ARGS_COUNT.to_string(), spec.args.len().to_string()));
    for (i, arg) in spec.args.iter().enumerate() {
        vars.push((format!("{ENV_JOB_ARG_PREFIX}{i}"), arg.clone()));
    }
    vars
}

fn validate_env(injected: &[(String, String)]) -> Result<()> {
    // The fixed contract variables (id, command, cgroup path, switches) stay
    // well under the bounds; count them as a handful.
    let total = std::env::vars_os().count() + injected.len() + 8;
    if total > MAX_ENV_ENTRIES {
        return Err(Error::invalid_argument(format!(
            "environment would exceed {MAX_ENV_ENTRIES} entries"
        )));
    }
    for (key, value) in injected {
        if key.len() + 1 + value.len() > MAX_ENV_ENTRY_BYTES {
            return Err(Error::invalid_argument(format!(
                "environment entry {key} exceeds {MAX_ENV_ENTRY_BYTES} bytes"
            )));
        }
        if key.contains('=') || key.contains('\0') || value.contains('\0') {
            return Err(Error::invalid_argument(format!(
                "environment entry {key} is malformed"
            )));
        }
    }
    Ok(())
}

/// Resolve a command to an absolute path: stat it if absolute, otherwise
/// search `PATH` followed by the conventional system directories.
pub fn resolve_command(command: &str) -> Result<PathBuf> {
    let path = Path::new(command);
    if path.is_absolute() {
        let meta = std::fs::metadata(path)
            .map_err(|_| Error::invalid_argument(format!("command not found: {command}")))?;
        if !meta.is_file() {
            return Err(Error::invalid_argument(format!(
                "command is not a regular file: {command}"
            )));
        }
        return Ok(path.to_path_buf());
    }

    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    dirs.extend(FALLBACK_PATH.iter().map(PathBuf::from));
    for dir in dirs {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(command);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(Error::invalid_argument(format!(
        "command not found: {command}"
    )))
}

/// The init image must be an absolute path to a regular, executable file.
pub fn validate_init_image(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::invalid_argument(format!(
            "init image path is not absolute: {}",
            path.display()
        )));
    }
    let meta = std::fs::metadata(path).map_err(|_| {
        Error::invalid_argument(format!("init image not found: {}", path.display()))
    })?;
    if !meta.is_file() {
        return Err(Error::invalid_argument(format!(
            "init image is not a regular file: {}",
            path.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(Error::invalid_argument(format!(
                "init image is not executable: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Create the readiness pipe. Both ends are close-on-exec; the launch
/// clears the flag on the write end inside its own child only.
fn ready_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds points at a valid two-element array.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(Error::internal(format!(
            "pipe2: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: both fds were just returned by pipe2(2) and are owned here.
    let (rx, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((rx, wr))
}

/// Wait for the readiness pipe to resolve: EOF with no bytes means the
/// payload exec'd; bytes carry a setup error; silence past the deadline is
/// a timeout.
fn wait_ready(fd: &OwnedFd, timeout: Duration) -> ReadyOutcome {
    let deadline = Instant::now() + timeout;
    let mut message: Vec<u8> = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ReadyOutcome::TimedOut;
        }
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return ReadyOutcome::Failed(format!("poll on readiness pipe: {e}"));
        }
        if rc == 0 {
            return ReadyOutcome::TimedOut;
        }
        let mut buf = [0u8; 256];
        // SAFETY: buf is a valid writable buffer of the given length.
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            0 => {
                return if message.is_empty() {
                    ReadyOutcome::Ready
                } else {
                    ReadyOutcome::Failed(String::from_utf8_lossy(&message).into_owned())
                };
            }
            n if n > 0 => message.extend_from_slice(&buf[..n as usize]),
            _ => {
                let e = std::io::Error::last_os_error();
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return ReadyOutcome::Failed(format!("read readiness pipe: {e}"));
            }
        }
    }
}

/// Signal the whole process group; fall back to the single pid when the
/// group signal is refused.
fn signal_group(pid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) accepts any pid and a valid signal number.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error().raw_os_error();
        if err == Some(libc::EPERM) || err == Some(libc::ESRCH) {
            // SAFETY: as above.
            unsafe { libc::kill(pid as libc::pid_t, signal) };
        }
    }
}

/// Liveness probe via signal 0: ESRCH means gone, EPERM means alive but
/// unsignallable, success means alive, anything else is treated as gone.
fn probe_alive(pid: u32) -> bool {
    // SAFETY: kill(2) with signal 0 performs only the existence check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => false,
        Some(libc::EPERM) => true,
        other => {
            warn!(pid, errno = ?other, "unexpected liveness probe result, assuming dead");
            false
        }
    }
}

/// Exit code of a finished process: the code itself, or the conventional
/// 128+signal encoding when a signal ended it.
fn exit_code_of(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

fn final_status(stop_requested: bool, status: ExitStatus) -> JobStatus {
    if stop_requested {
        JobStatus::Stopped
    } else if status.success() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    }
}
