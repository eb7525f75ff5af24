//! Cgroup v2 resource controller: one `BASE/job-<id>/` directory per job.
//!
//! The base directory is a delegated slice (cpu and memory controllers at
//! minimum, io when available). Limits are written straight into the kernel
//! interface files; a limit of 0 leaves the kernel default untouched. IO
//! throttling is best-effort and only attempted when the operator has
//! configured a block device.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CgroupSettings;
use crate::error::{Error, Result};
use crate::job::JobLimits;

/// cpu.max period in microseconds; quotas are expressed against this.
const CPU_PERIOD_US: i64 = 100_000;

/// Delay between SIGTERM and SIGKILL when clearing leftover processes.
const KILL_ESCALATION_DELAY: Duration = Duration::from_millis(20);

/// Retry interval while waiting for a cgroup directory to become removable.
const RMDIR_POLL: Duration = Duration::from_millis(50);

/// Bound applied when sweeping stale directories at startup.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct CgroupController {
    base: PathBuf,
    io_device: Option<String>,
    cleanup_timeout: Duration,
}

/// Result of probing the configured base for usability (`jobward check`).
#[derive(Debug, Serialize)]
pub struct CgroupProbe {
    pub base: String,
    pub exists: bool,
    pub cpu_max: bool,
    pub cpu_weight: bool,
    pub memory_max: bool,
    pub memory_high: bool,
    pub io_max: bool,
    pub stale_jobs: Vec<String>,
}

impl CgroupController {
    pub fn new(settings: &CgroupSettings) -> CgroupController {
        CgroupController {
            base: settings.base.clone(),
            io_device: settings.io_device.clone(),
            cleanup_timeout: Duration::from_millis(settings.cleanup_timeout_ms),
        }
    }

    /// Absolute path of the cgroup directory for a job id.
    pub fn job_path(&self, job_id: &str) -> PathBuf {
        self.base.join(format!("job-{job_id}"))
    }

    /// Create and configure the per-job cgroup. A stale directory left by a
    /// crashed predecessor is removed first. On any configuration failure
    /// the directory is removed again before the error is returned.
    pub fn create(&self, job_id: &str, limits: &JobLimits) -> Result<PathBuf> {
        let path = self.job_path(job_id);
        if path.exists() {
            warn!(path = %path.display(), "removing stale cgroup directory");
            if let Err(e) = cleanup(&path, SWEEP_TIMEOUT) {
                return Err(Error::resource_unavailable(format!(
                    "stale cgroup {} could not be removed: {e}",
                    path.display()
                )));
            }
        }

        std::fs::create_dir_all(&path).map_err(|e| {
            Error::resource_unavailable(format!("create cgroup {}: {e}", path.display()))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755));
        }

        if let Err(e) = self.configure(&path, limits) {
            let _ = cleanup(&path, SWEEP_TIMEOUT);
            return Err(e);
        }
        debug!(job_id, path = %path.display(), ?limits, "cgroup configured");
        Ok(path)
    }

    fn configure(&self, path: &Path, limits: &JobLimits) -> Result<()> {
        if limits.cpu_percent > 0 {
            write_cpu_limit(path, limits.cpu_percent)?;
        }
        if limits.memory_mb > 0 {
            write_memory_limit(path, limits.memory_mb)?;
        }
        if limits.io_bytes_per_sec > 0 {
            self.write_io_limit(path, limits.io_bytes_per_sec);
        }
        Ok(())
    }

    /// Best-effort io.max configuration. Tries a short ordered list of
    /// formats; the first one the kernel accepts wins. Total failure is a
    /// warning, not an error: the job runs unthrottled.
    fn write_io_limit(&self, path: &Path, bps: i64) {
        let Some(device) = self.io_device.as_deref() else {
            debug!("no io device configured; skipping io limit");
            return;
        };
        let candidates = [
            format!("{device} rbps={bps} wbps={bps}"),
            format!("{device} riops=max wiops=max rbps={bps} wbps={bps}"),
        ];
        let target = path.join("io.max");
        for entry in &candidates {
            match write_interface(&target, entry) {
                Ok(()) => {
                    info!(entry = %entry, "io limit applied");
                    return;
                }
                Err(e) => {
                    debug!(entry = %entry, error = %e, "io.max format rejected");
                }
            }
        }
        warn!(device, bps, "io limit could not be applied; continuing without");
    }

    /// Move a process into the job's cgroup.
    pub fn attach(&self, path: &Path, pid: u32) -> Result<()> {
        attach_pid(path, pid)
    }

    /// Clear and remove the job's cgroup on a background thread, bounded by
    /// the configured cleanup timeout. An overrun is logged and abandoned;
    /// the startup sweep and the stale-directory handling in `create` pick
    /// up whatever is left behind.
    pub fn cleanup_background(&self, path: PathBuf) {
        let timeout = self.cleanup_timeout;
        let builder = std::thread::Builder::new().name("cgroup-cleanup".to_string());
        let spawned = builder.spawn(move || {
            if let Err(e) = cleanup(&path, timeout) {
                warn!(path = %path.display(), error = %e, "cgroup cleanup abandoned");
            }
        });
        if let Err(e) = spawned {
            warn!(error = %e, "could not spawn cgroup cleanup thread");
        }
    }

    /// Remove leftover `job-*` directories under the base, killing any
    /// processes still recorded in them. Jobs do not survive a restart, so
    /// anything found here is garbage.
    pub fn sweep_stale(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.base) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_dir() || !name.starts_with("job-") {
                continue;
            }
            match cleanup(&path, SWEEP_TIMEOUT) {
                Ok(()) => {
                    info!(path = %path.display(), "removed stale cgroup");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "stale cgroup not removed");
                }
            }
        }
        removed
    }

    /// Inspect the base directory for `jobward check`.
    pub fn probe(&self) -> CgroupProbe {
        let exists = self.base.is_dir();
        let has = |name: &str| self.base.join(name).exists();
        let mut stale_jobs = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.base) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str()
                    && name.starts_with("job-")
                    && entry.path().is_dir()
                {
                    stale_jobs.push(name.to_string());
                }
            }
            stale_jobs.sort();
        }
        CgroupProbe {
            base: self.base.display().to_string(),
            exists,
            cpu_max: has("cpu.max"),
            cpu_weight: has("cpu.weight"),
            memory_max: has("memory.max"),
            memory_high: has("memory.high"),
            io_max: has("io.max"),
            stale_jobs,
        }
    }
}

/// Write into a kernel interface file. The file is never created: a missing
/// file means the controller is not delegated here, and that distinction is
/// load-bearing for the fallback logic.
fn write_interface(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.write_all(contents.as_bytes())
}

/// Write the CPU quota. `cpu.max` takes `"<quota_us> <period_us>"`; when it
/// is absent (controller not delegated on this kernel), fall back to the
/// proportional `cpu.weight`.
fn write_cpu_limit(path: &Path, cpu_percent: i32) -> Result<()> {
    let quota_us = cpu_percent as i64 * 1000;
    let target = path.join("cpu.max");
    match write_interface(&target, &format!("{quota_us} {CPU_PERIOD_US}")) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::resource_unavailable(format!(
                "write {}: {e}",
                target.display()
            )));
        }
    }
    let weight = (cpu_percent as i64 * 100).clamp(1, 10_000);
    let target = path.join("cpu.weight");
    write_interface(&target, &weight.to_string()).map_err(|e| {
        Error::resource_unavailable(format!(
            "neither cpu.max nor cpu.weight accepted a limit: {e}"
        ))
    })
}

/// Write `memory.max` (hard ceiling) and `memory.high` (throttle point at
/// 90% of the ceiling). At least one of the two files must exist.
fn write_memory_limit(path: &Path, memory_mb: i32) -> Result<()> {
    let bytes = memory_mb as u64 * (1 << 20);
    let high = bytes * 9 / 10;
    let max_res = write_interface(&path.join("memory.max"), &bytes.to_string());
    let high_res = write_interface(&path.join("memory.high"), &high.to_string());
    if max_res.is_err() && high_res.is_err() {
        return Err(Error::resource_unavailable(format!(
            "memory controller not available in {}",
            path.display()
        )));
    }
    Ok(())
}

fn attach_pid(path: &Path, pid: u32) -> Result<()> {
    use std::io::Write;
    let target = path.join("cgroup.procs");
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&target)
        .map_err(|e| {
            Error::resource_unavailable(format!("open {}: {e}", target.display()))
        })?;
    writeln!(file, "{pid}")
        .map_err(|e| Error::internal(format!("attach pid {pid} to {}: {e}", target.display())))
}

/// Signal every process recorded in the group's `cgroup.procs`.
fn signal_procs(path: &Path, signal: libc::c_int) {
    let Ok(contents) = std::fs::read_to_string(path.join("cgroup.procs")) else {
        return;
    };
    for line in contents.lines() {
        if let Ok(pid) = line.trim().parse::<libc::pid_t>()
            && pid > 0
        {
            // SAFETY: kill(2) with a valid signal number.
            unsafe { libc::kill(pid, signal) };
        }
    }
}

/// Terminate any processes left in the group, then remove its directory.
///
/// The directory of a live cgroup refuses rmdir until its processes are
/// gone, so removal is retried until the deadline. A job may also have
/// created nested child groups inside its delegated subtree; those are
/// removed depth-first.
fn cleanup(path: &Path, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    signal_procs(path, libc::SIGTERM);
    std::thread::sleep(KILL_ESCALATION_DELAY);
    signal_procs(path, libc::SIGKILL);

    loop {
        match std::fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(Error::internal(format!(
                        "remove {}: {e}",
                        path.display()
                    )));
                }
                remove_children(path, deadline);
                signal_procs(path, libc::SIGKILL);
                std::thread::sleep(RMDIR_POLL);
            }
        }
    }
}

/// Depth-first removal of nested entries blocking an rmdir: child cgroups
/// created by the job, or plain files when the base is an ordinary
/// directory (tests, misconfiguration).
fn remove_children(path: &Path, deadline: Instant) {
    let Ok(entries) = std::fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        if Instant::now() >= deadline {
            return;
        }
        let child = entry.path();
        if child.is_dir() {
            signal_procs(&child, libc::SIGKILL);
            remove_children(&child, deadline);
            let _ = std::fs::remove_dir(&child);
        } else {
            let _ = std::fs::remove_file(&child);
        }
    }
}
