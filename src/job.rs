//! Job domain model: the job record, its lifecycle states, resource limits,
//! and the update values delivered to output subscribers.
//!
//! All mutation of a `Job` goes through the store; everything handed out to
//! callers is a copy.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum byte length of the command and of each argument.
pub const MAX_COMMAND_BYTES: usize = 1024;
/// Maximum number of arguments.
pub const MAX_ARGS: usize = 100;
/// Maximum byte length of a job id.
pub const MAX_JOB_ID_BYTES: usize = 64;
/// Upper bound for `cpu_percent` (100 cores).
pub const MAX_CPU_PERCENT: i32 = 10_000;
/// Upper bound for `memory_mb` (1 TiB).
pub const MAX_MEMORY_MB: i32 = 1 << 20;
/// Upper bound for `io_bytes_per_sec` (10 GiB/s).
pub const MAX_IO_BPS: i64 = 10 * (1 << 30);

/// Shell metacharacters that are never allowed in a command name.
const FORBIDDEN_COMMAND_CHARS: &[char] = &[';', '&', '|', '`', '$', '(', ')'];

/// Lifecycle state of a job.
///
/// Transitions: `Initializing` → `Running` → one of the three terminal
/// states, or `Initializing` → `Failed` when setup fails or a stop arrives
/// before the launch completes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initializing,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initializing => "initializing",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    /// True for the absorbing states of the lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }
}

/// Per-job resource limits. A value of 0 means "do not configure; leave the
/// kernel default" (the service may substitute configured defaults first).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobLimits {
    /// CPU bandwidth in percent of one core (100 = one full core).
    pub cpu_percent: i32,
    /// Memory ceiling in MiB.
    pub memory_mb: i32,
    /// Combined read/write throughput ceiling in bytes per second.
    pub io_bytes_per_sec: i64,
}

impl JobLimits {
    /// Substitute configured defaults for every limit left at 0.
    pub fn or_defaults(&self, defaults: &JobLimits) -> JobLimits {
        JobLimits {
            cpu_percent: if self.cpu_percent == 0 {
                defaults.cpu_percent
            } else {
                self.cpu_percent
            },
            memory_mb: if self.memory_mb == 0 {
                defaults.memory_mb
            } else {
                self.memory_mb
            },
            io_bytes_per_sec: if self.io_bytes_per_sec == 0 {
                defaults.io_bytes_per_sec
            } else {
                self.io_bytes_per_sec
            },
        }
    }
}

/// A launch request as received from a caller. Validated before any side
/// effect takes place.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    /// Absolute path or PATH-resolvable executable name.
    pub command: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    pub limits: JobLimits,
}

impl JobSpec {
    /// Reject a spec that violates any data-model constraint. No side
    /// effects have happened when this fails.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::invalid_argument("command is empty"));
        }
        if self.command.len() > MAX_COMMAND_BYTES {
            return Err(Error::invalid_argument(format!(
                "command exceeds {MAX_COMMAND_BYTES} bytes"
            )));
        }
        if self.command.contains('\0') {
            return Err(Error::invalid_argument("command contains NUL"));
        }
        if let Some(c) = self.command.chars().find(|c| FORBIDDEN_COMMAND_CHARS.contains(c)) {
            return Err(Error::invalid_argument(format!(
                "command contains forbidden character {c:?}"
            )));
        }
        if self.args.len() > MAX_ARGS {
            return Err(Error::invalid_argument(format!(
                "too many arguments ({} > {MAX_ARGS})",
                self.args.len()
            )));
        }
        for (i, arg) in self.args.iter().enumerate() {
            if arg.len() > MAX_COMMAND_BYTES {
                return Err(Error::invalid_argument(format!(
                    "argument {i} exceeds {MAX_COMMAND_BYTES} bytes"
                )));
            }
            if arg.contains('\0') {
                return Err(Error::invalid_argument(format!("argument {i} contains NUL")));
            }
        }
        let l = &self.limits;
        if !(0..=MAX_CPU_PERCENT).contains(&l.cpu_percent) {
            return Err(Error::invalid_argument(format!(
                "cpu_percent {} out of range [0, {MAX_CPU_PERCENT}]",
                l.cpu_percent
            )));
        }
        if !(0..=MAX_MEMORY_MB).contains(&l.memory_mb) {
            return Err(Error::invalid_argument(format!(
                "memory_mb {} out of range [0, {MAX_MEMORY_MB}]",
                l.memory_mb
            )));
        }
        if !(0..=MAX_IO_BPS).contains(&l.io_bytes_per_sec) {
            return Err(Error::invalid_argument(format!(
                "io_bytes_per_sec {} out of range [0, {MAX_IO_BPS}]",
                l.io_bytes_per_sec
            )));
        }
        Ok(())
    }
}

/// True when `id` matches `[A-Za-z0-9_-]{1,64}`.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_JOB_ID_BYTES
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// The central entity. Owned by the store; callers only ever see copies.
#[derive(Debug, Clone)]
pub struct Job {
    /// Server-assigned opaque id, `[A-Za-z0-9_-]{1,64}`.
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    /// Limits as requested (before default substitution).
    pub limits: JobLimits,
    pub status: JobStatus,
    /// OS process id; 0 until the job reaches `Running`.
    pub pid: u32,
    /// Meaningful only in a terminal state.
    pub exit_code: Option<i32>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    /// Absolute path of the per-job cgroup directory, once created.
    pub cgroup_path: Option<std::path::PathBuf>,
}

impl Job {
    pub(crate) fn new(id: String, spec: &JobSpec) -> Job {
        Job {
            id,
            command: spec.command.clone(),
            args: spec.args.clone(),
            limits: spec.limits,
            status: JobStatus::Initializing,
            pid: 0,
            exit_code: None,
            start_time: None,
            end_time: None,
            cgroup_path: None,
        }
    }
}

/// One message delivered to a subscriber: a chunk of output, or a bare
/// status change (terminal transition) with an empty chunk.
#[derive(Debug, Clone)]
pub struct Update {
    pub job_id: String,
    pub status: JobStatus,
    pub chunk: Vec<u8>,
}

/// Format a wall-clock instant as an RFC 3339 UTC string.
pub fn format_rfc3339(t: SystemTime) -> String {
    let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    format_rfc3339_secs(secs)
}

fn format_rfc3339_secs(secs: u64) -> String {
    let mut s = secs;
    let seconds = s % 60;
    s /= 60;
    let minutes = s % 60;
    s /= 60;
    let hours = s % 24;
    s /= 24;

    // Days since 1970-01-01.
    let mut days = s;
    let mut year = 1970u64;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let leap = is_leap(year);
    let month_days: [u64; 12] = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0usize;
    for (i, &d) in month_days.iter().enumerate() {
        if days < d {
            month = i;
            break;
        }
        days -= d;
    }
    let day = days + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month + 1,
        day,
        hours,
        minutes,
        seconds
    )
}

fn is_leap(year: u64) -> bool {
    (year.is_multiple_of(4) && !year.is_multiple_of(100)) || year.is_multiple_of(400)
}
