//! Engine configuration.
//!
//! Resolution order for the config file:
//!   1. `--config` CLI flag
//!   2. `JOBWARD_CONFIG` environment variable
//!   3. `$XDG_CONFIG_HOME/jobward/config.toml`
//!   4. `~/.config/jobward/config.toml`
//!
//! A missing file at the default locations is not an error; built-in
//! defaults apply. Every key is optional.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::Deserialize;
use tracing::debug;

use crate::job::JobLimits;

/// Default cgroup v2 slice the engine manages.
pub const DEFAULT_CGROUP_BASE: &str = "/sys/fs/cgroup/jobward.slice";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cgroup: CgroupSettings,
    pub defaults: LimitDefaults,
    pub isolation: IsolationSettings,
    /// Grace period between SIGTERM and SIGKILL when stopping a job.
    pub stop_grace_ms: u64,
    /// Hard deadline from spawn to the job becoming running.
    pub launch_timeout_ms: u64,
    /// Rolling cap on the per-job output buffer; 0 = unbounded.
    pub max_buffer_bytes: u64,
    /// Largest single chunk handed to a streaming consumer.
    pub max_chunk_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cgroup: CgroupSettings::default(),
            defaults: LimitDefaults::default(),
            isolation: IsolationSettings::default(),
            stop_grace_ms: 100,
            launch_timeout_ms: 10_000,
            max_buffer_bytes: 0,
            max_chunk_bytes: 1 << 20,
        }
    }
}

/// Settings for the resource controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CgroupSettings {
    /// Parent directory for per-job cgroups. Must have the cpu and memory
    /// controllers delegated.
    pub base: PathBuf,
    /// Block device as "MAJ:MIN" for io.max entries. IO limiting is skipped
    /// entirely when unset.
    pub io_device: Option<String>,
    /// Bound on the background cleanup of a job's cgroup directory.
    pub cleanup_timeout_ms: u64,
}

impl Default for CgroupSettings {
    fn default() -> Self {
        CgroupSettings {
            base: PathBuf::from(DEFAULT_CGROUP_BASE),
            io_device: None,
            cleanup_timeout_ms: 5_000,
        }
    }
}

/// Limits substituted when a request leaves a limit at 0. A default of 0
/// leaves the kernel default in place (no limit file is written).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitDefaults {
    pub cpu_percent: i32,
    pub memory_mb: i32,
    pub io_bytes_per_sec: i64,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        LimitDefaults {
            cpu_percent: 10,
            memory_mb: 1,
            io_bytes_per_sec: 0,
        }
    }
}

impl LimitDefaults {
    pub fn as_limits(&self) -> JobLimits {
        JobLimits {
            cpu_percent: self.cpu_percent,
            memory_mb: self.memory_mb,
            io_bytes_per_sec: self.io_bytes_per_sec,
        }
    }
}

/// Isolation switches. Both default to on; disabling them lets the engine
/// run unprivileged (and is how the test suite runs).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolationSettings {
    /// Create PID/mount/IPC/UTS/cgroup namespaces for each job.
    pub namespaces: bool,
    /// Path to the init-mode image; defaults to the current executable.
    pub init_path: Option<PathBuf>,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        IsolationSettings {
            namespaces: true,
            init_path: None,
        }
    }
}

impl Config {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    /// Load configuration from the resolved file, or defaults when no file
    /// exists.
    pub fn load(cli_path: Option<&str>) -> Result<Config> {
        match resolve_config_path(cli_path) {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("read config {}", path.display()))?;
                let config: Config = toml::from_str(&raw)
                    .with_context(|| format!("parse config {}", path.display()))?;
                debug!(path = %path.display(), "loaded config");
                Ok(config)
            }
            Some(path) if cli_path.is_some() => {
                // An explicitly named file must exist.
                anyhow::bail!("config file not found: {}", path.display());
            }
            _ => Ok(Config::default()),
        }
    }
}

/// Resolve the config file path following the priority chain.
fn resolve_config_path(cli_path: Option<&str>) -> Option<PathBuf> {
    // 1. CLI flag
    if let Some(p) = cli_path {
        return Some(PathBuf::from(p));
    }

    // 2. Environment variable
    if let Ok(p) = std::env::var("JOBWARD_CONFIG")
        && !p.is_empty()
    {
        return Some(PathBuf::from(p));
    }

    // 3. XDG_CONFIG_HOME
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Some(PathBuf::from(xdg).join("jobward").join("config.toml"));
    }

    // 4. Default: ~/.config/jobward/config.toml
    BaseDirs::new().map(|b| b.home_dir().join(".config").join("jobward").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.stop_grace_ms, 100);
        assert_eq!(c.launch_timeout_ms, 10_000);
        assert_eq!(c.defaults.cpu_percent, 10);
        assert_eq!(c.defaults.memory_mb, 1);
        assert_eq!(c.defaults.io_bytes_per_sec, 0);
        assert!(c.isolation.namespaces);
        assert_eq!(c.cgroup.base, PathBuf::from(DEFAULT_CGROUP_BASE));
    }

    #[test]
    fn parse_partial_file() {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            f,
            r#"
stop_grace_ms = 2000

[cgroup]
base = "/sys/fs/cgroup/worker.slice"
io_device = "8:0"

[defaults]
cpu_percent = 100
memory_mb = 512
"#
        )
        .expect("write config");
        let c = Config::load(Some(f.path().to_str().unwrap())).expect("load");
        assert_eq!(c.stop_grace_ms, 2000);
        assert_eq!(c.cgroup.base, PathBuf::from("/sys/fs/cgroup/worker.slice"));
        assert_eq!(c.cgroup.io_device.as_deref(), Some("8:0"));
        assert_eq!(c.defaults.cpu_percent, 100);
        assert_eq!(c.defaults.memory_mb, 512);
        // Unset keys keep their defaults.
        assert_eq!(c.launch_timeout_ms, 10_000);
    }

    #[test]
    fn unknown_keys_rejected() {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(f, "no_such_key = 1").expect("write config");
        assert!(Config::load(Some(f.path().to_str().unwrap())).is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(Config::load(Some("/nonexistent/jobward.toml")).is_err());
    }
}
