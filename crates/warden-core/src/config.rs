use std::collections::BTreeMap;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MISFIRE_GRACE_SECS: u64 = 900; // 15 min
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_EVENT_BUFFER: usize = 256;
pub const DEFAULT_MAX_DURATION_SECS: u64 = 30 * 60; // a real browser run
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 30 * 60;
pub const DEFAULT_ORPHAN_GRACE_SECS: u64 = 5;
pub const DEFAULT_TERMINATE_GRACE_SECS: u64 = 5;

/// Top-level config (warden.toml + WARDEN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// Command templates keyed by job type, used by the daemon's task router.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskCommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Coordinator loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two due-checks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// A fire time further in the past than this is a misfire: it is
    /// coalesced into one run (while running) or skipped (on startup).
    #[serde(default = "default_misfire_grace")]
    pub misfire_grace_secs: u64,
    /// Consecutive failures after which a schedule reports `failed`.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds between reconciliations of in-memory handles with the store.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// How long shutdown waits for in-flight executions.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Capacity of the scheduler event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            misfire_grace_secs: DEFAULT_MISFIRE_GRACE_SECS,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn misfire_grace(&self) -> Duration {
        Duration::from_secs(self.misfire_grace_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Upper bound for one execution; the task is cancelled past it.
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
        }
    }
}

impl RunnerConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

/// Process reaper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_reap_interval")]
    pub interval_secs: u64,
    /// Registered processes older than this are considered hung.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,
    /// Unregistered processes younger than this are left for the next sweep.
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_secs: u64,
    /// Wait between SIGTERM and the final sweep on shutdown.
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_secs: u64,
    #[serde(default)]
    pub signature: SignatureConfig,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_REAP_INTERVAL_SECS,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            orphan_grace_secs: DEFAULT_ORPHAN_GRACE_SECS,
            terminate_grace_secs: DEFAULT_TERMINATE_GRACE_SECS,
            signature: SignatureConfig::default(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

/// Which OS processes count as managed.
///
/// A process matches when its executable name contains one of `names`
/// (case-insensitive) and its command line contains every marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    #[serde(default = "default_signature_names")]
    pub names: Vec<String>,
    #[serde(default = "default_cmdline_markers")]
    pub cmdline_markers: Vec<String>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            names: default_signature_names(),
            cmdline_markers: default_cmdline_markers(),
        }
    }
}

/// External command run for one job type.
///
/// `args` may contain `{subject}`, `{session}` and `{job_type}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn bool_true() -> bool {
    true
}
fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_misfire_grace() -> u64 {
    DEFAULT_MISFIRE_GRACE_SECS
}
fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}
fn default_sync_interval() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}
fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}
fn default_max_duration() -> u64 {
    DEFAULT_MAX_DURATION_SECS
}
fn default_reap_interval() -> u64 {
    DEFAULT_REAP_INTERVAL_SECS
}
fn default_max_lifetime() -> u64 {
    DEFAULT_MAX_LIFETIME_SECS
}
fn default_orphan_grace() -> u64 {
    DEFAULT_ORPHAN_GRACE_SECS
}
fn default_terminate_grace() -> u64 {
    DEFAULT_TERMINATE_GRACE_SECS
}
fn default_signature_names() -> Vec<String> {
    vec![
        "chrome".to_string(),
        "chromium".to_string(),
        "headless_shell".to_string(),
    ]
}
fn default_cmdline_markers() -> Vec<String> {
    vec!["--enable-automation".to_string()]
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.warden/warden.db", home)
}

impl WardenConfig {
    /// Load config from a TOML file with WARDEN_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `WARDEN_SCHEDULER__MISFIRE_GRACE_SECS=600`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: WardenConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("WARDEN_").split("__"))
            .extract()
            .map_err(|e| WardenError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall a loop or disable escalation.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("scheduler.tick_interval_secs", self.scheduler.tick_interval_secs),
            ("scheduler.sync_interval_secs", self.scheduler.sync_interval_secs),
            ("runner.max_duration_secs", self.runner.max_duration_secs),
            ("reaper.interval_secs", self.reaper.interval_secs),
            ("reaper.max_lifetime_secs", self.reaper.max_lifetime_secs),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(WardenError::Config(format!("{key} must be > 0")));
            }
        }
        if self.scheduler.failure_threshold == 0 {
            return Err(WardenError::Config(
                "scheduler.failure_threshold must be >= 1".to_string(),
            ));
        }
        if self.scheduler.event_buffer == 0 {
            return Err(WardenError::Config(
                "scheduler.event_buffer must be >= 1".to_string(),
            ));
        }
        for (job_type, task) in &self.tasks {
            if task.program.trim().is_empty() {
                return Err(WardenError::Config(format!(
                    "tasks.{job_type}.program must not be empty"
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.warden/warden.toml", home)
}
