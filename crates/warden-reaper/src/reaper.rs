//! `ProcessReaper`: periodic sweep over managed OS processes.
//!
//! A process is killed when it is not owned by any registered execution
//! (orphan) or when it is owned but older than the configured lifetime
//! (hung task). Young, owned processes are never touched. Per-process
//! failures are logged and counted; they never abort a sweep.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use warden_core::config::ReaperConfig;

use crate::{
    enumerator::ProcessEnumerator,
    registry::ProcessRegistry,
    types::{ProcessInfo, ReapCandidate, ReapReason, Signal, SweepReport},
};

/// Tunables for keep/kill decisions.
#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub max_lifetime: chrono::Duration,
    pub orphan_grace: chrono::Duration,
    pub terminate_grace: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self::from(&ReaperConfig::default())
    }
}

impl From<&ReaperConfig> for ReaperSettings {
    fn from(config: &ReaperConfig) -> Self {
        Self {
            max_lifetime: chrono::Duration::seconds(config.max_lifetime_secs as i64),
            orphan_grace: chrono::Duration::seconds(config.orphan_grace_secs as i64),
            terminate_grace: config.terminate_grace(),
        }
    }
}

/// Decide the fate of one process.
///
/// A process is owned when its PID, or the PID of any ancestor, is
/// registered. `honor_grace = false` drops the orphan grace (shutdown).
pub fn classify(
    info: &ProcessInfo,
    registered: &HashSet<u32>,
    now: DateTime<Utc>,
    settings: &ReaperSettings,
    honor_grace: bool,
) -> Option<ReapReason> {
    let age = info.age(now);
    let owned = registered.contains(&info.pid)
        || info.ancestors.iter().any(|pid| registered.contains(pid));

    if !owned {
        if honor_grace && age < settings.orphan_grace {
            return None;
        }
        return Some(ReapReason::Orphan);
    }
    if age > settings.max_lifetime {
        return Some(ReapReason::OverAge);
    }
    None
}

pub struct ProcessReaper {
    registry: Arc<ProcessRegistry>,
    enumerator: Arc<dyn ProcessEnumerator>,
    settings: ReaperSettings,
}

impl ProcessReaper {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        enumerator: Arc<dyn ProcessEnumerator>,
        settings: ReaperSettings,
    ) -> Self {
        Self {
            registry,
            enumerator,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// One sweep at the current wall-clock time.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now(), false)
    }

    /// Report what a sweep would kill, without signalling anything.
    pub fn dry_run(&self) -> SweepReport {
        self.sweep_at(Utc::now(), true)
    }

    pub fn sweep_at(&self, now: DateTime<Utc>, dry_run: bool) -> SweepReport {
        self.sweep_inner(now, dry_run, true)
    }

    fn sweep_inner(&self, now: DateTime<Utc>, dry_run: bool, honor_grace: bool) -> SweepReport {
        let mut report = SweepReport::default();

        let processes = match self.enumerator.matching() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "process enumeration failed; sweep skipped");
                report.errors += 1;
                return report;
            }
        };
        // Read the registry after the process table: a process registered in
        // between is then seen as owned rather than orphaned.
        let registered = self.registry.registered_pids();

        for info in processes {
            report.examined += 1;
            let Some(reason) = classify(&info, &registered, now, &self.settings, honor_grace)
            else {
                continue;
            };

            let age_secs = info.age(now).num_seconds();
            match reason {
                ReapReason::Orphan => report.orphans += 1,
                ReapReason::OverAge => report.over_age += 1,
            }
            report.candidates.push(ReapCandidate {
                pid: info.pid,
                name: info.name.clone(),
                age_secs,
                reason,
            });

            if dry_run {
                continue;
            }

            match self.enumerator.signal(info.pid, Signal::Kill) {
                Ok(()) => {
                    report.killed += 1;
                    info!(pid = info.pid, name = %info.name, age_secs, %reason, "reaped process");
                }
                Err(e) if e.is_gone() => {
                    debug!(pid = info.pid, "process exited before it could be reaped");
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(pid = info.pid, error = %e, "failed to reap process");
                }
            }
        }

        report
    }

    /// Shutdown cleanup: SIGTERM every registered process, release its slot,
    /// wait the terminate grace, then sweep without the orphan grace so
    /// nothing survives.
    pub async fn force_cleanup_all(&self) -> SweepReport {
        let entries = self.registry.snapshot();
        let mut terminated = 0usize;

        for entry in entries {
            if let Some(pid) = entry.pid {
                match self.enumerator.signal(pid, Signal::Terminate) {
                    Ok(()) => terminated += 1,
                    Err(e) if e.is_gone() => {}
                    Err(e) => warn!(pid, error = %e, "graceful terminate failed"),
                }
            }
            self.registry.unregister(&entry.session_id);
        }

        if terminated > 0 {
            info!(count = terminated, "terminate sent to registered processes");
            tokio::time::sleep(self.settings.terminate_grace).await;
        }

        let report = self.sweep_inner(Utc::now(), false, false);
        info!(
            killed = report.killed,
            errors = report.errors,
            "forced process cleanup complete"
        );
        report
    }

    /// Sweep every `interval` until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "process reaper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // sysinfo refreshes block; keep them off the async workers.
                    let reaper = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || reaper.sweep()).await {
                        Ok(report) if report.killed > 0 || report.errors > 0 => info!(
                            examined = report.examined,
                            killed = report.killed,
                            errors = report.errors,
                            "reaper sweep"
                        ),
                        Ok(report) => debug!(examined = report.examined, "reaper sweep"),
                        Err(e) => error!("reaper sweep task failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("process reaper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
