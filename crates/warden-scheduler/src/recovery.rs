//! `RecoveryManager`: rebuilds the in-memory scheduler from the store.
//!
//! `recover` runs once at startup; `reconcile` runs periodically so edits
//! made by another process (the CLI) reach a running daemon. Neither ever
//! fires a backlog: a `next_run` further in the past than the misfire grace
//! is moved to the next future slot, leaving `last_run` and history alone.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use warden_core::ScheduleId;

use crate::{
    engine::JobScheduler,
    error::{Result, SchedulerError},
    store::ScheduleStore,
    trigger::next_run_for,
    types::{JobHandle, ScheduleConfig},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Handles added.
    pub registered: usize,
    /// Schedules whose missing or stale `next_run` was recomputed.
    pub repaired: usize,
    /// Handles dropped because their row was removed or disabled.
    pub removed: usize,
    /// Handles whose trigger was edited in the store.
    pub rescheduled: usize,
    /// Rows that could not be registered.
    pub failed: usize,
}

pub struct RecoveryManager {
    store: Arc<dyn ScheduleStore>,
    scheduler: Arc<JobScheduler>,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn ScheduleStore>, scheduler: Arc<JobScheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Register every enabled schedule.
    pub fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for config in self.store.list_enabled()? {
            self.register_one(config, now, &mut report);
        }
        info!(
            registered = report.registered,
            repaired = report.repaired,
            failed = report.failed,
            "schedules recovered"
        );
        Ok(report)
    }

    /// Bring the live handles in line with the store.
    pub fn reconcile(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        // handles first: one registered after this snapshot is never dropped
        let live = self.scheduler.handles();
        let enabled = self.store.list_enabled()?;
        Ok(self.reconcile_snapshot(live, enabled, now))
    }

    /// Drop the `live` handles missing from `enabled`, then register or
    /// reschedule every row of `enabled`.
    fn reconcile_snapshot(
        &self,
        live: Vec<JobHandle>,
        enabled: Vec<ScheduleConfig>,
        now: DateTime<Utc>,
    ) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let wanted: HashSet<&ScheduleId> = enabled.iter().map(|c| &c.id).collect();

        for handle in live {
            if !wanted.contains(&handle.schedule_id)
                && self.scheduler.unregister(&handle.schedule_id)
            {
                report.removed += 1;
            }
        }

        for config in &enabled {
            match self.scheduler.handle(&config.id) {
                None => self.register_one(config.clone(), now, &mut report),
                Some(handle) if handle.trigger != config.trigger() => {
                    match self.scheduler.reschedule(config) {
                        Ok(()) => report.rescheduled += 1,
                        Err(e) => {
                            warn!(schedule_id = %config.id, error = %e, "reschedule failed");
                            report.failed += 1;
                        }
                    }
                }
                Some(_) => {}
            }
        }

        if report != RecoveryReport::default() {
            info!(
                registered = report.registered,
                removed = report.removed,
                rescheduled = report.rescheduled,
                "schedules reconciled with store"
            );
        }
        report
    }

    fn register_one(
        &self,
        mut config: ScheduleConfig,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) {
        let stale = match config.next_run {
            None => true,
            Some(next) => now - next > self.scheduler.misfire_grace(),
        };
        if stale {
            match next_run_for(&config, now) {
                Ok(next) => {
                    debug!(
                        schedule_id = %config.id,
                        previous = ?config.next_run,
                        %next,
                        "next run repaired"
                    );
                    if let Err(e) = self.store.set_next_run(&config.id, Some(next)) {
                        warn!(
                            schedule_id = %config.id,
                            error = %e,
                            "could not persist repaired next run"
                        );
                    }
                    config.next_run = Some(next);
                    report.repaired += 1;
                }
                Err(e) => {
                    warn!(
                        schedule_id = %config.id,
                        error = %e,
                        "skipping schedule with invalid trigger"
                    );
                    report.failed += 1;
                    return;
                }
            }
        }

        match self.scheduler.register(&config) {
            Ok(()) => report.registered += 1,
            Err(SchedulerError::DuplicateJob { .. }) => {}
            Err(e) => {
                warn!(schedule_id = %config.id, error = %e, "could not register schedule");
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        history::HistoryRecorder,
        memory::MemoryStore,
        runner::{ExecutionRunner, TaskRouter},
        types::{ActiveHours, ExecutionRecord, TriggerType},
    };
    use chrono::{Duration, TimeZone};
    use warden_reaper::ProcessRegistry;

    fn t(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    fn setup(now: DateTime<Utc>) -> (Arc<MemoryStore>, Arc<JobScheduler>, RecoveryManager) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let runner = Arc::new(ExecutionRunner::new(
            TaskRouter::new(),
            Arc::new(ProcessRegistry::new()),
            clock.clone(),
            std::time::Duration::from_secs(60),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            runner,
            Arc::new(HistoryRecorder::new(store.clone(), 5)),
            clock,
            std::time::Duration::from_secs(900),
            None,
        ));
        let recovery = RecoveryManager::new(store.clone(), scheduler.clone());
        (store, scheduler, recovery)
    }

    fn schedule(
        subject: &str,
        next_run: Option<DateTime<Utc>>,
        last_run: Option<DateTime<Utc>>,
    ) -> ScheduleConfig {
        ScheduleConfig {
            id: ScheduleId::new(),
            subject_id: subject.to_string(),
            job_type: "scrape".to_string(),
            interval_hours: 1.0,
            active_hours: None,
            enabled: true,
            last_run,
            next_run,
            consecutive_failures: 0,
            created_at: t(1, 0, 0),
            updated_at: t(1, 0, 0),
        }
    }

    #[test]
    fn future_next_run_is_kept() {
        let now = t(1, 10, 0);
        let (store, scheduler, recovery) = setup(now);
        let config = schedule("a", Some(t(1, 10, 40)), Some(t(1, 9, 40)));
        store.insert(&config).unwrap();

        let report = recovery.recover(now).unwrap();
        assert_eq!(report.registered, 1);
        assert_eq!(report.repaired, 0);
        assert_eq!(scheduler.handle(&config.id).unwrap().next_fire_time, t(1, 10, 40));
    }

    #[test]
    fn stale_next_run_jumps_to_next_slot_without_touching_history() {
        let now = t(1, 14, 10);
        let (store, scheduler, recovery) = setup(now);
        // Down since 09:40; the hourly cadence anchored on 09:40 resumes at 14:40.
        let config = schedule("a", Some(t(1, 10, 40)), Some(t(1, 9, 40)));
        store.insert(&config).unwrap();

        let report = recovery.recover(now).unwrap();
        assert_eq!(report.repaired, 1);
        let stored = store.get(&config.id).unwrap().unwrap();
        assert_eq!(stored.next_run, Some(t(1, 14, 40)));
        assert_eq!(stored.last_run, Some(t(1, 9, 40)));
        assert!(store.history(&config.id, 10).unwrap().is_empty());
        assert_eq!(scheduler.handle(&config.id).unwrap().next_fire_time, t(1, 14, 40));
        // Nothing is due right away: no backlog storm.
        assert!(scheduler.handles().iter().all(|h| h.next_fire_time > now));
    }

    #[test]
    fn missing_next_run_is_computed() {
        let now = t(1, 10, 0);
        let (store, scheduler, recovery) = setup(now);
        let mut config = schedule("a", None, None);
        config.active_hours = Some(ActiveHours::new(6, 9));
        store.insert(&config).unwrap();

        recovery.recover(now).unwrap();
        assert_eq!(scheduler.handle(&config.id).unwrap().next_fire_time, t(2, 6, 0));
    }

    #[test]
    fn disabled_rows_are_not_registered() {
        let now = t(1, 10, 0);
        let (store, scheduler, recovery) = setup(now);
        let mut config = schedule("a", None, None);
        config.enabled = false;
        store.insert(&config).unwrap();

        assert_eq!(recovery.recover(now).unwrap().registered, 0);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn recover_matches_uninterrupted_next_run() {
        let restart = t(1, 10, 30);
        let (store, _scheduler, recovery) = setup(restart);
        let config = schedule("a", Some(t(1, 10, 0)), None);
        store.insert(&config).unwrap();
        let completed = t(1, 10, 2);
        let record = ExecutionRecord {
            id: None,
            schedule_id: config.id.clone(),
            started_at: t(1, 10, 0),
            completed_at: Some(completed),
            success: true,
            items_processed: 3,
            error_message: None,
            trigger_type: TriggerType::Scheduled,
        };
        let uninterrupted = completed + Duration::hours(1);
        store.record_execution(&record, uninterrupted).unwrap();

        // Restart shortly after: the stored value survives as-is.
        recovery.recover(restart).unwrap();
        assert_eq!(store.get(&config.id).unwrap().unwrap().next_run, Some(uninterrupted));
    }

    #[test]
    fn reconcile_follows_store_edits() {
        let now = t(1, 10, 0);
        let (store, scheduler, recovery) = setup(now);
        let kept = schedule("kept", Some(t(1, 11, 0)), None);
        let dropped = schedule("dropped", Some(t(1, 11, 0)), None);
        store.insert(&kept).unwrap();
        store.insert(&dropped).unwrap();
        recovery.recover(now).unwrap();

        store.delete(&dropped.id).unwrap();
        let added = schedule("added", Some(t(1, 12, 0)), None);
        store.insert(&added).unwrap();
        let mut edited = kept.clone();
        edited.interval_hours = 2.0;
        edited.next_run = Some(t(1, 12, 0));
        store.update(&edited).unwrap();

        let report = recovery.reconcile(now).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.registered, 1);
        assert_eq!(report.rescheduled, 1);
        assert!(!scheduler.contains(&dropped.id));
        assert!(scheduler.contains(&added.id));
        let handle = scheduler.handle(&kept.id).unwrap();
        assert_eq!(handle.trigger.interval_hours, 2.0);
        assert_eq!(handle.next_fire_time, t(1, 12, 0));

        // A second pass is a no-op.
        assert_eq!(recovery.reconcile(now).unwrap(), RecoveryReport::default());
    }

    #[test]
    fn schedule_added_during_reconcile_keeps_its_handle() {
        let now = t(1, 10, 0);
        let (store, scheduler, recovery) = setup(now);
        let live = scheduler.handles();
        let enabled = store.list_enabled().unwrap();

        // added by the service after both snapshots were taken
        let added = schedule("added", Some(t(1, 11, 0)), None);
        store.insert(&added).unwrap();
        scheduler.register(&added).unwrap();

        let report = recovery.reconcile_snapshot(live, enabled, now);
        assert_eq!(report.removed, 0);
        assert!(scheduler.contains(&added.id));

        // the next pass sees it in the store and leaves it alone
        assert_eq!(recovery.reconcile(now).unwrap(), RecoveryReport::default());
        assert!(scheduler.contains(&added.id));
    }
}
