//! `SchedulerService`: the control surface and the coordinator loop.
//!
//! Constructed once at startup and shared by reference. Every mutation goes
//! to the store first and is then mirrored into the live [`JobScheduler`];
//! a store failure is returned to the caller and leaves memory untouched.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use warden_core::{config::SchedulerConfig, ScheduleId};

use crate::{
    clock::Clock,
    engine::JobScheduler,
    error::{Result, SchedulerError},
    history::HistoryRecorder,
    recovery::{RecoveryManager, RecoveryReport},
    runner::ExecutionRunner,
    store::ScheduleStore,
    trigger::{compute_next_run, next_run_for},
    types::{
        DerivedStatus, ExecutionRecord, NewSchedule, ScheduleConfig, ScheduleStatus,
        ScheduleUpdate, SchedulerEvent,
    },
};

/// How long shutdown waits for cancelled executions to wind down.
const CANCEL_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub misfire_grace: Duration,
    pub failure_threshold: u32,
    pub sync_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            misfire_grace: config.misfire_grace(),
            failure_threshold: config.failure_threshold,
            sync_interval: config.sync_interval(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

pub struct SchedulerService {
    store: Arc<dyn ScheduleStore>,
    scheduler: Arc<JobScheduler>,
    recovery: RecoveryManager,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl SchedulerService {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        runner: ExecutionRunner,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
        events: Option<mpsc::Sender<SchedulerEvent>>,
    ) -> Self {
        let recorder = Arc::new(HistoryRecorder::new(
            Arc::clone(&store),
            settings.failure_threshold,
        ));
        let scheduler = Arc::new(JobScheduler::new(
            Arc::new(runner),
            recorder,
            Arc::clone(&clock),
            settings.misfire_grace,
            events,
        ));
        let recovery = RecoveryManager::new(Arc::clone(&store), Arc::clone(&scheduler));
        Self {
            store,
            scheduler,
            recovery,
            clock,
            settings,
        }
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Register every enabled schedule from the store. Call once before
    /// [`run`](Self::run).
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.recovery.recover(self.clock.now())
    }

    // --- control surface ---------------------------------------------------

    /// Create a schedule. The first run is one interval (or the next window
    /// hour) from now.
    #[instrument(skip(self, new), fields(subject_id = %new.subject_id, job_type = %new.job_type))]
    pub fn add_schedule(&self, new: NewSchedule) -> Result<ScheduleId> {
        if new.subject_id.trim().is_empty() || new.job_type.trim().is_empty() {
            return Err(SchedulerError::InvalidScheduleConfig(
                "subject_id and job_type must not be empty".to_string(),
            ));
        }
        let trigger = new.trigger();
        trigger.validate()?;

        let now = self.clock.now();
        let next_run = if new.enabled {
            Some(compute_next_run(&trigger, None, now)?)
        } else {
            None
        };
        let config = ScheduleConfig {
            id: ScheduleId::new(),
            subject_id: new.subject_id,
            job_type: new.job_type,
            interval_hours: new.interval_hours,
            active_hours: new.active_hours,
            enabled: new.enabled,
            last_run: None,
            next_run,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&config)?;
        if config.enabled {
            self.register_live(&config);
        }
        info!(schedule_id = %config.id, next_run = ?config.next_run, "schedule added");
        Ok(config.id)
    }

    /// Apply a partial update. Disabling clears `next_run`; enabling or
    /// changing the trigger recomputes it.
    #[instrument(skip(self, update))]
    pub fn update_schedule(
        &self,
        id: &ScheduleId,
        update: ScheduleUpdate,
    ) -> Result<ScheduleConfig> {
        let mut config = self.store.get(id)?.ok_or_else(|| SchedulerError::not_found(id))?;
        if update.is_empty() {
            return Ok(config);
        }

        let was_enabled = config.enabled;
        let old_trigger = config.trigger();
        if let Some(interval_hours) = update.interval_hours {
            config.interval_hours = interval_hours;
        }
        if let Some(active_hours) = update.active_hours {
            config.active_hours = active_hours;
        }
        if let Some(enabled) = update.enabled {
            config.enabled = enabled;
        }
        config.trigger().validate()?;

        let now = self.clock.now();
        config.next_run = match (was_enabled, config.enabled) {
            (_, false) => None,
            (false, true) => Some(compute_next_run(&config.trigger(), None, now)?),
            (true, true) if config.trigger() != old_trigger || config.next_run.is_none() => {
                Some(next_run_for(&config, now)?)
            }
            (true, true) => config.next_run,
        };
        config.updated_at = now;
        self.store.update(&config)?;

        if config.enabled {
            if self.scheduler.contains(id) {
                self.scheduler.reschedule(&config)?;
            } else {
                self.register_live(&config);
            }
        } else {
            self.scheduler.unregister(id);
        }
        info!(
            schedule_id = %id,
            enabled = config.enabled,
            next_run = ?config.next_run,
            "schedule updated"
        );
        Ok(config)
    }

    /// Delete a schedule, its history and its handle. `false` when it did
    /// not exist.
    #[instrument(skip(self))]
    pub fn remove_schedule(&self, id: &ScheduleId) -> Result<bool> {
        let deleted = self.store.delete(id)?;
        self.scheduler.unregister(id);
        if !deleted {
            debug!(schedule_id = %id, "remove: no such schedule");
        }
        Ok(deleted)
    }

    /// Run the schedule once as soon as it is idle. The regular cadence is
    /// unaffected.
    #[instrument(skip(self))]
    pub fn trigger_now(&self, id: &ScheduleId) -> Result<()> {
        self.scheduler.trigger_now(id)
    }

    /// Suspend regular fires in memory only; disable the schedule to make
    /// it durable.
    #[instrument(skip(self))]
    pub fn pause(&self, id: &ScheduleId) -> Result<()> {
        self.scheduler.pause(id)
    }

    #[instrument(skip(self))]
    pub fn resume(&self, id: &ScheduleId) -> Result<()> {
        self.scheduler.resume(id)
    }

    pub fn get_status(&self, id: &ScheduleId) -> Result<ScheduleStatus> {
        let config = self.store.get(id)?.ok_or_else(|| SchedulerError::not_found(id))?;
        Ok(self.status_of(config))
    }

    pub fn list_schedules(&self) -> Result<Vec<ScheduleStatus>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|config| self.status_of(config))
            .collect())
    }

    /// Executions of `id`, most recent first.
    pub fn list_history(&self, id: &ScheduleId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        if self.store.get(id)?.is_none() {
            return Err(SchedulerError::not_found(id));
        }
        self.store.history(id, limit)
    }

    // --- coordinator -------------------------------------------------------

    /// Tick and reconcile until `shutdown` broadcasts `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.settings.tick_interval.as_secs(),
            handles = self.scheduler.len(),
            "scheduler coordinator started"
        );
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync = tokio::time::interval(self.settings.sync_interval);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Recovery just ran; the first reconciliation can wait a full period.
        sync.reset();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dispatched = self.scheduler.tick();
                    if dispatched > 0 {
                        debug!(dispatched, "executions dispatched");
                    }
                }
                _ = sync.tick() => {
                    if let Err(e) = self.recovery.reconcile(self.clock.now()) {
                        warn!(error = %e, "store reconciliation failed; keeping current handles");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler coordinator shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Wait up to the shutdown grace for in-flight executions, then cancel
    /// whatever is left. Returns `true` when every execution was recorded.
    pub async fn shutdown(&self) -> bool {
        let in_flight = self.scheduler.in_flight();
        if in_flight > 0 {
            info!(
                in_flight,
                grace_secs = self.settings.shutdown_grace.as_secs(),
                "waiting for in-flight executions"
            );
        }
        if self.scheduler.drain(self.settings.shutdown_grace).await {
            return true;
        }
        warn!("shutdown grace elapsed; cancelling remaining executions");
        self.scheduler.runner().cancel_all();
        self.scheduler.drain(CANCEL_WAIT).await
    }

    // --- private helpers ---------------------------------------------------

    fn register_live(&self, config: &ScheduleConfig) {
        match self.scheduler.register(config) {
            Ok(()) | Err(SchedulerError::DuplicateJob { .. }) => {}
            // The row is persisted; the next reconciliation retries.
            Err(e) => warn!(schedule_id = %config.id, error = %e, "could not register schedule"),
        }
    }

    fn status_of(&self, config: ScheduleConfig) -> ScheduleStatus {
        let handle = self.scheduler.handle(&config.id);
        let paused = handle.as_ref().is_some_and(|h| h.paused);
        let next_run = match handle {
            Some(ref h) if config.enabled => Some(h.next_fire_time),
            _ => config.next_run,
        };
        ScheduleStatus {
            derived_status: DerivedStatus::derive(
                config.enabled,
                paused,
                config.consecutive_failures,
                self.settings.failure_threshold.max(1),
            ),
            running: self.scheduler.is_running(&config.id),
            schedule_id: config.id,
            subject_id: config.subject_id,
            job_type: config.job_type,
            enabled: config.enabled,
            last_run: config.last_run,
            next_run,
            consecutive_failures: config.consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        memory::MemoryStore,
        runner::TaskRouter,
        types::ActiveHours,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use warden_reaper::ProcessRegistry;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn service(now: DateTime<Utc>) -> (SchedulerService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let runner = ExecutionRunner::new(
            TaskRouter::new(),
            Arc::new(ProcessRegistry::new()),
            clock.clone(),
            Duration::from_secs(60),
        );
        let svc = SchedulerService::new(
            Arc::new(MemoryStore::new()),
            runner,
            clock.clone(),
            SchedulerSettings::default(),
            None,
        );
        (svc, clock)
    }

    fn new_schedule(subject: &str) -> NewSchedule {
        NewSchedule {
            subject_id: subject.to_string(),
            job_type: "scrape".to_string(),
            interval_hours: 2.0,
            active_hours: None,
            enabled: true,
        }
    }

    #[test]
    fn add_then_status() {
        let (svc, _) = service(at(1, 10));
        let id = svc.add_schedule(new_schedule("acct")).unwrap();
        let status = svc.get_status(&id).unwrap();
        assert_eq!(status.next_run, Some(at(1, 12)));
        assert_eq!(status.derived_status, DerivedStatus::Active);
        assert!(!status.running);
        assert!(svc.scheduler().contains(&id));
    }

    #[test]
    fn duplicate_and_invalid_schedules_are_rejected() {
        let (svc, _) = service(at(1, 10));
        svc.add_schedule(new_schedule("acct")).unwrap();
        let err = svc.add_schedule(new_schedule("acct")).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_JOB");

        let mut bad = new_schedule("other");
        bad.interval_hours = 0.0;
        assert_eq!(
            svc.add_schedule(bad).unwrap_err().code(),
            "INVALID_SCHEDULE_CONFIG"
        );
        let mut huge = new_schedule("other");
        huge.interval_hours = 1e10;
        assert_eq!(
            svc.add_schedule(huge).unwrap_err().code(),
            "INVALID_SCHEDULE_CONFIG"
        );
        let mut empty_window = new_schedule("other");
        empty_window.active_hours = Some(ActiveHours::new(9, 9));
        assert!(svc.add_schedule(empty_window).is_err());
        assert_eq!(svc.list_schedules().unwrap().len(), 1);
    }

    #[test]
    fn active_hours_status_follows_window() {
        let (svc, _) = service(at(1, 10));
        let mut new = new_schedule("late");
        new.active_hours = Some(ActiveHours::new(6, 9));
        let late = svc.add_schedule(new).unwrap();
        assert_eq!(svc.get_status(&late).unwrap().next_run, Some(at(2, 6)));

        let (svc, _) = service(at(1, 7));
        let mut new = new_schedule("inside");
        new.active_hours = Some(ActiveHours::new(6, 9));
        let inside = svc.add_schedule(new).unwrap();
        assert_eq!(svc.get_status(&inside).unwrap().next_run, Some(at(1, 8)));
    }

    #[test]
    fn disable_and_enable_round_trip() {
        let (svc, clock) = service(at(1, 10));
        let id = svc.add_schedule(new_schedule("acct")).unwrap();

        let disabled = svc
            .update_schedule(
                &id,
                ScheduleUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(disabled.next_run, None);
        assert!(!svc.scheduler().contains(&id));
        assert_eq!(svc.get_status(&id).unwrap().derived_status, DerivedStatus::Paused);
        assert!(matches!(
            svc.trigger_now(&id),
            Err(SchedulerError::JobNotFound { .. })
        ));

        clock.set(at(1, 15));
        let enabled = svc
            .update_schedule(
                &id,
                ScheduleUpdate {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(enabled.next_run, Some(at(1, 17)));
        assert_eq!(svc.scheduler().handle(&id).unwrap().next_fire_time, at(1, 17));
    }

    #[test]
    fn interval_change_reschedules_live_handle() {
        let (svc, _) = service(at(1, 10));
        let id = svc.add_schedule(new_schedule("acct")).unwrap();
        let updated = svc
            .update_schedule(
                &id,
                ScheduleUpdate {
                    interval_hours: Some(4.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.next_run, Some(at(1, 14)));
        assert_eq!(svc.scheduler().handle(&id).unwrap().trigger.interval_hours, 4.0);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (svc, _) = service(at(1, 10));
        let ghost = ScheduleId::new();
        assert!(matches!(svc.get_status(&ghost), Err(SchedulerError::JobNotFound { .. })));
        assert!(matches!(
            svc.update_schedule(
                &ghost,
                ScheduleUpdate {
                    enabled: Some(true),
                    ..Default::default()
                }
            ),
            Err(SchedulerError::JobNotFound { .. })
        ));
        assert!(matches!(svc.list_history(&ghost, 5), Err(SchedulerError::JobNotFound { .. })));
        assert!(!svc.remove_schedule(&ghost).unwrap());
    }

    #[test]
    fn pause_is_reported_but_not_persisted() {
        let (svc, _) = service(at(1, 10));
        let id = svc.add_schedule(new_schedule("acct")).unwrap();
        svc.pause(&id).unwrap();
        let status = svc.get_status(&id).unwrap();
        assert!(status.enabled);
        assert_eq!(status.derived_status, DerivedStatus::Paused);
        svc.resume(&id).unwrap();
        assert_eq!(svc.get_status(&id).unwrap().derived_status, DerivedStatus::Active);
    }

    #[test]
    fn remove_drops_handle_and_row() {
        let (svc, _) = service(at(1, 10));
        let id = svc.add_schedule(new_schedule("acct")).unwrap();
        assert!(svc.remove_schedule(&id).unwrap());
        assert!(!svc.scheduler().contains(&id));
        assert!(svc.list_schedules().unwrap().is_empty());
    }
}
