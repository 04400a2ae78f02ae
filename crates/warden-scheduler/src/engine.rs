//! `JobScheduler`: live set of job handles, due-checks and dispatch.
//!
//! Each due handle is dispatched onto its own task so a long execution never
//! delays other schedules. At most one execution per schedule is in flight:
//! the in-flight set is checked and updated under the same lock as the due
//! check, and an id only leaves it after its outcome has been recorded.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use warden_core::ScheduleId;

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    history::HistoryRecorder,
    runner::ExecutionRunner,
    trigger::next_run_for,
    types::{JobHandle, ScheduleConfig, SchedulerEvent, Trigger, TriggerType},
};

#[derive(Default)]
struct State {
    handles: HashMap<ScheduleId, JobHandle>,
    /// Survives unregister/register so a re-added schedule cannot overlap a
    /// run that is still finishing.
    in_flight: HashSet<ScheduleId>,
}

/// One execution selected by a tick.
#[derive(Debug, Clone)]
struct Dispatch {
    schedule_id: ScheduleId,
    subject_id: String,
    job_type: String,
    trigger: Trigger,
    trigger_type: TriggerType,
    /// Manual run that did not coincide with a due regular slot.
    manual_only: bool,
}

pub struct JobScheduler {
    state: Mutex<State>,
    runner: Arc<ExecutionRunner>,
    recorder: Arc<HistoryRecorder>,
    clock: Arc<dyn Clock>,
    misfire_grace: chrono::Duration,
    events: Option<mpsc::Sender<SchedulerEvent>>,
    tracker: TaskTracker,
}

impl JobScheduler {
    /// Pass `Some(tx)` to receive [`SchedulerEvent`]s. Sends use `try_send`,
    /// so a slow consumer loses events instead of stalling the scheduler.
    pub fn new(
        runner: Arc<ExecutionRunner>,
        recorder: Arc<HistoryRecorder>,
        clock: Arc<dyn Clock>,
        misfire_grace: Duration,
        events: Option<mpsc::Sender<SchedulerEvent>>,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            runner,
            recorder,
            clock,
            misfire_grace: chrono::Duration::from_std(misfire_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX))),
            events,
            tracker: TaskTracker::new(),
        }
    }

    pub fn runner(&self) -> &Arc<ExecutionRunner> {
        &self.runner
    }

    pub fn misfire_grace(&self) -> chrono::Duration {
        self.misfire_grace
    }

    // --- handle management -------------------------------------------------

    /// Add a handle for `config`. Its first fire time is the stored
    /// `next_run`, or one computed from `last_run` when there is none.
    pub fn register(&self, config: &ScheduleConfig) -> Result<()> {
        let trigger = config.trigger();
        trigger.validate()?;
        let next_fire_time = match config.next_run {
            Some(next) => next,
            None => next_run_for(config, self.clock.now())?,
        };

        let mut state = self.lock();
        if state.handles.contains_key(&config.id) {
            return Err(SchedulerError::DuplicateJob {
                key: config.id.to_string(),
            });
        }
        let running = state.in_flight.contains(&config.id);
        state.handles.insert(
            config.id.clone(),
            JobHandle {
                schedule_id: config.id.clone(),
                subject_id: config.subject_id.clone(),
                job_type: config.job_type.clone(),
                trigger,
                next_fire_time,
                paused: false,
                running,
                manual_pending: false,
            },
        );
        info!(schedule_id = %config.id, next_fire = %next_fire_time, "job registered");
        Ok(())
    }

    /// Drop the handle. Idempotent; an in-flight execution finishes normally.
    pub fn unregister(&self, id: &ScheduleId) -> bool {
        let removed = self.lock().handles.remove(id).is_some();
        if removed {
            info!(schedule_id = %id, "job unregistered");
        }
        removed
    }

    /// Replace trigger and next fire time after a schedule edit. The
    /// in-flight flag and pending manual run are kept.
    pub fn reschedule(&self, config: &ScheduleConfig) -> Result<()> {
        let trigger = config.trigger();
        trigger.validate()?;
        let next_fire_time = match config.next_run {
            Some(next) => next,
            None => next_run_for(config, self.clock.now())?,
        };
        let mut state = self.lock();
        let handle = state
            .handles
            .get_mut(&config.id)
            .ok_or_else(|| SchedulerError::not_found(&config.id))?;
        handle.trigger = trigger;
        handle.next_fire_time = next_fire_time;
        debug!(schedule_id = %config.id, next_fire = %next_fire_time, "job rescheduled");
        Ok(())
    }

    /// Skip regular fires until [`resume`](Self::resume). The fire time is kept.
    pub fn pause(&self, id: &ScheduleId) -> Result<()> {
        self.with_handle(id, |h| h.paused = true)?;
        info!(schedule_id = %id, "job paused");
        Ok(())
    }

    pub fn resume(&self, id: &ScheduleId) -> Result<()> {
        self.with_handle(id, |h| h.paused = false)?;
        info!(schedule_id = %id, "job resumed");
        Ok(())
    }

    /// Queue one manual run for the next tick. While an execution is in
    /// flight the request waits for it; repeated requests collapse into one.
    pub fn trigger_now(&self, id: &ScheduleId) -> Result<()> {
        self.with_handle(id, |h| h.manual_pending = true)?;
        info!(schedule_id = %id, "manual run requested");
        Ok(())
    }

    pub fn handle(&self, id: &ScheduleId) -> Option<JobHandle> {
        self.lock().handles.get(id).cloned()
    }

    pub fn handles(&self) -> Vec<JobHandle> {
        let mut handles: Vec<JobHandle> = self.lock().handles.values().cloned().collect();
        handles.sort_by(|a, b| a.next_fire_time.cmp(&b.next_fire_time));
        handles
    }

    pub fn contains(&self, id: &ScheduleId) -> bool {
        self.lock().handles.contains_key(id)
    }

    pub fn is_running(&self, id: &ScheduleId) -> bool {
        self.lock().in_flight.contains(id)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- dispatch ----------------------------------------------------------

    /// Due-check at the current clock time. Returns the number of executions
    /// dispatched.
    pub fn tick(self: &Arc<Self>) -> usize {
        self.tick_at(self.clock.now())
    }

    /// Due-check at `now`.
    ///
    /// A handle is due when it is idle and either a manual run is pending or
    /// it is unpaused with `next_fire_time <= now`. A fire time more than
    /// the misfire grace behind `now` is reported as missed and coalesced
    /// into this single run.
    pub fn tick_at(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let mut dispatches = Vec::new();
        let mut missed = Vec::new();
        {
            let mut guard = self.lock();
            let State { handles, in_flight } = &mut *guard;
            for handle in handles.values_mut() {
                if in_flight.contains(&handle.schedule_id) {
                    continue;
                }
                let regular_due = !handle.paused && handle.next_fire_time <= now;
                if !regular_due && !handle.manual_pending {
                    continue;
                }

                if regular_due {
                    let late_by = now - handle.next_fire_time;
                    if late_by > self.misfire_grace {
                        warn!(
                            schedule_id = %handle.schedule_id,
                            scheduled_for = %handle.next_fire_time,
                            late_by_secs = late_by.num_seconds(),
                            "fire time missed; coalescing into one run"
                        );
                        missed.push(SchedulerEvent::Missed {
                            schedule_id: handle.schedule_id.clone(),
                            scheduled_for: handle.next_fire_time,
                            late_by_secs: late_by.num_seconds(),
                        });
                    }
                }

                let trigger_type = if handle.manual_pending {
                    TriggerType::Manual
                } else {
                    TriggerType::Scheduled
                };
                dispatches.push(Dispatch {
                    schedule_id: handle.schedule_id.clone(),
                    subject_id: handle.subject_id.clone(),
                    job_type: handle.job_type.clone(),
                    trigger: handle.trigger,
                    trigger_type,
                    manual_only: !regular_due,
                });
                handle.manual_pending = false;
                handle.running = true;
                in_flight.insert(handle.schedule_id.clone());
            }
        }

        for event in missed {
            self.emit(event);
        }

        let count = dispatches.len();
        for dispatch in dispatches {
            let scheduler = Arc::clone(self);
            self.tracker.spawn(async move { scheduler.execute(dispatch).await });
        }
        count
    }

    async fn execute(self: Arc<Self>, dispatch: Dispatch) {
        let _in_flight = InFlightGuard {
            scheduler: &*self,
            id: dispatch.schedule_id.clone(),
        };

        let record = self
            .runner
            .run(
                &dispatch.schedule_id,
                &dispatch.subject_id,
                &dispatch.job_type,
                dispatch.trigger_type,
            )
            .await;
        let completed_at = record.completed_at.unwrap_or(record.started_at);

        // The schedule may have been edited while the execution ran.
        let (trigger, kept_slot) = match self.handle(&dispatch.schedule_id) {
            Some(h) => (h.trigger, dispatch.manual_only.then_some(h.next_fire_time)),
            None => (dispatch.trigger, None),
        };
        let next_run = match HistoryRecorder::next_run_after(&trigger, completed_at, kept_slot) {
            Ok(next) => next,
            Err(e) => {
                error!(
                    schedule_id = %dispatch.schedule_id,
                    error = %e,
                    "next run computation failed"
                );
                completed_at
                    .checked_add_signed(trigger.period())
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        };

        match self.recorder.record(&record, next_run) {
            Ok(recorded) => {
                if recorded.escalated {
                    self.emit(SchedulerEvent::Escalated {
                        schedule_id: dispatch.schedule_id.clone(),
                        consecutive_failures: recorded.config.consecutive_failures,
                    });
                }
            }
            Err(e) => {
                error!(
                    schedule_id = %dispatch.schedule_id,
                    error = %e,
                    "failed to record execution; continuing with in-memory schedule"
                );
                self.emit(SchedulerEvent::RecordFailed {
                    schedule_id: dispatch.schedule_id.clone(),
                    error: e.to_string(),
                });
            }
        }

        let still_registered = self
            .with_handle(&dispatch.schedule_id, |h| h.next_fire_time = next_run)
            .is_ok();

        self.emit(SchedulerEvent::Executed {
            schedule_id: dispatch.schedule_id.clone(),
            trigger_type: dispatch.trigger_type,
            success: record.success,
            items_processed: record.items_processed,
            duration_ms: record.duration().map_or(0, |d| d.num_milliseconds()),
            error: record.error_message.clone(),
            next_run: still_registered.then_some(next_run),
        });
    }

    /// Stop accepting new dispatches and wait up to `timeout` for in-flight
    /// executions. Returns `true` when everything finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let finished = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        self.tracker.reopen();
        if !finished {
            warn!(
                remaining = self.in_flight(),
                "in-flight executions still running after drain timeout"
            );
        }
        finished
    }

    // --- private helpers ---------------------------------------------------

    fn with_handle(&self, id: &ScheduleId, f: impl FnOnce(&mut JobHandle)) -> Result<()> {
        let mut state = self.lock();
        let handle = state
            .handles
            .get_mut(id)
            .ok_or_else(|| SchedulerError::not_found(id))?;
        f(handle);
        Ok(())
    }

    fn finish(&self, id: &ScheduleId) {
        let mut state = self.lock();
        state.in_flight.remove(id);
        if let Some(handle) = state.handles.get_mut(id) {
            handle.running = false;
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(ref tx) = self.events {
            if tx.try_send(event).is_err() {
                warn!("scheduler event channel full or closed; event dropped");
            }
        }
    }

    // Every critical section is a handful of map operations, so the state is
    // consistent even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the in-flight mark on every exit path of an execution.
struct InFlightGuard<'a> {
    scheduler: &'a JobScheduler,
    id: ScheduleId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.finish(&self.id);
    }
}
