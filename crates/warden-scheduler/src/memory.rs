//! In-memory [`ScheduleStore`] for tests and ephemeral runs.
//!
//! Mirrors the SQLite store's semantics, including the (subject, job type)
//! uniqueness rule and cascading history deletes. [`MemoryStore::set_unavailable`]
//! makes every call fail with `StoreUnavailable`.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use warden_core::ScheduleId;

use crate::{
    error::{Result, SchedulerError},
    store::ScheduleStore,
    types::{ExecutionRecord, ScheduleConfig},
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    schedules: BTreeMap<ScheduleId, ScheduleConfig>,
    executions: Vec<ExecutionRecord>,
    next_execution_id: i64,
    unavailable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self
            .state
            .lock()
            .map_err(|_| {
                SchedulerError::StoreUnavailable("memory store lock poisoned".to_string())
            })?;
        if state.unavailable {
            return Err(SchedulerError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(state)
    }
}

impl ScheduleStore for MemoryStore {
    fn insert(&self, config: &ScheduleConfig) -> Result<()> {
        let mut state = self.lock()?;
        let clash = state.schedules.contains_key(&config.id)
            || state
                .schedules
                .values()
                .any(|s| s.subject_id == config.subject_id && s.job_type == config.job_type);
        if clash {
            return Err(SchedulerError::DuplicateJob {
                key: format!("{}/{}", config.subject_id, config.job_type),
            });
        }
        state.schedules.insert(config.id.clone(), config.clone());
        Ok(())
    }

    fn get(&self, id: &ScheduleId) -> Result<Option<ScheduleConfig>> {
        Ok(self.lock()?.schedules.get(id).cloned())
    }

    fn find(&self, subject_id: &str, job_type: &str) -> Result<Option<ScheduleConfig>> {
        Ok(self
            .lock()?
            .schedules
            .values()
            .find(|s| s.subject_id == subject_id && s.job_type == job_type)
            .cloned())
    }

    fn list(&self) -> Result<Vec<ScheduleConfig>> {
        let mut all: Vec<_> = self.lock()?.schedules.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn list_enabled(&self) -> Result<Vec<ScheduleConfig>> {
        let mut all = self.list()?;
        all.retain(|s| s.enabled);
        Ok(all)
    }

    fn update(&self, config: &ScheduleConfig) -> Result<()> {
        let mut state = self.lock()?;
        let existing = state
            .schedules
            .get_mut(&config.id)
            .ok_or_else(|| SchedulerError::not_found(&config.id))?;
        existing.interval_hours = config.interval_hours;
        existing.active_hours = config.active_hours;
        existing.enabled = config.enabled;
        existing.next_run = config.next_run;
        existing.updated_at = config.updated_at;
        Ok(())
    }

    fn set_next_run(&self, id: &ScheduleId, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.lock()?;
        let existing = state
            .schedules
            .get_mut(id)
            .ok_or_else(|| SchedulerError::not_found(id))?;
        existing.next_run = next_run;
        Ok(())
    }

    fn delete(&self, id: &ScheduleId) -> Result<bool> {
        let mut state = self.lock()?;
        state.executions.retain(|r| &r.schedule_id != id);
        Ok(state.schedules.remove(id).is_some())
    }

    fn record_execution(
        &self,
        record: &ExecutionRecord,
        next_run: DateTime<Utc>,
    ) -> Result<ScheduleConfig> {
        let completed_at = record.completed_at.ok_or_else(|| SchedulerError::Corrupt {
            id: record.schedule_id.to_string(),
            reason: "execution record has no completion time".to_string(),
        })?;

        let mut state = self.lock()?;
        let state = &mut *state;
        let schedule = state
            .schedules
            .get_mut(&record.schedule_id)
            .ok_or_else(|| SchedulerError::not_found(&record.schedule_id))?;

        schedule.last_run = Some(completed_at);
        schedule.next_run = schedule.enabled.then_some(next_run);
        schedule.consecutive_failures = if record.success {
            0
        } else {
            schedule.consecutive_failures.saturating_add(1)
        };
        schedule.updated_at = completed_at;
        let updated = schedule.clone();

        state.next_execution_id += 1;
        let mut stored = record.clone();
        stored.id = Some(state.next_execution_id);
        state.executions.push(stored);

        Ok(updated)
    }

    fn history(&self, id: &ScheduleId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let state = self.lock()?;
        let mut records: Vec<_> = state
            .executions
            .iter()
            .filter(|r| &r.schedule_id == id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }
}
