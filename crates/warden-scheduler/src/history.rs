//! `HistoryRecorder`: persists execution outcomes and maintains the
//! failure counter.
//!
//! The next run is computed from the actual completion time so that slow
//! executions do not make the cadence drift.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    error::Result,
    store::ScheduleStore,
    trigger::compute_next_run,
    types::{ExecutionRecord, ScheduleConfig, Trigger},
};

/// Result of a successful [`HistoryRecorder::record`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub config: ScheduleConfig,
    /// The failure counter reached the escalation threshold with this record.
    pub escalated: bool,
}

pub struct HistoryRecorder {
    store: Arc<dyn ScheduleStore>,
    failure_threshold: u32,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn ScheduleStore>, failure_threshold: u32) -> Self {
        Self {
            store,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Next regular slot after an execution that completed at `completed_at`.
    ///
    /// `kept_slot` is the regular slot pending before a manual run; it is
    /// reused when still ahead of the completion time so a manual run does
    /// not shift the cadence.
    pub fn next_run_after(
        trigger: &Trigger,
        completed_at: DateTime<Utc>,
        kept_slot: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>> {
        match kept_slot {
            Some(slot) if slot > completed_at => Ok(slot),
            _ => compute_next_run(trigger, Some(completed_at), completed_at),
        }
    }

    /// Append `record` and advance its schedule in one transaction.
    pub fn record(&self, record: &ExecutionRecord, next_run: DateTime<Utc>) -> Result<Recorded> {
        let config = self.store.record_execution(record, next_run)?;
        let escalated = !record.success && config.consecutive_failures == self.failure_threshold;

        if escalated {
            warn!(
                schedule_id = %config.id,
                consecutive_failures = config.consecutive_failures,
                "schedule reached its failure threshold; status is now failed"
            );
        } else {
            debug!(
                schedule_id = %config.id,
                consecutive_failures = config.consecutive_failures,
                next_run = ?config.next_run,
                "execution recorded"
            );
        }
        Ok(Recorded { config, escalated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::MemoryStore, types::TriggerType};
    use chrono::{Duration, TimeZone};
    use warden_core::ScheduleId;

    fn t(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0).unwrap()
    }

    fn seeded() -> (Arc<MemoryStore>, ScheduleConfig) {
        let store = Arc::new(MemoryStore::new());
        let config = ScheduleConfig {
            id: ScheduleId::new(),
            subject_id: "acct".to_string(),
            job_type: "scrape".to_string(),
            interval_hours: 1.0,
            active_hours: None,
            enabled: true,
            last_run: None,
            next_run: Some(t(10, 0)),
            consecutive_failures: 0,
            created_at: t(9, 0),
            updated_at: t(9, 0),
        };
        store.insert(&config).unwrap();
        (store, config)
    }

    fn outcome(id: &ScheduleId, success: bool, at: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            id: None,
            schedule_id: id.clone(),
            started_at: at,
            completed_at: Some(at + Duration::minutes(5)),
            success,
            items_processed: 0,
            error_message: (!success).then(|| "failed".to_string()),
            trigger_type: TriggerType::Scheduled,
        }
    }

    #[test]
    fn next_run_is_anchored_on_completion() {
        let next =
            HistoryRecorder::next_run_after(&Trigger::interval(1.0), t(10, 7), None).unwrap();
        assert_eq!(next, t(11, 7));
    }

    #[test]
    fn manual_run_keeps_future_regular_slot() {
        let trigger = Trigger::interval(1.0);
        let kept = HistoryRecorder::next_run_after(&trigger, t(10, 20), Some(t(10, 45))).unwrap();
        assert_eq!(kept, t(10, 45));
        // A slot that passed during the manual run is not reused.
        let moved = HistoryRecorder::next_run_after(&trigger, t(10, 50), Some(t(10, 45))).unwrap();
        assert_eq!(moved, t(11, 50));
    }

    #[test]
    fn escalates_exactly_once_at_threshold() {
        let (store, config) = seeded();
        let recorder = HistoryRecorder::new(store, 3);

        let mut escalations = Vec::new();
        for i in 0..5 {
            let at = t(10, 0) + Duration::hours(i);
            let recorded = recorder
                .record(&outcome(&config.id, false, at), at + Duration::hours(1))
                .unwrap();
            escalations.push(recorded.escalated);
        }
        assert_eq!(escalations, vec![false, false, true, false, false]);
    }

    #[test]
    fn success_resets_counter() {
        let (store, config) = seeded();
        let recorder = HistoryRecorder::new(store, 5);
        recorder
            .record(&outcome(&config.id, false, t(10, 0)), t(11, 0))
            .unwrap();
        let recorded = recorder
            .record(&outcome(&config.id, true, t(11, 0)), t(12, 0))
            .unwrap();
        assert_eq!(recorded.config.consecutive_failures, 0);
        assert_eq!(recorded.config.last_run, Some(t(11, 5)));
    }
}
