use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use warden_core::ScheduleId;

use crate::error::{Result, SchedulerError};

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Hour-of-day window `[start, end)`, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHours {
    pub start: u8,
    pub end: u8,
}

impl ActiveHours {
    pub fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > 23 || self.end > 23 {
            return Err(SchedulerError::InvalidScheduleConfig(format!(
                "active hours must be within 0..=23, got {}-{}",
                self.start, self.end
            )));
        }
        if self.start >= self.end {
            return Err(SchedulerError::InvalidScheduleConfig(format!(
                "active hours window {}-{} is empty (start must be < end)",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn contains(&self, hour: u32) -> bool {
        (self.start as u32..self.end as u32).contains(&hour)
    }

    /// Firing hours in ascending order.
    pub fn hours(&self) -> Vec<u32> {
        (self.start as u32..self.end as u32).collect()
    }
}

impl std::fmt::Display for ActiveHours {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl std::str::FromStr for ActiveHours {
    type Err = SchedulerError;

    /// Parses `"6-9"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || SchedulerError::InvalidScheduleConfig(format!("bad active hours: {s}"));
        let (start, end) = s.split_once('-').ok_or_else(invalid)?;
        let hours = ActiveHours {
            start: start.trim().parse().map_err(|_| invalid())?,
            end: end.trim().parse().map_err(|_| invalid())?,
        };
        hours.validate()?;
        Ok(hours)
    }
}

/// Longest accepted interval: ten years.
pub const MAX_INTERVAL_HOURS: f64 = 10.0 * 365.0 * 24.0;

/// The rule used to compute fire times.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub interval_hours: f64,
    pub active_hours: Option<ActiveHours>,
}

impl Trigger {
    pub fn interval(interval_hours: f64) -> Self {
        Self {
            interval_hours,
            active_hours: None,
        }
    }

    pub fn windowed(interval_hours: f64, active_hours: ActiveHours) -> Self {
        Self {
            interval_hours,
            active_hours: Some(active_hours),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.interval_hours.is_finite() || self.interval_hours <= 0.0 {
            return Err(SchedulerError::InvalidScheduleConfig(format!(
                "interval_hours must be a positive number, got {}",
                self.interval_hours
            )));
        }
        // Anything under a second would spin the coordinator.
        if self.interval_hours * 3600.0 < 1.0 {
            return Err(SchedulerError::InvalidScheduleConfig(
                "interval_hours must be at least one second".to_string(),
            ));
        }
        if self.interval_hours > MAX_INTERVAL_HOURS {
            return Err(SchedulerError::InvalidScheduleConfig(format!(
                "interval_hours must be at most {MAX_INTERVAL_HOURS}, got {}",
                self.interval_hours
            )));
        }
        if let Some(hours) = self.active_hours {
            hours.validate()?;
        }
        Ok(())
    }

    /// Interval as a duration, rounded to whole milliseconds.
    pub fn period(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.interval_hours * 3_600_000.0).round() as i64)
    }
}

// ---------------------------------------------------------------------------
// ScheduleConfig
// ---------------------------------------------------------------------------

/// A persisted recurrence for one (subject, job type) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub id: ScheduleId,
    pub subject_id: String,
    /// Free-form tag selecting the task to run.
    pub job_type: String,
    pub interval_hours: f64,
    pub active_hours: Option<ActiveHours>,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    /// `None` only while disabled.
    pub next_run: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleConfig {
    pub fn trigger(&self) -> Trigger {
        Trigger {
            interval_hours: self.interval_hours,
            active_hours: self.active_hours,
        }
    }
}

/// Input of `AddSchedule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchedule {
    pub subject_id: String,
    pub job_type: String,
    pub interval_hours: f64,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

impl NewSchedule {
    pub fn trigger(&self) -> Trigger {
        Trigger {
            interval_hours: self.interval_hours,
            active_hours: self.active_hours,
        }
    }
}

/// Partial update for `UpdateSchedule`. `None` leaves a field unchanged;
/// `active_hours: Some(None)` clears the window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub interval_hours: Option<f64>,
    #[serde(default, deserialize_with = "double_option")]
    pub active_hours: Option<Option<ActiveHours>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ScheduleUpdate {
    pub fn is_empty(&self) -> bool {
        self.interval_hours.is_none() && self.active_hours.is_none() && self.enabled.is_none()
    }
}

fn bool_true() -> bool {
    true
}

// Distinguishes an explicit `null` from an absent field.
fn double_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerType::Scheduled),
            "manual" => Ok(TriggerType::Manual),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// One firing of a schedule. Immutable once `completed_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Row id, assigned when the record is persisted.
    pub id: Option<i64>,
    pub schedule_id: ScheduleId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub items_processed: u64,
    pub error_message: Option<String>,
    pub trigger_type: TriggerType,
}

impl ExecutionRecord {
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|c| c - self.started_at)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Externally visible health of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedStatus {
    Active,
    /// Disabled in the store or paused in memory.
    Paused,
    /// Enabled but at or past the failure threshold. Still fires.
    Failed,
}

impl DerivedStatus {
    pub fn derive(enabled: bool, paused: bool, consecutive_failures: u32, threshold: u32) -> Self {
        if !enabled || paused {
            DerivedStatus::Paused
        } else if consecutive_failures >= threshold {
            DerivedStatus::Failed
        } else {
            DerivedStatus::Active
        }
    }
}

impl std::fmt::Display for DerivedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DerivedStatus::Active => "active",
            DerivedStatus::Paused => "paused",
            DerivedStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// `GetStatus` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub schedule_id: ScheduleId,
    pub subject_id: String,
    pub job_type: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub derived_status: DerivedStatus,
    /// An execution is in flight right now.
    pub running: bool,
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// In-memory scheduling ticket held by the `JobScheduler`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub schedule_id: ScheduleId,
    pub subject_id: String,
    pub job_type: String,
    pub trigger: Trigger,
    /// Next regular fire time. Untouched by manual triggers.
    pub next_fire_time: DateTime<Utc>,
    pub paused: bool,
    /// Single-instance guard; cleared only after the execution is recorded.
    pub running: bool,
    /// A manual run was requested and has not been dispatched yet.
    pub manual_pending: bool,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Observability events emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// An execution finished and was recorded (or recording was attempted).
    Executed {
        schedule_id: ScheduleId,
        trigger_type: TriggerType,
        success: bool,
        items_processed: u64,
        duration_ms: i64,
        error: Option<String>,
        next_run: Option<DateTime<Utc>>,
    },
    /// A fire time slipped past the grace period; the backlog was coalesced
    /// into a single run.
    Missed {
        schedule_id: ScheduleId,
        scheduled_for: DateTime<Utc>,
        late_by_secs: i64,
    },
    /// The failure counter just reached the escalation threshold.
    Escalated {
        schedule_id: ScheduleId,
        consecutive_failures: u32,
    },
    /// The outcome could not be persisted; in-memory state moved on.
    RecordFailed {
        schedule_id: ScheduleId,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_hours_parse_and_validate() {
        let hours: ActiveHours = "6-9".parse().unwrap();
        assert_eq!(hours, ActiveHours::new(6, 9));
        assert_eq!(hours.hours(), vec![6, 7, 8]);
        assert!("9-6".parse::<ActiveHours>().is_err());
        assert!("5-24".parse::<ActiveHours>().is_err());
        assert!("seven".parse::<ActiveHours>().is_err());
    }

    #[test]
    fn trigger_rejects_non_positive_intervals() {
        assert!(Trigger::interval(0.0).validate().is_err());
        assert!(Trigger::interval(-2.0).validate().is_err());
        assert!(Trigger::interval(f64::NAN).validate().is_err());
        assert!(Trigger::interval(0.5).validate().is_ok());
        assert_eq!(Trigger::interval(0.5).period(), chrono::Duration::minutes(30));
    }

    #[test]
    fn derived_status_precedence() {
        assert_eq!(DerivedStatus::derive(true, false, 0, 5), DerivedStatus::Active);
        assert_eq!(DerivedStatus::derive(true, false, 5, 5), DerivedStatus::Failed);
        assert_eq!(DerivedStatus::derive(false, false, 9, 5), DerivedStatus::Paused);
        assert_eq!(DerivedStatus::derive(true, true, 0, 5), DerivedStatus::Paused);
    }

    #[test]
    fn update_distinguishes_null_from_absent() {
        let absent: ScheduleUpdate = serde_json::from_str(r#"{"enabled":false}"#).unwrap();
        assert_eq!(absent.active_hours, None);

        let cleared: ScheduleUpdate = serde_json::from_str(r#"{"active_hours":null}"#).unwrap();
        assert_eq!(cleared.active_hours, Some(None));

        let set: ScheduleUpdate =
            serde_json::from_str(r#"{"active_hours":{"start":6,"end":9}}"#).unwrap();
        assert_eq!(set.active_hours, Some(Some(ActiveHours::new(6, 9))));
    }

    #[test]
    fn trigger_type_wire_names() {
        assert_eq!(serde_json::to_string(&TriggerType::Manual).unwrap(), "\"manual\"");
        assert_eq!("scheduled".parse::<TriggerType>(), Ok(TriggerType::Scheduled));
    }
}
