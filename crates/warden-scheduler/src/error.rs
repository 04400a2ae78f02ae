use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Execution failures are deliberately absent: a failed or timed-out task is
/// captured in its [`ExecutionRecord`](crate::types::ExecutionRecord), never
/// returned to a caller.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad interval or active-hours window. Rejected before anything is persisted.
    #[error("Invalid schedule config: {0}")]
    InvalidScheduleConfig(String),

    /// A schedule (or live handle) already exists for this key.
    #[error("Duplicate job: {key}")]
    DuplicateJob { key: String },

    /// No schedule with the given ID exists (or it has no live handle).
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded.
    #[error("Corrupt schedule row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// The store lock was poisoned or the backend is unreachable.
    #[error("Schedule store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SchedulerError {
    /// Short error code string for the control-surface caller.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidScheduleConfig(_) => "INVALID_SCHEDULE_CONFIG",
            SchedulerError::DuplicateJob { .. } => "DUPLICATE_JOB",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Corrupt { .. } => "CORRUPT_RECORD",
            SchedulerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }

    /// `true` for errors caused by the caller's input rather than the store.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidScheduleConfig(_)
                | SchedulerError::DuplicateJob { .. }
                | SchedulerError::JobNotFound { .. }
        )
    }

    pub(crate) fn not_found(id: impl std::fmt::Display) -> Self {
        SchedulerError::JobNotFound { id: id.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
