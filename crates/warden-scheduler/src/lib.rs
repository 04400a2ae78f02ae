//! `warden-scheduler`: durable recurring jobs with single-instance execution.
//!
//! # Overview
//!
//! Schedules live in a [`store::ScheduleStore`] (SQLite in production). At
//! startup the [`recovery::RecoveryManager`] loads every enabled schedule into
//! the [`engine::JobScheduler`], whose coordinator tick dispatches due jobs to
//! the [`runner::ExecutionRunner`]. Each outcome is persisted by the
//! [`history::HistoryRecorder`] together with the schedule's next run, in one
//! transaction. [`service::SchedulerService`] is the control surface.
//!
//! # Trigger modes
//!
//! | Mode          | Behaviour                                             |
//! |---------------|-------------------------------------------------------|
//! | Interval      | Every `interval_hours`, anchored on the last completion |
//! | Active hours  | Hourly on the hour, inside a `[start, end)` UTC window |
//!
//! A backlog of missed fires is never replayed: it collapses into one run.

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod history;
pub mod memory;
pub mod recovery;
pub mod runner;
pub mod service;
pub mod store;
pub mod trigger;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::JobScheduler;
pub use error::{Result, SchedulerError};
pub use history::{HistoryRecorder, Recorded};
pub use memory::MemoryStore;
pub use recovery::{RecoveryManager, RecoveryReport};
pub use runner::{ExecutionRunner, JobTask, TaskContext, TaskRouter};
pub use service::{SchedulerService, SchedulerSettings};
pub use store::{ScheduleStore, SqliteStore};
pub use trigger::compute_next_run;
pub use types::{
    ActiveHours, DerivedStatus, ExecutionRecord, JobHandle, NewSchedule, ScheduleConfig,
    ScheduleStatus, ScheduleUpdate, SchedulerEvent, Trigger, TriggerType,
};
