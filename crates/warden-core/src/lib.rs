//! `warden-core`: configuration, shared identifiers and the top-level error
//! type used by every warden crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use types::{ScheduleId, SessionId};
