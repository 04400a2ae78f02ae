//! warden-reaper: ownership tracking and cleanup for externally spawned
//! browser processes.
//!
//! - [`registry::ProcessRegistry`]: session id → PID map, filled by running
//!   executions and emptied by their completion guards.
//! - [`enumerator::ProcessEnumerator`]: the OS-facing seam; lists processes
//!   that match the managed signature and delivers signals.
//! - [`reaper::ProcessReaper`]: periodic sweep that kills orphaned and
//!   over-age managed processes.
//! - [`spawner::ProcessSpawner`]: spawns a command and registers its PID in
//!   one step so the reaper never sees it unowned.

pub mod enumerator;
pub mod error;
pub mod reaper;
pub mod registry;
pub mod spawner;
pub mod types;

pub use enumerator::{
    is_alive, ProcessEnumerator, ProcessSignature, ScriptedEnumerator, SysinfoEnumerator,
};
pub use error::{ReaperError, Result};
pub use reaper::{ProcessReaper, ReaperSettings};
pub use registry::{ProcessRegistry, RegistrationGuard};
pub use spawner::{ChildExit, CommandSpec, ManagedChild, ProcessSpawner};
pub use types::{ManagedProcess, ProcessInfo, ReapCandidate, ReapReason, Signal, SweepReport};
