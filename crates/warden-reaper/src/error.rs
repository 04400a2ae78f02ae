//! Error types for the warden-reaper crate.

use thiserror::Error;

/// Errors raised while inspecting, signalling or spawning processes.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// The process exited before the signal was delivered.
    #[error("Process {pid} already exited")]
    ProcessGone { pid: u32 },

    /// The OS refused to signal the process.
    #[error("Permission denied signalling process {pid}")]
    PermissionDenied { pid: u32 },

    /// Any other signalling failure.
    #[error("Failed to kill process {pid}: {reason}")]
    Kill { pid: u32, reason: String },

    /// The process table could not be read.
    #[error("Process enumeration failed: {0}")]
    Enumerate(String),

    /// Child-process spawn failed.
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Underlying I/O failure (pipes, wait).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReaperError {
    /// `true` when the target was already gone, which sweeps treat as success.
    pub fn is_gone(&self) -> bool {
        matches!(self, ReaperError::ProcessGone { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ReaperError>;
