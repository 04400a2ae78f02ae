use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another `warden run` holds the pid file for the same database.
    #[error("warden daemon already running (pid {pid}, pid file {path})")]
    DaemonRunning { pid: u32, path: String },
}

impl WardenError {
    /// Short, stable error code for callers that surface errors over a wire.
    pub fn code(&self) -> &'static str {
        match self {
            WardenError::Config(_) => "CONFIG_ERROR",
            WardenError::Io(_) => "IO_ERROR",
            WardenError::DaemonRunning { .. } => "DAEMON_RUNNING",
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
