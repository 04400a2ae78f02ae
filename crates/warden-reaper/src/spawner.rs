//! `ProcessSpawner`: start an external command on behalf of an execution.
//!
//! The PID is registered under the execution's session as soon as the child
//! exists, so a concurrent reaper sweep sees it as owned. Unregistering is
//! left to the execution's [`RegistrationGuard`](crate::RegistrationGuard).

use std::{process::Stdio, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core::SessionId;

use crate::{
    enumerator::send_signal,
    error::{ReaperError, Result},
    registry::ProcessRegistry,
    types::Signal,
};

/// Bytes of stdout/stderr kept per stream (the tail is kept).
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
}

/// Result of waiting on a [`ManagedChild`].
#[derive(Debug, Clone)]
pub struct ChildExit {
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The wait ended because the cancellation token fired.
    pub cancelled: bool,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

pub struct ProcessSpawner {
    registry: Arc<ProcessRegistry>,
    terminate_grace: Duration,
}

impl ProcessSpawner {
    pub fn new(registry: Arc<ProcessRegistry>, terminate_grace: Duration) -> Self {
        Self {
            registry,
            terminate_grace,
        }
    }

    /// Spawn `spec` and register its PID under `session_id`.
    pub fn spawn(&self, session_id: &SessionId, spec: &CommandSpec) -> Result<ManagedChild> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let child = cmd
            .spawn()
            .map_err(|e| ReaperError::Spawn(format!("{}: {e}", spec.program)))?;
        let pid = child
            .id()
            .ok_or_else(|| ReaperError::Spawn("child exited before its pid was read".to_string()))?;

        self.registry.register(session_id, pid);
        info!(%session_id, pid, program = %spec.program, "managed process spawned");

        Ok(ManagedChild {
            pid,
            child,
            terminate_grace: self.terminate_grace,
        })
    }
}

/// A spawned child whose PID is in the registry. Dropping it before the
/// child exits sends SIGKILL.
pub struct ManagedChild {
    pid: u32,
    child: Child,
    terminate_grace: Duration,
}

impl ManagedChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for exit, or on cancellation send SIGTERM, wait the terminate
    /// grace and SIGKILL if the child is still alive.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<ChildExit> {
        let stdout = tokio::spawn(read_tail(self.child.stdout.take()));
        let stderr = tokio::spawn(read_tail(self.child.stderr.take()));

        let waited = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let (status, cancelled) = match waited {
            Some(status) => (status?, false),
            None => {
                debug!(pid = self.pid, "cancellation requested; terminating child");
                if let Err(e) = send_signal(self.pid, Signal::Terminate) {
                    if !e.is_gone() {
                        warn!(pid = self.pid, error = %e, "terminate failed");
                    }
                }
                match tokio::time::timeout(self.terminate_grace, self.child.wait()).await {
                    Ok(status) => (status?, true),
                    Err(_elapsed) => {
                        warn!(pid = self.pid, "child ignored SIGTERM; killing");
                        self.child.start_kill()?;
                        (self.child.wait().await?, true)
                    }
                }
            }
        };

        Ok(ChildExit {
            exit_code: status.code(),
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
            cancelled,
        })
    }
}

/// Drain a pipe to EOF, keeping only the last `MAX_CAPTURE_BYTES`.
async fn read_tail<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > MAX_CAPTURE_BYTES {
                    let excess = kept.len() - MAX_CAPTURE_BYTES;
                    kept.drain(..excess);
                }
            }
            Err(e) => {
                debug!("pipe read failed: {e}");
                break;
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}
