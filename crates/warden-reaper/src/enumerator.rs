//! OS-facing seam of the reaper.
//!
//! Matching processes by name and command line is heuristic, so it lives
//! behind [`ProcessEnumerator`]: the reaper's keep/kill logic only ever sees
//! [`ProcessInfo`] snapshots and can be tested against a scripted table.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, TimeZone, Utc};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;
use warden_core::config::SignatureConfig;

use crate::{
    error::{ReaperError, Result},
    types::{ProcessInfo, Signal},
};

/// Upper bound on the parent chain recorded per process.
const MAX_ANCESTRY_DEPTH: usize = 32;

/// Source of managed-process snapshots and the means to signal them.
pub trait ProcessEnumerator: Send + Sync {
    /// Every live process that matches the managed signature.
    fn matching(&self) -> Result<Vec<ProcessInfo>>;

    /// Deliver `signal` to `pid`.
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ProcessSignature
// ---------------------------------------------------------------------------

/// Name/command-line pattern identifying managed processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessSignature {
    names: Vec<String>,
    markers: Vec<String>,
}

impl ProcessSignature {
    pub fn new(names: Vec<String>, markers: Vec<String>) -> Self {
        Self {
            names: names.into_iter().map(|n| n.to_lowercase()).collect(),
            markers,
        }
    }

    /// `true` when the name contains any configured name (case-insensitive)
    /// and the command line contains every marker.
    ///
    /// An empty name list matches nothing, so a misconfigured signature can
    /// never select every process on the host.
    pub fn matches(&self, name: &str, cmdline: &[String]) -> bool {
        let name = name.to_lowercase();
        if !self.names.iter().any(|n| name.contains(n.as_str())) {
            return false;
        }
        self.markers
            .iter()
            .all(|marker| cmdline.iter().any(|arg| arg.contains(marker.as_str())))
    }
}

impl From<&SignatureConfig> for ProcessSignature {
    fn from(config: &SignatureConfig) -> Self {
        Self::new(config.names.clone(), config.cmdline_markers.clone())
    }
}

// ---------------------------------------------------------------------------
// SysinfoEnumerator
// ---------------------------------------------------------------------------

/// Production enumerator backed by `sysinfo`.
pub struct SysinfoEnumerator {
    signature: ProcessSignature,
    system: Mutex<System>,
}

impl SysinfoEnumerator {
    pub fn new(signature: ProcessSignature) -> Self {
        Self {
            signature,
            system: Mutex::new(System::new()),
        }
    }
}

impl ProcessEnumerator for SysinfoEnumerator {
    fn matching(&self) -> Result<Vec<ProcessInfo>> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
        );

        let processes = system.processes();
        let parents: HashMap<u32, u32> = processes
            .iter()
            .filter_map(|(pid, p)| p.parent().map(|parent| (pid.as_u32(), parent.as_u32())))
            .collect();

        let own_pid = std::process::id();
        let mut matched = Vec::new();
        for (pid, process) in processes {
            let pid = pid.as_u32();
            if pid == own_pid {
                continue;
            }
            let name = process.name().to_string_lossy().into_owned();
            let cmdline: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            if !self.signature.matches(&name, &cmdline) {
                continue;
            }
            matched.push(ProcessInfo {
                pid,
                ancestors: ancestry(pid, &parents),
                name,
                started_at: epoch_secs(process.start_time()),
            });
        }

        debug!(count = matched.len(), "managed processes enumerated");
        Ok(matched)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        send_signal(pid, signal)
    }
}

/// Walk the parent map from `pid`, nearest ancestor first.
fn ancestry(pid: u32, parents: &HashMap<u32, u32>) -> Vec<u32> {
    let mut chain = Vec::new();
    let mut current = pid;
    while let Some(&parent) = parents.get(&current) {
        if parent == 0 || chain.contains(&parent) || chain.len() >= MAX_ANCESTRY_DEPTH {
            break;
        }
        chain.push(parent);
        current = parent;
    }
    chain
}

fn epoch_secs(secs: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Send `signal` to `pid`, mapping errno to [`ReaperError`].
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(ReaperError::Kill {
            pid,
            reason: "refusing to signal an invalid pid".to_string(),
        });
    }
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions; pid was range-checked
    // above so it can never address a process group.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(ReaperError::ProcessGone { pid }),
        Some(libc::EPERM) => Err(ReaperError::PermissionDenied { pid }),
        _ => Err(ReaperError::Kill {
            pid,
            reason: err.to_string(),
        }),
    }
}

/// `true` when a process with `pid` exists. A process we may not signal
/// still counts as alive.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence and permission checks.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without kill(2) liveness cannot be checked cheaply; assume alive.
#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    pid != 0
}

/// Non-Unix fallback: best effort via `taskkill`.
#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    if signal == Signal::Kill {
        cmd.arg("/F");
    }
    let output = cmd.args(["/PID", &pid.to_string()]).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ReaperError::Kill {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedEnumerator
// ---------------------------------------------------------------------------

/// In-memory process table for tests and dry runs.
///
/// Signalling a listed process removes it from the table, as if it died;
/// signalling an unknown PID yields [`ReaperError::ProcessGone`].
#[derive(Debug, Default)]
pub struct ScriptedEnumerator {
    table: Mutex<ScriptedTable>,
}

#[derive(Debug, Default)]
struct ScriptedTable {
    processes: Vec<ProcessInfo>,
    protected: Vec<u32>,
    signals: Vec<(u32, Signal)>,
}

impl ScriptedEnumerator {
    pub fn new(processes: Vec<ProcessInfo>) -> Self {
        Self {
            table: Mutex::new(ScriptedTable {
                processes,
                ..Default::default()
            }),
        }
    }

    pub fn spawn(&self, info: ProcessInfo) {
        self.lock().processes.push(info);
    }

    /// Make signals to `pid` fail with `PermissionDenied`.
    pub fn protect(&self, pid: u32) {
        self.lock().protected.push(pid);
    }

    pub fn alive(&self, pid: u32) -> bool {
        self.lock().processes.iter().any(|p| p.pid == pid)
    }

    /// Every signal delivered so far, in order.
    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.lock().signals.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessEnumerator for ScriptedEnumerator {
    fn matching(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self.lock().processes.clone())
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let mut table = self.lock();
        if table.protected.contains(&pid) {
            return Err(ReaperError::PermissionDenied { pid });
        }
        let before = table.processes.len();
        table.processes.retain(|p| p.pid != pid);
        if table.processes.len() == before {
            return Err(ReaperError::ProcessGone { pid });
        }
        table.signals.push((pid, signal));
        Ok(())
    }
}
