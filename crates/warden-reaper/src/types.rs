//! Shared data types for warden-reaper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use warden_core::SessionId;

// ---------------------------------------------------------------------------
// ManagedProcess
// ---------------------------------------------------------------------------

/// A registry entry: one execution's process slot.
///
/// `pid` stays `None` from the moment the execution reserves its session
/// until the task reports the PID of the process it spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub session_id: SessionId,
    pub pid: Option<u32>,
    pub registered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ProcessInfo
// ---------------------------------------------------------------------------

/// Snapshot of one OS process that matched the managed signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Parent chain, nearest first. Used to attribute helper processes to a
    /// registered parent.
    pub ancestors: Vec<u32>,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

impl ProcessInfo {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.started_at)
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Signals the reaper sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Polite shutdown request (SIGTERM).
    Terminate,
    /// Unconditional kill (SIGKILL).
    Kill,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Terminate => write!(f, "SIGTERM"),
            Signal::Kill => write!(f, "SIGKILL"),
        }
    }
}

// ---------------------------------------------------------------------------
// ReapReason / SweepReport
// ---------------------------------------------------------------------------

/// Why a managed process was selected for killing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapReason {
    /// Neither the process nor any ancestor is in the registry.
    Orphan,
    /// Registered, but alive longer than the configured lifetime.
    OverAge,
}

impl fmt::Display for ReapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapReason::Orphan => write!(f, "orphan"),
            ReapReason::OverAge => write!(f, "over_age"),
        }
    }
}

/// A process the sweep decided to kill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapCandidate {
    pub pid: u32,
    pub name: String,
    pub age_secs: i64,
    pub reason: ReapReason,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Managed-signature processes seen.
    pub examined: usize,
    /// Processes signalled successfully.
    pub killed: usize,
    pub orphans: usize,
    pub over_age: usize,
    /// Per-process failures that were logged and skipped.
    pub errors: usize,
    /// Selected processes; on a dry run these were not signalled.
    pub candidates: Vec<ReapCandidate>,
}
