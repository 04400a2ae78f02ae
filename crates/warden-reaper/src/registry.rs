//! `ProcessRegistry`: the authoritative record of which managed processes
//! belong to a live execution.
//!
//! Executions reserve a slot before their task starts and release it through
//! [`RegistrationGuard`] on every exit path. The reaper only reads the map.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use tracing::{debug, warn};
use warden_core::SessionId;

use crate::types::ManagedProcess;

/// Mutex-guarded `session id → process` map.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<SessionId, ManagedProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a placeholder for `session_id` and return a guard that removes
    /// it again when dropped.
    pub fn reserve(self: &Arc<Self>, session_id: SessionId) -> RegistrationGuard {
        self.lock().insert(
            session_id.clone(),
            ManagedProcess {
                session_id: session_id.clone(),
                pid: None,
                registered_at: Utc::now(),
            },
        );
        debug!(%session_id, "process slot reserved");
        RegistrationGuard {
            registry: Arc::clone(self),
            session_id,
        }
    }

    /// Attach `pid` to `session_id`, creating the entry if needed.
    pub fn register(&self, session_id: &SessionId, pid: u32) {
        let mut entries = self.lock();
        match entries.get_mut(session_id) {
            Some(entry) => {
                if let Some(previous) = entry.pid.replace(pid) {
                    warn!(%session_id, previous, pid, "session re-registered with a new pid");
                }
            }
            None => {
                entries.insert(
                    session_id.clone(),
                    ManagedProcess {
                        session_id: session_id.clone(),
                        pid: Some(pid),
                        registered_at: Utc::now(),
                    },
                );
            }
        }
        debug!(%session_id, pid, "process registered");
    }

    /// Remove `session_id`. Idempotent.
    pub fn unregister(&self, session_id: &SessionId) -> Option<ManagedProcess> {
        let removed = self.lock().remove(session_id);
        if let Some(ref entry) = removed {
            debug!(%session_id, pid = ?entry.pid, "process unregistered");
        }
        removed
    }

    pub fn get(&self, session_id: &SessionId) -> Option<ManagedProcess> {
        self.lock().get(session_id).cloned()
    }

    pub fn contains_pid(&self, pid: u32) -> bool {
        self.lock().values().any(|e| e.pid == Some(pid))
    }

    /// PIDs of every registered process (placeholders excluded).
    pub fn registered_pids(&self) -> HashSet<u32> {
        self.lock().values().filter_map(|e| e.pid).collect()
    }

    pub fn snapshot(&self) -> Vec<ManagedProcess> {
        let mut entries: Vec<_> = self.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.registered_at);
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Every critical section is a single map operation, so a poisoned lock
    // still guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, ManagedProcess>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a reserved session when dropped, including during unwinding.
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: Arc<ProcessRegistry>,
    session_id: SessionId,
}

impl RegistrationGuard {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.session_id);
    }
}
