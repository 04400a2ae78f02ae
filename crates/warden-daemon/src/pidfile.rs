//! Pid file marking the `warden run` daemon that owns a database.
//!
//! Only the daemon's in-memory registry knows which browser processes are in
//! use, so one-shot commands look for a live owner here before they act on
//! managed processes.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use warden_core::{Result, WardenError};
use warden_reaper::is_alive;

/// Pid file path for the daemon using `db_path`.
pub fn path_for(db_path: &str) -> PathBuf {
    PathBuf::from(format!("{db_path}.pid"))
}

/// Pid of a live daemon recorded at `path`. Missing, unreadable and stale
/// files all read as `None`.
pub fn running_daemon(path: &Path) -> Option<u32> {
    let pid = fs::read_to_string(path).ok()?.trim().parse::<u32>().ok()?;
    (pid != std::process::id() && is_alive(pid)).then_some(pid)
}

/// Fails with `DaemonRunning` while a live daemon owns `path`. One-shot
/// sweeps call this before killing anything.
pub fn ensure_no_daemon(path: &Path) -> Result<()> {
    match running_daemon(path) {
        Some(pid) => Err(WardenError::DaemonRunning {
            pid,
            path: path.display().to_string(),
        }),
        None => Ok(()),
    }
}

/// Held by a running daemon; the file is removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `path` for the current process. Fails with `DaemonRunning` when
    /// another live process already holds it; a stale file is replaced.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_no_daemon(&path)?;
        if path.exists() {
            warn!(path = %path.display(), "replacing stale pid file");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, std::process::id().to_string())?;
        info!(path = %path.display(), pid = std::process::id(), "pid file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove pid file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_path() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("warden.db.pid");
        (dir, path)
    }

    /// Pid of a process that is alive for the duration of the test.
    #[cfg(unix)]
    fn other_live_process() -> std::process::Child {
        std::process::Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[test]
    fn path_sits_next_to_the_database() {
        assert_eq!(
            path_for("/var/lib/warden/warden.db"),
            PathBuf::from("/var/lib/warden/warden.db.pid")
        );
    }

    #[test]
    fn acquire_writes_and_drop_removes() {
        let (_dir, path) = temp_path();
        {
            let held = PidFile::acquire(&path).unwrap();
            assert_eq!(held.path(), path.as_path());
            let written = fs::read_to_string(&path).unwrap();
            assert_eq!(written, std::process::id().to_string());
            // The holder itself is not "another daemon".
            assert_eq!(running_daemon(&path), None);
        }
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn sweep_is_refused_while_a_daemon_owns_the_database() {
        let (_dir, path) = temp_path();
        assert!(ensure_no_daemon(&path).is_ok());

        let mut daemon = other_live_process();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, daemon.id().to_string()).unwrap();
        let err = ensure_no_daemon(&path).unwrap_err();
        assert_eq!(err.code(), "DAEMON_RUNNING");
        assert!(err.to_string().contains(&daemon.id().to_string()), "{err}");

        daemon.kill().unwrap();
        daemon.wait().unwrap();
    }

    #[test]
    fn missing_or_garbage_file_means_no_daemon() {
        let (_dir, path) = temp_path();
        assert_eq!(running_daemon(&path), None);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not a pid").unwrap();
        assert_eq!(running_daemon(&path), None);
    }

    #[cfg(unix)]
    #[test]
    fn live_owner_blocks_a_second_daemon() {
        let (_dir, path) = temp_path();
        let mut owner = other_live_process();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, owner.id().to_string()).unwrap();

        assert_eq!(running_daemon(&path), Some(owner.id()));
        let err = PidFile::acquire(&path).unwrap_err();
        assert_eq!(err.code(), "DAEMON_RUNNING");

        owner.kill().unwrap();
        owner.wait().unwrap();
        assert_eq!(running_daemon(&path), None);
        assert!(ensure_no_daemon(&path).is_ok());
        // A stale file is taken over.
        let held = PidFile::acquire(&path).unwrap();
        assert!(held.path().exists());
    }
}
