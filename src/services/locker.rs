//! Per-app mutual exclusion with filesystem sentinels.
//!
//! The in-process map is the source of truth while the plane runs; the
//! sentinel file under `<data>/.locks/` makes a crashed holder observable.
//! Stale sentinels never outlive a restart: `sweep` clears the directory
//! before any lock is handed out.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::domain::error::LockError;
use crate::domain::models::AppId;

/// Named mutual-exclusion table keyed by app.
pub struct Locker {
    dir: PathBuf,
    held: Mutex<HashSet<AppId>>,
}

impl Locker {
    /// Open the lock table over the given sentinel directory, creating it if
    /// needed and sweeping any stale sentinels left by a previous process.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LockError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| LockError::Sentinel(e.to_string()))?;
        let locker = Self {
            dir,
            held: Mutex::new(HashSet::new()),
        };
        let swept = locker.sweep()?;
        if swept > 0 {
            warn!(swept, "removed stale lock sentinels from previous run");
        }
        Ok(locker)
    }

    /// Remove every sentinel file. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize, LockError> {
        let mut removed = 0;
        let entries = fs::read_dir(&self.dir).map_err(|e| LockError::Sentinel(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| LockError::Sentinel(e.to_string()))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "lock") {
                fs::remove_file(&path).map_err(|e| LockError::Sentinel(e.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn sentinel_path(&self, app_id: AppId) -> PathBuf {
        self.dir.join(format!("{app_id}.lock"))
    }

    /// Acquire the app's lock. Fails immediately with `Held` if taken;
    /// callers must not queue behind a held lock.
    pub fn acquire(&self, app_id: AppId) -> Result<(), LockError> {
        let mut held = self.held.lock().expect("locker poisoned");
        if held.contains(&app_id) {
            return Err(LockError::Held(app_id));
        }
        fs::write(self.sentinel_path(app_id), b"").map_err(|e| LockError::Sentinel(e.to_string()))?;
        held.insert(app_id);
        debug!(app_id = %app_id, "acquired app lock");
        Ok(())
    }

    /// Release a previously acquired lock. Releasing an unheld key is an
    /// error rather than a no-op so double-release bugs surface.
    pub fn release(&self, app_id: AppId) -> Result<(), LockError> {
        let mut held = self.held.lock().expect("locker poisoned");
        if !held.remove(&app_id) {
            return Err(LockError::NotHeld(app_id));
        }
        if let Err(e) = fs::remove_file(self.sentinel_path(app_id)) {
            // The in-process state is already consistent; a missing sentinel
            // is log-worthy, not fatal.
            warn!(app_id = %app_id, error = %e, "failed to remove lock sentinel");
        }
        debug!(app_id = %app_id, "released app lock");
        Ok(())
    }

    pub fn is_locked(&self, app_id: AppId) -> bool {
        self.held.lock().expect("locker poisoned").contains(&app_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_release_cycle() {
        let dir = tempdir().unwrap();
        let locker = Locker::open(dir.path()).unwrap();
        let app = AppId::new();

        locker.acquire(app).unwrap();
        assert!(locker.is_locked(app));
        assert!(dir.path().join(format!("{app}.lock")).exists());

        locker.release(app).unwrap();
        assert!(!locker.is_locked(app));
        assert!(!dir.path().join(format!("{app}.lock")).exists());
    }

    #[test]
    fn test_acquire_on_held_key_fails_fast() {
        let dir = tempdir().unwrap();
        let locker = Locker::open(dir.path()).unwrap();
        let app = AppId::new();

        locker.acquire(app).unwrap();
        assert!(matches!(locker.acquire(app), Err(LockError::Held(id)) if id == app));
    }

    #[test]
    fn test_release_unknown_key_is_error() {
        let dir = tempdir().unwrap();
        let locker = Locker::open(dir.path()).unwrap();
        assert!(matches!(locker.release(AppId::new()), Err(LockError::NotHeld(_))));
    }

    #[test]
    fn test_startup_sweep_clears_stale_sentinels() {
        let dir = tempdir().unwrap();
        let app = AppId::new();
        // Simulate a crash: sentinel left behind, no process state.
        std::fs::write(dir.path().join(format!("{app}.lock")), b"").unwrap();

        let locker = Locker::open(dir.path()).unwrap();
        assert!(!locker.is_locked(app));
        assert!(!dir.path().join(format!("{app}.lock")).exists());
        // And the app is lockable again.
        locker.acquire(app).unwrap();
    }
}
