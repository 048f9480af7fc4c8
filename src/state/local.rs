//! ST-041: Filesystem state backend.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<namespace>/<template>/state.json
//! <root>/<namespace>/<template>/state.lock
//! ```
//!
//! The lock file is created with `hard_link`, which fails if the target
//! exists, so two processes can never both hold it. Removal renames the
//! marker to a private tombstone and checks the id there, so a marker
//! re-acquired by another process is never deleted by a stale handle.

use super::{held_error, not_held, write_atomic, Clock, Lock, StateBackend, StateKey, StateRecord};
use crate::audit::eventlog::generate_lock_id;
use crate::error::StateError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Result of removing the lock marker for an expected id.
#[derive(Debug)]
enum Taken {
    Removed(Lock),
    Absent,
    /// The marker belonged to another lock and was put back.
    Foreign(Lock),
}

#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, key: &StateKey) -> PathBuf {
        self.root.join(&key.namespace).join(&key.template)
    }

    fn state_path(&self, key: &StateKey) -> PathBuf {
        self.dir(key).join("state.json")
    }

    fn lock_path(&self, key: &StateKey) -> PathBuf {
        self.dir(key).join("state.lock")
    }

    fn load_lock(&self, key: &StateKey) -> Result<Option<Lock>, StateError> {
        let path = self.lock_path(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::Corrupt {
                location: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Move the marker aside, then delete it only if it carries `lock_id`.
    ///
    /// A foreign marker is linked back into place. If yet another process
    /// acquired the slot in that instant, the moved marker is dropped and its
    /// holder's next write fails with `LockNotHeld`.
    fn take_lock(&self, key: &StateKey, lock_id: &str) -> Result<Taken, StateError> {
        let path = self.lock_path(key);
        let tombstone = self
            .dir(key)
            .join(format!("state.lock.{}.released", generate_lock_id()));
        match std::fs::rename(&path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Taken::Absent),
            Err(e) => return Err(StateError::io(path, e)),
        }

        let parsed = std::fs::read_to_string(&tombstone)
            .map_err(|e| StateError::io(&tombstone, e))
            .and_then(|content| {
                serde_json::from_str::<Lock>(&content).map_err(|e| StateError::Corrupt {
                    location: path.display().to_string(),
                    reason: e.to_string(),
                })
            });
        if parsed.as_ref().is_ok_and(|current| current.id == lock_id) {
            let _ = std::fs::remove_file(&tombstone);
            return parsed.map(Taken::Removed);
        }

        match std::fs::hard_link(&tombstone, &path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::warn!(key = %key, "lock re-acquired while a foreign marker was set aside");
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tombstone);
                return Err(StateError::io(path, e));
            }
        }
        let _ = std::fs::remove_file(&tombstone);
        Ok(Taken::Foreign(parsed?))
    }

    fn ensure_held(&self, key: &StateKey, lock: &Lock) -> Result<(), StateError> {
        match self.load_lock(key)? {
            Some(current) if current.id == lock.id => Ok(()),
            _ => Err(not_held(key, lock)),
        }
    }
}

impl StateBackend for LocalBackend {
    fn bootstrap(&self, namespace: &str) -> Result<(), StateError> {
        let dir = self.root.join(namespace);
        std::fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))
    }

    fn read(&self, key: &StateKey) -> Result<Option<StateRecord>, StateError> {
        let path = self.state_path(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::Corrupt {
                location: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    fn write(&self, key: &StateKey, record: &StateRecord, lock: &Lock) -> Result<(), StateError> {
        self.ensure_held(key, lock)?;
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.state_path(key), &bytes)
    }

    fn acquire(&self, key: &StateKey, owner: &str, ttl: Duration) -> Result<Lock, StateError> {
        let dir = self.dir(key);
        std::fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;

        let now = self.clock.now();
        let lock = Lock::new(owner, now, ttl);
        let tmp = dir.join(format!("{}.lock.tmp", lock.id));
        let bytes = serde_json::to_vec(&lock)?;
        std::fs::write(&tmp, bytes).map_err(|e| StateError::io(&tmp, e))?;

        let target = self.lock_path(key);
        let linked = std::fs::hard_link(&tmp, &target);
        let _ = std::fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                tracing::debug!(key = %key, lock_id = %lock.id, owner, "lock acquired");
                Ok(lock)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match self.load_lock(key)? {
                    Some(existing) => Err(held_error(key, &existing, now)),
                    // released between link and read; report as contention
                    None => Err(StateError::LockContention {
                        namespace: key.namespace.clone(),
                        template: key.template.clone(),
                        owner: "unknown".into(),
                        lock_id: "unknown".into(),
                        age_secs: 0,
                    }),
                }
            }
            Err(e) => Err(StateError::io(target, e)),
        }
    }

    fn release(&self, key: &StateKey, lock: &Lock) -> Result<(), StateError> {
        match self.load_lock(key)? {
            None => return Ok(()),
            Some(current) if current.id != lock.id => return Err(not_held(key, lock)),
            Some(_) => {}
        }
        match self.take_lock(key, &lock.id)? {
            Taken::Removed(_) => {
                tracing::debug!(key = %key, lock_id = %lock.id, "lock released");
                Ok(())
            }
            Taken::Absent => Ok(()),
            Taken::Foreign(_) => Err(not_held(key, lock)),
        }
    }

    fn lock_info(&self, key: &StateKey) -> Result<Option<Lock>, StateError> {
        self.load_lock(key)
    }

    fn force_unlock(&self, key: &StateKey, lock_id: &str) -> Result<Lock, StateError> {
        let not_locked = || StateError::NotLocked {
            namespace: key.namespace.clone(),
            template: key.template.clone(),
        };
        let mismatch = |current: Lock| StateError::LockIdMismatch {
            namespace: key.namespace.clone(),
            template: key.template.clone(),
            given: lock_id.to_string(),
            current: current.id,
        };
        let current = self.load_lock(key)?.ok_or_else(not_locked)?;
        if current.id != lock_id {
            return Err(mismatch(current));
        }
        match self.take_lock(key, lock_id)? {
            Taken::Removed(current) => {
                tracing::warn!(key = %key, lock_id, owner = %current.owner, "lock force-removed");
                Ok(current)
            }
            Taken::Absent => Err(not_locked()),
            Taken::Foreign(current) => Err(mismatch(current)),
        }
    }

    fn describe(&self) -> String {
        format!("local ({})", self.root.display())
    }
}
