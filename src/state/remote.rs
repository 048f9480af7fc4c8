//! ST-042: Shared state backend.
//!
//! State documents live in an object store ("bucket") and locks in a SQLite
//! lock table keyed by `(namespace, template)`. Lock inserts run inside an
//! `IMMEDIATE` transaction, so concurrent writers on the same table file are
//! serialized by SQLite and at most one insert wins.

use super::{held_error, not_held, Clock, Lock, StateBackend, StateKey, StateRecord};
use crate::error::StateError;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Key/value blob storage for state documents.
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if needed. Idempotent.
    fn ensure(&self) -> Result<(), StateError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StateError>;
    fn describe(&self) -> String;
}

/// Object store backed by a directory (one file per key).
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectStore for FsObjectStore {
    fn ensure(&self) -> Result<(), StateError> {
        std::fs::create_dir_all(&self.root).map_err(|e| StateError::io(&self.root, e))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        let path = self.root.join(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::io(path, e)),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StateError> {
        super::write_atomic(&self.root.join(key), bytes)
    }

    fn describe(&self) -> String {
        format!("bucket {}", self.root.display())
    }
}

/// In-process object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn ensure(&self) -> Result<(), StateError> {
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.objects().get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StateError> {
        self.objects().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS state_locks (
    namespace   TEXT NOT NULL,
    template    TEXT NOT NULL,
    lock_id     TEXT NOT NULL,
    owner       TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    ttl_secs    INTEGER NOT NULL,
    PRIMARY KEY (namespace, template)
);
";

/// SQLite lock table.
#[derive(Debug)]
pub struct LockTable {
    conn: Mutex<Connection>,
    location: String,
}

impl LockTable {
    pub fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self, StateError> {
        Self::init(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn init(conn: Connection, location: String) -> Result<Self, StateError> {
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lock> {
        let acquired_at: i64 = row.get(2)?;
        let ttl_secs: i64 = row.get(3)?;
        Ok(Lock {
            id: row.get(0)?,
            owner: row.get(1)?,
            acquired_at: acquired_at.max(0) as u64,
            ttl_secs: ttl_secs.max(0) as u64,
        })
    }

    fn select(conn: &Connection, key: &StateKey) -> rusqlite::Result<Option<Lock>> {
        conn.query_row(
            "SELECT lock_id, owner, acquired_at, ttl_secs FROM state_locks
             WHERE namespace = ?1 AND template = ?2",
            params![key.namespace, key.template],
            Self::row_to_lock,
        )
        .optional()
    }

    pub fn get(&self, key: &StateKey) -> Result<Option<Lock>, StateError> {
        Ok(Self::select(&self.conn(), key)?)
    }

    /// Insert `lock` unless a row exists; returns the existing row otherwise.
    pub fn insert(&self, key: &StateKey, lock: &Lock) -> Result<Option<Lock>, StateError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = Self::select(&tx, key)? {
            tx.rollback()?;
            return Ok(Some(existing));
        }
        tx.execute(
            "INSERT INTO state_locks (namespace, template, lock_id, owner, acquired_at, ttl_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.namespace,
                key.template,
                lock.id,
                lock.owner,
                lock.acquired_at as i64,
                lock.ttl_secs as i64
            ],
        )?;
        tx.commit()?;
        Ok(None)
    }

    /// Delete the row if its id is `lock_id`; true when a row was removed.
    pub fn delete(&self, key: &StateKey, lock_id: &str) -> Result<bool, StateError> {
        let changed = self.conn().execute(
            "DELETE FROM state_locks WHERE namespace = ?1 AND template = ?2 AND lock_id = ?3",
            params![key.namespace, key.template, lock_id],
        )?;
        Ok(changed > 0)
    }
}

/// Object store plus lock table.
pub struct RemoteBackend {
    store: Box<dyn ObjectStore>,
    locks: LockTable,
    clock: Arc<dyn Clock>,
}

impl RemoteBackend {
    pub fn new(store: Box<dyn ObjectStore>, locks: LockTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            locks,
            clock,
        }
    }

    fn object_key(key: &StateKey) -> String {
        format!("{}/{}/state.json", key.namespace, key.template)
    }

    fn ensure_held(&self, key: &StateKey, lock: &Lock) -> Result<(), StateError> {
        match self.locks.get(key)? {
            Some(current) if current.id == lock.id => Ok(()),
            _ => Err(not_held(key, lock)),
        }
    }
}

impl StateBackend for RemoteBackend {
    fn bootstrap(&self, namespace: &str) -> Result<(), StateError> {
        self.store.ensure()?;
        let marker = format!("{}/namespace.json", namespace);
        if self.store.get(&marker)?.is_none() {
            let body = serde_json::json!({ "namespace": namespace });
            self.store.put(&marker, &serde_json::to_vec(&body)?)?;
        }
        Ok(())
    }

    fn read(&self, key: &StateKey) -> Result<Option<StateRecord>, StateError> {
        let object = Self::object_key(key);
        match self.store.get(&object)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StateError::Corrupt {
                    location: object,
                    reason: e.to_string(),
                }),
        }
    }

    fn write(&self, key: &StateKey, record: &StateRecord, lock: &Lock) -> Result<(), StateError> {
        self.ensure_held(key, lock)?;
        let bytes = serde_json::to_vec_pretty(record)?;
        self.store.put(&Self::object_key(key), &bytes)
    }

    fn acquire(&self, key: &StateKey, owner: &str, ttl: Duration) -> Result<Lock, StateError> {
        let now = self.clock.now();
        let lock = Lock::new(owner, now, ttl);
        match self.locks.insert(key, &lock)? {
            None => {
                tracing::debug!(key = %key, lock_id = %lock.id, owner, "lock acquired");
                Ok(lock)
            }
            Some(existing) => Err(held_error(key, &existing, now)),
        }
    }

    fn release(&self, key: &StateKey, lock: &Lock) -> Result<(), StateError> {
        match self.locks.get(key)? {
            None => Ok(()),
            Some(current) if current.id == lock.id => {
                self.locks.delete(key, &lock.id)?;
                tracing::debug!(key = %key, lock_id = %lock.id, "lock released");
                Ok(())
            }
            Some(_) => Err(not_held(key, lock)),
        }
    }

    fn lock_info(&self, key: &StateKey) -> Result<Option<Lock>, StateError> {
        self.locks.get(key)
    }

    fn force_unlock(&self, key: &StateKey, lock_id: &str) -> Result<Lock, StateError> {
        let current = self.locks.get(key)?.ok_or_else(|| StateError::NotLocked {
            namespace: key.namespace.clone(),
            template: key.template.clone(),
        })?;
        if current.id != lock_id || !self.locks.delete(key, lock_id)? {
            return Err(StateError::LockIdMismatch {
                namespace: key.namespace.clone(),
                template: key.template.clone(),
                given: lock_id.to_string(),
                current: current.id,
            });
        }
        tracing::warn!(key = %key, lock_id, owner = %current.owner, "lock force-removed");
        Ok(current)
    }

    fn describe(&self) -> String {
        format!(
            "remote ({}, lock table {})",
            self.store.describe(),
            self.locks.location
        )
    }
}
