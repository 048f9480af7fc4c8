//! ST-040: State backends and locking.
//!
//! A [`StateBackend`] persists one [`StateRecord`] per `(namespace, template)`
//! and arbitrates a single write [`Lock`] for it. Locks are never replaced
//! silently: a live lock is contention, an expired one is stale and needs an
//! explicit [`StateBackend::force_unlock`] with its id.

pub mod local;
pub mod remote;

use crate::audit::eventlog;
use crate::core::synth::{Ir, GENERATOR};
use crate::core::types::BackendConfig;
use crate::error::StateError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const STATE_SCHEMA: &str = "1";

/// `(namespace, template)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub namespace: String,
    pub template: String,
}

impl StateKey {
    pub fn new(namespace: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            template: template.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.template)
    }
}

/// Last-known provisioned state of one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub schema: String,
    pub namespace: String,
    pub template: String,
    /// Increments on every successful write
    pub serial: u64,
    pub generated_at: String,
    pub generator: String,
    pub ir_fingerprint: String,
    /// IR that produced this state
    pub ir: serde_json::Value,
    /// Engine state document, opaque to strata
    pub engine_state: serde_json::Value,
    /// Engine outputs (`name -> value`)
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl StateRecord {
    pub fn new(key: &StateKey, serial: u64, ir: &Ir, engine_state: serde_json::Value) -> Self {
        let outputs = extract_outputs(&engine_state);
        Self {
            schema: STATE_SCHEMA.to_string(),
            namespace: key.namespace.clone(),
            template: key.template.clone(),
            serial,
            generated_at: eventlog::now_iso8601(),
            generator: GENERATOR.to_string(),
            ir_fingerprint: ir.fingerprint(),
            ir: ir.document().clone(),
            engine_state,
            outputs,
        }
    }

    /// Output value as a string (non-string values rendered as JSON).
    pub fn output(&self, name: &str) -> Option<String> {
        self.outputs.get(name).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Pull `outputs.<name>.value` out of an engine state document.
fn extract_outputs(engine_state: &serde_json::Value) -> BTreeMap<String, serde_json::Value> {
    engine_state
        .get("outputs")
        .and_then(serde_json::Value::as_object)
        .map(|outputs| {
            outputs
                .iter()
                .filter_map(|(k, v)| v.get("value").map(|val| (k.clone(), val.clone())))
                .collect()
        })
        .unwrap_or_default()
}

/// Mutual-exclusion record for one `(namespace, template)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: String,
    pub owner: String,
    /// Unix seconds
    pub acquired_at: u64,
    pub ttl_secs: u64,
}

impl Lock {
    pub fn new(owner: &str, now: u64, ttl: Duration) -> Self {
        Self {
            id: eventlog::generate_lock_id(),
            owner: owner.to_string(),
            acquired_at: now,
            ttl_secs: ttl.as_secs(),
        }
    }

    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.acquired_at)
    }

    /// Expired strictly after its TTL.
    pub fn is_stale(&self, now: u64) -> bool {
        self.age(now) > self.ttl_secs
    }
}

/// Error for an `acquire` that found `existing`.
pub(crate) fn held_error(key: &StateKey, existing: &Lock, now: u64) -> StateError {
    if existing.is_stale(now) {
        StateError::LockStale {
            namespace: key.namespace.clone(),
            template: key.template.clone(),
            owner: existing.owner.clone(),
            lock_id: existing.id.clone(),
            age_secs: existing.age(now),
            ttl_secs: existing.ttl_secs,
        }
    } else {
        StateError::LockContention {
            namespace: key.namespace.clone(),
            template: key.template.clone(),
            owner: existing.owner.clone(),
            lock_id: existing.id.clone(),
            age_secs: existing.age(now),
        }
    }
}

pub(crate) fn not_held(key: &StateKey, lock: &Lock) -> StateError {
    StateError::LockNotHeld {
        namespace: key.namespace.clone(),
        template: key.template.clone(),
        owner: lock.owner.clone(),
        lock_id: lock.id.clone(),
    }
}

/// Time source for lock timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Unix seconds
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        eventlog::unix_now()
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Persistence and mutual exclusion for template state.
pub trait StateBackend: Send + Sync {
    /// Prepare storage for a namespace. Idempotent.
    fn bootstrap(&self, namespace: &str) -> Result<(), StateError>;

    fn read(&self, key: &StateKey) -> Result<Option<StateRecord>, StateError>;

    /// Persist a record; `lock` must be the lock currently held.
    fn write(&self, key: &StateKey, record: &StateRecord, lock: &Lock) -> Result<(), StateError>;

    /// Take the lock or fail immediately with contention / staleness.
    fn acquire(&self, key: &StateKey, owner: &str, ttl: Duration) -> Result<Lock, StateError>;

    /// Release `lock`. Releasing an absent lock is a no-op.
    fn release(&self, key: &StateKey, lock: &Lock) -> Result<(), StateError>;

    fn lock_info(&self, key: &StateKey) -> Result<Option<Lock>, StateError>;

    /// Remove the current lock if its id is `lock_id`; returns what was removed.
    fn force_unlock(&self, key: &StateKey, lock_id: &str) -> Result<Lock, StateError>;

    fn describe(&self) -> String;
}

/// Build the configured backend; relative paths resolve against `base_dir`.
pub fn open_backend(
    config: &BackendConfig,
    base_dir: &Path,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn StateBackend>, StateError> {
    match config {
        BackendConfig::Local { root } => Ok(Box::new(local::LocalBackend::new(
            base_dir.join(root),
            clock,
        ))),
        BackendConfig::Remote { bucket, lock_table } => {
            let store = remote::FsObjectStore::new(base_dir.join(bucket));
            let locks = remote::LockTable::open(&base_dir.join(lock_table))?;
            Ok(Box::new(remote::RemoteBackend::new(
                Box::new(store),
                locks,
                clock,
            )))
        }
    }
}

/// Write `bytes` to `path` through a temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| StateError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StateError::io(path, e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Shared contract checks run against every backend.
    pub(crate) fn backend_contract(backend: &dyn StateBackend, clock: &ManualClock) {
        let key = StateKey::new("prod", "network");
        backend.bootstrap("prod").unwrap();
        backend.bootstrap("prod").unwrap();
        assert!(backend.read(&key).unwrap().is_none());
        assert!(backend.lock_info(&key).unwrap().is_none());

        let ttl = Duration::from_secs(300);
        let lock = backend.acquire(&key, "alice", ttl).unwrap();
        assert_eq!(backend.lock_info(&key).unwrap().as_ref(), Some(&lock));

        // second owner contends
        match backend.acquire(&key, "bob", ttl) {
            Err(StateError::LockContention { owner, .. }) => assert_eq!(owner, "alice"),
            other => panic!("expected contention, got {:?}", other),
        }

        // a foreign lock handle cannot write or release
        let forged = Lock {
            id: "l-forged".into(),
            owner: "bob".into(),
            acquired_at: clock.now(),
            ttl_secs: 300,
        };
        let record = StateRecord {
            schema: STATE_SCHEMA.into(),
            namespace: "prod".into(),
            template: "network".into(),
            serial: 1,
            generated_at: "2026-01-01T00:00:00Z".into(),
            generator: GENERATOR.into(),
            ir_fingerprint: "blake3:x".into(),
            ir: json!({}),
            engine_state: json!({"outputs": {"vpc": {"value": "vpc-1"}}}),
            outputs: [("vpc".to_string(), json!("vpc-1"))].into(),
        };
        assert!(matches!(
            backend.write(&key, &record, &forged),
            Err(StateError::LockNotHeld { .. })
        ));
        assert!(matches!(
            backend.release(&key, &forged),
            Err(StateError::LockNotHeld { .. })
        ));

        backend.write(&key, &record, &lock).unwrap();
        assert_eq!(backend.read(&key).unwrap(), Some(record.clone()));

        backend.release(&key, &lock).unwrap();
        // double release is a no-op
        backend.release(&key, &lock).unwrap();
        assert!(backend.lock_info(&key).unwrap().is_none());
        // writing without the lock is refused
        assert!(backend.write(&key, &record, &lock).is_err());

        // stale locks are reported, never taken over
        let old = backend.acquire(&key, "alice", ttl).unwrap();
        clock.advance(300);
        assert!(matches!(
            backend.acquire(&key, "bob", ttl),
            Err(StateError::LockContention { .. })
        ));
        clock.advance(1);
        match backend.acquire(&key, "bob", ttl) {
            Err(StateError::LockStale { age_secs, ttl_secs, lock_id, .. }) => {
                assert_eq!(age_secs, 301);
                assert_eq!(ttl_secs, 300);
                assert_eq!(lock_id, old.id);
            }
            other => panic!("expected stale, got {:?}", other),
        }
        assert_eq!(backend.lock_info(&key).unwrap(), Some(old.clone()));

        // force unlock requires the current id
        assert!(matches!(
            backend.force_unlock(&key, "l-wrong"),
            Err(StateError::LockIdMismatch { .. })
        ));
        let removed = backend.force_unlock(&key, &old.id).unwrap();
        assert_eq!(removed, old);
        assert!(matches!(
            backend.force_unlock(&key, &old.id),
            Err(StateError::NotLocked { .. })
        ));
        let fresh = backend.acquire(&key, "bob", ttl).unwrap();
        assert_eq!(fresh.owner, "bob");

        // keys are independent
        let other = StateKey::new("prod", "storage");
        backend.acquire(&other, "carol", ttl).unwrap();
    }

    #[test]
    fn test_st040_lock_staleness_boundary() {
        let lock = Lock {
            id: "l".into(),
            owner: "o".into(),
            acquired_at: 1000,
            ttl_secs: 300,
        };
        assert!(!lock.is_stale(1300));
        assert!(lock.is_stale(1301));
        assert_eq!(lock.age(900), 0);
    }

    #[test]
    fn test_st040_held_error_classification() {
        let key = StateKey::new("ns", "t");
        let lock = Lock {
            id: "l-1".into(),
            owner: "alice".into(),
            acquired_at: 0,
            ttl_secs: 10,
        };
        assert!(held_error(&key, &lock, 5).is_retryable());
        assert!(matches!(held_error(&key, &lock, 11), StateError::LockStale { .. }));
    }

    #[test]
    fn test_st040_record_outputs_extracted() {
        let state = json!({
            "version": 4,
            "outputs": {
                "xref__aws_vpc__main__id": { "value": "vpc-123", "type": "string" },
                "count": { "value": 3 }
            }
        });
        let outputs = extract_outputs(&state);
        assert_eq!(outputs["xref__aws_vpc__main__id"], json!("vpc-123"));
        let record = StateRecord {
            schema: STATE_SCHEMA.into(),
            namespace: "n".into(),
            template: "t".into(),
            serial: 1,
            generated_at: String::new(),
            generator: String::new(),
            ir_fingerprint: String::new(),
            ir: json!({}),
            engine_state: state,
            outputs,
        };
        assert_eq!(record.output("count").as_deref(), Some("3"));
        assert!(record.output("missing").is_none());
    }

    #[test]
    fn test_st040_manual_clock() {
        let c = ManualClock::new(10);
        c.advance(5);
        assert_eq!(c.now(), 15);
    }

    #[test]
    fn test_st040_write_atomic_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/state.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"x\":1}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"x\":1}");
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
