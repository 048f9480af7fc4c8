//! ST-071: Append-only JSONL run event log.
//!
//! One log per `(namespace, template)` at
//! `<audit_dir>/<namespace>/<template>/events.jsonl`. Every orchestrator
//! transition appends a line.

use crate::state::StateKey;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// A run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        action: String,
        owner: String,
        ir_fingerprint: String,
        generator: String,
    },
    LockAcquired {
        lock_id: String,
    },
    EngineStarted {
        step: String,
    },
    EngineFinished {
        step: String,
        exit_code: i32,
        duration_seconds: f64,
    },
    StateWritten {
        serial: u64,
        ir_fingerprint: String,
    },
    RunSucceeded {
        outcome: String,
        total_seconds: f64,
    },
    RunFailed {
        error: String,
    },
    LockReleased {
        lock_id: String,
    },
    ForceUnlocked {
        lock_id: String,
        previous_owner: String,
    },
}

/// Event line with timestamp and run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    pub run_id: String,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current time as ISO 8601 UTC.
pub fn now_iso8601() -> String {
    format_unix(unix_now())
}

/// Format Unix seconds as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_unix(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian `(year, month, day)`.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

fn nanos_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    format!("r-{:012x}", nanos_now() & 0xFFFF_FFFF_FFFF)
}

/// Generate a lock ID; mixes in the pid and a sequence so concurrent
/// processes and threads differ.
pub fn generate_lock_id() -> String {
    let seq = LOCK_SEQ.fetch_add(1, Ordering::Relaxed);
    let mixed = (nanos_now() as u64).wrapping_add(seq) ^ (u64::from(std::process::id()) << 40);
    format!("l-{:016x}", mixed)
}

/// Derive the event log path for a `(namespace, template)`.
pub fn event_log_path(audit_dir: &Path, key: &StateKey) -> PathBuf {
    audit_dir
        .join(&key.namespace)
        .join(&key.template)
        .join("events.jsonl")
}

/// Append an event to the log.
pub fn append_event(
    audit_dir: &Path,
    key: &StateKey,
    run_id: &str,
    event: RunEvent,
) -> std::io::Result<()> {
    let path = event_log_path(audit_dir, key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = TimestampedEvent {
        ts: now_iso8601(),
        run_id: run_id.to_string(),
        event,
    };
    let json = serde_json::to_string(&line)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{}", json)
}

/// Read every event; a missing log is empty. Unparseable lines are skipped.
pub fn read_events(audit_dir: &Path, key: &StateKey) -> std::io::Result<Vec<TimestampedEvent>> {
    let path = event_log_path(audit_dir, key);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(content
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StateKey {
        StateKey::new("prod", "network")
    }

    #[test]
    fn test_st071_format_unix_known_dates() {
        assert_eq!(format_unix(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_unix(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_unix(1_709_210_096), "2024-02-29T12:34:56Z");
        assert_eq!(format_unix(4_102_444_799), "2099-12-31T23:59:59Z");
    }

    #[test]
    fn test_st071_now_iso8601_shape() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
    }

    #[test]
    fn test_st071_ids() {
        assert!(generate_run_id().starts_with("r-"));
        let lock = generate_lock_id();
        assert!(lock.starts_with("l-"));
        assert_eq!(lock.len(), 18);
    }

    #[test]
    fn test_st071_event_log_path() {
        let p = event_log_path(Path::new("/audit"), &key());
        assert_eq!(p, PathBuf::from("/audit/prod/network/events.jsonl"));
    }

    #[test]
    fn test_st071_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        append_event(
            dir.path(),
            &key(),
            "r-1",
            RunEvent::LockAcquired {
                lock_id: "l-1".into(),
            },
        )
        .unwrap();
        append_event(
            dir.path(),
            &key(),
            "r-1",
            RunEvent::LockReleased {
                lock_id: "l-1".into(),
            },
        )
        .unwrap();
        let raw = std::fs::read_to_string(event_log_path(dir.path(), &key())).unwrap();
        assert!(raw.lines().next().unwrap().contains("\"event\":\"lock_acquired\""));
        let events = read_events(dir.path(), &key()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].run_id, "r-1");
        assert!(matches!(events[1].event, RunEvent::LockReleased { .. }));
    }

    #[test]
    fn test_st071_read_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(dir.path(), &key()).unwrap().is_empty());
    }
}
