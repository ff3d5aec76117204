// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only audit log.
//!
//! Every security-relevant action (completions, tool executions, budget
//! downgrades, scheduler fires) is recorded as one line of JSON.  Tool input
//! and output are never stored raw; only truncated SHA-256 digests, so the
//! log can be kept long-term without leaking conversation content.
//!
//! Appends take an exclusive advisory file lock so that concurrent writers
//! (interactive sessions and scheduler jobs) never interleave partial lines
//! and a crash mid-append leaves at most one torn trailing line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use fs4::fs_std::FileExt;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Truncated SHA-256 digest (first 16 hex chars) used for tool I/O fields.
pub fn hash_digest(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// One audit record.  Serialized as a single JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// UTC ISO-8601 timestamp with microsecond precision.
    pub ts: String,
    pub session_id: String,
    pub action: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditEntry {
    pub fn new(session_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            session_id: session_id.into(),
            action: action.into(),
            fields: Map::new(),
            duration_ms: None,
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

/// Crash-safe JSONL audit sink.
///
/// The in-process mutex serializes appends between threads; the file lock
/// serializes appends between processes (the CLI and a long-running
/// scheduler daemon may share one log).
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry.  Failures are logged and swallowed; auditing must
    /// never take down the agent loop.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.try_record(&entry) {
            warn!(error = %e, action = %entry.action, "audit append failed");
        }
    }

    fn try_record(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = file
            .write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.flush());
        let _ = FileExt::unlock(&file);
        result?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(log: &AuditLog) -> Vec<Value> {
        std::fs::read_to_string(log.path())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn hash_digest_is_sixteen_hex_chars() {
        let h = hash_digest("hello");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_digest_is_stable() {
        assert_eq!(hash_digest("same input"), hash_digest("same input"));
    }

    #[test]
    fn hash_digest_differs_for_different_input() {
        assert_ne!(hash_digest("a"), hash_digest("b"));
    }

    #[test]
    fn record_appends_one_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        log.record(AuditEntry::new("s1", "completion").field("tier", "workhorse"));
        let lines = read_lines(&log);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["session_id"], "s1");
        assert_eq!(lines[0]["action"], "completion");
        assert_eq!(lines[0]["tier"], "workhorse");
    }

    #[test]
    fn records_are_append_only_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        for i in 0..5 {
            log.record(AuditEntry::new("s1", format!("act{i}")));
        }
        let lines = read_lines(&log);
        assert_eq!(lines.len(), 5);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line["action"], format!("act{i}"));
        }
    }

    #[test]
    fn timestamp_has_microsecond_precision() {
        let entry = AuditEntry::new("s", "a");
        // e.g. 2026-08-01T12:00:00.123456Z
        let frac = entry.ts.split('.').nth(1).unwrap();
        assert_eq!(frac.len(), 7, "expected 6 fractional digits + Z: {}", entry.ts);
        assert!(entry.ts.ends_with('Z'));
    }

    #[test]
    fn duration_field_serialized_when_set() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        log.record(AuditEntry::new("s", "tool_exec_end").duration_ms(42));
        let lines = read_lines(&log);
        assert_eq!(lines[0]["duration_ms"], 42);
    }

    #[test]
    fn parent_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("nested/deep/audit.jsonl"));
        log.record(AuditEntry::new("s", "a"));
        assert!(log.path().is_file());
    }

    #[test]
    fn concurrent_appends_never_tear_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = std::sync::Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
        let mut handles = Vec::new();
        for t in 0..8 {
            let log = log.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..20 {
                    log.record(
                        AuditEntry::new(format!("s{t}"), "x")
                            .field("i", i)
                            .field("pad", "p".repeat(200)),
                    );
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let lines = read_lines(&log);
        assert_eq!(lines.len(), 8 * 20);
    }
}
