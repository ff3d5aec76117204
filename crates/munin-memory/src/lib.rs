// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Long-term memory store.
//!
//! A single SQLite FTS5 table of durable facts.  The agent writes through the
//! `memory_write` tool (notably during cooperative context compaction, when
//! the model is asked to externalize anything worth keeping before old turns
//! are summarized away) and reads through `memory_search` plus the prompt
//! builder's `<long_term_memory>` / `<memory_context>` sections.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory store error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// One recalled fact.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub content: String,
    pub category: String,
    pub created_at: String,
}

/// SQLite-backed memory store.  The connection is guarded by a mutex; memory
/// traffic is low-volume (a handful of writes per conversation) so a single
/// serialized connection is plenty.
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    pub fn open(path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MemoryError> {
        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memories USING fts5(
                content,
                category UNINDEXED,
                created_at UNINDEXED
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Store one fact.  Returns the number of stored facts so callers can
    /// report progress.
    pub fn remember(&self, content: &str, category: &str) -> Result<usize, MemoryError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO memories (content, category, created_at) VALUES (?1, ?2, ?3)",
            (
                content,
                category,
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
        )?;
        let count: usize = conn.query_row("SELECT count(*) FROM memories", [], |r| r.get(0))?;
        debug!(category, count, "memory stored");
        Ok(count)
    }

    /// Full-text search over stored facts, best match first.
    ///
    /// The query is split into terms and each term is quoted, so user text
    /// containing FTS5 operators (`-`, `*`, `"`) cannot break the MATCH
    /// expression.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = terms.join(" OR ");

        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT content, category, created_at FROM memories
             WHERE memories MATCH ?1 ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt.query_map((match_expr, limit as i64), |row| {
            Ok(MemoryEntry {
                content: row.get(0)?,
                category: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recently stored facts, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT content, category, created_at FROM memories
             ORDER BY rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(MemoryEntry {
                content: row.get(0)?,
                category: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> Result<usize, MemoryError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        Ok(conn.query_row("SELECT count(*) FROM memories", [], |r| r.get(0))?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    #[test]
    fn remember_increments_count() {
        let s = store();
        assert_eq!(s.remember("the user likes rust", "preference").unwrap(), 1);
        assert_eq!(s.remember("coffee at 9am", "habit").unwrap(), 2);
        assert_eq!(s.count().unwrap(), 2);
    }

    #[test]
    fn search_finds_matching_fact() {
        let s = store();
        s.remember("the user's cat is called Miso", "personal").unwrap();
        s.remember("the build server is at 10.0.0.5", "infra").unwrap();
        let hits = s.search("cat", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("Miso"));
        assert_eq!(hits[0].category, "personal");
    }

    #[test]
    fn search_matches_any_term() {
        let s = store();
        s.remember("the garden needs watering on fridays", "home").unwrap();
        let hits = s.search("watering schedule", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn search_with_fts_operators_does_not_error() {
        let s = store();
        s.remember("plain fact", "misc").unwrap();
        // Quotes, stars, and dashes are FTS5 syntax when unescaped.
        assert!(s.search(r#"fact* -foo "bar"#, 10).is_ok());
    }

    #[test]
    fn search_empty_query_returns_nothing() {
        let s = store();
        s.remember("something", "misc").unwrap();
        assert!(s.search("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn recent_returns_newest_first() {
        let s = store();
        s.remember("older", "a").unwrap();
        s.remember("newer", "b").unwrap();
        let recent = s.recent(10).unwrap();
        assert_eq!(recent[0].content, "newer");
        assert_eq!(recent[1].content, "older");
    }

    #[test]
    fn recent_respects_limit() {
        let s = store();
        for i in 0..5 {
            s.remember(&format!("fact {i}"), "misc").unwrap();
        }
        assert_eq!(s.recent(3).unwrap().len(), 3);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/memory.db");
        let s = MemoryStore::open(&path).unwrap();
        s.remember("persisted", "misc").unwrap();
        assert!(path.is_file());
    }
}
