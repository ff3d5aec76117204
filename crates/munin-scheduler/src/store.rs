// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable job store.
//!
//! Jobs survive process restarts; the scheduler re-registers everything in
//! this store at startup.  Executions are an append-only history per job.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;

use crate::job::{JobDefinition, JobKind};

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub job_name: String,
    pub executed_at: String,
    /// "completed" or "error".
    pub status: String,
    pub duration_ms: u64,
    pub result_summary: String,
}

pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                schedule TEXT NOT NULL,
                agent_prompt TEXT NOT NULL,
                notify INTEGER NOT NULL,
                paused INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY,
                job_name TEXT NOT NULL REFERENCES jobs(name),
                executed_at TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                result_summary TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn encode_kind(kind: &JobKind) -> (&'static str, String) {
        match kind {
            JobKind::Cron(expr) => ("cron", expr.clone()),
            JobKind::Interval(minutes) => ("interval", minutes.to_string()),
            JobKind::OneShot(delay) => ("one_shot", delay.clone()),
        }
    }

    fn decode_kind(kind: &str, schedule: &str) -> Option<JobKind> {
        match kind {
            "cron" => Some(JobKind::Cron(schedule.to_string())),
            "interval" => schedule.parse().ok().map(JobKind::Interval),
            "one_shot" => Some(JobKind::OneShot(schedule.to_string())),
            _ => None,
        }
    }

    pub fn upsert(&self, job: &JobDefinition) -> anyhow::Result<()> {
        let (kind, schedule) = Self::encode_kind(&job.kind);
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO jobs (name, kind, schedule, agent_prompt, notify, paused)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                kind = excluded.kind,
                schedule = excluded.schedule,
                agent_prompt = excluded.agent_prompt,
                notify = excluded.notify,
                paused = excluded.paused",
            (
                &job.name,
                kind,
                schedule,
                &job.agent_prompt,
                job.notify as i64,
                job.paused as i64,
            ),
        )?;
        debug!(job = %job.name, "job persisted");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute("DELETE FROM executions WHERE job_name = ?1", [name])?;
        let changed = conn.execute("DELETE FROM jobs WHERE name = ?1", [name])?;
        Ok(changed > 0)
    }

    pub fn set_paused(&self, name: &str, paused: bool) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let changed = conn.execute(
            "UPDATE jobs SET paused = ?2 WHERE name = ?1",
            (name, paused as i64),
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Option<JobDefinition>> {
        Ok(self.list()?.into_iter().find(|j| j.name == name))
    }

    pub fn list(&self) -> anyhow::Result<Vec<JobDefinition>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT name, kind, schedule, agent_prompt, notify, paused FROM jobs ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut jobs = Vec::new();
        for row in rows {
            let (name, kind, schedule, prompt, notify, paused) = row?;
            if let Some(kind) = Self::decode_kind(&kind, &schedule) {
                jobs.push(JobDefinition {
                    name,
                    kind,
                    agent_prompt: prompt,
                    notify: notify != 0,
                    paused: paused != 0,
                });
            }
        }
        Ok(jobs)
    }

    pub fn record_execution(
        &self,
        job_name: &str,
        status: &str,
        duration_ms: u64,
        result_summary: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO executions (job_name, executed_at, status, duration_ms, result_summary)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                job_name,
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                status,
                duration_ms as i64,
                result_summary,
            ),
        )?;
        Ok(())
    }

    /// Most recent executions for a job, newest first.
    pub fn recent_executions(
        &self,
        job_name: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn.prepare(
            "SELECT job_name, executed_at, status, duration_ms, result_summary
             FROM executions WHERE job_name = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map((job_name, limit as i64), |row| {
            Ok(ExecutionRecord {
                job_name: row.get(0)?,
                executed_at: row.get(1)?,
                status: row.get(2)?,
                duration_ms: row.get::<_, i64>(3)? as u64,
                result_summary: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, kind: JobKind) -> JobDefinition {
        JobDefinition::new(name, kind, format!("prompt for {name}"), true)
    }

    #[test]
    fn upsert_and_list_round_trip() {
        let store = JobStore::open_in_memory().unwrap();
        store.upsert(&job("a", JobKind::Interval(5))).unwrap();
        store
            .upsert(&job("b", JobKind::Cron("0 0 8 * * *".into())))
            .unwrap();
        let jobs = store.list().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].name, "a");
        assert_eq!(jobs[0].kind, JobKind::Interval(5));
        assert_eq!(jobs[1].kind, JobKind::Cron("0 0 8 * * *".into()));
    }

    #[test]
    fn upsert_same_name_updates_in_place() {
        let store = JobStore::open_in_memory().unwrap();
        store.upsert(&job("a", JobKind::Interval(5))).unwrap();
        store.upsert(&job("a", JobKind::Interval(10))).unwrap();
        let jobs = store.list().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Interval(10));
    }

    #[test]
    fn remove_deletes_job_and_history() {
        let store = JobStore::open_in_memory().unwrap();
        store.upsert(&job("a", JobKind::Interval(5))).unwrap();
        store.record_execution("a", "completed", 12, "ok").unwrap();
        assert!(store.remove("a").unwrap());
        assert!(store.list().unwrap().is_empty());
        assert!(store.recent_executions("a", 10).unwrap().is_empty());
    }

    #[test]
    fn remove_missing_job_reports_false() {
        let store = JobStore::open_in_memory().unwrap();
        assert!(!store.remove("ghost").unwrap());
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let store = JobStore::open_in_memory().unwrap();
        store.upsert(&job("a", JobKind::Interval(5))).unwrap();
        assert!(store.set_paused("a", true).unwrap());
        assert!(store.get("a").unwrap().unwrap().paused);
        assert!(store.set_paused("a", false).unwrap());
        assert!(!store.get("a").unwrap().unwrap().paused);
    }

    #[test]
    fn executions_are_newest_first_and_limited() {
        let store = JobStore::open_in_memory().unwrap();
        store.upsert(&job("a", JobKind::Interval(5))).unwrap();
        for i in 0..5 {
            store
                .record_execution("a", "completed", i, &format!("run {i}"))
                .unwrap();
        }
        let recent = store.recent_executions("a", 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].result_summary, "run 4");
        assert_eq!(recent[2].result_summary, "run 2");
    }

    #[test]
    fn one_shot_schedule_survives_round_trip() {
        let store = JobStore::open_in_memory().unwrap();
        store
            .upsert(&job("later", JobKind::OneShot("1h30m".into())))
            .unwrap();
        assert_eq!(
            store.get("later").unwrap().unwrap().kind,
            JobKind::OneShot("1h30m".into())
        );
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        {
            let store = JobStore::open(&path).unwrap();
            store.upsert(&job("a", JobKind::Interval(5))).unwrap();
        }
        let store = JobStore::open(&path).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
