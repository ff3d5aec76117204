// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Usage ledger and cloud budget tracking.
//!
//! Every completion is appended to a daily JSONL file (keyed by the record's
//! own local date, not the reader's clock) and mirrored into a SQLite budget
//! table when it cost money.  Records are never mutated or deleted; spend
//! queries aggregate over them.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Local, Utc};
use munin_model::pricing;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One completed model call.  Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    /// Local date the record belongs to; ledger files are keyed by this.
    pub local_date: String,
    pub provider: String,
    pub tier: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub finish_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
}

impl UsageRecord {
    pub fn now(provider: &str, tier: &str, model: &str) -> Self {
        let timestamp = Utc::now();
        Self {
            timestamp,
            local_date: timestamp
                .with_timezone(&Local)
                .format("%Y-%m-%d")
                .to_string(),
            provider: provider.into(),
            tier: tier.into(),
            model: model.into(),
            prompt_tokens: 0,
            completion_tokens: 0,
            latency_ms: 0,
            cost_usd: 0.0,
            finish_reason: "stop".into(),
            escalated_from: None,
            skill: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub daily_limit_usd: f64,
    pub monthly_limit_usd: f64,
    pub spent_today_usd: f64,
    pub remaining_today_usd: f64,
    pub monthly_cloud_spend_usd: f64,
    pub can_use_cloud: bool,
}

/// Thread-safe usage tracker.
///
/// The in-memory record list mirrors today's ledger file (loaded at open) so
/// spend queries stay constant-time-ish without re-reading disk.
pub struct UsageTracker {
    ledger_dir: PathBuf,
    daily_limit: f64,
    monthly_limit: f64,
    /// Input USD/MTok of the reference escalation model, used to price the
    /// `can_use_cloud(estimated_tokens)` query.
    reference_input_rate: f64,
    records: Mutex<Vec<UsageRecord>>,
    budget_db: Mutex<Connection>,
}

impl UsageTracker {
    pub fn open(
        ledger_dir: &Path,
        budget_db_path: &Path,
        daily_limit: f64,
        monthly_limit: f64,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(ledger_dir)?;
        if let Some(parent) = budget_db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(budget_db_path)?;
        Self::with_connection(ledger_dir.to_path_buf(), conn, daily_limit, monthly_limit)
    }

    pub fn open_in_memory(
        ledger_dir: &Path,
        daily_limit: f64,
        monthly_limit: f64,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(ledger_dir)?;
        Self::with_connection(
            ledger_dir.to_path_buf(),
            Connection::open_in_memory()?,
            daily_limit,
            monthly_limit,
        )
    }

    fn with_connection(
        ledger_dir: PathBuf,
        conn: Connection,
        daily_limit: f64,
        monthly_limit: f64,
    ) -> anyhow::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cloud_calls (
                id INTEGER PRIMARY KEY,
                timestamp TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL
            );",
        )?;

        let tracker = Self {
            ledger_dir,
            daily_limit,
            monthly_limit,
            reference_input_rate: pricing::price_for("claude-3-5-haiku-20241022")
                .map(|(input, _)| input)
                .unwrap_or(1.0),
            records: Mutex::new(Vec::new()),
            budget_db: Mutex::new(conn),
        };
        tracker.load_today();
        Ok(tracker)
    }

    fn ledger_path(&self, local_date: &str) -> PathBuf {
        self.ledger_dir.join(format!("usage-{local_date}.jsonl"))
    }

    /// Reload today's ledger file into memory (process restart continuity).
    fn load_today(&self) {
        let today = Local::now().format("%Y-%m-%d").to_string();
        let path = self.ledger_path(&today);
        let Ok(text) = std::fs::read_to_string(&path) else {
            return;
        };
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        for line in text.lines() {
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(rec) => records.push(rec),
                Err(e) => warn!(error = %e, "skipping malformed usage ledger line"),
            }
        }
    }

    /// Append one record.  Never mutates or reorders earlier entries.
    pub fn record(&self, record: UsageRecord) {
        if let Ok(line) = serde_json::to_string(&record) {
            let path = self.ledger_path(&record.local_date);
            let result = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| {
                    use std::io::Write;
                    f.write_all(line.as_bytes())?;
                    f.write_all(b"\n")
                });
            if let Err(e) = result {
                warn!(error = %e, "usage ledger append failed");
            }
        }

        if record.cost_usd > 0.0 {
            let db = self.budget_db.lock().unwrap_or_else(|p| p.into_inner());
            let result = db.execute(
                "INSERT INTO cloud_calls
                 (timestamp, model, prompt_tokens, completion_tokens, cost_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (
                    record.timestamp.to_rfc3339(),
                    &record.model,
                    record.prompt_tokens,
                    record.completion_tokens,
                    record.cost_usd,
                ),
            );
            if let Err(e) = result {
                warn!(error = %e, "budget db insert failed");
            }
        }

        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
    }

    /// USD spent today, by the records' own dates.
    pub fn spent_today(&self) -> f64 {
        let today = Local::now().format("%Y-%m-%d").to_string();
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.local_date == today)
            .map(|r| r.cost_usd)
            .sum()
    }

    pub fn remaining_today(&self) -> f64 {
        (self.daily_limit - self.spent_today()).max(0.0)
    }

    /// Total cloud spend for the current calendar month, from the budget DB.
    pub fn monthly_cloud_spend(&self) -> f64 {
        let prefix = format!("{:04}-{:02}", Local::now().year(), Local::now().month());
        let db = self.budget_db.lock().unwrap_or_else(|p| p.into_inner());
        db.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cloud_calls
             WHERE timestamp LIKE ?1 || '%'",
            [prefix],
            |row| row.get(0),
        )
        .unwrap_or(0.0)
    }

    /// Whether a cloud call estimated at `estimated_tokens` input tokens fits
    /// both the daily and monthly caps.
    pub fn can_use_cloud(&self, estimated_tokens: u32) -> bool {
        let estimated_cost = estimated_tokens as f64 * self.reference_input_rate / 1e6;
        self.remaining_today() >= estimated_cost && self.monthly_cloud_spend() < self.monthly_limit
    }

    pub fn usage_summary(&self) -> UsageSummary {
        UsageSummary {
            daily_limit_usd: self.daily_limit,
            monthly_limit_usd: self.monthly_limit,
            spent_today_usd: self.spent_today(),
            remaining_today_usd: self.remaining_today(),
            monthly_cloud_spend_usd: self.monthly_cloud_spend(),
            can_use_cloud: self.can_use_cloud(4096),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(daily: f64, monthly: f64) -> (UsageTracker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let t = UsageTracker::open_in_memory(dir.path(), daily, monthly).unwrap();
        (t, dir)
    }

    fn cloud_record(cost: f64) -> UsageRecord {
        let mut r = UsageRecord::now("anthropic", "cloud_fast", "claude-3-5-haiku-20241022");
        r.cost_usd = cost;
        r
    }

    #[test]
    fn fresh_tracker_has_zero_spend() {
        let (t, _d) = tracker(2.0, 25.0);
        assert_eq!(t.spent_today(), 0.0);
        assert_eq!(t.remaining_today(), 2.0);
        assert_eq!(t.monthly_cloud_spend(), 0.0);
    }

    #[test]
    fn spend_accumulates_monotonically() {
        let (t, _d) = tracker(2.0, 25.0);
        let mut last = 0.0;
        for _ in 0..4 {
            t.record(cloud_record(0.25));
            let now = t.spent_today();
            assert!(now > last);
            last = now;
        }
        assert!((last - 1.0).abs() < 1e-9);
    }

    #[test]
    fn remaining_never_goes_negative() {
        let (t, _d) = tracker(0.5, 25.0);
        t.record(cloud_record(2.0));
        assert_eq!(t.remaining_today(), 0.0);
    }

    #[test]
    fn can_use_cloud_true_under_budget() {
        let (t, _d) = tracker(2.0, 25.0);
        assert!(t.can_use_cloud(4096));
    }

    #[test]
    fn can_use_cloud_false_when_daily_cap_hit() {
        let (t, _d) = tracker(2.0, 25.0);
        t.record(cloud_record(2.5));
        assert!(!t.can_use_cloud(4096));
    }

    #[test]
    fn can_use_cloud_false_when_monthly_cap_hit() {
        let (t, _d) = tracker(100.0, 1.0);
        t.record(cloud_record(1.5));
        assert!(!t.can_use_cloud(4096));
    }

    #[test]
    fn local_records_do_not_touch_budget_db() {
        let (t, _d) = tracker(2.0, 25.0);
        let mut r = UsageRecord::now("ollama", "workhorse", "qwen2.5:7b");
        r.cost_usd = 0.0;
        t.record(r);
        assert_eq!(t.monthly_cloud_spend(), 0.0);
        assert_eq!(t.spent_today(), 0.0);
    }

    #[test]
    fn records_are_persisted_to_daily_ledger() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = UsageTracker::open_in_memory(dir.path(), 2.0, 25.0).unwrap();
            t.record(cloud_record(0.10));
        }
        let today = Local::now().format("%Y-%m-%d").to_string();
        let path = dir.path().join(format!("usage-{today}.jsonl"));
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 1);
        let rec: UsageRecord = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(rec.tier, "cloud_fast");
    }

    #[test]
    fn reopening_reloads_todays_spend() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = UsageTracker::open_in_memory(dir.path(), 2.0, 25.0).unwrap();
            t.record(cloud_record(0.75));
        }
        let t = UsageTracker::open_in_memory(dir.path(), 2.0, 25.0).unwrap();
        assert!((t.spent_today() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn usage_summary_reflects_state() {
        let (t, _d) = tracker(2.0, 25.0);
        t.record(cloud_record(0.5));
        let s = t.usage_summary();
        assert_eq!(s.daily_limit_usd, 2.0);
        assert!((s.spent_today_usd - 0.5).abs() < 1e-9);
        assert!((s.remaining_today_usd - 1.5).abs() < 1e-9);
        assert!(s.can_use_cloud);
    }

    #[test]
    fn escalated_from_round_trips_through_ledger() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = UsageTracker::open_in_memory(dir.path(), 2.0, 25.0).unwrap();
            let mut r = cloud_record(0.1);
            r.escalated_from = Some("workhorse".into());
            t.record(r);
        }
        let t = UsageTracker::open_in_memory(dir.path(), 2.0, 25.0).unwrap();
        let records = t.records.lock().unwrap();
        assert_eq!(records[0].escalated_from.as_deref(), Some("workhorse"));
    }
}
