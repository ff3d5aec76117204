// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::str::FromStr;
use std::time::Duration;

use chrono::Local;
use cron::Schedule;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid delay '{0}': expected concatenated <number><s|m|h|d> segments")]
    InvalidDelay(String),
    #[error("invalid cron expression '{0}': {1}")]
    InvalidCron(String, String),
    #[error("interval must be at least one minute")]
    ZeroInterval,
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "schedule", rename_all = "snake_case")]
pub enum JobKind {
    /// Standard cron expression (second-resolution, `cron` crate syntax).
    Cron(String),
    /// Every N minutes.
    Interval(u64),
    /// Once, after a delay given in the `1h30m` grammar.
    OneShot(String),
}

/// A persisted scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job name; primary key in the store.
    pub name: String,
    pub kind: JobKind,
    /// The synthesized user message fed to the agent loop on fire.
    pub agent_prompt: String,
    pub notify: bool,
    pub paused: bool,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, kind: JobKind, prompt: impl Into<String>, notify: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            agent_prompt: prompt.into(),
            notify,
            paused: false,
        }
    }

    /// Validate the schedule of this job.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match &self.kind {
            JobKind::Cron(expr) => {
                Schedule::from_str(expr)
                    .map_err(|e| ScheduleError::InvalidCron(expr.clone(), e.to_string()))?;
                Ok(())
            }
            JobKind::Interval(0) => Err(ScheduleError::ZeroInterval),
            JobKind::Interval(_) => Ok(()),
            JobKind::OneShot(delay) => parse_delay(delay).map(|_| ()),
        }
    }

    /// Time until the next fire, from now.  `None` for a spent schedule.
    pub fn next_fire_in(&self) -> Option<Duration> {
        match &self.kind {
            JobKind::Cron(expr) => {
                let schedule = Schedule::from_str(expr).ok()?;
                let next = schedule.upcoming(Local).next()?;
                (next - Local::now()).to_std().ok()
            }
            JobKind::Interval(minutes) => Some(Duration::from_secs(minutes * 60)),
            JobKind::OneShot(delay) => parse_delay(delay).ok(),
        }
    }
}

/// Parse a concatenated delay string: `(\d+[smhd])+`, case-insensitive.
/// `"1h30m"` → 90 minutes, `"2d"` → 48 hours.
pub fn parse_delay(input: &str) -> Result<Duration, ScheduleError> {
    let whole = Regex::new(r"(?i)^(\d+[smhd])+$").expect("static regex");
    if !whole.is_match(input) {
        return Err(ScheduleError::InvalidDelay(input.to_string()));
    }
    let segment = Regex::new(r"(?i)(\d+)([smhd])").expect("static regex");
    let mut total = 0u64;
    for cap in segment.captures_iter(input) {
        let amount: u64 = cap[1]
            .parse()
            .map_err(|_| ScheduleError::InvalidDelay(input.to_string()))?;
        let unit = match cap[2].to_ascii_lowercase().as_str() {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86_400,
            _ => unreachable!("regex limits units"),
        };
        total = total.saturating_add(amount.saturating_mul(unit));
    }
    Ok(Duration::from_secs(total))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
