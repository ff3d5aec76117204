// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Job scheduler.
//!
//! Each job runs on its own tokio task that sleeps until the next fire,
//! synthesizes a fresh scheduled session, and feeds the job's prompt into
//! the same agent loop interactive requests use.  Executions are recorded in
//! the job store; completions are passed to the notification service unless
//! they carry the heartbeat sentinel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use munin_core::{Runtime, SessionSource, TurnOutcome};

use crate::job::{JobDefinition, JobKind};
use crate::notify::Notifier;
use crate::store::{ExecutionRecord, JobStore};

/// Sentinel content meaning "all is well, nothing to report".  Jobs that
/// return it are recorded but never notified.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// Longest result summary persisted per execution.
const SUMMARY_MAX_CHARS: usize = 200;

/// Interval of the background queue-drain tick.
const DRAIN_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduledOutcome {
    Completed(String),
    Failed(String),
}

/// How the scheduler drives the agent runtime.  Abstracted so tests can
/// substitute a scripted runner.
#[async_trait::async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_scheduled(&self, prompt: &str) -> ScheduledOutcome;
}

#[async_trait::async_trait]
impl AgentRunner for Runtime {
    async fn run_scheduled(&self, prompt: &str) -> ScheduledOutcome {
        let mut session = self.new_session(SessionSource::Scheduled);
        match self.submit(&mut session, prompt).await {
            TurnOutcome::Completed(text) => ScheduledOutcome::Completed(text),
            // Nobody is present to confirm; gated tools cannot run here.
            TurnOutcome::PendingConfirmation(call) => ScheduledOutcome::Failed(format!(
                "tool '{}' requires confirmation, unavailable in scheduled sessions",
                call.name
            )),
            TurnOutcome::Error(e) => ScheduledOutcome::Failed(e),
        }
    }
}

/// Shared state reachable from job tasks.
struct SchedulerCore<R> {
    store: Arc<JobStore>,
    runner: Arc<R>,
    notifier: Arc<Notifier>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl<R: AgentRunner> SchedulerCore<R> {
    async fn fire(&self, job: &JobDefinition) {
        debug!(job = %job.name, "firing scheduled job");
        let started = Instant::now();
        let outcome = self.runner.run_scheduled(&job.agent_prompt).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, summary) = match &outcome {
            ScheduledOutcome::Completed(text) => ("completed", truncate(text)),
            ScheduledOutcome::Failed(error) => ("error", truncate(error)),
        };
        if let Err(e) = self
            .store
            .record_execution(&job.name, status, duration_ms, &summary)
        {
            warn!(job = %job.name, error = %e, "failed to record execution");
        }

        if job.notify {
            if let ScheduledOutcome::Completed(text) = &outcome {
                if text != HEARTBEAT_OK {
                    self.notifier.notify(text).await;
                }
            }
        }
    }

    fn abort_task(&self, name: &str) {
        if let Some(handle) = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
        {
            handle.abort();
        }
    }
}

fn spawn_job<R: AgentRunner + 'static>(core: &Arc<SchedulerCore<R>>, job: JobDefinition) {
    let task_core = Arc::clone(core);
    let name = job.name.clone();
    let handle = tokio::spawn(async move {
        loop {
            let Some(delay) = job.next_fire_in() else {
                warn!(job = %job.name, "schedule produced no next fire; stopping");
                break;
            };
            tokio::time::sleep(delay).await;
            task_core.fire(&job).await;
            if matches!(job.kind, JobKind::OneShot(_)) {
                if let Err(e) = task_core.store.remove(&job.name) {
                    warn!(job = %job.name, error = %e, "failed to remove spent one-shot");
                }
                break;
            }
        }
    });
    core.tasks
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(name, handle);
}

pub struct Scheduler<R: AgentRunner + 'static> {
    core: Arc<SchedulerCore<R>>,
}

impl<R: AgentRunner + 'static> Scheduler<R> {
    pub fn new(store: Arc<JobStore>, runner: Arc<R>, notifier: Arc<Notifier>) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                store,
                runner,
                notifier,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Restore persisted jobs and start the queue drainer.  Call once at
    /// boot.
    pub fn start(&self) -> anyhow::Result<()> {
        let jobs = self.core.store.list()?;
        info!(count = jobs.len(), "restoring scheduled jobs");
        for job in jobs {
            if !job.paused {
                spawn_job(&self.core, job);
            }
        }

        let drain_core = Arc::clone(&self.core);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(DRAIN_TICK).await;
                drain_core.notifier.drain().await;
            }
        });
        Ok(())
    }

    // ── Job management ────────────────────────────────────────────────────────

    pub fn add_cron(
        &self,
        name: &str,
        expression: &str,
        prompt: &str,
        notify: bool,
    ) -> anyhow::Result<()> {
        self.add(JobDefinition::new(
            name,
            JobKind::Cron(expression.to_string()),
            prompt,
            notify,
        ))
    }

    pub fn add_interval(
        &self,
        name: &str,
        minutes: u64,
        prompt: &str,
        notify: bool,
    ) -> anyhow::Result<()> {
        self.add(JobDefinition::new(
            name,
            JobKind::Interval(minutes),
            prompt,
            notify,
        ))
    }

    pub fn add_one_shot(
        &self,
        name: &str,
        delay: &str,
        prompt: &str,
        notify: bool,
    ) -> anyhow::Result<()> {
        self.add(JobDefinition::new(
            name,
            JobKind::OneShot(delay.to_string()),
            prompt,
            notify,
        ))
    }

    fn add(&self, job: JobDefinition) -> anyhow::Result<()> {
        job.validate().context("invalid job schedule")?;
        self.core.store.upsert(&job)?;
        self.core.abort_task(&job.name);
        spawn_job(&self.core, job);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> anyhow::Result<()> {
        self.core.abort_task(name);
        if !self.core.store.remove(name)? {
            bail!("no such job: {name}");
        }
        Ok(())
    }

    pub fn pause(&self, name: &str) -> anyhow::Result<()> {
        if !self.core.store.set_paused(name, true)? {
            bail!("no such job: {name}");
        }
        self.core.abort_task(name);
        Ok(())
    }

    pub fn resume(&self, name: &str) -> anyhow::Result<()> {
        if !self.core.store.set_paused(name, false)? {
            bail!("no such job: {name}");
        }
        if let Some(job) = self.core.store.get(name)? {
            self.core.abort_task(name);
            spawn_job(&self.core, job);
        }
        Ok(())
    }

    pub fn list(&self) -> anyhow::Result<Vec<JobDefinition>> {
        self.core.store.list()
    }

    /// One job's definition plus its most recent execution.
    pub fn status(&self, name: &str) -> anyhow::Result<(JobDefinition, Option<ExecutionRecord>)> {
        let Some(job) = self.core.store.get(name)? else {
            bail!("no such job: {name}");
        };
        let last = self.core.store.recent_executions(name, 1)?.into_iter().next();
        Ok((job, last))
    }

    pub fn recent_executions(
        &self,
        name: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<ExecutionRecord>> {
        self.core.store.recent_executions(name, limit)
    }

    // ── Firing ────────────────────────────────────────────────────────────────

    /// Fire a job immediately, bypassing its schedule.  Used by the CLI's
    /// `jobs run` and by tests.
    pub async fn run_job_now(&self, name: &str) -> anyhow::Result<ExecutionRecord> {
        let Some(job) = self.core.store.get(name)? else {
            bail!("no such job: {name}");
        };
        self.core.fire(&job).await;
        self.core
            .store
            .recent_executions(name, 1)?
            .into_iter()
            .next()
            .context("execution was not recorded")
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(SUMMARY_MAX_CHARS).collect();
        format!("{cut}…")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
