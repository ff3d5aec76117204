// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The runtime facade: owns every shared component and exposes the
//! submit/confirm/deny surface that front-ends and the scheduler call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use munin_config::Config;
use munin_memory::MemoryStore;
use munin_model::{AnthropicProvider, ModelProvider, OllamaProvider};
use munin_runtime::AuditLog;
use munin_tools::builtin::{
    LocalProcessSandbox, MemorySearchTool, MemoryWriteTool, ShellTool,
};
use munin_tools::ToolRegistry;
use tracing::info;

use crate::agent::{AgentLoop, TurnOutcome};
use crate::budget::ContextBudget;
use crate::compactor::{Compactor, Compressor};
use crate::prompts::PromptBuilder;
use crate::router::Router;
use crate::session::{Session, SessionSource};
use crate::skills::SkillLibrary;
use crate::usage::{UsageSummary, UsageTracker};
use crate::AgentLibrary;

pub struct Runtime {
    agent_loop: AgentLoop,
    agents: Arc<AgentLibrary>,
    usage: Arc<UsageTracker>,
    audit: Arc<AuditLog>,
}

impl Runtime {
    /// Standard production wiring from a validated config.
    pub fn build(config: &Config) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;

        let state_dir = &config.paths.state_dir;
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;

        let audit = Arc::new(AuditLog::new(state_dir.join("audit.jsonl")));
        let usage = Arc::new(UsageTracker::open(
            &state_dir.join("usage"),
            &state_dir.join("budget.db"),
            config.budget.daily_usd,
            config.budget.monthly_usd,
        )?);
        let memory = Arc::new(MemoryStore::open(&state_dir.join("memory.db"))?);

        let ollama: Arc<dyn ModelProvider> = Arc::new(OllamaProvider::new(
            config.models.ollama_base_url.clone(),
            config.models.keep_alive.clone(),
        ));
        let anthropic: Arc<dyn ModelProvider> = Arc::new(AnthropicProvider::from_env(
            config.models.anthropic_base_url.clone(),
        ));
        let mut providers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
        providers.insert("ollama".into(), ollama);
        providers.insert("anthropic".into(), anthropic);

        let mut registry = ToolRegistry::new(
            Duration::from_secs(config.tools.max_execution_time_seconds),
            Arc::clone(&audit),
        );
        registry.register(MemoryWriteTool::new(Arc::clone(&memory)));
        registry.register(MemorySearchTool::new(Arc::clone(&memory)));
        registry.register(ShellTool::new(Arc::new(LocalProcessSandbox)));
        let registry = Arc::new(registry);

        let agents = Arc::new(match &config.paths.agents_dir {
            Some(dir) if dir.is_dir() => AgentLibrary::load_dir(dir)?,
            _ => AgentLibrary::with_default(),
        });
        let skills = Arc::new(match &config.paths.skills_dir {
            Some(dir) if dir.is_dir() => SkillLibrary::load_dir(dir, &registry)?,
            _ => SkillLibrary::empty(),
        });

        // The compressor runs on the configured fast tier; config validation
        // already guaranteed the tier exists.
        let compressor_tier = config
            .models
            .tiers
            .get(&config.context.compressor_tier)
            .cloned()
            .context("compressor tier missing")?;
        let compressor_provider = providers
            .get(&compressor_tier.provider)
            .cloned()
            .context("compressor provider missing")?;
        let compressor = Arc::new(Compressor::new(compressor_provider, compressor_tier));

        let default_window = config
            .models
            .tiers
            .get(&config.models.default_tier)
            .map(|t| t.context_window as usize)
            .unwrap_or(32_768);
        let budget = ContextBudget::new(default_window);

        let router = Router::new(
            &config.models,
            providers,
            Arc::clone(&usage),
            Arc::clone(&audit),
        );
        let compactor = Compactor::new(
            config.context.soft_threshold,
            config.context.preserved_turns,
            config.context.compaction_enabled,
        );
        let prompts = PromptBuilder::new(budget, Some(Arc::clone(&memory)));

        let agent_loop = AgentLoop::new(
            router,
            registry,
            Arc::clone(&agents),
            skills,
            compactor,
            compressor,
            budget,
            prompts,
            Arc::clone(&audit),
            config.session.max_turns,
            config.tools.untrusted_output_max_chars,
        );

        info!(
            state_dir = %state_dir.display(),
            agents = agents.names().len(),
            "runtime assembled"
        );
        Ok(Self {
            agent_loop,
            agents,
            usage,
            audit,
        })
    }

    /// Dependency-injected wiring for tests and embedders.
    pub fn from_parts(
        agent_loop: AgentLoop,
        agents: Arc<AgentLibrary>,
        usage: Arc<UsageTracker>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            agent_loop,
            agents,
            usage,
            audit,
        }
    }

    pub fn new_session(&self, source: SessionSource) -> Session {
        Session::with_source(source)
    }

    /// Process one user message: dispatch to an agent, then run the loop.
    pub async fn submit(&self, session: &mut Session, user_message: &str) -> TurnOutcome {
        let (agent, rest) = self.agents.dispatch(user_message);
        session.active_agent = agent.name.clone();
        self.agent_loop.run(session, rest).await
    }

    /// Streaming variant of [`submit`](Self::submit): assistant text deltas
    /// are published through `chunks` while completions stream.
    pub async fn submit_streaming(
        &self,
        session: &mut Session,
        user_message: &str,
        chunks: munin_model::ChunkSender,
    ) -> TurnOutcome {
        let (agent, rest) = self.agents.dispatch(user_message);
        session.active_agent = agent.name.clone();
        self.agent_loop.run_streaming(session, rest, chunks).await
    }

    /// Approve the session's pending tool call and continue the loop.
    pub async fn confirm(&self, session: &mut Session) -> TurnOutcome {
        self.agent_loop.resume(session, true).await
    }

    /// Reject the session's pending tool call and continue the loop.
    pub async fn deny(&self, session: &mut Session) -> TurnOutcome {
        self.agent_loop.resume(session, false).await
    }

    pub fn usage_summary(&self) -> UsageSummary {
        self.usage.usage_summary()
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }
}
