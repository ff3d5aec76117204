// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The turn-based agent loop.
//!
//! One submitted request drives: compaction phases → windowed provider view
//! → routed completion → tool dispatch (with confirmation gating) → result
//! injection → repeat, until a terminal stop reason or the turn limit.
//! Confirmation suspends the loop by *returning to the caller*; `resume`
//! re-enters with whatever turn budget the request has left.

use std::sync::Arc;
use std::time::Instant;

use munin_model::{ChunkSender, FinishReason, Message, ToolCall, ToolSchema};
use munin_runtime::{AuditEntry, AuditLog};
use munin_tools::{sanitize_tool_output, ToolDefinition, ToolRegistry};
use tracing::{debug, warn};

use crate::budget::ContextBudget;
use crate::compactor::{Compactor, Compressor, FLUSH_MARKER};
use crate::prompts::PromptBuilder;
use crate::router::{RouteRequest, Router};
use crate::session::Session;
use crate::skills::SkillLibrary;
use crate::window;
use crate::{AgentLibrary, ModelPreference};

/// Result of one submitted request.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(String),
    /// A confirmation-gated tool call is waiting for the user; the session
    /// holds it as its pending call until `confirm`/`deny`.
    PendingConfirmation(ToolCall),
    Error(String),
}

pub struct AgentLoop {
    router: Router,
    tools: Arc<ToolRegistry>,
    agents: Arc<AgentLibrary>,
    skills: Arc<SkillLibrary>,
    compactor: Compactor,
    compressor: Arc<Compressor>,
    budget: ContextBudget,
    prompts: PromptBuilder,
    audit: Arc<AuditLog>,
    max_turns: u32,
    untrusted_output_cap: usize,
}

/// Per-request context threaded through the loop.
struct TurnContext {
    system_prompt: String,
    tool_schemas: Vec<ToolSchema>,
    skill: Option<String>,
    agent_preference: Option<ModelPreference>,
    route_text: String,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Router,
        tools: Arc<ToolRegistry>,
        agents: Arc<AgentLibrary>,
        skills: Arc<SkillLibrary>,
        compactor: Compactor,
        compressor: Arc<Compressor>,
        budget: ContextBudget,
        prompts: PromptBuilder,
        audit: Arc<AuditLog>,
        max_turns: u32,
        untrusted_output_cap: usize,
    ) -> Self {
        Self {
            router,
            tools,
            agents,
            skills,
            compactor,
            compressor,
            budget,
            prompts,
            audit,
            max_turns,
            untrusted_output_cap,
        }
    }

    pub fn agents(&self) -> &AgentLibrary {
        &self.agents
    }

    /// Tool definitions offered for the given agent (allow-list applied).
    fn tool_definitions_for(&self, agent_name: &str) -> Vec<ToolDefinition> {
        let defs = self.tools.definitions();
        match self.agents.get(agent_name).and_then(|a| a.allowed_tools.as_ref()) {
            Some(allowed) => defs
                .into_iter()
                .filter(|d| allowed.contains(&d.name))
                .collect(),
            None => defs,
        }
    }

    fn build_context(&self, session: &Session, user_message: &str) -> TurnContext {
        let agent = self
            .agents
            .get(&session.active_agent)
            .unwrap_or_else(|| self.agents.default_agent());
        let matched = self.skills.matched(user_message, &session.enabled_skills);
        let tool_defs = self.tool_definitions_for(&agent.name);
        let system_prompt = self
            .prompts
            .build(session, agent, &matched, &tool_defs, user_message);

        TurnContext {
            system_prompt,
            tool_schemas: tool_defs
                .into_iter()
                .map(|d| ToolSchema {
                    name: d.name,
                    description: d.description,
                    parameters: d.parameters,
                })
                .collect(),
            skill: matched.first().map(|s| s.name.clone()),
            agent_preference: Some(agent.model_preference),
            route_text: user_message.to_string(),
        }
    }

    /// Process one user message to completion, confirmation, or error.
    pub async fn run(&self, session: &mut Session, user_message: &str) -> TurnOutcome {
        self.run_inner(session, user_message, None).await
    }

    /// Like [`run`](Self::run), but assistant text deltas are published
    /// through `chunks` while each completion streams.  The sink is bounded;
    /// a slow consumer loses chunks, never stalls the loop.
    pub async fn run_streaming(
        &self,
        session: &mut Session,
        user_message: &str,
        chunks: ChunkSender,
    ) -> TurnOutcome {
        self.run_inner(session, user_message, Some(&chunks)).await
    }

    async fn run_inner(
        &self,
        session: &mut Session,
        user_message: &str,
        chunks: Option<&ChunkSender>,
    ) -> TurnOutcome {
        if session.pending().is_some() {
            return TurnOutcome::Error(
                "A tool call is awaiting confirmation; confirm or deny it first".into(),
            );
        }
        session.turns_in_request = 0;
        let ctx = self.build_context(session, user_message);
        if let Err(e) = session.push(Message::user(user_message)) {
            return TurnOutcome::Error(e.to_string());
        }
        self.drive(session, &ctx, chunks).await
    }

    /// Resolve the pending tool call and re-enter the loop with the
    /// remaining turn budget.
    pub async fn resume(&self, session: &mut Session, approve: bool) -> TurnOutcome {
        let Some(call) = session.take_pending() else {
            return TurnOutcome::Error("No tool call is awaiting confirmation".into());
        };

        if approve {
            self.execute_and_append(session, &call).await;
        } else {
            debug!(tool = %call.name, "tool call denied by user");
            if let Err(e) = session.push(Message::tool_result(
                &call.id,
                "Tool execution denied by user",
                false,
            )) {
                return TurnOutcome::Error(e.to_string());
            }
        }

        // Rebuild the request context from the last real user message.
        let route_text = session
            .messages
            .iter()
            .rev()
            .find(|m| {
                m.role == munin_model::Role::User && !m.content.contains(FLUSH_MARKER)
            })
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let ctx = self.build_context(session, &route_text);
        self.drive(session, &ctx, None).await
    }

    async fn drive(
        &self,
        session: &mut Session,
        ctx: &TurnContext,
        chunks: Option<&ChunkSender>,
    ) -> TurnOutcome {
        let conversation_budget = self.budget.conversation();

        while session.turns_in_request < self.max_turns {
            // Compaction phases at the turn boundary.  Phase 2 is deferred
            // while the tail of the history is a tool result; the model has
            // not yet answered the in-flight tool exchange.
            if self.compactor.needs_flush(session, conversation_budget) {
                debug!(session = %session.id, "injecting context-maintenance flush");
                if let Err(e) = session.push(self.compactor.flush_message()) {
                    return TurnOutcome::Error(e.to_string());
                }
                session.flush_in_progress = true;
            } else if session.flush_in_progress {
                let mid_tool_exchange = session
                    .messages
                    .last()
                    .map(|m| m.is_tool_result())
                    .unwrap_or(false);
                if !mid_tool_exchange {
                    let compacted = self
                        .compactor
                        .compact(&session.messages, self.compressor.as_ref(), conversation_budget)
                        .await;
                    session.replace_messages(compacted);
                    session.flush_in_progress = false;
                }
            }

            let provider_view = window::apply(
                &session.messages,
                conversation_budget,
                Some(self.compressor.as_ref()),
            )
            .await;

            let request = RouteRequest {
                system: Some(ctx.system_prompt.clone()),
                messages: provider_view,
                tools: ctx.tool_schemas.clone(),
                explicit_tier: None,
                skill: ctx.skill.clone(),
                agent_preference: ctx.agent_preference,
                route_text: ctx.route_text.clone(),
            };

            let started = Instant::now();
            let routed = match self
                .router
                .complete(&session.id, session.forced_provider, &request, chunks)
                .await
            {
                Ok(routed) => routed,
                Err(e) => {
                    warn!(session = %session.id, error = %e, "completion failed");
                    return TurnOutcome::Error(e.to_string());
                }
            };

            session.turns_in_request += 1;
            session.track_usage(&routed.response.usage);
            let mut entry = AuditEntry::new(&session.id, "completion")
                .field("tier", routed.tier.clone())
                .field("reason", routed.reason.as_str())
                .field("stop_reason", routed.response.finish_reason.as_str())
                .field("prompt_tokens", routed.response.usage.prompt_tokens)
                .field("completion_tokens", routed.response.usage.completion_tokens)
                .duration_ms(started.elapsed().as_millis() as u64);
            if let Some(from) = &routed.escalated_from {
                entry = entry.field("escalated_from", from.clone());
            }
            self.audit.record(entry);

            let response = routed.response;
            let content = response.text().to_string();

            match response.finish_reason {
                FinishReason::ToolUse if !response.tool_calls.is_empty() => {
                    let calls = response.tool_calls.clone();
                    if let Err(e) =
                        session.push(Message::assistant_with_tool_calls(&content, calls.clone()))
                    {
                        return TurnOutcome::Error(e.to_string());
                    }
                    for call in calls {
                        if self.tools.requires_confirmation(&call.name) {
                            debug!(tool = %call.name, "suspending for confirmation");
                            if let Err(e) = session.set_pending(call.clone()) {
                                return TurnOutcome::Error(e.to_string());
                            }
                            return TurnOutcome::PendingConfirmation(call);
                        }
                        self.execute_and_append(session, &call).await;
                    }
                    // Results are in the history; give the model its next turn.
                }
                FinishReason::Length => {
                    if let Err(e) = session.push(Message::assistant(&content)) {
                        return TurnOutcome::Error(e.to_string());
                    }
                    return TurnOutcome::Completed(format!("{content} ⚠ truncated"));
                }
                reason => {
                    if reason == FinishReason::Error {
                        warn!(session = %session.id, "provider reported an error stop reason");
                    }
                    if let Err(e) = session.push(Message::assistant(&content)) {
                        return TurnOutcome::Error(e.to_string());
                    }
                    return TurnOutcome::Completed(content);
                }
            }
        }

        TurnOutcome::Error("Max turns exceeded".into())
    }

    /// Execute one tool call and fold its (trust-filtered) result into the
    /// history.  Tool failures never abort the loop.
    async fn execute_and_append(&self, session: &mut Session, call: &ToolCall) {
        let result = self.tools.execute(&session.id, call).await;
        let trust = self.tools.trust_level(&call.name);
        let text = sanitize_tool_output(result.text(), trust, self.untrusted_output_cap);
        if let Err(e) = session.push(Message::tool_result(&call.id, text, result.is_ok())) {
            // Unreachable by construction (tool results are never blocked),
            // but a corrupted session must not panic the loop.
            warn!(error = %e, "failed to append tool result");
        }
    }
}
