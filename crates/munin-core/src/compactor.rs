// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cooperative two-phase context compaction.
//!
//! Phase 1 (flush): when the conversation crosses the soft threshold, a
//! user-role maintenance message asks the model to save anything durable to
//! long-term memory; it gets exactly one turn to do so.  Phase 2 (compact):
//! at the next turn boundary the older history is replaced with a single
//! summarized system message, keeping the last N assistant turns verbatim.
//!
//! The point of the two phases is that truncation becomes *cooperative*: the
//! model chooses what survives (via memory tools) before anything is thrown
//! away.

use std::sync::Arc;

use munin_config::TierConfig;
use munin_model::{CompletionRequest, Message, ModelProvider, Role};
use tracing::{debug, warn};

use crate::budget::{conversation_tokens, truncate_to_tokens};
use crate::session::Session;

pub const FLUSH_MARKER: &str = "[SYSTEM — CONTEXT MAINTENANCE]";
pub const COMPACTED_PREFIX: &str = "[Compacted context]";

/// Fraction of the conversation budget granted to the compaction summary.
const SUMMARY_FRACTION: f32 = 0.20;

const FLUSH_INSTRUCTIONS: &str = "Context is nearly full and older messages will be \
summarized away shortly. If this conversation contains facts worth keeping long-term \
(user preferences, decisions, commitments, important details), call the memory_write \
tool for each one now. You have exactly one turn for this; do not reply to the user.";

const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a context compaction assistant. Summarize \
the conversation below in a concise, information-dense way. Preserve decisions, names, \
dates, commitments, and unresolved questions. The summary replaces the original history.";

#[derive(Debug, Clone)]
pub struct Compactor {
    soft_threshold: f32,
    preserved_turns: usize,
    enabled: bool,
}

impl Compactor {
    pub fn new(soft_threshold: f32, preserved_turns: usize, enabled: bool) -> Self {
        Self {
            soft_threshold,
            preserved_turns,
            enabled,
        }
    }

    /// Phase 1 trigger.  False while a flush is already in progress.
    pub fn needs_flush(&self, session: &Session, conversation_budget: usize) -> bool {
        if !self.enabled || session.flush_in_progress || conversation_budget == 0 {
            return false;
        }
        let tokens = conversation_tokens(&session.messages);
        tokens as f32 >= self.soft_threshold * conversation_budget as f32
    }

    /// The user-role maintenance message injected for phase 1.
    pub fn flush_message(&self) -> Message {
        Message::user(format!("{FLUSH_MARKER} {FLUSH_INSTRUCTIONS}"))
    }

    /// Phase 2.  Splits just before the Nth-from-last assistant message,
    /// summarizes everything older, strips residual flush markers from the
    /// retained suffix, and heads the result with a single compacted-context
    /// system message.
    ///
    /// With fewer than N+1 assistant messages there is no older prefix and
    /// the input is returned unchanged; which also makes an immediate
    /// second compaction a no-op.
    pub async fn compact(
        &self,
        messages: &[Message],
        compressor: &Compressor,
        conversation_budget: usize,
    ) -> Vec<Message> {
        let assistant_positions: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Assistant)
            .map(|(i, _)| i)
            .collect();

        if assistant_positions.len() < self.preserved_turns + 1 {
            debug!(
                assistants = assistant_positions.len(),
                preserved = self.preserved_turns,
                "not enough turns to compact"
            );
            return messages.to_vec();
        }

        let split = assistant_positions[assistant_positions.len() - self.preserved_turns];
        let older: Vec<Message> = messages[..split]
            .iter()
            .filter(|m| !m.content.contains(FLUSH_MARKER))
            .cloned()
            .collect();
        let suffix: Vec<Message> = messages[split..]
            .iter()
            .filter(|m| !m.content.contains(FLUSH_MARKER))
            .cloned()
            .collect();

        let summary_budget = (conversation_budget as f32 * SUMMARY_FRACTION) as usize;
        let summary = compressor.summarize(&older, summary_budget).await;

        let mut out = Vec::with_capacity(suffix.len() + 1);
        out.push(Message::system(format!("{COMPACTED_PREFIX} {summary}")));
        out.extend(suffix);
        out
    }
}

/// Summarizes message prefixes through a fast/cheap model tier, with a
/// deterministic fallback when the model is unavailable.
pub struct Compressor {
    provider: Option<Arc<dyn ModelProvider>>,
    tier: Option<TierConfig>,
}

impl Compressor {
    pub fn new(provider: Arc<dyn ModelProvider>, tier: TierConfig) -> Self {
        Self {
            provider: Some(provider),
            tier: Some(tier),
        }
    }

    /// A compressor that always uses the deterministic fallback.
    pub fn offline() -> Self {
        Self {
            provider: None,
            tier: None,
        }
    }

    /// Summarize `messages` into at most `max_tokens` tokens.
    pub async fn summarize(&self, messages: &[Message], max_tokens: usize) -> String {
        let (Some(provider), Some(tier)) = (&self.provider, &self.tier) else {
            return Self::fallback_summary(messages, max_tokens);
        };

        let req = CompletionRequest {
            model: tier.model.clone(),
            system: Some(SUMMARIZE_SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(serialize_history(messages))],
            tools: Vec::new(),
            temperature: 0.3,
            max_tokens: tier.max_tokens,
            context_window: Some(tier.context_window),
        };

        match provider.generate(&req).await {
            Ok(response) if !response.text().trim().is_empty() => {
                truncate_to_tokens(response.text(), max_tokens).to_string()
            }
            Ok(_) => {
                warn!("compressor returned empty summary; using fallback");
                Self::fallback_summary(messages, max_tokens)
            }
            Err(e) => {
                warn!(error = %e, "compressor call failed; using fallback");
                Self::fallback_summary(messages, max_tokens)
            }
        }
    }

    /// Deterministic summary: first non-empty line of each user message,
    /// "- "-prefixed, truncated to the budget.
    pub fn fallback_summary(messages: &[Message], max_tokens: usize) -> String {
        let lines: Vec<String> = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .filter_map(|m| m.content.lines().find(|l| !l.trim().is_empty()))
            .map(|l| format!("- {}", l.trim()))
            .collect();
        let text = lines.join("\n");
        truncate_to_tokens(&text, max_tokens).to_string()
    }
}

/// Flatten messages to plain text for a summarization prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            if m.tool_calls.is_empty() {
                format!("{role}: {}", m.content)
            } else {
                let calls: Vec<String> = m
                    .tool_calls
                    .iter()
                    .map(|c| format!("[tool_call: {}({})]", c.name, c.arguments_value()))
                    .collect();
                format!("{role}: {} {}", m.content, calls.join(" "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use munin_model::ScriptedProvider;

    fn compactor() -> Compactor {
        Compactor::new(0.75, 3, true)
    }

    fn turn(i: usize) -> [Message; 2] {
        [
            Message::user(format!("user turn {i} asking about something specific")),
            Message::assistant(format!("assistant turn {i} answering at length here")),
        ]
    }

    fn history(turns: usize) -> Vec<Message> {
        (0..turns).flat_map(turn).collect()
    }

    // ── Phase 1: flush trigger ────────────────────────────────────────────────

    #[test]
    fn flush_triggers_at_soft_threshold() {
        let c = compactor();
        let mut session = Session::new();
        for m in history(20) {
            session.push(m).unwrap();
        }
        let tokens = conversation_tokens(&session.messages);
        // Budget chosen so the history sits just above 75%.
        let budget = (tokens as f32 / 0.76) as usize;
        assert!(c.needs_flush(&session, budget));
    }

    #[test]
    fn flush_does_not_trigger_under_threshold() {
        let c = compactor();
        let mut session = Session::new();
        for m in history(2) {
            session.push(m).unwrap();
        }
        assert!(!c.needs_flush(&session, 100_000));
    }

    #[test]
    fn flush_suppressed_while_in_progress() {
        let c = compactor();
        let mut session = Session::new();
        for m in history(20) {
            session.push(m).unwrap();
        }
        session.flush_in_progress = true;
        assert!(!c.needs_flush(&session, 10));
    }

    #[test]
    fn flush_suppressed_when_disabled() {
        let c = Compactor::new(0.75, 3, false);
        let mut session = Session::new();
        for m in history(20) {
            session.push(m).unwrap();
        }
        assert!(!c.needs_flush(&session, 10));
    }

    #[test]
    fn flush_message_is_user_role_with_marker() {
        let msg = compactor().flush_message();
        assert_eq!(msg.role, Role::User);
        assert!(msg.content.starts_with(FLUSH_MARKER));
        assert!(msg.content.contains("one turn"));
        assert!(msg.content.contains("memory_write"));
    }

    // ── Phase 2: compaction ───────────────────────────────────────────────────

    #[tokio::test]
    async fn compact_preserves_last_n_assistant_turns() {
        let c = compactor();
        let msgs = history(10);
        let out = c.compact(&msgs, &Compressor::offline(), 1000).await;
        assert_eq!(out[0].role, Role::System);
        assert!(out[0].content.starts_with(COMPACTED_PREFIX));
        let assistants = out.iter().filter(|m| m.role == Role::Assistant).count();
        assert_eq!(assistants, 3);
        // The retained suffix is the last 3 turns with their user messages.
        assert!(out.iter().any(|m| m.content.contains("user turn 7")));
        assert!(out.iter().any(|m| m.content.contains("assistant turn 9")));
        assert!(!out.iter().any(|m| m.content.contains("assistant turn 6")));
    }

    #[tokio::test]
    async fn compact_with_too_few_turns_is_a_no_op() {
        let c = compactor();
        let msgs = history(3); // exactly N assistant messages, need N+1
        let out = c.compact(&msgs, &Compressor::offline(), 1000).await;
        assert_eq!(out.len(), msgs.len());
        assert!(!out[0].content.starts_with(COMPACTED_PREFIX));
    }

    #[tokio::test]
    async fn second_compact_is_idempotent() {
        let c = compactor();
        let msgs = history(10);
        let once = c.compact(&msgs, &Compressor::offline(), 1000).await;
        let twice = c.compact(&once, &Compressor::offline(), 1000).await;
        assert_eq!(once.len(), twice.len());
        let compacted_headers = twice
            .iter()
            .filter(|m| m.content.starts_with(COMPACTED_PREFIX))
            .count();
        assert_eq!(compacted_headers, 1);
    }

    #[tokio::test]
    async fn compact_strips_flush_markers_from_suffix() {
        let c = compactor();
        let mut msgs = history(5);
        msgs.push(c.flush_message());
        msgs.extend(history(4)); // markers now sit in the middle
        let out = c.compact(&msgs, &Compressor::offline(), 1000).await;
        assert!(
            !out.iter().any(|m| m.content.contains(FLUSH_MARKER)),
            "flush markers must not survive compaction"
        );
    }

    #[tokio::test]
    async fn compact_summary_contains_older_user_content() {
        let c = compactor();
        let msgs = history(10);
        let out = c.compact(&msgs, &Compressor::offline(), 1000).await;
        assert!(
            out[0].content.contains("user turn 0"),
            "fallback summary should reference old user turns: {}",
            out[0].content
        );
    }

    // ── Compressor ────────────────────────────────────────────────────────────

    fn tier() -> TierConfig {
        TierConfig {
            provider: "ollama".into(),
            model: "llama3.2:1b".into(),
            temperature: 0.3,
            max_tokens: 512,
            context_window: 8192,
            api_key: None,
        }
    }

    #[tokio::test]
    async fn compressor_uses_model_summary() {
        let provider = Arc::new(ScriptedProvider::always_text(
            "User planned a trip; assistant booked nothing yet.",
        ));
        let c = Compressor::new(provider, tier());
        let summary = c.summarize(&history(5), 100).await;
        assert!(summary.contains("trip"));
    }

    #[tokio::test]
    async fn compressor_falls_back_on_error() {
        let provider = Arc::new(munin_model::FlakyProvider::new(100, vec![]));
        let c = Compressor::new(provider, tier());
        let summary = c.summarize(&history(3), 100).await;
        assert!(summary.starts_with("- user turn 0"));
    }

    #[tokio::test]
    async fn compressor_falls_back_on_empty_summary() {
        let provider = Arc::new(ScriptedProvider::always_text(""));
        let c = Compressor::new(provider, tier());
        let summary = c.summarize(&history(3), 100).await;
        assert!(summary.starts_with("- "));
    }

    #[tokio::test]
    async fn compressor_truncates_to_budget() {
        let long = "word ".repeat(500);
        let provider = Arc::new(ScriptedProvider::always_text(long));
        let c = Compressor::new(provider, tier());
        let summary = c.summarize(&history(3), 10).await;
        assert!(crate::budget::estimate_tokens(&summary) <= 10);
    }

    #[test]
    fn fallback_skips_non_user_messages() {
        let msgs = vec![
            Message::system("system stuff"),
            Message::user("first question"),
            Message::assistant("an answer"),
            Message::tool_result("c", "tool output", true),
        ];
        let summary = Compressor::fallback_summary(&msgs, 100);
        assert_eq!(summary, "- first question");
    }

    #[test]
    fn serialize_history_includes_tool_calls() {
        let msgs = vec![Message::assistant_with_tool_calls(
            "",
            vec![munin_model::ToolCall::new(
                "c1",
                "memory_write",
                serde_json::json!({"content": "fact"}),
            )],
        )];
        let text = serialize_history(&msgs);
        assert!(text.contains("memory_write"));
        assert!(text.contains("fact"));
    }
}
