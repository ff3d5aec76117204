// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic system prompt assembly.
//!
//! XML-tagged sections in a stable order; empty sections are omitted and
//! each section is truncated to its context-budget share before assembly.
//! Long-term memory is never injected for group sessions; other people's
//! messages must not surface the owner's private notes.

use std::sync::Arc;

use munin_memory::MemoryStore;
use munin_runtime::system_info_block;
use munin_tools::ToolDefinition;
use tracing::warn;

use crate::budget::{truncate_to_tokens, ContextBudget};
use crate::session::{Session, SessionSource};
use crate::skills::SkillDefinition;
use crate::AgentDefinition;

const DEFAULT_OPERATING_INSTRUCTIONS: &str = "Answer directly and keep responses short \
unless the user asks for depth. Use tools when they genuinely help; never invent tool \
results. Save durable facts with memory_write when the user shares something worth \
remembering.";

const RECENT_MEMORY_LIMIT: usize = 8;
const MEMORY_CONTEXT_LIMIT: usize = 5;

pub struct PromptBuilder {
    budget: ContextBudget,
    memory: Option<Arc<MemoryStore>>,
    user_context: Option<String>,
    operating_instructions: String,
}

impl PromptBuilder {
    pub fn new(budget: ContextBudget, memory: Option<Arc<MemoryStore>>) -> Self {
        Self {
            budget,
            memory,
            user_context: None,
            operating_instructions: DEFAULT_OPERATING_INSTRUCTIONS.into(),
        }
    }

    /// Static facts about the user (name, location, standing preferences).
    pub fn with_user_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.user_context = (!context.is_empty()).then_some(context);
        self
    }

    /// Assemble the system prompt for one request.
    pub fn build(
        &self,
        session: &Session,
        agent: &AgentDefinition,
        skills: &[&SkillDefinition],
        tools: &[ToolDefinition],
        user_message: &str,
    ) -> String {
        let mut sections: Vec<String> = Vec::new();

        let system_budget = self.budget.tokens_for("system_prompt").unwrap_or(0);
        let skills_budget = self.budget.tokens_for("skills").unwrap_or(0);
        let memory_budget = self.budget.tokens_for("memory").unwrap_or(0);

        let mut soul = agent.persona.clone();
        if let Some(policy) = &agent.tool_policy {
            soul.push_str("\n\n");
            soul.push_str(policy);
        }
        push_section(&mut sections, "soul", &soul, system_budget);

        push_section(
            &mut sections,
            "operating_instructions",
            &self.operating_instructions,
            system_budget,
        );

        if let Some(context) = &self.user_context {
            push_section(&mut sections, "user_context", context, system_budget);
        }

        // Long-term memory is private to the owner: it is injected for
        // interactive and private sessions only; never for group chats, and
        // not for scheduler-synthesized sessions.
        let memory_allowed = matches!(
            session.source,
            None | Some(SessionSource::Interactive) | Some(SessionSource::Private)
        );
        if memory_allowed {
            if let Some(store) = &self.memory {
                push_section(
                    &mut sections,
                    "long_term_memory",
                    &render_recent(store),
                    memory_budget / 2,
                );
                push_section(
                    &mut sections,
                    "memory_context",
                    &render_relevant(store, user_message),
                    memory_budget / 2,
                );
            }
        }

        push_section(
            &mut sections,
            "available_tools",
            &render_tools(tools),
            system_budget,
        );

        push_section(
            &mut sections,
            "active_skills",
            &render_skills(skills),
            skills_budget,
        );

        push_section(&mut sections, "system_info", &system_info_block(), system_budget);

        sections.join("\n\n")
    }
}

fn push_section(sections: &mut Vec<String>, tag: &str, content: &str, max_tokens: usize) {
    let content = content.trim();
    if content.is_empty() {
        return;
    }
    let truncated = truncate_to_tokens(content, max_tokens);
    if truncated.is_empty() {
        return;
    }
    sections.push(format!("<{tag}>\n{truncated}\n</{tag}>"));
}

fn render_recent(store: &MemoryStore) -> String {
    match store.recent(RECENT_MEMORY_LIMIT) {
        Ok(entries) => entries
            .iter()
            .map(|e| format!("- [{}] {}", e.category, e.content))
            .collect::<Vec<_>>()
            .join("\n"),
        Err(e) => {
            warn!(error = %e, "failed to read recent memories");
            String::new()
        }
    }
}

fn render_relevant(store: &MemoryStore, user_message: &str) -> String {
    match store.search(user_message, MEMORY_CONTEXT_LIMIT) {
        Ok(entries) => entries
            .iter()
            .map(|e| format!("- {}", e.content))
            .collect::<Vec<_>>()
            .join("\n"),
        Err(e) => {
            warn!(error = %e, "memory context search failed");
            String::new()
        }
    }
}

fn render_tools(tools: &[ToolDefinition]) -> String {
    tools
        .iter()
        .map(|t| {
            let gated = if t.requires_confirmation {
                " (asks for confirmation)"
            } else {
                ""
            };
            format!("- {}: {}{}", t.name, t.description, gated)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_skills(skills: &[&SkillDefinition]) -> String {
    skills
        .iter()
        .map(|s| {
            format!(
                "<skill name=\"{}\" description=\"{}\">\n{}\n</skill>",
                s.name, s.description, s.body
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentLibrary;
    use crate::session::SessionSource;
    use crate::ModelPreference;
    use serde_json::json;

    fn builder(memory: Option<Arc<MemoryStore>>) -> PromptBuilder {
        PromptBuilder::new(ContextBudget::new(32_768), memory)
    }

    fn tool_def(name: &str, confirm: bool) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: format!("{name} tool"),
            parameters: json!({"type": "object"}),
            requires_confirmation: confirm,
            trust_level: munin_tools::TrustLevel::Trusted,
        }
    }

    fn skill(name: &str) -> SkillDefinition {
        SkillDefinition {
            name: name.into(),
            description: format!("{name} description"),
            required_tools: vec![],
            model_preference: ModelPreference::Auto,
            auto_activate: true,
            triggers: vec![],
            body: format!("Body of {name}."),
        }
    }

    #[test]
    fn sections_appear_in_stable_order() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        store.remember("user prefers tea", "preference").unwrap();
        let lib = AgentLibrary::with_default();
        let prompt = builder(Some(store)).with_user_context("Name: Alex").build(
            &Session::new(),
            lib.default_agent(),
            &[&skill("recall")],
            &[tool_def("memory_write", false)],
            "tea please",
        );
        let order = [
            "<soul>",
            "<operating_instructions>",
            "<user_context>",
            "<long_term_memory>",
            "<memory_context>",
            "<available_tools>",
            "<active_skills>",
            "<system_info>",
        ];
        let mut last = 0;
        for tag in order {
            let pos = prompt.find(tag).unwrap_or_else(|| panic!("{tag} missing"));
            assert!(pos > last || last == 0, "{tag} out of order");
            last = pos;
        }
    }

    #[test]
    fn empty_sections_are_omitted() {
        let lib = AgentLibrary::with_default();
        let prompt = builder(None).build(
            &Session::new(),
            lib.default_agent(),
            &[],
            &[],
            "hello",
        );
        assert!(!prompt.contains("<user_context>"));
        assert!(!prompt.contains("<long_term_memory>"));
        assert!(!prompt.contains("<memory_context>"));
        assert!(!prompt.contains("<active_skills>"));
        assert!(!prompt.contains("<available_tools>"));
        assert!(prompt.contains("<soul>"));
    }

    #[test]
    fn group_sessions_never_get_long_term_memory() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        store.remember("private fact", "personal").unwrap();
        let lib = AgentLibrary::with_default();
        let session = Session::with_source(SessionSource::Group);
        let prompt = builder(Some(store)).build(
            &session,
            lib.default_agent(),
            &[],
            &[],
            "private fact please",
        );
        assert!(!prompt.contains("<long_term_memory>"));
        assert!(!prompt.contains("<memory_context>"));
        assert!(!prompt.contains("private fact"));
    }

    #[test]
    fn scheduled_sessions_do_not_get_long_term_memory() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        store.remember("private fact", "personal").unwrap();
        let lib = AgentLibrary::with_default();
        let session = Session::with_source(SessionSource::Scheduled);
        let prompt = builder(Some(store)).build(
            &session,
            lib.default_agent(),
            &[],
            &[],
            "private fact please",
        );
        assert!(!prompt.contains("<long_term_memory>"));
    }

    #[test]
    fn private_sessions_do_get_memory() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        store.remember("the cat is called Miso", "personal").unwrap();
        let lib = AgentLibrary::with_default();
        let session = Session::with_source(SessionSource::Private);
        let prompt = builder(Some(store)).build(
            &session,
            lib.default_agent(),
            &[],
            &[],
            "what is the cat called?",
        );
        assert!(prompt.contains("<long_term_memory>"));
        assert!(prompt.contains("Miso"));
    }

    #[test]
    fn tools_render_with_confirmation_note() {
        let lib = AgentLibrary::with_default();
        let prompt = builder(None).build(
            &Session::new(),
            lib.default_agent(),
            &[],
            &[tool_def("shell", true), tool_def("memory_write", false)],
            "hello",
        );
        assert!(prompt.contains("- shell: shell tool (asks for confirmation)"));
        assert!(prompt.contains("- memory_write: memory_write tool"));
    }

    #[test]
    fn skills_render_as_nested_tags() {
        let lib = AgentLibrary::with_default();
        let prompt = builder(None).build(
            &Session::new(),
            lib.default_agent(),
            &[&skill("planner")],
            &[],
            "hello",
        );
        assert!(prompt.contains("<skill name=\"planner\" description=\"planner description\">"));
        assert!(prompt.contains("Body of planner."));
    }

    #[test]
    fn oversized_sections_are_truncated_to_budget() {
        let lib = AgentLibrary::with_default();
        let mut agent = lib.default_agent().clone();
        agent.persona = "word ".repeat(50_000);
        // Tiny window: system_prompt share is 30 tokens.
        let small = PromptBuilder::new(ContextBudget::new(100), None);
        let prompt = small.build(&Session::new(), &agent, &[], &[], "hello");
        let soul = prompt
            .split("<soul>\n")
            .nth(1)
            .unwrap()
            .split("\n</soul>")
            .next()
            .unwrap();
        assert!(crate::budget::estimate_tokens(soul) <= 30);
    }

    #[test]
    fn tool_policy_is_appended_to_soul() {
        let lib = AgentLibrary::with_default();
        let mut agent = lib.default_agent().clone();
        agent.tool_policy = Some("Prefer memory_search before answering.".into());
        let prompt = builder(None).build(&Session::new(), &agent, &[], &[], "hello");
        assert!(prompt.contains("Prefer memory_search before answering."));
    }
}
