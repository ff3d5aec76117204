// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent personas and the multi-agent dispatcher.
//!
//! Agents are stateless strategies: immutable definitions selected per
//! request either by an explicit leading `@name` mention or by keyword
//! scoring over each agent's hint vocabulary.  The dispatcher's only session
//! mutation is recording the chosen `active_agent`.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

/// An agent's (or skill's) model class preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPreference {
    Local,
    Cloud,
    #[default]
    Auto,
}

/// Immutable persona definition, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    /// Persona text injected as the `<soul>` prompt section.
    pub persona: String,
    /// Optional extra guidance about tool usage, appended to the persona.
    #[serde(default)]
    pub tool_policy: Option<String>,
    /// When set, only these tools are offered to the model for this agent.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub model_preference: ModelPreference,
    /// Hint vocabulary for content-based dispatch.
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_agent() -> AgentDefinition {
    AgentDefinition {
        name: "default".into(),
        persona: "You are munin, a careful personal assistant. You remember what matters, \
                  answer plainly, and use tools when they genuinely help."
            .into(),
        tool_policy: None,
        allowed_tools: None,
        model_preference: ModelPreference::Auto,
        keywords: Vec::new(),
    }
}

/// Ordered set of loaded agents.  Insertion order breaks dispatch ties.
#[derive(Debug)]
pub struct AgentLibrary {
    agents: Vec<AgentDefinition>,
}

impl AgentLibrary {
    /// Library containing only the built-in default agent.
    pub fn with_default() -> Self {
        Self {
            agents: vec![default_agent()],
        }
    }

    pub fn from_definitions(defs: Vec<AgentDefinition>) -> Self {
        let mut lib = Self::with_default();
        for def in defs {
            lib.add(def);
        }
        lib
    }

    /// Load `*.yaml` agent files from a directory, sorted by file name so
    /// dispatch tie-breaking is deterministic across platforms.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut lib = Self::with_default();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        for path in paths {
            let text = std::fs::read_to_string(&path)?;
            match serde_yaml::from_str::<AgentDefinition>(&text) {
                Ok(def) => {
                    debug!(agent = %def.name, path = %path.display(), "loaded agent");
                    lib.add(def);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid agent file"),
            }
        }
        Ok(lib)
    }

    fn add(&mut self, def: AgentDefinition) {
        if let Some(existing) = self.agents.iter_mut().find(|a| a.name == def.name) {
            *existing = def;
        } else {
            self.agents.push(def);
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn default_agent(&self) -> &AgentDefinition {
        self.get("default").expect("default agent always present")
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name.as_str()).collect()
    }

    /// Route a message to an agent.
    ///
    /// A leading `@name` mention routes directly (the mention is stripped
    /// from the returned message).  Otherwise each agent scores one point
    /// per hint keyword present; highest count wins, ties go to the earlier
    /// agent, zero score goes to `default`.
    pub fn dispatch<'m>(&self, message: &'m str) -> (&AgentDefinition, &'m str) {
        if let Some(rest) = message.strip_prefix('@') {
            if let Some((name, body)) = rest.split_once(char::is_whitespace) {
                if let Some(agent) = self.get(name) {
                    return (agent, body.trim_start());
                }
            }
        }

        let haystack = message.to_lowercase();
        let mut best: Option<(&AgentDefinition, usize)> = None;
        for agent in &self.agents {
            let score = agent
                .keywords
                .iter()
                .filter(|k| haystack.contains(&k.to_lowercase()))
                .count();
            if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((agent, score));
            }
        }
        match best {
            Some((agent, _)) => (agent, message),
            None => (self.default_agent(), message),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str, keywords: &[&str]) -> AgentDefinition {
        AgentDefinition {
            name: name.into(),
            persona: format!("You are {name}."),
            tool_policy: None,
            allowed_tools: None,
            model_preference: ModelPreference::Auto,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn library() -> AgentLibrary {
        AgentLibrary::from_definitions(vec![
            agent("chef", &["recipe", "cook", "dinner"]),
            agent("gardener", &["plant", "garden", "soil"]),
        ])
    }

    #[test]
    fn default_agent_always_exists() {
        let lib = AgentLibrary::with_default();
        assert_eq!(lib.default_agent().name, "default");
    }

    #[test]
    fn mention_routes_to_named_agent_and_strips_prefix() {
        let lib = library();
        let (agent, rest) = lib.dispatch("@chef what should I make tonight?");
        assert_eq!(agent.name, "chef");
        assert_eq!(rest, "what should I make tonight?");
    }

    #[test]
    fn unknown_mention_falls_through_to_scoring() {
        let lib = library();
        let (agent, rest) = lib.dispatch("@nobody how do I cook a good dinner");
        // "@nobody" is not an agent, so the whole message is scored; "cook"
        // and "dinner" hit the chef vocabulary.
        assert_eq!(agent.name, "chef");
        assert!(rest.starts_with("@nobody"));
    }

    #[test]
    fn keyword_scoring_picks_highest_count() {
        let lib = library();
        let (agent, _) = lib.dispatch("my garden soil has a plant problem with one recipe");
        // gardener scores 3, chef scores 1.
        assert_eq!(agent.name, "gardener");
    }

    #[test]
    fn tie_breaks_by_insertion_order() {
        let lib = library();
        let (agent, _) = lib.dispatch("a recipe for my garden");
        // chef and gardener both score 1; chef was registered first.
        assert_eq!(agent.name, "chef");
    }

    #[test]
    fn zero_score_routes_to_default() {
        let lib = library();
        let (agent, rest) = lib.dispatch("what's the weather like?");
        assert_eq!(agent.name, "default");
        assert_eq!(rest, "what's the weather like?");
    }

    #[test]
    fn scoring_is_case_insensitive() {
        let lib = library();
        let (agent, _) = lib.dispatch("RECIPE ideas please");
        assert_eq!(agent.name, "chef");
    }

    #[test]
    fn mention_without_body_is_scored_not_routed() {
        let lib = library();
        let (agent, _) = lib.dispatch("@chef");
        // No whitespace after the name means no mention per the grammar.
        assert_eq!(agent.name, "default");
    }

    #[test]
    fn duplicate_names_keep_latest_definition() {
        let mut lib = AgentLibrary::with_default();
        lib.add(agent("x", &["one"]));
        lib.add(agent("x", &["two"]));
        assert_eq!(lib.get("x").unwrap().keywords, vec!["two"]);
        assert_eq!(lib.names().iter().filter(|n| **n == "x").count(), 1);
    }

    #[test]
    fn load_dir_reads_yaml_agents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("chef.yaml"),
            "name: chef\npersona: You are a chef.\nkeywords: [recipe]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an agent").unwrap();
        let lib = AgentLibrary::load_dir(dir.path()).unwrap();
        assert!(lib.get("chef").is_some());
        assert_eq!(lib.names().len(), 2); // default + chef
    }

    #[test]
    fn load_dir_skips_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), ":: not yaml ::").unwrap();
        let lib = AgentLibrary::load_dir(dir.path()).unwrap();
        assert_eq!(lib.names(), vec!["default"]);
    }

    #[test]
    fn model_preference_deserializes_lowercase() {
        let def: AgentDefinition =
            serde_yaml::from_str("name: x\npersona: p\nmodel_preference: cloud\n").unwrap();
        assert_eq!(def.model_preference, ModelPreference::Cloud);
    }
}
