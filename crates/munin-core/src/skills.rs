// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Skill definitions and trigger matching.
//!
//! A skill is a named block of instructions injected into the system prompt
//! when its trigger keywords match the user message.  Skills declaring tools
//! the registry does not know are rejected at load time; injecting them
//! would teach the model to call capabilities that cannot exist.

use std::collections::BTreeSet;
use std::path::Path;

use munin_tools::ToolRegistry;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::ModelPreference;

#[derive(Debug, Clone, Deserialize)]
pub struct SkillDefinition {
    pub name: String,
    pub description: String,
    /// Tools this skill's instructions rely on.
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub model_preference: ModelPreference,
    /// Auto-activated skills are matched on every request; others only when
    /// explicitly enabled on the session.
    #[serde(default)]
    pub auto_activate: bool,
    /// Case-insensitive substring triggers.
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Instruction body injected into the prompt.
    pub body: String,
}

impl SkillDefinition {
    /// Relevance of this skill for `message`: the sum over matched triggers
    /// of `10 + trigger_length + max(0, 10 − match_position/10)`.
    pub fn score(&self, message: &str) -> u32 {
        let haystack = message.to_lowercase();
        self.triggers
            .iter()
            .filter_map(|trigger| {
                let needle = trigger.to_lowercase();
                haystack.find(&needle).map(|pos| {
                    10 + trigger.len() as u32 + 10u32.saturating_sub((pos / 10) as u32)
                })
            })
            .sum()
    }
}

/// Ordered set of validated skills.
#[derive(Debug, Default)]
pub struct SkillLibrary {
    skills: Vec<SkillDefinition>,
}

impl SkillLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from definitions, dropping any skill whose required tools are
    /// not registered.
    pub fn from_definitions(defs: Vec<SkillDefinition>, registry: &ToolRegistry) -> Self {
        let mut skills = Vec::new();
        for def in defs {
            let missing: Vec<&String> = def
                .required_tools
                .iter()
                .filter(|t| !registry.contains(t))
                .collect();
            if missing.is_empty() {
                debug!(skill = %def.name, "loaded skill");
                skills.push(def);
            } else {
                warn!(
                    skill = %def.name,
                    missing = ?missing,
                    "skill requires unregistered tools; not loading"
                );
            }
        }
        Self { skills }
    }

    /// Load `*.yaml` skill files from a directory, validated against the
    /// registry.
    pub fn load_dir(dir: &Path, registry: &ToolRegistry) -> anyhow::Result<Self> {
        let mut defs = Vec::new();
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
            match serde_yaml::from_str::<SkillDefinition>(&text) {
                Ok(def) => defs.push(def),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid skill file"),
            }
        }
        Ok(Self::from_definitions(defs, registry))
    }

    pub fn get(&self, name: &str) -> Option<&SkillDefinition> {
        self.skills.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Skills relevant to `message`, best score first.
    ///
    /// Candidates are the auto-activated skills plus any explicitly enabled
    /// on the session; only candidates with a positive score are returned.
    /// Equal scores keep insertion order (stable sort).
    pub fn matched(&self, message: &str, enabled: &BTreeSet<String>) -> Vec<&SkillDefinition> {
        let mut scored: Vec<(&SkillDefinition, u32)> = self
            .skills
            .iter()
            .filter(|s| s.auto_activate || enabled.contains(&s.name))
            .filter_map(|s| {
                let score = s.score(message);
                (score > 0).then_some((s, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored.into_iter().map(|(s, _)| s).collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
