// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper; returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Validation errors raised at boot.  All of these are fatal: a runtime
/// started against a broken routing table would misroute every request.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown tier '{0}' referenced by {1}")]
    UnknownTier(String, &'static str),
    #[error("tier '{0}' references unknown provider '{1}'")]
    UnknownProvider(String, String),
    #[error("context budget percentages sum to {0}, expected 1.0")]
    BudgetSum(f32),
    #[error("API keys must come from the environment, not config files (tier '{0}')")]
    CredentialInConfig(String),
}

/// A routable (provider, model, sampling) bundle.  The router selects among
/// tiers; several tiers may share one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Provider key: "ollama" | "anthropic"
    pub provider: String,
    /// Model identifier forwarded to the provider API
    pub model: String,
    #[serde(default = "TierConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default = "TierConfig::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "TierConfig::default_context_window")]
    pub context_window: u32,
    /// Explicit API key.  Rejected at validation time; credentials must be
    /// supplied through the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl TierConfig {
    fn default_temperature() -> f32 {
        0.7
    }
    fn default_max_tokens() -> u32 {
        4096
    }
    fn default_context_window() -> u32 {
        32_768
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Tier used when no other routing signal matches.
    #[serde(default = "ModelsConfig::default_tier")]
    pub default_tier: String,
    /// Local tier used when the cloud budget is exhausted.
    #[serde(default = "ModelsConfig::default_tier")]
    pub fallback_tier: String,
    /// Promote low-quality / failed local responses to a cloud tier.
    /// Also controlled by the MUNIN_NO_ESCALATION environment variable.
    #[serde(default = "default_true")]
    pub escalation_enabled: bool,
    /// Retries against a local tier before escalation kicks in.
    #[serde(default = "ModelsConfig::default_local_retries")]
    pub max_local_retries: u32,
    #[serde(default = "ModelsConfig::default_ollama_url")]
    pub ollama_base_url: String,
    #[serde(default)]
    pub anthropic_base_url: Option<String>,
    /// Model residency hint forwarded to Ollama ("5m", "0" to unload).
    #[serde(default = "ModelsConfig::default_keep_alive")]
    pub keep_alive: String,
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<String, TierConfig>,
    /// Substring → tier routing signals scanned over the user message.
    #[serde(default = "default_keyword_routes")]
    pub keyword_routes: Vec<KeywordRoute>,
    /// Skill name → tier overrides.
    #[serde(default)]
    pub skill_routes: HashMap<String, String>,
}

/// One keyword routing rule.  Kept as an ordered list (not a map) so the
/// first matching keyword wins deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRoute {
    pub keyword: String,
    pub tier: String,
}

fn default_tiers() -> HashMap<String, TierConfig> {
    let tier = |provider: &str, model: &str, temperature: f32, max_tokens: u32, ctx: u32| {
        TierConfig {
            provider: provider.into(),
            model: model.into(),
            temperature,
            max_tokens,
            context_window: ctx,
            api_key: None,
        }
    };
    HashMap::from([
        ("whisper".into(), tier("ollama", "llama3.2:1b", 0.3, 1024, 8192)),
        ("workhorse".into(), tier("ollama", "qwen2.5:7b", 0.7, 4096, 32_768)),
        ("coder".into(), tier("ollama", "qwen2.5-coder:7b", 0.2, 4096, 32_768)),
        ("thinker".into(), tier("ollama", "deepseek-r1:8b", 0.6, 8192, 32_768)),
        (
            "cloud_fast".into(),
            tier("anthropic", "claude-3-5-haiku-20241022", 0.7, 4096, 200_000),
        ),
        (
            "cloud_standard".into(),
            tier("anthropic", "claude-sonnet-4-20250514", 0.7, 8192, 200_000),
        ),
        (
            "cloud_deep".into(),
            tier("anthropic", "claude-opus-4-20250514", 0.7, 8192, 200_000),
        ),
    ])
}

fn default_keyword_routes() -> Vec<KeywordRoute> {
    let route = |keyword: &str, tier: &str| KeywordRoute {
        keyword: keyword.into(),
        tier: tier.into(),
    };
    vec![
        route("debug", "coder"),
        route("refactor", "coder"),
        route("stack trace", "coder"),
        route("code", "coder"),
        route("analyze", "thinker"),
        route("think through", "thinker"),
        route("plan", "thinker"),
        route("quick question", "whisper"),
    ]
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_tier: Self::default_tier(),
            fallback_tier: Self::default_tier(),
            escalation_enabled: true,
            max_local_retries: Self::default_local_retries(),
            ollama_base_url: Self::default_ollama_url(),
            anthropic_base_url: None,
            keep_alive: Self::default_keep_alive(),
            tiers: default_tiers(),
            keyword_routes: default_keyword_routes(),
            skill_routes: HashMap::new(),
        }
    }
}

impl ModelsConfig {
    fn default_tier() -> String {
        "workhorse".into()
    }
    fn default_local_retries() -> u32 {
        2
    }
    fn default_ollama_url() -> String {
        "http://localhost:11434".into()
    }
    fn default_keep_alive() -> String {
        "5m".into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Daily cloud spend cap in USD.
    #[serde(default = "BudgetConfig::default_daily")]
    pub daily_usd: f64,
    /// Monthly cloud spend cap in USD.
    #[serde(default = "BudgetConfig::default_monthly")]
    pub monthly_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_usd: Self::default_daily(),
            monthly_usd: Self::default_monthly(),
        }
    }
}

impl BudgetConfig {
    fn default_daily() -> f64 {
        2.0
    }
    fn default_monthly() -> f64 {
        25.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Fraction of the conversation budget that triggers the cooperative
    /// flush (phase 1 of compaction).
    #[serde(default = "ContextConfig::default_soft_threshold")]
    pub soft_threshold: f32,
    /// Assistant turns preserved verbatim through compaction (phase 2).
    #[serde(default = "ContextConfig::default_preserved_turns")]
    pub preserved_turns: usize,
    #[serde(default = "default_true")]
    pub compaction_enabled: bool,
    /// Tier used by the Compressor for summaries.
    #[serde(default = "ContextConfig::default_compressor_tier")]
    pub compressor_tier: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            soft_threshold: Self::default_soft_threshold(),
            preserved_turns: Self::default_preserved_turns(),
            compaction_enabled: true,
            compressor_tier: Self::default_compressor_tier(),
        }
    }
}

impl ContextConfig {
    fn default_soft_threshold() -> f32 {
        0.75
    }
    fn default_preserved_turns() -> usize {
        3
    }
    fn default_compressor_tier() -> String {
        "whisper".into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Wall-clock bound on a single tool execution.
    #[serde(default = "ToolsConfig::default_max_execution")]
    pub max_execution_time_seconds: u64,
    /// Length cap applied to untrusted/mixed tool output before it enters
    /// the message history.
    #[serde(default = "ToolsConfig::default_untrusted_cap")]
    pub untrusted_output_max_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_execution_time_seconds: Self::default_max_execution(),
            untrusted_output_max_chars: Self::default_untrusted_cap(),
        }
    }
}

impl ToolsConfig {
    fn default_max_execution() -> u64 {
        30
    }
    fn default_untrusted_cap() -> usize {
        8000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on provider calls per submitted request.
    #[serde(default = "SessionConfig::default_max_turns")]
    pub max_turns: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: Self::default_max_turns(),
        }
    }
}

impl SessionConfig {
    fn default_max_turns() -> u32 {
        12
    }
}

/// How quiet-hours notifications are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuietHoursPolicy {
    /// Discard notifications raised during quiet hours.
    Drop,
    /// Hold them and deliver at the next active-hours edge.
    #[default]
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "SchedulerConfig::default_max_per_hour")]
    pub max_notifications_per_hour: u32,
    /// Local hour (0-23) at which notifications start being delivered.
    #[serde(default = "SchedulerConfig::default_active_start")]
    pub active_hours_start: u32,
    /// Local hour (0-23) after which notifications are suppressed.
    #[serde(default = "SchedulerConfig::default_active_end")]
    pub active_hours_end: u32,
    #[serde(default)]
    pub quiet_hours_policy: QuietHoursPolicy,
    /// Bounded size of the quiet-hours queue.
    #[serde(default = "SchedulerConfig::default_queue_size")]
    pub queue_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_notifications_per_hour: Self::default_max_per_hour(),
            active_hours_start: Self::default_active_start(),
            active_hours_end: Self::default_active_end(),
            quiet_hours_policy: QuietHoursPolicy::default(),
            queue_size: Self::default_queue_size(),
        }
    }
}

impl SchedulerConfig {
    fn default_max_per_hour() -> u32 {
        6
    }
    fn default_active_start() -> u32 {
        8
    }
    fn default_active_end() -> u32 {
        22
    }
    fn default_queue_size() -> usize {
        64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// State directory holding the audit log, usage ledger, memory store,
    /// and scheduler database.  Defaults to the platform data dir.
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory of agent definition YAML files.
    #[serde(default)]
    pub agents_dir: Option<PathBuf>,
    /// Directory of skill definition YAML files.
    #[serde(default)]
    pub skills_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
            agents_dir: None,
            skills_dir: None,
        }
    }
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("munin")
    }
}

impl Config {
    /// Boot-time validation.  Any error here is fatal (spec: ConfigError).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tier_exists = |name: &str| self.models.tiers.contains_key(name);

        if !tier_exists(&self.models.default_tier) {
            return Err(ConfigError::UnknownTier(
                self.models.default_tier.clone(),
                "models.default_tier",
            ));
        }
        if !tier_exists(&self.models.fallback_tier) {
            return Err(ConfigError::UnknownTier(
                self.models.fallback_tier.clone(),
                "models.fallback_tier",
            ));
        }
        if !tier_exists(&self.context.compressor_tier) {
            return Err(ConfigError::UnknownTier(
                self.context.compressor_tier.clone(),
                "context.compressor_tier",
            ));
        }
        for route in &self.models.keyword_routes {
            if !tier_exists(&route.tier) {
                return Err(ConfigError::UnknownTier(
                    route.tier.clone(),
                    "models.keyword_routes",
                ));
            }
        }
        for tier in self.models.skill_routes.values() {
            if !tier_exists(tier) {
                return Err(ConfigError::UnknownTier(
                    tier.clone(),
                    "models.skill_routes",
                ));
            }
        }
        for (name, tier) in &self.models.tiers {
            if tier.provider != "ollama" && tier.provider != "anthropic" {
                return Err(ConfigError::UnknownProvider(
                    name.clone(),
                    tier.provider.clone(),
                ));
            }
            if tier.api_key.is_some() {
                return Err(ConfigError::CredentialInConfig(name.clone()));
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
