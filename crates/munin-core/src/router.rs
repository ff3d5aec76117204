// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tiered model router.
//!
//! Resolution order (first match wins): session provider override → explicit
//! tier from the caller → active-skill mapping → keyword signals → agent
//! preference → the default tier.  Cloud tiers pass a budget gate and may be
//! silently downgraded to the local fallback; local responses pass a quality
//! gate and may be escalated to the mapped cloud tier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use munin_config::{KeywordRoute, ModelsConfig, TierConfig};
use munin_model::{
    ChunkSender, CompletionRequest, Message, ModelProvider, ProviderError, ProviderResponse,
    ToolSchema,
};
use munin_runtime::{AuditEntry, AuditLog};
use tracing::{debug, warn};

use crate::quality::assess_quality;
use crate::session::ProviderClass;
use crate::usage::{UsageRecord, UsageTracker};
use crate::{CoreError, ModelPreference};

/// Estimated input size used for the pre-dispatch budget check.
const BUDGET_CHECK_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    UserOverride,
    Explicit,
    Skill,
    Keyword,
    AgentPreference,
    Default,
    BudgetExhausted,
    EscalationDisabled,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserOverride => "user_override",
            Self::Explicit => "explicit",
            Self::Skill => "skill",
            Self::Keyword => "keyword",
            Self::AgentPreference => "agent_preference",
            Self::Default => "default",
            Self::BudgetExhausted => "budget_exhausted",
            Self::EscalationDisabled => "escalation_disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub tier: String,
    pub reason: RouteReason,
}

/// Everything the router needs to place one completion.
pub struct RouteRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub explicit_tier: Option<String>,
    pub skill: Option<String>,
    pub agent_preference: Option<ModelPreference>,
    /// Text scanned against the keyword routing table (the user message).
    pub route_text: String,
}

#[derive(Debug)]
pub struct RoutedResponse {
    pub response: ProviderResponse,
    pub tier: String,
    pub reason: RouteReason,
    pub escalated_from: Option<String>,
}

/// Map a local tier to its cloud escalation target.
pub fn escalation_tier(tier: &str) -> &'static str {
    match tier {
        "coder" => "cloud_standard",
        "thinker" => "cloud_deep",
        _ => "cloud_fast",
    }
}

pub struct Router {
    tiers: HashMap<String, TierConfig>,
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    usage: Arc<UsageTracker>,
    audit: Arc<AuditLog>,
    default_tier: String,
    fallback_tier: String,
    escalation_enabled: bool,
    max_local_retries: u32,
    keyword_routes: Vec<KeywordRoute>,
    skill_routes: HashMap<String, String>,
}

impl Router {
    pub fn new(
        models: &ModelsConfig,
        providers: HashMap<String, Arc<dyn ModelProvider>>,
        usage: Arc<UsageTracker>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            tiers: models.tiers.clone(),
            providers,
            usage,
            audit,
            default_tier: models.default_tier.clone(),
            fallback_tier: models.fallback_tier.clone(),
            escalation_enabled: models.escalation_enabled,
            max_local_retries: models.max_local_retries,
            keyword_routes: models.keyword_routes.clone(),
            skill_routes: models.skill_routes.clone(),
        }
    }

    pub fn is_cloud_tier(&self, tier: &str) -> bool {
        self.tiers
            .get(tier)
            .map(|t| t.provider == "anthropic")
            .unwrap_or(false)
    }

    fn local_default(&self) -> String {
        if self.is_cloud_tier(&self.default_tier) {
            self.fallback_tier.clone()
        } else {
            self.default_tier.clone()
        }
    }

    /// Pure tier resolution, before any gating.
    pub fn resolve(
        &self,
        forced: Option<ProviderClass>,
        request: &RouteRequest,
    ) -> RouteDecision {
        if let Some(class) = forced {
            let tier = match class {
                ProviderClass::Local => self.local_default(),
                ProviderClass::Cloud => escalation_tier(&self.local_default()).to_string(),
            };
            return RouteDecision {
                tier,
                reason: RouteReason::UserOverride,
            };
        }
        if let Some(tier) = &request.explicit_tier {
            if self.tiers.contains_key(tier) {
                return RouteDecision {
                    tier: tier.clone(),
                    reason: RouteReason::Explicit,
                };
            }
            warn!(tier = %tier, "explicit tier not configured; falling through");
        }
        if let Some(skill) = &request.skill {
            if let Some(tier) = self.skill_routes.get(skill) {
                return RouteDecision {
                    tier: tier.clone(),
                    reason: RouteReason::Skill,
                };
            }
        }
        let haystack = request.route_text.to_lowercase();
        for route in &self.keyword_routes {
            if haystack.contains(&route.keyword.to_lowercase()) {
                return RouteDecision {
                    tier: route.tier.clone(),
                    reason: RouteReason::Keyword,
                };
            }
        }
        match request.agent_preference {
            Some(ModelPreference::Local) => RouteDecision {
                tier: self.local_default(),
                reason: RouteReason::AgentPreference,
            },
            Some(ModelPreference::Cloud) => RouteDecision {
                tier: escalation_tier(&self.local_default()).to_string(),
                reason: RouteReason::AgentPreference,
            },
            _ => RouteDecision {
                tier: self.default_tier.clone(),
                reason: RouteReason::Default,
            },
        }
    }

    /// Apply the escalation switch and the cloud budget gate to a decision.
    fn gate(&self, decision: RouteDecision, session_id: &str) -> RouteDecision {
        if !self.is_cloud_tier(&decision.tier) {
            return decision;
        }
        if !self.escalation_enabled {
            return RouteDecision {
                tier: self.fallback_tier.clone(),
                reason: RouteReason::EscalationDisabled,
            };
        }
        if !self.usage.can_use_cloud(BUDGET_CHECK_TOKENS) {
            warn!(
                tier = %decision.tier,
                fallback = %self.fallback_tier,
                "cloud budget exhausted; downgrading to local tier"
            );
            self.audit.record(
                AuditEntry::new(session_id, "budget_downgrade")
                    .field("requested_tier", decision.tier.clone())
                    .field("fallback_tier", self.fallback_tier.clone()),
            );
            // A user override keeps its reason even through the downgrade.
            let reason = if decision.reason == RouteReason::UserOverride {
                RouteReason::UserOverride
            } else {
                RouteReason::BudgetExhausted
            };
            return RouteDecision {
                tier: self.fallback_tier.clone(),
                reason,
            };
        }
        decision
    }

    fn tier_config(&self, tier: &str) -> Result<&TierConfig, CoreError> {
        self.tiers
            .get(tier)
            .ok_or_else(|| CoreError::UnknownTier(tier.to_string()))
    }

    fn provider_for(&self, tier: &TierConfig) -> Result<&Arc<dyn ModelProvider>, CoreError> {
        self.providers
            .get(&tier.provider)
            .ok_or_else(|| CoreError::UnknownTier(tier.provider.clone()))
    }

    async fn call_tier(
        &self,
        tier_name: &str,
        request: &RouteRequest,
        chunks: Option<&ChunkSender>,
    ) -> Result<(ProviderResponse, u64), CoreError> {
        let tier = self.tier_config(tier_name)?;
        let provider = self.provider_for(tier)?;
        let req = CompletionRequest {
            model: tier.model.clone(),
            system: request.system.clone(),
            messages: request.messages.clone(),
            tools: request.tools.clone(),
            temperature: tier.temperature,
            max_tokens: tier.max_tokens,
            context_window: Some(tier.context_window),
        };
        let started = Instant::now();
        let response = match chunks {
            Some(sink) => provider.generate_stream(&req, sink.clone()).await?,
            None => provider.generate(&req).await?,
        };
        Ok((response, started.elapsed().as_millis() as u64))
    }

    fn record_usage(
        &self,
        tier_name: &str,
        response: &ProviderResponse,
        latency_ms: u64,
        escalated_from: Option<&str>,
        skill: Option<&str>,
    ) {
        let provider = self
            .tiers
            .get(tier_name)
            .map(|t| t.provider.as_str())
            .unwrap_or("unknown");
        let mut record = UsageRecord::now(provider, tier_name, &response.model);
        record.prompt_tokens = response.usage.prompt_tokens;
        record.completion_tokens = response.usage.completion_tokens;
        record.latency_ms = latency_ms;
        record.cost_usd = response.cost_usd;
        record.finish_reason = response.finish_reason.as_str().to_string();
        record.escalated_from = escalated_from.map(str::to_string);
        record.skill = skill.map(str::to_string);
        self.usage.record(record);
    }

    /// Whether escalating from `from_tier` is currently possible.
    fn may_escalate(&self) -> bool {
        self.escalation_enabled && self.usage.can_use_cloud(BUDGET_CHECK_TOKENS)
    }

    async fn escalate(
        &self,
        from_tier: &str,
        reason: &str,
        session_id: &str,
        request: &RouteRequest,
        chunks: Option<&ChunkSender>,
        original_reason: RouteReason,
    ) -> Result<RoutedResponse, CoreError> {
        let target = escalation_tier(from_tier);
        debug!(from = %from_tier, to = %target, reason, "escalating to cloud tier");
        self.audit.record(
            AuditEntry::new(session_id, "escalation")
                .field("from_tier", from_tier.to_string())
                .field("to_tier", target.to_string())
                .field("reason", reason.to_string()),
        );
        let (response, latency) = self.call_tier(target, request, chunks).await?;
        self.record_usage(
            target,
            &response,
            latency,
            Some(from_tier),
            request.skill.as_deref(),
        );
        Ok(RoutedResponse {
            response,
            tier: target.to_string(),
            reason: original_reason,
            escalated_from: Some(from_tier.to_string()),
        })
    }

    /// Place one completion: resolve, gate, dispatch, and recover.
    pub async fn complete(
        &self,
        session_id: &str,
        forced: Option<ProviderClass>,
        request: &RouteRequest,
        chunks: Option<&ChunkSender>,
    ) -> Result<RoutedResponse, CoreError> {
        let decision = self.gate(self.resolve(forced, request), session_id);
        debug!(tier = %decision.tier, reason = decision.reason.as_str(), "routing request");

        if self.is_cloud_tier(&decision.tier) {
            // Cloud drivers carry their own backoff for 429/529.
            let (response, latency) = self.call_tier(&decision.tier, request, chunks).await?;
            self.record_usage(
                &decision.tier,
                &response,
                latency,
                None,
                request.skill.as_deref(),
            );
            return Ok(RoutedResponse {
                response,
                tier: decision.tier,
                reason: decision.reason,
                escalated_from: None,
            });
        }

        // Local tier: bounded retries, then quality gate, then (maybe)
        // escalation.  Security errors bypass every recovery path.
        let attempts = 1 + self.max_local_retries;
        let mut last_error: Option<CoreError> = None;
        for attempt in 1..=attempts {
            match self.call_tier(&decision.tier, request, chunks).await {
                Ok((response, latency)) => {
                    self.record_usage(
                        &decision.tier,
                        &response,
                        latency,
                        None,
                        request.skill.as_deref(),
                    );
                    if let Some(issue) = assess_quality(&response, &request.tools) {
                        warn!(
                            tier = %decision.tier,
                            issue = issue.reason(),
                            "local response classified as low quality"
                        );
                        self.audit.record(
                            AuditEntry::new(session_id, "low_quality")
                                .field("tier", decision.tier.clone())
                                .field("reason", issue.reason()),
                        );
                        if self.may_escalate() {
                            match self
                                .escalate(
                                    &decision.tier,
                                    issue.reason(),
                                    session_id,
                                    request,
                                    chunks,
                                    decision.reason,
                                )
                                .await
                            {
                                Ok(routed) => return Ok(routed),
                                Err(e) if e.is_security() => return Err(e),
                                Err(e) => {
                                    // Cloud failed; the local answer is still
                                    // the best available result.
                                    warn!(error = %e, "escalation failed; keeping local response");
                                }
                            }
                        }
                    }
                    return Ok(RoutedResponse {
                        response,
                        tier: decision.tier.clone(),
                        reason: decision.reason,
                        escalated_from: None,
                    });
                }
                Err(e) if e.is_security() => return Err(e),
                Err(e) => {
                    warn!(
                        tier = %decision.tier,
                        attempt,
                        attempts,
                        error = %e,
                        "local tier failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        // Retries exhausted.  Escalate if permitted, else surface the error.
        if self.may_escalate() {
            match self
                .escalate(
                    &decision.tier,
                    "provider_error",
                    session_id,
                    request,
                    chunks,
                    decision.reason,
                )
                .await
            {
                Ok(routed) => return Ok(routed),
                Err(e) if e.is_security() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "escalation after provider failure also failed");
                }
            }
        }
        Err(last_error.unwrap_or(CoreError::Provider(ProviderError::Connection(
            "local provider unavailable".into(),
        ))))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
