// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use munin_model::{normalize_arguments, ToolCall};
use munin_runtime::{hash_digest, AuditEntry, AuditLog};
use serde_json::Value;
use tracing::warn;

use crate::{Tool, ToolDefinition, ToolResult, TrustLevel};

/// Central registry of all capabilities available to the model.
///
/// Execution protocol per call: normalize arguments → check the schema's
/// required parameters → audit `tool_exec_start` → run under a wall-clock
/// deadline with panic isolation → audit `tool_exec_end`.  Unknown tools and
/// every failure mode come back as a [`ToolResult::Fail`]; nothing here ever
/// aborts the agent loop.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
    audit: Arc<AuditLog>,
}

impl ToolRegistry {
    pub fn new(timeout: Duration, audit: Arc<AuditLog>) -> Self {
        Self {
            tools: HashMap::new(),
            timeout,
            audit,
        }
    }

    /// Idempotent by name: registering the same name twice keeps the latest.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool schemas, sorted by name for a stable prompt rendering.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
                requires_confirmation: t.requires_confirmation(),
                trust_level: t.trust_level(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Unknown tools do not require confirmation; they fail before running.
    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|t| t.requires_confirmation())
            .unwrap_or(false)
    }

    /// Unknown tools report `Untrusted` so any stray output would still be
    /// sanitized.
    pub fn trust_level(&self, name: &str) -> TrustLevel {
        self.tools
            .get(name)
            .map(|t| t.trust_level())
            .unwrap_or(TrustLevel::Untrusted)
    }

    /// Execute a tool call on behalf of `session_id`.
    pub async fn execute(&self, session_id: &str, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "model requested unknown tool");
            self.audit.record(
                AuditEntry::new(session_id, "unknown_tool").field("tool", call.name.clone()),
            );
            return ToolResult::fail(format!("Unknown tool: {}", call.name));
        };

        // Arguments may have been attached as a JSON string upstream; the
        // registry boundary guarantees the body sees a map.
        let args = normalize_arguments(&Value::Object(call.arguments.clone()));

        if let Some(missing) = missing_required(&tool.parameters_schema(), &args) {
            return ToolResult::fail(format!(
                "Tool error: missing required parameter '{missing}' for {}",
                call.name
            ));
        }

        let input_json = Value::Object(args.clone()).to_string();
        self.audit.record(
            AuditEntry::new(session_id, "tool_exec_start")
                .field("tool", call.name.clone())
                .field("call_id", call.id.clone())
                .field("input_hash", hash_digest(&input_json)),
        );

        let started = Instant::now();
        let tool = Arc::clone(tool);
        // Spawned so a panicking tool body becomes a join error instead of
        // unwinding through the agent loop.
        let handle = tokio::spawn(async move { tool.execute(&args).await });

        let result = match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => ToolResult::fail(format!("Tool error: {join_err}")),
            Err(_elapsed) => ToolResult::fail(format!(
                "Tool execution timed out after {}s",
                self.timeout.as_secs()
            )),
        };

        self.audit.record(
            AuditEntry::new(session_id, "tool_exec_end")
                .field("tool", call.name.clone())
                .field("call_id", call.id.clone())
                .field("output_hash", hash_digest(result.text()))
                .field("success", result.is_ok())
                .duration_ms(started.elapsed().as_millis() as u64),
        );

        result
    }
}

/// First required parameter missing from `args`, if any, per the tool's
/// JSON Schema `required` list.
fn missing_required(schema: &Value, args: &munin_model::JsonMap) -> Option<String> {
    schema["required"].as_array().and_then(|required| {
        required
            .iter()
            .filter_map(Value::as_str)
            .find(|key| !args.contains_key(*key))
            .map(str::to_string)
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
