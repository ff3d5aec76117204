// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub type JsonMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
///
/// Arguments are always held as a string-keyed map.  Providers occasionally
/// deliver them as a JSON-encoded string; [`normalize_arguments`] flattens
/// both shapes before anything downstream sees the call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier from the provider, unique within the session.
    pub id: String,
    pub name: String,
    pub arguments: JsonMap,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, raw_arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: normalize_arguments(&raw_arguments),
        }
    }

    /// Arguments as a `serde_json::Value` object, for wire serialization.
    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

/// Normalize tool-call arguments to a string-keyed map.
///
/// - JSON object → used as-is
/// - JSON string → parsed; must itself contain an object
/// - anything else (null, arrays, invalid JSON text) → empty map
pub fn normalize_arguments(raw: &Value) -> JsonMap {
    match raw {
        Value::Object(map) => map.clone(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                warn!(got = %other, "tool arguments string did not contain an object");
                JsonMap::new()
            }
            Err(e) => {
                warn!(error = %e, "tool arguments were not valid JSON; substituting {{}}");
                JsonMap::new()
            }
        },
        Value::Null => JsonMap::new(),
        other => {
            warn!(got = %other, "tool arguments had unexpected shape; substituting {{}}");
            JsonMap::new()
        }
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// May be empty (e.g. an assistant turn that only calls tools).
    pub content: String,
    /// Tool invocations attached to an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool-role messages: the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on tool-role messages: whether the execution succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            success: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            tool_calls,
            ..Self::base(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        content: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            success: Some(success),
            ..Self::base(Role::Tool, content)
        }
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolUse => "tool_use",
            Self::Length => "length",
            Self::Error => "error",
        }
    }
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A tool schema provided to the model, provider-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    /// System prompt.  The cloud driver lifts this to a top-level field;
    /// the local driver injects it as a leading system-role message.
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Context window hint forwarded to backends that accept one (num_ctx).
    pub context_window: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages,
            tools: Vec::new(),
            temperature: 0.7,
            max_tokens: 4096,
            context_window: None,
        }
    }
}

/// Normalized response returned by every provider.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    /// 0 for local providers.
    pub cost_usd: f64,
    pub metadata: JsonMap,
}

impl ProviderResponse {
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
