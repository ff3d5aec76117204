// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use munin_model::JsonMap;
use serde_json::Value;

/// Governs how a tool's output is treated before it enters the message
/// history.  `Untrusted` and `Mixed` outputs pass through the sanitizer
/// (injection-marker neutralization plus a length cap); `Trusted` outputs
/// are appended verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    Trusted,
    /// Output mixes machine data with content from outside sources.
    Mixed,
    Untrusted,
}

impl TrustLevel {
    pub fn needs_sanitizing(&self) -> bool {
        !matches!(self, Self::Trusted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Mixed => "mixed",
            Self::Untrusted => "untrusted",
        }
    }
}

/// The outcome of one tool execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Ok { output: String, metadata: JsonMap },
    Fail { error: String, metadata: JsonMap },
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self::Ok {
            output: output.into(),
            metadata: JsonMap::new(),
        }
    }

    pub fn ok_with_metadata(output: impl Into<String>, metadata: JsonMap) -> Self {
        Self::Ok {
            output: output.into(),
            metadata,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
            metadata: JsonMap::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// The text that enters the conversation: output on success, the error
    /// message on failure.
    pub fn text(&self) -> &str {
        match self {
            Self::Ok { output, .. } => output,
            Self::Fail { error, .. } => error,
        }
    }
}

/// Schema of a registered capability, provider-agnostic.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
    pub requires_confirmation: bool,
    pub trust_level: TrustLevel,
}

/// A named capability the model may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;
    /// Tools with side effects the user should see before they happen.
    fn requires_confirmation(&self) -> bool {
        false
    }
    fn trust_level(&self) -> TrustLevel {
        TrustLevel::Trusted
    }
    /// Execute with normalized arguments.  Failures should be reported via
    /// [`ToolResult::fail`], not panics.
    async fn execute(&self, args: &JsonMap) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_reports_success() {
        let r = ToolResult::ok("done");
        assert!(r.is_ok());
        assert_eq!(r.text(), "done");
    }

    #[test]
    fn fail_result_exposes_error_text() {
        let r = ToolResult::fail("Unknown tool: frobnicate");
        assert!(!r.is_ok());
        assert_eq!(r.text(), "Unknown tool: frobnicate");
    }

    #[test]
    fn trusted_output_skips_sanitizing() {
        assert!(!TrustLevel::Trusted.needs_sanitizing());
        assert!(TrustLevel::Mixed.needs_sanitizing());
        assert!(TrustLevel::Untrusted.needs_sanitizing());
    }

    #[test]
    fn metadata_preserved_on_ok() {
        let mut meta = JsonMap::new();
        meta.insert("lines".into(), serde_json::json!(3));
        let r = ToolResult::ok_with_metadata("out", meta);
        match r {
            ToolResult::Ok { metadata, .. } => assert_eq!(metadata["lines"], 3),
            _ => panic!("expected Ok"),
        }
    }
}
