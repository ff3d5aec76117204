// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use munin_memory::MemoryStore;
use munin_model::JsonMap;
use serde_json::{json, Value};

use crate::{Tool, ToolResult};

/// Store a durable fact in long-term memory.
///
/// This is the tool the context-maintenance flush asks the model to call
/// before old conversation turns are summarized away.
pub struct MemoryWriteTool {
    store: Arc<MemoryStore>,
}

impl MemoryWriteTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryWriteTool {
    fn name(&self) -> &str {
        "memory_write"
    }

    fn description(&self) -> &str {
        "Save an important fact to long-term memory so it survives beyond this conversation. \
         Use for durable user preferences, decisions, and commitments."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The fact to remember, phrased so it makes sense on its own"
                },
                "category": {
                    "type": "string",
                    "description": "Optional grouping label, e.g. 'preference' or 'project'"
                }
            },
            "required": ["content"],
        })
    }

    async fn execute(&self, args: &JsonMap) -> ToolResult {
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if content.is_empty() {
            return ToolResult::fail("Tool error: 'content' must be a non-empty string");
        }
        let category = args
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("general");

        match self.store.remember(content, category) {
            Ok(total) => ToolResult::ok(format!("Remembered ({total} facts stored)")),
            Err(e) => ToolResult::fail(format!("Tool error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> (MemoryWriteTool, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        (MemoryWriteTool::new(store.clone()), store)
    }

    fn args(v: Value) -> JsonMap {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn writes_fact_to_store() {
        let (tool, store) = tool();
        let out = tool
            .execute(&args(json!({"content": "the user is vegetarian"})))
            .await;
        assert!(out.is_ok());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn uses_category_when_given() {
        let (tool, store) = tool();
        tool.execute(&args(
            json!({"content": "standup at 10", "category": "schedule"}),
        ))
        .await;
        let hits = store.search("standup", 5).unwrap();
        assert_eq!(hits[0].category, "schedule");
    }

    #[tokio::test]
    async fn empty_content_fails() {
        let (tool, store) = tool();
        let out = tool.execute(&args(json!({"content": "  "}))).await;
        assert!(!out.is_ok());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn is_trusted_and_unconfirmed() {
        let (tool, _) = tool();
        assert!(!tool.requires_confirmation());
        assert_eq!(tool.trust_level(), crate::TrustLevel::Trusted);
    }

    #[test]
    fn schema_requires_content() {
        let (tool, _) = tool();
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"][0], "content");
    }
}
