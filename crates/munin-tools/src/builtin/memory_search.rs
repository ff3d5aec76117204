// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use munin_memory::MemoryStore;
use munin_model::JsonMap;
use serde_json::{json, Value};

use crate::{Tool, ToolResult};

const DEFAULT_LIMIT: usize = 5;

/// Recall facts from long-term memory by full-text search.
pub struct MemorySearchTool {
    store: Arc<MemoryStore>,
}

impl MemorySearchTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory for stored facts matching a query."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Words to search for" },
                "limit": { "type": "integer", "description": "Maximum results (default 5)" }
            },
            "required": ["query"],
        })
    }

    async fn execute(&self, args: &JsonMap) -> ToolResult {
        let query = args.get("query").and_then(Value::as_str).unwrap_or("");
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_LIMIT);

        match self.store.search(query, limit) {
            Ok(hits) if hits.is_empty() => ToolResult::ok("No matching memories."),
            Ok(hits) => {
                let lines: Vec<String> = hits
                    .iter()
                    .map(|m| format!("- [{}] {}", m.category, m.content))
                    .collect();
                ToolResult::ok(lines.join("\n"))
            }
            Err(e) => ToolResult::fail(format!("Tool error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
