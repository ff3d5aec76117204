// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::provider::{ChunkSender, ModelProvider, ProviderError};
use crate::types::{
    CompletionRequest, FinishReason, JsonMap, ProviderResponse, ToolCall, Usage,
};

/// Pre-scripted provider for tests.  Each `generate` call pops the next
/// response from the front of the queue, so tests can specify exact
/// multi-turn sequences; including tool calls; without network access.
pub struct ScriptedProvider {
    name: String,
    scripts: Mutex<VecDeque<ProviderResponse>>,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    pub calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<ProviderResponse>) -> Self {
        Self {
            name: "scripted".into(),
            scripts: Mutex::new(scripts.into()),
            last_request: Arc::new(Mutex::new(None)),
            calls: AtomicU32::new(0),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Provider that always returns the same text response.
    pub fn always_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(vec![Self::text_response(&text)])
    }

    pub fn text_response(text: &str) -> ProviderResponse {
        ProviderResponse {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
            model: "scripted-model".into(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
            finish_reason: FinishReason::Stop,
            cost_usd: 0.0,
            metadata: JsonMap::new(),
        }
    }

    pub fn tool_call_response(id: &str, name: &str, args: Value) -> ProviderResponse {
        ProviderResponse {
            content: None,
            tool_calls: vec![ToolCall::new(id, name, args)],
            model: "scripted-model".into(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
            finish_reason: FinishReason::ToolUse,
            cost_usd: 0.0,
            metadata: JsonMap::new(),
        }
    }

    fn next(&self, req: &CompletionRequest) -> ProviderResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req.clone());
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Self::text_response("[no more scripts]"))
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        req: &CompletionRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(self.next(req))
    }

    async fn generate_stream(
        &self,
        req: &CompletionRequest,
        chunks: ChunkSender,
    ) -> Result<ProviderResponse, ProviderError> {
        let resp = self.next(req);
        if let Some(text) = &resp.content {
            let _ = chunks.try_send(text.clone());
        }
        Ok(resp)
    }

    async fn available(&self) -> bool {
        true
    }

    async fn model_loaded(&self, _model: &str) -> bool {
        true
    }
}

/// Provider that fails with a transient error a fixed number of times, then
/// serves a scripted response.  Used for retry and fallback tests.
pub struct FlakyProvider {
    failures_remaining: AtomicU32,
    inner: ScriptedProvider,
}

impl FlakyProvider {
    pub fn new(failures: u32, then: Vec<ProviderResponse>) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures),
            inner: ScriptedProvider::new(then),
        }
    }

    fn maybe_fail(&self) -> Result<(), ProviderError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            Err(ProviderError::Connection("simulated failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ModelProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn generate(
        &self,
        req: &CompletionRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        self.maybe_fail()?;
        self.inner.generate(req).await
    }

    async fn generate_stream(
        &self,
        req: &CompletionRequest,
        chunks: ChunkSender,
    ) -> Result<ProviderResponse, ProviderError> {
        self.maybe_fail()?;
        self.inner.generate_stream(req, chunks).await
    }

    async fn available(&self) -> bool {
        true
    }

    async fn model_loaded(&self, _model: &str) -> bool {
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
