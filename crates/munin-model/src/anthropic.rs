// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Driver for the Anthropic Messages API.
//!
//! `POST {base}/v1/messages` with headers `x-api-key`, `anthropic-version:
//! 2023-06-01`.  The system prompt is a top-level field, not a conversation
//! turn; assistant tool calls become `tool_use` content blocks and tool
//! results become `tool_result` blocks inside user messages.  Streaming is
//! SSE with typed events; HTTP 429 and 529 are retried with backoff.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::pricing;
use crate::provider::{ChunkSender, ModelProvider, ProviderError};
use crate::retry::{with_backoff, RetryPolicy};
use crate::types::{
    CompletionRequest, FinishReason, JsonMap, ProviderResponse, Role, ToolCall, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Reads `ANTHROPIC_API_KEY` from the environment.  Credentials never
    /// come from config files.
    pub fn from_env(base_url: Option<String>) -> Self {
        Self::new(std::env::var("ANTHROPIC_API_KEY").ok(), base_url)
    }

    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Security("Anthropic API key not configured".into()))
    }

    fn build_body(&self, req: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
            "messages": build_anthropic_messages(&req.messages),
        });
        if let Some(system) = &req.system {
            if !system.is_empty() {
                body["system"] = json!(system);
            }
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let key = self.key()?;
        let resp = self
            .client
            .post(self.messages_url())
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(
        &self,
        req: &CompletionRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_body(req, false);
        debug!(url = %self.messages_url(), model = %req.model, "sending anthropic request");

        let resp = with_backoff(self.retry, || self.send(&body)).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("anthropic response: {e}")))?;
        Ok(parse_anthropic_response(&v, &req.model))
    }

    async fn generate_stream(
        &self,
        req: &CompletionRequest,
        chunks: ChunkSender,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_body(req, true);
        debug!(url = %self.messages_url(), model = %req.model, "sending anthropic stream request");

        // Retry covers the request setup only; a stream that breaks mid-way
        // surfaces as a connection error to the caller.
        let resp = with_backoff(self.retry, || self.send(&body)).await?;

        // SSE lines can split across TCP chunks; carry the remainder forward
        // and only parse complete `data: ` lines.
        let mut byte_stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut acc = SseAccumulator::new(&req.model);

        while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::Connection(e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);
                if let Some(data) = line.strip_prefix("data: ") {
                    let data = data.trim();
                    if data == "[DONE]" {
                        continue;
                    }
                    if let Ok(v) = serde_json::from_str::<Value>(data) {
                        acc.feed_event(&v, &chunks);
                    }
                }
            }
        }

        Ok(acc.finish())
    }

    /// Liveness for the cloud backend is credential presence; an HTTP probe
    /// would either cost tokens or be rate-limit noise.
    async fn available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Hosted models are always resident; report whether the id is one the
    /// price table knows so misconfigured tiers surface early.
    async fn model_loaded(&self, model: &str) -> bool {
        pricing::price_for(model).is_some()
    }
}

/// Convert the conversation into Anthropic's wire shape.
///
/// System-role messages inside the history (compaction headers, window
/// summaries) are folded into text content of a user turn is not valid here;
/// they are sent as plain user messages tagged by their own marker text.
pub(crate) fn build_anthropic_messages(messages: &[crate::Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            // In-history system messages (summary headers) become user turns;
            // the top-level system field is handled by the request builder.
            Role::System | Role::User => {
                out.push(json!({ "role": "user", "content": m.content }));
            }
            Role::Assistant => {
                if m.tool_calls.is_empty() {
                    out.push(json!({ "role": "assistant", "content": m.content }));
                } else {
                    let mut blocks: Vec<Value> = Vec::new();
                    if !m.content.is_empty() {
                        blocks.push(json!({ "type": "text", "text": m.content }));
                    }
                    for call in &m.tool_calls {
                        // Anthropic requires tool_use.id to match
                        // ^[a-zA-Z0-9_-]+$; an empty id would 400 the request.
                        let safe_id = if call.id.is_empty() {
                            warn!(tool = %call.name, "tool call with empty id; using fallback");
                            "tc_fallback".to_string()
                        } else {
                            call.id.clone()
                        };
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": safe_id,
                            "name": call.name,
                            "input": call.arguments_value(),
                        }));
                    }
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
            Role::Tool => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.as_deref().unwrap_or(""),
                    "content": m.content,
                });
                if m.success == Some(false) {
                    block["is_error"] = json!(true);
                }
                out.push(json!({ "role": "user", "content": [block] }));
            }
        }
    }
    out
}

/// Parse a non-streaming Messages API response.
fn parse_anthropic_response(v: &Value, model: &str) -> ProviderResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = v["content"].as_array() {
        for block in blocks {
            match block["type"].as_str().unwrap_or("") {
                "text" => text.push_str(block["text"].as_str().unwrap_or("")),
                "tool_use" => {
                    tool_calls.push(ToolCall::new(
                        block["id"].as_str().unwrap_or(""),
                        block["name"].as_str().unwrap_or(""),
                        block["input"].clone(),
                    ));
                }
                _ => {}
            }
        }
    }

    let usage = Usage {
        prompt_tokens: v["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    };
    let model = v["model"].as_str().unwrap_or(model).to_string();
    let finish_reason = map_stop_reason(v["stop_reason"].as_str(), &tool_calls);
    let cost_usd = pricing::cost_usd(&model, usage.prompt_tokens, usage.completion_tokens);

    ProviderResponse {
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls,
        model,
        usage,
        finish_reason,
        cost_usd,
        metadata: JsonMap::new(),
    }
}

/// A `tool_use` stop reason with no decodable calls (all blocks dropped as
/// malformed) is reported as `Stop`, keeping the invariant that `ToolUse`
/// always comes with at least one call.
fn map_stop_reason(stop_reason: Option<&str>, tool_calls: &[ToolCall]) -> FinishReason {
    if !tool_calls.is_empty() {
        return FinishReason::ToolUse;
    }
    match stop_reason {
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Assembles SSE events into a final [`ProviderResponse`].
struct SseAccumulator {
    model: String,
    text: String,
    /// Keyed by content-block index; tool-call argument JSON arrives as
    /// `input_json_delta` fragments for the block that opened with
    /// `content_block_start`.
    pending: std::collections::BTreeMap<u64, PendingBlock>,
    usage: Usage,
    stop_reason: Option<String>,
}

struct PendingBlock {
    id: String,
    name: String,
    args_buf: String,
}

impl SseAccumulator {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            text: String::new(),
            pending: std::collections::BTreeMap::new(),
            usage: Usage::default(),
            stop_reason: None,
        }
    }

    fn feed_event(&mut self, v: &Value, chunks: &ChunkSender) {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(model) = v["message"]["model"].as_str() {
                    self.model = model.to_string();
                }
                if let Some(usage) = v["message"].get("usage") {
                    self.usage.prompt_tokens =
                        usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                }
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    self.pending.insert(
                        index,
                        PendingBlock {
                            id: block["id"].as_str().unwrap_or("").to_string(),
                            name: block["name"].as_str().unwrap_or("").to_string(),
                            args_buf: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if !text.is_empty() {
                            self.text.push_str(text);
                            let _ = chunks.try_send(text.to_string());
                        }
                    }
                    "input_json_delta" => {
                        let partial = delta["partial_json"].as_str().unwrap_or("");
                        if let Some(block) = self.pending.get_mut(&index) {
                            block.args_buf.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = v.get("usage") {
                    self.usage.completion_tokens =
                        usage["output_tokens"].as_u64().unwrap_or(0) as u32;
                }
            }
            // content_block_stop and message_stop carry no data we need;
            // ping and unknown future events are ignored.
            _ => {}
        }
    }

    fn finish(self) -> ProviderResponse {
        let mut tool_calls = Vec::new();
        for (_, block) in self.pending {
            if block.name.is_empty() {
                warn!(id = %block.id, "dropping streamed tool call with empty name");
                continue;
            }
            let args: Value = if block.args_buf.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&block.args_buf).unwrap_or_else(|e| {
                    warn!(tool = %block.name, error = %e, "invalid streamed tool arguments");
                    json!({})
                })
            };
            tool_calls.push(ToolCall::new(block.id, block.name, args));
        }

        let finish_reason = map_stop_reason(self.stop_reason.as_deref(), &tool_calls);
        let cost_usd =
            pricing::cost_usd(&self.model, self.usage.prompt_tokens, self.usage.completion_tokens);
        ProviderResponse {
            content: if self.text.is_empty() {
                None
            } else {
                Some(self.text)
            },
            tool_calls,
            model: self.model,
            usage: self.usage,
            finish_reason,
            cost_usd,
            metadata: JsonMap::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
