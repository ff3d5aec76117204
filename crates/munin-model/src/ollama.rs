// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Driver for a local Ollama backend.
//!
//! Chat endpoint: `POST {base}/api/chat`, JSON body.  Streaming responses are
//! NDJSON; one JSON object per line, `done: true` on the final line carrying
//! `prompt_eval_count` / `eval_count` totals.  Liveness: `GET {base}/api/tags`
//! returns 200 when the server is up; the same endpoint lists loaded models.
//! A local backend has no per-token price, so `cost_usd` is always 0.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::provider::{ChunkSender, ModelProvider, ProviderError};
use crate::types::{
    CompletionRequest, FinishReason, JsonMap, ProviderResponse, Role, ToolCall, Usage,
};

pub struct OllamaProvider {
    base_url: String,
    keep_alive: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, keep_alive: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            keep_alive: keep_alive.into(),
            client: reqwest::Client::new(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    fn build_body(&self, req: &CompletionRequest, stream: bool) -> Value {
        let mut options = json!({
            "temperature": req.temperature,
            "num_predict": req.max_tokens,
        });
        if let Some(ctx) = req.context_window {
            options["num_ctx"] = json!(ctx);
        }

        let mut body = json!({
            "model": req.model,
            "messages": build_ollama_messages(req),
            "stream": stream,
            "options": options,
            "keep_alive": self.keep_alive,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        req: &CompletionRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_body(req, false);
        debug!(url = %self.chat_url(), model = %req.model, "sending ollama request");

        let resp = self.client.post(self.chat_url()).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), text));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Parse(format!("ollama response: {e}")))?;
        Ok(parse_ollama_response(&v, &req.model))
    }

    async fn generate_stream(
        &self,
        req: &CompletionRequest,
        chunks: ChunkSender,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = self.build_body(req, true);
        debug!(url = %self.chat_url(), model = %req.model, "sending ollama stream request");

        let resp = self.client.post(self.chat_url()).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), text));
        }

        // NDJSON lines can split across TCP chunks; carry the remainder
        // forward and only parse complete lines.
        let mut byte_stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut acc = StreamAccumulator::new(&req.model);

        while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::Connection(e.to_string()))?;
            buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);
                if line.trim().is_empty() {
                    continue;
                }
                acc.feed_line(&line, &chunks)?;
            }
        }
        let remainder = buf.trim().to_string();
        if !remainder.is_empty() {
            acc.feed_line(&remainder, &chunks)?;
        }

        Ok(acc.finish())
    }

    async fn available(&self) -> bool {
        match self.client.get(self.tags_url()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn model_loaded(&self, model: &str) -> bool {
        let Ok(resp) = self.client.get(self.tags_url()).send().await else {
            return false;
        };
        let Ok(v) = resp.json::<Value>().await else {
            return false;
        };
        v["models"]
            .as_array()
            .map(|models| {
                models.iter().any(|m| {
                    m["name"]
                        .as_str()
                        .map(|n| n == model || n.starts_with(&format!("{model}:")))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }
}

/// Convert the conversation into Ollama's message list.  The system prompt
/// travels as a leading role=system entry; historical assistant tool calls
/// are re-serialized into Ollama's `tool_calls` shape so the model keeps
/// context continuity across turns.
fn build_ollama_messages(req: &CompletionRequest) -> Vec<Value> {
    let mut out = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = &req.system {
        if !system.is_empty() {
            out.push(json!({ "role": "system", "content": system }));
        }
    }
    for m in &req.messages {
        match m.role {
            Role::System => out.push(json!({ "role": "system", "content": m.content })),
            Role::User => out.push(json!({ "role": "user", "content": m.content })),
            Role::Assistant => {
                if m.tool_calls.is_empty() {
                    out.push(json!({ "role": "assistant", "content": m.content }));
                } else {
                    let calls: Vec<Value> = m
                        .tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "function": {
                                    "name": c.name,
                                    "arguments": c.arguments_value(),
                                }
                            })
                        })
                        .collect();
                    out.push(json!({
                        "role": "assistant",
                        "content": m.content,
                        "tool_calls": calls,
                    }));
                }
            }
            Role::Tool => out.push(json!({ "role": "tool", "content": m.content })),
        }
    }
    out
}

/// Parse a non-streaming `/api/chat` response.
fn parse_ollama_response(v: &Value, model: &str) -> ProviderResponse {
    let content = v["message"]["content"].as_str().unwrap_or("").to_string();
    let tool_calls = parse_tool_calls(&v["message"]["tool_calls"], 0);

    let usage = Usage {
        prompt_tokens: v["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
        completion_tokens: v["eval_count"].as_u64().unwrap_or(0) as u32,
    };
    let finish_reason = classify_finish(&tool_calls, v["done_reason"].as_str());

    ProviderResponse {
        content: if content.is_empty() { None } else { Some(content) },
        tool_calls,
        model: v["model"].as_str().unwrap_or(model).to_string(),
        usage,
        finish_reason,
        cost_usd: 0.0,
        metadata: JsonMap::new(),
    }
}

/// Ollama does not assign tool-call ids; synthesize stable ones so the rest
/// of the pipeline (result pairing, audit) can rely on uniqueness.
fn parse_tool_calls(v: &Value, start_index: usize) -> Vec<ToolCall> {
    let Some(calls) = v.as_array() else {
        return Vec::new();
    };
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, tc)| {
            let name = tc["function"]["name"].as_str()?;
            if name.is_empty() {
                return None;
            }
            Some(ToolCall::new(
                format!("call_{}", start_index + i),
                name,
                tc["function"]["arguments"].clone(),
            ))
        })
        .collect()
}

fn classify_finish(tool_calls: &[ToolCall], done_reason: Option<&str>) -> FinishReason {
    if !tool_calls.is_empty() {
        FinishReason::ToolUse
    } else {
        match done_reason {
            Some("length") => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }
}

/// Accumulates NDJSON chunks into a final [`ProviderResponse`].
struct StreamAccumulator {
    model: String,
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
    done_reason: Option<String>,
}

impl StreamAccumulator {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            text: String::new(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            done_reason: None,
        }
    }

    fn feed_line(&mut self, line: &str, chunks: &ChunkSender) -> Result<(), ProviderError> {
        let v: Value = serde_json::from_str(line)
            .map_err(|e| ProviderError::Parse(format!("ollama NDJSON line: {e}")))?;

        if let Some(model) = v["model"].as_str() {
            self.model = model.to_string();
        }
        let content = v["message"]["content"].as_str().unwrap_or("");
        if !content.is_empty() {
            self.text.push_str(content);
            // Slow consumers lose chunks; the aggregate stays complete.
            let _ = chunks.try_send(content.to_string());
        }
        let new_calls = parse_tool_calls(&v["message"]["tool_calls"], self.tool_calls.len());
        self.tool_calls.extend(new_calls);

        if v["done"].as_bool().unwrap_or(false) {
            self.usage = Usage {
                prompt_tokens: v["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
                completion_tokens: v["eval_count"].as_u64().unwrap_or(0) as u32,
            };
            self.done_reason = v["done_reason"].as_str().map(str::to_string);
        }
        Ok(())
    }

    fn finish(self) -> ProviderResponse {
        let finish_reason = classify_finish(&self.tool_calls, self.done_reason.as_deref());
        ProviderResponse {
            content: if self.text.is_empty() {
                None
            } else {
                Some(self.text)
            },
            tool_calls: self.tool_calls,
            model: self.model,
            usage: self.usage,
            finish_reason,
            cost_usd: 0.0,
            metadata: JsonMap::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ToolSchema};
    use serde_json::json;

    fn request() -> CompletionRequest {
        let mut req = CompletionRequest::new("llama3.2:1b", vec![Message::user("hi")]);
        req.system = Some("be brief".into());
        req.temperature = 0.3;
        req.max_tokens = 512;
        req
    }

    // ── Request body ──────────────────────────────────────────────────────────

    #[test]
    fn body_has_model_messages_and_options() {
        let p = OllamaProvider::new("http://localhost:11434", "5m");
        let body = p.build_body(&request(), false);
        assert_eq!(body["model"], "llama3.2:1b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["temperature"], 0.3);
        assert_eq!(body["options"]["num_predict"], 512);
        assert_eq!(body["keep_alive"], "5m");
    }

    #[test]
    fn system_prompt_becomes_leading_system_message() {
        let p = OllamaProvider::new("http://localhost:11434", "5m");
        let body = p.build_body(&request(), false);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[0]["content"], "be brief");
        assert_eq!(msgs[1]["role"], "user");
    }

    #[test]
    fn context_window_maps_to_num_ctx() {
        let p = OllamaProvider::new("http://localhost:11434", "5m");
        let mut req = request();
        req.context_window = Some(8192);
        let body = p.build_body(&req, false);
        assert_eq!(body["options"]["num_ctx"], 8192);
    }

    #[test]
    fn num_ctx_omitted_when_unset() {
        let p = OllamaProvider::new("http://localhost:11434", "5m");
        let body = p.build_body(&request(), false);
        assert!(body["options"].get("num_ctx").is_none());
    }

    #[test]
    fn tools_use_function_wrapper_shape() {
        let p = OllamaProvider::new("http://localhost:11434", "5m");
        let mut req = request();
        req.tools.push(ToolSchema {
            name: "echo".into(),
            description: "echoes".into(),
            parameters: json!({"type": "object"}),
        });
        let body = p.build_body(&req, false);
        let tool = &body["tools"][0];
        assert_eq!(tool["type"], "function");
        assert_eq!(tool["function"]["name"], "echo");
        assert_eq!(tool["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn historical_tool_calls_reserialized() {
        let p = OllamaProvider::new("http://localhost:11434", "5m");
        let mut req = request();
        req.messages.push(Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_0", "echo", json!({"text": "x"}))],
        ));
        req.messages.push(Message::tool_result("call_0", "x", true));
        let body = p.build_body(&req, false);
        let msgs = body["messages"].as_array().unwrap();
        let assistant = &msgs[2];
        assert_eq!(assistant["tool_calls"][0]["function"]["name"], "echo");
        assert_eq!(
            assistant["tool_calls"][0]["function"]["arguments"]["text"],
            "x"
        );
        assert_eq!(msgs[3]["role"], "tool");
        assert_eq!(msgs[3]["content"], "x");
    }

    // ── Response parsing ──────────────────────────────────────────────────────

    #[test]
    fn parse_plain_text_response() {
        let v = json!({
            "model": "llama3.2:1b",
            "message": { "role": "assistant", "content": "hello!" },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 20,
            "eval_count": 5,
        });
        let r = parse_ollama_response(&v, "llama3.2:1b");
        assert_eq!(r.text(), "hello!");
        assert_eq!(r.finish_reason, FinishReason::Stop);
        assert_eq!(r.usage.prompt_tokens, 20);
        assert_eq!(r.usage.completion_tokens, 5);
        assert_eq!(r.cost_usd, 0.0);
    }

    #[test]
    fn parse_tool_call_response() {
        let v = json!({
            "model": "qwen2.5:7b",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    { "function": { "name": "echo", "arguments": {"text": "world"} } }
                ]
            },
            "done": true,
            "done_reason": "stop",
        });
        let r = parse_ollama_response(&v, "qwen2.5:7b");
        assert_eq!(r.finish_reason, FinishReason::ToolUse);
        assert_eq!(r.tool_calls.len(), 1);
        assert_eq!(r.tool_calls[0].name, "echo");
        assert_eq!(r.tool_calls[0].id, "call_0");
        assert_eq!(r.tool_calls[0].arguments["text"], "world");
    }

    #[test]
    fn length_done_reason_maps_to_length() {
        let v = json!({
            "message": { "content": "truncated tex" },
            "done": true,
            "done_reason": "length",
        });
        let r = parse_ollama_response(&v, "m");
        assert_eq!(r.finish_reason, FinishReason::Length);
    }

    #[test]
    fn tool_call_with_empty_name_is_dropped() {
        let calls = parse_tool_calls(
            &json!([{ "function": { "name": "", "arguments": {} } }]),
            0,
        );
        assert!(calls.is_empty());
    }

    // ── Stream accumulation ───────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_accumulates_text_and_usage() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let mut acc = StreamAccumulator::new("llama3.2:1b");
        acc.feed_line(r#"{"message":{"content":"Hel"},"done":false}"#, &tx)
            .unwrap();
        acc.feed_line(r#"{"message":{"content":"lo"},"done":false}"#, &tx)
            .unwrap();
        acc.feed_line(
            r#"{"message":{"content":""},"done":true,"done_reason":"stop","prompt_eval_count":9,"eval_count":2}"#,
            &tx,
        )
        .unwrap();
        let r = acc.finish();
        assert_eq!(r.text(), "Hello");
        assert_eq!(r.usage.prompt_tokens, 9);
        assert_eq!(r.usage.completion_tokens, 2);
        assert_eq!(rx.recv().await.unwrap(), "Hel");
        assert_eq!(rx.recv().await.unwrap(), "lo");
    }

    #[tokio::test]
    async fn stream_collects_tool_calls() {
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let mut acc = StreamAccumulator::new("m");
        acc.feed_line(
            r#"{"message":{"content":"","tool_calls":[{"function":{"name":"echo","arguments":{"a":1}}}]},"done":true,"done_reason":"stop"}"#,
            &tx,
        )
        .unwrap();
        let r = acc.finish();
        assert_eq!(r.finish_reason, FinishReason::ToolUse);
        assert_eq!(r.tool_calls[0].arguments["a"], 1);
    }

    #[tokio::test]
    async fn stream_full_channel_drops_chunks_but_keeps_aggregate() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let mut acc = StreamAccumulator::new("m");
        for i in 0..10 {
            acc.feed_line(
                &format!(r#"{{"message":{{"content":"{i}"}},"done":false}}"#),
                &tx,
            )
            .unwrap();
        }
        let r = acc.finish();
        assert_eq!(r.text(), "0123456789");
    }

    #[test]
    fn invalid_ndjson_line_is_a_parse_error() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let mut acc = StreamAccumulator::new("m");
        assert!(matches!(
            acc.feed_line("{broken", &tx),
            Err(ProviderError::Parse(_))
        ));
    }
}
