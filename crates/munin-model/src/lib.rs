// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod anthropic;
mod mock;
mod ollama;
pub mod pricing;
mod provider;
mod retry;
mod types;

pub use anthropic::AnthropicProvider;
pub use mock::{FlakyProvider, ScriptedProvider};
pub use ollama::OllamaProvider;
pub use provider::{ChunkSender, ModelProvider, ProviderError};
pub use retry::{with_backoff, RetryPolicy};
pub use types::{
    normalize_arguments, CompletionRequest, FinishReason, JsonMap, Message, ProviderResponse,
    Role, ToolCall, ToolSchema, Usage,
};
