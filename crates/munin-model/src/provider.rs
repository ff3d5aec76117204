// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{CompletionRequest, ProviderResponse};

/// Bounded sink for streamed text chunks.
///
/// Providers publish deltas with `try_send`; when the consumer falls behind
/// and the buffer fills, chunks are dropped rather than stalling provider
/// I/O.  The aggregate response returned by `generate_stream` is always
/// complete regardless of what the sink observed.
pub type ChunkSender = mpsc::Sender<String>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport-level failure (connect, DNS, broken stream).
    #[error("connection error: {0}")]
    Connection(String),
    /// Rate limit or overload status that is worth retrying (429, 529).
    #[error("rate limited (HTTP {status}): {message}")]
    RateLimited { status: u16, message: String },
    /// Any other non-success HTTP status.  Not retried.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    /// The response body could not be interpreted.
    #[error("invalid response: {0}")]
    Parse(String),
    /// Missing or rejected credentials.  Never retried, never escalated.
    #[error("{0}")]
    Security(String),
}

impl ProviderError {
    /// Transient errors are retried with backoff; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::RateLimited { .. })
    }

    /// Map an HTTP error status + body to the right variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 | 529 => Self::RateLimited { status, message },
            _ => Self::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

/// Uniform interface over model backends.  Callers never branch on which
/// backend is behind the trait; cost and payload shaping differences are
/// absorbed by the implementations.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider key ("ollama", "anthropic", "scripted" in tests).
    fn name(&self) -> &str;

    /// One blocking completion.
    async fn generate(&self, req: &CompletionRequest)
        -> Result<ProviderResponse, ProviderError>;

    /// Same contract as [`generate`](Self::generate), but text deltas are
    /// published through `chunks` while the response is being produced.
    async fn generate_stream(
        &self,
        req: &CompletionRequest,
        chunks: ChunkSender,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Cheap liveness check.  Must not consume tokens.
    async fn available(&self) -> bool;

    /// Whether `model` is ready to serve on this backend.
    async fn model_loaded(&self, model: &str) -> bool;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_statuses_are_transient() {
        assert!(ProviderError::from_status(429, "slow down").is_transient());
        assert!(ProviderError::from_status(529, "overloaded").is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        assert!(!ProviderError::from_status(400, "bad request").is_transient());
        assert!(!ProviderError::from_status(404, "no such model").is_transient());
    }

    #[test]
    fn server_errors_are_not_transient() {
        // 500s other than 529 fail fast; the router decides what to do next.
        assert!(!ProviderError::from_status(500, "boom").is_transient());
    }

    #[test]
    fn connection_errors_are_transient() {
        assert!(ProviderError::Connection("refused".into()).is_transient());
    }

    #[test]
    fn security_errors_are_not_transient() {
        assert!(!ProviderError::Security("no key".into()).is_transient());
    }
}
