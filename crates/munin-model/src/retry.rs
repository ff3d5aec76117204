// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::ProviderError;

/// Bounded exponential backoff with jitter for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base × 2^(attempt-1)
    /// plus up to one base interval of jitter so concurrent clients do not
    /// hammer the backend in lockstep.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << (attempt - 1).min(8));
        let jitter = rand::thread_rng().gen_range(0..=self.base_delay_ms);
        Duration::from_millis(exp + jitter)
    }
}

/// Run `op`, retrying transient [`ProviderError`]s per `policy`.
///
/// Non-transient errors (4xx other than rate limits, parse failures,
/// security errors) are returned immediately.
pub async fn with_backoff<T, Fut, F>(policy: RetryPolicy, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider error; backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_retry() {
        let calls = AtomicU32::new(0);
        let out = with_backoff(fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ProviderError>(7) }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Connection("refused".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_when_a_retry_succeeds() {
        let calls = AtomicU32::new(0);
        let out = with_backoff(fast_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(ProviderError::RateLimited {
                        status: 429,
                        message: "slow down".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ProviderError::Api {
                    status: 400,
                    message: "bad request".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn security_errors_are_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(fast_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Security("API key not configured".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_with_attempts() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
        };
        // jitter adds at most base_delay_ms, so attempt 3 (400ms floor) always
        // exceeds attempt 1's ceiling (200ms).
        assert!(p.delay(3) > p.delay(1));
    }
}
