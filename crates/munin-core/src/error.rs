// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use munin_model::ProviderError;

use crate::{BudgetError, SessionError};

/// Error taxonomy of the core runtime.
///
/// Tool-level failures never appear here; they are folded into tool-result
/// messages so the model can react.  Provider errors reach this type only
/// after retry and fallback have been exhausted.  Security errors bypass all
/// fallback and surface directly.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] munin_config::ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("unknown tier '{0}'")]
    UnknownTier(String),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Max turns exceeded")]
    MaxTurnsExceeded,
}

impl CoreError {
    /// Security failures must not be retried or downgraded anywhere.
    pub fn is_security(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Security(_)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_provider_errors_are_flagged() {
        let e = CoreError::from(ProviderError::Security("no key".into()));
        assert!(e.is_security());
    }

    #[test]
    fn other_provider_errors_are_not_security() {
        let e = CoreError::from(ProviderError::Connection("refused".into()));
        assert!(!e.is_security());
    }

    #[test]
    fn max_turns_message_is_stable() {
        assert_eq!(CoreError::MaxTurnsExceeded.to_string(), "Max turns exceeded");
    }
}
