// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token estimation and context-window apportionment.
//!
//! Pure functions, no I/O.  The estimator is a calibrated heuristic; the
//! point is stable, monotone accounting for windowing decisions, not
//! tokenizer-exact counts.

use munin_model::Message;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("unknown budget section '{0}'")]
    UnknownSection(String),
}

/// Per-section shares of the context window.  Must sum to 1.0.
const SECTIONS: &[(&str, f32)] = &[
    ("system_prompt", 0.30),
    ("skills", 0.10),
    ("memory", 0.15),
    ("conversation", 0.40),
    ("reserve", 0.05),
];

/// Estimate the token count of `text`: words × 1.3 + punctuation × 0.3.
///
/// Deterministic and monotone over appends; appending text never decreases
/// the estimate, which the windowing binary search relies on.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count();
    let punctuation = text.chars().filter(|c| c.is_ascii_punctuation()).count();
    (words as f32 * 1.3 + punctuation as f32 * 0.3) as usize
}

/// Tokens attributed to one message: content plus any tool-call payloads.
pub fn message_tokens(message: &Message) -> usize {
    let mut tokens = estimate_tokens(&message.content);
    for call in &message.tool_calls {
        tokens += estimate_tokens(&call.name);
        tokens += estimate_tokens(&call.arguments_value().to_string());
    }
    tokens
}

pub fn conversation_tokens(messages: &[Message]) -> usize {
    messages.iter().map(message_tokens).sum()
}

/// Largest word-boundary prefix of `text` whose estimate fits `max_tokens`.
///
/// Never splits mid-word; idempotent when the text is already under the cap.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    if estimate_tokens(text) <= max_tokens {
        return text;
    }

    // Byte offsets of every word-boundary prefix end.
    let mut boundaries: Vec<usize> = Vec::new();
    let mut in_word = false;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if in_word {
                boundaries.push(i);
            }
            in_word = false;
        } else {
            in_word = true;
        }
    }

    // Binary search for the longest prefix under the cap; estimates are
    // monotone over prefixes, so bisection is sound.
    let mut lo = 0usize; // boundaries[..lo] are known to fit
    let mut hi = boundaries.len();
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        let end = if mid == 0 { 0 } else { boundaries[mid - 1] };
        if estimate_tokens(&text[..end]) <= max_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    if lo == 0 {
        ""
    } else {
        text[..boundaries[lo - 1]].trim_end()
    }
}

/// Apportions one model context window across prompt sections.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    context_window: usize,
}

impl ContextBudget {
    pub fn new(context_window: usize) -> Self {
        debug_assert!(
            (SECTIONS.iter().map(|(_, p)| p).sum::<f32>() - 1.0).abs() < 1e-6,
            "section percentages must sum to 1.0"
        );
        Self { context_window }
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    /// Token budget for a named section.  Unknown names are an error, not a
    /// silent zero; a typo here would starve a prompt section.
    pub fn tokens_for(&self, section: &str) -> Result<usize, BudgetError> {
        SECTIONS
            .iter()
            .find(|(name, _)| *name == section)
            .map(|(_, pct)| (self.context_window as f32 * pct) as usize)
            .ok_or_else(|| BudgetError::UnknownSection(section.to_string()))
    }

    /// The conversation share, used on every turn by windowing/compaction.
    pub fn conversation(&self) -> usize {
        (self.context_window as f32 * 0.40) as usize
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
