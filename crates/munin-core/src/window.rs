// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sliding-window truncation of conversation history.
//!
//! Whenever the history exceeds the conversation budget, the oldest messages
//! are summarized into a single leading system message and only the most
//! recent suffix is kept.  80% of the budget goes to the retained suffix,
//! 20% is reserved for the summary header.

use munin_model::Message;

use crate::budget::{conversation_tokens, message_tokens};
use crate::compactor::Compressor;

pub const SUMMARY_PREFIX: &str = "[Conversation summary]";

/// Fraction of the conversation budget kept for recent messages.
const RETAIN_FRACTION: f32 = 0.80;

/// Apply the sliding window.  Returns the message list to send to the
/// provider; the session's own history is not modified.
///
/// Relative order of every retained message equals its pre-window order.
pub async fn apply(
    messages: &[Message],
    conversation_budget: usize,
    compressor: Option<&Compressor>,
) -> Vec<Message> {
    if conversation_tokens(messages) <= conversation_budget {
        return messages.to_vec();
    }

    let retain_budget = (conversation_budget as f32 * RETAIN_FRACTION) as usize;
    let summary_budget = conversation_budget.saturating_sub(retain_budget);

    // Longest suffix that fits the retained share.
    let mut split = messages.len();
    let mut used = 0usize;
    while split > 0 {
        let next = message_tokens(&messages[split - 1]);
        if used + next > retain_budget {
            break;
        }
        used += next;
        split -= 1;
    }

    let older = &messages[..split];
    let suffix = &messages[split..];

    let summary = match compressor {
        Some(c) => c.summarize(older, summary_budget).await,
        None => Compressor::fallback_summary(older, summary_budget),
    };

    let mut out = Vec::with_capacity(suffix.len() + 1);
    out.push(Message::system(format!("{SUMMARY_PREFIX} {summary}")));
    out.extend_from_slice(suffix);
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use munin_model::Role;

    fn long_history(pairs: usize) -> Vec<Message> {
        let mut msgs = Vec::new();
        for i in 0..pairs {
            msgs.push(Message::user(format!(
                "user message number {i} with several extra words to occupy budget space"
            )));
            msgs.push(Message::assistant(format!(
                "assistant reply number {i} also padded with additional words for size"
            )));
        }
        msgs
    }

    #[tokio::test]
    async fn history_under_budget_is_untouched() {
        let msgs = long_history(2);
        let windowed = apply(&msgs, 100_000, None).await;
        assert_eq!(windowed.len(), msgs.len());
        assert!(windowed
            .iter()
            .zip(&msgs)
            .all(|(a, b)| a.content == b.content));
    }

    #[tokio::test]
    async fn over_budget_history_gets_summary_header() {
        let msgs = long_history(30);
        let windowed = apply(&msgs, 200, None).await;
        assert_eq!(windowed[0].role, Role::System);
        assert!(windowed[0].content.starts_with(SUMMARY_PREFIX));
        assert!(windowed.len() < msgs.len());
    }

    #[tokio::test]
    async fn retained_suffix_fits_80_percent_of_budget() {
        let msgs = long_history(30);
        let budget = 200;
        let windowed = apply(&msgs, budget, None).await;
        let suffix_tokens = conversation_tokens(&windowed[1..]);
        assert!(
            suffix_tokens <= (budget as f32 * 0.80) as usize,
            "suffix {suffix_tokens} tokens exceeds 80% of {budget}"
        );
    }

    #[tokio::test]
    async fn retained_messages_keep_relative_order() {
        let msgs = long_history(30);
        let windowed = apply(&msgs, 200, None).await;
        let retained: Vec<&str> = windowed[1..].iter().map(|m| m.content.as_str()).collect();
        let originals: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        // The retained list must appear as a contiguous suffix of the original.
        let start = originals.len() - retained.len();
        assert_eq!(&originals[start..], retained.as_slice());
    }

    #[tokio::test]
    async fn fallback_summary_lists_user_lines() {
        let msgs = vec![
            Message::user("remember the dentist appointment"),
            Message::assistant("noted"),
            Message::user("also buy milk\nand eggs"),
            Message::assistant("will do"),
            // Padding so the window actually triggers.
            Message::user(
                "now a much longer message with plenty of words so that the total \
                 history overflows the tiny budget used by this test case easily",
            ),
        ];
        let windowed = apply(&msgs, 30, None).await;
        let header = &windowed[0].content;
        assert!(header.starts_with(SUMMARY_PREFIX));
        assert!(header.contains("- remember the dentist appointment"));
    }

    #[tokio::test]
    async fn summary_respects_reserve_budget() {
        let msgs = long_history(100);
        let budget = 100;
        let windowed = apply(&msgs, budget, None).await;
        let header_tokens = crate::budget::estimate_tokens(&windowed[0].content);
        // Reserve is 20% plus the prefix label itself.
        assert!(
            header_tokens <= budget / 5 + 5,
            "summary header too large: {header_tokens} tokens"
        );
    }
}
