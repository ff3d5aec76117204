// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static price table for cloud models, USD per million tokens.
//!
//! Local models always cost 0.  Unknown cloud models also price at 0;
//! better to under-report than to refuse service over a missing table row.
//! The model id still lands in the usage ledger for later reconciliation.

/// (model id prefix, input USD/MTok, output USD/MTok).
///
/// Longest-prefix entries first where ids overlap.
const PRICES: &[(&str, f64, f64)] = &[
    ("claude-opus-4", 15.0, 75.0),
    ("claude-sonnet-4", 3.0, 15.0),
    ("claude-3-7-sonnet", 3.0, 15.0),
    ("claude-3-5-sonnet", 3.0, 15.0),
    ("claude-3-5-haiku", 0.80, 4.0),
    ("claude-3-haiku", 0.25, 1.25),
    ("claude-3-opus", 15.0, 75.0),
];

/// Per-million-token prices for a model, or `None` when unknown.
pub fn price_for(model: &str) -> Option<(f64, f64)> {
    PRICES
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, input, output)| (*input, *output))
}

/// Cost of one completion in USD.  Unknown models price at 0.
pub fn cost_usd(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    match price_for(model) {
        Some((input, output)) => {
            (prompt_tokens as f64 * input + completion_tokens as f64 * output) / 1e6
        }
        None => 0.0,
    }
}

/// Estimated cost of `tokens` input tokens on `model`, for budget gating.
pub fn estimated_input_cost(model: &str, tokens: u32) -> f64 {
    match price_for(model) {
        Some((input, _)) => tokens as f64 * input / 1e6,
        None => 0.0,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
