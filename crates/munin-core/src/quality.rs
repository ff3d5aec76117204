// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Low-quality predictor for local model output.
//!
//! Small local models fail in recognizable ways: empty output, one-line
//! stubs, token loops, half-formed tool calls, and answers that stop
//! mid-sentence.  The router runs this check on every local response and
//! escalates to a cloud tier when it fires (budget permitting).

use std::collections::HashSet;

use munin_model::{FinishReason, ProviderResponse, ToolSchema};

const MIN_CONTENT_CHARS: usize = 10;
const REPETITION_WINDOW_CHARS: usize = 50;
const REPETITION_MAX_RATIO: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityIssue {
    Empty,
    TooShort,
    Repetitive,
    MalformedToolCall,
    CutOff,
}

impl QualityIssue {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::TooShort => "too_short",
            Self::Repetitive => "repetitive",
            Self::MalformedToolCall => "malformed_tool_call",
            Self::CutOff => "cut_off",
        }
    }
}

/// Classify a response; `None` means it looks fine.
pub fn assess_quality(
    response: &ProviderResponse,
    tools: &[ToolSchema],
) -> Option<QualityIssue> {
    // Tool-use turns legitimately carry little or no text; only the shape of
    // the calls themselves is checked.
    if response.finish_reason == FinishReason::ToolUse {
        return has_malformed_tool_call(response, tools).then_some(QualityIssue::MalformedToolCall);
    }

    let content = response.text().trim();
    if content.is_empty() {
        return Some(QualityIssue::Empty);
    }
    if content.chars().count() < MIN_CONTENT_CHARS {
        return Some(QualityIssue::TooShort);
    }
    if content.chars().count() >= REPETITION_WINDOW_CHARS && repetition_ratio(content) > REPETITION_MAX_RATIO
    {
        return Some(QualityIssue::Repetitive);
    }
    if response.finish_reason == FinishReason::Stop && looks_cut_off(content) {
        return Some(QualityIssue::CutOff);
    }
    None
}

/// 1 − unique-word ratio.  "the the the the" → 0.75.
fn repetition_ratio(content: &str) -> f32 {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let unique: HashSet<&str> = words.iter().copied().collect();
    1.0 - unique.len() as f32 / words.len() as f32
}

/// Stopped output that does not end a sentence.
///
/// Responses ending inside (or with) a code fence are exempt: code blocks
/// legitimately end without sentence punctuation and were the main source of
/// false positives for this heuristic.
fn looks_cut_off(content: &str) -> bool {
    if content.ends_with("```") || content.matches("```").count() % 2 == 1 {
        return false;
    }
    let last = content.chars().next_back().unwrap_or(' ');
    !matches!(last, '.' | '!' | '?' | '…' | ':' | ')' | ']' | '"' | '\'' | '`')
}

/// Arguments empty for a tool whose schema declares required parameters.
fn has_malformed_tool_call(response: &ProviderResponse, tools: &[ToolSchema]) -> bool {
    response.tool_calls.iter().any(|call| {
        if !call.arguments.is_empty() {
            return false;
        }
        tools
            .iter()
            .find(|t| t.name == call.name)
            .map(|t| {
                t.parameters["required"]
                    .as_array()
                    .map(|r| !r.is_empty())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
