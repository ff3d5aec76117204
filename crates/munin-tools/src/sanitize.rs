// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Output sanitizer for untrusted tool results.
//!
//! Tool output that includes content from outside the trust boundary (web
//! pages, subprocess output, remote messages) can carry prompt-injection
//! attempts.  Before such output enters the message history the sanitizer
//! neutralizes instruction-override phrasing and pseudo-system markers, and
//! caps the length so a hostile page cannot flood the context window.

use std::sync::OnceLock;

use regex::Regex;

use crate::TrustLevel;

const FILTERED: &str = "[filtered]";
const TRUNCATION_NOTICE: &str = "\n[tool output truncated]";

fn injection_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Instruction-override phrasing.
            r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+instructions",
            r"(?i)disregard\s+(all\s+)?(previous|prior|above)\s+instructions",
            r"(?i)you\s+are\s+now\s+in\s+developer\s+mode",
            // Pseudo role or system markers that mimic prompt structure.
            r"(?i)</?system[^>]*>",
            r"(?im)^\s*system\s*:",
            r"(?i)\[SYSTEM[^\]]*\]",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("sanitizer patterns are static"))
        .collect()
    })
}

/// Sanitize tool output according to its trust level.
///
/// `Trusted` output is returned verbatim.  `Mixed`/`Untrusted` output has
/// injection markers replaced with `[filtered]` and is capped at `max_chars`
/// (0 disables the cap), cut at a character boundary.
pub fn sanitize_tool_output(text: &str, trust: TrustLevel, max_chars: usize) -> String {
    if !trust.needs_sanitizing() {
        return text.to_string();
    }

    let mut cleaned = text.to_string();
    for pattern in injection_patterns() {
        cleaned = pattern.replace_all(&cleaned, FILTERED).into_owned();
    }
    // Control characters can smuggle terminal escapes into logs and prompts.
    cleaned.retain(|c| c == '\n' || c == '\t' || !c.is_control());

    if max_chars > 0 && cleaned.chars().count() > max_chars {
        let cut: String = cleaned.chars().take(max_chars).collect();
        cleaned = format!("{cut}{TRUNCATION_NOTICE}");
    }
    cleaned
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
