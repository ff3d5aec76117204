// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::Local;

/// Render the runtime information block injected into the system prompt.
///
/// Kept deliberately small: local wall clock (the assistant schedules
/// reminders and reasons about "today"), host OS, and runtime version.
pub fn system_info_block() -> String {
    let now = Local::now();
    format!(
        "Current time: {}\nDay: {}\nHost OS: {}\nRuntime: munin {}",
        now.format("%Y-%m-%d %H:%M:%S %Z"),
        now.format("%A"),
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION"),
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_contains_current_year() {
        let year = Local::now().format("%Y").to_string();
        assert!(system_info_block().contains(&year));
    }

    #[test]
    fn block_contains_runtime_version() {
        assert!(system_info_block().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn block_has_four_lines() {
        assert_eq!(system_info_block().lines().count(), 4);
    }
}
