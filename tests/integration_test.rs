// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Boot-level smoke tests: config loading, validation, and runtime assembly
//! against a throwaway state directory.  No network access is exercised.

use munin_core::{Runtime, SessionSource};

fn test_config(dir: &tempfile::TempDir) -> munin_config::Config {
    let mut config = munin_config::Config::default();
    config.paths.state_dir = dir.path().join("state");
    config
}

#[test]
fn default_config_passes_validation() {
    let dir = tempfile::tempdir().unwrap();
    test_config(&dir).validate().unwrap();
}

#[tokio::test]
async fn runtime_builds_against_fresh_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let runtime = Runtime::build(&config).unwrap();

    // State files land under the configured directory.
    assert!(config.paths.state_dir.is_dir());

    let session = runtime.new_session(SessionSource::Interactive);
    assert_eq!(session.active_agent, "default");
    assert!(session.messages.is_empty());

    let summary = runtime.usage_summary();
    assert_eq!(summary.spent_today_usd, 0.0);
    assert!(summary.can_use_cloud);
}

#[tokio::test]
async fn runtime_build_is_repeatable_over_same_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    drop(Runtime::build(&config).unwrap());
    // Second boot reuses the existing databases and ledgers.
    drop(Runtime::build(&config).unwrap());
}

#[test]
fn invalid_config_fails_boot() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.models.default_tier = "nonexistent".into();
    assert!(config.validate().is_err());
}
