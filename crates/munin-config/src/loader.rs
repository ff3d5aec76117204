// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/munin/config.yaml"));
    paths.push(PathBuf::from("/etc/munin/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/munin/config.yaml"));
        paths.push(home.join(".config/munin/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("munin/config.yaml"));
        paths.push(cfg.join("munin/config.yml"));
    }

    paths.push(PathBuf::from(".munin.yaml"));
    paths.push(PathBuf::from(".munin.yml"));
    paths.push(PathBuf::from("munin.yaml"));
    paths.push(PathBuf::from("munin.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then apply
/// environment overrides.  The `extra` argument may provide an explicit path
/// (e.g. a `--config` CLI flag).
///
/// Environment variables recognized here:
/// - `MUNIN_NO_ESCALATION`; any non-empty value disables cloud escalation.
///
/// Credentials (`ANTHROPIC_API_KEY`) are deliberately *not* part of the
/// config schema; providers read them from the environment at construction.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("config did not match the expected schema")?
    };

    if std::env::var("MUNIN_NO_ESCALATION").map(|v| !v.is_empty()) == Ok(true) {
        debug!("MUNIN_NO_ESCALATION set; disabling cloud escalation");
        config.models.escalation_enabled = false;
    }

    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
