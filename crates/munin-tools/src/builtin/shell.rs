// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use munin_model::JsonMap;
use serde_json::{json, Value};

use crate::{Tool, ToolResult, TrustLevel};

/// Output of one sandboxed command.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Execution backend for shell commands.
///
/// The runtime only depends on this facade; the hardened containerized
/// backend plugs in behind it.  [`LocalProcessSandbox`] is the plain
/// subprocess implementation used for local development.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, command: &str) -> anyhow::Result<SandboxOutput>;
}

/// Runs commands as ordinary child processes via `sh -c`.
pub struct LocalProcessSandbox;

#[async_trait]
impl Sandbox for LocalProcessSandbox {
    async fn run(&self, command: &str) -> anyhow::Result<SandboxOutput> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;
        Ok(SandboxOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Run a shell command through the sandbox.
///
/// Requires confirmation: command execution is the highest-impact capability
/// the assistant has.  Output is `Mixed` trust; the command itself is
/// model-chosen but its output may contain arbitrary external content.
pub struct ShellTool {
    sandbox: Arc<dyn Sandbox>,
}

impl ShellTool {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its output. Requires user confirmation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The command to run" }
            },
            "required": ["command"],
        })
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    fn trust_level(&self) -> TrustLevel {
        TrustLevel::Mixed
    }

    async fn execute(&self, args: &JsonMap) -> ToolResult {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        if command.trim().is_empty() {
            return ToolResult::fail("Tool error: 'command' must be a non-empty string");
        }

        match self.sandbox.run(command).await {
            Ok(out) => {
                let mut text = out.stdout;
                if !out.stderr.is_empty() {
                    text.push_str("\n[stderr]\n");
                    text.push_str(&out.stderr);
                }
                if out.exit_code == 0 {
                    ToolResult::ok(text)
                } else {
                    ToolResult::fail(format!(
                        "Command exited with status {}:\n{text}",
                        out.exit_code
                    ))
                }
            }
            Err(e) => ToolResult::fail(format!("Tool error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
