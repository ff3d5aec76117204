// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "munin", version, about = "A personal, locally-hosted AI assistant")]
pub struct Cli {
    /// Explicit config file (merged over the standard search paths)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr even in interactive mode
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Ask a single question and exit
    Ask {
        /// The message to send
        prompt: Vec<String>,
    },
    /// Print the effective merged configuration
    ShowConfig,
    /// Print budget and usage totals
    Usage,
    /// Manage scheduled jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum JobCommands {
    /// List all jobs
    List,
    /// Add a cron job (second-resolution cron expression)
    AddCron {
        name: String,
        expression: String,
        prompt: String,
        /// Notify with the result
        #[arg(long)]
        notify: bool,
    },
    /// Add an every-N-minutes job
    AddInterval {
        name: String,
        minutes: u64,
        prompt: String,
        #[arg(long)]
        notify: bool,
    },
    /// Add a run-once job ("1h30m" style delay)
    AddOneShot {
        name: String,
        delay: String,
        prompt: String,
        #[arg(long)]
        notify: bool,
    },
    /// Remove a job and its history
    Remove { name: String },
    /// Pause a job
    Pause { name: String },
    /// Resume a paused job
    Resume { name: String },
    /// Show a job and its last execution
    Status { name: String },
    /// Show recent executions of a job
    History {
        name: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Fire a job immediately, ignoring its schedule
    Run { name: String },
}
