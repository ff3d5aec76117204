// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, JobCommands};
use munin_core::{ProviderClass, Runtime, Session, SessionSource, TurnOutcome};
use munin_scheduler::{JobStore, LogSink, Notifier, Scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Fatal boot failures (unreadable config, invalid routing tables) exit
    // non-zero through the error return; everything after boot surfaces as
    // in-band results.
    let config = munin_config::load(cli.config.as_deref()).context("loading configuration")?;
    config.validate().context("validating configuration")?;

    match cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Some(Commands::Usage) => {
            let runtime = Runtime::build(&config)?;
            let summary = runtime.usage_summary();
            println!("daily limit:    ${:.2}", summary.daily_limit_usd);
            println!("spent today:    ${:.4}", summary.spent_today_usd);
            println!("remaining:      ${:.4}", summary.remaining_today_usd);
            println!("monthly spend:  ${:.4}", summary.monthly_cloud_spend_usd);
            println!(
                "cloud allowed:  {}",
                if summary.can_use_cloud { "yes" } else { "no" }
            );
            Ok(())
        }
        Some(Commands::Ask { prompt }) => {
            let runtime = Runtime::build(&config)?;
            let mut session = runtime.new_session(SessionSource::Interactive);
            let message = prompt.join(" ");
            run_to_completion(&runtime, &mut session, &message).await;
            Ok(())
        }
        Some(Commands::Jobs { command }) => {
            let runtime = Arc::new(Runtime::build(&config)?);
            let scheduler = build_scheduler(&config, runtime)?;
            handle_jobs(&scheduler, command).await
        }
        None => {
            let runtime = Arc::new(Runtime::build(&config)?);
            let scheduler = build_scheduler(&config, Arc::clone(&runtime))?;
            scheduler.start()?;
            repl(&runtime).await
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("MUNIN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn build_scheduler(
    config: &munin_config::Config,
    runtime: Arc<Runtime>,
) -> anyhow::Result<Scheduler<Runtime>> {
    let store = Arc::new(JobStore::open(&config.paths.state_dir.join("jobs.db"))?);
    let notifier = Arc::new(Notifier::new(&config.scheduler, Box::new(LogSink)));
    Ok(Scheduler::new(store, runtime, notifier))
}

/// Drive one message through the loop, resolving confirmations on stdin.
async fn run_to_completion(runtime: &Runtime, session: &mut Session, message: &str) {
    let mut outcome = runtime.submit(session, message).await;
    loop {
        match outcome {
            TurnOutcome::Completed(text) => {
                println!("{text}");
                return;
            }
            TurnOutcome::Error(e) => {
                eprintln!("error: {e}");
                return;
            }
            TurnOutcome::PendingConfirmation(call) => {
                print!(
                    "tool '{}' wants to run with {} — allow? [y/N] ",
                    call.name,
                    serde_json::Value::Object(call.arguments.clone())
                );
                let _ = io::stdout().flush();
                let mut answer = String::new();
                let approved = io::stdin()
                    .lock()
                    .read_line(&mut answer)
                    .map(|_| matches!(answer.trim(), "y" | "Y" | "yes"))
                    .unwrap_or(false);
                outcome = if approved {
                    runtime.confirm(session).await
                } else {
                    runtime.deny(session).await
                };
            }
        }
    }
}

async fn repl(runtime: &Runtime) -> anyhow::Result<()> {
    let mut session = runtime.new_session(SessionSource::Interactive);
    let stdin = io::stdin();
    println!("munin ready — /quit to exit, /new for a fresh session, @agent to route");

    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                session = runtime.new_session(SessionSource::Interactive);
                println!("(new session)");
                continue;
            }
            "/local" => {
                session.forced_provider = Some(ProviderClass::Local);
                println!("(pinned to local models)");
                continue;
            }
            "/cloud" => {
                session.forced_provider = Some(ProviderClass::Cloud);
                println!("(pinned to cloud models)");
                continue;
            }
            "/auto" => {
                session.forced_provider = None;
                println!("(provider routing restored)");
                continue;
            }
            _ => run_to_completion(runtime, &mut session, line).await,
        }
    }
    Ok(())
}

async fn handle_jobs(scheduler: &Scheduler<Runtime>, command: JobCommands) -> anyhow::Result<()> {
    match command {
        JobCommands::List => {
            for job in scheduler.list()? {
                let state = if job.paused { "paused" } else { "active" };
                println!("{:<20} {:?} [{state}] notify={}", job.name, job.kind, job.notify);
            }
        }
        JobCommands::AddCron {
            name,
            expression,
            prompt,
            notify,
        } => scheduler.add_cron(&name, &expression, &prompt, notify)?,
        JobCommands::AddInterval {
            name,
            minutes,
            prompt,
            notify,
        } => scheduler.add_interval(&name, minutes, &prompt, notify)?,
        JobCommands::AddOneShot {
            name,
            delay,
            prompt,
            notify,
        } => scheduler.add_one_shot(&name, &delay, &prompt, notify)?,
        JobCommands::Remove { name } => scheduler.remove(&name)?,
        JobCommands::Pause { name } => scheduler.pause(&name)?,
        JobCommands::Resume { name } => scheduler.resume(&name)?,
        JobCommands::Status { name } => {
            let (job, last) = scheduler.status(&name)?;
            println!("{:<20} {:?} paused={} notify={}", job.name, job.kind, job.paused, job.notify);
            match last {
                Some(exec) => println!(
                    "last run: {} [{}] {}ms — {}",
                    exec.executed_at, exec.status, exec.duration_ms, exec.result_summary
                ),
                None => println!("never executed"),
            }
        }
        JobCommands::History { name, limit } => {
            for exec in scheduler.recent_executions(&name, limit)? {
                println!(
                    "{} [{}] {}ms — {}",
                    exec.executed_at, exec.status, exec.duration_ms, exec.result_summary
                );
            }
        }
        JobCommands::Run { name } => {
            let exec = scheduler.run_job_now(&name).await?;
            println!("[{}] {}ms — {}", exec.status, exec.duration_ms, exec.result_summary);
        }
    }
    Ok(())
}
