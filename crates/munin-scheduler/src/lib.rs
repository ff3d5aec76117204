// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod job;
mod notify;
mod scheduler;
mod store;

pub use job::{parse_delay, JobDefinition, JobKind, ScheduleError};
pub use notify::{LogSink, NotificationSink, Notifier};
pub use scheduler::{AgentRunner, ScheduledOutcome, Scheduler, HEARTBEAT_OK};
pub use store::{ExecutionRecord, JobStore};
