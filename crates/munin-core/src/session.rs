// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use munin_model::{Message, Role, ToolCall, Usage};
use uuid::Uuid;

/// Where a session's requests come from.  Group sessions never receive
/// long-term memory in their prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Interactive,
    Private,
    Group,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Ended,
}

/// User override pinning a session to one provider class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderClass {
    Local,
    Cloud,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a pending tool call must be resolved before appending assistant messages")]
    PendingToolCall,
    #[error("a tool call is already pending confirmation")]
    AlreadyPending,
}

/// The transient state of one conversation.
///
/// Exclusively owned by the request currently being processed; tool
/// executions only ever append tool-result messages through the loop.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    turn_count: u32,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last appended message; drives inactivity expiry.
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pending_tool_call: Option<ToolCall>,
    pub source: Option<SessionSource>,
    pub forced_provider: Option<ProviderClass>,
    pub active_agent: String,
    pub enabled_skills: BTreeSet<String>,
    /// Set while a context-maintenance flush is waiting for its compaction
    /// turn (phase 1 injected, phase 2 not yet run).
    pub flush_in_progress: bool,
    /// Provider calls consumed by the current request; confirmation resume
    /// continues with whatever budget is left.
    pub turns_in_request: u32,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            turn_count: 0,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            status: SessionStatus::Active,
            pending_tool_call: None,
            source: None,
            forced_provider: None,
            active_agent: "default".into(),
            enabled_skills: BTreeSet::new(),
            flush_in_progress: false,
            turns_in_request: 0,
        }
    }

    pub fn with_source(source: SessionSource) -> Self {
        Self {
            source: Some(source),
            ..Self::new()
        }
    }

    /// Append a message.  Assistant messages are rejected while a tool call
    /// is pending confirmation, and are the only messages that count as
    /// turns.
    pub fn push(&mut self, message: Message) -> Result<(), SessionError> {
        if message.role == Role::Assistant {
            if self.pending_tool_call.is_some() {
                return Err(SessionError::PendingToolCall);
            }
            self.turn_count += 1;
        }
        self.last_activity = Utc::now();
        self.messages.push(message);
        Ok(())
    }

    /// End the session if it has been idle longer than `max_idle_seconds`.
    /// Returns true when the session was (or already is) expired.
    pub fn expire_if_idle(&mut self, max_idle_seconds: i64) -> bool {
        if self.status == SessionStatus::Ended {
            return true;
        }
        let idle = Utc::now() - self.last_activity;
        if idle.num_seconds() >= max_idle_seconds {
            self.status = SessionStatus::Ended;
            return true;
        }
        false
    }

    /// Number of assistant messages in the history.
    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    /// Replace the message list (compaction).  The turn counter tracks
    /// lifetime turns and is deliberately left untouched; summarizing old
    /// messages away does not un-happen them.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn set_pending(&mut self, call: ToolCall) -> Result<(), SessionError> {
        if self.pending_tool_call.is_some() {
            return Err(SessionError::AlreadyPending);
        }
        self.pending_tool_call = Some(call);
        Ok(())
    }

    pub fn pending(&self) -> Option<&ToolCall> {
        self.pending_tool_call.as_ref()
    }

    pub fn take_pending(&mut self) -> Option<ToolCall> {
        self.pending_tool_call.take()
    }

    pub fn track_usage(&mut self, usage: &Usage) {
        self.input_tokens += usage.prompt_tokens as u64;
        self.output_tokens += usage.completion_tokens as u64;
    }

    pub fn end(&mut self) {
        self.status = SessionStatus::Ended;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
