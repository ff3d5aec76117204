// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Notification delivery with rate limiting and quiet hours.
//!
//! Deliveries go through a pluggable sink (desktop notifier, chat bridge,
//! test stub).  A global per-hour cap keeps a misbehaving job from spamming
//! the user; outside active hours notifications are dropped or queued per
//! policy, and the queue drains at the next active-hours edge.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Local, Timelike};
use munin_config::{QuietHoursPolicy, SchedulerConfig};
use tracing::{debug, warn};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, message: &str) -> anyhow::Result<()>;
}

/// Logs notifications; the default sink when nothing else is wired up.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, message: &str) -> anyhow::Result<()> {
        tracing::info!(message, "notification");
        Ok(())
    }
}

pub struct Notifier {
    sink: Box<dyn NotificationSink>,
    max_per_hour: u32,
    active_start: u32,
    active_end: u32,
    policy: QuietHoursPolicy,
    queue_size: usize,
    /// Delivery timestamps within the rolling hour window.
    sent: Mutex<VecDeque<Instant>>,
    /// Quiet-hours queue, drained at the next active edge.
    queued: Mutex<VecDeque<String>>,
}

impl Notifier {
    pub fn new(config: &SchedulerConfig, sink: Box<dyn NotificationSink>) -> Self {
        Self {
            sink,
            max_per_hour: config.max_notifications_per_hour,
            active_start: config.active_hours_start,
            active_end: config.active_hours_end,
            policy: config.quiet_hours_policy,
            queue_size: config.queue_size,
            sent: Mutex::new(VecDeque::new()),
            queued: Mutex::new(VecDeque::new()),
        }
    }

    /// Deliver or queue `message` according to the current local hour.
    pub async fn notify(&self, message: &str) {
        self.notify_at(Local::now().hour(), message).await;
    }

    /// Drain queued notifications; call when entering active hours (and
    /// periodically; draining outside active hours is a no-op).
    pub async fn drain(&self) {
        self.drain_at(Local::now().hour()).await;
    }

    pub fn queued_len(&self) -> usize {
        self.queued.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn notify_at(&self, hour: u32, message: &str) {
        if !self.in_active_hours(hour) {
            match self.policy {
                QuietHoursPolicy::Drop => {
                    debug!(hour, "quiet hours; dropping notification");
                }
                QuietHoursPolicy::Queue => self.enqueue(message),
            }
            return;
        }
        if !self.try_take_rate_slot() {
            warn!(max_per_hour = self.max_per_hour, "notification rate limit hit; dropping");
            return;
        }
        self.deliver(message).await;
    }

    async fn drain_at(&self, hour: u32) {
        if !self.in_active_hours(hour) {
            return;
        }
        loop {
            let next = {
                let mut queued = self.queued.lock().unwrap_or_else(|p| p.into_inner());
                queued.pop_front()
            };
            let Some(message) = next else { break };
            if !self.try_take_rate_slot() {
                // Out of rate budget; put it back for the next drain pass.
                self.queued
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push_front(message);
                break;
            }
            self.deliver(&message).await;
        }
    }

    fn enqueue(&self, message: &str) {
        let mut queued = self.queued.lock().unwrap_or_else(|p| p.into_inner());
        if queued.len() >= self.queue_size {
            warn!(capacity = self.queue_size, "notification queue full; dropping oldest");
            queued.pop_front();
        }
        queued.push_back(message.to_string());
    }

    /// Active window is [start, end); a start after the end wraps midnight.
    fn in_active_hours(&self, hour: u32) -> bool {
        if self.active_start <= self.active_end {
            hour >= self.active_start && hour < self.active_end
        } else {
            hour >= self.active_start || hour < self.active_end
        }
    }

    fn try_take_rate_slot(&self) -> bool {
        let mut sent = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        while sent
            .front()
            .map(|t| t.elapsed() >= Duration::from_secs(3600))
            .unwrap_or(false)
        {
            sent.pop_front();
        }
        if sent.len() >= self.max_per_hour as usize {
            return false;
        }
        sent.push_back(Instant::now());
        true
    }

    async fn deliver(&self, message: &str) {
        if let Err(e) = self.sink.deliver(message).await {
            warn!(error = %e, "notification sink failed");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        delivered: Arc<Mutex<Vec<String>>>,
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn deliver(&self, message: &str) -> anyhow::Result<()> {
            self.delivered.lock().unwrap().push(message.to_string());
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn notifier(policy: QuietHoursPolicy, max_per_hour: u32) -> (Notifier, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfig {
            max_notifications_per_hour: max_per_hour,
            active_hours_start: 8,
            active_hours_end: 22,
            quiet_hours_policy: policy,
            queue_size: 3,
        };
        let n = Notifier::new(
            &config,
            Box::new(CountingSink {
                delivered: delivered.clone(),
                count: count.clone(),
            }),
        );
        (n, count, delivered)
    }

    #[tokio::test]
    async fn delivers_during_active_hours() {
        let (n, count, delivered) = notifier(QuietHoursPolicy::Queue, 6);
        n.notify_at(12, "temp high").await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(delivered.lock().unwrap()[0], "temp high");
    }

    #[tokio::test]
    async fn queues_during_quiet_hours() {
        let (n, count, _) = notifier(QuietHoursPolicy::Queue, 6);
        n.notify_at(3, "late night alert").await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(n.queued_len(), 1);
    }

    #[tokio::test]
    async fn drops_during_quiet_hours_with_drop_policy() {
        let (n, count, _) = notifier(QuietHoursPolicy::Drop, 6);
        n.notify_at(3, "gone").await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(n.queued_len(), 0);
    }

    #[tokio::test]
    async fn queue_drains_at_active_edge() {
        let (n, count, delivered) = notifier(QuietHoursPolicy::Queue, 6);
        n.notify_at(3, "first").await;
        n.notify_at(4, "second").await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        n.drain_at(8).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(n.queued_len(), 0);
        assert_eq!(*delivered.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn drain_outside_active_hours_is_a_no_op() {
        let (n, count, _) = notifier(QuietHoursPolicy::Queue, 6);
        n.notify_at(3, "waiting").await;
        n.drain_at(5).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(n.queued_len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_caps_deliveries_per_hour() {
        let (n, count, _) = notifier(QuietHoursPolicy::Queue, 2);
        for i in 0..5 {
            n.notify_at(12, &format!("alert {i}")).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limited_drain_keeps_remainder_queued() {
        let (n, count, _) = notifier(QuietHoursPolicy::Queue, 2);
        for i in 0..4 {
            n.notify_at(3, &format!("queued {i}")).await;
        }
        // Queue capacity is 3, so the oldest was already dropped.
        assert_eq!(n.queued_len(), 3);
        n.drain_at(9).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(n.queued_len(), 1);
    }

    #[tokio::test]
    async fn bounded_queue_drops_oldest() {
        let (n, _, delivered) = notifier(QuietHoursPolicy::Queue, 10);
        for i in 0..5 {
            n.notify_at(3, &format!("msg {i}")).await;
        }
        assert_eq!(n.queued_len(), 3);
        n.drain_at(10).await;
        // msg 0 and msg 1 were evicted by the bound.
        assert_eq!(*delivered.lock().unwrap(), vec!["msg 2", "msg 3", "msg 4"]);
    }

    #[test]
    fn active_hours_wrap_midnight() {
        let config = SchedulerConfig {
            active_hours_start: 22,
            active_hours_end: 6,
            ..SchedulerConfig::default()
        };
        let n = Notifier::new(&config, Box::new(LogSink));
        assert!(n.in_active_hours(23));
        assert!(n.in_active_hours(2));
        assert!(!n.in_active_hours(12));
    }

    #[test]
    fn active_hours_normal_window() {
        let (n, _, _) = notifier(QuietHoursPolicy::Queue, 6);
        assert!(n.in_active_hours(8));
        assert!(n.in_active_hours(21));
        assert!(!n.in_active_hours(22));
        assert!(!n.in_active_hours(7));
    }
}
