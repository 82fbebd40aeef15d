//! Mailbox depth monitoring for the engine's actors.
//!
//! | Actor Type | Normal | Warning   | Critical |
//! |------------|--------|-----------|----------|
//! | Engine     | < 64   | 64-192    | > 192    |
//! | Dispatcher | < 256  | 256-1024  | > 1024   |
//!
//! The engine mailbox is bounded, so its depth doubles as a measure of how
//! close callers are to being pushed back. The dispatcher queue is
//! unbounded; a critical depth there means the event sink is too slow.

use crate::observability::metrics::{record_message_dropped, set_actor_mailbox_depth};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

pub const ENGINE_MAILBOX_NORMAL: usize = 64;
pub const ENGINE_MAILBOX_WARNING: usize = 192;

pub const DISPATCHER_MAILBOX_NORMAL: usize = 256;
pub const DISPATCHER_MAILBOX_WARNING: usize = 1024;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// The scheduling actor owning all session state.
    Engine,
    /// The event delivery queue.
    Dispatcher,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Engine => "engine",
            ActorType::Dispatcher => "dispatcher",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Engine => ENGINE_MAILBOX_WARNING,
            ActorType::Dispatcher => DISPATCHER_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Engine => ENGINE_MAILBOX_NORMAL,
            ActorType::Dispatcher => DISPATCHER_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Shared between the sending side and the actor draining the mailbox.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType) -> Self {
        Self {
            actor_type,
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record a message entering the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);
        set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);

        match self.level_for_depth(new_depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "rtc.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    depth = new_depth,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if new_depth == self.actor_type.normal_threshold() + 1 => {
                debug!(
                    target: "rtc.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    depth = new_depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    /// Record a message taken out of the mailbox.
    pub fn record_dequeue(&self) {
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            })
            .unwrap_or(0);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        set_actor_mailbox_depth(self.actor_type.as_str(), previous.saturating_sub(1));
    }

    /// Record a message rejected because the mailbox was full.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "rtc.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}
