//! Retry bookkeeping for join and reconnect attempts.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Exponential backoff: `initial`, doubling, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// State of an unfinished connect sequence.
#[derive(Debug)]
pub struct RetryState {
    pub started_at: Instant,
    pub attempts: u32,
    pub lost_reported: bool,
    /// Retries are paused until the caller renews the token.
    pub awaiting_token: bool,
    backoff: Backoff,
    task: Option<JoinHandle<()>>,
}

impl RetryState {
    #[must_use]
    pub fn new(now: Instant, initial: Duration, max: Duration) -> Self {
        Self {
            started_at: now,
            attempts: 0,
            lost_reported: false,
            awaiting_token: false,
            backoff: Backoff::new(initial, max),
            task: None,
        }
    }

    /// Delay before the next attempt; the first attempt goes out immediately.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        if self.attempts == 1 {
            Duration::ZERO
        } else {
            self.backoff.next_delay()
        }
    }

    /// Make the next attempt go out immediately and lift a token pause.
    pub fn resume_now(&mut self) {
        self.awaiting_token = false;
        self.attempts = 0;
    }

    /// Track the task running the current attempt, aborting any previous one.
    pub fn track(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.task.replace(task) {
            previous.abort();
        }
    }

    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// True once, when the sequence has run for `window` without success.
    pub fn lost_window_elapsed(&mut self, now: Instant, window: Duration) -> bool {
        if self.lost_reported || now.duration_since(self.started_at) < window {
            return false;
        }
        self.lost_reported = true;
        true
    }
}

impl Drop for RetryState {
    fn drop(&mut self) {
        self.abort();
    }
}
