//! Sliding-window send budget shared by all data streams of a session.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Which limit a rejected send hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExceeded {
    Messages,
    Bytes,
}

/// At most `max_messages` messages and `max_bytes` bytes in any `window`.
#[derive(Debug)]
pub struct SendBudget {
    window: Duration,
    max_messages: usize,
    max_bytes: usize,
    sent: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl SendBudget {
    #[must_use]
    pub fn new(window: Duration, max_messages: usize, max_bytes: usize) -> Self {
        Self {
            window,
            max_messages,
            max_bytes,
            sent: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    /// Per-second budget.
    #[must_use]
    pub fn per_second(max_messages: usize, max_bytes: usize) -> Self {
        Self::new(Duration::from_secs(1), max_messages, max_bytes)
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, size)) = self.sent.front().copied() {
            if now.duration_since(at) < self.window {
                break;
            }
            self.sent.pop_front();
            self.bytes_in_window -= size;
        }
    }

    /// Charge one message of `size` bytes, or reject it without charging.
    ///
    /// # Errors
    ///
    /// Returns which limit would be exceeded.
    pub fn try_consume(&mut self, size: usize, now: Instant) -> Result<(), BudgetExceeded> {
        self.evict(now);

        if self.sent.len() >= self.max_messages {
            return Err(BudgetExceeded::Messages);
        }
        if self.bytes_in_window + size > self.max_bytes {
            return Err(BudgetExceeded::Bytes);
        }

        self.sent.push_back((now, size));
        self.bytes_in_window += size;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.sent.clear();
        self.bytes_in_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_message_limit_within_window() {
        let mut budget = SendBudget::per_second(30, 6144);
        let now = Instant::now();

        for _ in 0..30 {
            assert_eq!(budget.try_consume(1, now), Ok(()));
        }
        assert_eq!(budget.try_consume(1, now), Err(BudgetExceeded::Messages));
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_limit_within_window() {
        let mut budget = SendBudget::per_second(30, 6144);
        let now = Instant::now();

        for _ in 0..6 {
            assert_eq!(budget.try_consume(1024, now), Ok(()));
        }
        assert_eq!(budget.try_consume(1, now), Err(BudgetExceeded::Bytes));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let mut budget = SendBudget::per_second(2, 6144);

        assert!(budget.try_consume(1, Instant::now()).is_ok());
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(budget.try_consume(1, Instant::now()).is_ok());
        assert!(budget.try_consume(1, Instant::now()).is_err());

        // The first message ages out; the second is still inside the window.
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(budget.try_consume(1, Instant::now()).is_ok());
        assert!(budget.try_consume(1, Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_send_is_not_charged() {
        let mut budget = SendBudget::per_second(30, 100);
        let now = Instant::now();

        assert!(budget.try_consume(90, now).is_ok());
        assert_eq!(budget.try_consume(20, now), Err(BudgetExceeded::Bytes));
        assert!(budget.try_consume(10, now).is_ok());
    }
}
