//! Event sink that records everything the engine emits.
//!
//! Tests await specific events with [`RecordingSink::wait_for`] rather than
//! sleeping. Under a paused tokio clock the wait auto-advances time, so a
//! test waiting for `connection_lost` simply lets the engine's timers run.

use rtc_engine::events::{EngineEvent, EventSink};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Upper bound on any single wait, in (possibly virtual) time.
const WAIT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
    notify: Notify,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event recorded so far, in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.lock().clone()
    }

    /// Names of every event recorded so far, in delivery order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.lock().iter().map(EngineEvent::name).collect()
    }

    /// Recorded events with `name`.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<EngineEvent> {
        self.lock()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Wait for the first recorded event named `name`.
    ///
    /// # Panics
    ///
    /// If no such event arrives within two minutes.
    pub async fn wait_for(&self, name: &str) -> EngineEvent {
        self.wait_for_nth(name, 1).await
    }

    /// Wait until `n` events named `name` are recorded; returns the nth.
    ///
    /// # Panics
    ///
    /// If they do not arrive within two minutes.
    pub async fn wait_for_nth(&self, name: &str, n: usize) -> EngineEvent {
        let found = self
            .wait_until(|events| {
                events
                    .iter()
                    .filter(|e| e.name() == name)
                    .nth(n.saturating_sub(1))
                    .cloned()
            })
            .await;
        found.unwrap_or_else(|| panic!("timed out waiting for event #{n} '{name}'"))
    }

    /// Wait until `check` finds something in the recorded events.
    pub async fn wait_until<T>(
        &self,
        check: impl Fn(&[EngineEvent]) -> Option<T>,
    ) -> Option<T> {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if let Some(found) = check(&self.lock()) {
                    return found;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EngineEvent>> {
        self.events.lock().expect("recording sink lock poisoned")
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: EngineEvent) {
        self.lock().push(event);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for_sees_past_and_future_events() {
        let sink = Arc::new(RecordingSink::new());
        sink.on_event(EngineEvent::ConnectionInterrupted);
        sink.wait_for("connection_interrupted").await;

        let producer = Arc::clone(&sink);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            producer.on_event(EngineEvent::ConnectionLost);
        });
        sink.wait_for("connection_lost").await;
        assert_eq!(
            sink.names(),
            vec!["connection_interrupted", "connection_lost"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_times_out() {
        let sink = RecordingSink::new();
        let found = sink
            .wait_until(|events| events.first().map(EngineEvent::name))
            .await;
        assert!(found.is_none());
    }
}
