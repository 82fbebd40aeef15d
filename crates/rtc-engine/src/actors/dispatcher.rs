//! Event delivery.
//!
//! The engine actor never calls the caller's [`EventSink`] directly; it
//! queues events on the dispatcher so a slow sink cannot stall session
//! work. Two delivery modes exist:
//!
//! - [`DeliveryMode::Dedicated`]: a spawned task drains the queue into the sink.
//! - [`DeliveryMode::CallerPump`]: the caller owns an [`EventPump`] and
//!   drains it from whatever thread it wants callbacks on.
//!
//! Completions requested through a one-shot are resolved here too, so the
//! rule that a result goes to exactly one of {one-shot, sink} lives in one
//! place.

use super::metrics::{ActorType, MailboxMonitor};
use crate::config::DeliveryMode;
use crate::events::{EngineEvent, EventSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

/// Sending side of the event queue, owned by the engine actor.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<EngineEvent>,
    monitor: Arc<MailboxMonitor>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queued", &self.monitor.current_depth())
            .finish_non_exhaustive()
    }
}

/// How queued events reach the sink.
pub enum DeliveryDriver {
    Task(JoinHandle<()>),
    Pump(EventPump),
}

impl Dispatcher {
    /// Create the queue and its delivery side.
    pub fn start(mode: DeliveryMode, sink: Arc<dyn EventSink>) -> (Self, DeliveryDriver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let monitor = Arc::new(MailboxMonitor::new(ActorType::Dispatcher));
        let pump = EventPump {
            receiver,
            sink,
            monitor: Arc::clone(&monitor),
        };

        let driver = match mode {
            DeliveryMode::Dedicated => DeliveryDriver::Task(tokio::spawn(pump.run())),
            DeliveryMode::CallerPump => DeliveryDriver::Pump(pump),
        };
        debug!(target: "rtc.dispatch", mode = ?mode, "Event dispatcher started");

        (
            Self {
                sender,
                monitor,
                closed: Arc::new(AtomicBool::new(false)),
            },
            driver,
        )
    }

    /// Queue an event for the sink.
    pub fn emit(&self, event: EngineEvent) {
        if self.closed.load(Ordering::Acquire) {
            trace!(target: "rtc.dispatch", event = event.name(), "Dispatcher closed, discarding event");
            return;
        }
        trace!(target: "rtc.dispatch", event = event.name(), "Queueing event");
        self.monitor.record_enqueue();
        if self.sender.send(event).is_err() {
            // The pump was dropped by the caller; nobody is listening.
            self.monitor.record_dequeue();
            self.monitor.record_drop();
        }
    }

    /// Resolve an operation whose result goes to exactly one place: the
    /// one-shot if the caller supplied one and still listens, the sink
    /// otherwise.
    pub fn complete<T>(
        &self,
        completion: Option<oneshot::Sender<T>>,
        value: T,
        as_event: impl FnOnce(T) -> EngineEvent,
    ) {
        let value = match completion {
            Some(tx) => match tx.send(value) {
                Ok(()) => return,
                Err(value) => {
                    debug!(
                        target: "rtc.dispatch",
                        "Completion receiver dropped, delivering to sink"
                    );
                    value
                }
            },
            None => value,
        };
        self.emit(as_event(value));
    }

    /// Stop accepting events. Anything already queued is still delivered.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(target: "rtc.dispatch", queued = self.pending(), "Event dispatcher closed");
        }
    }

    /// Events queued but not yet delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.monitor.current_depth()
    }
}

/// Receiving side of the event queue.
pub struct EventPump {
    receiver: mpsc::UnboundedReceiver<EngineEvent>,
    sink: Arc<dyn EventSink>,
    monitor: Arc<MailboxMonitor>,
}

impl EventPump {
    /// Deliver every event queued so far. Returns how many were delivered.
    pub fn drain(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.receiver.try_recv() {
            self.deliver(event);
            delivered += 1;
        }
        delivered
    }

    /// Deliver events until the engine shuts down.
    #[instrument(skip_all, name = "rtc.dispatch")]
    pub async fn run(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.deliver(event);
        }
        debug!(
            target: "rtc.dispatch",
            delivered = self.monitor.messages_processed(),
            "Event queue closed"
        );
    }

    fn deliver(&self, event: EngineEvent) {
        self.monitor.record_dequeue();
        self.sink.on_event(event);
    }
}
