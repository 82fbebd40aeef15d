//! Pre-configured engine fixtures.
//!
//! Provides:
//! - [`TestEngine`]: an engine wired to a [`MockTransport`], a
//!   [`MockEncoder`], and a [`RecordingSink`]
//! - Counter helpers for simulating link conditions

use crate::logging::init_tracing;
use crate::mock_encoder::MockEncoder;
use crate::mock_transport::{MockTransport, MockTransportBuilder};
use crate::recording_sink::RecordingSink;
use common::types::Uid;
use rtc_engine::actors::{Collaborators, EngineHandle, RtcEngine};
use rtc_engine::config::{DeliveryMode, EngineConfig};
use rtc_engine::events::{EngineEvent, JoinedChannel};
use rtc_engine::session::JoinRequest;
use rtc_engine::transport::DirectionCounters;
use std::sync::Arc;

/// An engine with mock collaborators.
pub struct TestEngine {
    pub engine: RtcEngine,
    pub handle: EngineHandle,
    pub transport: Arc<MockTransport>,
    pub encoder: Arc<MockEncoder>,
    pub sink: Arc<RecordingSink>,
}

impl TestEngine {
    /// Create a new TestEngine builder.
    #[must_use]
    pub fn builder() -> TestEngineBuilder {
        TestEngineBuilder::default()
    }

    /// An engine with default configuration and transport.
    #[must_use]
    pub fn start() -> Self {
        Self::builder().start()
    }

    /// Join `channel` with an automatically assigned uid and wait for success.
    ///
    /// # Panics
    ///
    /// If the join is refused or never succeeds.
    pub async fn join(&self, channel: &str) -> JoinedChannel {
        self.join_with(JoinRequest::new(channel)).await
    }

    /// Join with a custom request and wait for success.
    ///
    /// # Panics
    ///
    /// If the join is refused or never succeeds.
    pub async fn join_with(&self, request: JoinRequest) -> JoinedChannel {
        let previous = self.sink.count("joined");
        self.handle.join(request).await.expect("join refused");
        match self.sink.wait_for_nth("joined", previous + 1).await {
            EngineEvent::Joined(joined) => joined,
            other => panic!("unexpected event {other:?}"),
        }
    }

    /// Leave and wait for `Left`.
    ///
    /// # Panics
    ///
    /// If the leave is refused or never completes.
    pub async fn leave(&self) {
        let previous = self.sink.count("left");
        self.handle.leave().await.expect("leave refused");
        self.sink.wait_for_nth("left", previous + 1).await;
    }

    /// Destroy the engine and wait for its tasks.
    pub async fn shutdown(self) {
        self.engine.destroy().await;
    }
}

/// Builder for TestEngine configuration.
#[derive(Debug, Default)]
pub struct TestEngineBuilder {
    config: Option<EngineConfig>,
    transport: Option<MockTransportBuilder>,
    pump: bool,
}

impl TestEngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: MockTransportBuilder) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Deliver events through a caller-drained pump instead of a task.
    #[must_use]
    pub fn caller_pump(mut self) -> Self {
        self.pump = true;
        self
    }

    /// Create the engine. Must run inside a tokio runtime.
    ///
    /// # Panics
    ///
    /// If the configuration is invalid.
    #[must_use]
    pub fn start(self) -> TestEngine {
        init_tracing();
        let mut config = self.config.unwrap_or_default();
        if self.pump {
            config.delivery_mode = DeliveryMode::CallerPump;
        }
        let (transport, transport_events) = self.transport.unwrap_or_default().build();
        let encoder = Arc::new(MockEncoder::new());
        let sink = Arc::new(RecordingSink::new());

        let engine = RtcEngine::create(
            config,
            Collaborators {
                transport: Arc::clone(&transport) as _,
                transport_events,
                encoder: Arc::clone(&encoder) as _,
            },
            Arc::clone(&sink) as _,
        )
        .expect("valid test configuration");
        let handle = engine.handle();

        TestEngine {
            engine,
            handle,
            transport,
            encoder,
            sink,
        }
    }
}

/// Cumulative counters of a link that has carried `packets` packets with
/// `lost` of them lost, at the given delay figures.
#[must_use]
pub fn link(packets: u64, lost: u64, rtt_ms: u32, jitter_ms: u32) -> DirectionCounters {
    DirectionCounters {
        packets,
        packets_lost: lost,
        bytes: packets * 1_000,
        rtt_ms,
        jitter_ms,
    }
}

/// Cumulative counters of a clean link.
#[must_use]
pub fn clean_link(packets: u64) -> DirectionCounters {
    link(packets, 0, 20, 5)
}

/// A block of PCM at a constant amplitude.
#[must_use]
pub fn pcm(amplitude: i16, samples: usize) -> Vec<i16> {
    vec![amplitude; samples]
}

/// Shorthand for uids in tests.
#[must_use]
pub const fn uid(value: u32) -> Uid {
    Uid(value)
}
