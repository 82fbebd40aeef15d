//! Real-time channel session and adaptive media delivery engine.
//!
//! The engine sits between an application and a network transport. It
//! provides:
//!
//! - A channel session state machine: join, automatic reconnect with
//!   backoff, leave, ban, token expiry and renewal
//! - Network quality grading of the uplink, each downlink, and an optional
//!   pre-call last-mile probe
//! - Adaptive stream control: publish and subscribe fallback to audio only,
//!   with hysteresis
//! - Rate-limited data streams with optional reliable, ordered delivery
//! - Speaker volume aggregation and active speaker detection
//!
//! Sockets and codecs stay outside: the engine drives a
//! [`transport::Transport`] and an [`transport::EncoderControl`] supplied at
//! creation, and reports to an [`events::EventSink`].
//!
//! # Architecture
//!
//! ```text
//! RtcEngine
//! └── EngineActor (owns all state, single task)
//!     ├── Session (peers, token, retry state)
//!     ├── QualityMonitor + QualityController
//!     ├── DataChannel + DataReceiver
//!     └── VolumeAggregator
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Engine actor, handle, and event delivery
//! - [`config`] - Engine configuration from environment or code
//! - [`errors`] - Error types with catalogue codes
//! - [`session`] - Channel session state
//! - [`quality`] - Quality grading and fallback control
//! - [`data_stream`] - Data stream send and receive sides
//! - [`volume`] - Volume aggregation

pub mod actors;
pub mod config;
pub mod data_stream;
pub mod errors;
pub mod events;
pub mod observability;
pub mod quality;
pub mod session;
pub mod transport;
pub mod volume;

pub use actors::{Collaborators, EngineHandle, EventPump, RtcEngine};
pub use config::{DeliveryMode, EngineConfig};
pub use errors::{return_code, EngineError, ErrorCode, WarningCode};
pub use events::{ChannelStats, EngineEvent, EventSink, JoinedChannel, NoopSink};
pub use quality::{FallbackPolicy, LinkQuality, NetworkQuality, VideoLayer};
pub use session::{ClientRole, ConnectionState, JoinRequest, OfflineReason};
