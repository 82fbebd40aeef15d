//! # RTC Test Utilities
//!
//! Shared test utilities for the real-time channel engine.
//!
//! This crate provides mock collaborators and fixtures for exercising the
//! engine without a network:
//!
//! - `mock_transport` - Scriptable [`rtc_engine::transport::Transport`]
//! - `mock_encoder` - Recording [`rtc_engine::transport::EncoderControl`]
//! - `recording_sink` - Event sink that records and awaits events
//! - `fixtures` - A wired-up engine and common test data
//! - `logging` - `RUST_LOG`-driven tracing output for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rtc_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let t = TestEngine::builder()
//!         .transport(MockTransport::builder().assign_uid(42))
//!         .start();
//!
//!     let joined = t.join("room1").await;
//!     assert_eq!(joined.uid, Uid(42));
//! }
//! ```

pub mod fixtures;
pub mod logging;
pub mod mock_encoder;
pub mod mock_transport;
pub mod recording_sink;

pub use fixtures::*;
pub use logging::init_tracing;
pub use mock_encoder::*;
pub use mock_transport::*;
pub use recording_sink::*;
