//! Actor implementation of the engine.
//!
//! ```text
//! EngineHandle (cloned freely by the caller)
//!   │  bounded mailbox
//!   ▼
//! EngineActor (one per RtcEngine, owns all session state)
//!   │  unbounded event queue
//!   ▼
//! Dispatcher ──► EventPump ──► EventSink
//!                (dedicated task, or drained by the caller)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single owner**: one actor mutates session state; callers never lock
//! - **Ordered requests**: operations apply strictly in submission order
//! - **Generation fencing**: in-flight transport round trips are tagged and
//!   ignored once leave, ban, or a new attempt supersedes them
//! - **Mailbox monitoring**: depth thresholds with metrics (Engine: 64/192,
//!   Dispatcher: 256/1024)
//!
//! # Modules
//!
//! - [`engine`] - `RtcEngine`, its handle, and the engine actor
//! - [`dispatcher`] - Event queue and delivery modes
//! - [`messages`] - Mailbox message types
//! - [`metrics`] - Mailbox monitoring

pub mod dispatcher;
pub mod engine;
pub mod messages;
pub mod metrics;

pub use dispatcher::{Dispatcher, EventPump};
pub use engine::{Collaborators, EngineHandle, RtcEngine};
pub use messages::EngineMessage;
pub use metrics::{ActorType, MailboxLevel, MailboxMonitor};
