//! Observability for the engine.
//!
//! The engine only records through the `metrics` facade; the embedding
//! application installs whatever recorder/exporter it uses. Tokens never
//! appear in logs or metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rtc_state_transitions_total` | Counter | `from`, `to` | Connection state machine activity |
//! | `rtc_reconnect_attempts_total` | Counter | `result` | Join and reconnect retries |
//! | `rtc_fallback_transitions_total` | Counter | `scope`, `direction` | Publish/subscribe fallback churn |
//! | `rtc_data_messages_total` | Counter | `direction`, `result` | Data stream traffic and rejections |
//! | `rtc_quality_samples_total` | Counter | `grade` | Distribution of uplink grades |
//! | `rtc_remote_peers` | Gauge | none | Current remote peers |
//! | `rtc_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `rtc_messages_dropped_total` | Counter | `actor_type` | Mailbox overflow |

pub mod metrics;

pub use metrics::{
    record_data_message, record_fallback_transition, record_message_dropped,
    record_quality_sample, record_reconnect_attempt, record_state_transition,
    set_actor_mailbox_depth, set_remote_peers,
};
