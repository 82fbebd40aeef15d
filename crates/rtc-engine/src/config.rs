//! Engine configuration.
//!
//! Configuration is loaded from `RTC_*` environment variables. Every value
//! has a default, so an empty environment yields [`EngineConfig::default`].
//! Values that are present but unparsable are rejected rather than silently
//! replaced by the default.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default quality sampling cadence in milliseconds.
pub const DEFAULT_QUALITY_INTERVAL_MS: u64 = 2_000;

/// Default number of consecutive samples required for a fallback transition.
pub const DEFAULT_FALLBACK_DEBOUNCE_SAMPLES: u32 = 2;

/// Default silence after which a remote peer is considered offline.
pub const DEFAULT_PEER_LIVENESS_TIMEOUT_SECS: u64 = 15;

/// Default time spent reconnecting before "connection lost" is reported.
pub const DEFAULT_CONNECTION_LOST_WINDOW_SECS: u64 = 10;

/// Default first reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_INITIAL_BACKOFF_MS: u64 = 500;

/// Default reconnect delay ceiling in milliseconds.
pub const DEFAULT_RECONNECT_MAX_BACKOFF_MS: u64 = 4_000;

/// Default lead time of the "token will expire" warning.
pub const DEFAULT_TOKEN_EXPIRY_WARNING_SECS: u64 = 30;

/// Default cadence of liveness, token, and timeout checks in milliseconds.
pub const DEFAULT_HOUSEKEEPING_INTERVAL_MS: u64 = 1_000;

/// Default maximum number of concurrently open data streams.
pub const DEFAULT_MAX_DATA_STREAMS: usize = 5;

/// Default maximum payload of one data stream message.
pub const DEFAULT_MAX_DATA_MESSAGE_BYTES: usize = 1_024;

/// Default data message budget per one-second window.
pub const DEFAULT_DATA_MESSAGES_PER_SECOND: usize = 30;

/// Default data byte budget per one-second window.
pub const DEFAULT_DATA_BYTES_PER_SECOND: usize = 6 * 1_024;

/// Default reliable delivery deadline.
pub const DEFAULT_RELIABLE_DELIVERY_TIMEOUT_SECS: u64 = 5;

/// Default per-peer cache of messages received after the sender went offline.
pub const DEFAULT_DATA_CACHE_CAPACITY: usize = 32;

/// Where engine events are delivered to the caller's sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// A dedicated delivery task invokes the sink.
    #[default]
    Dedicated,
    /// Events queue up until the caller drains them from its own thread
    /// through an `EventPump`.
    CallerPump,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dedicated" => Ok(DeliveryMode::Dedicated),
            "pump" | "caller" | "main" => Ok(DeliveryMode::CallerPump),
            other => Err(format!("unknown delivery mode '{other}'")),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Quality sampling and stats cadence (default: 2s).
    pub quality_interval: Duration,

    /// Consecutive qualifying samples before a fallback transition (default: 2).
    pub fallback_debounce_samples: u32,

    /// Silence before a remote peer is dropped (default: 15s).
    pub peer_liveness_timeout: Duration,

    /// Reconnect duration before "connection lost" is reported (default: 10s).
    pub connection_lost_window: Duration,

    pub reconnect_initial_backoff: Duration,

    pub reconnect_max_backoff: Duration,

    /// Lead time of the "token will expire" warning (default: 30s).
    pub token_expiry_warning: Duration,

    /// Cadence of liveness, token, and timeout checks (default: 1s).
    pub housekeeping_interval: Duration,

    pub max_data_streams: usize,

    pub max_data_message_bytes: usize,

    pub data_messages_per_second: usize,

    pub data_bytes_per_second: usize,

    /// Reliable messages not acknowledged within this window are reported
    /// as undelivered; receive-side gaps older than it are skipped.
    pub reliable_delivery_timeout: Duration,

    /// Messages cached per offline sender before older ones are dropped.
    pub data_cache_capacity: usize,

    pub delivery_mode: DeliveryMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quality_interval: Duration::from_millis(DEFAULT_QUALITY_INTERVAL_MS),
            fallback_debounce_samples: DEFAULT_FALLBACK_DEBOUNCE_SAMPLES,
            peer_liveness_timeout: Duration::from_secs(DEFAULT_PEER_LIVENESS_TIMEOUT_SECS),
            connection_lost_window: Duration::from_secs(DEFAULT_CONNECTION_LOST_WINDOW_SECS),
            reconnect_initial_backoff: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_BACKOFF_MS),
            reconnect_max_backoff: Duration::from_millis(DEFAULT_RECONNECT_MAX_BACKOFF_MS),
            token_expiry_warning: Duration::from_secs(DEFAULT_TOKEN_EXPIRY_WARNING_SECS),
            housekeeping_interval: Duration::from_millis(DEFAULT_HOUSEKEEPING_INTERVAL_MS),
            max_data_streams: DEFAULT_MAX_DATA_STREAMS,
            max_data_message_bytes: DEFAULT_MAX_DATA_MESSAGE_BYTES,
            data_messages_per_second: DEFAULT_DATA_MESSAGES_PER_SECOND,
            data_bytes_per_second: DEFAULT_DATA_BYTES_PER_SECOND,
            reliable_delivery_timeout: Duration::from_secs(DEFAULT_RELIABLE_DELIVERY_TIMEOUT_SECS),
            data_cache_capacity: DEFAULT_DATA_CACHE_CAPACITY,
            delivery_mode: DeliveryMode::default(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set to a value
    /// that cannot be parsed or violates a constraint.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load configuration from a map of variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` on unparsable or out-of-range values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let config = Self {
            quality_interval: millis(vars, "RTC_QUALITY_INTERVAL_MS", DEFAULT_QUALITY_INTERVAL_MS)?,
            fallback_debounce_samples: parse(
                vars,
                "RTC_FALLBACK_DEBOUNCE_SAMPLES",
                DEFAULT_FALLBACK_DEBOUNCE_SAMPLES,
            )?,
            peer_liveness_timeout: secs(
                vars,
                "RTC_PEER_LIVENESS_TIMEOUT_SECS",
                DEFAULT_PEER_LIVENESS_TIMEOUT_SECS,
            )?,
            connection_lost_window: secs(
                vars,
                "RTC_CONNECTION_LOST_WINDOW_SECS",
                DEFAULT_CONNECTION_LOST_WINDOW_SECS,
            )?,
            reconnect_initial_backoff: millis(
                vars,
                "RTC_RECONNECT_INITIAL_BACKOFF_MS",
                DEFAULT_RECONNECT_INITIAL_BACKOFF_MS,
            )?,
            reconnect_max_backoff: millis(
                vars,
                "RTC_RECONNECT_MAX_BACKOFF_MS",
                DEFAULT_RECONNECT_MAX_BACKOFF_MS,
            )?,
            token_expiry_warning: secs(
                vars,
                "RTC_TOKEN_EXPIRY_WARNING_SECS",
                DEFAULT_TOKEN_EXPIRY_WARNING_SECS,
            )?,
            housekeeping_interval: millis(
                vars,
                "RTC_HOUSEKEEPING_INTERVAL_MS",
                DEFAULT_HOUSEKEEPING_INTERVAL_MS,
            )?,
            max_data_streams: parse(vars, "RTC_MAX_DATA_STREAMS", DEFAULT_MAX_DATA_STREAMS)?,
            max_data_message_bytes: parse(
                vars,
                "RTC_MAX_DATA_MESSAGE_BYTES",
                DEFAULT_MAX_DATA_MESSAGE_BYTES,
            )?,
            data_messages_per_second: parse(
                vars,
                "RTC_DATA_MESSAGES_PER_SECOND",
                DEFAULT_DATA_MESSAGES_PER_SECOND,
            )?,
            data_bytes_per_second: parse(
                vars,
                "RTC_DATA_BYTES_PER_SECOND",
                DEFAULT_DATA_BYTES_PER_SECOND,
            )?,
            reliable_delivery_timeout: secs(
                vars,
                "RTC_RELIABLE_DELIVERY_TIMEOUT_SECS",
                DEFAULT_RELIABLE_DELIVERY_TIMEOUT_SECS,
            )?,
            data_cache_capacity: parse(
                vars,
                "RTC_DATA_CACHE_CAPACITY",
                DEFAULT_DATA_CACHE_CAPACITY,
            )?,
            delivery_mode: parse(vars, "RTC_EVENT_DELIVERY", DeliveryMode::default())?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants between fields.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("RTC_QUALITY_INTERVAL_MS", self.quality_interval.is_zero()),
            ("RTC_HOUSEKEEPING_INTERVAL_MS", self.housekeeping_interval.is_zero()),
            (
                "RTC_RECONNECT_INITIAL_BACKOFF_MS",
                self.reconnect_initial_backoff.is_zero(),
            ),
            (
                "RTC_FALLBACK_DEBOUNCE_SAMPLES",
                self.fallback_debounce_samples == 0,
            ),
            ("RTC_MAX_DATA_STREAMS", self.max_data_streams == 0),
        ];
        if let Some((var, _)) = positive.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::InvalidValue {
                var: (*var).to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.reconnect_max_backoff < self.reconnect_initial_backoff {
            return Err(ConfigError::InvalidValue {
                var: "RTC_RECONNECT_MAX_BACKOFF_MS".to_string(),
                reason: "must not be below the initial backoff".to_string(),
            });
        }

        Ok(())
    }
}

fn parse<T>(vars: &HashMap<String, String>, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn millis(vars: &HashMap<String, String>, var: &str, default: u64) -> Result<Duration, ConfigError> {
    parse(vars, var, default).map(Duration::from_millis)
}

fn secs(vars: &HashMap<String, String>, var: &str, default: u64) -> Result<Duration, ConfigError> {
    parse(vars, var, default).map(Duration::from_secs)
}
