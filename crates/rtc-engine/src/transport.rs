//! Downstream collaborators: the network transport and the video encoder.
//!
//! The engine never touches sockets or codecs. It drives a [`Transport`]
//! for signaling and media routing decisions, and an [`EncoderControl`] for
//! what the local encoder produces. Asynchronous signals from the network
//! arrive as [`TransportEvent`]s on a channel handed to the engine at
//! creation.

use crate::errors::ErrorCode;
use crate::quality::SubscribeLevel;
use crate::session::{ClientRole, OfflineReason};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::secret::SecretString;
use common::types::{DataStreamId, Uid};
use std::collections::HashMap;
use thiserror::Error;

/// Parameters of a connect or reconnect attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub channel: String,
    /// `Uid::LOCAL` asks the server to assign one.
    pub uid: Uid,
    pub token: Option<SecretString>,
    pub info: Option<String>,
    pub role: ClientRole,
}

/// A remote member as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub uid: Uid,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub video_enabled: bool,
    /// The peer publishes a low-resolution layer next to the high one.
    pub dual_stream: bool,
}

impl PeerSnapshot {
    /// A peer publishing both media kinds, single stream.
    #[must_use]
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            audio_muted: false,
            video_muted: false,
            video_enabled: true,
            dual_stream: false,
        }
    }

    #[must_use]
    pub fn with_dual_stream(mut self) -> Self {
        self.dual_stream = true;
        self
    }
}

/// Server acknowledgment of a successful connect or reconnect.
#[derive(Debug, Clone)]
pub struct JoinAck {
    /// Resolved local uid (server-assigned if the request carried 0).
    pub uid: Uid,
    /// Expiry of the token the session was admitted with, if it expires.
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Current channel membership, excluding the local user.
    pub peers: Vec<PeerSnapshot>,
}

/// Cumulative counters for one direction of one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionCounters {
    /// Packets sent (uplink) or received (downlink).
    pub packets: u64,
    pub packets_lost: u64,
    pub bytes: u64,
    /// Current round-trip estimate.
    pub rtt_ms: u32,
    /// Current jitter estimate.
    pub jitter_ms: u32,
}

/// Snapshot of all transport counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportCounters {
    pub uplink: DirectionCounters,
    pub downlink: HashMap<Uid, DirectionCounters>,
}

/// One outbound data stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundData {
    pub stream_id: DataStreamId,
    pub sequence: u32,
    pub reliable: bool,
    pub ordered: bool,
    pub payload: Bytes,
}

/// One inbound data stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundData {
    pub uid: Uid,
    pub stream_id: DataStreamId,
    pub sequence: u32,
    pub reliable: bool,
    pub ordered: bool,
    pub payload: Bytes,
}

/// Why the server refused a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidToken,
    TokenExpired,
    UidConflict,
    InvalidChannel,
    NotAuthorized,
}

impl RejectReason {
    /// Catalogue code reported to the caller for this rejection.
    #[must_use]
    pub fn error_code(self) -> ErrorCode {
        match self {
            RejectReason::InvalidToken => ErrorCode::InvalidToken,
            RejectReason::TokenExpired => ErrorCode::TokenExpired,
            RejectReason::UidConflict => ErrorCode::AlreadyInUse,
            RejectReason::InvalidChannel => ErrorCode::InvalidChannelId,
            RejectReason::NotAuthorized => ErrorCode::NoPermission,
        }
    }

    /// Whether a fresh token can resolve the rejection.
    #[must_use]
    pub fn is_token_problem(self) -> bool {
        matches!(self, RejectReason::InvalidToken | RejectReason::TokenExpired)
    }
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transport timed out")]
    Timeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("Rejected by server: {0:?}")]
    Rejected(RejectReason),

    #[error("Banned by server")]
    Banned,
}

impl TransportError {
    /// Whether retrying the same request can succeed without caller action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout | TransportError::ConnectionLost | TransportError::Bind(_)
        )
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            TransportError::Timeout => "timeout",
            TransportError::ConnectionLost => "connection_lost",
            TransportError::Bind(_) => "bind",
            TransportError::Rejected(_) => "rejected",
            TransportError::Banned => "banned",
        }
    }
}

/// Signals pushed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connectivity to the server dropped.
    ConnectionLost,
    /// The server banned this user from the channel.
    Banned,
    /// The server reports the session token expired.
    TokenExpired,
    PeerJoined(PeerSnapshot),
    PeerLeft { uid: Uid, reason: OfflineReason },
    /// Any media or signaling from a peer; refreshes its liveness.
    PeerActivity { uid: Uid },
    PeerAudioMuted { uid: Uid, muted: bool },
    PeerVideoMuted { uid: Uid, muted: bool },
    PeerVideoEnabled { uid: Uid, enabled: bool },
    PeerDualStream { uid: Uid, enabled: bool },
    DataMessage(InboundData),
    /// The remote side acknowledged a reliable message.
    DataAck { stream_id: DataStreamId, sequence: u32 },
}

/// Network transport driven by the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to the channel.
    async fn connect(&self, params: ConnectParams) -> Result<JoinAck, TransportError>;

    /// Re-establish a dropped connection to the same channel.
    async fn reconnect(&self, params: ConnectParams) -> Result<JoinAck, TransportError>;

    /// Leave the channel and release the connection.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Present a fresh token. Returns the new expiry.
    async fn renew_token(
        &self,
        token: SecretString,
    ) -> Result<Option<DateTime<Utc>>, TransportError>;

    async fn set_client_role(&self, role: ClientRole) -> Result<(), TransportError>;

    /// Whether local audio and video are sent to the channel.
    async fn set_local_publish(
        &self,
        publish_audio: bool,
        publish_video: bool,
    ) -> Result<(), TransportError>;

    /// Which layer of a remote peer's video to receive, or none.
    async fn set_remote_video(&self, uid: Uid, level: SubscribeLevel)
        -> Result<(), TransportError>;

    async fn send_data(&self, message: OutboundData) -> Result<(), TransportError>;

    /// Current cumulative counters of the active connection.
    fn counters(&self) -> TransportCounters;

    /// Counters of the last-mile probe, when the transport runs one.
    fn probe_counters(&self) -> Option<DirectionCounters>;
}

/// Local video encoder control.
pub trait EncoderControl: Send + Sync {
    /// Start or stop publishing local video (audio is unaffected).
    fn set_video_publishing(&self, enabled: bool);

    /// Produce a low-resolution layer alongside the high one.
    fn set_dual_stream(&self, enabled: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::ConnectionLost.is_retryable());
        assert!(TransportError::Bind("port".to_string()).is_retryable());
        assert!(!TransportError::Rejected(RejectReason::InvalidToken).is_retryable());
        assert!(!TransportError::Banned.is_retryable());
    }

    #[test]
    fn test_reject_reason_codes() {
        assert_eq!(RejectReason::InvalidToken.error_code().value(), 110);
        assert_eq!(RejectReason::TokenExpired.error_code().value(), 109);
        assert_eq!(RejectReason::InvalidChannel.error_code().value(), 102);
        assert!(RejectReason::TokenExpired.is_token_problem());
        assert!(!RejectReason::UidConflict.is_token_problem());
    }

    #[test]
    fn test_peer_snapshot_builder() {
        let peer = PeerSnapshot::new(Uid(7)).with_dual_stream();
        assert_eq!(peer.uid, Uid(7));
        assert!(peer.dual_stream);
        assert!(peer.video_enabled);
        assert!(!peer.audio_muted);
    }
}
