//! Notifications delivered to the embedding application.

use crate::errors::{ErrorCode, WarningCode};
use crate::quality::{NetworkQuality, VideoLayer};
use crate::session::{ClientRole, OfflineReason};
use crate::volume::SpeakerVolume;
use bytes::Bytes;
use common::secret::SecretString;
use common::types::{DataStreamId, Uid};
use serde::Serialize;
use std::time::Duration;

/// Join or rejoin success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinedChannel {
    pub channel: String,
    pub uid: Uid,
    /// Since the join request, or since reconnection began for a rejoin.
    pub elapsed: Duration,
}

/// Accumulated call statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub duration: Duration,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    /// Participants including the local user.
    pub user_count: usize,
}

/// Every notification the engine emits.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Warning(WarningCode),
    Error(ErrorCode),
    Joined(JoinedChannel),
    Rejoined(JoinedChannel),
    Left(ChannelStats),
    RoleChanged {
        old: ClientRole,
        new: ClientRole,
    },
    PeerJoined {
        uid: Uid,
        /// Since the local join request.
        elapsed: Duration,
    },
    PeerLeft {
        uid: Uid,
        reason: OfflineReason,
    },
    PeerAudioMuted {
        uid: Uid,
        muted: bool,
    },
    PeerVideoMuted {
        uid: Uid,
        muted: bool,
    },
    PeerVideoEnabled {
        uid: Uid,
        enabled: bool,
    },
    ConnectionInterrupted,
    ConnectionLost,
    ConnectionBanned,
    TokenWillExpire(SecretString),
    TokenExpired,
    /// `uid` 0 is the local user: `tx` is the uplink grade, `rx` the worst
    /// downlink grade.
    QualityReport {
        uid: Uid,
        tx: NetworkQuality,
        rx: NetworkQuality,
    },
    LastmileQuality(NetworkQuality),
    RtcStats(ChannelStats),
    VolumeReport {
        speakers: Vec<SpeakerVolume>,
        total: u8,
    },
    ActiveSpeaker(Uid),
    PublishFallback {
        is_fallback: bool,
    },
    SubscribeFallback {
        uid: Uid,
        is_fallback: bool,
    },
    RemoteVideoLayerChanged {
        uid: Uid,
        layer: VideoLayer,
    },
    DataMessage {
        uid: Uid,
        stream_id: DataStreamId,
        payload: Bytes,
    },
    DataMessageError {
        uid: Uid,
        stream_id: DataStreamId,
        error: ErrorCode,
        missed: u32,
        cached: u32,
    },
    DataMessageDeliveryFailed {
        stream_id: DataStreamId,
        sequence: u32,
    },
}

impl EngineEvent {
    /// Stable name for logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Warning(_) => "warning",
            EngineEvent::Error(_) => "error",
            EngineEvent::Joined(_) => "joined",
            EngineEvent::Rejoined(_) => "rejoined",
            EngineEvent::Left(_) => "left",
            EngineEvent::RoleChanged { .. } => "role_changed",
            EngineEvent::PeerJoined { .. } => "peer_joined",
            EngineEvent::PeerLeft { .. } => "peer_left",
            EngineEvent::PeerAudioMuted { .. } => "peer_audio_muted",
            EngineEvent::PeerVideoMuted { .. } => "peer_video_muted",
            EngineEvent::PeerVideoEnabled { .. } => "peer_video_enabled",
            EngineEvent::ConnectionInterrupted => "connection_interrupted",
            EngineEvent::ConnectionLost => "connection_lost",
            EngineEvent::ConnectionBanned => "connection_banned",
            EngineEvent::TokenWillExpire(_) => "token_will_expire",
            EngineEvent::TokenExpired => "token_expired",
            EngineEvent::QualityReport { .. } => "quality_report",
            EngineEvent::LastmileQuality(_) => "lastmile_quality",
            EngineEvent::RtcStats(_) => "rtc_stats",
            EngineEvent::VolumeReport { .. } => "volume_report",
            EngineEvent::ActiveSpeaker(_) => "active_speaker",
            EngineEvent::PublishFallback { .. } => "publish_fallback",
            EngineEvent::SubscribeFallback { .. } => "subscribe_fallback",
            EngineEvent::RemoteVideoLayerChanged { .. } => "remote_video_layer_changed",
            EngineEvent::DataMessage { .. } => "data_message",
            EngineEvent::DataMessageError { .. } => "data_message_error",
            EngineEvent::DataMessageDeliveryFailed { .. } => "data_message_delivery_failed",
        }
    }
}

/// Receiver of engine notifications.
///
/// In dedicated delivery mode this is called from the engine's delivery
/// task, one event at a time and in emission order. Implementations should
/// return quickly; a slow sink delays later events but never the engine.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: EngineEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn on_event(&self, _event: EngineEvent) {}
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_token_event_is_redacted() {
        let event = EngineEvent::TokenWillExpire(SecretString::from("006secret"));
        let debug = format!("{event:?}");
        assert!(!debug.contains("006secret"));
        assert_eq!(event.name(), "token_will_expire");
    }

    #[test]
    fn test_stats_serialize() {
        let stats = ChannelStats {
            duration: Duration::from_secs(3),
            tx_bytes: 10,
            user_count: 2,
            ..ChannelStats::default()
        };
        let json = serde_json::to_value(&stats).unwrap_or_default();
        assert_eq!(json["tx_bytes"], 10);
        assert_eq!(json["user_count"], 2);
    }
}
