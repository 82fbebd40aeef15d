//! Message types for the engine mailbox.
//!
//! Every mutating operation on [`super::EngineHandle`] becomes one message;
//! the actor handles them strictly in submission order. Request/reply uses
//! `tokio::sync::oneshot`.

use crate::errors::EngineError;
use crate::events::{ChannelStats, JoinedChannel};
use crate::quality::{FallbackPolicy, VideoLayer};
use crate::session::{ClientRole, JoinRequest};
use bytes::Bytes;
use common::secret::SecretString;
use common::types::{DataStreamId, Uid};
use tokio::sync::oneshot;

/// Reply channel for a validated-and-applied operation.
pub type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent to the engine actor.
#[derive(Debug)]
pub enum EngineMessage {
    Join {
        request: JoinRequest,
        /// Receives the join success instead of the event sink.
        completion: Option<oneshot::Sender<JoinedChannel>>,
        respond_to: Reply<()>,
    },

    Leave {
        /// Receives the final statistics instead of the event sink.
        completion: Option<oneshot::Sender<ChannelStats>>,
        respond_to: Reply<()>,
    },

    SetClientRole {
        role: ClientRole,
        respond_to: Reply<()>,
    },

    RenewToken {
        token: SecretString,
        respond_to: Reply<()>,
    },

    CreateDataStream {
        stream_id: DataStreamId,
        reliable: bool,
        ordered: bool,
        respond_to: Reply<()>,
    },

    CloseDataStream {
        stream_id: DataStreamId,
        respond_to: Reply<()>,
    },

    SendStreamMessage {
        stream_id: DataStreamId,
        payload: Bytes,
        /// Receives the message sequence number.
        respond_to: Reply<u32>,
    },

    SetPublishFallback {
        policy: FallbackPolicy,
        respond_to: Reply<()>,
    },

    SetSubscribeFallback {
        policy: FallbackPolicy,
        respond_to: Reply<()>,
    },

    EnableLastmileTest {
        respond_to: Reply<()>,
    },

    DisableLastmileTest {
        respond_to: Reply<()>,
    },

    EnableVolumeIndication {
        /// Report period; zero or negative disables reporting.
        interval_ms: i32,
        /// Smoothing factor, 0-10.
        smooth: i32,
        respond_to: Reply<()>,
    },

    /// Raw PCM for volume aggregation. Fire-and-forget.
    AudioFrame {
        uid: Uid,
        samples: Vec<i16>,
    },

    MuteLocalAudio {
        muted: bool,
        respond_to: Reply<()>,
    },

    MuteLocalVideo {
        muted: bool,
        respond_to: Reply<()>,
    },

    EnableDualStream {
        enabled: bool,
        respond_to: Reply<()>,
    },

    SetRemoteVideoStream {
        uid: Uid,
        layer: VideoLayer,
        respond_to: Reply<()>,
    },

    SetRemoteDefaultVideoStream {
        layer: VideoLayer,
        respond_to: Reply<()>,
    },

    RemotePeers {
        respond_to: Reply<Vec<Uid>>,
    },
}

impl EngineMessage {
    /// Operation name for logs and state errors.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            EngineMessage::Join { .. } => "join",
            EngineMessage::Leave { .. } => "leave",
            EngineMessage::SetClientRole { .. } => "set_client_role",
            EngineMessage::RenewToken { .. } => "renew_token",
            EngineMessage::CreateDataStream { .. } => "create_data_stream",
            EngineMessage::CloseDataStream { .. } => "close_data_stream",
            EngineMessage::SendStreamMessage { .. } => "send_stream_message",
            EngineMessage::SetPublishFallback { .. } => "set_local_publish_fallback_option",
            EngineMessage::SetSubscribeFallback { .. } => "set_remote_subscribe_fallback_option",
            EngineMessage::EnableLastmileTest { .. } => "enable_lastmile_test",
            EngineMessage::DisableLastmileTest { .. } => "disable_lastmile_test",
            EngineMessage::EnableVolumeIndication { .. } => "enable_audio_volume_indication",
            EngineMessage::AudioFrame { .. } => "push_audio_frame",
            EngineMessage::MuteLocalAudio { .. } => "mute_local_audio_stream",
            EngineMessage::MuteLocalVideo { .. } => "mute_local_video_stream",
            EngineMessage::EnableDualStream { .. } => "enable_dual_stream_mode",
            EngineMessage::SetRemoteVideoStream { .. } => "set_remote_video_stream",
            EngineMessage::SetRemoteDefaultVideoStream { .. } => {
                "set_remote_default_video_stream_type"
            }
            EngineMessage::RemotePeers { .. } => "remote_peers",
        }
    }

    /// Answer the request with `error` without handling it.
    pub fn reject(self, error: EngineError) {
        match self {
            EngineMessage::Join { respond_to, .. }
            | EngineMessage::Leave { respond_to, .. }
            | EngineMessage::SetClientRole { respond_to, .. }
            | EngineMessage::RenewToken { respond_to, .. }
            | EngineMessage::CreateDataStream { respond_to, .. }
            | EngineMessage::CloseDataStream { respond_to, .. }
            | EngineMessage::SetPublishFallback { respond_to, .. }
            | EngineMessage::SetSubscribeFallback { respond_to, .. }
            | EngineMessage::EnableLastmileTest { respond_to }
            | EngineMessage::DisableLastmileTest { respond_to }
            | EngineMessage::EnableVolumeIndication { respond_to, .. }
            | EngineMessage::MuteLocalAudio { respond_to, .. }
            | EngineMessage::MuteLocalVideo { respond_to, .. }
            | EngineMessage::EnableDualStream { respond_to, .. }
            | EngineMessage::SetRemoteVideoStream { respond_to, .. }
            | EngineMessage::SetRemoteDefaultVideoStream { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            EngineMessage::SendStreamMessage { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            EngineMessage::RemotePeers { respond_to } => {
                let _ = respond_to.send(Err(error));
            }
            EngineMessage::AudioFrame { .. } => {}
        }
    }
}
