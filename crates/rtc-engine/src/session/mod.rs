//! Channel session state.
//!
//! A [`Session`] exists from an accepted join request until the leave
//! sequence completes. It is owned by the engine actor; nothing in here
//! talks to the transport.

pub mod peers;
pub mod reconnect;
pub mod token;
pub mod validation;

pub use peers::{MembershipDiff, PeerTable, RemotePeer};
pub use reconnect::{Backoff, RetryState};
pub use token::{TokenCheck, TokenTracker};
pub use validation::validate_channel_id;

use crate::events::JoinedChannel;
use crate::transport::ConnectParams;
use common::secret::{normalize_token, SecretString};
use common::types::{CallId, Uid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Connection state of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Joining,
    Joined,
    Reconnecting,
    Leaving,
    Banned,
}

impl ConnectionState {
    /// States in which a session is trying to be, or is, in the channel.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Joining | ConnectionState::Joined | ConnectionState::Reconnecting
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Joining => "Joining",
            ConnectionState::Joined => "Joined",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Leaving => "Leaving",
            ConnectionState::Banned => "Banned",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the local user publishes media.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientRole {
    #[default]
    Broadcaster,
    Audience,
}

impl ClientRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ClientRole::Broadcaster => "broadcaster",
            ClientRole::Audience => "audience",
        }
    }
}

/// Why a remote peer went offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfflineReason {
    /// The peer left on purpose.
    Quit,
    /// Nothing was heard from the peer for the liveness timeout.
    Dropped,
    /// The peer switched to audience and stopped publishing.
    BecameAudience,
}

/// A request to join a channel.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub channel: String,
    pub token: Option<SecretString>,
    /// `Uid::LOCAL` lets the server assign one.
    pub uid: Uid,
    /// Opaque caller data forwarded to the server.
    pub info: Option<String>,
}

impl JoinRequest {
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            token: None,
            uid: Uid::LOCAL,
            info: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = normalize_token(Some(SecretString::from(token.into())));
        self
    }

    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<Uid>) -> Self {
        self.uid = uid.into();
        self
    }

    #[must_use]
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }
}

/// One participation in a channel.
#[derive(Debug)]
pub struct Session {
    pub channel: String,
    pub requested_uid: Uid,
    /// Resolved uid; equals `requested_uid` until the server answers.
    pub uid: Uid,
    pub info: Option<String>,
    pub call_id: CallId,
    pub token: TokenTracker,
    pub requested_at: Instant,
    pub joined_at: Option<Instant>,
    pub peers: PeerTable,
    /// Present while a join or reconnect sequence is in flight.
    pub retry: Option<RetryState>,
    /// One-shot join completion; when absent the event sink is told instead.
    pub join_completion: Option<oneshot::Sender<JoinedChannel>>,
}

impl Session {
    #[must_use]
    pub fn new(
        request: JoinRequest,
        completion: Option<oneshot::Sender<JoinedChannel>>,
        now: Instant,
    ) -> Self {
        Self {
            channel: request.channel,
            requested_uid: request.uid,
            uid: request.uid,
            info: request.info,
            call_id: CallId::new(),
            token: TokenTracker::new(normalize_token(request.token)),
            requested_at: now,
            joined_at: None,
            peers: PeerTable::new(),
            retry: None,
            join_completion: completion,
        }
    }

    /// Parameters for the next connect or reconnect attempt.
    ///
    /// Reconnects ask for the uid the server assigned on the first join.
    #[must_use]
    pub fn connect_params(&self, role: ClientRole) -> ConnectParams {
        ConnectParams {
            channel: self.channel.clone(),
            uid: self.uid,
            token: self.token.token().cloned(),
            info: self.info.clone(),
            role,
        }
    }

    /// Record a server acknowledgment of the session.
    pub fn admit(&mut self, uid: Uid, now: Instant) {
        self.uid = uid;
        self.peers.set_local_uid(uid);
        self.retry = None;
        if self.joined_at.is_none() {
            self.joined_at = Some(now);
        }
    }

    /// Time spent in the channel so far.
    #[must_use]
    pub fn duration(&self, now: Instant) -> Duration {
        self.joined_at
            .map_or(Duration::ZERO, |at| now.duration_since(at))
    }

    /// Start a new retry sequence unless one is running.
    pub fn begin_retry(&mut self, now: Instant, initial: Duration, max: Duration) -> &mut RetryState {
        self.retry
            .get_or_insert_with(|| RetryState::new(now, initial, max))
    }
}
