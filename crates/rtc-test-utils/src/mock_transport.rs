//! Mock network transport for engine testing.
//!
//! Can be configured to:
//! - Admit connects with a chosen uid, peer list, and token expiry
//! - Fail or hang individual connect attempts, or all of them
//! - Refuse role switches and token renewals
//! - Report arbitrary link counters and last-mile probe counters
//!
//! Every call the engine makes is recorded for assertions, and transport
//! events are pushed with [`MockTransport::inject`].
//!
//! # Example
//!
//! ```rust,ignore
//! use rtc_test_utils::MockTransport;
//!
//! let (transport, events) = MockTransport::builder()
//!     .assign_uid(42)
//!     .with_peers(vec![PeerSnapshot::new(Uid(7))])
//!     .build();
//!
//! transport.set_connect_failure(Some(TransportError::Timeout));
//! transport.inject(TransportEvent::ConnectionLost);
//! ```

use async_trait::async_trait;
use chrono::Utc;
use common::secret::{ExposeSecret, SecretString};
use common::types::Uid;
use rtc_engine::quality::SubscribeLevel;
use rtc_engine::session::ClientRole;
use rtc_engine::transport::{
    ConnectParams, DirectionCounters, JoinAck, OutboundData, PeerSnapshot, Transport,
    TransportCounters, TransportError, TransportEvent,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Capacity of the transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One call made by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect {
        channel: String,
        uid: Uid,
        token: Option<String>,
        role: ClientRole,
        reconnect: bool,
    },
    Disconnect,
    RenewToken(String),
    SetClientRole(ClientRole),
    SetLocalPublish {
        audio: bool,
        video: bool,
    },
    SetRemoteVideo {
        uid: Uid,
        level: SubscribeLevel,
    },
    SendData(OutboundData),
}

/// Outcome of one scripted connect attempt.
#[derive(Debug, Clone)]
pub enum ScriptedConnect {
    /// Admit with the default acknowledgment.
    Admit,
    /// Admit with these peers instead of the configured ones.
    AdmitWithPeers(Vec<PeerSnapshot>),
    Fail(TransportError),
    /// Never answer.
    Hang,
}

#[derive(Debug)]
struct MockTransportInner {
    assigned_uid: Uid,
    peers: Vec<PeerSnapshot>,
    token_expires_in: Option<chrono::Duration>,
    connect_delay: Duration,
    disconnect_delay: Duration,
    script: VecDeque<ScriptedConnect>,
    connect_failure: Option<TransportError>,
    role_failure: Option<TransportError>,
    renew_failure: Option<TransportError>,
    counters: TransportCounters,
    probe: Option<DirectionCounters>,
    calls: Vec<TransportCall>,
}

/// Scriptable transport. Share it with the engine as `Arc<dyn Transport>`.
#[derive(Debug)]
pub struct MockTransport {
    inner: Mutex<MockTransportInner>,
    events: mpsc::Sender<TransportEvent>,
}

impl MockTransport {
    /// Create a new MockTransport builder.
    #[must_use]
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    /// Push a transport event to the engine.
    pub fn inject(&self, event: TransportEvent) {
        self.events
            .try_send(event)
            .expect("transport event channel full or closed");
    }

    /// Queue the outcome of the next connect or reconnect attempt.
    pub fn script_connect(&self, outcome: ScriptedConnect) {
        self.lock().script.push_back(outcome);
    }

    /// Fail every unscripted attempt with `error`, or admit again with `None`.
    pub fn set_connect_failure(&self, error: Option<TransportError>) {
        self.lock().connect_failure = error;
    }

    /// Peers reported by later acknowledgments.
    pub fn set_peers(&self, peers: Vec<PeerSnapshot>) {
        self.lock().peers = peers;
    }

    pub fn set_role_failure(&self, error: Option<TransportError>) {
        self.lock().role_failure = error;
    }

    pub fn set_renew_failure(&self, error: Option<TransportError>) {
        self.lock().renew_failure = error;
    }

    /// Token lifetime reported on admission and renewal.
    pub fn set_token_expires_in(&self, lifetime: Option<chrono::Duration>) {
        self.lock().token_expires_in = lifetime;
    }

    pub fn set_uplink(&self, counters: DirectionCounters) {
        self.lock().counters.uplink = counters;
    }

    pub fn set_downlink(&self, uid: Uid, counters: DirectionCounters) {
        self.lock().counters.downlink.insert(uid, counters);
    }

    pub fn set_probe(&self, probe: Option<DirectionCounters>) {
        self.lock().probe = probe;
    }

    /// Every call recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    /// Connect attempts so far, split into (initial, reconnect).
    #[must_use]
    pub fn connect_attempts(&self) -> (usize, usize) {
        let inner = self.lock();
        let mut initial = 0;
        let mut reconnect = 0;
        for call in &inner.calls {
            if let TransportCall::Connect { reconnect: r, .. } = call {
                if *r {
                    reconnect += 1;
                } else {
                    initial += 1;
                }
            }
        }
        (initial, reconnect)
    }

    /// The most recent connect or reconnect call.
    #[must_use]
    pub fn last_connect(&self) -> Option<TransportCall> {
        self.lock()
            .calls
            .iter()
            .rev()
            .find(|c| matches!(c, TransportCall::Connect { .. }))
            .cloned()
    }

    #[must_use]
    pub fn sent_data(&self) -> Vec<OutboundData> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::SendData(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// The latest `(audio, video)` publishing decision.
    #[must_use]
    pub fn last_local_publish(&self) -> Option<(bool, bool)> {
        self.lock().calls.iter().rev().find_map(|c| match c {
            TransportCall::SetLocalPublish { audio, video } => Some((*audio, *video)),
            _ => None,
        })
    }

    /// Every subscribe level requested for `uid`, in order.
    #[must_use]
    pub fn remote_video_levels(&self, uid: Uid) -> Vec<SubscribeLevel> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::SetRemoteVideo { uid: u, level } if *u == uid => Some(*level),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, TransportCall::Disconnect))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockTransportInner> {
        self.inner.lock().expect("mock transport lock poisoned")
    }

    fn record(&self, call: TransportCall) {
        self.lock().calls.push(call);
    }

    async fn attempt(
        &self,
        params: ConnectParams,
        reconnect: bool,
    ) -> Result<JoinAck, TransportError> {
        let (outcome, delay) = {
            let mut inner = self.lock();
            inner.calls.push(TransportCall::Connect {
                channel: params.channel.clone(),
                uid: params.uid,
                token: params
                    .token
                    .as_ref()
                    .map(|t| t.expose_secret().to_string()),
                role: params.role,
                reconnect,
            });

            let outcome = match inner.script.pop_front() {
                Some(scripted) => scripted,
                None => match inner.connect_failure.clone() {
                    Some(error) => ScriptedConnect::Fail(error),
                    None => ScriptedConnect::Admit,
                },
            };
            (outcome, inner.connect_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let peers = match outcome {
            ScriptedConnect::Admit => self.lock().peers.clone(),
            ScriptedConnect::AdmitWithPeers(peers) => peers,
            ScriptedConnect::Fail(error) => return Err(error),
            ScriptedConnect::Hang => std::future::pending().await,
        };

        let inner = self.lock();
        Ok(JoinAck {
            uid: if params.uid.is_local() {
                inner.assigned_uid
            } else {
                params.uid
            },
            token_expires_at: inner.token_expires_in.map(|d| Utc::now() + d),
            peers,
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, params: ConnectParams) -> Result<JoinAck, TransportError> {
        self.attempt(params, false).await
    }

    async fn reconnect(&self, params: ConnectParams) -> Result<JoinAck, TransportError> {
        self.attempt(params, true).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(TransportCall::Disconnect);
            inner.disconnect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn renew_token(
        &self,
        token: SecretString,
    ) -> Result<Option<chrono::DateTime<Utc>>, TransportError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(TransportCall::RenewToken(token.expose_secret().to_string()));
        match inner.renew_failure.clone() {
            Some(error) => Err(error),
            None => Ok(inner.token_expires_in.map(|d| Utc::now() + d)),
        }
    }

    async fn set_client_role(&self, role: ClientRole) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.calls.push(TransportCall::SetClientRole(role));
        match inner.role_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn set_local_publish(
        &self,
        publish_audio: bool,
        publish_video: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetLocalPublish {
            audio: publish_audio,
            video: publish_video,
        });
        Ok(())
    }

    async fn set_remote_video(
        &self,
        uid: Uid,
        level: SubscribeLevel,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::SetRemoteVideo { uid, level });
        Ok(())
    }

    async fn send_data(&self, message: OutboundData) -> Result<(), TransportError> {
        self.record(TransportCall::SendData(message));
        Ok(())
    }

    fn counters(&self) -> TransportCounters {
        self.lock().counters.clone()
    }

    fn probe_counters(&self) -> Option<DirectionCounters> {
        self.lock().probe
    }
}

/// Builder for MockTransport configuration.
#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    assigned_uid: Option<Uid>,
    peers: Vec<PeerSnapshot>,
    token_expires_in: Option<chrono::Duration>,
    connect_delay: Duration,
    disconnect_delay: Duration,
}

impl MockTransportBuilder {
    /// Uid assigned when the engine asks the server to pick one.
    #[must_use]
    pub fn assign_uid(mut self, uid: impl Into<Uid>) -> Self {
        self.assigned_uid = Some(uid.into());
        self
    }

    /// Channel members reported on admission.
    #[must_use]
    pub fn with_peers(mut self, peers: Vec<PeerSnapshot>) -> Self {
        self.peers = peers;
        self
    }

    #[must_use]
    pub fn token_expires_in(mut self, lifetime: chrono::Duration) -> Self {
        self.token_expires_in = Some(lifetime);
        self
    }

    /// Delay before every connect attempt answers.
    #[must_use]
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Delay before every disconnect answers.
    #[must_use]
    pub fn disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = delay;
        self
    }

    /// Build the transport and the event receiver to hand to the engine.
    #[must_use]
    pub fn build(self) -> (Arc<MockTransport>, mpsc::Receiver<TransportEvent>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = MockTransport {
            inner: Mutex::new(MockTransportInner {
                assigned_uid: self.assigned_uid.unwrap_or(Uid(1000)),
                peers: self.peers,
                token_expires_in: self.token_expires_in,
                connect_delay: self.connect_delay,
                disconnect_delay: self.disconnect_delay,
                script: VecDeque::new(),
                connect_failure: None,
                role_failure: None,
                renew_failure: None,
                counters: TransportCounters::default(),
                probe: None,
                calls: Vec::new(),
            }),
            events,
        };
        (Arc::new(transport), receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(uid: u32) -> ConnectParams {
        ConnectParams {
            channel: "room1".to_string(),
            uid: Uid(uid),
            token: Some(SecretString::from("tok")),
            info: None,
            role: ClientRole::Broadcaster,
        }
    }

    #[tokio::test]
    async fn test_admit_assigns_uid_for_local_request() {
        let (transport, _events) = MockTransport::builder().assign_uid(42).build();

        let ack = transport.connect(params(0)).await.unwrap();
        assert_eq!(ack.uid, Uid(42));

        let ack = transport.connect(params(7)).await.unwrap();
        assert_eq!(ack.uid, Uid(7));
        assert_eq!(transport.connect_attempts(), (2, 0));
    }

    #[tokio::test]
    async fn test_script_takes_precedence() {
        let (transport, _events) = MockTransport::builder().build();
        transport.set_connect_failure(Some(TransportError::Timeout));
        transport.script_connect(ScriptedConnect::Admit);

        assert!(transport.reconnect(params(1)).await.is_ok());
        assert_eq!(
            transport.reconnect(params(1)).await.unwrap_err(),
            TransportError::Timeout
        );
        assert_eq!(transport.connect_attempts(), (0, 2));
        assert_eq!(
            transport.last_connect(),
            Some(TransportCall::Connect {
                channel: "room1".to_string(),
                uid: Uid(1),
                token: Some("tok".to_string()),
                role: ClientRole::Broadcaster,
                reconnect: true,
            })
        );
    }

    #[tokio::test]
    async fn test_inject_reaches_receiver() {
        let (transport, mut events) = MockTransport::builder().build();
        transport.inject(TransportEvent::ConnectionLost);
        assert_eq!(events.recv().await, Some(TransportEvent::ConnectionLost));
    }
}
