//! `RtcEngine` - the scheduling actor that owns all session state.
//!
//! One actor per engine instance:
//! - Owns the session (peers, token, retry state), the quality monitor and
//!   controller, the data channel, and the volume aggregator
//! - Runs the periodic work: housekeeping (liveness, token, connection-lost
//!   window, reliable delivery timeouts), quality sampling, volume reports
//! - Drives the [`Transport`] and [`EncoderControl`] collaborators
//!
//! Long transport round trips (connect, reconnect, disconnect) run in
//! spawned tasks and report back on an internal channel, tagged with the
//! attempt generation so an outcome that arrives after leave or a restart is
//! ignored.

use super::dispatcher::{DeliveryDriver, Dispatcher, EventPump};
use super::messages::{EngineMessage, Reply};
use super::metrics::{ActorType, MailboxMonitor};
use crate::config::EngineConfig;
use crate::data_stream::{DataChannel, DataLimits, DataReceiver, Inbound, UndeliveredMessage};
use crate::errors::{EngineError, ErrorCode, WarningCode};
use crate::events::{ChannelStats, EngineEvent, EventSink, JoinedChannel};
use crate::observability::metrics::{
    record_data_message, record_fallback_transition, record_quality_sample,
    record_reconnect_attempt, record_state_transition, set_remote_peers,
};
use crate::quality::{
    FallbackPolicy, LinkQuality, NetworkQuality, QualityController, QualityMonitor,
    SubscribeChange, VideoLayer,
};
use crate::session::{
    validate_channel_id, ClientRole, ConnectionState, JoinRequest, OfflineReason, Session,
    TokenCheck,
};
use crate::transport::{
    EncoderControl, JoinAck, RejectReason, Transport, TransportError, TransportEvent,
};
use crate::volume::{VolumeAggregator, MAX_SMOOTH};

use bytes::Bytes;
use common::secret::SecretString;
use common::types::{CallId, DataStreamId, Uid};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for the engine mailbox.
const ENGINE_CHANNEL_BUFFER: usize = 256;

/// Upper bound on releasing the transport during destroy.
const SHUTDOWN_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the engine drives but does not implement.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    /// Signals pushed by the transport. The engine owns the receiving side.
    pub transport_events: mpsc::Receiver<TransportEvent>,
    pub encoder: Arc<dyn EncoderControl>,
}

/// Handle to the engine actor.
///
/// Cheap to clone. Every mutating call is a mailbox message answered once
/// the actor has validated and applied it; getters read snapshots without a
/// round trip.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    state: watch::Receiver<ConnectionState>,
    quality: watch::Receiver<HashMap<Uid, LinkQuality>>,
    call_id: watch::Receiver<Option<CallId>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineMessage,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self.sender.send(build(tx)).await.is_err() {
            self.mailbox.record_dequeue();
            return Err(EngineError::NotInitialized);
        }
        rx.await.map_err(|_| EngineError::NotInitialized)?
    }

    /// Join a channel. Success is reported to the event sink as `Joined`.
    ///
    /// # Errors
    ///
    /// - `InvalidChannelId` for a malformed channel id
    /// - `JoinRejected` when already in (or leaving) this channel
    /// - `AlreadyInUse` when in another channel
    /// - `Refused` when banned
    pub async fn join(&self, request: JoinRequest) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::Join {
            request,
            completion: None,
            respond_to,
        })
        .await
    }

    /// Join a channel, receiving success on the returned one-shot instead
    /// of the event sink.
    ///
    /// # Errors
    ///
    /// Same as [`EngineHandle::join`].
    pub async fn join_with_completion(
        &self,
        request: JoinRequest,
    ) -> Result<oneshot::Receiver<JoinedChannel>, EngineError> {
        let (completion, rx) = oneshot::channel();
        self.request(|respond_to| EngineMessage::Join {
            request,
            completion: Some(completion),
            respond_to,
        })
        .await?;
        Ok(rx)
    }

    /// Leave the current channel. `Left` follows once the server confirms.
    ///
    /// # Errors
    ///
    /// `LeaveRejected` when idle or already leaving.
    pub async fn leave(&self) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::Leave {
            completion: None,
            respond_to,
        })
        .await
    }

    /// Leave, receiving the final statistics on the returned one-shot
    /// instead of the event sink.
    ///
    /// # Errors
    ///
    /// Same as [`EngineHandle::leave`].
    pub async fn leave_with_completion(
        &self,
    ) -> Result<oneshot::Receiver<ChannelStats>, EngineError> {
        let (completion, rx) = oneshot::channel();
        self.request(|respond_to| EngineMessage::Leave {
            completion: Some(completion),
            respond_to,
        })
        .await?;
        Ok(rx)
    }

    /// Stop the engine. A leave in progress is abandoned without `Left`.
    pub fn destroy(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// # Errors
    ///
    /// - `InvalidState` outside Idle and Joined
    /// - `RoleNotAuthorized` when the server refuses the switch
    /// - `TimedOut` when the server does not answer
    pub async fn set_client_role(&self, role: ClientRole) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::SetClientRole { role, respond_to })
            .await
    }

    /// Present a fresh token.
    ///
    /// # Errors
    ///
    /// `NotInChannel` without a session; `InvalidArgument` if the server
    /// rejects the token.
    pub async fn renew_token(&self, token: impl Into<String>) -> Result<(), EngineError> {
        let token = SecretString::from(token.into());
        self.request(|respond_to| EngineMessage::RenewToken { token, respond_to })
            .await
    }

    /// # Errors
    ///
    /// `NotInChannel`, `InvalidArgument`, `AlreadyInUse`, `TooManyDataStreams`.
    pub async fn create_data_stream(
        &self,
        stream_id: impl Into<DataStreamId>,
        reliable: bool,
        ordered: bool,
    ) -> Result<(), EngineError> {
        let stream_id = stream_id.into();
        self.request(|respond_to| EngineMessage::CreateDataStream {
            stream_id,
            reliable,
            ordered,
            respond_to,
        })
        .await
    }

    /// Close a stream, failing its unacknowledged reliable messages.
    ///
    /// # Errors
    ///
    /// `NotInChannel`, or `InvalidArgument` if the stream is not open.
    pub async fn close_data_stream(
        &self,
        stream_id: impl Into<DataStreamId>,
    ) -> Result<(), EngineError> {
        let stream_id = stream_id.into();
        self.request(|respond_to| EngineMessage::CloseDataStream {
            stream_id,
            respond_to,
        })
        .await
    }

    /// Send one message. Returns its sequence number on the stream.
    ///
    /// # Errors
    ///
    /// `NotInChannel`, `InvalidArgument`, `RoleNotAuthorized`,
    /// `SizeTooLarge`, `TooOften`, `BitrateLimit`.
    pub async fn send_stream_message(
        &self,
        stream_id: impl Into<DataStreamId>,
        payload: impl Into<Bytes>,
    ) -> Result<u32, EngineError> {
        let stream_id = stream_id.into();
        let payload = payload.into();
        self.request(|respond_to| EngineMessage::SendStreamMessage {
            stream_id,
            payload,
            respond_to,
        })
        .await
    }

    /// # Errors
    ///
    /// `Refused` when banned.
    pub async fn set_local_publish_fallback_option(
        &self,
        policy: FallbackPolicy,
    ) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::SetPublishFallback { policy, respond_to })
            .await
    }

    /// # Errors
    ///
    /// `Refused` when banned.
    pub async fn set_remote_subscribe_fallback_option(
        &self,
        policy: FallbackPolicy,
    ) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::SetSubscribeFallback { policy, respond_to })
            .await
    }

    /// # Errors
    ///
    /// `NotSupported` while in a channel as broadcaster.
    pub async fn enable_lastmile_test(&self) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::EnableLastmileTest { respond_to })
            .await
    }

    /// # Errors
    ///
    /// `Refused` when banned.
    pub async fn disable_lastmile_test(&self) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::DisableLastmileTest { respond_to })
            .await
    }

    /// Report speaker volumes every `interval_ms`; zero or less disables.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` unless `smooth` is within 0-10.
    pub async fn enable_audio_volume_indication(
        &self,
        interval_ms: i32,
        smooth: i32,
    ) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::EnableVolumeIndication {
            interval_ms,
            smooth,
            respond_to,
        })
        .await
    }

    /// Feed raw PCM for volume aggregation. `Uid::LOCAL` is the local user.
    ///
    /// Never waits: a full mailbox drops the frame.
    ///
    /// # Errors
    ///
    /// `TooOften` when the mailbox is full; `NotInitialized` after destroy.
    pub fn push_audio_frame(&self, uid: Uid, samples: Vec<i16>) -> Result<(), EngineError> {
        self.mailbox.record_enqueue();
        match self.sender.try_send(EngineMessage::AudioFrame { uid, samples }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.mailbox.record_dequeue();
                self.mailbox.record_drop();
                Err(EngineError::TooOften)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mailbox.record_dequeue();
                Err(EngineError::NotInitialized)
            }
        }
    }

    /// # Errors
    ///
    /// `Refused` when banned.
    pub async fn mute_local_audio_stream(&self, muted: bool) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::MuteLocalAudio { muted, respond_to })
            .await
    }

    /// # Errors
    ///
    /// `Refused` when banned.
    pub async fn mute_local_video_stream(&self, muted: bool) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::MuteLocalVideo { muted, respond_to })
            .await
    }

    /// # Errors
    ///
    /// `Refused` when banned.
    pub async fn enable_dual_stream_mode(&self, enabled: bool) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::EnableDualStream {
            enabled,
            respond_to,
        })
        .await
    }

    /// Preferred video layer for one remote peer. Fallback may still go lower.
    ///
    /// # Errors
    ///
    /// `Refused` when banned.
    pub async fn set_remote_video_stream(
        &self,
        uid: Uid,
        layer: VideoLayer,
    ) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::SetRemoteVideoStream {
            uid,
            layer,
            respond_to,
        })
        .await
    }

    /// Preferred video layer for peers without an explicit preference.
    ///
    /// # Errors
    ///
    /// `Refused` when banned.
    pub async fn set_remote_default_video_stream_type(
        &self,
        layer: VideoLayer,
    ) -> Result<(), EngineError> {
        self.request(|respond_to| EngineMessage::SetRemoteDefaultVideoStream {
            layer,
            respond_to,
        })
        .await
    }

    /// Uids of the remote peers, ascending.
    ///
    /// # Errors
    ///
    /// `Refused` when banned.
    pub async fn remote_peers(&self) -> Result<Vec<Uid>, EngineError> {
        self.request(|respond_to| EngineMessage::RemotePeers { respond_to })
            .await
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Latest grades for `uid` (`Uid::LOCAL` for the local user).
    #[must_use]
    pub fn network_quality(&self, uid: Uid) -> LinkQuality {
        self.quality.borrow().get(&uid).copied().unwrap_or_default()
    }

    /// Call id of the current session.
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        *self.call_id.borrow()
    }
}

/// An engine instance.
pub struct RtcEngine {
    handle: EngineHandle,
    task: JoinHandle<()>,
    delivery: Option<JoinHandle<()>>,
    pump: Option<EventPump>,
}

impl RtcEngine {
    /// Create an engine and spawn its actor. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `config` fails validation.
    pub fn create(
        config: EngineConfig,
        collaborators: Collaborators,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidArgument(e.to_string()))?;

        let (sender, receiver) = mpsc::channel(ENGINE_CHANNEL_BUFFER);
        let (dispatcher, driver) = Dispatcher::start(config.delivery_mode, sink);
        let (delivery, pump) = match driver {
            DeliveryDriver::Task(task) => (Some(task), None),
            DeliveryDriver::Pump(pump) => (None, Some(pump)),
        };

        let (actor, handle) = EngineActor::new(config, collaborators, dispatcher, sender, receiver);
        let task = tokio::spawn(actor.run());

        Ok(Self {
            handle,
            task,
            delivery,
            pump,
        })
    }

    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// The caller-drained event pump, in `CallerPump` delivery mode.
    pub fn take_event_pump(&mut self) -> Option<EventPump> {
        self.pump.take()
    }

    /// Destroy the engine and wait for its tasks to finish.
    pub async fn destroy(self) {
        self.handle.destroy();
        if let Err(e) = self.task.await {
            warn!(target: "rtc.actor.engine", error = ?e, "Engine task ended abnormally");
        }
        if let Some(delivery) = self.delivery {
            if let Err(e) = delivery.await {
                warn!(target: "rtc.dispatch", error = ?e, "Delivery task ended abnormally");
            }
        }
    }
}

/// Result of a spawned transport round trip.
#[derive(Debug)]
enum TaskOutcome {
    Connect {
        generation: u64,
        result: Result<JoinAck, TransportError>,
    },
    Disconnect {
        generation: u64,
        result: Result<(), TransportError>,
    },
}

/// Pending leave sequence.
#[derive(Debug)]
struct PendingLeave {
    stats: ChannelStats,
    completion: Option<oneshot::Sender<ChannelStats>>,
    task: JoinHandle<()>,
}

struct EngineActor {
    config: EngineConfig,
    receiver: mpsc::Receiver<EngineMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    transport: Arc<dyn Transport>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    encoder: Arc<dyn EncoderControl>,
    dispatcher: Dispatcher,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<TaskOutcome>,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    quality_tx: watch::Sender<HashMap<Uid, LinkQuality>>,
    call_id_tx: watch::Sender<Option<CallId>>,

    /// Role for the current or next session.
    role: ClientRole,
    local_audio_muted: bool,
    local_video_muted: bool,
    session: Option<Session>,
    /// Bumped whenever in-flight transport outcomes become stale.
    generation: u64,
    leave: Option<PendingLeave>,

    monitor: QualityMonitor,
    controller: QualityController,
    quality_tick: Interval,
    lastmile: bool,
    outbound: DataChannel,
    inbound: DataReceiver,
    volume: Option<VolumeAggregator>,
    volume_tick: Option<Interval>,
}

impl EngineActor {
    fn new(
        config: EngineConfig,
        collaborators: Collaborators,
        dispatcher: Dispatcher,
        sender: mpsc::Sender<EngineMessage>,
        receiver: mpsc::Receiver<EngineMessage>,
    ) -> (Self, EngineHandle) {
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Engine));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (quality_tx, quality_rx) = watch::channel(HashMap::new());
        let (call_id_tx, call_id_rx) = watch::channel(None);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let handle = EngineHandle {
            sender,
            cancel_token: cancel_token.clone(),
            mailbox: Arc::clone(&mailbox),
            state: state_rx,
            quality: quality_rx,
            call_id: call_id_rx,
        };

        let actor = Self {
            receiver,
            cancel_token,
            mailbox,
            transport: collaborators.transport,
            transport_events: Some(collaborators.transport_events),
            encoder: collaborators.encoder,
            dispatcher,
            outcome_tx,
            outcome_rx,
            state: ConnectionState::Idle,
            state_tx,
            quality_tx,
            call_id_tx,
            role: ClientRole::default(),
            local_audio_muted: false,
            local_video_muted: false,
            session: None,
            generation: 0,
            leave: None,
            monitor: QualityMonitor::new(),
            controller: QualityController::new(config.fallback_debounce_samples),
            quality_tick: periodic(config.quality_interval),
            lastmile: false,
            outbound: DataChannel::new(DataLimits::from(&config)),
            inbound: DataReceiver::new(config.reliable_delivery_timeout, config.data_cache_capacity),
            volume: None,
            volume_tick: None,
            config,
        };

        (actor, handle)
    }

    /// Run the actor loop.
    #[instrument(skip_all, name = "rtc.actor.engine")]
    async fn run(mut self) {
        info!(
            target: "rtc.actor.engine",
            delivery = ?self.config.delivery_mode,
            "Engine actor started"
        );

        let mut housekeeping = periodic(self.config.housekeeping_interval);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "rtc.actor.engine", "Engine received destroy");
                    self.graceful_shutdown().await;
                    break;
                }

                _ = housekeeping.tick() => {
                    self.housekeeping(Instant::now());
                }

                _ = self.quality_tick.tick() => {
                    self.on_quality_tick(Instant::now()).await;
                }

                _ = tick_opt(&mut self.volume_tick) => {
                    self.on_volume_tick();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message).await;
                        }
                        None => {
                            info!(
                                target: "rtc.actor.engine",
                                "All engine handles dropped, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }

                event = recv_opt(&mut self.transport_events) => {
                    match event {
                        Some(event) => self.handle_transport_event(event, Instant::now()).await,
                        None => {
                            warn!(target: "rtc.actor.engine", "Transport event stream closed");
                            self.transport_events = None;
                        }
                    }
                }

                Some(outcome) = self.outcome_rx.recv() => {
                    self.handle_outcome(outcome, Instant::now()).await;
                }
            }
        }

        info!(
            target: "rtc.actor.engine",
            messages_processed = self.mailbox.messages_processed(),
            "Engine actor stopped"
        );
    }

    async fn handle_message(&mut self, message: EngineMessage) {
        if self.state == ConnectionState::Banned
            && !matches!(message, EngineMessage::Leave { .. })
        {
            debug!(
                target: "rtc.actor.engine",
                operation = message.operation(),
                "Refusing operation on banned session"
            );
            message.reject(EngineError::Refused);
            return;
        }

        let now = Instant::now();
        match message {
            EngineMessage::Join {
                request,
                completion,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_join(request, completion, now));
            }
            EngineMessage::Leave {
                completion,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_leave(completion, now));
            }
            EngineMessage::SetClientRole { role, respond_to } => {
                let _ = respond_to.send(self.handle_set_role(role).await);
            }
            EngineMessage::RenewToken { token, respond_to } => {
                let _ = respond_to.send(self.handle_renew_token(token, now).await);
            }
            EngineMessage::CreateDataStream {
                stream_id,
                reliable,
                ordered,
                respond_to,
            } => {
                let result = self
                    .require_session("create_data_stream")
                    .and_then(|()| self.outbound.open(stream_id, reliable, ordered));
                let _ = respond_to.send(result);
            }
            EngineMessage::CloseDataStream {
                stream_id,
                respond_to,
            } => {
                let result = self
                    .require_session("close_data_stream")
                    .and_then(|()| self.outbound.close(stream_id));
                let _ = respond_to.send(result.map(|failed| self.report_undelivered(failed)));
            }
            EngineMessage::SendStreamMessage {
                stream_id,
                payload,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_send(stream_id, payload, now).await);
            }
            EngineMessage::SetPublishFallback { policy, respond_to } => {
                info!(target: "rtc.quality", policy = ?policy, "Publish fallback policy set");
                self.controller.set_publish_policy(policy);
                let _ = respond_to.send(Ok(()));
            }
            EngineMessage::SetSubscribeFallback { policy, respond_to } => {
                info!(target: "rtc.quality", policy = ?policy, "Subscribe fallback policy set");
                self.controller.set_subscribe_policy(policy);
                let _ = respond_to.send(Ok(()));
            }
            EngineMessage::EnableLastmileTest { respond_to } => {
                let result = if self.state == ConnectionState::Joined
                    && self.role == ClientRole::Broadcaster
                {
                    Err(EngineError::NotSupported(
                        "last-mile test while broadcasting in a channel".to_string(),
                    ))
                } else {
                    self.lastmile = true;
                    self.monitor.reset_lastmile();
                    Ok(())
                };
                let _ = respond_to.send(result);
            }
            EngineMessage::DisableLastmileTest { respond_to } => {
                self.lastmile = false;
                let _ = respond_to.send(Ok(()));
            }
            EngineMessage::EnableVolumeIndication {
                interval_ms,
                smooth,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_volume_indication(interval_ms, smooth));
            }
            EngineMessage::AudioFrame { uid, samples } => {
                self.handle_audio_frame(uid, &samples);
            }
            EngineMessage::MuteLocalAudio { muted, respond_to } => {
                self.local_audio_muted = muted;
                self.refresh_local_publish().await;
                let _ = respond_to.send(Ok(()));
            }
            EngineMessage::MuteLocalVideo { muted, respond_to } => {
                self.local_video_muted = muted;
                self.refresh_local_publish().await;
                let _ = respond_to.send(Ok(()));
            }
            EngineMessage::EnableDualStream {
                enabled,
                respond_to,
            } => {
                debug!(target: "rtc.quality", enabled, "Dual stream mode");
                self.encoder.set_dual_stream(enabled);
                let _ = respond_to.send(Ok(()));
            }
            EngineMessage::SetRemoteVideoStream {
                uid,
                layer,
                respond_to,
            } => {
                if let Some(change) = self.controller.set_preferred_layer(uid, layer) {
                    self.apply_subscribe_change(change).await;
                }
                let _ = respond_to.send(Ok(()));
            }
            EngineMessage::SetRemoteDefaultVideoStream { layer, respond_to } => {
                for change in self.controller.set_default_layer(layer) {
                    self.apply_subscribe_change(change).await;
                }
                let _ = respond_to.send(Ok(()));
            }
            EngineMessage::RemotePeers { respond_to } => {
                let peers = self
                    .session
                    .as_ref()
                    .map(|s| s.peers.uids())
                    .unwrap_or_default();
                let _ = respond_to.send(Ok(peers));
            }
        }
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    fn handle_join(
        &mut self,
        request: JoinRequest,
        completion: Option<oneshot::Sender<JoinedChannel>>,
        now: Instant,
    ) -> Result<(), EngineError> {
        validate_channel_id(&request.channel)?;

        if self.state == ConnectionState::Leaving {
            return Err(EngineError::JoinRejected(
                "previous session is still leaving".to_string(),
            ));
        }
        if let Some(current) = self.session.as_ref() {
            return Err(if current.channel == request.channel {
                EngineError::JoinRejected(current.channel.clone())
            } else {
                EngineError::AlreadyInUse(current.channel.clone())
            });
        }

        let session = Session::new(request, completion, now);
        info!(
            target: "rtc.session",
            channel = %session.channel,
            uid = %session.requested_uid,
            call_id = %session.call_id,
            role = self.role.as_str(),
            "Joining channel"
        );
        self.call_id_tx.send_replace(Some(session.call_id));
        self.session = Some(session);
        self.generation += 1;
        self.transition(ConnectionState::Joining);
        self.schedule_attempt(now);
        Ok(())
    }

    fn handle_leave(
        &mut self,
        completion: Option<oneshot::Sender<ChannelStats>>,
        now: Instant,
    ) -> Result<(), EngineError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Leaving => Err(EngineError::LeaveRejected),
            ConnectionState::Banned => {
                let stats = self.stats(now);
                self.drain();
                self.finish_session();
                self.dispatcher.complete(completion, stats, EngineEvent::Left);
                Ok(())
            }
            ConnectionState::Joining | ConnectionState::Joined | ConnectionState::Reconnecting => {
                let stats = self.stats(now);
                self.drain();
                self.transition(ConnectionState::Leaving);

                let transport = Arc::clone(&self.transport);
                let outcomes = self.outcome_tx.clone();
                let generation = self.generation;
                let task = tokio::spawn(async move {
                    let result = transport.disconnect().await;
                    let _ = outcomes.send(TaskOutcome::Disconnect { generation, result });
                });
                self.leave = Some(PendingLeave {
                    stats,
                    completion,
                    task,
                });
                Ok(())
            }
        }
    }

    /// Spawn the next connect or reconnect attempt of the session, after
    /// its backoff delay. Does nothing while retries wait for a token.
    fn schedule_attempt(&mut self, now: Instant) {
        let reconnect = self.state == ConnectionState::Reconnecting;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let params = session.connect_params(self.role);
        let retry = session.begin_retry(
            now,
            self.config.reconnect_initial_backoff,
            self.config.reconnect_max_backoff,
        );
        if retry.awaiting_token {
            debug!(target: "rtc.session", "Retries paused until the token is renewed");
            return;
        }
        let delay = retry.next_delay();
        debug!(
            target: "rtc.session",
            attempt = retry.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            reconnect,
            "Scheduling connect attempt"
        );

        let transport = Arc::clone(&self.transport);
        let outcomes = self.outcome_tx.clone();
        let generation = self.generation;
        retry.track(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = if reconnect {
                transport.reconnect(params).await
            } else {
                transport.connect(params).await
            };
            let _ = outcomes.send(TaskOutcome::Connect { generation, result });
        }));
    }

    async fn handle_outcome(&mut self, outcome: TaskOutcome, now: Instant) {
        match outcome {
            TaskOutcome::Connect { generation, result } => {
                if generation != self.generation
                    || !matches!(
                        self.state,
                        ConnectionState::Joining | ConnectionState::Reconnecting
                    )
                {
                    debug!(target: "rtc.session", generation, "Ignoring stale connect outcome");
                    return;
                }
                match result {
                    Ok(ack) => self.on_connected(ack, now).await,
                    Err(TransportError::Banned) => self.enter_banned(),
                    Err(TransportError::Rejected(reason)) => self.on_rejected(reason, now),
                    Err(e) => {
                        record_reconnect_attempt(e.label());
                        warn!(
                            target: "rtc.session",
                            error = %e,
                            state = %self.state,
                            "Connect attempt failed, retrying"
                        );
                        if self.state == ConnectionState::Joining {
                            self.emit(EngineEvent::Warning(WarningCode::OpenChannelTimeout));
                        }
                        self.schedule_attempt(now);
                    }
                }
            }
            TaskOutcome::Disconnect { generation, result } => {
                if generation != self.generation || self.state != ConnectionState::Leaving {
                    debug!(target: "rtc.session", generation, "Ignoring stale disconnect outcome");
                    return;
                }
                if let Err(e) = result {
                    warn!(target: "rtc.session", error = %e, "Disconnect failed, session released anyway");
                }
                let Some(leave) = self.leave.take() else {
                    return;
                };
                self.finish_session();
                self.dispatcher
                    .complete(leave.completion, leave.stats, EngineEvent::Left);
            }
        }
    }

    async fn on_connected(&mut self, ack: JoinAck, now: Instant) {
        record_reconnect_attempt("success");
        let rejoin = self.state == ConnectionState::Reconnecting;
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let retry_started = session.retry.as_ref().map_or(now, |r| r.started_at);
        session.admit(ack.uid, now);
        session.token.set_expiry(ack.token_expires_at, now);

        let mut flushed = Vec::new();
        let joined = if rejoin {
            let diff = session.peers.rebuild(&ack.peers, now);
            self.controller.clear_peers();
            for uid in &diff.dropped {
                self.monitor.forget(*uid);
                flushed.extend(self.inbound.peer_offline(*uid, now));
                if let Some(volume) = self.volume.as_mut() {
                    volume.forget(*uid);
                }
            }
            for uid in session.peers.uids() {
                let dual = session.peers.get(uid).is_some_and(|p| p.dual_stream);
                self.controller.register_peer(uid, dual);
            }
            info!(
                target: "rtc.session",
                channel = %session.channel,
                uid = %session.uid,
                joined = diff.joined.len(),
                dropped = diff.dropped.len(),
                "Rejoined channel"
            );
            for uid in diff.dropped {
                self.dispatcher.emit(EngineEvent::PeerLeft {
                    uid,
                    reason: OfflineReason::Dropped,
                });
            }
            diff.joined
        } else {
            let mut joined = Vec::with_capacity(ack.peers.len());
            for peer in &ack.peers {
                if session.peers.observe(peer, now) {
                    self.controller.register_peer(peer.uid, peer.dual_stream);
                    joined.push(peer.uid);
                }
            }
            joined.sort();
            info!(
                target: "rtc.session",
                channel = %session.channel,
                uid = %session.uid,
                peers = joined.len(),
                "Joined channel"
            );
            joined
        };

        let result = JoinedChannel {
            channel: session.channel.clone(),
            uid: session.uid,
            elapsed: now.duration_since(if rejoin {
                retry_started
            } else {
                session.requested_at
            }),
        };
        let requested_at = session.requested_at;
        let completion = session.join_completion.take();
        let peer_count = session.peers.len();

        self.monitor.reset();
        self.quality_tx.send_replace(HashMap::new());
        self.quality_tick.reset();
        self.transition(ConnectionState::Joined);
        if rejoin {
            self.emit(EngineEvent::Rejoined(result));
        } else {
            self.dispatcher.complete(completion, result, EngineEvent::Joined);
        }
        self.report_inbound(flushed);
        for uid in joined {
            self.emit(EngineEvent::PeerJoined {
                uid,
                elapsed: now.duration_since(requested_at),
            });
        }
        set_remote_peers(peer_count);
        self.refresh_local_publish().await;
    }

    fn on_rejected(&mut self, reason: RejectReason, now: Instant) {
        record_reconnect_attempt("rejected");
        warn!(
            target: "rtc.session",
            reason = ?reason,
            state = %self.state,
            "Server rejected the connection"
        );

        if self.state == ConnectionState::Joining {
            self.emit(EngineEvent::Error(reason.error_code()));
            self.drain();
            self.finish_session();
            return;
        }

        if reason.is_token_problem() {
            self.await_token();
        } else {
            self.emit(EngineEvent::Error(reason.error_code()));
            self.schedule_attempt(now);
        }
    }

    /// Stop retrying until the caller renews the token. Reports
    /// `TokenExpired` once per pause.
    fn await_token(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.token.mark_expired();
        let Some(retry) = session.retry.as_mut() else {
            return;
        };
        if retry.awaiting_token {
            return;
        }
        retry.awaiting_token = true;
        retry.abort();
        self.emit(EngineEvent::TokenExpired);
    }

    /// Leave Joined for a fresh retry sequence. With `token_expired` the
    /// sequence starts paused until the token is renewed.
    fn enter_reconnecting(&mut self, now: Instant, token_expired: bool) {
        self.generation += 1;
        if let Some(session) = self.session.as_mut() {
            session.retry = None;
            if token_expired {
                session.token.mark_expired();
                session
                    .begin_retry(
                        now,
                        self.config.reconnect_initial_backoff,
                        self.config.reconnect_max_backoff,
                    )
                    .awaiting_token = true;
            }
        }
        self.monitor.reset();
        self.quality_tx.send_replace(HashMap::new());
        self.transition(ConnectionState::Reconnecting);
        if token_expired {
            self.emit(EngineEvent::TokenExpired);
        }
        self.schedule_attempt(now);
    }

    fn enter_banned(&mut self) {
        warn!(target: "rtc.session", state = %self.state, "Banned from channel");
        self.drain();
        self.transition(ConnectionState::Banned);
        self.emit(EngineEvent::ConnectionBanned);
    }

    /// Release everything the session holds except the session itself:
    /// in-flight attempts, peers, data streams, quality and volume state.
    fn drain(&mut self) {
        self.generation += 1;
        if let Some(session) = self.session.as_mut() {
            session.retry = None;
            session.peers.clear();
        }
        let failed = self.outbound.close_all();
        self.report_undelivered(failed);
        self.inbound.clear();
        if let Some(volume) = self.volume.as_mut() {
            volume.clear();
        }
        self.monitor.reset();
        self.controller.clear_peers();
        if self.controller.reset_publish().is_some() {
            self.encoder.set_video_publishing(true);
        }
        self.quality_tx.send_replace(HashMap::new());
        set_remote_peers(0);
    }

    fn finish_session(&mut self) {
        if let Some(session) = self.session.take() {
            info!(
                target: "rtc.session",
                channel = %session.channel,
                call_id = %session.call_id,
                "Session ended"
            );
        }
        self.call_id_tx.send_replace(None);
        self.transition(ConnectionState::Idle);
    }

    fn stats(&self, now: Instant) -> ChannelStats {
        let Some(session) = self.session.as_ref() else {
            return ChannelStats::default();
        };
        let counters = self.transport.counters();
        ChannelStats {
            duration: session.duration(now),
            tx_bytes: counters.uplink.bytes,
            tx_packets: counters.uplink.packets,
            rx_bytes: counters.downlink.values().map(|c| c.bytes).sum(),
            rx_packets: counters.downlink.values().map(|c| c.packets).sum(),
            user_count: session.peers.len() + 1,
        }
    }

    // ------------------------------------------------------------------
    // Role, token, local media
    // ------------------------------------------------------------------

    async fn handle_set_role(&mut self, role: ClientRole) -> Result<(), EngineError> {
        if role == self.role {
            return Ok(());
        }
        match self.state {
            ConnectionState::Idle => {
                self.role = role;
                Ok(())
            }
            ConnectionState::Joined => {
                match self.transport.set_client_role(role).await {
                    Ok(()) => {}
                    Err(TransportError::Rejected(RejectReason::NotAuthorized)) => {
                        warn!(target: "rtc.session", role = role.as_str(), "Role switch not authorized");
                        self.emit(EngineEvent::Warning(WarningCode::SetClientRoleNotAuthorized));
                        return Err(EngineError::RoleNotAuthorized);
                    }
                    Err(e) => {
                        warn!(target: "rtc.session", role = role.as_str(), error = %e, "Role switch failed");
                        self.emit(EngineEvent::Warning(WarningCode::SetClientRoleTimeout));
                        return Err(EngineError::TimedOut);
                    }
                }

                let old = self.role;
                self.role = role;
                info!(
                    target: "rtc.session",
                    old = old.as_str(),
                    new = role.as_str(),
                    "Client role changed"
                );
                if role == ClientRole::Audience && self.controller.reset_publish().is_some() {
                    self.encoder.set_video_publishing(true);
                    self.emit(EngineEvent::PublishFallback { is_fallback: false });
                }
                self.refresh_local_publish().await;
                self.emit(EngineEvent::RoleChanged { old, new: role });
                Ok(())
            }
            state => Err(EngineError::InvalidState {
                operation: "set_client_role",
                state,
            }),
        }
    }

    /// Tell the transport what to publish: nothing as audience, the
    /// caller's own mute choices as broadcaster.
    async fn refresh_local_publish(&self) {
        if self.state != ConnectionState::Joined {
            return;
        }
        let (audio, video) = match self.role {
            ClientRole::Audience => (false, false),
            ClientRole::Broadcaster => (!self.local_audio_muted, !self.local_video_muted),
        };
        if let Err(e) = self.transport.set_local_publish(audio, video).await {
            warn!(target: "rtc.session", error = %e, "Failed to update local publishing");
        }
    }

    async fn handle_renew_token(
        &mut self,
        token: SecretString,
        now: Instant,
    ) -> Result<(), EngineError> {
        match self.state {
            ConnectionState::Joined => {
                let expires_at = self
                    .transport
                    .renew_token(token.clone())
                    .await
                    .map_err(|e| match e {
                        TransportError::Rejected(reason) if reason.is_token_problem() => {
                            EngineError::InvalidArgument("token rejected by server".to_string())
                        }
                        other => EngineError::Failed(other.to_string()),
                    })?;
                if let Some(session) = self.session.as_mut() {
                    session.token.renew(token);
                    session.token.set_expiry(expires_at, now);
                }
                info!(target: "rtc.session", "Token renewed");
                Ok(())
            }
            ConnectionState::Reconnecting => {
                if let Some(session) = self.session.as_mut() {
                    session.token.renew(token);
                    if let Some(retry) = session.retry.as_mut() {
                        retry.resume_now();
                    }
                }
                info!(target: "rtc.session", "Token renewed, reconnecting now");
                self.generation += 1;
                self.schedule_attempt(now);
                Ok(())
            }
            ConnectionState::Joining => {
                if let Some(session) = self.session.as_mut() {
                    session.token.renew(token);
                }
                Ok(())
            }
            ConnectionState::Idle | ConnectionState::Leaving | ConnectionState::Banned => {
                Err(EngineError::NotInChannel)
            }
        }
    }

    // ------------------------------------------------------------------
    // Data streams
    // ------------------------------------------------------------------

    fn require_session(&self, operation: &'static str) -> Result<(), EngineError> {
        if matches!(
            self.state,
            ConnectionState::Joined | ConnectionState::Reconnecting
        ) {
            Ok(())
        } else {
            debug!(target: "rtc.data", operation, state = %self.state, "No session for data operation");
            Err(EngineError::NotInChannel)
        }
    }

    async fn handle_send(
        &mut self,
        stream_id: DataStreamId,
        payload: Bytes,
        now: Instant,
    ) -> Result<u32, EngineError> {
        if self.state != ConnectionState::Joined {
            return Err(EngineError::NotInChannel);
        }
        if self.role == ClientRole::Audience {
            return Err(EngineError::RoleNotAuthorized);
        }

        let message = match self.outbound.prepare_send(stream_id, payload, now) {
            Ok(message) => message,
            Err(e) => {
                record_data_message("outbound", send_rejection_label(&e));
                return Err(e);
            }
        };
        let sequence = message.sequence;
        if let Err(e) = self.transport.send_data(message).await {
            // Reliable messages still time out through the ack path.
            warn!(target: "rtc.data", stream_id = %stream_id, sequence, error = %e, "Transport send failed");
        }
        record_data_message("outbound", "sent");
        Ok(sequence)
    }

    fn report_undelivered(&self, failed: Vec<UndeliveredMessage>) {
        for message in failed {
            record_data_message("outbound", "timed_out");
            self.emit(EngineEvent::DataMessageDeliveryFailed {
                stream_id: message.stream_id,
                sequence: message.sequence,
            });
        }
    }

    fn report_inbound(&self, items: Vec<Inbound>) {
        for item in items {
            match item {
                Inbound::Deliver {
                    uid,
                    stream_id,
                    payload,
                } => {
                    record_data_message("inbound", "delivered");
                    self.emit(EngineEvent::DataMessage {
                        uid,
                        stream_id,
                        payload,
                    });
                }
                Inbound::Failed {
                    uid,
                    stream_id,
                    missed,
                    cached,
                } => {
                    record_data_message("inbound", "timed_out");
                    self.emit(EngineEvent::DataMessageError {
                        uid,
                        stream_id,
                        error: ErrorCode::TimedOut,
                        missed,
                        cached,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Volume
    // ------------------------------------------------------------------

    fn handle_volume_indication(&mut self, interval_ms: i32, smooth: i32) -> Result<(), EngineError> {
        let smooth = u8::try_from(smooth)
            .ok()
            .filter(|s| *s <= MAX_SMOOTH)
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("smooth must be 0-{MAX_SMOOTH}, got {smooth}"))
            })?;

        if interval_ms <= 0 {
            debug!(target: "rtc.volume", "Volume indication disabled");
            self.volume = None;
            self.volume_tick = None;
            return Ok(());
        }

        let period = Duration::from_millis(u64::from(interval_ms.unsigned_abs()));
        debug!(target: "rtc.volume", interval_ms, smooth, "Volume indication enabled");
        self.volume = Some(VolumeAggregator::new(smooth));
        self.volume_tick = Some(periodic(period));
        Ok(())
    }

    fn handle_audio_frame(&mut self, uid: Uid, samples: &[i16]) {
        if self.state != ConnectionState::Joined {
            return;
        }
        let Some(volume) = self.volume.as_mut() else {
            return;
        };
        if uid.is_local() {
            if self.local_audio_muted || self.role == ClientRole::Audience {
                return;
            }
        } else if !self
            .session
            .as_ref()
            .is_some_and(|s| s.peers.contains(uid))
        {
            return;
        }
        volume.push_frame(uid, samples);
    }

    fn on_volume_tick(&mut self) {
        if self.state != ConnectionState::Joined {
            return;
        }
        let Some(volume) = self.volume.as_mut() else {
            return;
        };
        let round = volume.report();
        self.dispatcher.emit(EngineEvent::VolumeReport {
            speakers: round.speakers,
            total: round.total,
        });
        if let Some(uid) = round.active_speaker_changed {
            debug!(target: "rtc.volume", uid = %uid, "Active speaker changed");
            self.dispatcher.emit(EngineEvent::ActiveSpeaker(uid));
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    fn housekeeping(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Joined => {
                self.expire_silent_peers(now);
                self.check_token(now);
            }
            ConnectionState::Joining | ConnectionState::Reconnecting => {
                let window = self.config.connection_lost_window;
                let lost = self
                    .session
                    .as_mut()
                    .and_then(|s| s.retry.as_mut())
                    .is_some_and(|r| r.lost_window_elapsed(now, window));
                if lost {
                    warn!(
                        target: "rtc.session",
                        window_secs = window.as_secs(),
                        "Connection lost"
                    );
                    self.emit(EngineEvent::ConnectionLost);
                }
            }
            _ => {}
        }

        if matches!(
            self.state,
            ConnectionState::Joined | ConnectionState::Reconnecting
        ) {
            let failed = self.outbound.expire_unacked(now);
            self.report_undelivered(failed);
            let expired = self.inbound.expire(now);
            self.report_inbound(expired);
        }
    }

    fn expire_silent_peers(&mut self, now: Instant) {
        let timeout = self.config.peer_liveness_timeout;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let expired = session.peers.expire(now, timeout);
        if expired.is_empty() {
            return;
        }
        let remaining = session.peers.len();
        for uid in expired {
            info!(target: "rtc.session", uid = %uid, "Peer dropped after silence");
            self.forget_peer(uid, now);
            self.emit(EngineEvent::PeerLeft {
                uid,
                reason: OfflineReason::Dropped,
            });
        }
        set_remote_peers(remaining);
    }

    fn check_token(&mut self, now: Instant) {
        let lead = self.config.token_expiry_warning;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.token.check(now, lead) {
            TokenCheck::Nothing => {}
            TokenCheck::WillExpire(token) => {
                info!(target: "rtc.session", "Token will expire soon");
                self.emit(EngineEvent::TokenWillExpire(token));
            }
            TokenCheck::Expired => {
                warn!(target: "rtc.session", "Token expired");
                self.enter_reconnecting(now, true);
            }
        }
    }

    async fn on_quality_tick(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Joined => self.sample_quality(now).await,
            ConnectionState::Banned | ConnectionState::Leaving => {}
            _ if self.lastmile => {
                if let Some(probe) = self.transport.probe_counters() {
                    let grade = self.monitor.sample_lastmile(probe, now);
                    debug!(target: "rtc.quality", grade = %grade, "Last-mile sample");
                    self.emit(EngineEvent::LastmileQuality(grade));
                }
            }
            _ => {}
        }
    }

    async fn sample_quality(&mut self, now: Instant) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let peers = session.peers.uids();
        let counters = self.transport.counters();
        let round = self.monitor.evaluate(&counters, &peers, now);
        self.quality_tx.send_replace(self.monitor.snapshot());
        record_quality_sample(round.uplink.grade.as_str());

        for (uid, link) in round.reports() {
            self.emit(EngineEvent::QualityReport {
                uid,
                tx: link.tx,
                rx: link.rx,
            });
        }

        if self.role == ClientRole::Broadcaster {
            if let Some(is_fallback) = self.controller.evaluate_publish(round.uplink.grade) {
                info!(target: "rtc.quality", is_fallback, "Publish fallback");
                record_fallback_transition("publish", fallback_direction(is_fallback));
                self.encoder.set_video_publishing(!is_fallback);
                self.emit(EngineEvent::PublishFallback { is_fallback });
            }
        }

        let grades: Vec<(Uid, NetworkQuality)> = round
            .downlinks
            .iter()
            .map(|(uid, sample)| (*uid, sample.grade))
            .collect();
        for change in self.controller.evaluate_subscribe(&grades) {
            self.apply_subscribe_change(change).await;
        }

        self.emit(EngineEvent::RtcStats(self.stats(now)));
    }

    async fn apply_subscribe_change(&self, change: SubscribeChange) {
        if self.state != ConnectionState::Joined {
            return;
        }
        debug!(
            target: "rtc.quality",
            uid = %change.uid,
            from = ?change.from,
            to = ?change.to,
            "Subscribe level changed"
        );
        if let Err(e) = self.transport.set_remote_video(change.uid, change.to).await {
            warn!(target: "rtc.quality", uid = %change.uid, error = %e, "Failed to switch remote video");
        }
        if let Some(is_fallback) = change.fallback_toggle() {
            record_fallback_transition("subscribe", fallback_direction(is_fallback));
            self.emit(EngineEvent::SubscribeFallback {
                uid: change.uid,
                is_fallback,
            });
        }
        if let Some(layer) = change.layer_switch() {
            record_fallback_transition("subscribe", "layer");
            self.emit(EngineEvent::RemoteVideoLayerChanged {
                uid: change.uid,
                layer,
            });
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::ConnectionLost => {
                if self.state == ConnectionState::Joined {
                    warn!(target: "rtc.session", "Connection interrupted");
                    self.emit(EngineEvent::ConnectionInterrupted);
                    self.enter_reconnecting(now, false);
                }
            }
            TransportEvent::Banned => {
                if self.state.is_active() {
                    self.enter_banned();
                }
            }
            TransportEvent::TokenExpired => match self.state {
                ConnectionState::Joined => {
                    warn!(target: "rtc.session", "Server reports token expired");
                    self.enter_reconnecting(now, true);
                }
                ConnectionState::Reconnecting => self.await_token(),
                _ => {}
            },
            TransportEvent::DataAck {
                stream_id,
                sequence,
            } => {
                if !self.outbound.acknowledge(stream_id, sequence) {
                    debug!(target: "rtc.data", stream_id = %stream_id, sequence, "Ack for unknown message");
                }
            }
            peer_event if self.state == ConnectionState::Joined => {
                self.handle_peer_event(peer_event, now).await;
            }
            other => {
                debug!(target: "rtc.session", state = %self.state, event = ?other, "Ignoring peer event outside a joined session");
            }
        }
    }

    async fn handle_peer_event(&mut self, event: TransportEvent, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            TransportEvent::PeerJoined(snapshot) => {
                if !session.peers.observe(&snapshot, now) {
                    return;
                }
                let elapsed = now.duration_since(session.requested_at);
                let count = session.peers.len();
                self.controller
                    .register_peer(snapshot.uid, snapshot.dual_stream);
                info!(target: "rtc.session", uid = %snapshot.uid, "Peer joined");
                self.emit(EngineEvent::PeerJoined {
                    uid: snapshot.uid,
                    elapsed,
                });
                let replayed = self.inbound.peer_online(snapshot.uid, now);
                self.report_inbound(replayed);
                set_remote_peers(count);
            }
            TransportEvent::PeerLeft { uid, reason } => {
                if session.peers.remove(uid).is_none() {
                    return;
                }
                let count = session.peers.len();
                info!(target: "rtc.session", uid = %uid, reason = ?reason, "Peer left");
                self.forget_peer(uid, now);
                self.emit(EngineEvent::PeerLeft { uid, reason });
                set_remote_peers(count);
            }
            TransportEvent::PeerActivity { uid } => {
                session.peers.touch(uid, now);
            }
            TransportEvent::PeerAudioMuted { uid, muted } => {
                if let Some(peer) = session.peers.get_mut(uid) {
                    peer.last_seen = now;
                    if peer.audio_muted != muted {
                        peer.audio_muted = muted;
                        self.emit(EngineEvent::PeerAudioMuted { uid, muted });
                    }
                }
            }
            TransportEvent::PeerVideoMuted { uid, muted } => {
                if let Some(peer) = session.peers.get_mut(uid) {
                    peer.last_seen = now;
                    if peer.video_muted != muted {
                        peer.video_muted = muted;
                        self.emit(EngineEvent::PeerVideoMuted { uid, muted });
                    }
                }
            }
            TransportEvent::PeerVideoEnabled { uid, enabled } => {
                if let Some(peer) = session.peers.get_mut(uid) {
                    peer.last_seen = now;
                    if peer.video_enabled != enabled {
                        peer.video_enabled = enabled;
                        self.emit(EngineEvent::PeerVideoEnabled { uid, enabled });
                    }
                }
            }
            TransportEvent::PeerDualStream { uid, enabled } => {
                if let Some(peer) = session.peers.get_mut(uid) {
                    peer.last_seen = now;
                    peer.dual_stream = enabled;
                    if let Some(change) = self.controller.set_dual_stream(uid, enabled) {
                        self.apply_subscribe_change(change).await;
                    }
                }
            }
            TransportEvent::DataMessage(frame) => {
                session.peers.touch(frame.uid, now);
                let items = self.inbound.receive(frame, now);
                self.report_inbound(items);
            }
            TransportEvent::ConnectionLost
            | TransportEvent::Banned
            | TransportEvent::TokenExpired
            | TransportEvent::DataAck { .. } => {}
        }
    }

    /// Drop per-peer state outside the peer table.
    fn forget_peer(&mut self, uid: Uid, now: Instant) {
        self.controller.forget_peer(uid);
        self.monitor.forget(uid);
        if let Some(volume) = self.volume.as_mut() {
            volume.forget(uid);
        }
        let flushed = self.inbound.peer_offline(uid, now);
        self.report_inbound(flushed);
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn emit(&self, event: EngineEvent) {
        self.dispatcher.emit(event);
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!(target: "rtc.session", from = %from, to = %to, "Connection state changed");
        record_state_transition(from.as_str(), to.as_str());
        self.state = to;
        self.state_tx.send_replace(to);
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "rtc.actor.engine",
            state = %self.state,
            "Performing graceful shutdown"
        );
        // Nothing is reported once the caller has destroyed the engine.
        self.dispatcher.close();

        if let Some(leave) = self.leave.take() {
            debug!(target: "rtc.actor.engine", "Abandoning leave in progress");
            leave.task.abort();
        }

        let connected = self.state != ConnectionState::Idle;
        self.drain();
        if connected {
            match tokio::time::timeout(SHUTDOWN_DISCONNECT_TIMEOUT, self.transport.disconnect())
                .await
            {
                Ok(Ok(())) => {
                    debug!(target: "rtc.actor.engine", "Transport released");
                }
                Ok(Err(e)) => {
                    warn!(target: "rtc.actor.engine", error = %e, "Transport release failed");
                }
                Err(_) => {
                    warn!(target: "rtc.actor.engine", "Transport release timed out");
                }
            }
        }
        self.finish_session();

        info!(target: "rtc.actor.engine", "Graceful shutdown complete");
    }
}

fn fallback_direction(is_fallback: bool) -> &'static str {
    if is_fallback {
        "fallback"
    } else {
        "recover"
    }
}

fn send_rejection_label(error: &EngineError) -> &'static str {
    match error {
        EngineError::SizeTooLarge { .. } => "too_large",
        EngineError::TooOften => "too_often",
        EngineError::BitrateLimit => "bitrate_limit",
        _ => "rejected",
    }
}

/// Interval whose first tick is one period from now.
fn periodic(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick_opt(interval: &mut Option<Interval>) -> Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}

async fn recv_opt<T>(receiver: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
