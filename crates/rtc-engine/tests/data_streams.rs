//! Data stream tests: limits, reliable delivery, and inbound ordering.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use common::types::{DataStreamId, Uid};
use rtc_engine::errors::EngineError;
use rtc_engine::events::EngineEvent;
use rtc_engine::session::{ClientRole, OfflineReason};
use rtc_engine::transport::{InboundData, PeerSnapshot, TransportEvent};
use rtc_test_utils::{MockTransport, TestEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const PEER: Uid = Uid(7);

fn frame(stream: u16, sequence: u32, ordered: bool, payload: &'static str) -> TransportEvent {
    TransportEvent::DataMessage(InboundData {
        uid: PEER,
        stream_id: DataStreamId(stream),
        sequence,
        reliable: ordered,
        ordered,
        payload: Bytes::from_static(payload.as_bytes()),
    })
}

fn payloads(t: &TestEngine) -> Vec<Bytes> {
    t.sink
        .named("data_message")
        .into_iter()
        .map(|e| match e {
            EngineEvent::DataMessage { payload, .. } => payload,
            other => panic!("unexpected event {other:?}"),
        })
        .collect()
}

async fn joined_with_peer() -> TestEngine {
    let t = TestEngine::builder()
        .transport(MockTransport::builder().with_peers(vec![PeerSnapshot::new(PEER)]))
        .start();
    t.join("room1").await;
    t
}

// ============================================================================
// Stream lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stream_operations_need_a_session() {
    let t = TestEngine::start();
    assert!(matches!(
        t.handle.create_data_stream(1u16, true, true).await,
        Err(EngineError::NotInChannel)
    ));
    assert!(matches!(
        t.handle.send_stream_message(1u16, "hi").await,
        Err(EngineError::NotInChannel)
    ));
    assert!(matches!(
        t.handle.close_data_stream(1u16).await,
        Err(EngineError::NotInChannel)
    ));
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_open_limits() {
    let t = TestEngine::start();
    t.join("room1").await;

    assert!(matches!(
        t.handle.create_data_stream(1u16, true, false).await,
        Err(EngineError::InvalidArgument(_))
    ));

    for id in 1..=5u16 {
        t.handle.create_data_stream(id, false, false).await.unwrap();
    }
    assert!(matches!(
        t.handle.create_data_stream(1u16, false, false).await,
        Err(EngineError::AlreadyInUse(_))
    ));
    assert!(matches!(
        t.handle.create_data_stream(6u16, false, false).await,
        Err(EngineError::TooManyDataStreams { max: 5 })
    ));

    t.handle.close_data_stream(5u16).await.unwrap();
    t.handle.create_data_stream(6u16, false, false).await.unwrap();

    assert!(matches!(
        t.handle.close_data_stream(5u16).await,
        Err(EngineError::InvalidArgument(_))
    ));

    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_streams_close_when_leaving() {
    let t = TestEngine::start();
    t.join("room1").await;
    t.handle.create_data_stream(1u16, false, false).await.unwrap();
    t.leave().await;

    t.join("room1").await;
    // Same id is free again in the new session.
    t.handle.create_data_stream(1u16, false, false).await.unwrap();
    t.shutdown().await;
}

// ============================================================================
// Sending
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_message_rate_limit() {
    let t = TestEngine::start();
    t.join("room1").await;
    t.handle.create_data_stream(1u16, false, false).await.unwrap();

    for expected in 0..30u32 {
        let sequence = t.handle.send_stream_message(1u16, "tick").await.unwrap();
        assert_eq!(sequence, expected);
    }
    assert!(matches!(
        t.handle.send_stream_message(1u16, "tick").await,
        Err(EngineError::TooOften)
    ));
    assert_eq!(t.transport.sent_data().len(), 30);

    // The window slides: a second later there is room again.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        t.handle.send_stream_message(1u16, "tick").await.unwrap(),
        30
    );

    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_size_and_bitrate_limits() {
    let t = TestEngine::start();
    t.join("room1").await;
    t.handle.create_data_stream(1u16, false, false).await.unwrap();

    assert!(matches!(
        t.handle.send_stream_message(1u16, vec![0u8; 1025]).await,
        Err(EngineError::SizeTooLarge {
            size: 1025,
            max: 1024
        })
    ));

    for _ in 0..6 {
        t.handle
            .send_stream_message(1u16, vec![0u8; 1000])
            .await
            .unwrap();
    }
    assert!(matches!(
        t.handle.send_stream_message(1u16, vec![0u8; 1000]).await,
        Err(EngineError::BitrateLimit)
    ));
    // Smaller messages still fit under the byte budget.
    t.handle
        .send_stream_message(1u16, vec![0u8; 100])
        .await
        .unwrap();

    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_audience_cannot_send() {
    let t = TestEngine::start();
    t.handle.set_client_role(ClientRole::Audience).await.unwrap();
    t.join("room1").await;
    t.handle.create_data_stream(1u16, false, false).await.unwrap();

    assert!(matches!(
        t.handle.send_stream_message(1u16, "hi").await,
        Err(EngineError::RoleNotAuthorized)
    ));
    assert!(t.transport.sent_data().is_empty());
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sent_message_carries_stream_flags() {
    let t = TestEngine::start();
    t.join("room1").await;
    t.handle.create_data_stream(3u16, true, true).await.unwrap();
    t.handle.send_stream_message(3u16, "hello").await.unwrap();

    let sent = t.transport.sent_data();
    let [message] = sent.as_slice() else {
        panic!("expected one message, got {sent:?}");
    };
    assert_eq!(message.stream_id, DataStreamId(3));
    assert_eq!(message.sequence, 0);
    assert!(message.reliable);
    assert!(message.ordered);
    assert_eq!(message.payload, Bytes::from_static(b"hello"));

    t.shutdown().await;
}

// ============================================================================
// Reliable delivery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_message_fails_after_timeout() {
    let t = TestEngine::start();
    t.join("room1").await;
    t.handle.create_data_stream(1u16, true, true).await.unwrap();

    let sent_at = Instant::now();
    let acked = t.handle.send_stream_message(1u16, "one").await.unwrap();
    let lost = t.handle.send_stream_message(1u16, "two").await.unwrap();
    t.transport.inject(TransportEvent::DataAck {
        stream_id: DataStreamId(1),
        sequence: acked,
    });

    match t.sink.wait_for("data_message_delivery_failed").await {
        EngineEvent::DataMessageDeliveryFailed {
            stream_id,
            sequence,
        } => {
            assert_eq!(stream_id, DataStreamId(1));
            assert_eq!(sequence, lost);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(sent_at.elapsed() >= Duration::from_secs(5));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(t.sink.count("data_message_delivery_failed"), 1);

    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreliable_messages_are_never_reported() {
    let t = TestEngine::start();
    t.join("room1").await;
    t.handle.create_data_stream(1u16, false, false).await.unwrap();
    t.handle.send_stream_message(1u16, "fire").await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(t.sink.count("data_message_delivery_failed"), 0);
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_closing_stream_fails_pending_messages() {
    let t = TestEngine::start();
    t.join("room1").await;
    t.handle.create_data_stream(1u16, true, true).await.unwrap();
    t.handle.send_stream_message(1u16, "a").await.unwrap();
    t.handle.send_stream_message(1u16, "b").await.unwrap();

    t.handle.close_data_stream(1u16).await.unwrap();

    let failed: Vec<u32> = t
        .sink
        .wait_until(|events| {
            let sequences: Vec<u32> = events
                .iter()
                .filter_map(|e| match e {
                    EngineEvent::DataMessageDeliveryFailed { sequence, .. } => Some(*sequence),
                    _ => None,
                })
                .collect();
            (sequences.len() == 2).then_some(sequences)
        })
        .await
        .expect("two delivery failures");
    assert_eq!(failed, vec![0, 1]);

    t.shutdown().await;
}

// ============================================================================
// Receiving
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_inbound_message_delivered() {
    let t = joined_with_peer().await;
    t.transport.inject(frame(2, 0, false, "ping"));

    match t.sink.wait_for("data_message").await {
        EngineEvent::DataMessage {
            uid,
            stream_id,
            payload,
        } => {
            assert_eq!(uid, PEER);
            assert_eq!(stream_id, DataStreamId(2));
            assert_eq!(payload, Bytes::from_static(b"ping"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ordered_stream_reorders_and_skips_gaps() {
    let t = joined_with_peer().await;

    t.transport.inject(frame(3, 0, true, "a"));
    t.transport.inject(frame(3, 2, true, "c"));
    t.transport.inject(frame(3, 3, true, "d"));
    t.sink.wait_for("data_message").await;
    tokio::task::yield_now().await;
    assert_eq!(payloads(&t), vec![Bytes::from_static(b"a")]);

    let started = Instant::now();
    match t.sink.wait_for("data_message_error").await {
        EngineEvent::DataMessageError {
            uid,
            stream_id,
            missed,
            cached,
            ..
        } => {
            assert_eq!(uid, PEER);
            assert_eq!(stream_id, DataStreamId(3));
            assert_eq!(missed, 1);
            assert_eq!(cached, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_secs(4));

    t.sink.wait_for_nth("data_message", 3).await;
    assert_eq!(
        payloads(&t),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"c"),
            Bytes::from_static(b"d"),
        ]
    );
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_arrival_fills_gap() {
    let t = joined_with_peer().await;

    t.transport.inject(frame(3, 0, true, "a"));
    t.transport.inject(frame(3, 2, true, "c"));
    t.transport.inject(frame(3, 1, true, "b"));

    t.sink.wait_for_nth("data_message", 3).await;
    assert_eq!(
        payloads(&t),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ]
    );
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(t.sink.count("data_message_error"), 0);
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_messages_from_departed_peer_replay_on_return() {
    let t = joined_with_peer().await;

    t.transport.inject(TransportEvent::PeerLeft {
        uid: PEER,
        reason: OfflineReason::Quit,
    });
    t.sink.wait_for("peer_left").await;

    // Cached while the peer is away.
    t.transport.inject(frame(2, 0, false, "late"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(t.sink.count("data_message"), 0);

    t.transport
        .inject(TransportEvent::PeerJoined(PeerSnapshot::new(PEER)));
    t.sink.wait_for("data_message").await;
    assert_eq!(payloads(&t), vec![Bytes::from_static(b"late")]);
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_messages_from_vanished_peer_reported_after_timeout() {
    let t = joined_with_peer().await;

    t.transport.inject(TransportEvent::PeerLeft {
        uid: PEER,
        reason: OfflineReason::Dropped,
    });
    t.sink.wait_for("peer_left").await;
    t.transport.inject(frame(4, 0, false, "x"));
    t.transport.inject(frame(4, 1, false, "y"));

    match t.sink.wait_for("data_message_error").await {
        EngineEvent::DataMessageError {
            uid,
            stream_id,
            missed,
            cached,
            ..
        } => {
            assert_eq!(uid, PEER);
            assert_eq!(stream_id, DataStreamId(4));
            assert_eq!(missed, 0);
            assert_eq!(cached, 2);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(t.sink.count("data_message"), 0);
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejoined_peer_streams_start_over() {
    let t = joined_with_peer().await;
    for (seq, payload) in [(0, "a"), (1, "b"), (2, "c")] {
        t.transport.inject(frame(3, seq, true, payload));
    }
    t.sink.wait_for_nth("data_message", 3).await;

    t.transport.inject(TransportEvent::PeerLeft {
        uid: PEER,
        reason: OfflineReason::Quit,
    });
    t.sink.wait_for("peer_left").await;

    // The new session's first message races the join notice.
    t.transport.inject(frame(3, 0, true, "x"));
    tokio::time::sleep(Duration::from_secs(2)).await;
    t.transport
        .inject(TransportEvent::PeerJoined(PeerSnapshot::new(PEER)));
    t.sink.wait_for_nth("data_message", 4).await;

    t.transport.inject(frame(3, 1, true, "y"));
    t.sink.wait_for_nth("data_message", 5).await;
    assert_eq!(
        payloads(&t),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
            Bytes::from_static(b"x"),
            Bytes::from_static(b"y"),
        ]
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(t.sink.count("data_message_error"), 0);
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_peer_stream_delivered_in_send_order() {
    let t = TestEngine::start();
    t.join("room1").await;
    t.transport
        .inject(TransportEvent::PeerJoined(PeerSnapshot::new(PEER)));
    t.sink.wait_for("peer_joined").await;

    t.transport.inject(frame(3, 1, true, "second"));
    t.transport.inject(frame(3, 0, true, "first"));
    t.sink.wait_for_nth("data_message", 2).await;
    assert_eq!(
        payloads(&t),
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_message_before_stream_baseline_is_reported() {
    let t = joined_with_peer().await;

    // The peer was already streaming when we joined.
    t.transport.inject(frame(3, 1, true, "second"));
    t.transport.inject(frame(3, 0, true, "first"));

    match t.sink.wait_for("data_message_error").await {
        EngineEvent::DataMessageError {
            uid,
            stream_id,
            missed,
            cached,
            ..
        } => {
            assert_eq!(uid, PEER);
            assert_eq!(stream_id, DataStreamId(3));
            assert_eq!(missed, 1);
            assert_eq!(cached, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(payloads(&t), vec![Bytes::from_static(b"second")]);
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_destroy_reports_nothing_for_pending_messages() {
    let t = TestEngine::start();
    t.join("room1").await;
    t.handle.create_data_stream(1u16, true, true).await.unwrap();
    t.handle.send_stream_message(1u16, "unacked").await.unwrap();

    let sink = Arc::clone(&t.sink);
    t.shutdown().await;
    assert_eq!(sink.count("data_message_delivery_failed"), 0);
}
