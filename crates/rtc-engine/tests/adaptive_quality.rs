//! Network quality and stream fallback tests.
//!
//! Link conditions are simulated by moving the mock transport's cumulative
//! counters between quality ticks. Each tick ends with an `rtc_stats`
//! event, which the tests use as a barrier.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::Uid;
use rtc_engine::errors::EngineError;
use rtc_engine::events::EngineEvent;
use rtc_engine::quality::{FallbackPolicy, NetworkQuality, SubscribeLevel, VideoLayer};
use rtc_engine::session::{ClientRole, JoinRequest};
use rtc_engine::transport::PeerSnapshot;
use rtc_test_utils::{clean_link, link, MockTransport, TestEngine};

async fn tick(t: &TestEngine, n: usize) {
    t.sink.wait_for_nth("rtc_stats", n).await;
}

fn publish_fallbacks(t: &TestEngine) -> Vec<bool> {
    t.sink
        .named("publish_fallback")
        .into_iter()
        .map(|e| match e {
            EngineEvent::PublishFallback { is_fallback } => is_fallback,
            other => panic!("unexpected event {other:?}"),
        })
        .collect()
}

// ============================================================================
// Publish fallback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_publish_fallback_with_hysteresis() {
    let t = TestEngine::start();
    t.handle
        .set_local_publish_fallback_option(FallbackPolicy::AudioOnly)
        .await
        .unwrap();
    t.transport.set_uplink(link(100, 0, 20, 5));
    t.join("room1").await;

    // First sample only establishes the baseline.
    tick(&t, 1).await;
    assert_eq!(
        t.handle.network_quality(Uid::LOCAL).tx,
        NetworkQuality::Unknown
    );

    // ~23% loss, twice.
    t.transport.set_uplink(link(200, 30, 20, 5));
    tick(&t, 2).await;
    assert_eq!(t.handle.network_quality(Uid::LOCAL).tx, NetworkQuality::Bad);
    assert!(publish_fallbacks(&t).is_empty());

    t.transport.set_uplink(link(300, 60, 20, 5));
    tick(&t, 3).await;
    assert_eq!(publish_fallbacks(&t), vec![true]);
    assert!(!t.encoder.is_publishing_video());

    // Under 1% loss, twice.
    t.transport.set_uplink(link(400, 61, 20, 5));
    tick(&t, 4).await;
    assert_eq!(publish_fallbacks(&t), vec![true]);

    t.transport.set_uplink(link(500, 62, 20, 5));
    tick(&t, 5).await;
    assert_eq!(publish_fallbacks(&t), vec![true, false]);
    assert!(t.encoder.is_publishing_video());

    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_publish_fallback_disabled_by_default() {
    let t = TestEngine::start();
    t.transport.set_uplink(link(100, 0, 20, 5));
    t.join("room1").await;

    tick(&t, 1).await;
    for (n, packets) in [(2, 200), (3, 300), (4, 400)] {
        t.transport.set_uplink(link(packets, packets / 2, 20, 5));
        tick(&t, n).await;
    }

    assert!(publish_fallbacks(&t).is_empty());
    assert!(t.encoder.is_publishing_video());
    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_leaving_restores_publishing() {
    let t = TestEngine::start();
    t.handle
        .set_local_publish_fallback_option(FallbackPolicy::AudioOnly)
        .await
        .unwrap();
    t.transport.set_uplink(link(100, 0, 20, 5));
    t.join("room1").await;

    tick(&t, 1).await;
    t.transport.set_uplink(link(200, 50, 20, 5));
    tick(&t, 2).await;
    t.transport.set_uplink(link(300, 100, 20, 5));
    tick(&t, 3).await;
    assert!(!t.encoder.is_publishing_video());

    t.leave().await;
    assert!(t.encoder.is_publishing_video());
    assert_eq!(
        t.handle.network_quality(Uid::LOCAL).tx,
        NetworkQuality::Unknown
    );

    t.shutdown().await;
}

// ============================================================================
// Subscribe fallback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_subscribe_fallback_to_audio_only() {
    let peer = Uid(7);
    let t = TestEngine::builder()
        .transport(MockTransport::builder().with_peers(vec![PeerSnapshot::new(peer)]))
        .start();
    t.handle
        .set_remote_subscribe_fallback_option(FallbackPolicy::AudioOnly)
        .await
        .unwrap();
    t.transport.set_uplink(clean_link(100));
    t.transport.set_downlink(peer, link(100, 0, 20, 5));
    t.join("room1").await;
    tick(&t, 1).await;

    t.transport.set_uplink(clean_link(200));
    t.transport.set_downlink(peer, link(200, 40, 20, 5));
    tick(&t, 2).await;
    assert_eq!(t.sink.count("subscribe_fallback"), 0);
    assert_eq!(t.handle.network_quality(peer).rx, NetworkQuality::Bad);

    t.transport.set_uplink(clean_link(300));
    t.transport.set_downlink(peer, link(300, 80, 20, 5));
    tick(&t, 3).await;

    match t.sink.named("subscribe_fallback").as_slice() {
        [EngineEvent::SubscribeFallback { uid, is_fallback }] => {
            assert_eq!(*uid, peer);
            assert!(*is_fallback);
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(
        t.transport.remote_video_levels(peer),
        vec![SubscribeLevel::AudioOnly]
    );

    // The local row carries the worst downlink.
    assert_eq!(t.handle.network_quality(Uid::LOCAL).rx, NetworkQuality::Bad);

    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dual_stream_peer_drops_to_low_layer() {
    let peer = Uid(7);
    let t = TestEngine::builder()
        .transport(
            MockTransport::builder().with_peers(vec![PeerSnapshot::new(peer).with_dual_stream()]),
        )
        .start();
    t.handle
        .set_remote_subscribe_fallback_option(FallbackPolicy::VideoStreamLow)
        .await
        .unwrap();
    t.transport.set_downlink(peer, link(100, 0, 20, 5));
    t.join("room1").await;
    tick(&t, 1).await;

    // ~7% loss grades Poor: enough for the low layer, not for audio only.
    for (n, packets) in [(2, 200), (3, 300)] {
        t.transport
            .set_downlink(peer, link(packets, (packets / 100 - 1) * 7, 20, 5));
        tick(&t, n).await;
    }

    match t.sink.named("remote_video_layer_changed").as_slice() {
        [EngineEvent::RemoteVideoLayerChanged { uid, layer }] => {
            assert_eq!(*uid, peer);
            assert_eq!(*layer, VideoLayer::Low);
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(t.sink.count("subscribe_fallback"), 0);
    assert_eq!(
        t.transport.remote_video_levels(peer),
        vec![SubscribeLevel::Low]
    );

    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_caller_layer_preference_applies_immediately() {
    let peer = Uid(7);
    let t = TestEngine::builder()
        .transport(
            MockTransport::builder().with_peers(vec![PeerSnapshot::new(peer).with_dual_stream()]),
        )
        .start();
    t.join("room1").await;

    t.handle
        .set_remote_video_stream(peer, VideoLayer::Low)
        .await
        .unwrap();
    t.sink.wait_for("remote_video_layer_changed").await;
    assert_eq!(
        t.transport.remote_video_levels(peer),
        vec![SubscribeLevel::Low]
    );

    // An explicit preference wins over the default.
    t.handle
        .set_remote_default_video_stream_type(VideoLayer::High)
        .await
        .unwrap();
    assert_eq!(
        t.transport.remote_video_levels(peer),
        vec![SubscribeLevel::Low]
    );

    t.handle
        .set_remote_video_stream(peer, VideoLayer::High)
        .await
        .unwrap();
    assert_eq!(
        t.transport.remote_video_levels(peer),
        vec![SubscribeLevel::Low, SubscribeLevel::High]
    );

    t.shutdown().await;
}

// ============================================================================
// Last-mile probe
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lastmile_probe_before_join() {
    let t = TestEngine::start();
    t.transport.set_probe(Some(link(100, 0, 20, 5)));
    t.handle.enable_lastmile_test().await.unwrap();

    match t.sink.wait_for_nth("lastmile_quality", 1).await {
        EngineEvent::LastmileQuality(grade) => assert_eq!(grade, NetworkQuality::Unknown),
        other => panic!("unexpected event {other:?}"),
    }

    t.transport.set_probe(Some(link(200, 0, 20, 5)));
    match t.sink.wait_for_nth("lastmile_quality", 2).await {
        EngineEvent::LastmileQuality(grade) => assert_eq!(grade, NetworkQuality::Excellent),
        other => panic!("unexpected event {other:?}"),
    }

    t.handle.disable_lastmile_test().await.unwrap();
    let reported = t.sink.count("lastmile_quality");
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    assert_eq!(t.sink.count("lastmile_quality"), reported);

    t.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lastmile_refused_while_broadcasting() {
    let t = TestEngine::start();
    t.join("room1").await;
    assert!(matches!(
        t.handle.enable_lastmile_test().await,
        Err(EngineError::NotSupported(_))
    ));
    t.leave().await;

    t.handle
        .set_client_role(ClientRole::Audience)
        .await
        .unwrap();
    t.join_with(JoinRequest::new("room1")).await;
    t.handle.enable_lastmile_test().await.unwrap();

    t.shutdown().await;
}

// ============================================================================
// Reports
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_quality_report_rows() {
    let peer = Uid(7);
    let t = TestEngine::builder()
        .transport(MockTransport::builder().with_peers(vec![PeerSnapshot::new(peer)]))
        .start();
    t.transport.set_uplink(clean_link(100));
    t.transport.set_downlink(peer, clean_link(100));
    t.join("room1").await;
    tick(&t, 1).await;

    t.transport.set_uplink(clean_link(200));
    t.transport.set_downlink(peer, clean_link(200));
    tick(&t, 2).await;

    let rows: Vec<(Uid, NetworkQuality, NetworkQuality)> = t
        .sink
        .named("quality_report")
        .into_iter()
        .map(|e| match e {
            EngineEvent::QualityReport { uid, tx, rx } => (uid, tx, rx),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();

    // Two rows per tick, local first.
    assert_eq!(rows.len(), 4);
    assert_eq!(
        rows.get(2),
        Some(&(Uid::LOCAL, NetworkQuality::Excellent, NetworkQuality::Excellent))
    );
    assert_eq!(
        rows.get(3),
        Some(&(peer, NetworkQuality::Unknown, NetworkQuality::Excellent))
    );

    t.shutdown().await;
}
