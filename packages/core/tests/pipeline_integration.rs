//! End-to-end tests driving the in-memory bus, call registry, ASR worker and
//! transcript fan-out together, the way [`agent_assist_core::bootstrap_services`]
//! wires them but against a scripted vendor so each test is self-contained and
//! fast.

use std::sync::Arc;
use std::time::Duration;

use agent_assist_core::asr::mock_vendor::MockVendorFactory;
use agent_assist_core::asr::vendor::{VendorErrorKind, VendorEvent};
use agent_assist_core::bus::InMemoryBus;
use agent_assist_core::registry::InMemoryCallRegistry;
use agent_assist_core::{
    AsrWorker, AudioEncoding, AudioFrame, CallMetadata, CallRegistry, CoreConfig, MessageBus,
    TranscriptFanout,
};
use agent_assist_core::events::SseEvent;
use agent_assist_core::protocol_constants::AUDIO_TOPIC;
use tokio_util::sync::CancellationToken;

fn test_config() -> CoreConfig {
    CoreConfig {
        buffer_window_ms: 20,
        idle_teardown_ms: 5_000,
        discovery_interval_ms: 20,
        subscription_grace_period_secs: 0,
        sse_client_queue_capacity: 4,
        ..Default::default()
    }
}

fn metadata() -> CallMetadata {
    CallMetadata {
        tenant_id: "tenant-1".into(),
        from: "+15550001111".into(),
        to: "+15552229999".into(),
        sample_rate_hz: 8_000,
        encoding: AudioEncoding::Pcm16,
    }
}

fn loud_frame(call_id: &str, seq: u64) -> AudioFrame {
    let samples: Vec<i16> = (0..160).map(|i| if i % 2 == 0 { 12_000 } else { -12_000 }).collect();
    let audio: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    AudioFrame {
        tenant_id: "tenant-1".into(),
        interaction_id: call_id.into(),
        seq,
        timestamp_ms: 0,
        sample_rate_hz: 8_000,
        encoding: AudioEncoding::Pcm16,
        audio,
    }
}

fn silent_frame(call_id: &str, seq: u64) -> AudioFrame {
    AudioFrame {
        tenant_id: "tenant-1".into(),
        interaction_id: call_id.into(),
        seq,
        timestamp_ms: 0,
        sample_rate_hz: 8_000,
        encoding: AudioEncoding::Pcm16,
        audio: vec![0u8; 320],
    }
}

async fn publish_audio(bus: &Arc<dyn MessageBus>, frame: &AudioFrame) {
    bus.publish(AUDIO_TOPIC, serde_json::to_vec(frame).unwrap())
        .await
        .unwrap();
}

/// Scenario A: audio published for a registered call reaches a transcript and
/// is routed to a browser client's SSE queue, and the vendor sees exactly one
/// connection for the call.
#[tokio::test]
async fn happy_path_audio_reaches_sse_client_as_transcript() {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(100, 5));
    let registry: Arc<dyn CallRegistry> = Arc::new(InMemoryCallRegistry::new(3600, 300));
    let vendor_factory = Arc::new(MockVendorFactory::new());
    vendor_factory.script_for(
        "call-happy",
        vec![VendorEvent::Transcript {
            text: "hello, how can I help you".into(),
            is_final: true,
            confidence: Some(0.95),
        }],
    );
    let config = test_config();
    let cancel = CancellationToken::new();

    let asr_worker = AsrWorker::new(bus.clone(), vendor_factory.clone(), &config, "asr-1", cancel.child_token());
    tokio::spawn(Arc::clone(&asr_worker).run());

    let fanout = TranscriptFanout::new(bus.clone(), registry.clone(), &config, "fanout-1", cancel.child_token());
    tokio::spawn(Arc::clone(&fanout).run());

    registry.register("call-happy", metadata()).await.unwrap();

    let (client_id, mut rx) = fanout.register_client("call-happy");
    let connected = rx.recv().await.unwrap();
    assert!(matches!(connected, SseEvent::Connected(_)));

    publish_audio(&bus, &loud_frame("call-happy", 1)).await;

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("transcript should arrive before timeout")
        .unwrap();
    match event {
        SseEvent::TranscriptLine(line) => {
            assert_eq!(line.text, "hello, how can I help you");
            assert_eq!(line.kind, "final");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert_eq!(vendor_factory.connect_count("call-happy"), 1);
    fanout.remove_client("call-happy", &client_id);
    cancel.cancel();
}

/// Scenario B: a call that only ever sends silent audio never opens a vendor
/// connection.
#[tokio::test]
async fn silence_suppression_never_opens_vendor_connection() {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(100, 5));
    let vendor_factory = Arc::new(MockVendorFactory::new());
    let config = test_config();
    let cancel = CancellationToken::new();

    let asr_worker = AsrWorker::new(bus.clone(), vendor_factory.clone(), &config, "asr-1", cancel.child_token());
    tokio::spawn(Arc::clone(&asr_worker).run());

    for seq in 1..=5u64 {
        publish_audio(&bus, &silent_frame("call-quiet", seq)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(vendor_factory.total_connects(), 0);
    assert_eq!(asr_worker.metrics.chunks_sent.load(std::sync::atomic::Ordering::SeqCst), 0);
    cancel.cancel();
}

/// Scenario C: a vendor error forces the connection closed; the worker
/// reconnects on the next flush rather than giving up on the call.
#[tokio::test]
async fn vendor_error_triggers_reconnect_on_next_flush() {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(100, 5));
    let vendor_factory = Arc::new(MockVendorFactory::new());
    vendor_factory.script_for("call-flaky", vec![VendorEvent::Error(VendorErrorKind::Other)]);
    let config = test_config();
    let cancel = CancellationToken::new();

    let asr_worker = AsrWorker::new(bus.clone(), vendor_factory.clone(), &config, "asr-1", cancel.child_token());
    tokio::spawn(Arc::clone(&asr_worker).run());

    for seq in 1..=10u64 {
        publish_audio(&bus, &loud_frame("call-flaky", seq)).await;
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if vendor_factory.connect_count("call-flaky") >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("worker should reconnect after the scripted vendor error");

    assert!(
        asr_worker
            .metrics
            .connections_created
            .load(std::sync::atomic::Ordering::SeqCst)
            >= 2
    );
    cancel.cancel();
}

/// Scenario D: the fan-out discovery loop picks up a call registered before
/// any client connects, with no explicit subscribe call from the test.
#[tokio::test]
async fn fanout_discovers_registered_call_without_explicit_subscribe() {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(100, 5));
    let registry: Arc<dyn CallRegistry> = Arc::new(InMemoryCallRegistry::new(3600, 300));
    registry.register("call-discovered", metadata()).await.unwrap();

    let config = test_config();
    let cancel = CancellationToken::new();
    let fanout = TranscriptFanout::new(bus.clone(), registry, &config, "fanout-1", cancel.child_token());
    tokio::spawn(Arc::clone(&fanout).run());

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if fanout.status().subscription_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("discovery loop should pick up the registered call");

    let transcript = agent_assist_core::Transcript {
        interaction_id: "call-discovered".into(),
        tenant_id: "tenant-1".into(),
        seq: 1,
        kind: agent_assist_core::TranscriptType::Final,
        text: "good afternoon".into(),
        confidence: None,
        timestamp_ms: 0,
    };
    bus.publish(
        "transcript.call-discovered",
        serde_json::to_vec(&transcript).unwrap(),
    )
    .await
    .unwrap();

    let (_client_id, mut rx) = fanout.register_client("call-discovered");
    let _connected = rx.recv().await.unwrap();
    // The client attached after the transcript above was routed (no client
    // was subscribed yet), so it only observes transcripts published after it
    // joins — live-tail semantics, not history replay.
    let followup = agent_assist_core::Transcript {
        seq: 2,
        text: "anything else today".into(),
        ..transcript
    };
    bus.publish(
        "transcript.call-discovered",
        serde_json::to_vec(&followup).unwrap(),
    )
    .await
    .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        SseEvent::TranscriptLine(line) => assert_eq!(line.text, "anything else today"),
        other => panic!("unexpected event: {other:?}"),
    }
    cancel.cancel();
}

/// Scenario E: a slow SSE client is disconnected once its bounded queue fills,
/// without affecting a second client on the same call.
#[tokio::test]
async fn slow_sse_client_is_dropped_without_affecting_fast_client() {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(100, 5));
    let registry: Arc<dyn CallRegistry> = Arc::new(InMemoryCallRegistry::new(3600, 300));
    let config = test_config();
    let cancel = CancellationToken::new();
    let fanout = TranscriptFanout::new(bus.clone(), registry, &config, "fanout-1", cancel.child_token());

    let (_slow_id, mut slow_rx) = fanout.register_client("call-busy");
    let (_fast_id, mut fast_rx) = fanout.register_client("call-busy");
    let _ = slow_rx.recv().await;
    let _ = fast_rx.recv().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    for seq in 1..=10u64 {
        let transcript = agent_assist_core::Transcript {
            interaction_id: "call-busy".into(),
            tenant_id: "tenant-1".into(),
            seq,
            kind: agent_assist_core::TranscriptType::Partial,
            text: format!("partial line {seq}"),
            confidence: None,
            timestamp_ms: 0,
        };
        bus.publish("transcript.call-busy", serde_json::to_vec(&transcript).unwrap())
            .await
            .unwrap();
        let _ = fast_rx.try_recv();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        fanout
            .metrics
            .clients_disconnected_slow
            .load(std::sync::atomic::Ordering::SeqCst)
            >= 1
    );
    cancel.cancel();
}

/// Scenario F: a consumer group that resumes after a simulated restart (a
/// fresh subscription under the same group name) can reclaim a message that
/// was delivered but never acked, i.e. consumers must tolerate duplicates.
#[tokio::test]
async fn bus_group_redelivers_unacked_message_after_restart() {
    let bus = InMemoryBus::new(100, 5);
    let mut first_run = bus.subscribe("transcript.call-restart", "fanout-group", "consumer-a").await.unwrap();
    bus.publish("transcript.call-restart", b"never acked".to_vec())
        .await
        .unwrap();
    let delivered = first_run.recv().await.unwrap().unwrap();
    assert_eq!(delivered.payload, b"never acked");
    // Simulate the process crashing before it could ack: drop the handle
    // without calling `ack`.
    drop(first_run);

    let mut after_restart = bus.subscribe("transcript.call-restart", "fanout-group", "consumer-b").await.unwrap();
    let reclaimed = after_restart.reclaim(0).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].message_id, delivered.message_id);
}
