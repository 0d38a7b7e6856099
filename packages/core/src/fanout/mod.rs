//! Transcript Fan-out: discovers active calls, subscribes to their transcript
//! topics, and routes each transcript line to the browser-facing SSE clients
//! for that call.
//!
//! Two maps make up the component's state (`§4.5`): [`subscriptions`] (one
//! bus subscription task per call with a dedicated transcript topic) and
//! [`clients`] (the browser-facing routing table). Each is guarded by its own
//! `DashMap` shard locks rather than one coarse mutex, matching the "guarded
//! only for insertion/removal" resource model — message routing never takes
//! a lock across a `.await`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, Transcript, TranscriptType};
use crate::config::CoreConfig;
use crate::events::{ConnectedPayload, SseEvent, TranscriptLinePayload};
use crate::protocol_constants::{FANOUT_CONSUMER_GROUP, TRANSCRIPT_TOPIC_PREFIX};
use crate::registry::CallRegistry;
use crate::utils::now_millis;

/// Per-call subscription bookkeeping.
struct SubscriptionState {
    cancel: CancellationToken,
    transcript_count: AtomicU64,
    /// 0 while the call is still reported active by the registry; otherwise
    /// the timestamp the call first dropped out of `list_active`, used to
    /// enforce the grace period for subscriptions with live clients.
    missing_since_ms: AtomicU64,
}

/// A connected browser client's outbound queue, filtered to one `call_id`.
struct ClientState {
    tx: mpsc::Sender<SseEvent>,
    #[allow(dead_code)]
    connected_at_ms: u64,
}

/// One row of `/transcripts/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    pub interaction_id: String,
    pub transcript_count: u64,
}

/// Body of `/transcripts/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutStatus {
    pub is_running: bool,
    pub subscription_count: usize,
    pub subscriptions: Vec<SubscriptionStatus>,
}

/// Discovers active calls via the [`CallRegistry`] and fans transcripts out
/// to per-call SSE client sets.
pub struct TranscriptFanout {
    bus: Arc<dyn MessageBus>,
    registry: Arc<dyn CallRegistry>,
    consumer_name: String,
    discovery_interval_ms: u64,
    discovery_list_limit: usize,
    grace_period_ms: u64,
    client_queue_capacity: usize,
    subscriptions: DashMap<String, SubscriptionState>,
    clients: DashMap<String, DashMap<String, ClientState>>,
    next_client_id: AtomicU64,
    running: AtomicBool,
    cancel: CancellationToken,
    pub metrics: Arc<FanoutMetrics>,
}

/// Counters surfaced for `/health`.
#[derive(Default)]
pub struct FanoutMetrics {
    pub clients_disconnected_slow: AtomicU64,
    pub transcripts_routed: AtomicU64,
}

impl TranscriptFanout {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn CallRegistry>,
        config: &CoreConfig,
        consumer_name: impl Into<String>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            registry,
            consumer_name: consumer_name.into(),
            discovery_interval_ms: config.discovery_interval_ms,
            discovery_list_limit: config.discovery_list_limit,
            grace_period_ms: config.subscription_grace_period_secs * 1000,
            client_queue_capacity: config.sse_client_queue_capacity,
            subscriptions: DashMap::new(),
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            cancel,
            metrics: Arc::new(FanoutMetrics::default()),
        })
    }

    /// Runs the periodic discovery loop until cancelled. Intended to be
    /// spawned once by the composition root.
    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut ticker = tokio::time::interval(Duration::from_millis(self.discovery_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.clone().discover().await,
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn discover(self: &Arc<Self>) {
        let active = match self.registry.list_active(self.discovery_list_limit).await {
            Ok(calls) => calls,
            Err(err) => {
                // Registry unavailable is advisory: on-demand subscriptions
                // triggered by client connects still work.
                tracing::warn!(error = %err, "fan-out discovery: registry unavailable");
                return;
            }
        };
        let active_ids: std::collections::HashSet<String> =
            active.into_iter().map(|c| c.interaction_id).collect();

        for interaction_id in &active_ids {
            if !self.subscriptions.contains_key(interaction_id) {
                self.clone().subscribe_call(interaction_id.clone());
            }
        }

        let now = now_millis();
        let known: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for interaction_id in known {
            if active_ids.contains(&interaction_id) {
                if let Some(state) = self.subscriptions.get(&interaction_id) {
                    state.missing_since_ms.store(0, Ordering::SeqCst);
                }
                continue;
            }

            let has_clients = self
                .clients
                .get(&interaction_id)
                .map(|m| !m.is_empty())
                .unwrap_or(false);

            let should_remove = match self.subscriptions.get(&interaction_id) {
                Some(state) => {
                    let missing_since = state.missing_since_ms.load(Ordering::SeqCst);
                    let missing_since = if missing_since == 0 {
                        state.missing_since_ms.store(now, Ordering::SeqCst);
                        now
                    } else {
                        missing_since
                    };
                    !has_clients || now.saturating_sub(missing_since) >= self.grace_period_ms
                }
                None => true,
            };

            if should_remove {
                self.unsubscribe_call(&interaction_id);
            }
        }
    }

    /// Ensures a bus subscription exists for `interaction_id`, spawning one
    /// immediately if it does not. Called both by discovery and by an
    /// on-demand SSE client connect for an as-yet-undiscovered call.
    fn subscribe_call(self: Arc<Self>, interaction_id: String) {
        let state = SubscriptionState {
            cancel: self.cancel.child_token(),
            transcript_count: AtomicU64::new(0),
            missing_since_ms: AtomicU64::new(0),
        };
        let cancel = state.cancel.clone();
        self.subscriptions.insert(interaction_id.clone(), state);

        let fanout = Arc::clone(&self);
        let consumer_name = self.consumer_name.clone();
        tokio::spawn(async move {
            let topic = format!("{TRANSCRIPT_TOPIC_PREFIX}{interaction_id}");
            let mut subscription = loop {
                if cancel.is_cancelled() {
                    return;
                }
                match fanout
                    .bus
                    .subscribe(&topic, FANOUT_CONSUMER_GROUP, &consumer_name)
                    .await
                {
                    Ok(sub) => break sub,
                    Err(err) => {
                        tracing::warn!(call = %interaction_id, error = %err, "fan-out subscribe failed, retrying");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            };

            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = subscription.recv() => result,
                };

                match delivery {
                    Ok(Some(delivery)) => {
                        if let Ok(transcript) = serde_json::from_slice::<Transcript>(&delivery.payload) {
                            fanout.route(&interaction_id, &transcript);
                        } else {
                            tracing::warn!(call = %interaction_id, "dropping malformed transcript delivery");
                        }
                        if let Err(err) = subscription.ack(&delivery.message_id).await {
                            tracing::warn!(call = %interaction_id, error = %err, "failed to ack transcript delivery");
                        }
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(call = %interaction_id, error = %err, "transcript subscription error");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
            }
        });
    }

    fn unsubscribe_call(&self, interaction_id: &str) {
        if let Some((_, state)) = self.subscriptions.remove(interaction_id) {
            state.cancel.cancel();
        }
        self.clients.remove(interaction_id);
    }

    fn route(&self, interaction_id: &str, transcript: &Transcript) {
        let Some(clients) = self.clients.get(interaction_id) else {
            return;
        };
        if let Some(state) = self.subscriptions.get(interaction_id) {
            state.transcript_count.fetch_add(1, Ordering::Relaxed);
        }

        let payload = TranscriptLinePayload {
            call_id: transcript.interaction_id.clone(),
            seq: transcript.seq,
            text: transcript.text.clone(),
            kind: match transcript.kind {
                TranscriptType::Partial => "partial",
                TranscriptType::Final => "final",
            },
            confidence: transcript.confidence,
            speaker: None,
            ts: transcript.timestamp_ms,
        };

        let mut slow_clients = Vec::new();
        for entry in clients.iter() {
            let event = SseEvent::TranscriptLine(payload.clone());
            match entry.value().tx.try_send(event) {
                Ok(()) => {
                    self.metrics.transcripts_routed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => slow_clients.push(entry.key().clone()),
            }
        }
        for client_id in slow_clients {
            if clients.remove(&client_id).is_some() {
                self.metrics
                    .clients_disconnected_slow
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(call = %interaction_id, client = %client_id, "disconnecting slow SSE client");
            }
        }
    }

    /// Registers a new SSE client for `call_id`, ensuring a transcript
    /// subscription exists (subscribing immediately if this is the first
    /// client to ask for a call the discovery loop hasn't seen yet).
    ///
    /// Returns the client id and the receiving half of its bounded queue;
    /// the `connected` event has already been enqueued.
    pub fn register_client(self: &Arc<Self>, call_id: &str) -> (String, mpsc::Receiver<SseEvent>) {
        if !self.subscriptions.contains_key(call_id) {
            self.clone().subscribe_call(call_id.to_string());
        }

        let client_id = format!("sse-{}", self.next_client_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.client_queue_capacity);
        let now = now_millis();
        let _ = tx.try_send(SseEvent::Connected(ConnectedPayload::new(client_id.clone(), now)));

        self.clients
            .entry(call_id.to_string())
            .or_default()
            .insert(
                client_id.clone(),
                ClientState {
                    tx,
                    connected_at_ms: now,
                },
            );

        (client_id, rx)
    }

    /// Removes a client on disconnect. Idempotent.
    pub fn remove_client(&self, call_id: &str, client_id: &str) {
        if let Some(clients) = self.clients.get(call_id) {
            clients.remove(client_id);
        }
    }

    pub fn status(&self) -> FanoutStatus {
        let subscriptions: Vec<SubscriptionStatus> = self
            .subscriptions
            .iter()
            .map(|entry| SubscriptionStatus {
                interaction_id: entry.key().clone(),
                transcript_count: entry.value().transcript_count.load(Ordering::Relaxed),
            })
            .collect();
        FanoutStatus {
            is_running: self.running.load(Ordering::SeqCst),
            subscription_count: subscriptions.len(),
            subscriptions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::in_memory::InMemoryBus;
    use crate::registry::in_memory::InMemoryCallRegistry;
    use crate::registry::CallMetadata;
    use crate::bus::AudioEncoding;

    fn config() -> CoreConfig {
        CoreConfig {
            discovery_interval_ms: 20,
            subscription_grace_period_secs: 0,
            sse_client_queue_capacity: 4,
            ..Default::default()
        }
    }

    fn metadata() -> CallMetadata {
        CallMetadata {
            tenant_id: "t1".into(),
            from: "+1".into(),
            to: "+2".into(),
            sample_rate_hz: 8_000,
            encoding: AudioEncoding::Pcm16,
        }
    }

    #[tokio::test]
    async fn on_demand_subscribe_delivers_transcript_to_registered_client() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(100, 5));
        let registry: Arc<dyn CallRegistry> = Arc::new(InMemoryCallRegistry::new(3600, 300));
        let fanout = TranscriptFanout::new(bus.clone(), registry, &config(), "fanout-1", CancellationToken::new());

        let (client_id, mut rx) = fanout.register_client("c1");
        let connected = rx.recv().await.unwrap();
        assert!(matches!(connected, SseEvent::Connected(_)));

        // Give the subscription task a moment to reach the bus's tail.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let transcript = Transcript {
            interaction_id: "c1".into(),
            tenant_id: "t1".into(),
            seq: 1,
            kind: TranscriptType::Final,
            text: "hello".into(),
            confidence: Some(0.9),
            timestamp_ms: 0,
        };
        bus.publish("transcript.c1", serde_json::to_vec(&transcript).unwrap())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SseEvent::TranscriptLine(line) => {
                assert_eq!(line.text, "hello");
                assert_eq!(line.seq, 1);
            }
            _ => panic!("expected transcript_line"),
        }

        fanout.remove_client("c1", &client_id);
    }

    #[tokio::test]
    async fn slow_client_is_disconnected_without_affecting_others() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(100, 5));
        let registry: Arc<dyn CallRegistry> = Arc::new(InMemoryCallRegistry::new(3600, 300));
        let fanout = TranscriptFanout::new(bus.clone(), registry, &config(), "fanout-1", CancellationToken::new());

        let (_slow_id, mut slow_rx) = fanout.register_client("c1");
        let (_fast_id, mut fast_rx) = fanout.register_client("c1");
        let _ = slow_rx.recv().await; // drain "connected"
        let _ = fast_rx.recv().await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Fill the slow client's queue (capacity 4) without reading it, while
        // the fast client keeps up.
        for i in 0..10u64 {
            let transcript = Transcript {
                interaction_id: "c1".into(),
                tenant_id: "t1".into(),
                seq: i + 1,
                kind: TranscriptType::Partial,
                text: format!("line {i}"),
                confidence: None,
                timestamp_ms: 0,
            };
            bus.publish("transcript.c1", serde_json::to_vec(&transcript).unwrap())
                .await
                .unwrap();
            let _ = fast_rx.try_recv();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fanout.metrics.clients_disconnected_slow.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn discovery_loop_subscribes_registry_active_calls() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new(100, 5));
        let registry: Arc<dyn CallRegistry> = Arc::new(InMemoryCallRegistry::new(3600, 300));
        registry.register("c9", metadata()).await.unwrap();

        let fanout = TranscriptFanout::new(bus, registry, &config(), "fanout-1", CancellationToken::new());
        let fanout_clone = Arc::clone(&fanout);
        tokio::spawn(fanout_clone.run());

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if fanout.status().subscription_count == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
