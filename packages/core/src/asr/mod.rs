//! ASR Worker: consumes `audio_stream`, buffers per call, runs the silence
//! gate, and owns a persistent vendor streaming connection per call.
//!
//! One consumer group (`asr-workers`) is shared across worker replicas, so
//! horizontal scaling is a matter of running more processes in the same
//! group. Each `interaction_id` gets exactly one actor task that exclusively
//! owns its [`AudioBuffer`] and vendor connection — no other task ever
//! touches either, which is what makes "exactly one vendor connection per
//! call" enforceable.

pub mod mock_vendor;
pub mod silence;
pub mod vendor;
pub mod vendor_ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::{AudioFrame, MessageBus, Transcript, TranscriptType};
use crate::config::{CoreConfig, SilenceThresholds};
use crate::protocol_constants::{ASR_CONSUMER_GROUP, TRANSCRIPT_TOPIC_PREFIX};
use crate::utils::{backoff_delay, now_millis};

use vendor::{VendorErrorKind, VendorEvent, VendorFactory, VendorStream};

/// Per-call counters surfaced for the `/health`/`/transcripts/status` endpoints.
#[derive(Default)]
pub struct WorkerMetrics {
    pub chunks_sent: AtomicU64,
    pub connections_created: AtomicU64,
    pub transcripts_published: AtomicU64,
    pub calls_abandoned: AtomicU64,
}

struct AudioBuffer {
    interaction_id: String,
    tenant_id: String,
    sample_rate_hz: u32,
    pending_bytes: Vec<u8>,
    vendor_conn: Option<Box<dyn VendorStream>>,
    seq_out: u64,
    reconnect_attempts: u32,
    consecutive_vendor_errors: u32,
    abandoned: bool,
    created_at_ms: u64,
    first_partial_latency_ms: Option<u64>,
}

impl AudioBuffer {
    fn new(interaction_id: String, tenant_id: String, sample_rate_hz: u32) -> Self {
        Self {
            interaction_id,
            tenant_id,
            sample_rate_hz,
            pending_bytes: Vec::new(),
            vendor_conn: None,
            seq_out: 0,
            reconnect_attempts: 0,
            consecutive_vendor_errors: 0,
            abandoned: false,
            created_at_ms: now_millis(),
            first_partial_latency_ms: None,
        }
    }
}

/// Consumes `audio_stream`, fans audio out to per-call actor tasks, and
/// publishes transcripts back to `transcript.<interaction_id>`.
pub struct AsrWorker {
    bus: Arc<dyn MessageBus>,
    vendor_factory: Arc<dyn VendorFactory>,
    consumer_group: String,
    consumer_name: String,
    buffer_window_ms: u64,
    idle_teardown_ms: u64,
    silence_thresholds_8k: SilenceThresholds,
    silence_thresholds_16k: SilenceThresholds,
    amplification_enabled: bool,
    amplification_gain: f64,
    max_reconnects: u32,
    calls: DashMap<String, mpsc::Sender<AudioFrame>>,
    cancel: CancellationToken,
    pub metrics: Arc<WorkerMetrics>,
}

impl AsrWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        vendor_factory: Arc<dyn VendorFactory>,
        config: &CoreConfig,
        consumer_name: impl Into<String>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            vendor_factory,
            consumer_group: if config.redis_consumer_group.is_empty() {
                ASR_CONSUMER_GROUP.to_string()
            } else {
                config.redis_consumer_group.clone()
            },
            consumer_name: consumer_name.into(),
            buffer_window_ms: config.buffer_window_ms,
            idle_teardown_ms: config.idle_teardown_ms,
            silence_thresholds_8k: config.silence_thresholds_8k,
            silence_thresholds_16k: config.silence_thresholds_16k,
            amplification_enabled: config.amplification_enabled,
            amplification_gain: config.amplification_gain,
            max_reconnects: config.max_reconnects,
            calls: DashMap::new(),
            cancel,
            metrics: Arc::new(WorkerMetrics::default()),
        })
    }

    /// Consumption loop. Runs until the worker's cancellation token fires.
    /// Intended to be spawned by the composition root.
    pub async fn run(self: Arc<Self>) {
        let mut subscription = loop {
            match self
                .bus
                .subscribe(crate::protocol_constants::AUDIO_TOPIC, &self.consumer_group, &self.consumer_name)
                .await
            {
                Ok(subscription) => break subscription,
                Err(err) => {
                    tracing::error!(error = %err, "failed to subscribe to audio_stream, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        };

        while !self.cancel.is_cancelled() {
            let delivery = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = subscription.recv() => result,
            };

            match delivery {
                Ok(Some(delivery)) => {
                    match serde_json::from_slice::<AudioFrame>(&delivery.payload) {
                        Ok(frame) => Arc::clone(&self).dispatch(frame).await,
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping malformed audio frame");
                        }
                    }
                    if let Err(err) = subscription.ack(&delivery.message_id).await {
                        tracing::warn!(error = %err, "failed to ack audio frame");
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "audio_stream subscription error");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }

    async fn dispatch(self: Arc<Self>, frame: AudioFrame) {
        let sender = {
            if let Some(existing) = self.calls.get(&frame.interaction_id) {
                existing.clone()
            } else {
                self.clone().spawn_call_actor(&frame.interaction_id, &frame.tenant_id, frame.sample_rate_hz)
            }
        };

        if sender.send(frame.clone()).await.is_err() {
            // The actor exited (idle teardown or abandonment) between the
            // lookup above and this send; spin up a fresh one for this frame.
            let sender = self.spawn_call_actor(&frame.interaction_id, &frame.tenant_id, frame.sample_rate_hz);
            let _ = sender.send(frame).await;
        }
    }

    fn spawn_call_actor(
        self: Arc<Self>,
        interaction_id: &str,
        tenant_id: &str,
        sample_rate_hz: u32,
    ) -> mpsc::Sender<AudioFrame> {
        let (tx, rx) = mpsc::channel(64);
        self.calls.insert(interaction_id.to_string(), tx.clone());

        let interaction_id = interaction_id.to_string();
        let tenant_id = tenant_id.to_string();
        tokio::spawn(async move {
            self.run_call_actor(interaction_id, tenant_id, sample_rate_hz, rx).await;
        });

        tx
    }

    async fn run_call_actor(
        self: Arc<Self>,
        interaction_id: String,
        tenant_id: String,
        sample_rate_hz: u32,
        mut rx: mpsc::Receiver<AudioFrame>,
    ) {
        let mut buffer = AudioBuffer::new(interaction_id.clone(), tenant_id, sample_rate_hz);
        let mut flush_ticker = tokio::time::interval(Duration::from_millis(self.buffer_window_ms.max(1)));
        flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let idle_deadline = tokio::time::sleep(Duration::from_millis(self.idle_teardown_ms));
        tokio::pin!(idle_deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            buffer.pending_bytes.extend_from_slice(&frame.audio);
                            idle_deadline.as_mut().reset(Instant::now() + Duration::from_millis(self.idle_teardown_ms));
                        }
                        None => break,
                    }
                }
                _ = flush_ticker.tick() => {
                    self.flush(&mut buffer).await;
                    if buffer.abandoned {
                        break;
                    }
                }
                event = next_vendor_event(&mut buffer.vendor_conn) => {
                    self.handle_vendor_event(&mut buffer, event).await;
                    if buffer.abandoned {
                        break;
                    }
                }
                _ = &mut idle_deadline => {
                    break;
                }
            }
        }

        if let Some(conn) = buffer.vendor_conn.as_mut() {
            conn.close().await;
        }
        self.calls.remove(&interaction_id);
    }

    async fn flush(&self, buffer: &mut AudioBuffer) {
        if buffer.pending_bytes.is_empty() {
            return;
        }
        let mut chunk = std::mem::take(&mut buffer.pending_bytes);

        let thresholds = if buffer.sample_rate_hz <= 8_000 {
            &self.silence_thresholds_8k
        } else {
            &self.silence_thresholds_16k
        };
        if buffer.sample_rate_hz <= 8_000 && self.amplification_enabled {
            chunk = silence::amplify(&chunk, self.amplification_gain);
        }

        let stats = silence::analyze(&chunk);
        if silence::is_silence(stats, thresholds) {
            return;
        }

        if !self.ensure_connected(buffer).await {
            return;
        }

        if let Some(conn) = buffer.vendor_conn.as_mut() {
            match conn.send_audio(&chunk).await {
                Ok(()) => {
                    self.metrics.chunks_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::warn!(call = %buffer.interaction_id, error = %err, "vendor send failed");
                    conn.close().await;
                    buffer.vendor_conn = None;
                }
            }
        }
    }

    async fn ensure_connected(&self, buffer: &mut AudioBuffer) -> bool {
        if buffer.vendor_conn.is_some() {
            return true;
        }
        if buffer.reconnect_attempts >= self.max_reconnects {
            self.abandon(buffer);
            return false;
        }

        match self
            .vendor_factory
            .connect(&buffer.interaction_id, buffer.sample_rate_hz)
            .await
        {
            Ok(conn) => {
                buffer.vendor_conn = Some(conn);
                buffer.reconnect_attempts = 0;
                self.metrics.connections_created.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                tracing::warn!(
                    call = %buffer.interaction_id,
                    attempt = buffer.reconnect_attempts,
                    error = %err,
                    "vendor connect failed"
                );
                let delay = backoff_delay(
                    buffer.reconnect_attempts,
                    crate::protocol_constants::VENDOR_RECONNECT_BACKOFF_MIN_MS,
                    crate::protocol_constants::VENDOR_RECONNECT_BACKOFF_MAX_MS,
                    crate::protocol_constants::VENDOR_RECONNECT_JITTER,
                );
                buffer.reconnect_attempts += 1;
                tokio::time::sleep(delay).await;
                if buffer.reconnect_attempts >= self.max_reconnects {
                    self.abandon(buffer);
                }
                false
            }
        }
    }

    fn abandon(&self, buffer: &mut AudioBuffer) {
        tracing::error!(call = %buffer.interaction_id, "abandoning call after exhausting vendor reconnects");
        buffer.abandoned = true;
        self.metrics.calls_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    async fn handle_vendor_event(&self, buffer: &mut AudioBuffer, event: Option<VendorEvent>) {
        match event {
            Some(VendorEvent::Transcript { text, is_final, confidence }) => {
                buffer.consecutive_vendor_errors = 0;
                if text.trim().is_empty() {
                    return;
                }
                buffer.seq_out += 1;
                let transcript = Transcript {
                    interaction_id: buffer.interaction_id.clone(),
                    tenant_id: buffer.tenant_id.clone(),
                    seq: buffer.seq_out,
                    kind: if is_final { TranscriptType::Final } else { TranscriptType::Partial },
                    text,
                    confidence,
                    timestamp_ms: now_millis(),
                };
                if !transcript.is_publishable() {
                    return;
                }
                if buffer.first_partial_latency_ms.is_none() {
                    buffer.first_partial_latency_ms =
                        Some(now_millis().saturating_sub(buffer.created_at_ms));
                }
                self.publish_transcript(buffer, &transcript).await;
            }
            Some(VendorEvent::Error(kind)) => {
                tracing::warn!(call = %buffer.interaction_id, ?kind, "vendor error event");
                if let Some(conn) = buffer.vendor_conn.as_mut() {
                    conn.close().await;
                }
                buffer.vendor_conn = None;
                if matches!(kind, VendorErrorKind::Auth) {
                    // Auth failures won't self-resolve by retrying quickly;
                    // still subject to the same reconnect budget.
                    buffer.reconnect_attempts = buffer.reconnect_attempts.max(1);
                }
            }
            None => {
                // Vendor closed the stream cleanly; reconnect on next flush.
                buffer.vendor_conn = None;
            }
        }
    }

    async fn publish_transcript(&self, buffer: &AudioBuffer, transcript: &Transcript) {
        let topic = format!("{}{}", TRANSCRIPT_TOPIC_PREFIX, buffer.interaction_id);
        match serde_json::to_vec(transcript) {
            Ok(payload) => {
                if let Err(err) = self.bus.publish(&topic, payload).await {
                    tracing::warn!(call = %buffer.interaction_id, error = %err, "failed to publish transcript");
                } else {
                    self.metrics.transcripts_published.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize transcript"),
        }
    }
}

async fn next_vendor_event(conn: &mut Option<Box<dyn VendorStream>>) -> Option<VendorEvent> {
    match conn {
        Some(stream) => stream.next_event().await,
        None => std::future::pending().await,
    }
}
