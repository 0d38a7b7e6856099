//! Business-logic configuration consumed by the pipeline library.
//!
//! [`CoreConfig`] holds every tunable named in the component design: ASR
//! buffering, silence gate thresholds, reconnect limits, fan-out discovery
//! cadence, and bus/registry trim policy. It is a plain `serde::Deserialize`
//! struct with a concrete [`Default`] so it can be embedded in the server
//! binary's own configuration and layered with environment overrides there.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::*;

/// Which pub-sub adapter backs the message bus and call registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PubsubAdapter {
    /// Single-process, in-memory adapter. First-class for tests and
    /// single-binary deployments; no external dependency.
    #[default]
    InMemory,
    /// Redis Streams-backed adapter.
    Streams,
}

/// Which ASR vendor connection implementation the worker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AsrProvider {
    /// Scripted in-memory vendor used by the test suite.
    #[default]
    Mock,
    /// Real streaming vendor over WebSocket.
    Websocket,
}

/// Authentication mode for the ingest WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IngestAuth {
    /// No authentication; only safe behind a private network.
    None,
    /// Source IP must appear in `allowed_ips`.
    IpAllowList { allowed_ips: Vec<String> },
    /// HTTP Basic credentials.
    Basic { username: String, password: String },
    /// Signed bearer token validated against a configured public key (PEM).
    BearerJwt { public_key_pem: String },
}

impl Default for IngestAuth {
    fn default() -> Self {
        Self::None
    }
}

/// Silence gate thresholds for one sample-rate family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SilenceThresholds {
    pub energy: f64,
    pub peak: f64,
}

/// Tunable business-logic configuration for the five core components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Which bus/registry adapter to construct at bootstrap.
    pub pubsub_adapter: PubsubAdapter,
    /// Redis connection string, required when `pubsub_adapter` is `streams`.
    pub redis_url: Option<String>,
    /// Consumer group name override for the ASR worker (defaults to
    /// [`ASR_CONSUMER_GROUP`]).
    pub redis_consumer_group: String,

    /// Default TTL for an active call (seconds).
    pub call_ttl_secs: u64,
    /// TTL applied once a call ends (seconds).
    pub ended_call_ttl_secs: u64,

    /// Trim length for per-call transcript topics.
    pub transcript_topic_trim_len: usize,
    /// Retention window for `audio_stream`, in minutes.
    pub audio_topic_retention_minutes: u64,

    /// ASR vendor implementation to use.
    pub asr_provider: AsrProvider,
    /// Vendor API key (required for the websocket provider).
    pub vendor_api_key: Option<String>,
    /// Flush cadence for per-call pending audio (ms).
    pub buffer_window_ms: u64,
    /// Idle time before a call's ASR buffer is torn down (ms).
    pub idle_teardown_ms: u64,
    /// Silence gate thresholds for 8 kHz audio.
    pub silence_thresholds_8k: SilenceThresholds,
    /// Silence gate thresholds for 16 kHz audio.
    pub silence_thresholds_16k: SilenceThresholds,
    /// Whether to amplify 8 kHz input before the silence gate.
    pub amplification_enabled: bool,
    /// Gain applied when amplification is enabled.
    pub amplification_gain: f64,
    /// Consecutive reconnect failures before abandoning a call's buffer.
    pub max_reconnects: u32,

    /// Ingest WebSocket authentication mode.
    pub ingest_auth: IngestAuth,
    /// Port the ingest/SSE/status HTTP server binds.
    pub ingest_port: u16,

    /// Discovery loop interval for the transcript fan-out (ms).
    pub discovery_interval_ms: u64,
    /// Limit passed to `list_active` by the discovery loop.
    pub discovery_list_limit: usize,
    /// Grace period a subscription with live clients is retained after its
    /// call ends (seconds).
    pub subscription_grace_period_secs: u64,
    /// Bound on a single SSE client's outbound event queue.
    pub sse_client_queue_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pubsub_adapter: PubsubAdapter::default(),
            redis_url: None,
            redis_consumer_group: ASR_CONSUMER_GROUP.to_string(),

            call_ttl_secs: CALL_TTL_SECS,
            ended_call_ttl_secs: ENDED_CALL_TTL_SECS,

            transcript_topic_trim_len: TRANSCRIPT_TOPIC_TRIM_LEN,
            audio_topic_retention_minutes: AUDIO_TOPIC_RETENTION_MINUTES,

            asr_provider: AsrProvider::default(),
            vendor_api_key: None,
            buffer_window_ms: BUFFER_WINDOW_MS,
            idle_teardown_ms: IDLE_TEARDOWN_MS,
            silence_thresholds_8k: SilenceThresholds {
                energy: SILENCE_ENERGY_THRESHOLD_8K,
                peak: SILENCE_PEAK_THRESHOLD_8K,
            },
            silence_thresholds_16k: SilenceThresholds {
                energy: SILENCE_ENERGY_THRESHOLD_16K,
                peak: SILENCE_PEAK_THRESHOLD_16K,
            },
            amplification_enabled: false,
            amplification_gain: DEFAULT_AMPLIFICATION_GAIN,
            max_reconnects: MAX_RECONNECTS,

            ingest_auth: IngestAuth::default(),
            ingest_port: 8080,

            discovery_interval_ms: DISCOVERY_INTERVAL_MS,
            discovery_list_limit: DISCOVERY_LIST_LIMIT,
            subscription_grace_period_secs: SUBSCRIPTION_GRACE_PERIOD_SECS,
            sse_client_queue_capacity: SSE_CLIENT_QUEUE_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_in_memory_adapter() {
        let config = CoreConfig::default();
        assert_eq!(config.pubsub_adapter, PubsubAdapter::InMemory);
        assert_eq!(config.max_reconnects, MAX_RECONNECTS);
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let json = r#"{"buffer_window_ms": 500}"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.buffer_window_ms, 500);
        assert_eq!(config.idle_teardown_ms, IDLE_TEARDOWN_MS);
    }
}
