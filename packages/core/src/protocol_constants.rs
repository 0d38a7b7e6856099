//! Fixed protocol and tuning constants for the agent-assist pipeline.
//!
//! These are the default values for [`crate::config::CoreConfig`] and the
//! numbers named throughout the component design: buffering windows, silence
//! gate thresholds, reconnect backoff, trim policy. Grouping them here keeps
//! the pipeline's tuning knobs in one auditable place.

// ─────────────────────────────────────────────────────────────────────────────
// Call registry
// ─────────────────────────────────────────────────────────────────────────────

/// Default TTL for an active call registry entry (seconds).
pub const CALL_TTL_SECS: u64 = 3600;

/// TTL applied to a call once it has ended, to allow post-call queries.
pub const ENDED_CALL_TTL_SECS: u64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Bus topics and trim policy
// ─────────────────────────────────────────────────────────────────────────────

/// Name of the single shared audio topic.
pub const AUDIO_TOPIC: &str = "audio_stream";

/// Prefix for per-call transcript topics; full name is `transcript.<interaction_id>`.
pub const TRANSCRIPT_TOPIC_PREFIX: &str = "transcript.";

/// Number of messages retained per transcript topic.
pub const TRANSCRIPT_TOPIC_TRIM_LEN: usize = 100;

/// Approximate retention window for `audio_stream`, trimmed by time.
pub const AUDIO_TOPIC_RETENTION_MINUTES: u64 = 5;

/// Consumer group shared by all ASR worker replicas.
pub const ASR_CONSUMER_GROUP: &str = "asr-workers";

/// Consumer group used by the transcript fan-out service.
pub const FANOUT_CONSUMER_GROUP: &str = "ui-fanout";

// ─────────────────────────────────────────────────────────────────────────────
// Ingest Gateway protocol state machine
// ─────────────────────────────────────────────────────────────────────────────

/// Number of `media` frames between registry TTL refreshes.
pub const TTL_REFRESH_EVERY_N_FRAMES: u64 = 25;

/// Idle timeout for an ingest WebSocket connection (seconds). Close code 1011.
pub const INGEST_IDLE_TIMEOUT_SECS: u64 = 60;

/// Close code used for protocol violations.
pub const WS_CLOSE_PROTOCOL_VIOLATION: u16 = 1002;

/// Close code used when the gateway cannot keep serving the connection.
pub const WS_CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Retry delays for an in-band publish retry of an `AudioFrame` (ms).
pub const PUBLISH_RETRY_DELAYS_MS: [u64; 3] = [50, 100, 200];

/// Consecutive slow publishes (> `PUBLISH_CONGESTION_THRESHOLD_MS`) before the
/// gateway emits a congestion metric.
pub const PUBLISH_CONGESTION_STREAK: u32 = 5;

/// Publish latency considered congested (ms).
pub const PUBLISH_CONGESTION_THRESHOLD_MS: u64 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// ASR Worker buffering and silence gate
// ─────────────────────────────────────────────────────────────────────────────

/// Flush cadence for per-call pending audio (ms).
pub const BUFFER_WINDOW_MS: u64 = 300;

/// Idle time with no audio frames before a call's buffer and vendor connection
/// are torn down (ms).
pub const IDLE_TEARDOWN_MS: u64 = 30_000;

/// Silence gate energy threshold for 8 kHz telephony audio.
pub const SILENCE_ENERGY_THRESHOLD_8K: f64 = 25.0;
/// Silence gate peak-amplitude threshold for 8 kHz telephony audio.
pub const SILENCE_PEAK_THRESHOLD_8K: f64 = 50.0;

/// Silence gate energy threshold for 16 kHz audio.
pub const SILENCE_ENERGY_THRESHOLD_16K: f64 = 50.0;
/// Silence gate peak-amplitude threshold for 16 kHz audio.
pub const SILENCE_PEAK_THRESHOLD_16K: f64 = 500.0;

/// Default fixed gain applied to 8 kHz input when amplification is enabled.
pub const DEFAULT_AMPLIFICATION_GAIN: f64 = 2.0;

// ─────────────────────────────────────────────────────────────────────────────
// ASR Worker vendor connection lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Initial reconnect backoff for the vendor connection (ms).
pub const VENDOR_RECONNECT_BACKOFF_MIN_MS: u64 = 250;

/// Maximum reconnect backoff for the vendor connection (ms).
pub const VENDOR_RECONNECT_BACKOFF_MAX_MS: u64 = 5_000;

/// Jitter applied to vendor reconnect backoff, as a fraction (±20%).
pub const VENDOR_RECONNECT_JITTER: f64 = 0.20;

/// Consecutive reconnect failures before a call's ASR buffer is abandoned.
pub const MAX_RECONNECTS: u32 = 5;

/// Malformed vendor messages tolerated before forcing a reconnect.
pub const MAX_MALFORMED_VENDOR_MESSAGES: u32 = 5;

/// Timeout connecting to the vendor streaming endpoint (seconds).
pub const VENDOR_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout waiting for the first byte after the vendor connection opens (seconds).
pub const VENDOR_FIRST_BYTE_TIMEOUT_SECS: u64 = 15;

/// Bound on the channel between the per-call owner task and its vendor sender task.
pub const VENDOR_SEND_QUEUE_CAPACITY: usize = 64;

/// Bound on the channel carrying decoded vendor events back to the owner task.
pub const VENDOR_EVENT_QUEUE_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Message bus reconnect (shared by Redis-backed adapters)
// ─────────────────────────────────────────────────────────────────────────────

/// Initial backoff for bus reconnect (ms).
pub const BUS_RECONNECT_BACKOFF_MIN_MS: u64 = 50;

/// Maximum backoff for bus reconnect (ms).
pub const BUS_RECONNECT_BACKOFF_MAX_MS: u64 = 2_000;

/// Default timeout for bus operations (seconds).
pub const BUS_OP_TIMEOUT_SECS: u64 = 5;

/// Timeout for blocking `XREAD`/subscribe polls (seconds).
pub const BUS_BLOCKING_READ_TIMEOUT_SECS: u64 = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Transcript Fan-out
// ─────────────────────────────────────────────────────────────────────────────

/// How often the fan-out discovery loop scans the call registry (ms).
pub const DISCOVERY_INTERVAL_MS: u64 = 5_000;

/// Limit used when the discovery loop lists active calls.
pub const DISCOVERY_LIST_LIMIT: usize = 50;

/// Grace period subscriptions are retained after their call ends, to flush
/// any final transcripts to still-connected SSE clients (seconds).
pub const SUBSCRIPTION_GRACE_PERIOD_SECS: u64 = 60;

/// Bound on a single SSE client's outbound event queue.
pub const SSE_CLIENT_QUEUE_CAPACITY: usize = 256;

/// Interval between SSE heartbeat comments (seconds).
pub const SSE_HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Timeout for a single SSE write (seconds).
pub const SSE_WRITE_TIMEOUT_SECS: u64 = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Application identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by `/health`.
pub const SERVICE_ID: &str = "agent-assist-pipeline";
