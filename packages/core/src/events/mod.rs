//! Wire schemas for events delivered to agent browsers over the SSE stream.
//!
//! The fan-out component (see [`crate::fanout`]) is the only producer that
//! exists inside this crate today: it turns bus [`crate::bus::Transcript`]
//! records into [`SseEvent::TranscriptLine`]. `IntentUpdate` and
//! `Disposition` are part of the wire contract the agent UI already depends
//! on (`§6` external interfaces) but are emitted by the LLM classifier, an
//! out-of-scope collaborator; they are defined here so the SSE transport
//! layer has one place that knows every event name it must be able to carry.

use serde::Serialize;

/// One SSE event, pre-serialisation. [`crate::api::http`] maps each variant
/// to `event: <name>\ndata: <json>\n\n`; [`Connected`](SseEvent::Connected)
/// is the one event emitted unconditionally when a client attaches.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SseEvent {
    Connected(ConnectedPayload),
    TranscriptLine(TranscriptLinePayload),
    IntentUpdate(IntentUpdatePayload),
    Disposition(DispositionPayload),
}

impl SseEvent {
    /// The SSE `event:` field name for this payload.
    pub fn event_name(&self) -> &'static str {
        match self {
            SseEvent::Connected(_) => "connected",
            SseEvent::TranscriptLine(_) => "transcript_line",
            SseEvent::IntentUpdate(_) => "intent_update",
            SseEvent::Disposition(_) => "disposition",
        }
    }
}

/// Sent once, immediately after a client attaches to `/events/stream`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub client_id: String,
    pub ts: u64,
}

impl ConnectedPayload {
    pub fn new(client_id: String, ts: u64) -> Self {
        Self {
            kind: "connected",
            client_id,
            ts,
        }
    }
}

/// One transcript line routed to every SSE client subscribed to `call_id`.
///
/// `speaker` is omitted whenever the vendor event did not carry one — the
/// fan-out contract never invents a speaker label (`§9` open question).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptLinePayload {
    pub call_id: String,
    pub seq: u64,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub ts: u64,
}

/// Emitted by the (out-of-scope) intent classifier alongside the transcript
/// stream. Defined here purely as part of the SSE wire contract.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentUpdatePayload {
    pub call_id: String,
    pub intent: String,
    pub confidence: f32,
    pub ts: u64,
}

/// End-of-call summary emitted by the (out-of-scope) disposition classifier.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispositionPayload {
    pub call_id: String,
    pub disposition: String,
    pub ts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_line_omits_absent_speaker_and_confidence() {
        let payload = TranscriptLinePayload {
            call_id: "c1".into(),
            seq: 1,
            text: "hello".into(),
            kind: "final",
            confidence: None,
            speaker: None,
            ts: 0,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("speaker"));
        assert!(!json.contains("confidence"));
    }

    #[test]
    fn event_name_matches_wire_contract() {
        let connected = SseEvent::Connected(ConnectedPayload::new("c1".into(), 0));
        assert_eq!(connected.event_name(), "connected");
    }
}
