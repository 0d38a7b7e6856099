//! Wire schemas for payloads carried on the message bus.
//!
//! These are explicit discriminated types rather than dynamic JSON: the bus
//! stores bytes, but every producer and consumer in this crate agrees on one
//! of the two shapes below. See `§6` (persisted layout) in the design doc.

use serde::{Deserialize, Serialize};

/// A chunk of telephony audio for one call, published to the shared
/// `audio_stream` topic.
///
/// `seq` is contiguous from 1 for a given `interaction_id`; gaps indicate
/// frame loss upstream and are logged by consumers, never treated as fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    pub tenant_id: String,
    pub interaction_id: String,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub sample_rate_hz: u32,
    pub encoding: AudioEncoding,
    /// Raw PCM16LE bytes, base64-encoded on the wire.
    #[serde(with = "base64_bytes")]
    pub audio: Vec<u8>,
}

/// Audio encodings accepted after ingest normalisation.
///
/// Every telephony-dialect encoding (`linear16`, `slin`, `raw`) is normalised
/// to `pcm16` before an `AudioFrame` is ever constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    Pcm16,
}

/// Transcript revision kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptType {
    /// A revisable hypothesis; may be superseded by a later partial or final
    /// for the same utterance boundary.
    Partial,
    /// Terminal for its utterance boundary; never superseded.
    Final,
}

/// A per-utterance transcript line, published to `transcript.<interaction_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub interaction_id: String,
    pub tenant_id: String,
    /// Per-call monotonic sequence over transcripts, independent of audio `seq`.
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: TranscriptType,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub timestamp_ms: u64,
}

impl Transcript {
    /// A transcript with empty or whitespace-only text must never be published.
    pub fn is_publishable(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// (De)serializes `Vec<u8>` as base64, matching the wire format of
/// `AudioFrame.audio` (`{..., "audio": "<base64 PCM16>"}`).
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_frame_round_trips_through_json() {
        let frame = AudioFrame {
            tenant_id: "t1".into(),
            interaction_id: "c1".into(),
            seq: 1,
            timestamp_ms: 1_000,
            sample_rate_hz: 8_000,
            encoding: AudioEncoding::Pcm16,
            audio: vec![0, 1, 2, 3],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"audio\":\""));
        let back: AudioFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn empty_text_transcript_is_not_publishable() {
        let t = Transcript {
            interaction_id: "c1".into(),
            tenant_id: "t1".into(),
            seq: 1,
            kind: TranscriptType::Partial,
            text: "   ".into(),
            confidence: None,
            timestamp_ms: 0,
        };
        assert!(!t.is_publishable());
    }
}
