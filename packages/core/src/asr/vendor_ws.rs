//! Real vendor streaming connection over WebSocket.
//!
//! Speaks a Deepgram-shaped streaming protocol: binary PCM16LE frames
//! upstream, newline-delimited JSON result events downstream
//! (`{"type":"Results","is_final":bool,"channel":{"alternatives":[{"transcript":...}]}}`).
//! Send and receive run as two tasks joined by this handle, so a stalled
//! vendor read can never block audio ingestion into the owner's buffer.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;

use super::vendor::{VendorError, VendorErrorKind, VendorEvent, VendorFactory, VendorStream};
use crate::protocol_constants::{
    MAX_MALFORMED_VENDOR_MESSAGES, VENDOR_CONNECT_TIMEOUT_SECS, VENDOR_EVENT_QUEUE_CAPACITY,
    VENDOR_SEND_QUEUE_CAPACITY,
};

/// Builds [`VendorWebSocketStream`]s against a fixed endpoint and API key.
pub struct VendorWebSocketFactory {
    endpoint: String,
    api_key: String,
}

impl VendorWebSocketFactory {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl VendorFactory for VendorWebSocketFactory {
    async fn connect(
        &self,
        interaction_id: &str,
        sample_rate_hz: u32,
    ) -> Result<Box<dyn VendorStream>, VendorError> {
        let url = format!(
            "{}?sample_rate={}&encoding=linear16&call={}",
            self.endpoint, sample_rate_hz, interaction_id
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| VendorError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|_| VendorError::Auth("invalid api key".into()))?,
        );

        let connected = timeout(
            Duration::from_secs(VENDOR_CONNECT_TIMEOUT_SECS),
            connect_async(request),
        )
        .await
        .map_err(|_| VendorError::Connect("connect timed out".into()))?
        .map_err(|e| VendorError::Connect(e.to_string()))?;

        let (ws_stream, _response) = connected;
        let (mut write, mut read) = ws_stream.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(VENDOR_SEND_QUEUE_CAPACITY);
        let writer_task: JoinHandle<()> = tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                if write.send(Message::Binary(chunk)).await.is_err() {
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        let (event_tx, event_rx) = mpsc::channel::<VendorEvent>(VENDOR_EVENT_QUEUE_CAPACITY);
        let reader_task: JoinHandle<()> = tokio::spawn(async move {
            let mut consecutive_malformed: u32 = 0;
            while let Some(message) = read.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => match decode_wire_event(&text) {
                        Some(event) => {
                            consecutive_malformed = 0;
                            Some(event)
                        }
                        // A single malformed/unrecognised message is dropped
                        // silently; only a run of them forces a reconnect.
                        None => {
                            consecutive_malformed += 1;
                            (consecutive_malformed >= MAX_MALFORMED_VENDOR_MESSAGES)
                                .then_some(VendorEvent::Error(VendorErrorKind::Other))
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => Some(VendorEvent::Error(classify(&e.to_string()))),
                };

                if let Some(event) = event {
                    let is_error = matches!(event, VendorEvent::Error(_));
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                    if is_error {
                        break;
                    }
                }
            }
        });

        Ok(Box::new(VendorWebSocketStream {
            audio_tx: Some(audio_tx),
            event_rx,
            writer_task,
            reader_task,
        }))
    }
}

/// A live vendor connection: a sender task draining `audio_tx` into the
/// socket, and a receiver task forwarding decoded events into `event_rx`.
pub struct VendorWebSocketStream {
    audio_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: mpsc::Receiver<VendorEvent>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

#[async_trait]
impl VendorStream for VendorWebSocketStream {
    async fn send_audio(&mut self, pcm16le: &[u8]) -> Result<(), VendorError> {
        match &self.audio_tx {
            Some(tx) => tx
                .send(pcm16le.to_vec())
                .await
                .map_err(|_| VendorError::Closed("vendor writer task ended".into())),
            None => Err(VendorError::Closed("vendor stream closed".into())),
        }
    }

    async fn next_event(&mut self) -> Option<VendorEvent> {
        self.event_rx.recv().await
    }

    async fn close(&mut self) {
        self.audio_tx = None;
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

impl Drop for VendorWebSocketStream {
    fn drop(&mut self) {
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    Results { is_final: bool, channel: WireChannel },
    Error { message: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    alternatives: Vec<WireAlternative>,
}

#[derive(Debug, Deserialize)]
struct WireAlternative {
    transcript: String,
    confidence: Option<f32>,
}

fn decode_wire_event(text: &str) -> Option<VendorEvent> {
    match serde_json::from_str::<WireEvent>(text) {
        Ok(WireEvent::Results { is_final, channel }) => {
            let alt = channel.alternatives.into_iter().next()?;
            Some(VendorEvent::Transcript {
                text: alt.transcript,
                is_final,
                confidence: alt.confidence,
            })
        }
        Ok(WireEvent::Error { message }) => Some(VendorEvent::Error(classify(&message))),
        Ok(WireEvent::Unknown) => None,
        // Malformed JSON: treated the same as an unrecognised event, so the
        // caller's consecutive-malformed counter governs reconnection.
        Err(_) => None,
    }
}

fn classify(message: &str) -> VendorErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("auth") || lower.contains("unauthorized") || lower.contains("forbidden") {
        VendorErrorKind::Auth
    } else if lower.contains("rate") || lower.contains("429") {
        VendorErrorKind::RateLimited
    } else {
        VendorErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_final_results_event() {
        let json = r#"{"type":"Results","is_final":true,"channel":{"alternatives":[{"transcript":"hello","confidence":0.95}]}}"#;
        let event = decode_wire_event(json).unwrap();
        match event {
            VendorEvent::Transcript { text, is_final, confidence } => {
                assert_eq!(text, "hello");
                assert!(is_final);
                assert_eq!(confidence, Some(0.95));
            }
            _ => panic!("expected transcript event"),
        }
    }

    #[test]
    fn decodes_error_event() {
        let json = r#"{"type":"Error","message":"rate limit exceeded"}"#;
        let event = decode_wire_event(json).unwrap();
        assert_eq!(event, VendorEvent::Error(VendorErrorKind::RateLimited));
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let json = r#"{"type":"Metadata","request_id":"abc"}"#;
        assert!(decode_wire_event(json).is_none());
    }

    #[test]
    fn malformed_json_is_ignored_rather_than_surfaced_as_an_error() {
        assert!(decode_wire_event("not json").is_none());
    }
}
