//! Ingest Gateway: terminates the telephony WebSocket, runs the per-connection
//! protocol state machine, normalises audio, and publishes `AudioFrame`s.
//!
//! One logical task per connection owns its state machine exclusively, so
//! `seq` is always monotonic for a given connection (`§5`). The state machine
//! itself (`§4.3`) is intentionally a plain Rust enum matched in a loop rather
//! than a generic framework — there is exactly one protocol to support.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::bus::{AudioEncoding, AudioFrame};
use crate::config::IngestAuth;
use crate::error::PipelineError;
use crate::protocol_constants::{
    INGEST_IDLE_TIMEOUT_SECS, PUBLISH_CONGESTION_STREAK, PUBLISH_CONGESTION_THRESHOLD_MS,
    PUBLISH_RETRY_DELAYS_MS, TTL_REFRESH_EVERY_N_FRAMES, WS_CLOSE_INTERNAL_ERROR,
    WS_CLOSE_PROTOCOL_VIOLATION,
};
use crate::registry::CallMetadata;
use crate::utils::now_millis;

/// Incoming telephony frame, discriminated by `event` (`§6`).
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum IngestEvent {
    Connected,
    Start {
        start: StartPayload,
    },
    Media {
        media: MediaPayload,
    },
    Stop {
        #[serde(default)]
        stop: StopPayload,
    },
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    call_sid: String,
    #[serde(default)]
    account_sid: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    media_format: MediaFormat,
}

#[derive(Debug, Deserialize)]
struct MediaFormat {
    encoding: String,
    sample_rate: String,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Default, Deserialize)]
struct StopPayload {
    #[serde(default)]
    #[allow(dead_code)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum IngestAck {
    Started,
    Ack { seq: u64 },
}

/// Normalises a telephony-dialect encoding name to the one encoding this
/// pipeline carries internally. Anything else is rejected at `start`.
fn normalise_encoding(raw: &str) -> Option<AudioEncoding> {
    match raw.to_ascii_lowercase().as_str() {
        "linear16" | "pcm16" | "slin" | "raw" => Some(AudioEncoding::Pcm16),
        _ => None,
    }
}

/// Per-connection protocol state. `Streaming` carries everything the `media`
/// handler needs; nothing outside this task ever touches it.
enum ConnectionState {
    Init,
    Connected,
    Streaming {
        interaction_id: String,
        tenant_id: String,
        sample_rate_hz: u32,
        seq: u64,
        consecutive_slow_publishes: u32,
    },
    Terminated,
}

fn authenticate(auth: &IngestAuth, headers: &HeaderMap, addr: SocketAddr) -> Result<(), PipelineError> {
    match auth {
        IngestAuth::None => Ok(()),
        IngestAuth::IpAllowList { allowed_ips } => {
            let ip = addr.ip().to_string();
            if allowed_ips.iter().any(|allowed| allowed == &ip) {
                Ok(())
            } else {
                Err(PipelineError::Unauthorized(format!("source ip {ip} not allow-listed")))
            }
        }
        IngestAuth::Basic { username, password } => {
            let header = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| PipelineError::Unauthorized("missing authorization header".into()))?;
            let encoded = header
                .strip_prefix("Basic ")
                .ok_or_else(|| PipelineError::Unauthorized("expected Basic auth".into()))?;
            let decoded = BASE64
                .decode(encoded)
                .map_err(|_| PipelineError::Unauthorized("invalid basic auth encoding".into()))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| PipelineError::Unauthorized("invalid basic auth encoding".into()))?;
            let expected = format!("{username}:{password}");
            if decoded == expected {
                Ok(())
            } else {
                Err(PipelineError::Unauthorized("bad basic auth credentials".into()))
            }
        }
        IngestAuth::BearerJwt { public_key_pem } => {
            let header = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| PipelineError::Unauthorized("missing authorization header".into()))?;
            let token = header
                .strip_prefix("Bearer ")
                .ok_or_else(|| PipelineError::Unauthorized("expected bearer token".into()))?;
            let key = jsonwebtoken::DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
                .map_err(|e| PipelineError::Configuration(format!("invalid jwt public key: {e}")))?;
            let validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
            jsonwebtoken::decode::<serde_json::Value>(token, &key, &validation)
                .map(|_| ())
                .map_err(|e| PipelineError::Unauthorized(format!("invalid bearer token: {e}")))
        }
    }
}

/// `GET /v1/ingest` — authenticates then upgrades to the telephony WebSocket.
pub async fn ingest_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = authenticate(&state.config.ingest_auth, &headers, addr) {
        return err.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        run_connection(socket, state).await;
    })
}

async fn run_connection(mut socket: WebSocket, state: AppState) {
    let _guard = state.ws_manager.register();
    let mut conn_state = ConnectionState::Init;

    loop {
        let recv = tokio::select! {
            biased;
            _ = _guard.cancel_token().cancelled() => {
                close_with(&mut socket, WS_CLOSE_INTERNAL_ERROR, "server shutting down").await;
                break;
            }
            recv = tokio::time::timeout(
                Duration::from_secs(INGEST_IDLE_TIMEOUT_SECS),
                socket.recv(),
            ) => recv,
        };

        let message = match recv {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                close_with(&mut socket, WS_CLOSE_INTERNAL_ERROR, "idle timeout").await;
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };

        let event = match serde_json::from_str::<IngestEvent>(&text) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "ingest: protocol violation decoding frame");
                close_with(&mut socket, WS_CLOSE_PROTOCOL_VIOLATION, "malformed event").await;
                break;
            }
        };

        conn_state = match (conn_state, event) {
            (ConnectionState::Init, IngestEvent::Connected) => ConnectionState::Connected,

            (ConnectionState::Connected, IngestEvent::Start { start }) => {
                let Some(encoding) = normalise_encoding(&start.media_format.encoding) else {
                    tracing::warn!(encoding = %start.media_format.encoding, "ingest: unsupported encoding");
                    close_with(&mut socket, WS_CLOSE_PROTOCOL_VIOLATION, "unsupported encoding").await;
                    break;
                };
                let sample_rate_hz: u32 = start.media_format.sample_rate.parse().unwrap_or(8_000);
                // call_sid is canonical: interaction_id is always assigned from it.
                let interaction_id = start.call_sid.clone();
                let tenant_id = if start.account_sid.is_empty() {
                    "default".to_string()
                } else {
                    start.account_sid.clone()
                };

                if let Err(err) = state
                    .registry
                    .register(
                        &interaction_id,
                        CallMetadata {
                            tenant_id: tenant_id.clone(),
                            from: start.from,
                            to: start.to,
                            sample_rate_hz,
                            encoding,
                        },
                    )
                    .await
                {
                    // Registry unavailability is advisory; ingest keeps streaming.
                    tracing::warn!(call = %interaction_id, error = %err, "ingest: registry register failed");
                }

                if send_json(&mut socket, &IngestAck::Started).await.is_err() {
                    break;
                }

                ConnectionState::Streaming {
                    interaction_id,
                    tenant_id,
                    sample_rate_hz,
                    seq: 0,
                    consecutive_slow_publishes: 0,
                }
            }

            (
                ConnectionState::Streaming {
                    interaction_id,
                    tenant_id,
                    sample_rate_hz,
                    mut seq,
                    mut consecutive_slow_publishes,
                },
                IngestEvent::Media { media },
            ) => {
                let audio = match BASE64.decode(media.payload.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(call = %interaction_id, error = %err, "ingest: bad base64 payload");
                        close_with(&mut socket, WS_CLOSE_PROTOCOL_VIOLATION, "bad base64 payload").await;
                        break;
                    }
                };
                seq += 1;

                let frame = AudioFrame {
                    tenant_id: tenant_id.clone(),
                    interaction_id: interaction_id.clone(),
                    seq,
                    timestamp_ms: now_millis(),
                    sample_rate_hz,
                    encoding: AudioEncoding::Pcm16,
                    audio,
                };

                match publish_with_retry(&state, &frame).await {
                    Ok(latency_ms) => {
                        if latency_ms > PUBLISH_CONGESTION_THRESHOLD_MS {
                            consecutive_slow_publishes += 1;
                            if consecutive_slow_publishes >= PUBLISH_CONGESTION_STREAK {
                                state.ingest_metrics.congestion_events.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(call = %interaction_id, "ingest: publish congestion detected");
                                consecutive_slow_publishes = 0;
                            }
                        } else {
                            consecutive_slow_publishes = 0;
                        }
                        state.ingest_metrics.frames_published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(()) => {
                        state.ingest_metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(call = %interaction_id, seq, "ingest: publish failed after retries");
                        close_with(&mut socket, WS_CLOSE_INTERNAL_ERROR, "publish failed").await;
                        break;
                    }
                }

                if seq % TTL_REFRESH_EVERY_N_FRAMES == 0 {
                    if let Err(err) = state.registry.touch(&interaction_id).await {
                        tracing::warn!(call = %interaction_id, error = %err, "ingest: registry touch failed");
                    }
                }
                if seq % 10 == 0 && send_json(&mut socket, &IngestAck::Ack { seq }).await.is_err() {
                    break;
                }

                ConnectionState::Streaming {
                    interaction_id,
                    tenant_id,
                    sample_rate_hz,
                    seq,
                    consecutive_slow_publishes,
                }
            }

            (ConnectionState::Streaming { interaction_id, .. }, IngestEvent::Stop { .. }) => {
                if let Err(err) = state.registry.end(&interaction_id).await {
                    tracing::warn!(call = %interaction_id, error = %err, "ingest: registry end failed");
                }
                let _ = socket.send(Message::Close(None)).await;
                break;
            }

            (_, _) => {
                tracing::warn!("ingest: protocol violation (event out of sequence)");
                close_with(&mut socket, WS_CLOSE_PROTOCOL_VIOLATION, "out of sequence").await;
                break;
            }
        };
    }
}

/// Publishes `frame`, retrying in-band up to 3 times (`§4.3`). Returns the
/// latency of the successful attempt, or `Err(())` once retries exhaust.
async fn publish_with_retry(state: &AppState, frame: &AudioFrame) -> Result<u64, ()> {
    let payload = match serde_json::to_vec(frame) {
        Ok(payload) => payload,
        Err(_) => return Err(()),
    };

    let mut last_err = None;
    for delay_ms in std::iter::once(0).chain(PUBLISH_RETRY_DELAYS_MS) {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let started = std::time::Instant::now();
        match state.bus.publish(crate::protocol_constants::AUDIO_TOPIC, payload.clone()).await {
            Ok(_) => return Ok(started.elapsed().as_millis() as u64),
            Err(err) => last_err = Some(err),
        }
    }
    tracing::error!(error = ?last_err, "ingest: audio publish exhausted retries");
    Err(())
}

async fn send_json(socket: &mut WebSocket, value: &impl Serialize) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).unwrap_or_default();
    socket.send(Message::Text(text)).await
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_known_telephony_encodings() {
        assert_eq!(normalise_encoding("linear16"), Some(AudioEncoding::Pcm16));
        assert_eq!(normalise_encoding("SLIN"), Some(AudioEncoding::Pcm16));
        assert_eq!(normalise_encoding("raw"), Some(AudioEncoding::Pcm16));
    }

    #[test]
    fn rejects_unknown_encoding() {
        assert_eq!(normalise_encoding("mulaw"), None);
    }

    #[test]
    fn decodes_start_event() {
        let json = r#"{"event":"start","sequence_number":1,"stream_sid":"s1",
            "start":{"stream_sid":"s1","call_sid":"c1","account_sid":"a1",
                     "from":"+1","to":"+2","media_format":{"encoding":"pcm16","sample_rate":"8000"}}}"#;
        let event: IngestEvent = serde_json::from_str(json).unwrap();
        match event {
            IngestEvent::Start { start } => assert_eq!(start.call_sid, "c1"),
            _ => panic!("expected start event"),
        }
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let json = r#"{"event":"mystery"}"#;
        assert!(serde_json::from_str::<IngestEvent>(json).is_err());
    }

    #[test]
    fn ip_allow_list_rejects_unlisted_source() {
        let auth = IngestAuth::IpAllowList {
            allowed_ips: vec!["10.0.0.1".to_string()],
        };
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert!(authenticate(&auth, &HeaderMap::new(), addr).is_err());
    }

    #[test]
    fn ip_allow_list_accepts_listed_source() {
        let auth = IngestAuth::IpAllowList {
            allowed_ips: vec!["127.0.0.1".to_string()],
        };
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert!(authenticate(&auth, &HeaderMap::new(), addr).is_ok());
    }
}
