//! Telephony transport
//!
//! Accepts the carrier's bidirectional media-stream WebSocket and demuxes
//! its JSON control frames. Inbound μ-law audio goes to the STT pipeline;
//! synthesized audio, clear, and mark frames flow back through a per-session
//! mpsc sender so pipeline tasks never touch the socket directly.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::AppState;
use crate::session::CleanupReason;
use crate::telemetry::TelemetryEvent;

/// Carrier media frames are 20 ms of 8 kHz μ-law: 160 bytes
pub const MEDIA_CHUNK_BYTES: usize = 160;

/// Outbound frame queued by pipeline tasks for the carrier socket
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// μ-law 8 kHz audio; chunked into 20 ms media events on send
    Media(Vec<u8>),
    /// Drop any audio the carrier has buffered (barge-in)
    Clear,
    /// Playback-position marker emitted after each utterance
    Mark(String),
}

/// Inbound carrier control frames
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
enum StreamEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
    /// The carrier spells close as `stop`
    #[serde(alias = "close")]
    Stop {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartMetadata {
    #[serde(default)]
    call_sid: Option<String>,
    #[serde(default)]
    custom_parameters: Option<CustomParameters>,
}

#[derive(Debug, Deserialize)]
struct CustomParameters {
    #[serde(default)]
    from: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    /// base64-encoded μ-law audio
    payload: String,
    #[serde(default)]
    track: Option<String>,
}

/// WebSocket upgrade handler for the configured media path
pub async fn media_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_media_stream(socket, state))
}

/// Serialize one outbound frame into carrier wire messages
fn frame_to_messages(stream_sid: &str, frame: OutboundFrame) -> Vec<Message> {
    match frame {
        OutboundFrame::Media(mulaw) => mulaw
            .chunks(MEDIA_CHUNK_BYTES)
            .map(|chunk| {
                let msg = serde_json::json!({
                    "event": "media",
                    "streamSid": stream_sid,
                    "media": { "payload": BASE64.encode(chunk) }
                });
                Message::Text(msg.to_string().into())
            })
            .collect(),
        OutboundFrame::Clear => {
            let msg = serde_json::json!({ "event": "clear", "streamSid": stream_sid });
            vec![Message::Text(msg.to_string().into())]
        }
        OutboundFrame::Mark(name) => {
            let msg = serde_json::json!({
                "event": "mark",
                "streamSid": stream_sid,
                "mark": { "name": name }
            });
            vec![Message::Text(msg.to_string().into())]
        }
    }
}

/// Main per-connection loop: multiplex carrier reads against queued
/// pipeline writes with `tokio::select!`.
async fn handle_media_stream(mut socket: WebSocket, state: AppState) {
    info!("Carrier media stream connected");

    let (frame_tx, mut frame_rx) = mpsc::channel::<OutboundFrame>(64);
    let mut stream_sid = String::new();

    loop {
        tokio::select! {
            ws_msg = socket.recv() => {
                let text = match ws_msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(stream_sid = %stream_sid, "Media stream closed");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(stream_sid = %stream_sid, "Media stream error: {}", e);
                        break;
                    }
                    _ => continue,
                };

                let event: StreamEvent = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Unparseable carrier frame: {}", e);
                        continue;
                    }
                };

                match event {
                    StreamEvent::Connected { protocol } => {
                        debug!(?protocol, "Carrier handshake");
                    }
                    StreamEvent::Start { stream_sid: sid, start } => {
                        if let Some(call_sid) = &start.call_sid {
                            if state.registry.is_call_ending(call_sid) {
                                warn!(
                                    call_sid = %call_sid,
                                    "Refusing reconnect for ending call"
                                );
                                break;
                            }
                        }

                        stream_sid = sid;
                        on_stream_start(&state, &stream_sid, &start, frame_tx.clone()).await;
                    }
                    StreamEvent::Media { stream_sid: sid, media } => {
                        if media.track.as_deref().unwrap_or("inbound") != "inbound" {
                            continue;
                        }
                        let mulaw = match BASE64.decode(&media.payload) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("Bad media payload base64: {}", e);
                                continue;
                            }
                        };
                        state.orchestrator.on_inbound_audio(&sid, mulaw).await;
                    }
                    StreamEvent::Mark { stream_sid: sid } => {
                        debug!(stream_sid = %sid, "Mark acknowledged");
                    }
                    StreamEvent::Stop { stream_sid: sid } => {
                        info!(stream_sid = %sid, "Stream stopped by carrier");
                        break;
                    }
                }
            }

            Some(frame) = frame_rx.recv() => {
                let mut failed = false;
                for msg in frame_to_messages(&stream_sid, frame) {
                    if let Err(e) = socket.send(msg).await {
                        error!(stream_sid = %stream_sid, "Carrier send failed: {}", e);
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
        }
    }

    if !stream_sid.is_empty() {
        state.telemetry.publish(TelemetryEvent::SessionEnded {
            stream_sid: stream_sid.clone(),
            reason: "connection_closed".to_string(),
        });
        state.orchestrator.on_session_closed(&stream_sid).await;
        state
            .registry
            .cleanup(&stream_sid, CleanupReason::ConnectionClosed);
    }
}

/// Register the session and kick off its STT/TTS plumbing
async fn on_stream_start(
    state: &AppState,
    stream_sid: &str,
    start: &StartMetadata,
    frame_tx: mpsc::Sender<OutboundFrame>,
) {
    let session = state.registry.get_or_create(stream_sid);
    session.set_media_sender(frame_tx);

    if let Some(call_sid) = &start.call_sid {
        state.registry.associate_call_id(stream_sid, call_sid);

        // Outbound delay-notification legs carry their payload stashed
        // under the call sid at dial time
        if let Some(delay) = state.registry.take_outbound_delay(call_sid) {
            info!(stream_sid, "Outbound delay leg answered");
            state.registry.set_delay_data(stream_sid, delay);
        }
    }

    if let Some(from) = start
        .custom_parameters
        .as_ref()
        .and_then(|p| p.from.as_deref())
    {
        if let Some(entry) = state.phonebook.lookup(from) {
            info!(stream_sid, caller = %entry.name, role = ?entry.role, "Caller identified");
            state.registry.set_caller_info(
                stream_sid,
                crate::session::CallerInfo::from_entry(from, &entry),
            );
        } else {
            debug!(stream_sid, "Caller {} not in phonebook", from);
        }
    }

    state.telemetry.publish(TelemetryEvent::SessionStarted {
        stream_sid: stream_sid.to_string(),
        call_sid: start.call_sid.clone(),
    });

    state.orchestrator.on_session_started(session).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_event() {
        let raw = r#"{
            "event": "start",
            "streamSid": "MZ123",
            "start": {
                "callSid": "CA456",
                "customParameters": {"from": "+15550001111"}
            }
        }"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        match event {
            StreamEvent::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ123");
                assert_eq!(start.call_sid.as_deref(), Some("CA456"));
                assert_eq!(
                    start.custom_parameters.unwrap().from.as_deref(),
                    Some("+15550001111")
                );
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_media_event_defaults_inbound() {
        let raw = r#"{
            "event": "media",
            "streamSid": "MZ123",
            "media": {"payload": "AAAA"}
        }"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        match event {
            StreamEvent::Media { media, .. } => {
                assert!(media.track.is_none());
                assert_eq!(media.payload, "AAAA");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_close_alias_for_stop() {
        let raw = r#"{"event": "close", "streamSid": "MZ1"}"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, StreamEvent::Stop { .. }));
    }

    #[test]
    fn test_media_frame_chunks_to_20ms() {
        let audio = vec![0u8; 400];
        let messages = frame_to_messages("MZ1", OutboundFrame::Media(audio));
        // 400 bytes → 160 + 160 + 80
        assert_eq!(messages.len(), 3);
        for msg in &messages {
            if let Message::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(text).unwrap();
                assert_eq!(value["event"], "media");
                assert_eq!(value["streamSid"], "MZ1");
                assert!(value["media"]["payload"].is_string());
            } else {
                panic!("expected text frame");
            }
        }
    }

    #[test]
    fn test_clear_frame_shape() {
        let messages = frame_to_messages("MZ1", OutboundFrame::Clear);
        assert_eq!(messages.len(), 1);
        if let Message::Text(text) = &messages[0] {
            let value: serde_json::Value = serde_json::from_str(text).unwrap();
            assert_eq!(value["event"], "clear");
            assert_eq!(value["streamSid"], "MZ1");
        } else {
            panic!("expected text frame");
        }
    }

    #[test]
    fn test_mark_frame_carries_name() {
        let messages = frame_to_messages("MZ1", OutboundFrame::Mark("utterance_end".into()));
        if let Message::Text(text) = &messages[0] {
            let value: serde_json::Value = serde_json::from_str(text).unwrap();
            assert_eq!(value["mark"]["name"], "utterance_end");
        } else {
            panic!("expected text frame");
        }
    }
}
