//! Streaming text-to-speech client
//!
//! One provider socket is shared process-wide and re-associated to the
//! current active session — the session whose last final transcript most
//! recently arrived. Both supported providers rate-limit connection churn,
//! so a persistent shared socket amortizes the handshake.
//!
//! Invariant: at most one session is the audio sink at any time. Switching
//! sinks flushes the previous speaker first; barge-in mutes the in-flight
//! generation without closing the socket.
//!
//! Two wire flavors share the contract: text chunks in, audio frames out,
//! a flush marker ending each generation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::audio;
use crate::config::{TtsConfig, TtsFlavor};
use crate::session::SessionRegistry;
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::telephony::OutboundFrame;

/// Reconnect delay cap
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Reconnect attempts before requiring an external trigger
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Commands buffered while the socket is connecting or closed
const PENDING_CAP: usize = 64;

/// Connection state reported on /health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Commands from the orchestrator to the socket task
#[derive(Debug)]
enum TtsCommand {
    /// Re-associate the shared socket to a new active session
    SetSink { stream_sid: String },
    /// Stream a text chunk into the current generation
    Text(String),
    /// End the current generation
    Flush,
    /// Barge-in: drop in-flight audio, keep the socket
    Cancel,
}

/// Introspection shared with /health and the greeting gate
struct SharedState {
    connection: ConnectionState,
    voice_id: String,
    fell_back: bool,
    sink: Option<String>,
}

/// Handle to the shared TTS socket task
#[derive(Clone)]
pub struct TtsManager {
    command_tx: mpsc::Sender<TtsCommand>,
    shared: Arc<Mutex<SharedState>>,
}

impl TtsManager {
    /// Spawn the socket task
    pub fn spawn(config: TtsConfig, registry: SessionRegistry, telemetry: Telemetry) -> Self {
        let (command_tx, command_rx) = mpsc::channel(PENDING_CAP);
        let shared = Arc::new(Mutex::new(SharedState {
            connection: ConnectionState::Closed,
            voice_id: config.voice_id.clone(),
            fell_back: false,
            sink: None,
        }));

        let task_shared = shared.clone();
        tokio::spawn(async move {
            run_socket(config, registry, telemetry, command_rx, task_shared).await;
        });

        Self { command_tx, shared }
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `stream_sid` the audio sink and reset first-byte timing.
    /// The previous speaker is flushed before the switch takes effect.
    pub async fn begin_utterance(&self, stream_sid: &str) {
        let _ = self
            .command_tx
            .send(TtsCommand::SetSink {
                stream_sid: stream_sid.to_string(),
            })
            .await;
    }

    /// Stream a text chunk (LLM token batch or full canned reply)
    pub async fn send_text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let _ = self.command_tx.send(TtsCommand::Text(text.to_string())).await;
    }

    /// Mark end of generation
    pub async fn flush(&self) {
        let _ = self.command_tx.send(TtsCommand::Flush).await;
    }

    /// Barge-in: cancel the in-flight synthesis without closing the socket
    pub async fn cancel(&self) {
        let _ = self.command_tx.send(TtsCommand::Cancel).await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared().connection
    }

    pub fn is_open(&self) -> bool {
        self.shared().connection == ConnectionState::Open
    }

    /// Voice id currently in effect (may be the fallback)
    pub fn voice_id(&self) -> String {
        self.shared().voice_id.clone()
    }

    /// Stream sid currently receiving audio, if any
    pub fn current_sink(&self) -> Option<String> {
        self.shared().sink.clone()
    }
}

// ─── Wire framing ────────────────────────────────────────────

/// Build the open frame some providers require before any text
fn open_frame(flavor: TtsFlavor) -> Option<String> {
    match flavor {
        TtsFlavor::Elevenlabs => Some(r#"{"text":" "}"#.to_string()),
        TtsFlavor::Rime => None,
    }
}

/// Encode a text chunk for the wire
fn text_frame(flavor: TtsFlavor, text: &str) -> String {
    match flavor {
        TtsFlavor::Elevenlabs => serde_json::json!({ "text": text }).to_string(),
        TtsFlavor::Rime => serde_json::json!({ "type": "text", "text": text }).to_string(),
    }
}

/// Encode the end-of-generation marker
fn flush_frame(flavor: TtsFlavor) -> String {
    match flavor {
        TtsFlavor::Elevenlabs => r#"{"text":"","flush":true}"#.to_string(),
        TtsFlavor::Rime => r#"{"type":"flush"}"#.to_string(),
    }
}

/// Keepalive frame sent every 25 s
fn keepalive_frame(flavor: TtsFlavor) -> String {
    match flavor {
        TtsFlavor::Elevenlabs => r#"{"text":" "}"#.to_string(),
        TtsFlavor::Rime => r#"{"type":"ping"}"#.to_string(),
    }
}

/// Decoded provider reply
#[derive(Debug, PartialEq)]
enum Incoming {
    /// μ-law (or PCM, per config) audio bytes
    Audio(Vec<u8>),
    /// Generation complete
    Flushed,
    /// Anything else (alignment data, pings)
    Ignored,
}

/// Parse a text reply frame; both flavors emit JSON text frames, Rime also
/// emits raw binary handled by the caller.
fn parse_text_frame(text: &str) -> Incoming {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Incoming::Ignored,
    };

    if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
        if kind == "Flushed" || kind == "generation_finished" {
            return Incoming::Flushed;
        }
    }
    if value.get("isFinal").and_then(|f| f.as_bool()) == Some(true) {
        return Incoming::Flushed;
    }
    if let Some(audio_b64) = value.get("audio").and_then(|a| a.as_str()) {
        if let Ok(bytes) = BASE64.decode(audio_b64) {
            return Incoming::Audio(bytes);
        }
    }
    Incoming::Ignored
}

/// Whether a close reason indicates the voice id was rejected
fn is_invalid_voice(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("voice") && (lower.contains("invalid") || lower.contains("not found"))
}

/// Convert provider audio to carrier μ-law if the output format is PCM
fn to_mulaw(config: &TtsConfig, bytes: Vec<u8>) -> Vec<u8> {
    if config.output_format.starts_with("ulaw") {
        return bytes;
    }
    // e.g. pcm_22050 → parse rate suffix, resample to 8 kHz, compand
    let rate = config
        .output_format
        .rsplit('_')
        .next()
        .and_then(|r| r.parse().ok())
        .unwrap_or(22050);
    let samples = audio::pcm_bytes_to_linear16(&bytes);
    let resampled = audio::resample_linear16(&samples, rate, 8000);
    audio::linear16_to_mulaw(&resampled)
}

fn build_request(
    config: &TtsConfig,
    voice_id: &str,
) -> anyhow::Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let url = match config.flavor {
        TtsFlavor::Elevenlabs => format!(
            "{}/{}/stream-input?model_id={}&output_format={}",
            config.url, voice_id, config.model, config.output_format
        ),
        TtsFlavor::Rime => format!(
            "{}?speaker={}&audioFormat={}",
            config.url, voice_id, config.output_format
        ),
    };

    let mut request = url.as_str().into_client_request()?;
    match config.flavor {
        TtsFlavor::Elevenlabs => {
            request
                .headers_mut()
                .insert("xi-api-key", config.api_key.parse()?);
        }
        TtsFlavor::Rime => {
            request
                .headers_mut()
                .insert("Authorization", format!("Bearer {}", config.api_key).parse()?);
        }
    }
    Ok(request)
}

// ─── Socket task ─────────────────────────────────────────────

struct SinkState {
    stream_sid: Option<String>,
    /// Set on begin_utterance, cleared after the first audio frame
    awaiting_first_byte: Option<Instant>,
    /// Barge-in mute: drop audio until the generation flushes
    muted_until_flush: bool,
}

async fn run_socket(
    config: TtsConfig,
    registry: SessionRegistry,
    telemetry: Telemetry,
    mut command_rx: mpsc::Receiver<TtsCommand>,
    shared: Arc<Mutex<SharedState>>,
) {
    let mut voice_id = config.voice_id.clone();
    let mut attempts: u32 = 0;
    let mut pending: VecDeque<TtsCommand> = VecDeque::new();
    let mut sink = SinkState {
        stream_sid: None,
        awaiting_first_byte: None,
        muted_until_flush: false,
    };

    loop {
        // Reconnect budget exhausted: park until the next command arrives
        // (the external trigger), then start a fresh budget.
        if attempts >= MAX_RECONNECT_ATTEMPTS {
            warn!("TTS reconnect budget exhausted, waiting for next utterance");
            set_state(&shared, ConnectionState::Closed);
            match command_rx.recv().await {
                Some(cmd) => {
                    queue_pending(&mut pending, cmd);
                    attempts = 0;
                }
                None => return,
            }
        }

        set_state(&shared, ConnectionState::Connecting);
        let request = match build_request(&config, &voice_id) {
            Ok(r) => r,
            Err(e) => {
                error!("TTS request build failed: {}", e);
                set_state(&shared, ConnectionState::Closed);
                return;
            }
        };

        let ws = match connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                attempts += 1;
                let delay = reconnect_delay(attempts);
                warn!("TTS connect failed ({}), retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        info!(voice_id = %voice_id, "TTS connected");
        attempts = 0;
        set_state(&shared, ConnectionState::Open);

        let close_reason = run_connection(
            &config,
            ws,
            &registry,
            &telemetry,
            &mut command_rx,
            &mut pending,
            &mut sink,
            &shared,
        )
        .await;

        set_state(&shared, ConnectionState::Closed);

        match close_reason {
            CloseReason::CommandChannelEnded => return,
            CloseReason::InvalidVoice(reason) => {
                let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
                if state.fell_back {
                    error!("TTS fallback voice also rejected: {}", reason);
                    return;
                }
                warn!(
                    "TTS voice {} rejected ({}), falling back to {}",
                    voice_id, reason, config.fallback_voice_id
                );
                voice_id = config.fallback_voice_id.clone();
                state.fell_back = true;
                state.voice_id = voice_id.clone();
            }
            CloseReason::Dropped(reason) => {
                attempts += 1;
                let delay = reconnect_delay(attempts);
                debug!("TTS closed ({}), reconnecting in {:?}", reason, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

enum CloseReason {
    CommandChannelEnded,
    InvalidVoice(String),
    Dropped(String),
}

fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1 << attempt.min(4))).min(MAX_RECONNECT_DELAY)
}

fn set_state(shared: &Arc<Mutex<SharedState>>, state: ConnectionState) {
    shared.lock().unwrap_or_else(|e| e.into_inner()).connection = state;
}

fn queue_pending(pending: &mut VecDeque<TtsCommand>, cmd: TtsCommand) {
    if pending.len() >= PENDING_CAP {
        pending.pop_front();
    }
    pending.push_back(cmd);
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    config: &TtsConfig,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    registry: &SessionRegistry,
    telemetry: &Telemetry,
    command_rx: &mut mpsc::Receiver<TtsCommand>,
    pending: &mut VecDeque<TtsCommand>,
    sink: &mut SinkState,
    shared: &Arc<Mutex<SharedState>>,
) -> CloseReason {
    let (mut ws_tx, mut ws_rx) = ws.split();

    if let Some(frame) = open_frame(config.flavor) {
        if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
            return CloseReason::Dropped("open frame failed".to_string());
        }
    }

    // Drain commands queued while disconnected
    while let Some(cmd) = pending.pop_front() {
        if let Err(reason) = apply_command(config, &mut ws_tx, registry, sink, shared, cmd).await {
            return CloseReason::Dropped(reason);
        }
    }

    let mut keepalive = tokio::time::interval(Duration::from_secs(config.keepalive_secs));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.reset();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if let Err(reason) =
                            apply_command(config, &mut ws_tx, registry, sink, shared, cmd).await
                        {
                            return CloseReason::Dropped(reason);
                        }
                    }
                    None => {
                        let _ = ws_tx.close().await;
                        return CloseReason::CommandChannelEnded;
                    }
                }
            }

            _ = keepalive.tick() => {
                let frame = keepalive_frame(config.flavor);
                if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                    return CloseReason::Dropped("keepalive failed".to_string());
                }
            }

            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_incoming(
                            config, parse_text_frame(&text), registry, telemetry, sink,
                        ).await;
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        handle_incoming(
                            config, Incoming::Audio(bytes.to_vec()), registry, telemetry, sink,
                        ).await;
                    }
                    Some(Ok(WsMessage::Close(close))) => {
                        let reason = close
                            .map(|c| c.reason.to_string())
                            .unwrap_or_default();
                        if is_invalid_voice(&reason) {
                            return CloseReason::InvalidVoice(reason);
                        }
                        return CloseReason::Dropped(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return CloseReason::Dropped(e.to_string()),
                    None => return CloseReason::Dropped("socket ended".to_string()),
                }
            }
        }
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Apply one orchestrator command to the open socket
async fn apply_command(
    config: &TtsConfig,
    ws_tx: &mut WsSink,
    registry: &SessionRegistry,
    sink: &mut SinkState,
    shared: &Arc<Mutex<SharedState>>,
    cmd: TtsCommand,
) -> Result<(), String> {
    match cmd {
        TtsCommand::SetSink { stream_sid } => {
            // Flush the previous speaker before the switch takes effect
            if let Some(previous) = sink.stream_sid.take() {
                if previous != stream_sid {
                    if let Some(session) = registry.get(&previous) {
                        if session.is_speaking() {
                            let frame = flush_frame(config.flavor);
                            ws_tx
                                .send(WsMessage::Text(frame.into()))
                                .await
                                .map_err(|e| e.to_string())?;
                            session.set_speaking(false);
                        }
                    }
                }
            }
            shared.lock().unwrap_or_else(|e| e.into_inner()).sink = Some(stream_sid.clone());
            sink.stream_sid = Some(stream_sid);
            sink.awaiting_first_byte = Some(Instant::now());
            sink.muted_until_flush = false;
        }
        TtsCommand::Text(text) => {
            let frame = text_frame(config.flavor, &text);
            ws_tx
                .send(WsMessage::Text(frame.into()))
                .await
                .map_err(|e| e.to_string())?;
            if let Some(sid) = &sink.stream_sid {
                if let Some(session) = registry.get(sid) {
                    session.set_speaking(true);
                }
            }
        }
        TtsCommand::Flush => {
            let frame = flush_frame(config.flavor);
            ws_tx
                .send(WsMessage::Text(frame.into()))
                .await
                .map_err(|e| e.to_string())?;
        }
        TtsCommand::Cancel => {
            sink.muted_until_flush = true;
            if let Some(sid) = &sink.stream_sid {
                if let Some(session) = registry.get(sid) {
                    session.set_speaking(false);
                }
            }
            // Flush so the provider finishes the generation we are dropping
            let frame = flush_frame(config.flavor);
            ws_tx
                .send(WsMessage::Text(frame.into()))
                .await
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

/// Route one provider reply to the current sink session
async fn handle_incoming(
    config: &TtsConfig,
    incoming: Incoming,
    registry: &SessionRegistry,
    telemetry: &Telemetry,
    sink: &mut SinkState,
) {
    match incoming {
        Incoming::Audio(bytes) => {
            if sink.muted_until_flush {
                return;
            }
            let Some(sid) = sink.stream_sid.clone() else {
                return;
            };
            let Some(session) = registry.get(&sid) else {
                return;
            };

            if let Some(started) = sink.awaiting_first_byte.take() {
                telemetry.publish(TelemetryEvent::TtsFirstByteMs {
                    stream_sid: sid.clone(),
                    millis: started.elapsed().as_millis() as u64,
                });
            }

            let mulaw = to_mulaw(config, bytes);
            if let Some(tx) = session.media_sender() {
                if tx.send(OutboundFrame::Media(mulaw)).await.is_err() {
                    debug!(stream_sid = %sid, "Sink transport gone, dropping audio");
                }
            }
        }
        Incoming::Flushed => {
            sink.muted_until_flush = false;
            if let Some(sid) = &sink.stream_sid {
                if let Some(session) = registry.get(sid) {
                    session.set_speaking(false);
                    if let Some(tx) = session.media_sender() {
                        let _ = tx
                            .send(OutboundFrame::Mark("generation_end".to_string()))
                            .await;
                    }
                }
            }
        }
        Incoming::Ignored => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevenlabs_frames() {
        assert_eq!(
            text_frame(TtsFlavor::Elevenlabs, "hello"),
            r#"{"text":"hello"}"#
        );
        assert_eq!(flush_frame(TtsFlavor::Elevenlabs), r#"{"text":"","flush":true}"#);
        assert_eq!(open_frame(TtsFlavor::Elevenlabs).unwrap(), r#"{"text":" "}"#);
    }

    #[test]
    fn test_rime_frames() {
        let frame: serde_json::Value =
            serde_json::from_str(&text_frame(TtsFlavor::Rime, "hello")).unwrap();
        assert_eq!(frame["type"], "text");
        assert_eq!(frame["text"], "hello");
        assert_eq!(flush_frame(TtsFlavor::Rime), r#"{"type":"flush"}"#);
        assert!(open_frame(TtsFlavor::Rime).is_none());
    }

    #[test]
    fn test_parse_audio_frame() {
        let payload = BASE64.encode([1u8, 2, 3]);
        let incoming = parse_text_frame(&format!(r#"{{"audio":"{}"}}"#, payload));
        assert_eq!(incoming, Incoming::Audio(vec![1, 2, 3]));
    }

    #[test]
    fn test_parse_flush_markers() {
        assert_eq!(parse_text_frame(r#"{"type":"Flushed"}"#), Incoming::Flushed);
        assert_eq!(
            parse_text_frame(r#"{"type":"generation_finished"}"#),
            Incoming::Flushed
        );
        assert_eq!(
            parse_text_frame(r#"{"audio":null,"isFinal":true}"#),
            Incoming::Flushed
        );
    }

    #[test]
    fn test_parse_garbage_is_ignored() {
        assert_eq!(parse_text_frame("not json"), Incoming::Ignored);
        assert_eq!(parse_text_frame(r#"{"other":1}"#), Incoming::Ignored);
    }

    #[test]
    fn test_invalid_voice_detection() {
        assert!(is_invalid_voice("Invalid voice_id supplied"));
        assert!(is_invalid_voice("voice not found"));
        assert!(!is_invalid_voice("rate limit exceeded"));
        assert!(!is_invalid_voice(""));
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        assert!(reconnect_delay(1) < MAX_RECONNECT_DELAY);
        assert_eq!(reconnect_delay(10), MAX_RECONNECT_DELAY);
    }

    #[test]
    fn test_ulaw_output_passes_through() {
        let config = TtsConfig::default();
        assert_eq!(config.output_format, "ulaw_8000");
        assert_eq!(to_mulaw(&config, vec![0xFF, 0x7F]), vec![0xFF, 0x7F]);
    }

    #[test]
    fn test_pcm_output_is_resampled_and_companded() {
        let config = TtsConfig {
            output_format: "pcm_22050".to_string(),
            ..TtsConfig::default()
        };
        // 22050 samples of PCM (44100 bytes) should become ~8000 μ-law bytes
        let pcm: Vec<u8> = vec![0u8; 22050 * 2];
        let mulaw = to_mulaw(&config, pcm);
        assert_eq!(mulaw.len(), 8000);
        assert!(mulaw.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let mut pending = VecDeque::new();
        for i in 0..(PENDING_CAP + 10) {
            queue_pending(&mut pending, TtsCommand::Text(format!("{}", i)));
        }
        assert_eq!(pending.len(), PENDING_CAP);
    }
}
