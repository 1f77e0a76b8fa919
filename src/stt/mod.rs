//! Streaming speech-to-text client
//!
//! Maintains one provider WebSocket per call session, forwarding μ-law
//! audio up and surfacing transcription events down. Interim hypotheses
//! drive barge-in; `speech_final` drives turn handling; `UtteranceEnd` is
//! the fallback finalizer when the provider never marked speech-final.
//!
//! Reconnection is classified: auth failures are fatal, rate limits enter a
//! cooldown, and transient drops back off 2/4/8 s (capped, three attempts,
//! reset on a successful open). A process-wide admission counter caps
//! concurrent provider sockets; each socket carries a uuid tag so a leak
//! shows up in logs with an identity.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SttConfig;
use crate::error::ProviderError;

/// Cooldown after the provider rate-limits a connection
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(10);

/// Cap on a single transient backoff step
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Transient reconnect attempts before giving up
const MAX_ATTEMPTS: u32 = 3;

/// Events surfaced to the orchestrator
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// Provider socket opened (greeting readiness gate)
    Open,
    /// Non-final hypothesis
    Interim { text: String, confidence: f32 },
    /// Committed utterance — fires turn handling
    SpeechFinal { text: String },
    /// Silence fallback fired with nothing accumulated
    UtteranceEnd,
    /// Socket closed and no reconnect will follow
    Closed { reason: String },
}

// ─── Admission control ───────────────────────────────────────

/// Process-wide cap on concurrent provider sockets
#[derive(Clone)]
pub struct SttAdmission {
    max: usize,
    count: Arc<AtomicUsize>,
}

impl SttAdmission {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Try to admit one more socket. Returns None when saturated; the
    /// transport arranges a retry in 5 s.
    pub fn try_acquire(&self) -> Option<SttPermit> {
        let mut current = self.count.load(Ordering::SeqCst);
        loop {
            if current >= self.max {
                return None;
            }
            match self.count.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let tag = Uuid::new_v4();
                    debug!(%tag, "STT connection admitted ({}/{})", current + 1, self.max);
                    return Some(SttPermit {
                        tag,
                        count: self.count.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Currently open sockets
    pub fn in_use(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// One admitted socket. Dropping releases the slot exactly once, whether
/// the socket closed by request or by the peer.
pub struct SttPermit {
    pub tag: Uuid,
    count: Arc<AtomicUsize>,
}

impl Drop for SttPermit {
    fn drop(&mut self) {
        let before = self.count.fetch_sub(1, Ordering::SeqCst);
        debug!(tag = %self.tag, "STT connection released ({} remain)", before - 1);
    }
}

// ─── Reconnect policy ────────────────────────────────────────

/// Classified reconnect decision
#[derive(Debug, PartialEq)]
pub enum Reconnect {
    /// Wait this long, then try again
    After(Duration),
    /// Cooldown window; do not reconnect inside it
    Cooldown(Duration),
    /// Fatal for this provider
    Never,
}

/// Tracks transient attempts across one socket's lifetime
#[derive(Debug, Default)]
pub struct ReconnectPolicy {
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A successful open resets the transient budget
    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// Classify a failure into the next action
    pub fn on_failure(&mut self, error: &ProviderError) -> Reconnect {
        match error {
            ProviderError::Auth(_) => Reconnect::Never,
            ProviderError::RateLimited(_) => Reconnect::Cooldown(RATE_LIMIT_COOLDOWN),
            _ => {
                self.attempts += 1;
                if self.attempts > MAX_ATTEMPTS {
                    return Reconnect::Never;
                }
                let backoff = Duration::from_secs(2u64 << (self.attempts - 1));
                Reconnect::After(backoff.min(MAX_BACKOFF))
            }
        }
    }
}

// ─── Provider wire format ────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ProviderFrame {
    Results {
        #[serde(default)]
        channel: Channel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    UtteranceEnd {},
    Metadata {},
    SpeechStarted {},
}

#[derive(Debug, Default, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// Build the provider URL with the live-transcription query parameters
fn build_url(config: &SttConfig) -> Result<url::Url> {
    let mut url = url::Url::parse(&config.url).context("Invalid STT url")?;
    url.query_pairs_mut()
        .append_pair("model", &config.model)
        .append_pair("language", &config.language)
        .append_pair("smart_format", "true")
        .append_pair("encoding", "mulaw")
        .append_pair("sample_rate", "8000")
        .append_pair("channels", "1")
        .append_pair("interim_results", "true")
        .append_pair("endpointing", &config.endpointing_ms.to_string())
        .append_pair("utterance_end_ms", &config.utterance_end_ms.to_string())
        .append_pair("vad_events", "true")
        .append_pair("keep_alive", "true");
    Ok(url)
}

/// Handle to one session's STT pipeline
pub struct SttHandle {
    /// Feed inbound μ-law audio here
    pub audio_tx: mpsc::Sender<Vec<u8>>,
    task: tokio::task::JoinHandle<()>,
}

impl SttHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the socket task for one session.
///
/// Returns None when admission is saturated. Events flow to `events_tx`;
/// the task ends when the session's `closed` watch flips, the provider
/// closes fatally, or the reconnect budget runs out.
pub fn spawn(
    config: SttConfig,
    admission: &SttAdmission,
    events_tx: mpsc::Sender<SttEvent>,
    closed: watch::Receiver<bool>,
) -> Option<SttHandle> {
    let permit = admission.try_acquire()?;
    let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(256);

    let task = tokio::spawn(async move {
        run_socket(config, permit, audio_rx, events_tx, closed).await;
    });

    Some(SttHandle { audio_tx, task })
}

/// Connect/reconnect loop owning the provider socket
async fn run_socket(
    config: SttConfig,
    permit: SttPermit,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    events_tx: mpsc::Sender<SttEvent>,
    mut closed: watch::Receiver<bool>,
) {
    let tag = permit.tag;
    let mut policy = ReconnectPolicy::new();

    loop {
        let outcome = run_connection(
            &config,
            tag,
            &mut audio_rx,
            &events_tx,
            &mut closed,
            &mut policy,
        )
        .await;

        let error = match outcome {
            ConnectionOutcome::SessionClosed | ConnectionOutcome::CleanClose => {
                let _ = events_tx
                    .send(SttEvent::Closed {
                        reason: "closed".to_string(),
                    })
                    .await;
                return;
            }
            ConnectionOutcome::Failed(e) => e,
        };

        match policy.on_failure(&error) {
            Reconnect::After(delay) => {
                warn!(%tag, "STT reconnecting in {:?}: {}", delay, error);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = closed.changed() => return,
                }
            }
            Reconnect::Cooldown(window) => {
                warn!(%tag, "STT rate limited, cooling down {:?}", window);
                tokio::select! {
                    _ = tokio::time::sleep(window) => {}
                    _ = closed.changed() => return,
                }
                let _ = events_tx
                    .send(SttEvent::Closed {
                        reason: "rate_limited".to_string(),
                    })
                    .await;
                return;
            }
            Reconnect::Never => {
                error!(%tag, "STT fatal: {}", error);
                let _ = events_tx
                    .send(SttEvent::Closed {
                        reason: error.to_string(),
                    })
                    .await;
                return;
            }
        }
    }
}

enum ConnectionOutcome {
    SessionClosed,
    CleanClose,
    Failed(ProviderError),
}

/// One connection attempt and its read/write loop
async fn run_connection(
    config: &SttConfig,
    tag: Uuid,
    audio_rx: &mut mpsc::Receiver<Vec<u8>>,
    events_tx: &mpsc::Sender<SttEvent>,
    closed: &mut watch::Receiver<bool>,
    policy: &mut ReconnectPolicy,
) -> ConnectionOutcome {
    let url = match build_url(config) {
        Ok(url) => url,
        Err(e) => return ConnectionOutcome::Failed(ProviderError::Internal(e.to_string())),
    };

    let mut request = match url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => return ConnectionOutcome::Failed(ProviderError::Internal(e.to_string())),
    };
    if let Ok(value) = format!("Token {}", config.api_key).parse() {
        request.headers_mut().insert("Authorization", value);
    }

    let (ws, _) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            let text = e.to_string();
            let error = if text.contains("401") || text.contains("403") {
                ProviderError::Auth(text)
            } else if text.contains("429") {
                ProviderError::RateLimited(text)
            } else {
                ProviderError::Transient(text)
            };
            return ConnectionOutcome::Failed(error);
        }
    };

    info!(%tag, "STT connected");
    policy.on_open();
    let _ = events_tx.send(SttEvent::Open).await;

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut keepalive = tokio::time::interval(Duration::from_secs(config.keepalive_secs));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // is_final segments accumulate here until speech_final or UtteranceEnd
    let mut pending_segments: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            _ = closed.changed() => {
                let _ = ws_tx
                    .send(WsMessage::Text(r#"{"type":"CloseStream"}"#.into()))
                    .await;
                let _ = ws_tx.close().await;
                return ConnectionOutcome::SessionClosed;
            }

            _ = keepalive.tick() => {
                if let Err(e) = ws_tx
                    .send(WsMessage::Text(r#"{"type":"KeepAlive"}"#.into()))
                    .await
                {
                    return ConnectionOutcome::Failed(ProviderError::Transient(e.to_string()));
                }
            }

            audio = audio_rx.recv() => {
                match audio {
                    Some(bytes) => {
                        if let Err(e) = ws_tx.send(WsMessage::Binary(bytes.into())).await {
                            return ConnectionOutcome::Failed(
                                ProviderError::Transient(e.to_string()),
                            );
                        }
                    }
                    None => {
                        let _ = ws_tx.close().await;
                        return ConnectionOutcome::CleanClose;
                    }
                }
            }

            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_provider_frame(&text, &mut pending_segments, events_tx).await;
                    }
                    Some(Ok(WsMessage::Close(close))) => {
                        let (code, reason) = close
                            .map(|c| (u16::from(c.code), c.reason.to_string()))
                            .unwrap_or((1000, String::new()));
                        if code == 1000 {
                            return ConnectionOutcome::CleanClose;
                        }
                        return ConnectionOutcome::Failed(ProviderError::from_status(
                            code_to_status(code, &reason),
                            reason,
                        ));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return ConnectionOutcome::Failed(
                            ProviderError::Transient(e.to_string()),
                        );
                    }
                    None => {
                        return ConnectionOutcome::Failed(
                            ProviderError::Transient("socket ended".to_string()),
                        );
                    }
                }
            }
        }
    }
}

/// Map a WS close code plus reason text onto an HTTP-style status
fn code_to_status(code: u16, reason: &str) -> u16 {
    if reason.contains("401") {
        401
    } else if reason.contains("403") {
        403
    } else if reason.contains("429") {
        429
    } else {
        // 4000-range provider codes are treated as transient
        let _ = code;
        500
    }
}

/// Parse one provider frame and emit events
async fn handle_provider_frame(
    text: &str,
    pending_segments: &mut Vec<String>,
    events_tx: &mpsc::Sender<SttEvent>,
) {
    let frame: ProviderFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!("Unparseable STT frame: {}", e);
            return;
        }
    };

    match frame {
        ProviderFrame::Results {
            channel,
            is_final,
            speech_final,
        } => {
            let (transcript, confidence) = channel
                .alternatives
                .first()
                .map(|a| (a.transcript.trim().to_string(), a.confidence))
                .unwrap_or_default();

            if transcript.is_empty() {
                return;
            }

            if speech_final {
                pending_segments.push(transcript);
                let utterance = pending_segments.join(" ");
                pending_segments.clear();
                let _ = events_tx.send(SttEvent::SpeechFinal { text: utterance }).await;
            } else if is_final {
                pending_segments.push(transcript);
            } else {
                let _ = events_tx
                    .send(SttEvent::Interim {
                        text: transcript,
                        confidence,
                    })
                    .await;
            }
        }
        ProviderFrame::UtteranceEnd {} => {
            if pending_segments.is_empty() {
                let _ = events_tx.send(SttEvent::UtteranceEnd).await;
            } else {
                // The provider went quiet without speech_final; finalize
                // what we have so the turn is not lost
                let utterance = pending_segments.join(" ");
                pending_segments.clear();
                let _ = events_tx.send(SttEvent::SpeechFinal { text: utterance }).await;
            }
        }
        ProviderFrame::Metadata {} | ProviderFrame::SpeechStarted {} => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_counter_is_conserved() {
        let admission = SttAdmission::new(2);
        assert_eq!(admission.in_use(), 0);

        let a = admission.try_acquire().unwrap();
        let b = admission.try_acquire().unwrap();
        assert_eq!(admission.in_use(), 2);
        assert!(admission.try_acquire().is_none());

        drop(a);
        assert_eq!(admission.in_use(), 1);
        let c = admission.try_acquire().unwrap();
        assert_eq!(admission.in_use(), 2);

        drop(b);
        drop(c);
        assert_eq!(admission.in_use(), 0);
    }

    #[test]
    fn test_admission_random_churn_returns_to_zero() {
        let admission = SttAdmission::new(4);
        let mut held = Vec::new();
        for i in 0..100 {
            if i % 3 == 0 {
                held.pop();
            } else if let Some(permit) = admission.try_acquire() {
                held.push(permit);
            }
            assert!(admission.in_use() <= 4);
            assert_eq!(admission.in_use(), held.len());
        }
        held.clear();
        assert_eq!(admission.in_use(), 0);
    }

    #[test]
    fn test_reconnect_backoff_sequence() {
        let mut policy = ReconnectPolicy::new();
        let transient = ProviderError::Transient("drop".into());
        assert_eq!(
            policy.on_failure(&transient),
            Reconnect::After(Duration::from_secs(2))
        );
        assert_eq!(
            policy.on_failure(&transient),
            Reconnect::After(Duration::from_secs(4))
        );
        assert_eq!(
            policy.on_failure(&transient),
            Reconnect::After(Duration::from_secs(8))
        );
        assert_eq!(policy.on_failure(&transient), Reconnect::Never);
    }

    #[test]
    fn test_reconnect_resets_on_open() {
        let mut policy = ReconnectPolicy::new();
        let transient = ProviderError::Transient("drop".into());
        policy.on_failure(&transient);
        policy.on_failure(&transient);
        policy.on_open();
        assert_eq!(
            policy.on_failure(&transient),
            Reconnect::After(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_auth_never_reconnects() {
        let mut policy = ReconnectPolicy::new();
        assert_eq!(
            policy.on_failure(&ProviderError::Auth("401".into())),
            Reconnect::Never
        );
    }

    #[test]
    fn test_rate_limit_enters_cooldown() {
        let mut policy = ReconnectPolicy::new();
        assert_eq!(
            policy.on_failure(&ProviderError::RateLimited("429".into())),
            Reconnect::Cooldown(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_url_carries_spec_parameters() {
        let url = build_url(&SttConfig::default()).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("encoding=mulaw"));
        assert!(query.contains("sample_rate=8000"));
        assert!(query.contains("channels=1"));
        assert!(query.contains("interim_results=true"));
        assert!(query.contains("endpointing=500"));
        assert!(query.contains("utterance_end_ms=1500"));
        assert!(query.contains("smart_format=true"));
    }

    #[tokio::test]
    async fn test_speech_final_concatenates_segments() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pending = Vec::new();

        handle_provider_frame(
            r#"{"type":"Results","channel":{"alternatives":[{"transcript":"I want to","confidence":0.9}]},"is_final":true,"speech_final":false}"#,
            &mut pending,
            &tx,
        )
        .await;
        handle_provider_frame(
            r#"{"type":"Results","channel":{"alternatives":[{"transcript":"book a meeting","confidence":0.92}]},"is_final":true,"speech_final":true}"#,
            &mut pending,
            &tx,
        )
        .await;

        match rx.recv().await.unwrap() {
            SttEvent::SpeechFinal { text } => assert_eq!(text, "I want to book a meeting"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_utterance_end_finalizes_pending() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pending = vec!["tomorrow".to_string()];

        handle_provider_frame(r#"{"type":"UtteranceEnd"}"#, &mut pending, &tx).await;

        match rx.recv().await.unwrap() {
            SttEvent::SpeechFinal { text } => assert_eq!(text, "tomorrow"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_interim_event_carries_confidence() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut pending = Vec::new();

        handle_provider_frame(
            r#"{"type":"Results","channel":{"alternatives":[{"transcript":"ok","confidence":0.9}]},"is_final":false,"speech_final":false}"#,
            &mut pending,
            &tx,
        )
        .await;

        match rx.recv().await.unwrap() {
            SttEvent::Interim { text, confidence } => {
                assert_eq!(text, "ok");
                assert!((confidence - 0.9).abs() < f32::EPSILON);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_close_code_classification() {
        assert_eq!(code_to_status(4001, "401 unauthorized"), 401);
        assert_eq!(code_to_status(1011, "too many requests 429"), 429);
        assert_eq!(code_to_status(1006, "abnormal"), 500);
    }
}
