//! Call orchestrator
//!
//! The per-utterance turn driver. Wires the transport, STT, dialog graph,
//! delay workflows, language handling, interruption manager, and TTS
//! together per session.
//!
//! Ordering: speech-finals for one session flow through a per-session turn
//! queue processed by a single task, so a turn (graph + LLM + TTS flush)
//! completes before the next one dispatches. Interim hypotheses are handled
//! off the queue so barge-in stays prompt, but it only ever cancels the
//! in-flight synthesis — turns are never reordered.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dialog::{DialogGraph, DialogStep, GraphOutcome, SAFE_REPLY};
use crate::interrupt;
use crate::language;
use crate::llm::{ChatMessage, LlmClient};
use crate::phonebook::CallerRole;
use crate::session::{CallSession, SessionRegistry};
use crate::stt::{self, SttAdmission, SttEvent, SttHandle};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::tts::TtsManager;
use crate::workflow::customer::CustomerDelayFlow;
use crate::workflow::teammate::TeammateFlow;

/// Retry interval when STT admission is saturated
const STT_RETRY: Duration = Duration::from_secs(5);

/// How long the greeting waits for the TTS socket to open
const GREETING_TTS_WAIT: Duration = Duration::from_millis(300);
const GREETING_TTS_TRIES: u32 = 10;

#[derive(Default)]
struct OrchestratorState {
    stt_handles: HashMap<String, SttHandle>,
    stt_ready: HashSet<String>,
    turn_queues: HashMap<String, mpsc::Sender<String>>,
    customer_conversations: HashMap<String, Vec<ChatMessage>>,
    /// Reply currently being spoken, kept so barge-in can record what was cut
    current_replies: HashMap<String, String>,
}

/// Session-spanning pipeline driver
pub struct Orchestrator {
    config: Arc<Config>,
    registry: SessionRegistry,
    telemetry: Telemetry,
    llm: LlmClient,
    tts: TtsManager,
    stt_admission: SttAdmission,
    graph: DialogGraph,
    teammate: Arc<TeammateFlow>,
    customer: Arc<CustomerDelayFlow>,
    state: Mutex<OrchestratorState>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        registry: SessionRegistry,
        telemetry: Telemetry,
        llm: LlmClient,
        tts: TtsManager,
        stt_admission: SttAdmission,
        graph: DialogGraph,
        teammate: Arc<TeammateFlow>,
        customer: Arc<CustomerDelayFlow>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            config,
            registry: registry.clone(),
            telemetry,
            llm,
            tts,
            stt_admission,
            graph,
            teammate,
            customer,
            state: Mutex::new(OrchestratorState::default()),
        });

        // Dialog state dies with the session
        let store = orchestrator.graph.store();
        registry.register_teardown(Box::new(move |stream_sid| {
            store.remove(stream_sid);
        }));

        orchestrator
    }

    fn state(&self) -> std::sync::MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transport accepted a stream: bring up STT and the turn queue
    pub async fn on_session_started(self: &Arc<Self>, session: Arc<CallSession>) {
        let stream_sid = session.stream_sid.clone();

        let (turn_tx, turn_rx) = mpsc::channel::<String>(16);
        self.state()
            .turn_queues
            .insert(stream_sid.clone(), turn_tx);

        // Turn loop: strictly in-order, one at a time
        let this = self.clone();
        let turn_session = session.clone();
        tokio::spawn(async move {
            let mut turn_rx = turn_rx;
            while let Some(text) = turn_rx.recv().await {
                this.handle_turn(&turn_session, &text).await;
            }
        });

        self.start_stt(session).await;
    }

    /// Connect STT, retrying while admission is saturated
    fn start_stt(
        self: &Arc<Self>,
        session: Arc<CallSession>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let (events_tx, events_rx) = mpsc::channel::<SttEvent>(64);

        let handle = stt::spawn(
            self.config.stt.clone(),
            &self.stt_admission,
            events_tx,
            session.closed(),
        );

        match handle {
            Some(handle) => {
                self.state()
                    .stt_handles
                    .insert(session.stream_sid.clone(), handle);
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_stt_events(session, events_rx).await;
                });
            }
            None => {
                warn!(
                    stream_sid = %session.stream_sid,
                    "STT saturated, retrying in {:?}", STT_RETRY
                );
                let this = self.clone();
                tokio::spawn(async move {
                    let mut closed = session.closed();
                    tokio::select! {
                        _ = tokio::time::sleep(STT_RETRY) => {
                            this.start_stt(session).await;
                        }
                        _ = closed.changed() => {}
                    }
                });
            }
        }
        })
    }

    /// Per-session STT event loop
    async fn run_stt_events(
        self: &Arc<Self>,
        session: Arc<CallSession>,
        mut events_rx: mpsc::Receiver<SttEvent>,
    ) {
        let stream_sid = session.stream_sid.clone();

        while let Some(event) = events_rx.recv().await {
            match event {
                SttEvent::Open => {
                    self.state().stt_ready.insert(stream_sid.clone());
                    self.maybe_greet(&session).await;
                }
                SttEvent::Interim { text, confidence } => {
                    session.touch();
                    self.telemetry.publish(TelemetryEvent::TranscriptPartial {
                        stream_sid: stream_sid.clone(),
                        text: text.clone(),
                    });
                    self.handle_interim(&session, &text, confidence).await;
                }
                SttEvent::SpeechFinal { text } => {
                    session.touch();
                    self.telemetry.publish(TelemetryEvent::TranscriptFinal {
                        stream_sid: stream_sid.clone(),
                        text: text.clone(),
                    });
                    let queue = self.state().turn_queues.get(&stream_sid).cloned();
                    if let Some(queue) = queue {
                        if queue.send(text).await.is_err() {
                            debug!(stream_sid = %stream_sid, "Turn queue gone");
                        }
                    }
                }
                SttEvent::UtteranceEnd => {
                    debug!(stream_sid = %stream_sid, "Utterance end with no pending speech");
                }
                SttEvent::Closed { reason } => {
                    debug!(stream_sid = %stream_sid, reason, "STT stream closed");
                }
            }
        }
    }

    /// Interim hypothesis → barge-in decision
    async fn handle_interim(&self, session: &Arc<CallSession>, text: &str, confidence: f32) {
        if !session.is_speaking() {
            return;
        }
        let decision = interrupt::classify(text, &session.language(), confidence);
        if decision.interrupt {
            let interrupted = self
                .state()
                .current_replies
                .get(&session.stream_sid)
                .cloned();
            interrupt::execute(&decision, session.clone(), self.tts.clone(), interrupted).await;
        }
    }

    /// First media frame arrived for a session
    pub async fn on_inbound_audio(self: &Arc<Self>, stream_sid: &str, mulaw: Vec<u8>) {
        let Some(session) = self.registry.get(stream_sid) else {
            return;
        };
        session.touch();

        if session.claim_first_media() {
            self.maybe_greet(&session).await;
        }

        let audio_tx = self
            .state()
            .stt_handles
            .get(stream_sid)
            .map(|h| h.audio_tx.clone());
        if let Some(audio_tx) = audio_tx {
            // Never let a slow provider block the carrier reader
            if audio_tx.try_send(mulaw).is_err() {
                debug!(stream_sid, "STT backpressure, dropping frame");
            }
        }
    }

    /// Greet once both directions of the pipeline are up
    async fn maybe_greet(self: &Arc<Self>, session: &Arc<CallSession>) {
        if !self.state().stt_ready.contains(&session.stream_sid) {
            return;
        }
        if !session.claim_greeting() {
            return;
        }

        let this = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            for _ in 0..GREETING_TTS_TRIES {
                if this.tts.is_open() {
                    break;
                }
                tokio::time::sleep(GREETING_TTS_WAIT).await;
            }
            let queue = this.state().turn_queues.get(&session.stream_sid).cloned();
            if let Some(queue) = queue {
                let _ = queue.send(String::new()).await;
            }
        });
    }

    /// One full turn: route by caller kind, produce a reply, speak it
    async fn handle_turn(self: &Arc<Self>, session: &Arc<CallSession>, text: &str) {
        let stream_sid = session.stream_sid.clone();

        if !text.is_empty() {
            let detected = language::detect_input_language(text);
            session.set_language(detected);
        }

        // Outbound delay leg → customer tool-calling flow
        if let Some(delay) = session.delay_data() {
            let mut conversation = self
                .state()
                .customer_conversations
                .remove(&stream_sid)
                .unwrap_or_default();
            let turn = self
                .customer
                .run_turn(&delay, &mut conversation, text)
                .await;
            self.state()
                .customer_conversations
                .insert(stream_sid.clone(), conversation);

            self.speak(session, &turn.reply).await;
            if turn.done {
                info!(stream_sid = %stream_sid, "Customer flow complete");
                session.mark_ending();
            }
            return;
        }

        // Teammate → delay-processing procedure
        if session
            .caller()
            .map(|c| c.role == CallerRole::Teammate)
            .unwrap_or(false)
        {
            let reply = if text.is_empty() {
                self.teammate.greet(session).await
            } else {
                self.teammate.handle_turn(session, text).await
            };
            self.speak(session, &reply).await;
            return;
        }

        // Everyone else → the booking graph
        let outcome = self.graph.invoke(&session.thread_id(), text).await;
        self.registry
            .set_dialog_state(&stream_sid, outcome.step.as_str());
        self.telemetry.publish(TelemetryEvent::GraphResult {
            stream_sid: stream_sid.clone(),
            step: outcome.step.as_str().to_string(),
            reply: outcome.reply.clone().unwrap_or_default(),
        });

        self.speak_outcome(session, &outcome, text).await;

        if outcome.step == DialogStep::End {
            info!(stream_sid = %stream_sid, "Dialog reached end");
            session.mark_ending();
        }
    }

    /// Speak a graph outcome: canned reply directly, or stream the LLM
    async fn speak_outcome(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        outcome: &GraphOutcome,
        transcript: &str,
    ) {
        if let Some(reply) = &outcome.reply {
            self.speak(session, reply).await;
            return;
        }

        let Some(system_prompt) = &outcome.system_prompt else {
            self.speak(session, SAFE_REPLY).await;
            return;
        };

        // Streamed path: pipe LLM deltas straight into TTS
        let stream_sid = session.stream_sid.clone();
        self.tts.begin_utterance(&stream_sid).await;
        session.set_speaking(true);

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let tts = self.tts.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                tts.send_text(&chunk).await;
            }
        });

        let messages = vec![
            ChatMessage::system(system_prompt.clone()),
            ChatMessage::user(transcript.to_string()),
        ];
        let started = Instant::now();
        let mut first_token: Option<Duration> = None;

        let result = self
            .llm
            .stream_complete(messages, |chunk| {
                if first_token.is_none() {
                    first_token = Some(started.elapsed());
                }
                let _ = chunk_tx.send(chunk.to_string());
            })
            .await;

        drop(chunk_tx);
        let _ = forwarder.await;

        match result {
            Ok(full) if !full.trim().is_empty() => {
                if let Some(latency) = first_token {
                    self.telemetry.publish(TelemetryEvent::LlmFirstTokenMs {
                        stream_sid: stream_sid.clone(),
                        millis: latency.as_millis() as u64,
                    });
                }
                self.state()
                    .current_replies
                    .insert(stream_sid.clone(), full);
                self.tts.flush().await;
            }
            Ok(_) => {
                self.tts.send_text(SAFE_REPLY).await;
                self.tts.flush().await;
            }
            Err(e) => {
                error!(stream_sid = %stream_sid, "LLM stream failed: {}", e);
                self.telemetry.publish(TelemetryEvent::GraphError {
                    stream_sid: stream_sid.clone(),
                    message: e.to_string(),
                });
                self.tts.send_text(SAFE_REPLY).await;
                self.tts.flush().await;
            }
        }
    }

    /// Canned-reply path: translate if the deploy targets Hindi, then speak
    async fn speak(&self, session: &Arc<CallSession>, reply: &str) {
        if reply.is_empty() {
            return;
        }

        let spoken = language::translate_if_needed(
            &self.llm,
            reply,
            &self.config.tts.language,
            &session.language(),
        )
        .await;

        self.state()
            .current_replies
            .insert(session.stream_sid.clone(), spoken.clone());
        self.tts.begin_utterance(&session.stream_sid).await;
        session.set_speaking(true);
        self.tts.send_text(&spoken).await;
        self.tts.flush().await;
    }

    /// Transport closed: tear down this session's pipeline pieces
    pub async fn on_session_closed(self: &Arc<Self>, stream_sid: &str) {
        let handle = {
            let mut state = self.state();
            state.stt_ready.remove(stream_sid);
            state.turn_queues.remove(stream_sid);
            state.customer_conversations.remove(stream_sid);
            state.current_replies.remove(stream_sid);
            state.stt_handles.remove(stream_sid)
        };
        if let Some(handle) = handle {
            handle.abort();
        }

        // Step 7 of the delay workflow fires once the teammate hangs up
        self.teammate.on_call_ended(stream_sid);
    }

    /// Live STT socket count (health endpoint)
    pub fn stt_connections(&self) -> usize {
        self.stt_admission.in_use()
    }
}
