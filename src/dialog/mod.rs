//! Appointment dialog graph
//!
//! A directed state machine over [`DialogStep`] values with per-thread
//! checkpointing. The transition function is pure: given a checkpoint and a
//! transcript it always produces the same next checkpoint and prompt, which
//! keeps turn handling deterministic and testable.
//!
//! Replies are canned prompts except the generic small-talk branch, which
//! hands a system prompt to the LLM path.

pub mod checkpoint;
pub mod parse;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use checkpoint::{append_history, CheckpointStore, DialogCheckpoint};

/// Dialog steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogStep {
    Greeting,
    CollectDate,
    ConfirmDate,
    CollectTime,
    ConfirmTime,
    CollectDuration,
    CollectAdditionalDetails,
    FinalConfirmation,
    CollectDetails,
    AppointmentComplete,
    End,
}

impl DialogStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialogStep::Greeting => "greeting",
            DialogStep::CollectDate => "collect_date",
            DialogStep::ConfirmDate => "confirm_date",
            DialogStep::CollectTime => "collect_time",
            DialogStep::ConfirmTime => "confirm_time",
            DialogStep::CollectDuration => "collect_duration",
            DialogStep::CollectAdditionalDetails => "collect_additional_details",
            DialogStep::FinalConfirmation => "final_confirmation",
            DialogStep::CollectDetails => "collect_details",
            DialogStep::AppointmentComplete => "appointment_complete",
            DialogStep::End => "end",
        }
    }
}

/// Result of one graph invocation
#[derive(Debug, Clone)]
pub struct GraphOutcome {
    /// Canned reply to speak directly
    pub reply: Option<String>,
    /// When `reply` is None, drive the streaming LLM with this prompt
    pub system_prompt: Option<String>,
    pub step: DialogStep,
}

const GREETING_PROMPT: &str = "How can I assist you today?";
const ASK_DATE: &str = "I'll help you schedule an appointment. What date would you like?";
const DATE_REPROMPT: &str =
    "I couldn't catch the date. You can say something like 'tomorrow' or '25 august'.";
const PAST_DATE: &str = "Please provide a future date.";
const TIME_REPROMPT: &str = "What time works for you? For example, '11 AM' or '2:30 pm'.";
const DURATION_REPROMPT: &str =
    "How long should it last? You can give a duration like 'one hour' or an end time.";
const GOODBYE: &str = "Perfect! Have a great day. Goodbye!";
const ANYTHING_ELSE: &str = "Is there anything else I can help you with?";
/// Spoken when a turn fails internally; the session stays alive
pub const SAFE_REPLY: &str = "I'm sorry, I had trouble with that. Could you say it again?";

/// System prompt for the small-talk branch handled by the LLM
const GENERAL_ASSIST_PROMPT: &str = "You are a friendly phone assistant for appointment \
scheduling. The caller said something that is not a booking request. Reply in one short \
spoken sentence, mention that you can schedule appointments, and do not use any formatting.";

static BOOKING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(book|schedule|appointment|meeting|reserve|set\s+up|arrange)\b").unwrap()
});

static YES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(yes|yeah|yep|sure|okay|ok)\b").unwrap());

static NO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(no|nope|nothing|goodbye|bye)\b").unwrap());

static ANOTHER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(yes|yeah|sure|schedule|another|again|more)\b").unwrap());

fn canned(reply: impl Into<String>, step: DialogStep) -> GraphOutcome {
    GraphOutcome {
        reply: Some(reply.into()),
        system_prompt: None,
        step,
    }
}

/// The pure transition function. `today` is passed in so the function stays
/// a deterministic mapping of (checkpoint, transcript).
pub fn transition(
    checkpoint: &DialogCheckpoint,
    transcript: &str,
    today: NaiveDate,
) -> (DialogCheckpoint, GraphOutcome) {
    let mut next = checkpoint.clone();
    next.transcript = transcript.to_string();
    let text = transcript.trim();

    let outcome = match checkpoint.current_step {
        DialogStep::Greeting => {
            if text.is_empty() {
                canned(GREETING_PROMPT, DialogStep::Greeting)
            } else if BOOKING_RE.is_match(text) {
                next.meeting_requested = true;
                next.intent = Some("booking".to_string());
                canned(ASK_DATE, DialogStep::CollectDate)
            } else {
                GraphOutcome {
                    reply: None,
                    system_prompt: Some(GENERAL_ASSIST_PROMPT.to_string()),
                    step: DialogStep::Greeting,
                }
            }
        }

        DialogStep::CollectDate => match parse::parse_date(text, today) {
            Some(parsed) => {
                if parse::is_future(parsed.date, today) {
                    next.date = Some(parsed.display.clone());
                    next.date_iso = Some(parsed.date.to_string());
                    canned(
                        format!("Great! I have {}. What time works for you?", parsed.display),
                        DialogStep::CollectTime,
                    )
                } else {
                    canned(PAST_DATE, DialogStep::CollectDate)
                }
            }
            None => canned(DATE_REPROMPT, DialogStep::CollectDate),
        },

        // Stricter confirm variant: kept loadable but routed as re-asks
        DialogStep::ConfirmDate => {
            if YES_RE.is_match(text) {
                canned(
                    format!(
                        "Great! I have {}. What time works for you?",
                        next.date.clone().unwrap_or_default()
                    ),
                    DialogStep::CollectTime,
                )
            } else if NO_RE.is_match(text) {
                next.date = None;
                next.date_iso = None;
                canned("Okay, what date would you like?", DialogStep::CollectDate)
            } else {
                canned(
                    format!(
                        "Just to confirm, did you mean {}?",
                        next.date.clone().unwrap_or_default()
                    ),
                    DialogStep::ConfirmDate,
                )
            }
        }

        DialogStep::CollectTime => match parse::parse_time(text) {
            Some(parsed) => {
                let date = next.date.clone().unwrap_or_default();
                next.time = Some(parsed.display.clone());
                canned(
                    format!(
                        "Perfect! {} on {}. How long should it last? \
                         You can give a duration or an end time.",
                        parsed.display, date
                    ),
                    DialogStep::CollectDuration,
                )
            }
            None => canned(TIME_REPROMPT, DialogStep::CollectTime),
        },

        DialogStep::ConfirmTime => {
            if YES_RE.is_match(text) {
                canned(DURATION_REPROMPT, DialogStep::CollectDuration)
            } else if NO_RE.is_match(text) {
                next.time = None;
                canned(TIME_REPROMPT, DialogStep::CollectTime)
            } else {
                canned(
                    format!(
                        "Just to confirm, did you mean {}?",
                        next.time.clone().unwrap_or_default()
                    ),
                    DialogStep::ConfirmTime,
                )
            }
        }

        DialogStep::CollectDuration => {
            let time = next.time.clone().unwrap_or_default();
            let date = next.date.clone().unwrap_or_default();

            if let Some(hours) = parse::parse_duration_hours(text) {
                next.duration_hours = Some(hours);
                next.appointment_complete = true;
                let unit = if hours == 1 { "hour" } else { "hours" };
                canned(
                    format!(
                        "You're scheduled from {} for {} {} on {}. Do you need any other help?",
                        time, hours, unit, date
                    ),
                    DialogStep::AppointmentComplete,
                )
            } else if let Some(end) = parse::parse_time(text) {
                next.end_time = Some(end.display.clone());
                next.appointment_complete = true;
                canned(
                    format!(
                        "You're scheduled from {} to {} on {}. Do you need any other help?",
                        time, end.display, date
                    ),
                    DialogStep::AppointmentComplete,
                )
            } else {
                canned(DURATION_REPROMPT, DialogStep::CollectDuration)
            }
        }

        DialogStep::FinalConfirmation => {
            if YES_RE.is_match(text) {
                canned(
                    "Sure, what details should I add?",
                    DialogStep::CollectDetails,
                )
            } else if NO_RE.is_match(text) {
                next.appointment_complete = true;
                canned(
                    "You're all set. Do you need any other help?",
                    DialogStep::AppointmentComplete,
                )
            } else {
                canned(
                    "Would you like to add any additional details?",
                    DialogStep::FinalConfirmation,
                )
            }
        }

        DialogStep::CollectDetails | DialogStep::CollectAdditionalDetails => {
            if text.is_empty() {
                canned(
                    "What details should I add?",
                    DialogStep::CollectDetails,
                )
            } else {
                next.additional_details = Some(text.to_string());
                next.appointment_complete = true;
                canned(
                    "Noted, I've added that. Do you need any other help?",
                    DialogStep::AppointmentComplete,
                )
            }
        }

        DialogStep::AppointmentComplete => {
            if NO_RE.is_match(text) {
                canned(GOODBYE, DialogStep::End)
            } else if ANOTHER_RE.is_match(text) {
                next.reset_slots();
                canned(
                    "Great! What date would you like for the next appointment?",
                    DialogStep::CollectDate,
                )
            } else {
                canned(ANYTHING_ELSE, DialogStep::AppointmentComplete)
            }
        }

        DialogStep::End => canned("Goodbye!", DialogStep::End),
    };

    next.current_step = outcome.step;
    (next, outcome)
}

/// The graph plus its checkpoint store
pub struct DialogGraph {
    store: Arc<CheckpointStore>,
    history_limit: usize,
}

impl DialogGraph {
    pub fn new(store: Arc<CheckpointStore>, history_limit: usize) -> Self {
        Self {
            store,
            history_limit,
        }
    }

    pub fn store(&self) -> Arc<CheckpointStore> {
        self.store.clone()
    }

    /// Run one turn for a thread: read the checkpoint, append the inbound
    /// transcript to history, apply the transition, write back. Concurrent
    /// invocations on the same thread id serialize on the thread's lock.
    pub async fn invoke(&self, thread_id: &str, transcript: &str) -> GraphOutcome {
        self.invoke_at(thread_id, transcript, chrono::Local::now().date_naive())
            .await
    }

    /// Like [`invoke`](Self::invoke) with an explicit `today` for testing
    pub async fn invoke_at(
        &self,
        thread_id: &str,
        transcript: &str,
        today: NaiveDate,
    ) -> GraphOutcome {
        let cell = self.store.entry(thread_id);
        let mut checkpoint = cell.lock().await;

        if !transcript.trim().is_empty() {
            append_history(
                &mut checkpoint,
                [format!("user: {}", transcript.trim())],
                self.history_limit,
            );
        }

        let (mut next, outcome) = transition(&checkpoint, transcript, today);

        if let Some(reply) = &outcome.reply {
            append_history(&mut next, [format!("agent: {}", reply)], self.history_limit);
        }

        debug!(
            thread_id,
            step = outcome.step.as_str(),
            "Dialog transition"
        );
        *checkpoint = next;
        outcome
    }

    /// Read a thread's current checkpoint (for workflow routing and tests)
    pub async fn snapshot(&self, thread_id: &str) -> DialogCheckpoint {
        self.store.entry(thread_id).lock().await.clone()
    }
}
