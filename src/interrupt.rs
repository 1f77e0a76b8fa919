//! Barge-in classification and execution
//!
//! Interim STT hypotheses arrive while the agent is speaking. Most of them
//! are backchannel noise — "ok", "haan bilkul", "ja genau" — and must not
//! cut the agent off. Emergency phrases must cut it off instantly no matter
//! how short or low-confidence the hypothesis is. Everything else passes
//! per-language length/confidence gates before a gentle interruption.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::session::CallSession;
use crate::telephony::OutboundFrame;
use crate::tts::TtsManager;

/// Moderate interruptions finish the current word first
const MODERATE_DELAY: Duration = Duration::from_millis(200);

/// Gentle interruptions let the sentence land first
const GENTLE_DELAY: Duration = Duration::from_millis(500);

/// How urgently to interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLevel {
    None,
    Gentle,
    Moderate,
    Immediate,
}

/// Outcome of classifying one interim hypothesis
#[derive(Debug, Clone)]
pub struct InterruptionDecision {
    pub interrupt: bool,
    pub level: InterruptLevel,
    pub reason: &'static str,
    pub language: String,
    pub details: String,
}

impl InterruptionDecision {
    fn keep_speaking(reason: &'static str, language: &str, details: String) -> Self {
        Self {
            interrupt: false,
            level: InterruptLevel::None,
            reason,
            language: language.to_string(),
            details,
        }
    }

    fn interrupt(level: InterruptLevel, reason: &'static str, language: &str, details: String) -> Self {
        Self {
            interrupt: true,
            level,
            reason,
            language: language.to_string(),
            details,
        }
    }
}

struct LanguageProfile {
    /// Exact acknowledgment phrases (compared on the cleaned transcript)
    acknowledgments: &'static [&'static str],
    /// Words ignored when counting meaningful words
    fillers: &'static [&'static str],
    emergency: &'static Lazy<Regex>,
    intent_change: &'static Lazy<Regex>,
    min_length: usize,
    min_confidence: f32,
}

static EN_EMERGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(stop|wait|hold on|cancel|help|emergency|shut up|no no)\b").unwrap()
});
static EN_INTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(actually|instead|rather|i want|i need|i meant|change|different)\b").unwrap()
});

static HI_EMERGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(ruko|rukiye|roko|band karo|cancel|madad|help|nahi nahi|रुको|बंद करो|मदद)\b")
        .unwrap()
});
static HI_INTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(asal mein|balki|mujhe chahiye|badal do|matlab|दरअसल|बदल दो)\b").unwrap()
});

static DE_EMERGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(stopp|stop|halt|warte|abbrechen|hilfe)\b").unwrap()
});
static DE_INTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(eigentlich|stattdessen|ich möchte|ich will|lieber|anders)\b").unwrap()
});

static RU_EMERGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(стоп|подожди|подождите|отмена|помогите|хватит)\b").unwrap()
});
static RU_INTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(вообще|вместо|я хочу|я имел в виду|поменяй)\b").unwrap()
});

static EN_PROFILE: LanguageProfile = LanguageProfile {
    acknowledgments: &[
        "ok", "okay", "yes", "yeah", "yep", "sure", "right", "mhm", "mm", "uh huh", "hmm",
        "alright", "got it", "i see", "sounds good", "that's fine", "no problem", "great",
        "perfect", "cool", "yes please", "okay great", "sounds good to me",
    ],
    fillers: &["um", "uh", "like", "well", "so", "you", "know", "hmm", "mhm", "a", "the"],
    emergency: &EN_EMERGENCY,
    intent_change: &EN_INTENT,
    min_length: 8,
    min_confidence: 0.80,
};

static HI_PROFILE: LanguageProfile = LanguageProfile {
    acknowledgments: &[
        "haan", "ha", "ji", "ji haan", "haan bilkul", "bilkul", "theek hai", "thik hai",
        "accha", "acha", "sahi hai", "ok", "okay", "hmm", "haan ji", "ठीक है", "हाँ", "अच्छा",
    ],
    fillers: &["toh", "na", "ji", "arre", "bas", "hmm"],
    emergency: &HI_EMERGENCY,
    intent_change: &HI_INTENT,
    min_length: 3,
    min_confidence: 0.75,
};

static DE_PROFILE: LanguageProfile = LanguageProfile {
    acknowledgments: &[
        "ja", "ja genau", "genau", "okay", "ok", "gut", "alles klar", "stimmt", "richtig",
        "mhm", "verstehe", "klar", "sehr gut",
    ],
    fillers: &["äh", "ähm", "also", "halt", "mal", "ja"],
    emergency: &DE_EMERGENCY,
    intent_change: &DE_INTENT,
    min_length: 8,
    min_confidence: 0.80,
};

static RU_PROFILE: LanguageProfile = LanguageProfile {
    acknowledgments: &[
        "да", "ага", "угу", "хорошо", "ладно", "понятно", "конечно", "да да", "точно",
    ],
    fillers: &["ну", "вот", "это", "как бы"],
    emergency: &RU_EMERGENCY,
    intent_change: &RU_INTENT,
    min_length: 3,
    min_confidence: 0.75,
};

fn profile_for(language: &str) -> &'static LanguageProfile {
    match language {
        "hi" => &HI_PROFILE,
        "de" => &DE_PROFILE,
        "ru" => &RU_PROFILE,
        _ => &EN_PROFILE,
    }
}

/// Strip punctuation and collapse whitespace for matching
fn clean(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classify one interim hypothesis under a known language.
///
/// Decision order: empty → acknowledgment → emergency → intent change →
/// standard thresholds. Emergencies bypass the length and confidence gates.
pub fn classify(text: &str, language: &str, confidence: f32) -> InterruptionDecision {
    let cleaned = clean(text);

    if cleaned.is_empty() {
        return InterruptionDecision::keep_speaking("empty", language, cleaned);
    }

    let profile = profile_for(language);

    if profile.acknowledgments.contains(&cleaned.as_str()) {
        return InterruptionDecision::keep_speaking("acknowledgment", language, cleaned);
    }

    if profile.emergency.is_match(&cleaned) {
        return InterruptionDecision::interrupt(
            InterruptLevel::Immediate,
            "emergency",
            language,
            cleaned,
        );
    }

    if profile.intent_change.is_match(&cleaned) {
        return InterruptionDecision::interrupt(
            InterruptLevel::Moderate,
            "intent_change",
            language,
            cleaned,
        );
    }

    if cleaned.chars().filter(|c| !c.is_whitespace()).count() < profile.min_length {
        return InterruptionDecision::keep_speaking("too_short", language, cleaned);
    }
    if confidence < profile.min_confidence {
        return InterruptionDecision::keep_speaking("low_confidence", language, cleaned);
    }

    let meaningful = cleaned
        .split_whitespace()
        .filter(|w| w.len() > 1 && !profile.fillers.contains(w))
        .count();
    if meaningful < 2 {
        return InterruptionDecision::keep_speaking("mostly_filler", language, cleaned);
    }

    InterruptionDecision::interrupt(InterruptLevel::Gentle, "sustained_speech", language, cleaned)
}

/// Cut the synthesis now: mute TTS, clear carrier playback, stop speaking
async fn interrupt_now(session: &Arc<CallSession>, tts: &TtsManager) {
    tts.cancel().await;
    if let Some(tx) = session.media_sender() {
        let _ = tx.send(OutboundFrame::Clear).await;
    }
    session.set_speaking(false);
}

/// Execute a decision. Moderate and gentle levels schedule the immediate
/// action after their grace delay, and skip it if the agent already
/// finished speaking in the meantime.
pub async fn execute(
    decision: &InterruptionDecision,
    session: Arc<CallSession>,
    tts: TtsManager,
    interrupted_content: Option<String>,
) {
    if !decision.interrupt {
        return;
    }

    info!(
        stream_sid = %session.stream_sid,
        level = ?decision.level,
        reason = decision.reason,
        "Barge-in"
    );

    if let Some(content) = interrupted_content {
        // Stored for context only; resumption is logged and discarded
        session.store_interruption_context(&content);
    }

    match decision.level {
        InterruptLevel::Immediate => interrupt_now(&session, &tts).await,
        InterruptLevel::Moderate | InterruptLevel::Gentle => {
            let delay = if decision.level == InterruptLevel::Moderate {
                MODERATE_DELAY
            } else {
                GENTLE_DELAY
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if session.is_speaking() {
                    interrupt_now(&session, &tts).await;
                } else {
                    debug!(
                        stream_sid = %session.stream_sid,
                        "Speech finished before scheduled interruption"
                    );
                }
            });
        }
        InterruptLevel::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_never_interrupts() {
        let decision = classify("", "en", 0.99);
        assert!(!decision.interrupt);
        assert_eq!(decision.reason, "empty");
    }

    #[test]
    fn test_ok_is_acknowledgment() {
        let decision = classify("ok", "en", 0.9);
        assert!(!decision.interrupt);
        assert_eq!(decision.level, InterruptLevel::None);
        assert_eq!(decision.reason, "acknowledgment");
    }

    #[test]
    fn test_acknowledgments_never_interrupt_in_any_language() {
        for (language, profile) in [
            ("en", &EN_PROFILE),
            ("hi", &HI_PROFILE),
            ("de", &DE_PROFILE),
            ("ru", &RU_PROFILE),
        ] {
            for ack in profile.acknowledgments {
                let decision = classify(ack, language, 0.99);
                assert!(
                    !decision.interrupt,
                    "{:?} ack {:?} must not interrupt",
                    language, ack
                );
            }
        }
    }

    #[test]
    fn test_emergency_interrupts_regardless_of_gates() {
        // Low confidence AND short: still immediate
        let decision = classify("stop", "en", 0.4);
        assert!(decision.interrupt);
        assert_eq!(decision.level, InterruptLevel::Immediate);
        assert_eq!(decision.reason, "emergency");

        for (language, text) in [
            ("en", "wait"),
            ("en", "cancel that"),
            ("hi", "ruko"),
            ("de", "stopp"),
            ("ru", "стоп"),
        ] {
            let decision = classify(text, language, 0.1);
            assert!(decision.interrupt, "{} {:?} must interrupt", language, text);
            assert_eq!(decision.level, InterruptLevel::Immediate);
        }
    }

    #[test]
    fn test_multiword_affirmatives_do_not_interrupt() {
        assert!(!classify("haan bilkul", "hi", 0.95).interrupt);
        assert!(!classify("ja genau", "de", 0.95).interrupt);
        assert!(!classify("sounds good", "en", 0.95).interrupt);
    }

    #[test]
    fn test_intent_change_is_moderate() {
        let decision = classify("actually I want a different day", "en", 0.9);
        assert!(decision.interrupt);
        assert_eq!(decision.level, InterruptLevel::Moderate);
        assert_eq!(decision.reason, "intent_change");
    }

    #[test]
    fn test_sustained_speech_is_gentle() {
        let decision = classify("could you repeat the appointment time", "en", 0.9);
        assert!(decision.interrupt);
        assert_eq!(decision.level, InterruptLevel::Gentle);
    }

    #[test]
    fn test_short_text_passes_in_hindi_but_not_english() {
        // 3-char minimum for hi, 8 for en
        let hi = classify("kab tak", "hi", 0.9);
        assert!(hi.interrupt);

        let en = classify("why so", "en", 0.9);
        assert!(!en.interrupt);
        assert_eq!(en.reason, "too_short");
    }

    #[test]
    fn test_low_confidence_blocks_gentle() {
        let decision = classify("could you repeat the appointment time", "en", 0.5);
        assert!(!decision.interrupt);
        assert_eq!(decision.reason, "low_confidence");
    }

    #[test]
    fn test_filler_only_speech_does_not_interrupt() {
        let decision = classify("um uh like well um uh like", "en", 0.95);
        assert!(!decision.interrupt);
        assert_eq!(decision.reason, "mostly_filler");
    }

    #[test]
    fn test_punctuation_is_cleaned() {
        let decision = classify("Ok!", "en", 0.9);
        assert!(!decision.interrupt);
        assert_eq!(decision.reason, "acknowledgment");
    }
}
