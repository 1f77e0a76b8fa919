//! Language detection and reply translation
//!
//! Tags each utterance as English or Hindi. Hindi comes in two shapes:
//! Devanagari script, and Roman-Hindi typed/spoken in Latin letters, which
//! is caught by a curated token lexicon. Reply translation is a single LLM
//! completion that falls back to the original English text on any failure —
//! a missed translation never aborts a turn.

use std::time::Duration;
use tracing::{debug, warn};

use crate::llm::{ChatMessage, LlmClient};

/// Translation deadline; past this the English text is spoken instead
const TRANSLATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Strong Roman-Hindi tokens. Two or more in one utterance tag it Hindi.
const ROMAN_HINDI_TOKENS: &[&str] = &[
    "hai", "hain", "nahi", "nahin", "haan", "kya", "kaise", "kab", "kahan", "kyun", "mujhe",
    "mera", "meri", "mere", "aap", "aapka", "tum", "hum", "humko", "karna", "karo", "krna",
    "chahiye", "kal", "aaj", "abhi", "baje", "samay", "theek", "thik", "acha", "accha",
    "bilkul", "ji", "namaste", "shukriya", "dhanyavad", "hoga", "raha", "rahi", "wala",
    "lekin", "matlab", "bhai", "please", "batao", "bataiye", "milega", "chahta", "chahti",
];

/// Words too generic to count on their own ("please" appears in English too)
const WEAK_TOKENS: &[&str] = &["please", "ji"];

/// Whether text contains any Devanagari code points
pub fn has_devanagari(text: &str) -> bool {
    text.chars().any(|c| ('\u{0900}'..='\u{097F}').contains(&c))
}

/// Tag an utterance as "en" or "hi"
pub fn detect_input_language(text: &str) -> &'static str {
    if has_devanagari(text) {
        return "hi";
    }

    let mut strong = 0usize;
    let mut weak = 0usize;
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if ROMAN_HINDI_TOKENS.contains(&word) {
            if WEAK_TOKENS.contains(&word) {
                weak += 1;
            } else {
                strong += 1;
            }
        }
    }

    // Weak tokens only count alongside at least one strong token
    if strong >= 2 || (strong >= 1 && strong + weak >= 2) {
        "hi"
    } else {
        "en"
    }
}

/// Translate a reply to Hindi when the caller spoke Hindi and the deploy
/// targets Hindi. No-op otherwise; falls back to the original on any error.
pub async fn translate_if_needed(
    llm: &LlmClient,
    text: &str,
    target_language: &str,
    input_language: &str,
) -> String {
    if target_language != "hi" || input_language != "hi" {
        return text.to_string();
    }
    if has_devanagari(text) {
        debug!("Reply already in Devanagari, skipping translation");
        return text.to_string();
    }

    let messages = vec![
        ChatMessage::system(
            "Translate the assistant reply into natural spoken Hindi (Devanagari). \
             Keep names, times, and dates as they are. Reply with the translation only.",
        ),
        ChatMessage::user(text),
    ];

    match tokio::time::timeout(TRANSLATE_TIMEOUT, llm.complete(messages)).await {
        Ok(Ok(translated)) if !translated.trim().is_empty() => translated.trim().to_string(),
        Ok(Ok(_)) => text.to_string(),
        Ok(Err(e)) => {
            warn!("Translation failed, speaking English: {}", e);
            text.to_string()
        }
        Err(_) => {
            warn!("Translation timed out, speaking English");
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devanagari_detection() {
        assert!(has_devanagari("मुझे कल अपॉइंटमेंट चाहिए"));
        assert!(!has_devanagari("plain latin text"));
        assert!(!has_devanagari(""));
    }

    #[test]
    fn test_devanagari_tags_hindi() {
        assert_eq!(detect_input_language("नमस्ते"), "hi");
    }

    #[test]
    fn test_roman_hindi_detection() {
        assert_eq!(
            detect_input_language("mujhe kal appointment book karna hai"),
            "hi"
        );
        assert_eq!(detect_input_language("haan bilkul"), "hi");
    }

    #[test]
    fn test_english_stays_english() {
        assert_eq!(detect_input_language("I want to book a meeting"), "en");
        assert_eq!(detect_input_language(""), "en");
        // One strong token alone is not enough
        assert_eq!(detect_input_language("the band Kal played"), "en");
    }

    #[test]
    fn test_weak_tokens_need_a_strong_anchor() {
        // "please" alone (or repeated) is ordinary English
        assert_eq!(detect_input_language("please please help me"), "en");
        // but combined with a strong token it tips to Hindi
        assert_eq!(detect_input_language("please batao"), "hi");
    }
}
