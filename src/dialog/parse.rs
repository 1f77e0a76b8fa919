//! Spoken date/time parsing for the scheduling dialog
//!
//! Callers speak dates ("tomorrow", "twenty five august"), clock times
//! ("11 AM", "2:30 pm"), and durations ("one hour"). Parsers return both the
//! computed value and a display string so replies echo the caller's phrasing.

use chrono::{Datelike, Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;

/// A parsed calendar date with the phrase to echo back
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDate {
    pub date: NaiveDate,
    pub display: String,
}

/// A parsed clock time; `display` preserves the caller's spelling
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTime {
    pub hour: u32,
    pub minute: u32,
    pub display: String,
}

static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b").unwrap());

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b([a-z0-9\- ]+?)\s*hours?\b").unwrap());

const MONTHS: &[(&str, u32)] = &[
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
];

/// Spoken-number day forms ("one" … "thirty one")
fn spoken_number(words: &str) -> Option<u32> {
    const UNITS: &[(&str, u32)] = &[
        ("one", 1),
        ("two", 2),
        ("three", 3),
        ("four", 4),
        ("five", 5),
        ("six", 6),
        ("seven", 7),
        ("eight", 8),
        ("nine", 9),
    ];
    const TEENS: &[(&str, u32)] = &[
        ("ten", 10),
        ("eleven", 11),
        ("twelve", 12),
        ("thirteen", 13),
        ("fourteen", 14),
        ("fifteen", 15),
        ("sixteen", 16),
        ("seventeen", 17),
        ("eighteen", 18),
        ("nineteen", 19),
    ];

    let cleaned = words.trim().replace('-', " ");
    let parts: Vec<&str> = cleaned.split_whitespace().collect();
    match parts.as_slice() {
        [word] => {
            if let Some(&(_, n)) = UNITS.iter().find(|(w, _)| w == word) {
                return Some(n);
            }
            if let Some(&(_, n)) = TEENS.iter().find(|(w, _)| w == word) {
                return Some(n);
            }
            match *word {
                "twenty" => Some(20),
                "thirty" => Some(30),
                _ => None,
            }
        }
        [tens, unit] => {
            let base = match *tens {
                "twenty" => 20,
                "thirty" => 30,
                _ => return None,
            };
            let add = UNITS.iter().find(|(w, _)| w == unit).map(|&(_, n)| n)?;
            let day = base + add;
            (day <= 31).then_some(day)
        }
        _ => None,
    }
}

/// Parse a day token: digits ("25", "25th") or spoken words ("twenty five")
fn parse_day(token: &str) -> Option<u32> {
    let trimmed = token
        .trim()
        .trim_end_matches("st")
        .trim_end_matches("nd")
        .trim_end_matches("rd")
        .trim_end_matches("th");
    if let Ok(day) = trimmed.parse::<u32>() {
        return (1..=31).contains(&day).then_some(day);
    }
    spoken_number(token)
}

/// Parse a spoken date relative to `today`.
///
/// Recognized forms: "today", "tomorrow", `<day> <month>`, `<month> <day>`,
/// with full month names and digit or spoken-number days.
pub fn parse_date(text: &str, today: NaiveDate) -> Option<ParsedDate> {
    let lower = text.to_lowercase();

    if lower.contains("tomorrow") {
        return Some(ParsedDate {
            date: today + Duration::days(1),
            display: "tomorrow".to_string(),
        });
    }
    if lower.contains("today") {
        return Some(ParsedDate {
            date: today,
            display: "today".to_string(),
        });
    }

    for &(month_name, month) in MONTHS {
        let Some(pos) = lower.find(month_name) else {
            continue;
        };

        // <day> <month>: everything before the month name
        let before = lower[..pos].trim();
        if let Some(day) = last_day_token(before) {
            if let Some(date) = NaiveDate::from_ymd_opt(today.year(), month, day) {
                return Some(ParsedDate {
                    date,
                    display: format!("{} {}", day, month_name),
                });
            }
        }

        // <month> <day>: everything after the month name
        let after = lower[pos + month_name.len()..].trim();
        if let Some(day) = first_day_token(after) {
            if let Some(date) = NaiveDate::from_ymd_opt(today.year(), month, day) {
                return Some(ParsedDate {
                    date,
                    display: format!("{} {}", day, month_name),
                });
            }
        }
    }

    None
}

/// Connective words skipped when hunting for the day number
fn day_words(text: &str) -> Vec<&str> {
    text.split_whitespace()
        .filter(|w| !matches!(*w, "the" | "of" | "on" | "at" | "for"))
        .collect()
}

/// Longest trailing run of words that parses as a day number
fn last_day_token(text: &str) -> Option<u32> {
    let words = day_words(text);
    for take in (1..=2usize.min(words.len())).rev() {
        let candidate = words[words.len() - take..].join(" ");
        if let Some(day) = parse_day(&candidate) {
            return Some(day);
        }
    }
    None
}

/// Longest leading run of words that parses as a day number
fn first_day_token(text: &str) -> Option<u32> {
    let words = day_words(text);
    for take in (1..=2usize.min(words.len())).rev() {
        let candidate = words[..take].join(" ");
        if let Some(day) = parse_day(&candidate) {
            return Some(day);
        }
    }
    None
}

/// A date is bookable if it is not in the past; today is allowed
pub fn is_future(date: NaiveDate, today: NaiveDate) -> bool {
    date >= today
}

/// Parse `HH(:MM)? (am|pm)` case-insensitively, preserving the original
/// spelling in `display`
pub fn parse_time(text: &str) -> Option<ParsedTime> {
    let captures = TIME_RE.captures(text)?;
    let hour: u32 = captures.get(1)?.as_str().parse().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    let minute: u32 = captures
        .get(2)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    if minute > 59 {
        return None;
    }

    let meridiem = captures.get(3)?.as_str().to_lowercase();
    let hour24 = match (hour, meridiem.as_str()) {
        (12, "am") => 0,
        (12, "pm") => 12,
        (h, "am") => h,
        (h, _) => h + 12,
    };

    Some(ParsedTime {
        hour: hour24,
        minute,
        display: captures.get(0)?.as_str().trim().to_string(),
    })
}

/// Parse a duration like "1 hour", "two hours". Returns whole hours.
pub fn parse_duration_hours(text: &str) -> Option<u32> {
    let captures = DURATION_RE.captures(text)?;
    let quantity = captures.get(1)?.as_str().trim();

    // Prefer the trailing word/number immediately before "hour"
    let token = quantity.split_whitespace().last()?;
    if let Ok(n) = token.parse::<u32>() {
        return (n >= 1).then_some(n);
    }
    let tail_two: String = {
        let words: Vec<&str> = quantity.split_whitespace().collect();
        words[words.len().saturating_sub(2)..].join(" ")
    };
    spoken_number(&tail_two)
        .or_else(|| spoken_number(token))
        .filter(|&n| n >= 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_tomorrow_and_today() {
        let today = day(2025, 9, 1);
        let parsed = parse_date("I want tomorrow please", today).unwrap();
        assert_eq!(parsed.date, day(2025, 9, 2));
        assert_eq!(parsed.display, "tomorrow");

        let parsed = parse_date("today works", today).unwrap();
        assert_eq!(parsed.date, today);
    }

    #[test]
    fn test_day_month_order() {
        let today = day(2025, 8, 1);
        let parsed = parse_date("25 august", today).unwrap();
        assert_eq!(parsed.date, day(2025, 8, 25));
        assert_eq!(parsed.display, "25 august");
    }

    #[test]
    fn test_month_day_order() {
        let today = day(2025, 8, 1);
        let parsed = parse_date("august 25", today).unwrap();
        assert_eq!(parsed.date, day(2025, 8, 25));
    }

    #[test]
    fn test_spoken_number_day() {
        let today = day(2025, 8, 1);
        let parsed = parse_date("twenty five august", today).unwrap();
        assert_eq!(parsed.date, day(2025, 8, 25));
        assert_eq!(parsed.display, "25 august");
    }

    #[test]
    fn test_spoken_single_word_days() {
        let today = day(2025, 8, 1);
        assert_eq!(
            parse_date("nine august", today).unwrap().date,
            day(2025, 8, 9)
        );
        assert_eq!(
            parse_date("august thirty", today).unwrap().date,
            day(2025, 8, 30)
        );
        assert_eq!(
            parse_date("thirty one august", today).unwrap().date,
            day(2025, 8, 31)
        );
    }

    #[test]
    fn test_ordinal_suffix_day() {
        let today = day(2025, 8, 1);
        assert_eq!(
            parse_date("the 3rd of august", today).unwrap().date,
            day(2025, 8, 3)
        );
    }

    #[test]
    fn test_unparseable_date() {
        let today = day(2025, 8, 1);
        assert!(parse_date("sometime soon", today).is_none());
        assert!(parse_date("the 40 of august", today).is_none());
        assert!(parse_date("", today).is_none());
    }

    #[test]
    fn test_past_date_detected() {
        let today = day(2025, 9, 1);
        let parsed = parse_date("15 august", today).unwrap();
        assert!(!is_future(parsed.date, today));
        assert!(is_future(today, today));
    }

    #[test]
    fn test_time_preserves_spelling() {
        let parsed = parse_time("let's do 11 AM").unwrap();
        assert_eq!(parsed.display, "11 AM");
        assert_eq!(parsed.hour, 11);
        assert_eq!(parsed.minute, 0);

        let parsed = parse_time("2:30 pm works").unwrap();
        assert_eq!(parsed.display, "2:30 pm");
        assert_eq!(parsed.hour, 14);
        assert_eq!(parsed.minute, 30);
    }

    #[test]
    fn test_time_midnight_and_noon() {
        assert_eq!(parse_time("12 am").unwrap().hour, 0);
        assert_eq!(parse_time("12 pm").unwrap().hour, 12);
    }

    #[test]
    fn test_time_rejects_invalid() {
        assert!(parse_time("13 pm").is_none());
        assert!(parse_time("eleven").is_none());
        assert!(parse_time("").is_none());
    }

    #[test]
    fn test_duration_hours() {
        assert_eq!(parse_duration_hours("one hour"), Some(1));
        assert_eq!(parse_duration_hours("2 hours"), Some(2));
        assert_eq!(parse_duration_hours("maybe three hours?"), Some(3));
        assert_eq!(parse_duration_hours("an hour"), None);
        assert_eq!(parse_duration_hours("no idea"), None);
    }
}
