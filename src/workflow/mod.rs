//! Delay-notification workflow
//!
//! Two coupled flows. A teammate calls in, walks through selecting an
//! appointment and a new time, and the calendar is updated. After that call
//! ends, an outbound call notifies the customer, who picks between waiting
//! for the delayed slot and an alternative slot via LLM tool calls.

pub mod audit;
pub mod customer;
pub mod teammate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload handed from the teammate flow to the customer-side call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayData {
    pub customer_name: String,
    pub customer_phone: String,
    pub teammate_phone: String,
    pub teammate_stream_sid: String,
    pub appointment_id: String,
    pub appointment_summary: String,
    pub delay_minutes: i64,
    /// Spoken form of the delayed slot, e.g. "3:15 PM"
    pub wait_option: String,
    pub wait_option_iso: DateTime<Utc>,
    /// Spoken form of the fallback slot
    pub alternative_option: String,
    pub alternative_option_iso: DateTime<Utc>,
    pub original_start: DateTime<Utc>,
    pub original_end: DateTime<Utc>,
}

impl DelayData {
    /// Spoken time format used in prompts and SMS ("3:15 PM")
    pub fn spoken_time(instant: DateTime<Utc>) -> String {
        instant.format("%-I:%M %p").to_string()
    }

    #[cfg(test)]
    pub fn sample() -> Self {
        use chrono::TimeZone;
        let start = Utc.with_ymd_and_hms(2025, 9, 1, 15, 0, 0).unwrap();
        Self {
            customer_name: "A".to_string(),
            customer_phone: "+15550002222".to_string(),
            teammate_phone: "+15550001111".to_string(),
            teammate_stream_sid: "MZteam".to_string(),
            appointment_id: "appt-1".to_string(),
            appointment_summary: "Site visit".to_string(),
            delay_minutes: 15,
            wait_option: "3:15 PM".to_string(),
            wait_option_iso: start + chrono::Duration::minutes(15),
            alternative_option: "4:00 PM".to_string(),
            alternative_option_iso: start + chrono::Duration::hours(1),
            original_start: start,
            original_end: start + chrono::Duration::minutes(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_spoken_time_format() {
        let t = Utc.with_ymd_and_hms(2025, 9, 1, 15, 15, 0).unwrap();
        assert_eq!(DelayData::spoken_time(t), "3:15 PM");
        let t = Utc.with_ymd_and_hms(2025, 9, 1, 9, 5, 0).unwrap();
        assert_eq!(DelayData::spoken_time(t), "9:05 AM");
    }

    #[test]
    fn test_delay_data_roundtrips() {
        let delay = DelayData::sample();
        let json = serde_json::to_string(&delay).unwrap();
        let restored: DelayData = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.appointment_id, delay.appointment_id);
        assert_eq!(restored.wait_option_iso, delay.wait_option_iso);
    }
}
