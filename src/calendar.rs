//! Calendar service client
//!
//! External collaborator: the appointment store the delay workflow reads and
//! updates. The trait seam keeps workflow tests independent of the wire.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// A calendar appointment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: String,
    pub summary: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub status: String,
    /// Customer the appointment is with (used by delay notifications)
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub customer_phone: String,
}

impl Appointment {
    /// Scheduled duration
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// Calendar operations used by the delay workflow
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Upcoming appointments owned by a teammate, soonest first
    async fn list_upcoming(&self, teammate_phone: &str) -> Result<Vec<Appointment>>;

    /// Fetch one appointment by id
    async fn get(&self, appointment_id: &str) -> Result<Appointment>;

    /// Move an appointment; the caller supplies both endpoints so duration
    /// preservation stays the workflow's decision
    async fn update_time(
        &self,
        appointment_id: &str,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
    ) -> Result<Appointment>;
}

/// REST-backed calendar client
pub struct HttpCalendar {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpCalendar {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CalendarService for HttpCalendar {
    async fn list_upcoming(&self, teammate_phone: &str) -> Result<Vec<Appointment>> {
        let response = self
            .client
            .get(format!("{}/appointments", self.base_url))
            .query(&[("owner", teammate_phone), ("status", "upcoming")])
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Calendar list request failed")?;

        if !response.status().is_success() {
            bail!("Calendar list error: {}", response.status());
        }

        let mut appointments: Vec<Appointment> = response
            .json()
            .await
            .context("Failed to parse appointment list")?;
        appointments.sort_by_key(|a| a.start);
        Ok(appointments)
    }

    async fn get(&self, appointment_id: &str) -> Result<Appointment> {
        let response = self
            .client
            .get(format!("{}/appointments/{}", self.base_url, appointment_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Calendar get request failed")?;

        if !response.status().is_success() {
            bail!("Calendar get error: {}", response.status());
        }

        response.json().await.context("Failed to parse appointment")
    }

    async fn update_time(
        &self,
        appointment_id: &str,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
    ) -> Result<Appointment> {
        let response = self
            .client
            .patch(format!("{}/appointments/{}", self.base_url, appointment_id))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "start": new_start.to_rfc3339(),
                "end": new_end.to_rfc3339(),
            }))
            .send()
            .await
            .context("Calendar update request failed")?;

        if !response.status().is_success() {
            bail!("Calendar update error: {}", response.status());
        }

        response
            .json()
            .await
            .context("Failed to parse updated appointment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_appointment_duration() {
        let appt = Appointment {
            id: "a1".to_string(),
            summary: "Site visit".to_string(),
            start: Utc.with_ymd_and_hms(2025, 9, 1, 15, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 9, 1, 16, 30, 0).unwrap(),
            status: "confirmed".to_string(),
            customer_name: "A".to_string(),
            customer_phone: "+15550002222".to_string(),
        };
        assert_eq!(appt.duration(), chrono::Duration::minutes(90));
    }

    #[test]
    fn test_appointment_deserializes_without_optional_fields() {
        let appt: Appointment = serde_json::from_value(serde_json::json!({
            "id": "a2",
            "summary": "Review",
            "start": "2025-09-01T15:00:00Z",
            "end": "2025-09-01T15:30:00Z"
        }))
        .unwrap();
        assert_eq!(appt.status, "");
        assert_eq!(appt.customer_name, "");
    }
}
