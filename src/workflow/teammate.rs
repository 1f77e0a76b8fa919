//! Teammate-side delay flow (inbound)
//!
//! When the phonebook identifies the caller as a teammate, the dialog runs
//! this procedure instead of the booking graph:
//!
//! 1. enumerate the teammate's upcoming appointments
//! 2. select one by position or summary (LLM, strict `{1,2,…,unclear}` contract)
//! 3. parse the new start time (LLM, ISO-8601 with an `unclear` escape)
//! 4. confirm the parsed time
//! 5. update the calendar preserving duration, append an audit row
//! 6. ask whether more delays need processing; "no" ends the call
//! 7. after the call ends, wait a fixed interval, then dial the customer
//! 8. stash the delay payload under the outbound call sid for TwiML lookup
//! 9. the customer-side flow runs when that leg answers

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::calendar::{Appointment, CalendarService};
use crate::carrier::OutboundDialer;
use crate::llm::{ChatMessage, LlmClient};
use crate::session::{CallSession, SessionRegistry};
use crate::workflow::audit::{AuditStore, DelayAuditEntry};
use crate::workflow::DelayData;

/// Pause between the teammate hanging up and dialing the customer
const CALLBACK_DELAY: std::time::Duration = std::time::Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeammateStep {
    SelectAppointment,
    CollectNewTime,
    ConfirmNewTime,
    AskFurther,
    Done,
}

struct TeammateState {
    appointments: Vec<Appointment>,
    selected: Option<Appointment>,
    proposed: Option<DateTime<Utc>>,
    step: TeammateStep,
    /// Customer callbacks queued for after this call ends
    pending_delays: Vec<DelayData>,
}

impl TeammateState {
    fn new(appointments: Vec<Appointment>) -> Self {
        Self {
            appointments,
            selected: None,
            proposed: None,
            step: TeammateStep::SelectAppointment,
            pending_delays: Vec::new(),
        }
    }
}

/// The teammate flow and its collaborators
pub struct TeammateFlow {
    llm: LlmClient,
    calendar: Arc<dyn CalendarService>,
    dialer: Arc<dyn OutboundDialer>,
    audit: Arc<AuditStore>,
    registry: SessionRegistry,
    /// URL the carrier fetches TwiML from on the outbound leg
    twiml_url: String,
    states: Mutex<HashMap<String, TeammateState>>,
}

impl TeammateFlow {
    pub fn new(
        llm: LlmClient,
        calendar: Arc<dyn CalendarService>,
        dialer: Arc<dyn OutboundDialer>,
        audit: Arc<AuditStore>,
        registry: SessionRegistry,
        twiml_url: String,
    ) -> Self {
        Self {
            llm,
            calendar,
            dialer,
            audit,
            registry,
            twiml_url,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<String, TeammateState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Step 1: greet the teammate with their upcoming appointments
    pub async fn greet(&self, session: &Arc<CallSession>) -> String {
        let caller = session.caller();
        let (name, phone) = match &caller {
            Some(c) if !c.phone.is_empty() => (c.name.clone(), c.phone.clone()),
            _ => {
                // Missing phonebook data surfaces as a log only
                error!(
                    stream_sid = %session.stream_sid,
                    "Teammate caller has no phone number on file"
                );
                (String::from("there"), String::new())
            }
        };

        let appointments = match self.calendar.list_upcoming(&phone).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Calendar list failed: {}", e);
                Vec::new()
            }
        };

        if appointments.is_empty() {
            self.states()
                .insert(session.stream_sid.clone(), TeammateState::new(Vec::new()));
            return format!(
                "Hi {}! I don't see any upcoming appointments for you. \
                 Is there anything else I can help with?",
                name
            );
        }

        self.registry
            .set_preloaded_appointments(&session.stream_sid, appointments.clone());
        let listing = enumerate_appointments(&appointments);
        self.states().insert(
            session.stream_sid.clone(),
            TeammateState::new(appointments),
        );

        format!(
            "Hi {}! You have {} Which appointment is running late?",
            name, listing
        )
    }

    /// Drive one teammate turn
    pub async fn handle_turn(&self, session: &Arc<CallSession>, text: &str) -> String {
        let step = {
            let states = self.states();
            states.get(&session.stream_sid).map(|state| state.step)
        };
        let step = match step {
            Some(step) => step,
            None => return self.greet(session).await,
        };

        match step {
            TeammateStep::SelectAppointment => self.select_appointment(session, text).await,
            TeammateStep::CollectNewTime => self.collect_new_time(session, text).await,
            TeammateStep::ConfirmNewTime => self.confirm_new_time(session, text).await,
            TeammateStep::AskFurther => self.ask_further(session, text).await,
            TeammateStep::Done => "Thanks, you're all set. Goodbye!".to_string(),
        }
    }

    /// Step 2: strict-contract selection
    async fn select_appointment(&self, session: &Arc<CallSession>, text: &str) -> String {
        let appointments = {
            let states = self.states();
            states
                .get(&session.stream_sid)
                .map(|s| s.appointments.clone())
                .unwrap_or_default()
        };
        if appointments.is_empty() {
            return "I don't have any appointments on file for you.".to_string();
        }

        let listing = enumerate_appointments(&appointments);
        let messages = vec![
            ChatMessage::system(format!(
                "The caller is picking one of their appointments. Appointments:\n{}\n\
                 Reply with only the appointment number, or the single word 'unclear'.",
                listing
            )),
            ChatMessage::user(text),
        ];

        let reply = self.llm.complete(messages).await.unwrap_or_default();
        let index = parse_selection_reply(&reply, appointments.len())
            .or_else(|| parse_selection_reply(text, appointments.len()));

        match index {
            Some(i) => {
                let appointment = appointments[i - 1].clone();
                let spoken = DelayData::spoken_time(appointment.start);
                {
                    let mut states = self.states();
                    if let Some(state) = states.get_mut(&session.stream_sid) {
                        state.selected = Some(appointment.clone());
                        state.step = TeammateStep::CollectNewTime;
                    }
                }
                format!(
                    "Got it, \"{}\" at {}. What should the new start time be?",
                    appointment.summary, spoken
                )
            }
            None => format!(
                "Sorry, I didn't catch which one. You have {} Which number is it?",
                listing
            ),
        }
    }

    /// Step 3: natural-language new time → ISO-8601 with validation
    async fn collect_new_time(&self, session: &Arc<CallSession>, text: &str) -> String {
        let now = Utc::now();
        let messages = vec![
            ChatMessage::system(format!(
                "Convert the caller's rescheduling time to an ISO-8601 UTC instant. \
                 The current time is {}. Reply with only the instant, like \
                 2025-09-01T15:30:00Z, or the single word 'unclear'.",
                now.to_rfc3339()
            )),
            ChatMessage::user(text),
        ];

        let reply = self.llm.complete(messages).await.unwrap_or_default();
        let Some(proposed) = parse_iso_reply(&reply) else {
            return "Sorry, I couldn't work out that time. \
                    When should the appointment start instead?"
                .to_string();
        };

        if let Err(problem) = validate_new_time(proposed, now) {
            return format!("{} When should it start instead?", problem);
        }

        {
            let mut states = self.states();
            if let Some(state) = states.get_mut(&session.stream_sid) {
                state.proposed = Some(proposed);
                state.step = TeammateStep::ConfirmNewTime;
            }
        }
        format!(
            "Just to confirm: move it to {}?",
            DelayData::spoken_time(proposed)
        )
    }

    /// Step 4 then 5: confirm, update the calendar, audit, queue callback
    async fn confirm_new_time(&self, session: &Arc<CallSession>, text: &str) -> String {
        let lower = text.to_lowercase();
        let yes = ["yes", "yeah", "yep", "sure", "correct", "right", "haan"]
            .iter()
            .any(|w| lower.contains(w));
        let no = ["no", "nope", "wrong", "nahi"].iter().any(|w| lower.contains(w));

        if no {
            let mut states = self.states();
            if let Some(state) = states.get_mut(&session.stream_sid) {
                state.proposed = None;
                state.step = TeammateStep::CollectNewTime;
            }
            return "Okay, what should the new start time be?".to_string();
        }
        if !yes {
            return "Sorry, was that a yes or a no?".to_string();
        }

        let (appointment, proposed) = {
            let states = self.states();
            let state = match states.get(&session.stream_sid) {
                Some(s) => s,
                None => return "Something went wrong. Let's start over.".to_string(),
            };
            match (state.selected.clone(), state.proposed) {
                (Some(a), Some(p)) => (a, p),
                _ => return "Something went wrong. Which appointment is delayed?".to_string(),
            }
        };

        match self.apply_delay(session, &appointment, proposed).await {
            Ok(delay) => {
                let spoken = delay.wait_option.clone();
                {
                    let mut states = self.states();
                    if let Some(state) = states.get_mut(&session.stream_sid) {
                        state.pending_delays.push(delay);
                        state.selected = None;
                        state.proposed = None;
                        state.step = TeammateStep::AskFurther;
                    }
                }
                format!(
                    "Done — \"{}\" is moved to {} and the customer will be notified. \
                     Do you need to process another delay?",
                    appointment.summary, spoken
                )
            }
            Err(e) => {
                error!("Calendar update failed: {}", e);
                {
                    let mut states = self.states();
                    if let Some(state) = states.get_mut(&session.stream_sid) {
                        state.step = TeammateStep::AskFurther;
                    }
                }
                "I couldn't update the calendar just now, but I've logged the delay. \
                 Do you need anything else?"
                    .to_string()
            }
        }
    }

    /// Step 5 body: move the appointment, write the audit row, build the
    /// payload for the customer leg
    pub async fn apply_delay(
        &self,
        session: &Arc<CallSession>,
        appointment: &Appointment,
        new_start: DateTime<Utc>,
    ) -> anyhow::Result<DelayData> {
        let duration = appointment.duration();
        let new_end = new_start + duration;

        self.calendar
            .update_time(&appointment.id, new_start, new_end)
            .await?;

        let caller = session.caller();
        let (teammate_name, teammate_phone) = caller
            .map(|c| (c.name, c.phone))
            .unwrap_or_default();

        let _ = self
            .audit
            .record_delay(&DelayAuditEntry {
                appointment_id: appointment.id.clone(),
                old_time: appointment.start.to_rfc3339(),
                new_time: new_start.to_rfc3339(),
                teammate_name,
                teammate_phone: teammate_phone.clone(),
                reason: "teammate_delay".to_string(),
                status: "applied".to_string(),
            })
            .await;

        Ok(build_delay_data(
            appointment,
            new_start,
            &teammate_phone,
            &session.stream_sid,
        ))
    }

    /// Step 6: more delays, or wrap up
    async fn ask_further(&self, session: &Arc<CallSession>, text: &str) -> String {
        let lower = text.to_lowercase();
        let no = ["no", "nope", "nothing", "that's all", "bye"]
            .iter()
            .any(|w| lower.contains(w));

        if no {
            {
                let mut states = self.states();
                if let Some(state) = states.get_mut(&session.stream_sid) {
                    state.step = TeammateStep::Done;
                }
            }
            session.mark_ending();
            return "All done. The customers will be notified shortly. Goodbye!".to_string();
        }

        // Anything else restarts selection over the same appointment list
        {
            let mut states = self.states();
            if let Some(state) = states.get_mut(&session.stream_sid) {
                state.step = TeammateStep::SelectAppointment;
            }
        }
        let appointments = {
            let states = self.states();
            states
                .get(&session.stream_sid)
                .map(|s| s.appointments.clone())
                .unwrap_or_default()
        };
        format!(
            "Sure. You have {} Which one is delayed?",
            enumerate_appointments(&appointments)
        )
    }

    /// Steps 7–8: once the teammate hangs up, wait, dial each customer, and
    /// stash the delay payload under the outbound call sid
    pub fn on_call_ended(&self, stream_sid: &str) {
        let pending = {
            let mut states = self.states();
            match states.remove(stream_sid) {
                Some(state) => state.pending_delays,
                None => return,
            }
        };
        if pending.is_empty() {
            return;
        }

        info!(
            stream_sid,
            count = pending.len(),
            "Scheduling customer delay callbacks"
        );

        for delay in pending {
            let dialer = self.dialer.clone();
            let registry = self.registry.clone();
            let twiml_url = self.twiml_url.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CALLBACK_DELAY).await;
                match dialer.create_call(&delay.customer_phone, &twiml_url).await {
                    Ok(call_sid) => {
                        info!(call_sid = %call_sid, "Customer callback dialed");
                        registry.stash_outbound_delay(&call_sid, delay);
                    }
                    Err(e) => error!("Customer callback failed: {}", e),
                }
            });
        }
    }
}

/// "2 upcoming appointments: 1. "Site visit" at 3:00 PM. 2. …"
pub fn enumerate_appointments(appointments: &[Appointment]) -> String {
    let mut out = format!(
        "{} upcoming appointment{}:",
        appointments.len(),
        if appointments.len() == 1 { "" } else { "s" }
    );
    for (i, appointment) in appointments.iter().enumerate() {
        out.push_str(&format!(
            " {}. \"{}\" at {}.",
            i + 1,
            appointment.summary,
            DelayData::spoken_time(appointment.start)
        ));
    }
    out
}

/// Parse the strict selection contract: a bare number in 1..=count.
/// "unclear" (and anything else unparseable) is None.
pub fn parse_selection_reply(reply: &str, count: usize) -> Option<usize> {
    let trimmed = reply.trim().trim_end_matches('.');
    if trimmed.eq_ignore_ascii_case("unclear") {
        return None;
    }
    // Accept "2" as well as replies like "number 2"
    let candidate = trimmed
        .split_whitespace()
        .rev()
        .find_map(|w| w.parse::<usize>().ok())?;
    (1..=count).contains(&candidate).then_some(candidate)
}

/// Parse the strict time contract: a single ISO-8601 instant or "unclear"
pub fn parse_iso_reply(reply: &str) -> Option<DateTime<Utc>> {
    let trimmed = reply.trim();
    if trimmed.eq_ignore_ascii_case("unclear") {
        return None;
    }
    trimmed
        .split_whitespace()
        .find_map(|w| DateTime::parse_from_rfc3339(w).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Validate the proposed new start: no more than an hour in the past, no
/// more than a year out
pub fn validate_new_time(proposed: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), String> {
    if proposed < now - Duration::hours(1) {
        return Err("That time is in the past.".to_string());
    }
    if proposed > now + Duration::days(365) {
        return Err("That time is more than a year away.".to_string());
    }
    Ok(())
}

/// Assemble the payload handed to the customer-side call. The alternative
/// slot is the next day at the appointment's original clock time.
pub fn build_delay_data(
    appointment: &Appointment,
    new_start: DateTime<Utc>,
    teammate_phone: &str,
    teammate_stream_sid: &str,
) -> DelayData {
    let alternative = appointment.start + Duration::days(1);
    DelayData {
        customer_name: appointment.customer_name.clone(),
        customer_phone: appointment.customer_phone.clone(),
        teammate_phone: teammate_phone.to_string(),
        teammate_stream_sid: teammate_stream_sid.to_string(),
        appointment_id: appointment.id.clone(),
        appointment_summary: appointment.summary.clone(),
        delay_minutes: (new_start - appointment.start).num_minutes(),
        wait_option: DelayData::spoken_time(new_start),
        wait_option_iso: new_start,
        alternative_option: DelayData::spoken_time(alternative),
        alternative_option_iso: alternative,
        original_start: appointment.start,
        original_end: appointment.end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn appointment() -> Appointment {
        let start = Utc.with_ymd_and_hms(2025, 9, 1, 15, 0, 0).unwrap();
        Appointment {
            id: "appt-1".to_string(),
            summary: "Site visit".to_string(),
            start,
            end: start + Duration::minutes(30),
            status: "confirmed".to_string(),
            customer_name: "A".to_string(),
            customer_phone: "+15550002222".to_string(),
        }
    }

    #[test]
    fn test_selection_contract() {
        assert_eq!(parse_selection_reply("2", 3), Some(2));
        assert_eq!(parse_selection_reply(" 1. ", 3), Some(1));
        assert_eq!(parse_selection_reply("number 3", 3), Some(3));
        assert_eq!(parse_selection_reply("unclear", 3), None);
        assert_eq!(parse_selection_reply("4", 3), None);
        assert_eq!(parse_selection_reply("0", 3), None);
        assert_eq!(parse_selection_reply("the first one", 3), None);
    }

    #[test]
    fn test_iso_contract() {
        let parsed = parse_iso_reply("2025-09-01T15:30:00Z").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 9, 1, 15, 30, 0).unwrap());
        assert!(parse_iso_reply("unclear").is_none());
        assert!(parse_iso_reply("sometime tomorrow").is_none());
        // Tolerates a sentence around the instant
        assert!(parse_iso_reply("Sure: 2025-09-01T15:30:00Z works").is_some());
    }

    #[test]
    fn test_new_time_window() {
        let now = Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap();
        assert!(validate_new_time(now + Duration::minutes(30), now).is_ok());
        assert!(validate_new_time(now - Duration::minutes(30), now).is_ok());
        assert!(validate_new_time(now - Duration::hours(2), now).is_err());
        assert!(validate_new_time(now + Duration::days(400), now).is_err());
    }

    #[test]
    fn test_enumeration_format() {
        let listing = enumerate_appointments(&[appointment()]);
        assert!(listing.starts_with("1 upcoming appointment:"));
        assert!(listing.contains("\"Site visit\" at 3:00 PM."));
    }

    #[test]
    fn test_delay_data_math() {
        let appt = appointment();
        let new_start = appt.start + Duration::minutes(15);
        let delay = build_delay_data(&appt, new_start, "+15550001111", "MZteam");

        assert_eq!(delay.delay_minutes, 15);
        assert_eq!(delay.wait_option, "3:15 PM");
        assert_eq!(delay.wait_option_iso, new_start);
        // Alternative: next day at the original clock time
        assert_eq!(
            delay.alternative_option_iso,
            appt.start + Duration::days(1)
        );
        assert_eq!(delay.alternative_option, "3:00 PM");
        assert_eq!(delay.customer_phone, "+15550002222");
        assert_eq!(delay.original_end, appt.end);
    }
}
