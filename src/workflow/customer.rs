//! Customer-side delay flow (outbound, tool-calling)
//!
//! A two-node graph. `generate_response` asks the LLM for the next reply
//! with three bound tools; `execute_tools` dispatches exactly one of them.
//! Each tool reads the appointment to learn its duration, moves it on the
//! calendar preserving that duration, and texts the teammate the choice.
//! Calendar or SMS failures never abort the call — the dialog closes
//! politely and the failure is logged.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::calendar::CalendarService;
use crate::llm::{ChatMessage, LlmClient, ToolCall, ToolDefinition};
use crate::sms::SmsSender;
use crate::workflow::audit::{AuditStore, CustomerResponseEntry};
use crate::workflow::DelayData;

/// The three customer choices, as a sealed dispatch enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayTool {
    SelectWait,
    SelectAlternative,
    DeclineBoth,
}

impl DelayTool {
    pub fn name(&self) -> &'static str {
        match self {
            DelayTool::SelectWait => "select_wait_option",
            DelayTool::SelectAlternative => "select_alternative_option",
            DelayTool::DeclineBoth => "decline_both_options",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "select_wait_option" => Some(DelayTool::SelectWait),
            "select_alternative_option" => Some(DelayTool::SelectAlternative),
            "decline_both_options" => Some(DelayTool::DeclineBoth),
            _ => None,
        }
    }

    /// Tool definitions bound to every generate_response call
    pub fn definitions() -> Vec<ToolDefinition> {
        let no_args = serde_json::json!({ "type": "object", "properties": {} });
        vec![
            ToolDefinition::function(
                "select_wait_option",
                "The customer agrees to wait for the delayed appointment slot.",
                no_args.clone(),
            ),
            ToolDefinition::function(
                "select_alternative_option",
                "The customer picks the alternative appointment slot.",
                no_args.clone(),
            ),
            ToolDefinition::function(
                "decline_both_options",
                "The customer declines both offered slots.",
                no_args,
            ),
        ]
    }
}

/// Farewell that terminates the graph even without a tool call
pub fn is_farewell(text: &str) -> bool {
    text.to_lowercase().contains("have a great day")
}

/// System prompt for the outbound conversation
pub fn system_prompt(delay: &DelayData) -> String {
    format!(
        "You are calling {customer} about their appointment \"{summary}\", which is \
         running {minutes} minutes late. Offer exactly two options: wait for the \
         delayed slot at {wait}, or switch to the alternative slot at {alt}. \
         Rules: keep replies to one or two short spoken sentences; always steer the \
         conversation back to the two options; never discuss unrelated topics; when \
         the customer clearly chooses, call the matching tool; after the choice, \
         thank them and say \"Have a great day!\". Do not use any formatting.",
        customer = delay.customer_name,
        summary = delay.appointment_summary,
        minutes = delay.delay_minutes,
        wait = delay.wait_option,
        alt = delay.alternative_option,
    )
}

/// Result of one customer turn
#[derive(Debug)]
pub struct FlowTurn {
    pub reply: String,
    pub done: bool,
}

/// The customer-side flow and its collaborators
pub struct CustomerDelayFlow {
    llm: LlmClient,
    calendar: Arc<dyn CalendarService>,
    sms: Arc<dyn SmsSender>,
    audit: Arc<AuditStore>,
}

impl CustomerDelayFlow {
    pub fn new(
        llm: LlmClient,
        calendar: Arc<dyn CalendarService>,
        sms: Arc<dyn SmsSender>,
        audit: Arc<AuditStore>,
    ) -> Self {
        Self {
            llm,
            calendar,
            sms,
            audit,
        }
    }

    /// Run one turn: generate_response, then execute_tools if the model
    /// called one. Any tool call leads to a final LLM turn and termination.
    pub async fn run_turn(
        &self,
        delay: &DelayData,
        conversation: &mut Vec<ChatMessage>,
        user_text: &str,
    ) -> FlowTurn {
        if conversation.is_empty() {
            conversation.push(ChatMessage::system(system_prompt(delay)));
        }
        if !user_text.is_empty() {
            conversation.push(ChatMessage::user(user_text));
        }

        let turn = match self
            .llm
            .complete_with_tools(conversation.clone(), DelayTool::definitions())
            .await
        {
            Ok(turn) => turn,
            Err(e) => {
                error!("Customer flow LLM error: {}", e);
                return FlowTurn {
                    reply: "I'm sorry, I'm having trouble right now. \
                            We'll text you the details. Have a great day!"
                        .to_string(),
                    done: true,
                };
            }
        };

        let Some(tool_call) = turn.tool_calls.first() else {
            let reply = if turn.content.trim().is_empty() {
                "Would you like to wait for the delayed slot, or take the alternative?"
                    .to_string()
            } else {
                turn.content
            };
            let done = is_farewell(&reply);
            conversation.push(ChatMessage::assistant(reply.clone()));
            return FlowTurn { reply, done };
        };

        // Exactly one tool is dispatched even if the model emitted several
        let result_summary = self.execute_tool(tool_call, delay).await;

        let mut assistant = ChatMessage::assistant(turn.content.clone());
        assistant.tool_calls = Some(vec![tool_call.clone()]);
        conversation.push(assistant);
        conversation.push(ChatMessage::tool_result(
            tool_call.id.clone(),
            result_summary,
        ));

        // Final turn after the tool, then the graph terminates
        let reply = match self.llm.complete(conversation.clone()).await {
            Ok(text) if !text.trim().is_empty() => text,
            _ => format!("Thank you, {}. Have a great day!", delay.customer_name),
        };
        conversation.push(ChatMessage::assistant(reply.clone()));
        FlowTurn { reply, done: true }
    }

    /// Dispatch one tool call. Failures are logged and summarized; the call
    /// continues and closes politely.
    pub async fn execute_tool(&self, tool_call: &ToolCall, delay: &DelayData) -> String {
        let Some(tool) = DelayTool::from_name(&tool_call.function.name) else {
            warn!("Unknown tool {}", tool_call.function.name);
            return "unknown tool".to_string();
        };

        info!(
            appointment_id = %delay.appointment_id,
            tool = tool.name(),
            "Customer chose"
        );

        match tool {
            DelayTool::SelectWait => {
                self.apply_choice(delay, delay.wait_option_iso, "WAIT", &delay.wait_option)
                    .await
            }
            DelayTool::SelectAlternative => {
                self.apply_choice(
                    delay,
                    delay.alternative_option_iso,
                    "ALTERNATIVE",
                    &delay.alternative_option,
                )
                .await
            }
            DelayTool::DeclineBoth => {
                let _ = self
                    .audit
                    .record_customer_response(&CustomerResponseEntry {
                        appointment_id: delay.appointment_id.clone(),
                        response: "DECLINED".to_string(),
                        new_time: None,
                        status: "declined".to_string(),
                    })
                    .await;
                self.notify_teammate(delay, "DECLINED", "both options").await;
                "customer declined both options".to_string()
            }
        }
    }

    /// Move the appointment to `new_start` preserving its duration, then
    /// text the teammate
    async fn apply_choice(
        &self,
        delay: &DelayData,
        new_start: chrono::DateTime<chrono::Utc>,
        label: &str,
        spoken: &str,
    ) -> String {
        let duration = match self.calendar.get(&delay.appointment_id).await {
            Ok(appointment) => appointment.duration(),
            Err(e) => {
                warn!("Calendar fetch failed, using original duration: {}", e);
                delay.original_end - delay.original_start
            }
        };
        let new_end = new_start + duration;

        let status = match self
            .calendar
            .update_time(&delay.appointment_id, new_start, new_end)
            .await
        {
            Ok(_) => "confirmed",
            Err(e) => {
                error!("Calendar update failed: {}", e);
                "update_failed"
            }
        };

        let _ = self
            .audit
            .record_customer_response(&CustomerResponseEntry {
                appointment_id: delay.appointment_id.clone(),
                response: label.to_string(),
                new_time: Some(new_start.to_rfc3339()),
                status: status.to_string(),
            })
            .await;

        self.notify_teammate(delay, label, spoken).await;
        format!("customer selected {} ({})", label, spoken)
    }

    async fn notify_teammate(&self, delay: &DelayData, label: &str, spoken: &str) {
        let body = format!(
            "{} responded {} for \"{}\": {}",
            delay.customer_name, label, delay.appointment_summary, spoken
        );
        if let Err(e) = self.sms.send(&delay.teammate_phone, &body).await {
            error!("Teammate SMS failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{Appointment, MockCalendarService};
    use crate::config::LlmConfig;
    use crate::llm::FunctionCall;
    use crate::sms::MockSmsSender;
    use chrono::{TimeZone, Utc};
    use mockall::predicate::*;

    fn tool_call(name: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: "{}".to_string(),
            },
        }
    }

    async fn flow_with(
        calendar: MockCalendarService,
        sms: MockSmsSender,
    ) -> (CustomerDelayFlow, Arc<AuditStore>) {
        let audit = Arc::new(AuditStore::open_in_memory().await.unwrap());
        let flow = CustomerDelayFlow::new(
            LlmClient::new(LlmConfig::default()),
            Arc::new(calendar),
            Arc::new(sms),
            audit.clone(),
        );
        (flow, audit)
    }

    #[tokio::test]
    async fn test_wait_option_updates_calendar_preserving_duration() {
        let delay = DelayData::sample();
        let original_start = Utc.with_ymd_and_hms(2025, 9, 1, 15, 0, 0).unwrap();
        let wait_start = delay.wait_option_iso;

        let mut calendar = MockCalendarService::new();
        calendar.expect_get().times(1).returning(move |_| {
            Ok(Appointment {
                id: "appt-1".to_string(),
                summary: "Site visit".to_string(),
                start: original_start,
                end: original_start + chrono::Duration::minutes(30),
                status: "confirmed".to_string(),
                customer_name: "A".to_string(),
                customer_phone: "+15550002222".to_string(),
            })
        });
        calendar
            .expect_update_time()
            .with(
                eq("appt-1"),
                eq(wait_start),
                eq(wait_start + chrono::Duration::minutes(30)),
            )
            .times(1)
            .returning(|id, start, end| {
                Ok(Appointment {
                    id: id.to_string(),
                    summary: "Site visit".to_string(),
                    start,
                    end,
                    status: "confirmed".to_string(),
                    customer_name: "A".to_string(),
                    customer_phone: "+15550002222".to_string(),
                })
            });

        let mut sms = MockSmsSender::new();
        sms.expect_send()
            .withf(|to, body| {
                to == "+15550001111" && body.contains("WAIT") && body.contains("3:15 PM")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let (flow, audit) = flow_with(calendar, sms).await;
        let summary = flow
            .execute_tool(&tool_call("select_wait_option"), &delay)
            .await;

        assert!(summary.contains("WAIT"));
        assert_eq!(audit.response_count("appt-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_decline_skips_calendar_and_texts_teammate() {
        let delay = DelayData::sample();

        let mut calendar = MockCalendarService::new();
        calendar.expect_get().times(0);
        calendar.expect_update_time().times(0);

        let mut sms = MockSmsSender::new();
        sms.expect_send()
            .withf(|_, body| body.contains("DECLINED"))
            .times(1)
            .returning(|_, _| Ok(()));

        let (flow, audit) = flow_with(calendar, sms).await;
        flow.execute_tool(&tool_call("decline_both_options"), &delay)
            .await;
        assert_eq!(audit.response_count("appt-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sms_failure_does_not_abort() {
        let delay = DelayData::sample();

        let mut calendar = MockCalendarService::new();
        calendar.expect_get().returning(|_| {
            Ok(Appointment {
                id: "appt-1".to_string(),
                summary: "Site visit".to_string(),
                start: Utc.with_ymd_and_hms(2025, 9, 1, 15, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2025, 9, 1, 15, 30, 0).unwrap(),
                status: "confirmed".to_string(),
                customer_name: "A".to_string(),
                customer_phone: "+15550002222".to_string(),
            })
        });
        calendar
            .expect_update_time()
            .returning(|id, start, end| {
                Ok(Appointment {
                    id: id.to_string(),
                    summary: "x".to_string(),
                    start,
                    end,
                    status: "confirmed".to_string(),
                    customer_name: "A".to_string(),
                    customer_phone: "+15550002222".to_string(),
                })
            });

        let mut sms = MockSmsSender::new();
        sms.expect_send()
            .returning(|_, _| Err(anyhow::anyhow!("sms gateway down")));

        let (flow, _) = flow_with(calendar, sms).await;
        let summary = flow
            .execute_tool(&tool_call("select_alternative_option"), &delay)
            .await;
        assert!(summary.contains("ALTERNATIVE"));
    }

    #[test]
    fn test_tool_name_roundtrip() {
        for tool in [
            DelayTool::SelectWait,
            DelayTool::SelectAlternative,
            DelayTool::DeclineBoth,
        ] {
            assert_eq!(DelayTool::from_name(tool.name()), Some(tool));
        }
        assert_eq!(DelayTool::from_name("other"), None);
    }

    #[test]
    fn test_farewell_terminates() {
        assert!(is_farewell("Thanks! Have a great day!"));
        assert!(!is_farewell("Would you like to wait?"));
    }

    #[test]
    fn test_system_prompt_names_both_options() {
        let prompt = system_prompt(&DelayData::sample());
        assert!(prompt.contains("3:15 PM"));
        assert!(prompt.contains("4:00 PM"));
        assert!(prompt.contains("15 minutes late"));
        assert!(prompt.contains('A'));
    }
}
