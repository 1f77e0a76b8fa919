//! Telemetry event bus
//!
//! One-way fan-out of call events to SSE observers. Publishing never blocks
//! a call path: the bus is a `tokio::sync::broadcast` channel and events for
//! slow observers are dropped, not queued.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per observer before lagging observers start losing them
const BUS_CAPACITY: usize = 256;

/// A telemetry event published by the call pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    SessionStarted {
        stream_sid: String,
        call_sid: Option<String>,
    },
    SessionEnded {
        stream_sid: String,
        reason: String,
    },
    TranscriptPartial {
        stream_sid: String,
        text: String,
    },
    TranscriptFinal {
        stream_sid: String,
        text: String,
    },
    GraphResult {
        stream_sid: String,
        step: String,
        reply: String,
    },
    GraphError {
        stream_sid: String,
        message: String,
    },
    LlmFirstTokenMs {
        stream_sid: String,
        millis: u64,
    },
    TtsFirstByteMs {
        stream_sid: String,
        millis: u64,
    },
}

impl TelemetryEvent {
    /// SSE event name for this variant
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::SessionStarted { .. } => "session_started",
            TelemetryEvent::SessionEnded { .. } => "session_ended",
            TelemetryEvent::TranscriptPartial { .. } => "transcript_partial",
            TelemetryEvent::TranscriptFinal { .. } => "transcript_final",
            TelemetryEvent::GraphResult { .. } => "graph_result",
            TelemetryEvent::GraphError { .. } => "graph_error",
            TelemetryEvent::LlmFirstTokenMs { .. } => "llm_first_token_ms",
            TelemetryEvent::TtsFirstByteMs { .. } => "tts_first_byte_ms",
        }
    }
}

/// Telemetry bus handle, cheap to clone into every component
#[derive(Clone)]
pub struct Telemetry {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl Telemetry {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event. No observers is not an error.
    pub fn publish(&self, event: TelemetryEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!("Telemetry event dropped (no observers): {}", event.name());
        }
    }

    /// Subscribe a new observer (SSE handler)
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Number of connected observers
    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = Telemetry::new();
        let mut rx = bus.subscribe();
        bus.publish(TelemetryEvent::TranscriptFinal {
            stream_sid: "MZ1".to_string(),
            text: "hello".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "transcript_final");
    }

    #[test]
    fn test_publish_without_observers_is_ok() {
        let bus = Telemetry::new();
        bus.publish(TelemetryEvent::SessionEnded {
            stream_sid: "MZ1".to_string(),
            reason: "connection_closed".to_string(),
        });
        assert_eq!(bus.observer_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = TelemetryEvent::LlmFirstTokenMs {
            stream_sid: "MZ1".to_string(),
            millis: 230,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"llm_first_token_ms""#));
    }
}
