//! Voicebridge - Real-Time Telephony Voice Agent
//!
//! A phone agent that:
//! - bridges the carrier's μ-law media stream to streaming STT and TTS
//! - drives an appointment-scheduling dialog with per-call checkpoints
//! - handles barge-in with language-aware acknowledgment filtering
//! - runs the delay-notification workflow (teammate in, customer out)
//!
//! # Example
//!
//! ```ignore
//! use voicebridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     voicebridge::server::start(config).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod error;
pub mod config;
pub mod audio;
pub mod telemetry;
pub mod llm;
pub mod language;
pub mod phonebook;
pub mod calendar;
pub mod sms;
pub mod carrier;

// Call pipeline
pub mod session; // Must come before telephony/orchestrator which depend on it
pub mod telephony;
pub mod stt;
pub mod tts;
pub mod dialog;
pub mod interrupt;
pub mod workflow;
pub mod orchestrator;

// Surface
pub mod server;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use dialog::{DialogGraph, DialogStep};
pub use session::{CallSession, SessionRegistry};
pub use telemetry::{Telemetry, TelemetryEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Real-Time Telephony Voice Agent", NAME, VERSION)
}
