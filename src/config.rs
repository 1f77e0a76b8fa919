//! Configuration management
//!
//! Loads settings from a TOML file with environment-variable overrides for
//! provider credentials. Every section has serde defaults so a missing or
//! partial file still yields a runnable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP/WebSocket server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Streaming speech-to-text provider
    #[serde(default)]
    pub stt: SttConfig,
    /// Streaming text-to-speech provider
    #[serde(default)]
    pub tts: TtsConfig,
    /// LLM completion provider
    #[serde(default)]
    pub llm: LlmConfig,
    /// Telephony carrier credentials
    #[serde(default)]
    pub carrier: CarrierConfig,
    /// Calendar service
    #[serde(default)]
    pub calendar: CalendarConfig,
    /// Session lifecycle tuning
    #[serde(default)]
    pub session: SessionConfig,
    /// Dialog graph tuning
    #[serde(default)]
    pub dialog: DialogConfig,
    /// Phonebook file location
    #[serde(default)]
    pub phonebook: PhonebookConfig,
    /// Append-only audit store location
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path the carrier connects its media WebSocket to
    #[serde(default = "default_media_path")]
    pub media_ws_path: String,
    /// Publicly reachable WebSocket URL placed into TwiML documents
    #[serde(default = "default_outbound_ws_url")]
    pub outbound_ws_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_media_path() -> String {
    "/media".to_string()
}

fn default_outbound_ws_url() -> String {
    "wss://localhost:8080/media".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            media_ws_path: default_media_path(),
            outbound_ws_url: default_outbound_ws_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Provider API key (from DEEPGRAM_API_KEY)
    #[serde(skip)]
    pub api_key: String,
    /// WebSocket endpoint
    #[serde(default = "default_stt_url")]
    pub url: String,
    /// Model identifier
    #[serde(default = "default_stt_model")]
    pub model: String,
    /// Language hint
    #[serde(default = "default_language")]
    pub language: String,
    /// Endpointing silence in milliseconds
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,
    /// Utterance-end fallback in milliseconds
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u32,
    /// Application keepalive interval in seconds
    #[serde(default = "default_stt_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Process-wide cap on concurrent STT sockets
    #[serde(default = "default_stt_max_connections")]
    pub max_connections: usize,
}

fn default_stt_url() -> String {
    "wss://api.deepgram.com/v1/listen".to_string()
}

fn default_stt_model() -> String {
    "nova-2".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_endpointing_ms() -> u32 {
    500
}

fn default_utterance_end_ms() -> u32 {
    1500
}

fn default_stt_keepalive_secs() -> u64 {
    10
}

fn default_stt_max_connections() -> usize {
    2
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: default_stt_url(),
            model: default_stt_model(),
            language: default_language(),
            endpointing_ms: default_endpointing_ms(),
            utterance_end_ms: default_utterance_end_ms(),
            keepalive_secs: default_stt_keepalive_secs(),
            max_connections: default_stt_max_connections(),
        }
    }
}

/// Which streaming TTS wire protocol the provider speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsFlavor {
    /// `{text}` / `{text:"",flush:true}` frames, `{audio: base64}` replies
    Elevenlabs,
    /// `{type:"text"}` / `{type:"flush"}` frames, raw binary audio replies
    Rime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Provider API key (from ELEVENLABS_API_KEY)
    #[serde(skip)]
    pub api_key: String,
    /// WebSocket endpoint base
    #[serde(default = "default_tts_url")]
    pub url: String,
    /// Wire protocol flavor
    #[serde(default = "default_tts_flavor")]
    pub flavor: TtsFlavor,
    /// Voice identifier
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    /// Known-good voice used once when the provider rejects `voice_id`
    #[serde(default = "default_fallback_voice_id")]
    pub fallback_voice_id: String,
    /// Synthesis model
    #[serde(default = "default_tts_model")]
    pub model: String,
    /// Output encoding requested from the provider
    #[serde(default = "default_output_format")]
    pub output_format: String,
    /// Preferred reply language ("en" or "hi")
    #[serde(default = "default_language")]
    pub language: String,
    /// Keepalive interval in seconds
    #[serde(default = "default_tts_keepalive_secs")]
    pub keepalive_secs: u64,
}

fn default_tts_url() -> String {
    "wss://api.elevenlabs.io/v1/text-to-speech".to_string()
}

fn default_tts_flavor() -> TtsFlavor {
    TtsFlavor::Elevenlabs
}

fn default_voice_id() -> String {
    "21m00Tcm4TlvDq8ikWAM".to_string()
}

fn default_fallback_voice_id() -> String {
    "EXAVITQu4vr4xnSDxMaL".to_string()
}

fn default_tts_model() -> String {
    "eleven_turbo_v2_5".to_string()
}

fn default_output_format() -> String {
    "ulaw_8000".to_string()
}

fn default_tts_keepalive_secs() -> u64 {
    25
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: default_tts_url(),
            flavor: default_tts_flavor(),
            voice_id: default_voice_id(),
            fallback_voice_id: default_fallback_voice_id(),
            model: default_tts_model(),
            output_format: default_output_format(),
            language: default_language(),
            keepalive_secs: default_tts_keepalive_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider API key (from OPENROUTER_API_KEY)
    #[serde(skip)]
    pub api_key: String,
    /// OpenAI-compatible completions base URL
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Chat model for turn replies and workflow classification
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Token ceiling per reply
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    /// Per-call deadline in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_llm_max_tokens() -> u32 {
    512
}

fn default_llm_timeout_secs() -> u64 {
    15
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CarrierConfig {
    /// Account SID (from TWILIO_ACCOUNT_SID)
    #[serde(skip)]
    pub account_sid: String,
    /// API key SID (from TWILIO_API_KEY)
    #[serde(skip)]
    pub api_key: String,
    /// API key secret (from TWILIO_API_SECRET)
    #[serde(skip)]
    pub api_secret: String,
    /// Outgoing application SID for voice-token grants (from TWILIO_APP_SID)
    #[serde(skip)]
    pub app_sid: String,
    /// Number outbound calls and SMS originate from (from TWILIO_PHONE_NUMBER)
    #[serde(skip)]
    pub phone_number: String,
    /// REST API base
    #[serde(default = "default_carrier_base_url")]
    pub base_url: String,
}

fn default_carrier_base_url() -> String {
    "https://api.twilio.com/2010-04-01".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// Calendar API key (from CALENDAR_API_KEY)
    #[serde(skip)]
    pub api_key: String,
    /// Calendar REST base
    #[serde(default = "default_calendar_base_url")]
    pub base_url: String,
}

fn default_calendar_base_url() -> String {
    "http://localhost:8090/api".to_string()
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_calendar_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Destroy sessions idle longer than this many minutes
    #[serde(default = "default_idle_timeout_mins")]
    pub idle_timeout_mins: u64,
    /// Deferral window after goodbye so carrier reconnects are refused
    #[serde(default = "default_ending_grace_secs")]
    pub ending_grace_secs: u64,
    /// Sweeper cadence in minutes
    #[serde(default = "default_sweep_interval_mins")]
    pub sweep_interval_mins: u64,
}

fn default_idle_timeout_mins() -> u64 {
    10
}

fn default_ending_grace_secs() -> u64 {
    10
}

fn default_sweep_interval_mins() -> u64 {
    2
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_mins: default_idle_timeout_mins(),
            ending_grace_secs: default_ending_grace_secs(),
            sweep_interval_mins: default_sweep_interval_mins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogConfig {
    /// Bounded conversation-history ring size per thread
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    20
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonebookConfig {
    /// JSON file mapping phone number to {name, role}
    #[serde(default = "default_phonebook_path")]
    pub path: PathBuf,
}

fn default_phonebook_path() -> PathBuf {
    data_dir().join("phonebook.json")
}

impl Default for PhonebookConfig {
    fn default() -> Self {
        Self {
            path: default_phonebook_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// SQLite database for the append-only delay audit log
    #[serde(default = "default_audit_path")]
    pub db_path: PathBuf,
}

fn default_audit_path() -> PathBuf {
    data_dir().join("audit.db")
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: default_audit_path(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("voicebridge"))
        .unwrap_or_else(|| PathBuf::from("./voicebridge-data"))
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("voicebridge/config.toml"))
            .unwrap_or_else(|| PathBuf::from("./config.toml"))
    }

    /// Load from the default path (missing file yields defaults), then apply
    /// environment overrides for credentials and deploy-specific settings.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from a specific path, then apply environment overrides
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Pull credentials and deploy overrides from the environment
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("DEEPGRAM_API_KEY") {
            self.stt.api_key = key;
        }
        if let Ok(key) = std::env::var("ELEVENLABS_API_KEY") {
            self.tts.api_key = key;
        }
        if let Ok(voice) = std::env::var("ELEVENLABS_VOICE_ID") {
            self.tts.voice_id = voice;
        }
        if let Ok(lang) = std::env::var("TTS_LANGUAGE") {
            self.tts.language = lang;
        }
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(sid) = std::env::var("TWILIO_ACCOUNT_SID") {
            self.carrier.account_sid = sid;
        }
        if let Ok(key) = std::env::var("TWILIO_API_KEY") {
            self.carrier.api_key = key;
        }
        if let Ok(secret) = std::env::var("TWILIO_API_SECRET") {
            self.carrier.api_secret = secret;
        }
        if let Ok(app) = std::env::var("TWILIO_APP_SID") {
            self.carrier.app_sid = app;
        }
        if let Ok(number) = std::env::var("TWILIO_PHONE_NUMBER") {
            self.carrier.phone_number = number;
        }
        if let Ok(key) = std::env::var("CALENDAR_API_KEY") {
            self.calendar.api_key = key;
        }
        if let Ok(url) = std::env::var("CALENDAR_BASE_URL") {
            self.calendar.base_url = url;
        }
        if let Ok(url) = std::env::var("OUTBOUND_WS_URL") {
            self.server.outbound_ws_url = url;
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.stt.endpointing_ms, 500);
        assert_eq!(config.stt.utterance_end_ms, 1500);
        assert_eq!(config.stt.max_connections, 2);
        assert_eq!(config.tts.output_format, "ulaw_8000");
        assert_eq!(config.tts.keepalive_secs, 25);
        assert_eq!(config.session.idle_timeout_mins, 10);
        assert_eq!(config.session.ending_grace_secs, 10);
        assert_eq!(config.dialog.history_limit, 20);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            [server]
            port = 9999

            [tts]
            flavor = "rime"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.tts.flavor, TtsFlavor::Rime);
        assert_eq!(config.stt.model, "nova-2");
    }

    #[test]
    fn test_env_override_port() {
        let mut config = Config::default();
        std::env::set_var("PORT", "3111");
        config.apply_env();
        std::env::remove_var("PORT");
        assert_eq!(config.server.port, 3111);
    }
}
