//! HTTP/WebSocket server
//!
//! Hosts the carrier media-stream endpoint plus the observation surface:
//! liveness, health, SSE telemetry, the carrier access-token endpoint, and
//! the TwiML document.

pub mod http;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::calendar::HttpCalendar;
use crate::carrier::CarrierDialer;
use crate::config::Config;
use crate::dialog::checkpoint::CheckpointStore;
use crate::dialog::DialogGraph;
use crate::llm::LlmClient;
use crate::orchestrator::Orchestrator;
use crate::phonebook::Phonebook;
use crate::session::SessionRegistry;
use crate::sms::CarrierSms;
use crate::stt::SttAdmission;
use crate::telemetry::Telemetry;
use crate::telephony;
use crate::tts::TtsManager;
use crate::workflow::audit::AuditStore;
use crate::workflow::customer::CustomerDelayFlow;
use crate::workflow::teammate::TeammateFlow;

/// Shared server state, cheap to clone per request
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub telemetry: Telemetry,
    pub phonebook: Phonebook,
    pub tts: TtsManager,
    pub orchestrator: Arc<Orchestrator>,
}

/// Wire everything and serve until shutdown
pub async fn start(config: Config) -> Result<()> {
    let config = Arc::new(config);

    let telemetry = Telemetry::new();
    let registry = SessionRegistry::new(config.session.clone());
    let _sweeper = registry.spawn_sweeper();

    let phonebook = Phonebook::load(&config.phonebook.path)?;
    let _watcher = match phonebook.watch() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Phonebook watch unavailable: {}", e);
            None
        }
    };

    let llm = LlmClient::new(config.llm.clone());
    let tts = TtsManager::spawn(config.tts.clone(), registry.clone(), telemetry.clone());
    let stt_admission = SttAdmission::new(config.stt.max_connections);

    let audit = Arc::new(
        AuditStore::open(&config.audit.db_path)
            .await
            .context("Failed to open audit store")?,
    );
    let calendar = Arc::new(HttpCalendar::new(
        config.calendar.base_url.clone(),
        config.calendar.api_key.clone(),
    ));
    let sms = Arc::new(CarrierSms::new(config.carrier.clone()));
    let dialer = Arc::new(CarrierDialer::new(config.carrier.clone()));

    // Outbound legs fetch TwiML from this URL when answered
    let twiml_url = config
        .server
        .outbound_ws_url
        .replace("wss://", "https://")
        .replace("/media", "/twiml");

    let teammate = Arc::new(TeammateFlow::new(
        llm.clone(),
        calendar.clone(),
        dialer,
        audit.clone(),
        registry.clone(),
        twiml_url,
    ));
    let customer = Arc::new(CustomerDelayFlow::new(
        llm.clone(),
        calendar,
        sms,
        audit,
    ));

    let graph = DialogGraph::new(Arc::new(CheckpointStore::new()), config.dialog.history_limit);

    let orchestrator = Orchestrator::new(
        config.clone(),
        registry.clone(),
        telemetry.clone(),
        llm,
        tts.clone(),
        stt_admission,
        graph,
        teammate,
        customer,
    );

    let state = AppState {
        config: config.clone(),
        registry,
        telemetry,
        phonebook,
        tts,
        orchestrator,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(http::index_handler))
        .route("/health", get(http::health_handler))
        .route("/events", get(http::events_handler))
        .route("/voice-token", get(http::voice_token_handler))
        .route("/twiml", post(http::twiml_handler))
        .route(
            config.server.media_ws_path.as_str(),
            get(telephony::media_ws_handler),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;

    info!("Listening on http://{}", addr);
    info!("Media stream path: {}", config.server.media_ws_path);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    Ok(())
}
