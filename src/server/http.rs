//! HTTP handlers: liveness, health, SSE telemetry, carrier token, TwiML

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{Form, Json};
use chrono::Utc;
use futures_util::stream::Stream;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use crate::server::AppState;

/// SSE comment ping cadence keeping idle streams alive
const SSE_PING: Duration = Duration::from_secs(25);

/// Carrier access tokens are valid for one hour
const TOKEN_TTL_SECS: i64 = 3600;

/// Liveness probe
pub async fn index_handler() -> &'static str {
    "voicebridge up\n"
}

/// Health snapshot of the shared provider resources
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "tts_connection_state": state.tts.connection_state().as_str(),
        "voice_id": state.tts.voice_id(),
        "model": state.config.stt.model,
        "language": state.config.stt.language,
        "stt_connections": state.orchestrator.stt_connections(),
        "active_sessions": state.registry.active_count(),
    }))
}

/// Server-sent telemetry events with a periodic comment ping
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.telemetry.subscribe();

    let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let sse = Event::default()
                        .event(event.name())
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().event(event.name()));
                    return Some((Ok(sse), receiver));
                }
                // A lagging observer loses events, never the stream
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_PING).text("ping"))
}

#[derive(Debug, Deserialize)]
pub struct VoiceTokenQuery {
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Debug, Serialize)]
struct VoiceGrant {
    identity: String,
    voice: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct CarrierClaims {
    jti: String,
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
    grants: VoiceGrant,
}

/// Issue a carrier access token scoped to the outgoing application
pub async fn voice_token_handler(
    State(state): State<AppState>,
    Query(query): Query<VoiceTokenQuery>,
) -> impl IntoResponse {
    let carrier = &state.config.carrier;
    if carrier.api_key.is_empty() || carrier.api_secret.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Carrier credentials not configured" })),
        )
            .into_response();
    }

    let identity = query.identity.unwrap_or_else(|| "caller".to_string());
    let now = Utc::now().timestamp();

    let claims = CarrierClaims {
        jti: format!("{}-{}", carrier.api_key, now),
        iss: carrier.api_key.clone(),
        sub: carrier.account_sid.clone(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
        grants: VoiceGrant {
            identity: identity.clone(),
            voice: json!({
                "outgoing": { "application_sid": carrier.app_sid }
            }),
        },
    };

    let mut header = Header::default();
    header.cty = Some("twilio-fpa;v=1".to_string());

    match encode(
        &header,
        &claims,
        &EncodingKey::from_secret(carrier.api_secret.as_bytes()),
    ) {
        Ok(token) => (
            StatusCode::OK,
            Json(json!({ "identity": identity, "token": token })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Token generation failed", "details": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TwimlRequest {
    #[serde(rename = "CallSid", default)]
    pub call_sid: Option<String>,
}

/// Static TwiML instructing the carrier to open the media stream.
/// Outbound delay legs hit this too; their payload was stashed under the
/// call sid at dial time and is claimed when the stream starts.
pub async fn twiml_handler(
    State(state): State<AppState>,
    Form(request): Form<TwimlRequest>,
) -> impl IntoResponse {
    if let Some(call_sid) = &request.call_sid {
        info!(call_sid = %call_sid, "TwiML requested");
    }

    let document = twiml_document(&state.config.server.outbound_ws_url);
    ([(header::CONTENT_TYPE, "text/xml")], document)
}

/// Build the bidirectional-stream TwiML document
pub fn twiml_document(ws_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{}" />
    </Connect>
</Response>
"#,
        ws_url
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twiml_document_shape() {
        let doc = twiml_document("wss://example.com/media");
        assert!(doc.starts_with("<?xml"));
        assert!(doc.contains("<Connect>"));
        assert!(doc.contains(r#"<Stream url="wss://example.com/media" />"#));
    }

    #[test]
    fn test_carrier_claims_serialize() {
        let claims = CarrierClaims {
            jti: "SK123-1700000000".to_string(),
            iss: "SK123".to_string(),
            sub: "AC456".to_string(),
            iat: 1_700_000_000,
            exp: 1_700_003_600,
            grants: VoiceGrant {
                identity: "caller".to_string(),
                voice: json!({ "outgoing": { "application_sid": "AP789" } }),
            },
        };
        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["grants"]["identity"], "caller");
        assert_eq!(
            value["grants"]["voice"]["outgoing"]["application_sid"],
            "AP789"
        );
    }
}
