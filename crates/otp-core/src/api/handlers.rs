//! HTTP API handlers.

use super::types::*;
use crate::engine::OtpEngine;
use crate::error::EngineError;
use crate::ingest::IngestOutcome;
use crate::types::{InboundMessage, Transport};
use axum::{
    extract::{Form, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Empty TwiML reply; the provider sends nothing back to the sender.
const EMPTY_TWIML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>";

/// Shared application state for handlers.
pub struct AppState {
    pub engine: OtpEngine,
}

impl AppState {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }
}

/// Create the webhook router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/sms", post(sms_webhook))
        .route("/webhooks/debugger", post(debugger_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        stats: state.engine.stats().await,
    })
}

fn required(field: Option<String>, name: &str) -> Result<String, EngineError> {
    field
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::MalformedPayload(format!("missing {}", name)))
}

/// Inbound SMS pushed by the provider.
async fn sms_webhook(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SmsWebhookForm>,
) -> Result<impl IntoResponse, EngineError> {
    let message = InboundMessage {
        message_id: required(form.message_sid, "MessageSid")?,
        from: required(form.from, "From")?,
        to: required(form.to, "To")?,
        body: form.body.unwrap_or_default(),
    };
    debug!("SMS webhook for {} ({})", message.to, message.message_id);

    match state
        .engine
        .ingestor()
        .ingest(message, Transport::Webhook)
        .await?
    {
        IngestOutcome::Delivered(account_id) => info!("Webhook delivered message to {}", account_id),
        IngestOutcome::Duplicate => debug!("Webhook message already processed"),
        IngestOutcome::Discarded(reason) => debug!("Webhook message discarded: {:?}", reason),
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        EMPTY_TWIML,
    ))
}

/// Provider debugger events. Logged only.
async fn debugger_webhook(Form(event): Form<HashMap<String, String>>) -> StatusCode {
    warn!(
        "Provider debugger event: level={} code={} payload={}",
        event.get("Level").map(String::as_str).unwrap_or("unknown"),
        event.get("ErrorCode").map(String::as_str).unwrap_or("-"),
        event.get("Payload").map(String::as_str).unwrap_or("")
    );
    StatusCode::OK
}
