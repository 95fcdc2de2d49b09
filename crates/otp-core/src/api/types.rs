//! API request/response types.

use crate::types::EngineStats;
use serde::{Deserialize, Serialize};

/// Form body of an inbound SMS webhook.
///
/// Fields are optional so a missing one becomes a 400 with a clear reason
/// instead of a generic extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct SmsWebhookForm {
    #[serde(rename = "MessageSid")]
    pub message_sid: Option<String>,
    #[serde(rename = "From")]
    pub from: Option<String>,
    #[serde(rename = "To")]
    pub to: Option<String>,
    #[serde(rename = "Body")]
    pub body: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub stats: EngineStats,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}
