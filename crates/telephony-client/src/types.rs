//! Provider API types.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider sub-account credentials.
///
/// The auth token is held as a `SecretString` so it never shows up in
/// logs or debug output.
#[derive(Clone)]
pub struct ProviderCredentials {
    pub account_sid: String,
    auth_token: SecretString,
}

impl ProviderCredentials {
    pub fn new(account_sid: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: SecretString::new(auth_token.into()),
        }
    }

    pub fn auth_token(&self) -> &str {
        self.auth_token.expose_secret()
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

/// Handle to a provisioned number, needed to release it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberHandle {
    /// Provider resource id (e.g. `PN...`).
    pub sid: String,
    /// The number in E.164 format.
    pub phone_number: String,
}

/// A message received on a provisioned number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub sent_at: Option<DateTime<Utc>>,
}

// Wire types for the Twilio-compatible REST API.

#[derive(Debug, Deserialize)]
pub(crate) struct AvailableNumbersPage {
    #[serde(default)]
    pub available_phone_numbers: Vec<AvailableNumber>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AvailableNumber {
    pub phone_number: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IncomingNumber {
    pub sid: String,
    pub phone_number: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProvisionRequest<'a> {
    #[serde(rename = "PhoneNumber")]
    pub phone_number: &'a str,
    #[serde(rename = "SmsUrl", skip_serializing_if = "Option::is_none")]
    pub sms_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesPage {
    #[serde(default)]
    pub messages: Vec<MessageResource>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageResource {
    pub sid: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub date_sent: Option<String>,
}

impl MessageResource {
    pub fn into_message(self) -> ProviderMessage {
        let sent_at = self
            .date_sent
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
            .map(|d| d.with_timezone(&Utc));

        ProviderMessage {
            id: self.sid,
            from: self.from.unwrap_or_default(),
            to: self.to.unwrap_or_default(),
            body: self.body.unwrap_or_default(),
            sent_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LookupResponse {
    #[serde(default)]
    pub valid: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
}
