//! Client for the signal-cli REST bridge.
//!
//! The bot uses three calls: drain its inbox, send text and the health check
//! run at startup.

use super::error::SignalError;
use super::types::{BotMessage, IncomingMessage, SendMessageRequest};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use urlencoding::encode;

/// Bridge handle bound to the bot's own number. Cheap to clone.
#[derive(Clone)]
pub struct SignalClient {
    http: Client,
    base_url: String,
    bot_number: String,
}

impl SignalClient {
    pub fn new(
        base_url: impl Into<String>,
        bot_number: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SignalError> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bot_number: bot_number.into(),
        })
    }

    /// Number the bot receives on and sends from.
    pub fn bot_number(&self) -> &str {
        &self.bot_number
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health_check(&self) -> bool {
        match self.http.get(self.url("/v1/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Signal bridge health check failed: {}", e);
                false
            }
        }
    }

    /// Fetch and remove everything waiting in the bot's inbox.
    #[instrument(skip(self))]
    pub async fn receive(&self) -> Result<Vec<IncomingMessage>, SignalError> {
        let url = self.url(&format!("/v1/receive/{}", encode(&self.bot_number)));
        let response = checked(self.http.get(url).send().await?).await?;

        let body = response.text().await?;
        let messages: Vec<IncomingMessage> = serde_json::from_str(&body)?;
        if !messages.is_empty() {
            debug!("Inbox held {} envelope(s)", messages.len());
        }
        Ok(messages)
    }

    /// Send a text message from the bot's number.
    #[instrument(skip(self, text))]
    pub async fn send(&self, recipient: &str, text: &str) -> Result<(), SignalError> {
        let request = SendMessageRequest {
            message: text.to_string(),
            number: self.bot_number.clone(),
            recipients: vec![recipient.to_string()],
        };

        let response = self
            .http
            .post(self.url("/v2/send"))
            .json(&request)
            .send()
            .await?;
        checked(response)
            .await
            .inspect_err(|e| warn!("Message to {} not sent: {}", recipient, e))?;

        debug!("Sent {} chars to {}", text.chars().count(), recipient);
        Ok(())
    }

    /// Answer in the chat a message came from.
    pub async fn reply(&self, original: &BotMessage, text: &str) -> Result<(), SignalError> {
        self.send(original.reply_target(), text).await
    }
}

async fn checked(response: Response) -> Result<Response, SignalError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(SignalError::Rejected {
        status: status.as_u16(),
        body,
    })
}
