//! Twilio-compatible REST client.

use crate::error::ProviderError;
use crate::provider::TelephonyProvider;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use urlencoding::encode;

const API_VERSION: &str = "2010-04-01";

/// REST client for a Twilio-compatible telephony API.
#[derive(Clone)]
pub struct TwilioClient {
    client: Client,
    api_url: String,
    lookup_url: String,
}

impl TwilioClient {
    /// Create a new client.
    pub fn new(
        api_url: impl Into<String>,
        lookup_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            lookup_url: lookup_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn account_url(&self, creds: &ProviderCredentials, resource: &str) -> String {
        format!(
            "{}/{}/Accounts/{}{}",
            self.api_url,
            API_VERSION,
            encode(&creds.account_sid),
            resource
        )
    }

    fn authed(&self, request: RequestBuilder, creds: &ProviderCredentials) -> RequestBuilder {
        request.basic_auth(&creds.account_sid, Some(creds.auth_token()))
    }

    /// Handle HTTP response, converting errors appropriately.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        if response.status().is_success() {
            let body = response.text().await?;
            debug!("Response body: {}", preview(&body, 200));
            serde_json::from_str(&body).map_err(ProviderError::from)
        } else {
            Err(self.extract_error(response).await)
        }
    }

    /// Extract error information from failed response.
    async fn extract_error(&self, response: reqwest::Response) -> ProviderError {
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Provider rate limit exceeded");
                ProviderError::RateLimited
            }
            StatusCode::UNAUTHORIZED => {
                warn!("Provider authentication failed");
                ProviderError::Unauthorized
            }
            _ => {
                let text = response.text().await.unwrap_or_default();
                let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();
                let message = body.message.unwrap_or(text);

                if status == StatusCode::PAYMENT_REQUIRED
                    || message.to_lowercase().contains("insufficient funds")
                {
                    warn!("Provider account out of funds");
                    return ProviderError::FundsExhausted(message);
                }

                ProviderError::Api {
                    status: status.as_u16(),
                    code: body.code,
                    message,
                }
            }
        }
    }
}

/// At most `max` characters of a response body, cut on a char boundary.
fn preview(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}

#[async_trait]
impl TelephonyProvider for TwilioClient {
    #[instrument(skip(self, creds), fields(account = %creds.account_sid))]
    async fn list_available_numbers(
        &self,
        creds: &ProviderCredentials,
        region: &str,
        limit: u32,
    ) -> Result<Vec<String>, ProviderError> {
        let url = self.account_url(
            creds,
            &format!("/AvailablePhoneNumbers/{}/Local.json", region.to_uppercase()),
        );

        let response = self
            .authed(self.client.get(url), creds)
            .query(&[("PageSize", limit.to_string()), ("SmsEnabled", "true".into())])
            .send()
            .await?;

        let page: AvailableNumbersPage = self.handle_response(response).await?;
        Ok(page
            .available_phone_numbers
            .into_iter()
            .map(|n| n.phone_number)
            .collect())
    }

    #[instrument(skip(self, creds), fields(account = %creds.account_sid))]
    async fn provision_number(
        &self,
        creds: &ProviderCredentials,
        number: &str,
        callback_url: Option<&str>,
    ) -> Result<NumberHandle, ProviderError> {
        let request = ProvisionRequest {
            phone_number: number,
            sms_url: callback_url,
        };

        let response = self
            .authed(
                self.client
                    .post(self.account_url(creds, "/IncomingPhoneNumbers.json")),
                creds,
            )
            .form(&request)
            .send()
            .await?;

        let incoming: IncomingNumber = self.handle_response(response).await?;
        debug!("Provisioned {} as {}", incoming.phone_number, incoming.sid);

        Ok(NumberHandle {
            sid: incoming.sid,
            phone_number: incoming.phone_number,
        })
    }

    #[instrument(skip(self, creds), fields(account = %creds.account_sid))]
    async fn release_number(
        &self,
        creds: &ProviderCredentials,
        handle: &NumberHandle,
    ) -> Result<(), ProviderError> {
        let url = self.account_url(
            creds,
            &format!("/IncomingPhoneNumbers/{}.json", encode(&handle.sid)),
        );

        let response = self.authed(self.client.delete(url), creds).send().await?;

        // Already gone counts as released
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            debug!("Released {}", handle.phone_number);
            return Ok(());
        }

        Err(self.extract_error(response).await)
    }

    #[instrument(skip(self, creds), fields(account = %creds.account_sid))]
    async fn validate_number(
        &self,
        creds: &ProviderCredentials,
        number: &str,
    ) -> Result<bool, ProviderError> {
        let url = format!("{}/v2/PhoneNumbers/{}", self.lookup_url, encode(number));

        let response = self.authed(self.client.get(url), creds).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        let lookup: LookupResponse = self.handle_response(response).await?;
        Ok(lookup.valid.unwrap_or(true))
    }

    #[instrument(skip(self, creds), fields(account = %creds.account_sid))]
    async fn list_recent_messages(
        &self,
        creds: &ProviderCredentials,
        number: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<ProviderMessage>, ProviderError> {
        let mut query = vec![
            ("To", number.to_string()),
            ("PageSize", limit.to_string()),
        ];
        if let Some(since) = since {
            query.push(("DateSent>", since.format("%Y-%m-%dT%H:%M:%SZ").to_string()));
        }

        let response = self
            .authed(self.client.get(self.account_url(creds, "/Messages.json")), creds)
            .query(&query)
            .send()
            .await?;

        let page: MessagesPage = self.handle_response(response).await?;

        // The API filters by date only at second granularity
        let messages = page
            .messages
            .into_iter()
            .map(MessageResource::into_message)
            .filter(|m| match (since, m.sent_at) {
                (Some(since), Some(sent)) => sent >= since,
                _ => true,
            })
            .collect::<Vec<_>>();

        debug!("Fetched {} messages for {}", messages.len(), number);
        Ok(messages)
    }

    #[instrument(skip(self, creds), fields(account = %creds.account_sid))]
    async fn validate_credential(
        &self,
        creds: &ProviderCredentials,
    ) -> Result<bool, ProviderError> {
        let url = format!(
            "{}/{}/Accounts/{}.json",
            self.api_url,
            API_VERSION,
            encode(&creds.account_sid)
        );

        let response = self.authed(self.client.get(url), creds).send().await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.extract_error(response).await),
        }
    }
}
