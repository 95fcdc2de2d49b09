//! Telephony provider interface.

use crate::error::ProviderError;
use crate::types::{NumberHandle, ProviderCredentials, ProviderMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// The operations the allocation engine needs from a telephony provider.
///
/// Every call is scoped to one provider sub-account through its credentials.
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// List numbers available for purchase in a region (ISO country code).
    async fn list_available_numbers(
        &self,
        creds: &ProviderCredentials,
        region: &str,
        limit: u32,
    ) -> Result<Vec<String>, ProviderError>;

    /// Provision a number, routing inbound SMS to `callback_url` when given.
    async fn provision_number(
        &self,
        creds: &ProviderCredentials,
        number: &str,
        callback_url: Option<&str>,
    ) -> Result<NumberHandle, ProviderError>;

    /// Release a previously provisioned number.
    async fn release_number(
        &self,
        creds: &ProviderCredentials,
        handle: &NumberHandle,
    ) -> Result<(), ProviderError>;

    /// Check that a number exists and is well formed.
    async fn validate_number(
        &self,
        creds: &ProviderCredentials,
        number: &str,
    ) -> Result<bool, ProviderError>;

    /// Fetch messages delivered to `number`, newest first.
    async fn list_recent_messages(
        &self,
        creds: &ProviderCredentials,
        number: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<ProviderMessage>, ProviderError>;

    /// Check that a credential pair is accepted by the provider.
    async fn validate_credential(&self, creds: &ProviderCredentials)
        -> Result<bool, ProviderError>;
}
