//! Core data types for the allocation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use telephony_client::{NumberHandle, ProviderCredentials};

/// Account identifier (the messaging front end's stable user id).
pub type AccountId = String;

/// Credential pool identifier.
pub type CredentialId = u64;

/// Admin approval state of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntitlementStatus::Pending => "pending",
            EntitlementStatus::Approved => "approved",
            EntitlementStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Pending text prompt for an account.
///
/// Set by a command that needs follow-up input and taken by the next
/// plain text message from the same account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputState {
    /// `SID,token` pair. With a target it approves that account,
    /// otherwise it is added to the pool.
    AwaitingCredential { target: Option<AccountId> },
    AwaitingPoints { target: AccountId },
    /// `code,points`.
    AwaitingRedeemCodeDefinition,
    AwaitingSearchQuery,
    AwaitingReferralCode,
}

/// A number currently provisioned to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasedNumber {
    pub handle: NumberHandle,
    pub leased_at: DateTime<Utc>,
}

impl LeasedNumber {
    pub fn number(&self) -> &str {
        &self.handle.phone_number
    }
}

/// An end user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub username: Option<String>,
    /// Code other users enter to name this account as their referrer.
    pub referral_code: String,
    pub balance_points: u64,
    pub balance_credits: u64,
    pub status: EntitlementStatus,
    /// When admins were last asked to approve this account.
    pub approval_requested_at: Option<DateTime<Utc>>,
    pub credential_id: Option<CredentialId>,
    pub leased: Option<LeasedNumber>,
    pub referrer_id: Option<AccountId>,
    pub numbers_purchased: u32,
    pub last_allocation_at: Option<DateTime<Utc>>,
    /// Lock flag held for the duration of a purchase.
    pub allocation_in_progress: bool,
    pub last_bonus_at: Option<DateTime<Utc>>,
    pub last_otp_refresh_at: Option<DateTime<Utc>>,
    /// Poll watermark: messages sent before this were already swept.
    pub last_check: Option<DateTime<Utc>>,
    pub input_state: Option<InputState>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: impl Into<AccountId>, username: Option<String>, referral_code: String) -> Self {
        Self {
            id: id.into(),
            username,
            referral_code,
            balance_points: 0,
            balance_credits: 0,
            status: EntitlementStatus::Pending,
            approval_requested_at: None,
            credential_id: None,
            leased: None,
            referrer_id: None,
            numbers_purchased: 0,
            last_allocation_at: None,
            allocation_in_progress: false,
            last_bonus_at: None,
            last_otp_refresh_at: None,
            last_check: None,
            input_state: None,
            created_at: Utc::now(),
        }
    }

    pub fn leased_number(&self) -> Option<&str> {
        self.leased.as_ref().map(|l| l.number())
    }

    /// Display name for admin views.
    pub fn display_name(&self) -> String {
        match &self.username {
            Some(name) => format!("{} (@{})", self.id, name),
            None => self.id.clone(),
        }
    }
}

/// A provider credential in the shared pool.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub account_sid: String,
    pub auth_token: String,
    pub used_by: Option<AccountId>,
    pub added_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn provider_credentials(&self) -> ProviderCredentials {
        ProviderCredentials::new(&self.account_sid, &self.auth_token)
    }

    /// Short SHA-256 fingerprint, safe to show in admin views.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.account_sid.as_bytes());
        hasher.update(b":");
        hasher.update(self.auth_token.as_bytes());
        hex::encode(&hasher.finalize()[..4])
    }

    pub fn is_available(&self) -> bool {
        self.used_by.is_none()
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("account_sid", &self.account_sid)
            .field("fingerprint", &self.fingerprint())
            .field("used_by", &self.used_by)
            .finish()
    }
}

/// Single-use code worth a fixed number of points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemCode {
    pub code: String,
    pub value_points: u64,
    pub redeemed_by: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

/// Append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub account_id: AccountId,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

/// How an inbound message reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Poll,
    Webhook,
    Refresh,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Poll => "poll",
            Transport::Webhook => "webhook",
            Transport::Refresh => "refresh",
        };
        f.write_str(s)
    }
}

/// An inbound message as seen by either transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: String,
    pub to: String,
    pub from: String,
    pub body: String,
}

/// A message that has been delivered; the `message_id` is the idempotence key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub account_id: AccountId,
    pub from_number: String,
    pub to_number: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub transport: Transport,
}

/// Admin action attached to an approval prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminAction {
    Approve(AccountId),
    Reject(AccountId),
}

impl AdminAction {
    /// Command an admin sends to perform the action.
    pub fn command(&self) -> String {
        match self {
            AdminAction::Approve(id) => format!("!admin approve {}", id),
            AdminAction::Reject(id) => format!("!admin reject {}", id),
        }
    }
}

/// Outcome of a bulk approve/reject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub succeeded: usize,
    pub skipped: usize,
}

/// Store-wide counters for admin views and the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub accounts: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub credentials_total: usize,
    pub credentials_free: usize,
    pub leased_numbers: usize,
    pub processed_messages: usize,
    pub redeem_codes_open: usize,
}
