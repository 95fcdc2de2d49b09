//! Engine error types.

use crate::api::ErrorResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;
use telephony_client::{ErrorClass, ProviderError};
use thiserror::Error;

/// Errors that can occur in the allocation engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Not enough points for the operation.
    #[error("Insufficient points: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    /// Not enough credits for the operation.
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: u64, available: u64 },

    #[error("Invalid redeem code: {0}")]
    InvalidCode(String),

    #[error("Code already redeemed: {0}")]
    AlreadyRedeemed(String),

    #[error("Redeem code already exists: {0}")]
    DuplicateCode(String),

    /// Another purchase is mid-flight for this account.
    #[error("Allocation already in progress")]
    AllocationInProgress,

    #[error("Cooldown active, {} seconds remaining", .remaining.as_secs())]
    CooldownActive { remaining: Duration },

    #[error("Number already leased by this account: {0}")]
    DuplicateNumber(String),

    #[error("Number is leased by another account: {0}")]
    NumberTaken(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Failed to release previous number: {0}")]
    ReleaseFailed(String),

    /// Still rate limited after exhausting retries.
    #[error("Provider rate limit exceeded")]
    ProviderRateLimited,

    #[error("Provider account out of funds: {0}")]
    ProviderFundsExhausted(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("No credential available")]
    NoCredentialAvailable,

    #[error("Account has no provider credential assigned")]
    NotEntitled,

    #[error("Account has no leased number")]
    NoNumber,

    #[error("Credential rejected by provider")]
    InvalidCredential,

    #[error("Credential already assigned to another account")]
    CredentialInUse,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Cannot refer yourself")]
    SelfReferral,

    #[error("Referrer already set")]
    AlreadyReferred,

    #[error("Unknown referral code: {0}")]
    InvalidReferralCode(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Inbound webhook payload missing required fields.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Human-readable reason with the affordance the user has.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::InsufficientFunds {
                required,
                available,
            } => format!(
                "You need {} points but only have {}. Earn more with !bonus, !refer or !redeem.",
                required, available
            ),
            EngineError::InsufficientCredits {
                required,
                available,
            } => format!(
                "You need {} credit(s) but only have {}. Use !convert to buy credits.",
                required, available
            ),
            EngineError::InvalidCode(_) => "That code does not exist.".into(),
            EngineError::AlreadyRedeemed(_) => "That code has already been used.".into(),
            EngineError::AllocationInProgress => {
                "A purchase is already in progress. Please wait for it to finish.".into()
            }
            EngineError::CooldownActive { remaining } => format!(
                "Please wait {} before trying again.",
                format_wait(*remaining)
            ),
            EngineError::DuplicateNumber(n) => format!("You have already purchased {}.", n),
            EngineError::NumberTaken(n) => {
                format!("{} is held by someone else. Pick another number.", n)
            }
            EngineError::InvalidNumber(n) => format!("{} is not a valid number.", n),
            EngineError::ReleaseFailed(_) => {
                "Could not release your current number. Your credits were not charged, please try again.".into()
            }
            EngineError::ProviderRateLimited => {
                "The provider is busy right now. Please try again in a minute.".into()
            }
            EngineError::ProviderFundsExhausted(_) => {
                "Your number provider is out of funds. Contact an admin for a new credential.".into()
            }
            EngineError::NoCredentialAvailable => {
                "Your request is pending admin approval. You will be notified.".into()
            }
            EngineError::NotEntitled => {
                "You are not approved yet. Use !numbers to request access.".into()
            }
            EngineError::NoNumber => "You do not have a number yet. Use !buy <number>.".into(),
            EngineError::Unauthorized => "You are not allowed to do that.".into(),
            EngineError::SelfReferral => "You cannot use your own referral code.".into(),
            EngineError::AlreadyReferred => "You have already used a referral code.".into(),
            EngineError::InvalidReferralCode(_) => "That referral code does not exist.".into(),
            EngineError::Storage(_)
            | EngineError::Encryption(_)
            | EngineError::Serialization(_)
            | EngineError::Config(_)
            | EngineError::Internal(_) => {
                "Something went wrong on our side. Please try again later.".into()
            }
            other => other.to_string(),
        }
    }
}

/// Render a wait as `Xm Ys` or `Ys`.
pub fn format_wait(remaining: Duration) -> String {
    let secs = remaining.as_secs().max(1);
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m {}s", m, s),
        (h, m, _) => format!("{}h {}m", h, m),
    }
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        match e.class() {
            ErrorClass::FundsExhausted => EngineError::ProviderFundsExhausted(e.to_string()),
            ErrorClass::RateLimited => EngineError::ProviderRateLimited,
            _ => EngineError::Provider(e.to_string()),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<aes_gcm::Error> for EngineError {
    fn from(_: aes_gcm::Error) -> Self {
        EngineError::Encryption("AES-GCM operation failed".to_string())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            EngineError::MalformedPayload(_) => (StatusCode::BAD_REQUEST, "MALFORMED_PAYLOAD"),
            EngineError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND"),
            EngineError::Unauthorized => (StatusCode::FORBIDDEN, "UNAUTHORIZED"),
            EngineError::ProviderRateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            EngineError::ProviderFundsExhausted(_) | EngineError::Provider(_) => {
                (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR")
            }
            EngineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            EngineError::Encryption(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ENCRYPTION_ERROR"),
            EngineError::Serialization(_) | EngineError::Config(_) | EngineError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            _ => (StatusCode::BAD_REQUEST, "REQUEST_REJECTED"),
        };

        (status, Json(ErrorResponse::new(self.to_string(), code))).into_response()
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
