//! Telephony provider errors.

use thiserror::Error;

/// Coarse classification used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The provider throttled the request.
    RateLimited,
    /// Network failure or provider-side 5xx.
    Transient,
    /// The provider sub-account has run out of balance.
    FundsExhausted,
    /// The request itself was rejected (bad number, bad credential).
    Invalid,
    Other,
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Insufficient provider funds: {0}")]
    FundsExhausted(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("API error: {status} - {message}")]
    Api {
        status: u16,
        code: Option<u32>,
        message: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    /// Classify the error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::RateLimited => ErrorClass::RateLimited,
            ProviderError::FundsExhausted(_) => ErrorClass::FundsExhausted,
            ProviderError::Unauthorized => ErrorClass::Invalid,
            ProviderError::Http(e) if e.is_timeout() || e.is_connect() => ErrorClass::Transient,
            ProviderError::Http(_) => ErrorClass::Other,
            ProviderError::Api { status, .. } => match status {
                400 | 404 | 422 => ErrorClass::Invalid,
                500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Other,
            },
            ProviderError::Json(_) => ErrorClass::Other,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::RateLimited | ErrorClass::Transient)
    }
}
