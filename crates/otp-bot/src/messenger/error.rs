//! Messenger errors.

use thiserror::Error;

/// Failure talking to the Signal REST bridge.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Signal bridge unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed Signal payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The bridge answered with a non-success status.
    #[error("Signal bridge returned {status}: {body}")]
    Rejected { status: u16, body: String },
}
