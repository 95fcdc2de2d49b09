//! Application error types.

use crate::messenger::SignalError;
use otp_core::EngineError;
use thiserror::Error;

/// Main application error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Result type alias for application errors.
pub type AppResult<T> = Result<T, AppError>;
