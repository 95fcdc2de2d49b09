//! Telephony provider client.
//!
//! Exposes the narrow [`TelephonyProvider`] interface the allocation engine
//! is written against, together with a Twilio-compatible REST implementation.

pub mod client;
pub mod error;
pub mod provider;
pub mod types;

pub use client::TwilioClient;
pub use error::{ErrorClass, ProviderError};
pub use provider::TelephonyProvider;
pub use types::{NumberHandle, ProviderCredentials, ProviderMessage};
