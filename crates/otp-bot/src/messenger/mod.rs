//! Signal CLI REST API messenger.

mod client;
mod error;
mod notifier;
mod receiver;
mod types;

pub use client::SignalClient;
pub use error::SignalError;
pub use notifier::{format_admin_prompt, SignalNotifier};
pub use receiver::MessageReceiver;
pub use types::*;
