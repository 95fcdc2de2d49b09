//! Bot command handlers.

mod account;
mod admin;
mod help;
mod input;
mod numbers;
mod rewards;

pub use account::{BalanceHandler, ReferHandler, StartHandler};
pub use admin::AdminHandler;
pub use help::HelpHandler;
pub use input::InputHandler;
pub use numbers::{BuyHandler, NumbersHandler, OtpHandler};
pub use rewards::{BonusHandler, ConvertHandler, RedeemHandler};

use crate::error::AppResult;
use crate::messenger::BotMessage;
use async_trait::async_trait;
use otp_core::{Account, EngineError, EngineResult, OtpEngine};
use tracing::debug;

/// Command handler trait.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Command name (e.g., "help", "buy").
    fn name(&self) -> &str;

    /// Command trigger (e.g., "!help").
    fn trigger(&self) -> Option<&str> {
        None
    }

    /// Whether this is the default handler for non-command messages.
    fn is_default(&self) -> bool {
        false
    }

    /// Check if this handler matches the message.
    fn matches(&self, message: &BotMessage) -> bool {
        if let Some(trigger) = self.trigger() {
            message.command().0.eq_ignore_ascii_case(trigger)
        } else {
            self.is_default() && !message.text.trim_start().starts_with('!')
        }
    }

    /// Execute the command.
    async fn execute(&self, message: &BotMessage) -> AppResult<String>;
}

/// Turn an engine outcome into a reply.
///
/// Refusals become the user-facing reason. Infrastructure failures are
/// returned as errors so the message loop answers with its generic apology.
pub(crate) fn respond(result: EngineResult<String>) -> AppResult<String> {
    match result {
        Ok(reply) => Ok(reply),
        Err(
            e @ (EngineError::Storage(_)
            | EngineError::Encryption(_)
            | EngineError::Serialization(_)
            | EngineError::Internal(_)),
        ) => Err(e.into()),
        Err(e) => {
            debug!("Command refused: {}", e);
            Ok(e.user_message())
        }
    }
}

/// Fetch the sender's account, creating it on first contact.
pub(crate) async fn sender_account(engine: &OtpEngine, message: &BotMessage) -> EngineResult<Account> {
    let (account, _) = engine
        .store()
        .get_or_create_account(&message.source, message.source_name.as_deref())
        .await?;
    Ok(account)
}
