//! Signal front end for the OTP virtual-number engine.
//!
//! Messages arrive through [`messenger::MessageReceiver`] and are handed to a
//! [`ChatDispatcher`], which routes each one to the first matching
//! [`commands::CommandHandler`] and answers in the same chat.
//! Engine notifications go out through [`messenger::SignalNotifier`].

pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod messenger;

pub use dispatcher::ChatDispatcher;

use crate::commands::*;
use crate::messenger::BotMessage;
use otp_core::{Notifier, OtpEngine};
use std::sync::Arc;
use tracing::error;

/// Reply sent when a handler fails.
pub const GENERIC_FAILURE: &str = "Sorry, something went wrong.";

/// All command handlers, the plain-text input handler last.
pub fn build_handlers(engine: OtpEngine, notifier: Arc<dyn Notifier>) -> Vec<Box<dyn CommandHandler>> {
    vec![
        Box::new(HelpHandler::new(engine.clone())),
        Box::new(StartHandler::new(engine.clone(), notifier.clone())),
        Box::new(BalanceHandler::new(engine.clone())),
        Box::new(ReferHandler::new(engine.clone(), notifier.clone())),
        Box::new(BonusHandler::new(engine.clone())),
        Box::new(ConvertHandler::new(engine.clone())),
        Box::new(RedeemHandler::new(engine.clone())),
        Box::new(NumbersHandler::new(engine.clone())),
        Box::new(BuyHandler::new(engine.clone())),
        Box::new(OtpHandler::new(engine.clone())),
        Box::new(AdminHandler::new(engine.clone())),
        Box::new(InputHandler::new(engine, notifier)),
    ]
}

/// Run the matching handler and produce the reply, if any handler matches.
pub async fn dispatch(handlers: &[Box<dyn CommandHandler>], message: &BotMessage) -> Option<String> {
    let handler = handlers.iter().find(|h| h.matches(message))?;

    match handler.execute(message).await {
        Ok(response) => Some(response),
        Err(e) => {
            error!("Handler {} error: {}", handler.name(), e);
            Some(GENERIC_FAILURE.to_string())
        }
    }
}
