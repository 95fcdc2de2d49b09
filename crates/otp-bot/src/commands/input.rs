//! Default handler: plain text answering a pending prompt.

use crate::commands::account::notify_referrer;
use crate::commands::{admin, respond, CommandHandler};
use crate::error::AppResult;
use crate::messenger::BotMessage;
use async_trait::async_trait;
use otp_core::{EngineResult, InputState, Notifier, OtpEngine};
use std::sync::Arc;
use tracing::debug;

pub struct InputHandler {
    engine: OtpEngine,
    notifier: Arc<dyn Notifier>,
}

impl InputHandler {
    pub fn new(engine: OtpEngine, notifier: Arc<dyn Notifier>) -> Self {
        Self { engine, notifier }
    }

    async fn answer(&self, message: &BotMessage) -> EngineResult<String> {
        let actor = message.source.as_str();
        let text = message.text.trim();

        let Some(state) = self.engine.store().take_input_state(actor).await? else {
            return Ok("Send !help to see available commands.".into());
        };
        debug!("Input from {} for {:?}", actor, state);

        match state {
            InputState::AwaitingCredential { target: Some(target) } => {
                admin::apply_credential(&self.engine, actor, &target, text).await
            }
            InputState::AwaitingCredential { target: None } => {
                admin::add_credentials(&self.engine, actor, text).await
            }
            InputState::AwaitingPoints { target } => {
                admin::set_points(&self.engine, actor, &target, text).await
            }
            InputState::AwaitingRedeemCodeDefinition => {
                admin::create_code(&self.engine, actor, text).await
            }
            InputState::AwaitingSearchQuery => admin::search(&self.engine, text).await,
            InputState::AwaitingReferralCode => {
                let referrer = self.engine.ledger().apply_referral(actor, text).await?;
                let account = self.engine.store().account(actor).await?;
                notify_referrer(&self.engine, self.notifier.as_ref(), &referrer, &account).await;
                Ok("Referral code applied. Thanks for joining!".into())
            }
        }
    }
}

#[async_trait]
impl CommandHandler for InputHandler {
    fn name(&self) -> &str {
        "input"
    }

    fn is_default(&self) -> bool {
        true
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.answer(message).await)
    }
}
