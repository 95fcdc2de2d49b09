//! Registration, balance and referral commands.

use crate::commands::{respond, sender_account, CommandHandler};
use crate::error::AppResult;
use crate::messenger::BotMessage;
use async_trait::async_trait;
use otp_core::{Account, EngineResult, InputState, Notifier, OtpEngine};
use std::sync::Arc;
use tracing::info;

/// Tell a referrer that someone joined with their code.
pub(crate) async fn notify_referrer(
    engine: &OtpEngine,
    notifier: &dyn Notifier,
    referrer: &str,
    account: &Account,
) {
    let text = format!(
        "{} joined with your referral code. You earned {} point(s).",
        account.username.as_deref().unwrap_or("Someone"),
        engine.config().referral_bonus_points
    );
    notifier.notify(&referrer.to_string(), &text).await;
}

/// `!start [code]` - first contact.
pub struct StartHandler {
    engine: OtpEngine,
    notifier: Arc<dyn Notifier>,
}

impl StartHandler {
    pub fn new(engine: OtpEngine, notifier: Arc<dyn Notifier>) -> Self {
        Self { engine, notifier }
    }

    async fn start(&self, message: &BotMessage) -> EngineResult<String> {
        let code = message.command().1;
        let code = (!code.is_empty()).then_some(code);

        let registration = self
            .engine
            .register(&message.source, message.source_name.as_deref(), code)
            .await?;

        if let Some(referrer) = &registration.referrer {
            notify_referrer(&self.engine, self.notifier.as_ref(), referrer, &registration.account)
                .await;
        }

        let mut reply = if registration.created {
            info!("New user {}", message.source);
            format!(
                "**Welcome!**\n\nYour referral code is `{}`. Share it to earn points.\n\nSend !help to see what you can do.",
                registration.account.referral_code
            )
        } else {
            "Welcome back! Send !help to see what you can do.".to_string()
        };

        if code.is_some() && registration.referrer.is_none() {
            reply.push_str("\n\nThat referral code could not be applied.");
        } else if registration.created
            && registration.referrer.is_none()
            && !self.engine.is_admin(&message.source)
        {
            self.engine
                .store()
                .set_input_state(&message.source, InputState::AwaitingReferralCode)
                .await?;
            reply.push_str("\n\nWere you invited? Reply with the referral code now.");
        }

        Ok(reply)
    }
}

#[async_trait]
impl CommandHandler for StartHandler {
    fn name(&self) -> &str {
        "start"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!start")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.start(message).await)
    }
}

/// `!balance` - points, credits and the leased number.
pub struct BalanceHandler {
    engine: OtpEngine,
}

impl BalanceHandler {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl CommandHandler for BalanceHandler {
    fn name(&self) -> &str {
        "balance"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!balance")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        let account = match sender_account(&self.engine, message).await {
            Ok(account) => account,
            Err(e) => return respond(Err(e)),
        };
        let config = self.engine.config();

        Ok(format!(
            "**Your Balance**\n\n\
             Points: {}\n\
             Credits: {}\n\
             Number: {}\n\
             Status: {}\n\n\
             {} points buy {} credits with !convert. A number costs {} credit(s).",
            account.balance_points,
            account.balance_credits,
            account.leased_number().unwrap_or("none"),
            account.status,
            config.points_per_credit_set,
            config.credits_per_set,
            config.credits_per_number,
        ))
    }
}

/// `!refer [code]` - show the own code or name a referrer.
pub struct ReferHandler {
    engine: OtpEngine,
    notifier: Arc<dyn Notifier>,
}

impl ReferHandler {
    pub fn new(engine: OtpEngine, notifier: Arc<dyn Notifier>) -> Self {
        Self { engine, notifier }
    }

    async fn refer(&self, message: &BotMessage) -> EngineResult<String> {
        let account = sender_account(&self.engine, message).await?;
        let code = message.command().1;

        if code.is_empty() {
            return Ok(format!(
                "Your referral code is `{}`.\n\nEach friend who joins with it earns you {} point(s).{}",
                account.referral_code,
                self.engine.config().referral_bonus_points,
                if account.referrer_id.is_none() {
                    "\nWere you invited? Send !refer <code>."
                } else {
                    ""
                }
            ));
        }

        let referrer = self.engine.ledger().apply_referral(&account.id, code).await?;
        notify_referrer(&self.engine, self.notifier.as_ref(), &referrer, &account).await;
        Ok("Referral code applied. Thanks for joining!".into())
    }
}

#[async_trait]
impl CommandHandler for ReferHandler {
    fn name(&self) -> &str {
        "refer"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!refer")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.refer(message).await)
    }
}
