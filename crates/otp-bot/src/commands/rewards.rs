//! Point earning and conversion commands.

use crate::commands::{respond, sender_account, CommandHandler};
use crate::error::AppResult;
use crate::messenger::BotMessage;
use async_trait::async_trait;
use otp_core::{EngineResult, OtpEngine};

/// `!bonus` - daily points.
pub struct BonusHandler {
    engine: OtpEngine,
}

impl BonusHandler {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }

    async fn claim(&self, message: &BotMessage) -> EngineResult<String> {
        let account = sender_account(&self.engine, message).await?;
        let awarded = self.engine.ledger().claim_daily_bonus(&account.id).await?;
        let balance = self.engine.store().account(&account.id).await?.balance_points;
        Ok(format!(
            "You claimed {} bonus point(s). You now have {} points.",
            awarded, balance
        ))
    }
}

#[async_trait]
impl CommandHandler for BonusHandler {
    fn name(&self) -> &str {
        "bonus"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!bonus")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.claim(message).await)
    }
}

/// `!convert` - buy one credit set with points.
pub struct ConvertHandler {
    engine: OtpEngine,
}

impl ConvertHandler {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }

    async fn convert(&self, message: &BotMessage) -> EngineResult<String> {
        let account = sender_account(&self.engine, message).await?;
        let balances = self.engine.ledger().purchase_credit_set(&account.id).await?;
        Ok(format!(
            "Converted {} points to {} credits.\n\nPoints: {}\nCredits: {}",
            self.engine.config().points_per_credit_set,
            self.engine.config().credits_per_set,
            balances.points,
            balances.credits
        ))
    }
}

#[async_trait]
impl CommandHandler for ConvertHandler {
    fn name(&self) -> &str {
        "convert"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!convert")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.convert(message).await)
    }
}

/// `!redeem <code>`
pub struct RedeemHandler {
    engine: OtpEngine,
}

impl RedeemHandler {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }

    async fn redeem(&self, message: &BotMessage) -> EngineResult<String> {
        let code = message.command().1;
        if code.is_empty() {
            return Ok("Usage: !redeem <code>".into());
        }

        let account = sender_account(&self.engine, message).await?;
        let awarded = self.engine.ledger().redeem(&account.id, code).await?;
        Ok(format!("Code redeemed for {} point(s).", awarded))
    }
}

#[async_trait]
impl CommandHandler for RedeemHandler {
    fn name(&self) -> &str {
        "redeem"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!redeem")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.redeem(message).await)
    }
}
