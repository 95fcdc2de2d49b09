//! Number listing, purchase and OTP refresh commands.

use crate::commands::{respond, sender_account, CommandHandler};
use crate::error::AppResult;
use crate::messenger::BotMessage;
use async_trait::async_trait;
use otp_core::{Entitlement, EngineResult, OtpEngine, RefreshResult};
use tracing::info;

/// `!numbers` - list purchasable numbers.
pub struct NumbersHandler {
    engine: OtpEngine,
}

impl NumbersHandler {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }

    async fn list(&self, message: &BotMessage) -> EngineResult<String> {
        let account = sender_account(&self.engine, message).await?;
        let (entitlement, numbers) = self.engine.available_numbers(&account.id).await?;

        let mut reply = String::new();
        if entitlement == Entitlement::AutoApproved {
            reply.push_str("You have been approved.\n\n");
        }

        if numbers.is_empty() {
            reply.push_str("No numbers are available right now. Please try again later.");
            return Ok(reply);
        }

        reply.push_str(&format!(
            "**Available numbers** ({} credit(s) each)\n\n",
            self.engine.config().credits_per_number
        ));
        for number in &numbers {
            reply.push_str(&format!("- {}\n", number));
        }
        reply.push_str("\nBuy one with !buy <number>.");
        Ok(reply)
    }
}

#[async_trait]
impl CommandHandler for NumbersHandler {
    fn name(&self) -> &str {
        "numbers"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!numbers")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.list(message).await)
    }
}

/// `!buy <number>` - lease a number.
pub struct BuyHandler {
    engine: OtpEngine,
}

impl BuyHandler {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }

    async fn buy(&self, message: &BotMessage) -> EngineResult<String> {
        let number = message.command().1;
        if number.is_empty() {
            return Ok("Usage: !buy <number>. See !numbers for the list.".into());
        }

        let account = sender_account(&self.engine, message).await?;
        let purchase = self.engine.buy(&account.id, number).await?;
        info!("{} bought {}", account.id, purchase.number);

        let mut reply = format!(
            "**{}** is now yours. Incoming messages will be forwarded here.\n\nCredits left: {}",
            purchase.number, purchase.credits_remaining
        );
        if let Some(old) = purchase.replaced {
            reply.push_str(&format!("\nYour previous number {} was released.", old));
        }
        Ok(reply)
    }
}

#[async_trait]
impl CommandHandler for BuyHandler {
    fn name(&self) -> &str {
        "buy"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!buy")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.buy(message).await)
    }
}

/// `!otp` - show the latest messages on the leased number.
pub struct OtpHandler {
    engine: OtpEngine,
}

impl OtpHandler {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }

    async fn refresh(&self, message: &BotMessage) -> EngineResult<String> {
        let account = sender_account(&self.engine, message).await?;
        let result = self.engine.ingestor().refresh_otps(&account.id).await?;
        Ok(format_refresh(&result))
    }
}

fn format_refresh(result: &RefreshResult) -> String {
    if result.messages.is_empty() {
        return format!("No messages on {} yet.", result.number);
    }

    let mut reply = format!("**Latest messages on {}**\n", result.number);
    for message in &result.messages {
        let when = message
            .sent_at
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "unknown time".into());
        reply.push_str(&format!("\n{} from {}:\n{}\n", when, message.from, message.body));
    }
    if result.new > 0 {
        reply.push_str(&format!("\n{} new.", result.new));
    }
    reply
}

#[async_trait]
impl CommandHandler for OtpHandler {
    fn name(&self) -> &str {
        "otp"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!otp")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.refresh(message).await)
    }
}
