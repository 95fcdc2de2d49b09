//! Help command - displays available commands.

use crate::commands::CommandHandler;
use crate::error::AppResult;
use crate::messenger::BotMessage;
use async_trait::async_trait;
use otp_core::OtpEngine;

const USER_HELP: &str = r#"**OTP Numbers**

Lease a virtual number and receive its SMS codes here.

**Getting started:**
- !start [code] - Register, optionally with a friend's referral code
- !balance - Show your points, credits and number
- !refer [code] - Show your referral code, or enter a friend's

**Earning:**
- !bonus - Claim your daily bonus
- !redeem <code> - Redeem a points code
- !convert - Trade points for a credit set

**Numbers:**
- !numbers - List numbers you can buy
- !buy <number> - Lease a number (replaces your current one)
- !otp - Show the latest messages on your number

New messages on your number are forwarded automatically."#;

const ADMIN_HELP: &str = r#"

**Admin:**
- !admin stats
- !admin approve [id] [sid,token] - Without an id, list pending accounts
- !admin reject <id>
- !admin approveall / rejectall
- !admin revoke <id>
- !admin addcred [sid,token lines]
- !admin creds
- !admin setcred <id> [sid,token]
- !admin setpoints <id> [points]
- !admin newcode [code,points]
- !admin search [query]
- !admin activity <id>
- !admin remove <id>"#;

pub struct HelpHandler {
    engine: OtpEngine,
}

impl HelpHandler {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl CommandHandler for HelpHandler {
    fn name(&self) -> &str {
        "help"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!help")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        if self.engine.is_admin(&message.source) {
            Ok(format!("{}{}", USER_HELP, ADMIN_HELP))
        } else {
            Ok(USER_HELP.into())
        }
    }
}
