//! `!admin` subcommands.

use crate::commands::{respond, sender_account, CommandHandler};
use crate::error::AppResult;
use crate::messenger::BotMessage;
use async_trait::async_trait;
use otp_core::{
    parse_credential_pair, Account, EngineError, EngineResult, EntitlementStatus, InputState,
    OtpEngine,
};
use tracing::info;

/// Activity entries shown by `!admin activity`.
const ACTIVITY_LIMIT: usize = 10;

/// Split `"<first> <rest>"`, trimming both parts.
fn split_arg(args: &str) -> (&str, &str) {
    match args.trim().split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (args.trim(), ""),
    }
}

fn parse_points(text: &str) -> EngineResult<u64> {
    text.trim()
        .parse()
        .map_err(|_| EngineError::InvalidAmount(format!("{} is not a number of points", text.trim())))
}

/// Parse `code,points` (a space works as the separator too).
fn parse_code_definition(text: &str) -> EngineResult<(String, u64)> {
    let text = text.trim();
    let (code, points) = text
        .split_once(',')
        .or_else(|| text.split_once(char::is_whitespace))
        .ok_or_else(|| EngineError::InvalidAmount("expected code,points".into()))?;
    Ok((code.trim().to_string(), parse_points(points)?))
}

fn format_account(account: &Account) -> String {
    format!(
        "{}\n  status: {}, points: {}, credits: {}, number: {}",
        account.display_name(),
        account.status,
        account.balance_points,
        account.balance_credits,
        account.leased_number().unwrap_or("none")
    )
}

/// Approve a pending account with the pair, or replace the credential of any other.
pub(crate) async fn apply_credential(
    engine: &OtpEngine,
    actor: &str,
    target: &str,
    pair: &str,
) -> EngineResult<String> {
    let (sid, token) = parse_credential_pair(pair)?;
    let account = engine.store().account(target).await?;

    let record = if account.status == EntitlementStatus::Pending {
        engine
            .approval()
            .approve(actor, target, Some((sid, token)))
            .await?
    } else {
        engine
            .approval()
            .set_credential(actor, target, &sid, &token)
            .await?
    };

    Ok(format!(
        "Credential {} ({}) assigned to {}.",
        record.account_sid,
        record.fingerprint(),
        target
    ))
}

/// Load `SID,token` lines into the pool.
pub(crate) async fn add_credentials(engine: &OtpEngine, actor: &str, lines: &str) -> EngineResult<String> {
    let report = engine.pool().load_credentials(actor, lines).await?;
    Ok(format!(
        "Credentials added: {}, skipped: {}.",
        report.succeeded, report.skipped
    ))
}

pub(crate) async fn set_points(
    engine: &OtpEngine,
    actor: &str,
    target: &str,
    points: &str,
) -> EngineResult<String> {
    let points = parse_points(points)?;
    engine.ledger().set_points(actor, target, points).await?;
    Ok(format!("Points of {} set to {}.", target, points))
}

pub(crate) async fn create_code(engine: &OtpEngine, actor: &str, definition: &str) -> EngineResult<String> {
    let (code, points) = parse_code_definition(definition)?;
    engine
        .ledger()
        .create_redeem_code(actor, &code, points)
        .await?;
    Ok(format!("Code `{}` created, worth {} point(s).", code, points))
}

pub(crate) async fn search(engine: &OtpEngine, query: &str) -> EngineResult<String> {
    let found = engine.store().search_accounts(query).await;
    if found.is_empty() {
        return Ok(format!("No account matches {}.", query.trim()));
    }

    let lines: Vec<String> = found.iter().map(format_account).collect();
    Ok(lines.join("\n"))
}

/// `!admin <subcommand> [args]`
pub struct AdminHandler {
    engine: OtpEngine,
}

impl AdminHandler {
    pub fn new(engine: OtpEngine) -> Self {
        Self { engine }
    }

    /// Ask the admin for follow-up input on their next plain message.
    async fn await_input(&self, message: &BotMessage, state: InputState, prompt: &str) -> EngineResult<String> {
        let admin = sender_account(&self.engine, message).await?;
        self.engine.store().set_input_state(&admin.id, state).await?;
        Ok(prompt.to_string())
    }

    async fn run(&self, message: &BotMessage) -> EngineResult<String> {
        let actor = message.source.as_str();
        if !self.engine.is_admin(actor) {
            return Err(EngineError::Unauthorized);
        }

        let (subcommand, args) = split_arg(message.command().1);
        let (target, rest) = split_arg(args);
        info!("Admin {} ran {}", actor, subcommand);

        match subcommand.to_lowercase().as_str() {
            "stats" => {
                let stats = self.engine.stats().await;
                Ok(format!(
                    "**Stats**\n\n\
                     Accounts: {} ({} pending, {} approved, {} rejected)\n\
                     Credentials: {} ({} free)\n\
                     Leased numbers: {}\n\
                     Messages delivered: {}\n\
                     Open redeem codes: {}",
                    stats.accounts,
                    stats.pending,
                    stats.approved,
                    stats.rejected,
                    stats.credentials_total,
                    stats.credentials_free,
                    stats.leased_numbers,
                    stats.processed_messages,
                    stats.redeem_codes_open,
                ))
            }
            "approve" if target.is_empty() => {
                let pending = self.engine.store().pending_accounts().await;
                if pending.is_empty() {
                    return Ok("No pending accounts.".into());
                }
                let lines: Vec<String> = pending.iter().map(|a| format!("- {}", a.display_name())).collect();
                Ok(format!("**Pending accounts**\n\n{}", lines.join("\n")))
            }
            "approve" if !rest.is_empty() => apply_credential(&self.engine, actor, target, rest).await,
            "approve" => {
                let record = self.engine.approval().approve(actor, target, None).await?;
                Ok(format!(
                    "{} approved with pooled credential {}.",
                    target, record.account_sid
                ))
            }
            "reject" if !target.is_empty() => {
                self.engine.approval().reject(actor, target).await?;
                Ok(format!("{} rejected.", target))
            }
            "approveall" => {
                let report = self.engine.approval().bulk_approve(actor).await?;
                Ok(format!(
                    "Approved {}, skipped {} (pool exhausted or no longer pending).",
                    report.succeeded, report.skipped
                ))
            }
            "rejectall" => {
                let report = self.engine.approval().bulk_reject(actor).await?;
                Ok(format!("Rejected {}, skipped {}.", report.succeeded, report.skipped))
            }
            "revoke" if !target.is_empty() => {
                self.engine.approval().revoke(actor, target).await?;
                Ok(format!("Access of {} revoked.", target))
            }
            "addcred" if args.is_empty() => {
                self.await_input(
                    message,
                    InputState::AwaitingCredential { target: None },
                    "Send the credentials as SID,token lines.",
                )
                .await
            }
            "addcred" => add_credentials(&self.engine, actor, args).await,
            "creds" => {
                let credentials = self.engine.pool().list().await;
                if credentials.is_empty() {
                    return Ok("The credential pool is empty.".into());
                }
                let lines: Vec<String> = credentials
                    .iter()
                    .map(|c| {
                        format!(
                            "#{} {} [{}] {}",
                            c.id,
                            c.account_sid,
                            c.fingerprint(),
                            c.used_by.as_deref().unwrap_or("free")
                        )
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            "setcred" if !target.is_empty() && rest.is_empty() => {
                self.engine.store().account(target).await?;
                self.await_input(
                    message,
                    InputState::AwaitingCredential {
                        target: Some(target.to_string()),
                    },
                    &format!("Send the SID,token for {}.", target),
                )
                .await
            }
            "setcred" if !target.is_empty() => apply_credential(&self.engine, actor, target, rest).await,
            "setpoints" if !target.is_empty() && rest.is_empty() => {
                self.engine.store().account(target).await?;
                self.await_input(
                    message,
                    InputState::AwaitingPoints {
                        target: target.to_string(),
                    },
                    &format!("Send the new point balance for {}.", target),
                )
                .await
            }
            "setpoints" if !target.is_empty() => set_points(&self.engine, actor, target, rest).await,
            "newcode" if args.is_empty() => {
                self.await_input(
                    message,
                    InputState::AwaitingRedeemCodeDefinition,
                    "Send the new code as code,points.",
                )
                .await
            }
            "newcode" => create_code(&self.engine, actor, args).await,
            "search" if args.is_empty() => {
                self.await_input(
                    message,
                    InputState::AwaitingSearchQuery,
                    "Send an account id or @username.",
                )
                .await
            }
            "search" => search(&self.engine, args).await,
            "activity" if !target.is_empty() => {
                let records = self.engine.store().activity(target, ACTIVITY_LIMIT).await;
                if records.is_empty() {
                    return Ok(format!("No activity for {}.", target));
                }
                let lines: Vec<String> = records
                    .iter()
                    .map(|r| format!("{} {}", r.timestamp.format("%Y-%m-%d %H:%M"), r.action))
                    .collect();
                Ok(lines.join("\n"))
            }
            "remove" if !target.is_empty() => {
                self.engine.approval().remove_account(actor, target).await?;
                Ok(format!("{} removed.", target))
            }
            _ => Ok("Unknown or incomplete admin command. See !help.".into()),
        }
    }
}

#[async_trait]
impl CommandHandler for AdminHandler {
    fn name(&self) -> &str {
        "admin"
    }

    fn trigger(&self) -> Option<&str> {
        Some("!admin")
    }

    async fn execute(&self, message: &BotMessage) -> AppResult<String> {
        respond(self.run(message).await)
    }
}
