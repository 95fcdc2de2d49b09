//! Points and credits ledger.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::retry::check_cooldown;
use crate::store::EntitlementStore;
use crate::types::{AccountId, RedeemCode};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Balances after a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balances {
    pub points: u64,
    pub credits: u64,
}

/// Points/credits ledger with atomic conversions and earn paths.
pub struct Ledger {
    store: EntitlementStore,
    config: Arc<EngineConfig>,
}

impl Ledger {
    pub fn new(store: EntitlementStore, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Add points. Returns the new balance.
    #[instrument(skip(self))]
    pub async fn credit(&self, account_id: &str, points: u64) -> EngineResult<u64> {
        self.store
            .write(|data| {
                let account = data.account_mut(account_id)?;
                account.balance_points = account.balance_points.saturating_add(points);
                let balance = account.balance_points;
                data.log(account_id, format!("Credited {} points", points));
                Ok(balance)
            })
            .await
    }

    /// Remove points if the balance covers them.
    ///
    /// Returns `false` without touching the balance when it does not.
    #[instrument(skip(self))]
    pub async fn debit(&self, account_id: &str, points: u64) -> EngineResult<bool> {
        self.store
            .write(|data| {
                let account = data.account_mut(account_id)?;
                if account.balance_points < points {
                    return Ok(false);
                }
                account.balance_points -= points;
                data.log(account_id, format!("Debited {} points", points));
                Ok(true)
            })
            .await
    }

    /// Trade points for credits in one step.
    #[instrument(skip(self))]
    pub async fn convert(
        &self,
        account_id: &str,
        points_cost: u64,
        credits_gained: u64,
    ) -> EngineResult<Balances> {
        let balances = self
            .store
            .write(|data| {
                let account = data.account_mut(account_id)?;
                if account.balance_points < points_cost {
                    return Err(EngineError::InsufficientFunds {
                        required: points_cost,
                        available: account.balance_points,
                    });
                }

                account.balance_points -= points_cost;
                account.balance_credits = account.balance_credits.saturating_add(credits_gained);
                let balances = Balances {
                    points: account.balance_points,
                    credits: account.balance_credits,
                };

                data.log(
                    account_id,
                    format!(
                        "Converted {} points to {} credits",
                        points_cost, credits_gained
                    ),
                );
                Ok(balances)
            })
            .await?;

        info!(
            "Account {} converted {} points to {} credits",
            account_id, points_cost, credits_gained
        );
        Ok(balances)
    }

    /// Buy one credit set at the configured price.
    pub async fn purchase_credit_set(&self, account_id: &str) -> EngineResult<Balances> {
        self.convert(
            account_id,
            self.config.points_per_credit_set,
            self.config.credits_per_set,
        )
        .await
    }

    /// Redeem a single-use code. Returns the points awarded.
    #[instrument(skip(self))]
    pub async fn redeem(&self, account_id: &str, code: &str) -> EngineResult<u64> {
        let code = code.trim();

        let awarded = self
            .store
            .write(|data| {
                data.account(account_id)?;

                let record = data
                    .redeem_codes
                    .get_mut(code)
                    .ok_or_else(|| EngineError::InvalidCode(code.to_string()))?;
                if record.redeemed_by.is_some() {
                    return Err(EngineError::AlreadyRedeemed(code.to_string()));
                }

                record.redeemed_by = Some(account_id.to_string());
                record.redeemed_at = Some(Utc::now());
                let points = record.value_points;

                let account = data.account_mut(account_id)?;
                account.balance_points = account.balance_points.saturating_add(points);
                data.log(
                    account_id,
                    format!("Redeemed code {} for {} points", code, points),
                );
                Ok(points)
            })
            .await?;

        info!("Account {} redeemed {} for {} points", account_id, code, awarded);
        Ok(awarded)
    }

    /// Claim the daily bonus. Returns the points awarded.
    #[instrument(skip(self))]
    pub async fn claim_daily_bonus(&self, account_id: &str) -> EngineResult<u64> {
        let points = self.config.daily_bonus_points;
        let interval = self.config.daily_bonus_interval;

        self.store
            .write(|data| {
                let now = Utc::now();
                let account = data.account_mut(account_id)?;
                check_cooldown(account.last_bonus_at, interval, now)?;

                account.balance_points = account.balance_points.saturating_add(points);
                account.last_bonus_at = Some(now);
                data.log(account_id, format!("Claimed daily bonus of {} points", points));
                Ok(points)
            })
            .await
    }

    /// Name the referrer of `account_id` by referral code and reward them.
    ///
    /// Returns the referrer's id.
    #[instrument(skip(self))]
    pub async fn apply_referral(&self, account_id: &str, code: &str) -> EngineResult<AccountId> {
        let bonus = self.config.referral_bonus_points;
        let code = code.trim();

        let referrer_id = self
            .store
            .write(|data| {
                let referrer_id = data
                    .account_by_referral_code(code)
                    .map(|a| a.id.clone())
                    .ok_or_else(|| EngineError::InvalidReferralCode(code.to_string()))?;

                let account = data.account_mut(account_id)?;
                if referrer_id == account_id {
                    return Err(EngineError::SelfReferral);
                }
                if account.referrer_id.is_some() {
                    return Err(EngineError::AlreadyReferred);
                }
                account.referrer_id = Some(referrer_id.clone());

                let referrer = data.account_mut(&referrer_id)?;
                referrer.balance_points = referrer.balance_points.saturating_add(bonus);

                data.log(account_id, format!("Referred by {}", referrer_id));
                data.log(
                    &referrer_id,
                    format!("Referral bonus of {} points for {}", bonus, account_id),
                );
                Ok(referrer_id)
            })
            .await?;

        info!("Account {} referred by {}", account_id, referrer_id);
        Ok(referrer_id)
    }

    /// Overwrite an account's points (admin).
    #[instrument(skip(self))]
    pub async fn set_points(&self, actor: &str, account_id: &str, points: u64) -> EngineResult<()> {
        self.require_admin(actor)?;

        self.store
            .write(|data| {
                data.account_mut(account_id)?.balance_points = points;
                data.log(account_id, format!("Points set to {} by {}", points, actor));
                Ok(())
            })
            .await?;

        info!("Admin {} set points of {} to {}", actor, account_id, points);
        Ok(())
    }

    /// Define a new redeem code (admin).
    #[instrument(skip(self))]
    pub async fn create_redeem_code(
        &self,
        actor: &str,
        code: &str,
        points: u64,
    ) -> EngineResult<()> {
        self.require_admin(actor)?;

        let code = code.trim();
        if code.is_empty() || code.contains(char::is_whitespace) {
            return Err(EngineError::InvalidCode(code.to_string()));
        }
        if points == 0 {
            return Err(EngineError::InvalidAmount(
                "code must be worth at least one point".into(),
            ));
        }

        self.store
            .write(|data| {
                if data.redeem_codes.contains_key(code) {
                    return Err(EngineError::DuplicateCode(code.to_string()));
                }
                data.redeem_codes.insert(
                    code.to_string(),
                    RedeemCode {
                        code: code.to_string(),
                        value_points: points,
                        redeemed_by: None,
                        created_at: Utc::now(),
                        redeemed_at: None,
                    },
                );
                data.log(actor, format!("Created code {} worth {} points", code, points));
                Ok(())
            })
            .await?;

        info!("Admin {} created code {} worth {} points", actor, code, points);
        Ok(())
    }

    fn require_admin(&self, actor: &str) -> EngineResult<()> {
        if self.config.is_admin(actor) {
            Ok(())
        } else {
            warn!("Non-admin {} attempted an admin action", actor);
            Err(EngineError::Unauthorized)
        }
    }
}
