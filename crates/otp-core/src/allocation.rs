//! Number purchase transaction.
//!
//! A purchase runs in three steps:
//!
//! 1. `begin` checks the preconditions, sets the account's
//!    `allocation_in_progress` flag and reserves the number in one store
//!    write.
//! 2. Provider calls run with no store lock held: validate the requested
//!    number, release the old one, provision the new one.
//! 3. `finish` applies the outcome in one store write. On success the debit
//!    and the lease are committed together. If that write cannot be saved
//!    the new number is released again at the provider.
//!
//! The flag and the reservation are cleared on every path out of `finish`.
//!
//! If the old number was released but provisioning then failed, the old
//! number is forfeited and nothing is charged.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::retry::{check_cooldown, RetryPolicy};
use crate::store::{EntitlementStore, StoreData};
use crate::types::{EntitlementStatus, LeasedNumber};
use chrono::Utc;
use std::sync::Arc;
use telephony_client::{NumberHandle, ProviderCredentials, TelephonyProvider};
use tracing::{error, info, instrument, warn};

/// Result of a successful purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purchase {
    pub number: String,
    pub credits_remaining: u64,
    /// Number given up to make room for this one.
    pub replaced: Option<String>,
}

/// Bring a user-typed number into E.164 form.
pub fn normalize_number(input: &str) -> EngineResult<String> {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);

    if !(8..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(EngineError::InvalidNumber(input.trim().to_string()));
    }
    Ok(format!("+{}", digits))
}

struct Reservation {
    creds: ProviderCredentials,
    previous: Option<LeasedNumber>,
}

/// Outcome of the provider phase.
struct ProviderOutcome {
    released_previous: bool,
    result: EngineResult<NumberHandle>,
}

/// Runs number purchases against the store and the provider.
pub struct Allocator {
    store: EntitlementStore,
    provider: Arc<dyn TelephonyProvider>,
    retry: RetryPolicy,
    config: Arc<EngineConfig>,
}

impl Allocator {
    pub fn new(
        store: EntitlementStore,
        provider: Arc<dyn TelephonyProvider>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            provider,
            retry: RetryPolicy::new(&config.retry),
            config,
        }
    }

    /// Numbers the account could buy, from its own provider sub-account.
    #[instrument(skip(self))]
    pub async fn available_numbers(&self, account_id: &str) -> EngineResult<Vec<String>> {
        let creds = self
            .store
            .read(|data| {
                data.account(account_id)?;
                data.credential_for(account_id)
                    .map(|c| c.provider_credentials())
                    .ok_or(EngineError::NotEntitled)
            })
            .await?;

        let region = &self.config.number_region;
        let limit = self.config.available_numbers_limit;
        self.retry
            .call("list_available_numbers", || {
                self.provider.list_available_numbers(&creds, region, limit)
            })
            .await
    }

    /// Buy `number` for the account, replacing any number it holds.
    #[instrument(skip(self))]
    pub async fn purchase(&self, account_id: &str, number: &str) -> EngineResult<Purchase> {
        let number = normalize_number(number)?;

        let reservation = self
            .store
            .write(|data| self.begin(data, account_id, &number))
            .await?;

        let outcome = self.run_provider_steps(&reservation, &number).await;
        self.finish(account_id, &number, reservation, outcome).await
    }

    /// Check preconditions, take the per-account lock and reserve the number.
    fn begin(&self, data: &mut StoreData, account_id: &str, number: &str) -> EngineResult<Reservation> {
        let cost = self.config.credits_per_number;
        let now = Utc::now();

        let account = data.account(account_id)?;
        if account.status != EntitlementStatus::Approved {
            return Err(EngineError::NotEntitled);
        }
        let creds = data
            .credential_for(account_id)
            .map(|c| c.provider_credentials())
            .ok_or(EngineError::NotEntitled)?;

        if account.balance_credits < cost {
            return Err(EngineError::InsufficientCredits {
                required: cost,
                available: account.balance_credits,
            });
        }
        if account.allocation_in_progress {
            return Err(EngineError::AllocationInProgress);
        }
        if account.leased_number() == Some(number) {
            return Err(EngineError::DuplicateNumber(number.to_string()));
        }
        if self.config.track_purchase_history
            && data
                .purchase_history
                .contains(&(account_id.to_string(), number.to_string()))
        {
            return Err(EngineError::DuplicateNumber(number.to_string()));
        }
        if data.number_claimed_by_other(number, account_id) {
            return Err(EngineError::NumberTaken(number.to_string()));
        }
        check_cooldown(account.last_allocation_at, self.config.allocation_cooldown, now)?;

        let previous = account.leased.clone();
        data.account_mut(account_id)?.allocation_in_progress = true;
        data.reservations
            .insert(number.to_string(), account_id.to_string());

        Ok(Reservation { creds, previous })
    }

    async fn run_provider_steps(&self, reservation: &Reservation, number: &str) -> ProviderOutcome {
        let creds = &reservation.creds;

        let valid = self
            .retry
            .call("validate_number", || self.provider.validate_number(creds, number))
            .await;
        match valid {
            Ok(true) => {}
            Ok(false) => {
                return ProviderOutcome {
                    released_previous: false,
                    result: Err(EngineError::InvalidNumber(number.to_string())),
                }
            }
            Err(e) => {
                return ProviderOutcome {
                    released_previous: false,
                    result: Err(e),
                }
            }
        }

        let mut released_previous = false;
        if let Some(previous) = &reservation.previous {
            let released = self
                .retry
                .run("release_number", || {
                    self.provider.release_number(creds, &previous.handle)
                })
                .await;
            if let Err(e) = released {
                warn!("Could not release {}: {}", previous.number(), e);
                return ProviderOutcome {
                    released_previous: false,
                    result: Err(EngineError::ReleaseFailed(e.to_string())),
                };
            }
            released_previous = true;
        }

        let callback = self.config.inbound_callback_url.as_deref();
        let result = self
            .retry
            .call("provision_number", || {
                self.provider.provision_number(creds, number, callback)
            })
            .await;

        ProviderOutcome {
            released_previous,
            result,
        }
    }

    /// Apply the provider outcome and clear the lock.
    async fn finish(
        &self,
        account_id: &str,
        number: &str,
        reservation: Reservation,
        outcome: ProviderOutcome,
    ) -> EngineResult<Purchase> {
        let cost = self.config.credits_per_number;
        let released = outcome.released_previous;
        let replaced = reservation.previous.as_ref().map(|p| p.number().to_string());

        let handle = match outcome.result {
            Ok(handle) => handle,
            Err(e) => {
                self.abandon(account_id, number, released).await;
                warn!("Purchase of {} by {} failed: {}", number, account_id, e);
                return Err(e);
            }
        };

        let committed = self
            .store
            .write(|data| {
                let now = Utc::now();
                if released {
                    data.clear_lease(account_id);
                }
                data.set_lease(
                    account_id,
                    LeasedNumber {
                        handle: handle.clone(),
                        leased_at: now,
                    },
                )?;

                let account = data.account_mut(account_id)?;
                // Only purchases spend credits, and they are serialized by the flag
                account.balance_credits = account.balance_credits.saturating_sub(cost);
                account.numbers_purchased += 1;
                account.last_allocation_at = Some(now);
                account.last_check = Some(now);
                let credits_remaining = account.balance_credits;

                data.end_allocation(account_id);
                data.purchase_history
                    .insert((account_id.to_string(), number.to_string()));
                data.log(
                    account_id,
                    format!("Purchased {} for {} credit(s)", number, cost),
                );

                Ok(Purchase {
                    number: number.to_string(),
                    credits_remaining,
                    replaced: replaced.clone(),
                })
            })
            .await;

        match committed {
            Ok(purchase) => {
                info!("Account {} leased {}", account_id, number);
                Ok(purchase)
            }
            Err(e) => {
                error!(
                    "Could not record purchase of {} by {}, releasing it: {}",
                    number, account_id, e
                );
                let undone = self
                    .retry
                    .run("release_number", || {
                        self.provider.release_number(&reservation.creds, &handle)
                    })
                    .await;
                if let Err(release_err) = undone {
                    error!("{} stays provisioned at the provider: {}", number, release_err);
                }
                self.abandon(account_id, number, released).await;
                Err(e)
            }
        }
    }

    /// Record a failed purchase and clear the lock.
    ///
    /// A number released on the way is dropped from the account.
    async fn abandon(&self, account_id: &str, number: &str, released_previous: bool) {
        let recorded = self
            .store
            .write(|data| {
                if released_previous {
                    if let Some(lost) = data.clear_lease(account_id) {
                        data.log(
                            account_id,
                            format!(
                                "Released {} but could not provision {}",
                                lost.number(),
                                number
                            ),
                        );
                    }
                }
                data.end_allocation(account_id);
                Ok(())
            })
            .await;

        if let Err(e) = recorded {
            error!("Failed to record aborted purchase for {}: {}", account_id, e);
            self.store.end_allocation(account_id).await;
        }
    }

    /// Release the account's number at the provider and drop the lease.
    ///
    /// Returns the released number, or `None` if the account held none.
    #[instrument(skip(self))]
    pub async fn release_current(&self, account_id: &str) -> EngineResult<Option<String>> {
        let held = self
            .store
            .read(|data| {
                let account = data.account(account_id)?;
                Ok::<_, EngineError>(account.leased.clone().zip(
                    data.credential_for(account_id).map(|c| c.provider_credentials()),
                ))
            })
            .await?;

        let Some((lease, creds)) = held else {
            return Ok(None);
        };

        self.retry
            .run("release_number", || {
                self.provider.release_number(&creds, &lease.handle)
            })
            .await
            .map_err(|e| EngineError::ReleaseFailed(e.to_string()))?;

        self.store
            .write(|data| {
                data.clear_lease(account_id);
                data.log(account_id, format!("Released {}", lease.number()));
                Ok(())
            })
            .await?;

        info!("Account {} released {}", account_id, lease.number());
        Ok(Some(lease.number().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{approved_account, test_config, FakeProvider, FlakyDisk};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use telephony_client::ProviderError;
    use tempfile::TempDir;

    const N1: &str = "+14165550100";
    const N2: &str = "+14165550101";

    fn setup() -> (Arc<Allocator>, EntitlementStore, Arc<FakeProvider>) {
        setup_with(EntitlementStore::in_memory())
    }

    fn setup_with(store: EntitlementStore) -> (Arc<Allocator>, EntitlementStore, Arc<FakeProvider>) {
        let provider = Arc::new(FakeProvider::new());
        let allocator = Arc::new(Allocator::new(
            store.clone(),
            provider.clone(),
            Arc::new(test_config()),
        ));
        (allocator, store, provider)
    }

    async fn expire_cooldown(store: &EntitlementStore, id: &str) {
        store
            .write(|data| {
                data.account_mut(id)?.last_allocation_at =
                    Some(Utc::now() - chrono::Duration::minutes(6));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number(" +1 (416) 555-0100 ").unwrap(), N1);
        assert_eq!(normalize_number("14165550100").unwrap(), N1);
        assert!(normalize_number("+1416abc0100").is_err());
        assert!(normalize_number("+123").is_err());
    }

    #[tokio::test]
    async fn test_purchase_example_flow() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 5, 3).await;

        let purchase = allocator.purchase("a", N1).await.unwrap();
        assert_eq!(purchase.number, N1);
        assert_eq!(purchase.credits_remaining, 2);
        assert_eq!(provider.provisioned(), vec![N1]);

        let account = store.account("a").await.unwrap();
        assert_eq!(account.balance_points, 5);
        assert_eq!(account.balance_credits, 2);
        assert_eq!(account.leased_number(), Some(N1));
        assert_eq!(account.numbers_purchased, 1);
        assert!(!account.allocation_in_progress);

        let err = allocator.purchase("a", N2).await.unwrap_err();
        match err {
            EngineError::CooldownActive { remaining } => {
                assert!(remaining <= Duration::from_secs(300));
                assert!(remaining > Duration::from_secs(290));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_preconditions_in_order() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 0).await;

        assert!(matches!(
            allocator.purchase("a", N1).await,
            Err(EngineError::InsufficientCredits { required: 1, available: 0 })
        ));

        store
            .write(|data| {
                let account = data.account_mut("a")?;
                account.balance_credits = 2;
                account.allocation_in_progress = true;
                Ok(())
            })
            .await
            .unwrap();
        assert!(matches!(
            allocator.purchase("a", N1).await,
            Err(EngineError::AllocationInProgress)
        ));
        assert_eq!(provider.provision_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unapproved_account_cannot_buy() {
        let (allocator, store, _) = setup();
        store.get_or_create_account("u1", None).await.unwrap();

        assert!(matches!(
            allocator.purchase("u1", N1).await,
            Err(EngineError::NotEntitled)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_history() {
        let (allocator, store, _) = setup();
        approved_account(&store, "a", 0, 5).await;

        allocator.purchase("a", N1).await.unwrap();
        expire_cooldown(&store, "a").await;
        assert!(matches!(
            allocator.purchase("a", N1).await,
            Err(EngineError::DuplicateNumber(_))
        ));

        let purchase = allocator.purchase("a", N2).await.unwrap();
        assert_eq!(purchase.replaced.as_deref(), Some(N1));
        expire_cooldown(&store, "a").await;

        // N1 is in the purchase history even though it is no longer leased
        assert!(matches!(
            allocator.purchase("a", N1).await,
            Err(EngineError::DuplicateNumber(_))
        ));
    }

    #[tokio::test]
    async fn test_number_held_by_other_account() {
        let (allocator, store, _) = setup();
        approved_account(&store, "a", 0, 1).await;
        approved_account(&store, "b", 0, 1).await;

        allocator.purchase("a", N1).await.unwrap();
        assert!(matches!(
            allocator.purchase("b", N1).await,
            Err(EngineError::NumberTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_replacing_releases_old_number() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 2).await;

        allocator.purchase("a", N1).await.unwrap();
        expire_cooldown(&store, "a").await;
        allocator.purchase("a", N2).await.unwrap();

        assert_eq!(provider.released(), vec![N1]);
        store
            .read(|data| {
                assert!(data.account_for_number(N1).is_none());
                assert_eq!(data.account_for_number(N2).unwrap().id, "a");
            })
            .await;
    }

    #[tokio::test]
    async fn test_release_failure_keeps_old_number_and_credits() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 2).await;
        allocator.purchase("a", N1).await.unwrap();
        expire_cooldown(&store, "a").await;

        provider.fail_release(ProviderError::Unauthorized);
        let err = allocator.purchase("a", N2).await.unwrap_err();
        assert!(matches!(err, EngineError::ReleaseFailed(_)));

        let account = store.account("a").await.unwrap();
        assert_eq!(account.leased_number(), Some(N1));
        assert_eq!(account.balance_credits, 1);
        assert!(!account.allocation_in_progress);
    }

    #[tokio::test]
    async fn test_invalid_number_charges_nothing() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 2).await;
        allocator.purchase("a", N1).await.unwrap();
        expire_cooldown(&store, "a").await;

        provider.mark_invalid(N2);
        assert!(matches!(
            allocator.purchase("a", N2).await,
            Err(EngineError::InvalidNumber(_))
        ));

        let account = store.account("a").await.unwrap();
        assert_eq!(account.leased_number(), Some(N1));
        assert_eq!(account.balance_credits, 1);
        assert!(!account.allocation_in_progress);
        assert!(provider.released().is_empty());
    }

    #[tokio::test]
    async fn test_provision_failure_after_release_forfeits_old_number() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 2).await;
        allocator.purchase("a", N1).await.unwrap();
        expire_cooldown(&store, "a").await;

        provider.fail_provision(ProviderError::FundsExhausted("zero balance".into()));
        let err = allocator.purchase("a", N2).await.unwrap_err();
        assert!(matches!(err, EngineError::ProviderFundsExhausted(_)));

        let account = store.account("a").await.unwrap();
        assert_eq!(account.leased_number(), None);
        assert_eq!(account.balance_credits, 1);
        assert_eq!(account.numbers_purchased, 1);
        assert!(!account.allocation_in_progress);
    }

    #[tokio::test]
    async fn test_rate_limit_retried_then_surfaced() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 1).await;

        provider.fail_provision(ProviderError::RateLimited);
        allocator.purchase("a", N1).await.unwrap();
        assert_eq!(provider.provision_calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        approved_account(&store, "b", 0, 1).await;
        for _ in 0..3 {
            provider.fail_provision(ProviderError::RateLimited);
        }
        assert!(matches!(
            allocator.purchase("b", N2).await,
            Err(EngineError::ProviderRateLimited)
        ));
        let b = store.account("b").await.unwrap();
        assert_eq!((b.balance_credits, b.leased_number()), (1, None));
    }

    #[tokio::test]
    async fn test_concurrent_purchases_same_account_serialized() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 5).await;
        *provider.provision_delay.lock().unwrap() = Some(Duration::from_millis(50));

        let first = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.purchase("a", N1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = allocator.purchase("a", N2).await;

        assert!(matches!(second, Err(EngineError::AllocationInProgress)));
        assert!(first.await.unwrap().is_ok());

        let account = store.account("a").await.unwrap();
        assert_eq!(account.balance_credits, 4);
        assert!(!account.allocation_in_progress);
    }

    #[tokio::test]
    async fn test_different_accounts_in_parallel() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 1).await;
        approved_account(&store, "b", 0, 1).await;
        *provider.provision_delay.lock().unwrap() = Some(Duration::from_millis(20));

        let (ra, rb) = tokio::join!(allocator.purchase("a", N1), allocator.purchase("b", N2));
        assert!(ra.is_ok());
        assert!(rb.is_ok());
        assert_eq!(store.stats().await.leased_numbers, 2);
    }

    #[tokio::test]
    async fn test_same_number_bought_concurrently_once() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 1).await;
        approved_account(&store, "b", 0, 1).await;
        *provider.provision_delay.lock().unwrap() = Some(Duration::from_millis(30));

        let (ra, rb) = tokio::join!(allocator.purchase("a", N1), allocator.purchase("b", N1));

        let results = [&ra, &rb];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EngineError::NumberTaken(_)))));
        assert_eq!(provider.provision_calls.load(Ordering::SeqCst), 1);

        let winner = if ra.is_ok() { "a" } else { "b" };
        let loser = if ra.is_ok() { "b" } else { "a" };
        assert_eq!(store.account(loser).await.unwrap().balance_credits, 1);
        store
            .read(|data| {
                assert_eq!(data.leases.len(), 1);
                assert_eq!(data.account_for_number(N1).unwrap().id, winner);
                assert!(data.reservations.is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_failed_purchase_frees_number_for_others() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 1).await;
        approved_account(&store, "b", 0, 1).await;

        provider.fail_provision(ProviderError::Unauthorized);
        assert!(allocator.purchase("a", N1).await.is_err());

        allocator.purchase("b", N1).await.unwrap();
        assert_eq!(store.account("b").await.unwrap().leased_number(), Some(N1));
    }

    #[tokio::test]
    async fn test_purchase_refused_while_storage_down() {
        let dir = TempDir::new().unwrap();
        let disk = FlakyDisk::new(dir.path());
        let (allocator, store, provider) = setup_with(disk.open().await);
        approved_account(&store, "a", 0, 1).await;

        disk.break_writes();
        assert!(matches!(
            allocator.purchase("a", N1).await,
            Err(EngineError::Storage(_))
        ));
        assert_eq!(provider.provision_calls.load(Ordering::SeqCst), 0);
        assert!(!store.account("a").await.unwrap().allocation_in_progress);

        disk.repair();
        allocator.purchase("a", N1).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsaved_purchase_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let disk = FlakyDisk::new(dir.path());
        let (allocator, store, provider) = setup_with(disk.open().await);
        approved_account(&store, "a", 0, 2).await;
        *provider.provision_delay.lock().unwrap() = Some(Duration::from_millis(50));

        let pending = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.purchase("a", N1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        disk.break_writes();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        assert_eq!(provider.provisioned(), vec![N1]);
        assert_eq!(provider.released(), vec![N1]);

        let account = store.account("a").await.unwrap();
        assert!(!account.allocation_in_progress);
        assert_eq!(account.leased_number(), None);
        assert_eq!(account.balance_credits, 2);
        assert_eq!(account.numbers_purchased, 0);

        disk.repair();
        *provider.provision_delay.lock().unwrap() = None;
        let purchase = allocator.purchase("a", N1).await.unwrap();
        assert_eq!(purchase.credits_remaining, 1);
    }

    #[tokio::test]
    async fn test_release_current() {
        let (allocator, store, provider) = setup();
        approved_account(&store, "a", 0, 1).await;

        assert_eq!(allocator.release_current("a").await.unwrap(), None);
        allocator.purchase("a", N1).await.unwrap();
        assert_eq!(
            allocator.release_current("a").await.unwrap().as_deref(),
            Some(N1)
        );
        assert_eq!(provider.released(), vec![N1]);
        assert_eq!(store.account("a").await.unwrap().leased_number(), None);
    }

    #[tokio::test]
    async fn test_available_numbers_requires_credential() {
        let (allocator, store, provider) = setup();
        store.get_or_create_account("u1", None).await.unwrap();
        approved_account(&store, "a", 0, 0).await;
        *provider.available.lock().unwrap() = vec![N1.to_string(), N2.to_string()];

        assert!(matches!(
            allocator.available_numbers("u1").await,
            Err(EngineError::NotEntitled)
        ));
        assert_eq!(allocator.available_numbers("a").await.unwrap().len(), 2);
    }
}
