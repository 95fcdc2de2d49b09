//! Engine facade wiring the components to one store, provider and notifier.

use crate::allocation::{Allocator, Purchase};
use crate::approval::{ApprovalWorkflow, Entitlement};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::ingest::{spawn_poller, MessageIngestor};
use crate::ledger::Ledger;
use crate::notify::Notifier;
use crate::pool::CredentialPool;
use crate::store::EntitlementStore;
use crate::types::{Account, EngineStats};
use std::sync::Arc;
use telephony_client::TelephonyProvider;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Result of a first contact.
#[derive(Debug, Clone)]
pub struct Registration {
    pub account: Account,
    pub created: bool,
    /// Referrer credited by the code given on first contact.
    pub referrer: Option<String>,
}

/// All engine components sharing one store.
#[derive(Clone)]
pub struct OtpEngine {
    store: EntitlementStore,
    config: Arc<EngineConfig>,
    ledger: Arc<Ledger>,
    pool: Arc<CredentialPool>,
    allocator: Arc<Allocator>,
    approval: Arc<ApprovalWorkflow>,
    ingestor: Arc<MessageIngestor>,
}

impl OtpEngine {
    pub fn new(
        config: EngineConfig,
        store: EntitlementStore,
        provider: Arc<dyn TelephonyProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let config = Arc::new(config);
        let ledger = Arc::new(Ledger::new(store.clone(), config.clone()));
        let pool = Arc::new(CredentialPool::new(
            store.clone(),
            provider.clone(),
            config.clone(),
        ));
        let allocator = Arc::new(Allocator::new(
            store.clone(),
            provider.clone(),
            config.clone(),
        ));
        let approval = Arc::new(ApprovalWorkflow::new(
            store.clone(),
            pool.clone(),
            allocator.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let ingestor = Arc::new(MessageIngestor::new(
            store.clone(),
            provider,
            notifier,
            config.clone(),
        ));

        Self {
            store,
            config,
            ledger,
            pool,
            allocator,
            approval,
            ingestor,
        }
    }

    /// Open the configured store and build the engine on it.
    pub async fn open(
        config: EngineConfig,
        provider: Arc<dyn TelephonyProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> EngineResult<Self> {
        let store = EntitlementStore::open(&config.storage).await?;
        let stats = store.stats().await;
        info!(
            "Engine store opened: {} account(s), {} credential(s), {} leased number(s)",
            stats.accounts, stats.credentials_total, stats.leased_numbers
        );
        Ok(Self::new(config, store, provider, notifier))
    }

    pub fn store(&self) -> &EntitlementStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn approval(&self) -> &ApprovalWorkflow {
        &self.approval
    }

    pub fn ingestor(&self) -> Arc<MessageIngestor> {
        self.ingestor.clone()
    }

    pub fn is_admin(&self, account_id: &str) -> bool {
        self.config.is_admin(account_id)
    }

    /// First contact: create the account and apply a referral code if one was given.
    ///
    /// A bad referral code does not undo the registration; it is logged and
    /// reported back through `referrer: None`.
    pub async fn register(
        &self,
        account_id: &str,
        username: Option<&str>,
        referral_code: Option<&str>,
    ) -> EngineResult<Registration> {
        let (account, created) = self.store.get_or_create_account(account_id, username).await?;

        let mut referrer = None;
        if let Some(code) = referral_code.filter(|c| !c.trim().is_empty()) {
            match self.ledger.apply_referral(account_id, code).await {
                Ok(id) => referrer = Some(id),
                Err(e) => warn!("Referral code {} from {} not applied: {}", code, account_id, e),
            }
        }

        let account = if referrer.is_some() {
            self.store.account(account_id).await?
        } else {
            account
        };

        Ok(Registration {
            account,
            created,
            referrer,
        })
    }

    /// List purchasable numbers, assigning a credential or escalating first.
    pub async fn available_numbers(&self, account_id: &str) -> EngineResult<(Entitlement, Vec<String>)> {
        let entitlement = self.approval.ensure_entitled(account_id).await?;
        let numbers = self.allocator.available_numbers(account_id).await?;
        Ok((entitlement, numbers))
    }

    /// Buy a number, going through the entitlement check for unprovisioned accounts.
    pub async fn buy(&self, account_id: &str, number: &str) -> EngineResult<Purchase> {
        self.approval.ensure_entitled(account_id).await?;
        self.allocator.purchase(account_id, number).await
    }

    pub async fn stats(&self) -> EngineStats {
        self.store.stats().await
    }

    /// Start the background message poll.
    pub fn spawn_poller(&self) -> JoinHandle<()> {
        spawn_poller(self.ingestor.clone())
    }
}

impl std::fmt::Debug for OtpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpEngine")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::notify::NoopNotifier;
    use crate::testing::{seed_credential, test_config, FakeProvider, RecordingNotifier};
    use crate::types::EntitlementStatus;

    fn engine(provider: Arc<FakeProvider>, notifier: Arc<dyn Notifier>) -> OtpEngine {
        OtpEngine::new(test_config(), EntitlementStore::in_memory(), provider, notifier)
    }

    #[tokio::test]
    async fn test_register_with_referral() {
        let engine = engine(Arc::new(FakeProvider::new()), Arc::new(NoopNotifier));

        let alice = engine.register("alice", None, None).await.unwrap();
        assert!(alice.created);

        let bob = engine
            .register("bob", Some("bob"), Some(&alice.account.referral_code))
            .await
            .unwrap();
        assert_eq!(bob.referrer.as_deref(), Some("alice"));
        assert_eq!(bob.account.referrer_id.as_deref(), Some("alice"));
        assert_eq!(
            engine.store().account("alice").await.unwrap().balance_points,
            1
        );

        // Unknown code still registers
        let carol = engine.register("carol", None, Some("NOPE1234")).await.unwrap();
        assert!(carol.created);
        assert!(carol.referrer.is_none());
    }

    #[tokio::test]
    async fn test_end_to_end_purchase() {
        let provider = Arc::new(FakeProvider::new());
        *provider.available.lock().unwrap() = vec!["+14165550100".to_string()];
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine(provider.clone(), notifier.clone());

        engine.register("a", None, None).await.unwrap();
        seed_credential(engine.store(), "AC1").await;
        engine.ledger().credit("a", 20).await.unwrap();
        engine.ledger().purchase_credit_set("a").await.unwrap();

        let (entitlement, numbers) = engine.available_numbers("a").await.unwrap();
        assert_eq!(entitlement, Entitlement::AutoApproved);
        assert_eq!(numbers, vec!["+14165550100"]);

        let purchase = tokio_test::assert_ok!(engine.buy("a", "+14165550100").await);
        assert_eq!(purchase.credits_remaining, 2);

        let account = engine.store().account("a").await.unwrap();
        assert_eq!(account.status, EntitlementStatus::Approved);
        assert_eq!(account.balance_points, 5);
    }

    #[tokio::test]
    async fn test_buy_without_pool_escalates() {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = engine(Arc::new(FakeProvider::new()), notifier.clone());
        engine.register("a", None, None).await.unwrap();

        assert!(matches!(
            engine.buy("a", "+14165550100").await,
            Err(EngineError::NoCredentialAvailable)
        ));
        assert_eq!(notifier.prompt_count(), 1);
    }
}
