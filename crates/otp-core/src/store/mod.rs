//! Shared entitlement store.
//!
//! All engine state lives in one [`StoreData`] behind a `RwLock`. Every
//! conditional update (credential claim, code redemption, the allocation
//! lock flag, processed-message insert-or-ignore) runs inside a single
//! write-guard closure, so check and mutation happen atomically.
//!
//! A persistent store applies each update to a staged copy and swaps it in
//! only after the snapshot is saved. A closure error or a failed save leaves
//! the live data untouched.

mod snapshot;

pub use snapshot::{derive_key, EncryptedFile, Snapshot};

use crate::config::StorageConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::*;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Data version for schema migrations.
const DATA_VERSION: u32 = 1;

/// Persistent data structure for the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreData {
    /// Schema version for migrations.
    pub version: u32,
    pub accounts: HashMap<AccountId, Account>,
    pub credentials: BTreeMap<CredentialId, CredentialRecord>,
    pub next_credential_id: CredentialId,
    pub redeem_codes: HashMap<String, RedeemCode>,
    /// Append-only audit log.
    pub activity: Vec<ActivityRecord>,
    /// Keyed by provider message id.
    pub processed_messages: HashMap<String, ProcessedMessage>,
    /// Every (account, number) pair ever leased.
    pub purchase_history: HashSet<(AccountId, String)>,
    /// Leased number to owning account.
    pub leases: HashMap<String, AccountId>,
    /// Numbers with a purchase in flight, to the buying account.
    #[serde(skip)]
    pub reservations: HashMap<String, AccountId>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            version: DATA_VERSION,
            accounts: HashMap::new(),
            credentials: BTreeMap::new(),
            next_credential_id: 1,
            redeem_codes: HashMap::new(),
            activity: Vec::new(),
            processed_messages: HashMap::new(),
            purchase_history: HashSet::new(),
            leases: HashMap::new(),
            reservations: HashMap::new(),
        }
    }
}

impl StoreData {
    pub fn account(&self, id: &str) -> EngineResult<&Account> {
        self.accounts
            .get(id)
            .ok_or_else(|| EngineError::AccountNotFound(id.to_string()))
    }

    pub fn account_mut(&mut self, id: &str) -> EngineResult<&mut Account> {
        self.accounts
            .get_mut(id)
            .ok_or_else(|| EngineError::AccountNotFound(id.to_string()))
    }

    pub fn account_for_number(&self, number: &str) -> Option<&Account> {
        self.leases.get(number).and_then(|id| self.accounts.get(id))
    }

    /// True if the number is leased or being bought by another account.
    pub fn number_claimed_by_other(&self, number: &str, account_id: &str) -> bool {
        let owned_elsewhere = |owner: &AccountId| owner != account_id;
        self.leases.get(number).is_some_and(owned_elsewhere)
            || self.reservations.get(number).is_some_and(owned_elsewhere)
    }

    /// Drop the account's purchase lock and any number it reserved.
    pub fn end_allocation(&mut self, account_id: &str) {
        if let Some(account) = self.accounts.get_mut(account_id) {
            account.allocation_in_progress = false;
        }
        self.reservations.retain(|_, owner| *owner != account_id);
    }

    pub fn account_by_referral_code(&self, code: &str) -> Option<&Account> {
        self.accounts
            .values()
            .find(|a| a.referral_code.eq_ignore_ascii_case(code))
    }

    /// Credential currently assigned to an account.
    pub fn credential_for(&self, account_id: &str) -> Option<&CredentialRecord> {
        let id = self.accounts.get(account_id)?.credential_id?;
        self.credentials.get(&id)
    }

    pub fn credential_by_sid(&self, sid: &str) -> Option<&CredentialRecord> {
        self.credentials.values().find(|c| c.account_sid == sid)
    }

    /// Record a lease on an existing account, keeping the number index in step.
    ///
    /// A number leased to a different account is refused.
    pub fn set_lease(&mut self, account_id: &str, lease: LeasedNumber) -> EngineResult<()> {
        let number = lease.number().to_string();
        if self.leases.get(&number).is_some_and(|owner| owner != account_id) {
            return Err(EngineError::NumberTaken(number));
        }
        let account = self.account_mut(account_id)?;
        let previous = account.leased.replace(lease);

        if let Some(previous) = previous {
            self.leases.remove(previous.number());
        }
        self.leases.insert(number, account_id.to_string());
        Ok(())
    }

    /// Drop an account's lease, returning it if there was one.
    pub fn clear_lease(&mut self, account_id: &str) -> Option<LeasedNumber> {
        let lease = self.accounts.get_mut(account_id)?.leased.take()?;
        self.leases.remove(lease.number());
        Some(lease)
    }

    /// Free the account's credential if it holds one. Idempotent.
    pub fn release_credential(&mut self, account_id: &str) -> Option<CredentialId> {
        let account = self.accounts.get_mut(account_id)?;
        let credential_id = account.credential_id.take()?;

        if let Some(record) = self.credentials.get_mut(&credential_id) {
            if record.used_by.as_deref() == Some(account_id) {
                record.used_by = None;
                record.assigned_at = None;
            }
        }
        Some(credential_id)
    }

    /// Append an activity record.
    pub fn log(&mut self, account_id: &str, action: impl Into<String>) {
        self.activity.push(ActivityRecord {
            account_id: account_id.to_string(),
            action: action.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn stats(&self) -> EngineStats {
        let count = |status| {
            self.accounts
                .values()
                .filter(|a| a.status == status)
                .count()
        };

        EngineStats {
            accounts: self.accounts.len(),
            pending: count(EntitlementStatus::Pending),
            approved: count(EntitlementStatus::Approved),
            rejected: count(EntitlementStatus::Rejected),
            credentials_total: self.credentials.len(),
            credentials_free: self.credentials.values().filter(|c| c.is_available()).count(),
            leased_numbers: self.leases.len(),
            processed_messages: self.processed_messages.len(),
            redeem_codes_open: self
                .redeem_codes
                .values()
                .filter(|c| c.redeemed_by.is_none())
                .count(),
        }
    }

    fn unique_referral_code(&self) -> String {
        loop {
            let code = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
            if self.account_by_referral_code(&code).is_none() {
                return code;
            }
        }
    }
}

struct Inner {
    data: RwLock<StoreData>,
    snapshot: Snapshot,
    /// Serializes snapshot writes so the newest state always lands last.
    persist_lock: Mutex<()>,
}

/// Handle to the shared store. Cheap to clone.
#[derive(Clone)]
pub struct EntitlementStore {
    inner: Arc<Inner>,
}

impl EntitlementStore {
    /// Open the store, loading the existing snapshot if there is one.
    pub async fn open(config: &StorageConfig) -> EngineResult<Self> {
        let snapshot = Snapshot::from_config(config);
        let mut data = snapshot.load().await?.unwrap_or_default();

        // A lock flag that survived a restart belongs to a purchase that is gone
        for account in data.accounts.values_mut() {
            if account.allocation_in_progress {
                warn!("Clearing stale allocation lock for {}", account.id);
                account.allocation_in_progress = false;
            }
        }

        Ok(Self::with_snapshot(data, snapshot))
    }

    /// Memory-only store (tests, persistence disabled).
    pub fn in_memory() -> Self {
        Self::with_snapshot(StoreData::default(), Snapshot::Memory)
    }

    fn with_snapshot(data: StoreData, snapshot: Snapshot) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: RwLock::new(data),
                snapshot,
                persist_lock: Mutex::new(()),
            }),
        }
    }

    /// Run a read-only view of the data.
    pub async fn read<T>(&self, f: impl FnOnce(&StoreData) -> T) -> T {
        let data = self.inner.data.read().await;
        f(&data)
    }

    /// Run one atomic update and persist it.
    ///
    /// Nothing is visible to other tasks until the save succeeds.
    pub async fn write<T>(
        &self,
        f: impl FnOnce(&mut StoreData) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut data = self.inner.data.write().await;
        if matches!(self.inner.snapshot, Snapshot::Memory) {
            return f(&mut data);
        }

        let mut staged = data.clone();
        let result = f(&mut staged)?;

        let _guard = self.inner.persist_lock.lock().await;
        if let Err(e) = self.inner.snapshot.save(&staged).await {
            error!("Failed to persist store, update discarded: {}", e);
            return Err(e);
        }
        *data = staged;
        Ok(result)
    }

    /// Save the current state.
    pub async fn persist(&self) -> EngineResult<()> {
        if matches!(self.inner.snapshot, Snapshot::Memory) {
            return Ok(());
        }

        let data = self.inner.data.read().await;
        let _guard = self.inner.persist_lock.lock().await;
        self.inner
            .snapshot
            .save(&data)
            .await
            .inspect_err(|e| error!("Failed to persist store: {}", e))
    }

    /// Clear an account's purchase lock and reservation.
    ///
    /// If the save fails the lock is still cleared in memory; `open` drops
    /// any lock flag read back from disk.
    pub async fn end_allocation(&self, account_id: &str) {
        let saved = self
            .write(|data| {
                data.end_allocation(account_id);
                Ok(())
            })
            .await;

        if let Err(e) = saved {
            warn!("Allocation lock for {} cleared in memory only: {}", account_id, e);
            self.inner.data.write().await.end_allocation(account_id);
        }
    }

    /// Fetch an account, creating it on first contact.
    pub async fn get_or_create_account(
        &self,
        id: &str,
        username: Option<&str>,
    ) -> EngineResult<(Account, bool)> {
        // Fast path without persisting
        let existing = self
            .read(|data| data.accounts.get(id).cloned())
            .await;
        if let Some(account) = existing {
            if username.is_none() || account.username.as_deref() == username {
                return Ok((account, false));
            }
        }

        self.write(|data| {
            if let Some(account) = data.accounts.get_mut(id) {
                if let Some(name) = username {
                    account.username = Some(name.to_string());
                }
                return Ok((account.clone(), false));
            }

            let code = data.unique_referral_code();
            let account = Account::new(id, username.map(str::to_string), code);
            data.accounts.insert(id.to_string(), account.clone());
            data.log(id, "Account created");
            info!("Created account {}", id);
            Ok((account, true))
        })
        .await
    }

    pub async fn account(&self, id: &str) -> EngineResult<Account> {
        self.read(|data| data.account(id).cloned()).await
    }

    /// Find accounts by id or username (leading `@` optional).
    pub async fn search_accounts(&self, query: &str) -> Vec<Account> {
        let query = query.trim().trim_start_matches('@').to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }

        self.read(|data| {
            let mut found: Vec<Account> = data
                .accounts
                .values()
                .filter(|a| {
                    a.id.to_lowercase() == query
                        || a.username
                            .as_deref()
                            .map(|u| u.to_lowercase() == query)
                            .unwrap_or(false)
                })
                .cloned()
                .collect();
            found.sort_by(|a, b| a.id.cmp(&b.id));
            found
        })
        .await
    }

    /// Accounts currently waiting for approval, oldest first.
    pub async fn pending_accounts(&self) -> Vec<Account> {
        self.read(|data| {
            let mut pending: Vec<Account> = data
                .accounts
                .values()
                .filter(|a| a.status == EntitlementStatus::Pending)
                .cloned()
                .collect();
            pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            pending
        })
        .await
    }

    pub async fn set_input_state(&self, id: &str, state: InputState) -> EngineResult<()> {
        self.write(|data| {
            data.account_mut(id)?.input_state = Some(state);
            Ok(())
        })
        .await
    }

    /// Take and clear the pending input state in one step.
    pub async fn take_input_state(&self, id: &str) -> EngineResult<Option<InputState>> {
        let has_state = self
            .read(|data| {
                data.accounts
                    .get(id)
                    .map(|a| a.input_state.is_some())
                    .unwrap_or(false)
            })
            .await;
        if !has_state {
            return Ok(None);
        }

        self.write(|data| Ok(data.account_mut(id)?.input_state.take()))
            .await
    }

    /// Activity for one account, newest first.
    pub async fn activity(&self, id: &str, limit: usize) -> Vec<ActivityRecord> {
        self.read(|data| {
            data.activity
                .iter()
                .rev()
                .filter(|r| r.account_id == id)
                .take(limit)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn stats(&self) -> EngineStats {
        self.read(StoreData::stats).await
    }

    /// Whether a message id was already delivered.
    pub async fn is_processed(&self, message_id: &str) -> bool {
        self.read(|data| data.processed_messages.contains_key(message_id))
            .await
    }

    /// Message ids delivered to an account, newest first.
    pub async fn processed_for(&self, account_id: &str) -> Vec<ProcessedMessage> {
        self.read(|data| {
            let mut messages: Vec<ProcessedMessage> = data
                .processed_messages
                .values()
                .filter(|m| m.account_id == account_id)
                .cloned()
                .collect();
            messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
            messages
        })
        .await
    }
}

impl std::fmt::Debug for EntitlementStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementStore").finish_non_exhaustive()
    }
}
