//! Test doubles shared by the unit tests.

use crate::config::{EngineConfig, RetryConfig, StorageConfig};
use crate::notify::Notifier;
use crate::store::EntitlementStore;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use telephony_client::{
    NumberHandle, ProviderCredentials, ProviderError, ProviderMessage, TelephonyProvider,
};

pub const ADMIN: &str = "admin";

pub fn test_config() -> EngineConfig {
    EngineConfig {
        admin_ids: vec![ADMIN.to_string()],
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
        ..EngineConfig::default()
    }
}

/// Scripted telephony provider.
#[derive(Default)]
pub struct FakeProvider {
    pub available: Mutex<Vec<String>>,
    pub invalid_numbers: Mutex<HashSet<String>>,
    pub invalid_credentials: Mutex<HashSet<String>>,
    /// Errors returned by the next provision calls, in order.
    pub provision_errors: Mutex<VecDeque<ProviderError>>,
    pub release_errors: Mutex<VecDeque<ProviderError>>,
    pub message_errors: Mutex<VecDeque<ProviderError>>,
    /// Messages per destination number.
    pub messages: Mutex<HashMap<String, Vec<ProviderMessage>>>,
    pub provision_delay: Mutex<Option<Duration>>,
    pub provisioned: Mutex<Vec<String>>,
    pub released: Mutex<Vec<String>>,
    pub provision_calls: AtomicU32,
    pub message_queries: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_provision(&self, error: ProviderError) {
        self.provision_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_release(&self, error: ProviderError) {
        self.release_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_messages(&self, error: ProviderError) {
        self.message_errors.lock().unwrap().push_back(error);
    }

    pub fn mark_invalid(&self, number: &str) {
        self.invalid_numbers.lock().unwrap().insert(number.to_string());
    }

    pub fn reject_credential(&self, sid: &str) {
        self.invalid_credentials.lock().unwrap().insert(sid.to_string());
    }

    pub fn deliver(&self, id: &str, to: &str, body: &str) {
        self.messages
            .lock()
            .unwrap()
            .entry(to.to_string())
            .or_default()
            .insert(
                0,
                ProviderMessage {
                    id: id.to_string(),
                    from: "+15550009999".to_string(),
                    to: to.to_string(),
                    body: body.to_string(),
                    sent_at: Some(Utc::now()),
                },
            );
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.provisioned.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelephonyProvider for FakeProvider {
    async fn list_available_numbers(
        &self,
        _creds: &ProviderCredentials,
        _region: &str,
        limit: u32,
    ) -> Result<Vec<String>, ProviderError> {
        let available = self.available.lock().unwrap();
        Ok(available.iter().take(limit as usize).cloned().collect())
    }

    async fn provision_number(
        &self,
        _creds: &ProviderCredentials,
        number: &str,
        _callback_url: Option<&str>,
    ) -> Result<NumberHandle, ProviderError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.provision_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.provision_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        self.provisioned.lock().unwrap().push(number.to_string());
        Ok(NumberHandle {
            sid: format!("PN-{}", number),
            phone_number: number.to_string(),
        })
    }

    async fn release_number(
        &self,
        _creds: &ProviderCredentials,
        handle: &NumberHandle,
    ) -> Result<(), ProviderError> {
        if let Some(error) = self.release_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.released.lock().unwrap().push(handle.phone_number.clone());
        Ok(())
    }

    async fn validate_number(
        &self,
        _creds: &ProviderCredentials,
        number: &str,
    ) -> Result<bool, ProviderError> {
        Ok(!self.invalid_numbers.lock().unwrap().contains(number))
    }

    async fn list_recent_messages(
        &self,
        _creds: &ProviderCredentials,
        number: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<ProviderMessage>, ProviderError> {
        self.message_queries
            .lock()
            .unwrap()
            .push((number.to_string(), since));

        if let Some(error) = self.message_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        let messages = self.messages.lock().unwrap();
        Ok(messages
            .get(number)
            .map(|m| m.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn validate_credential(
        &self,
        creds: &ProviderCredentials,
    ) -> Result<bool, ProviderError> {
        Ok(!self
            .invalid_credentials
            .lock()
            .unwrap()
            .contains(&creds.account_sid))
    }
}

/// Notifier that records everything it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<(AccountId, String)>>,
    pub admin_prompts: Mutex<Vec<(String, Vec<AdminAction>)>>,
    pub broadcasts: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_to(&self, account_id: &str) -> Vec<String> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == account_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn prompt_count(&self) -> usize {
        self.admin_prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, account_id: &AccountId, text: &str) {
        self.notifications
            .lock()
            .unwrap()
            .push((account_id.clone(), text.to_string()));
    }

    async fn prompt_admins(&self, text: &str, actions: Vec<AdminAction>) {
        self.admin_prompts
            .lock()
            .unwrap()
            .push((text.to_string(), actions));
    }

    async fn broadcast(&self, text: &str) {
        self.broadcasts.lock().unwrap().push(text.to_string());
    }
}

/// Put a credential into the pool and return its id.
pub async fn seed_credential(store: &EntitlementStore, sid: &str) -> CredentialId {
    store
        .write(|data| {
            let id = data.next_credential_id;
            data.next_credential_id += 1;
            data.credentials.insert(
                id,
                CredentialRecord {
                    id,
                    account_sid: sid.to_string(),
                    auth_token: format!("token-{}", sid),
                    used_by: None,
                    added_at: Utc::now(),
                    assigned_at: None,
                },
            );
            Ok(id)
        })
        .await
        .unwrap()
}

/// Create an approved account holding its own credential.
pub async fn approved_account(
    store: &EntitlementStore,
    id: &str,
    points: u64,
    credits: u64,
) -> CredentialId {
    store.get_or_create_account(id, None).await.unwrap();
    let credential_id = seed_credential(store, &format!("AC-{}", id)).await;

    store
        .write(|data| {
            let record = data.credentials.get_mut(&credential_id).unwrap();
            record.used_by = Some(id.to_string());
            record.assigned_at = Some(Utc::now());

            let account = data.account_mut(id)?;
            account.status = EntitlementStatus::Approved;
            account.credential_id = Some(credential_id);
            account.balance_points = points;
            account.balance_credits = credits;
            Ok(())
        })
        .await
        .unwrap();

    credential_id
}

/// Encrypted snapshot location whose writes can be made to fail.
pub struct FlakyDisk {
    state_dir: PathBuf,
}

impl FlakyDisk {
    pub fn new(root: &Path) -> Self {
        Self {
            state_dir: root.join("state"),
        }
    }

    pub fn config(&self) -> StorageConfig {
        StorageConfig {
            path: self.state_dir.join("store.enc"),
            persist: true,
            encryption_key: Some(secrecy::SecretString::new("test-passphrase".into())),
        }
    }

    pub async fn open(&self) -> EntitlementStore {
        EntitlementStore::open(&self.config()).await.unwrap()
    }

    /// Replace the state directory with a plain file so saves fail.
    pub fn break_writes(&self) {
        if self.state_dir.is_dir() {
            std::fs::remove_dir_all(&self.state_dir).unwrap();
        }
        std::fs::write(&self.state_dir, b"not a directory").unwrap();
    }

    pub fn repair(&self) {
        std::fs::remove_file(&self.state_dir).unwrap();
    }
}
