//! Pool of provider credentials, each held by at most one account.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::retry::RetryPolicy;
use crate::store::{EntitlementStore, StoreData};
use crate::types::{BulkReport, CredentialId, CredentialRecord};
use chrono::Utc;
use std::sync::Arc;
use telephony_client::{ProviderCredentials, TelephonyProvider};
use tracing::{debug, info, instrument, warn};

/// Parse a `SID,token` pair.
pub fn parse_credential_pair(text: &str) -> EngineResult<(String, String)> {
    let (sid, token) = text
        .split_once(',')
        .ok_or(EngineError::InvalidCredential)?;
    let (sid, token) = (sid.trim(), token.trim());

    if sid.is_empty() || token.is_empty() || sid.contains(char::is_whitespace) {
        return Err(EngineError::InvalidCredential);
    }
    Ok((sid.to_string(), token.to_string()))
}

/// Claim the lowest-numbered free credential for an account.
///
/// Must run inside a store write; the test-and-set happens under the guard.
/// An account that already holds a credential keeps it.
pub(crate) fn claim_free(data: &mut StoreData, account_id: &str) -> EngineResult<CredentialRecord> {
    let held = data.account(account_id)?.credential_id;
    if let Some(record) = held.and_then(|id| data.credentials.get(&id)) {
        return Ok(record.clone());
    }

    let record = data
        .credentials
        .values_mut()
        .find(|c| c.is_available())
        .ok_or(EngineError::NoCredentialAvailable)?;

    record.used_by = Some(account_id.to_string());
    record.assigned_at = Some(Utc::now());
    let record = record.clone();

    data.account_mut(account_id)?.credential_id = Some(record.id);
    data.log(account_id, format!("Assigned credential {}", record.fingerprint()));
    Ok(record)
}

/// Assign a specific credential pair to an account, inserting it if new.
///
/// Must run inside a store write. A credential held by a different
/// account is refused; any other credential the account held is released.
pub(crate) fn claim_explicit(
    data: &mut StoreData,
    account_id: &str,
    sid: &str,
    token: &str,
) -> EngineResult<CredentialRecord> {
    data.account(account_id)?;

    let existing = data.credential_by_sid(sid).map(|c| (c.id, c.used_by.clone()));
    if let Some((_, Some(owner))) = &existing {
        if owner != account_id {
            return Err(EngineError::CredentialInUse);
        }
    }

    let current = data.account(account_id)?.credential_id;
    let id = match existing {
        Some((id, _)) => id,
        None => {
            let id = data.next_credential_id;
            data.next_credential_id += 1;
            data.credentials.insert(
                id,
                CredentialRecord {
                    id,
                    account_sid: sid.to_string(),
                    auth_token: String::new(),
                    used_by: None,
                    added_at: Utc::now(),
                    assigned_at: None,
                },
            );
            id
        }
    };

    if current.is_some() && current != Some(id) {
        data.release_credential(account_id);
    }

    let now = Utc::now();
    let record = data
        .credentials
        .get_mut(&id)
        .ok_or_else(|| EngineError::Storage(format!("credential {} vanished", id)))?;
    record.auth_token = token.to_string();
    record.used_by = Some(account_id.to_string());
    record.assigned_at = Some(now);
    let record = record.clone();

    data.account_mut(account_id)?.credential_id = Some(id);
    data.log(account_id, format!("Assigned credential {}", record.fingerprint()));
    Ok(record)
}

/// Shared pool of provider credentials.
pub struct CredentialPool {
    store: EntitlementStore,
    provider: Arc<dyn TelephonyProvider>,
    retry: RetryPolicy,
    config: Arc<EngineConfig>,
}

impl CredentialPool {
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

    /// Claim a free credential for an account in one atomic step.
    #[instrument(skip(self))]
    pub async fn acquire_for(&self, account_id: &str) -> EngineResult<CredentialRecord> {
        let record = self
            .store
            .write(|data| claim_free(data, account_id))
            .await?;
        info!("Credential {} assigned to {}", record.id, account_id);
        Ok(record)
    }

    /// Return the account's credential to the pool. No-op if it has none.
    #[instrument(skip(self))]
    pub async fn release(&self, account_id: &str) -> EngineResult<Option<CredentialId>> {
        let released = self
            .store
            .write(|data| {
                let released = data.release_credential(account_id);
                if let Some(id) = released {
                    data.log(account_id, format!("Released credential {}", id));
                }
                Ok(released)
            })
            .await?;

        if let Some(id) = released {
            info!("Credential {} released by {}", id, account_id);
        } else {
            debug!("No credential held by {}", account_id);
        }
        Ok(released)
    }

    /// Check a credential pair with the provider.
    pub async fn validate(&self, sid: &str, token: &str) -> EngineResult<()> {
        let creds = ProviderCredentials::new(sid, token);
        let valid = self
            .retry
            .call("validate_credential", || self.provider.validate_credential(&creds))
            .await?;

        if valid {
            Ok(())
        } else {
            warn!("Provider rejected credential {}", sid);
            Err(EngineError::InvalidCredential)
        }
    }

    /// Add one validated credential to the pool (admin).
    ///
    /// A SID already in the pool is ignored and `None` is returned.
    #[instrument(skip(self, token))]
    pub async fn add_credential(
        &self,
        actor: &str,
        sid: &str,
        token: &str,
    ) -> EngineResult<Option<CredentialId>> {
        if !self.config.is_admin(actor) {
            return Err(EngineError::Unauthorized);
        }
        self.validate(sid, token).await?;

        let added = self
            .store
            .write(|data| {
                if data.credential_by_sid(sid).is_some() {
                    return Ok(None);
                }

                let id = data.next_credential_id;
                data.next_credential_id += 1;
                data.credentials.insert(
                    id,
                    CredentialRecord {
                        id,
                        account_sid: sid.to_string(),
                        auth_token: token.to_string(),
                        used_by: None,
                        added_at: Utc::now(),
                        assigned_at: None,
                    },
                );
                data.log(actor, format!("Added credential {} to pool", sid));
                Ok(Some(id))
            })
            .await?;

        match added {
            Some(id) => info!("Credential {} added to pool as {}", sid, id),
            None => debug!("Credential {} already pooled", sid),
        }
        Ok(added)
    }

    /// Load several `SID,token` lines (admin). Invalid or duplicate lines are skipped.
    pub async fn load_credentials(&self, actor: &str, lines: &str) -> EngineResult<BulkReport> {
        if !self.config.is_admin(actor) {
            return Err(EngineError::Unauthorized);
        }

        let mut report = BulkReport::default();
        for line in lines.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let outcome = match parse_credential_pair(line) {
                Ok((sid, token)) => self.add_credential(actor, &sid, &token).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(Some(_)) => report.succeeded += 1,
                Ok(None) => report.skipped += 1,
                Err(e @ EngineError::Storage(_)) => return Err(e),
                Err(e) => {
                    warn!("Skipping credential line: {}", e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            "Credential load: {} added, {} skipped",
            report.succeeded, report.skipped
        );
        Ok(report)
    }

    /// All pooled credentials, by id.
    pub async fn list(&self) -> Vec<CredentialRecord> {
        self.store
            .read(|data| data.credentials.values().cloned().collect())
            .await
    }
}
