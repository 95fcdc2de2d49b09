//! Admin approval state machine.
//!
//! ```text
//! pending ──approve──▶ approved ──revoke──▶ pending
//!    │
//!    └──reject──▶ rejected ──fresh request──▶ pending
//! ```

use crate::allocation::Allocator;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::notify::Notifier;
use crate::pool::{claim_explicit, claim_free, CredentialPool};
use crate::store::{EntitlementStore, StoreData};
use crate::types::{AccountId, AdminAction, BulkReport, CredentialRecord, EntitlementStatus};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// How an entitlement check was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entitlement {
    /// The account already held a credential.
    Existing,
    /// A pooled credential was assigned on the spot.
    AutoApproved,
}

fn transition(data: &mut StoreData, account_id: &str, from: EntitlementStatus, to: EntitlementStatus) -> EngineResult<()> {
    let account = data.account_mut(account_id)?;
    if account.status != from {
        return Err(EngineError::InvalidTransition {
            from: account.status.to_string(),
            to: to.to_string(),
        });
    }
    account.status = to;
    Ok(())
}

/// Drives `pending -> approved/rejected` and credential revocation.
pub struct ApprovalWorkflow {
    store: EntitlementStore,
    pool: Arc<CredentialPool>,
    allocator: Arc<Allocator>,
    notifier: Arc<dyn Notifier>,
    config: Arc<EngineConfig>,
}

impl ApprovalWorkflow {
    pub fn new(
        store: EntitlementStore,
        pool: Arc<CredentialPool>,
        allocator: Arc<Allocator>,
        notifier: Arc<dyn Notifier>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            pool,
            allocator,
            notifier,
            config,
        }
    }

    fn require_admin(&self, actor: &str) -> EngineResult<()> {
        if self.config.is_admin(actor) {
            Ok(())
        } else {
            warn!("Non-admin {} attempted an approval action", actor);
            Err(EngineError::Unauthorized)
        }
    }

    /// Make sure the account holds a credential, escalating to admins if none is free.
    ///
    /// Fails with `NoCredentialAvailable` once the request is with the admins.
    #[instrument(skip(self))]
    pub async fn ensure_entitled(&self, account_id: &str) -> EngineResult<Entitlement> {
        let account = self.store.account(account_id).await?;
        if account.status == EntitlementStatus::Approved && account.credential_id.is_some() {
            return Ok(Entitlement::Existing);
        }
        // A rejected account only gets back in through the admins
        if account.status == EntitlementStatus::Rejected {
            self.request_credentials(account_id).await?;
            return Err(EngineError::NoCredentialAvailable);
        }

        let claimed = self
            .store
            .write(|data| {
                let record = claim_free(data, account_id)?;
                let account = data.account_mut(account_id)?;
                account.status = EntitlementStatus::Approved;
                account.approval_requested_at = None;
                data.log(account_id, "Approved automatically from pool");
                Ok(record)
            })
            .await;

        match claimed {
            Ok(record) => {
                info!("Auto-approved {} with credential {}", account_id, record.id);
                self.notifier
                    .notify(
                        &account_id.to_string(),
                        "Your account has been approved. You can now buy numbers.",
                    )
                    .await;
                Ok(Entitlement::AutoApproved)
            }
            Err(EngineError::NoCredentialAvailable) => {
                self.request_credentials(account_id).await?;
                Err(EngineError::NoCredentialAvailable)
            }
            Err(e) => Err(e),
        }
    }

    /// Put the account in `pending` and ask the admins, once per entry.
    #[instrument(skip(self))]
    pub async fn request_credentials(&self, account_id: &str) -> EngineResult<()> {
        let prompt = self
            .store
            .write(|data| {
                let account = data.account_mut(account_id)?;
                let first_request =
                    account.status != EntitlementStatus::Pending || account.approval_requested_at.is_none();
                if !first_request {
                    return Ok(None);
                }

                account.status = EntitlementStatus::Pending;
                account.approval_requested_at = Some(Utc::now());
                let name = account.display_name();
                data.log(account_id, "Requested credentials");
                Ok(Some(name))
            })
            .await?;

        if let Some(name) = prompt {
            info!("Account {} is waiting for approval", account_id);
            self.prompt_admins(account_id, &format!("{} is requesting access.", name))
                .await;
        }
        Ok(())
    }

    async fn prompt_admins(&self, account_id: &str, text: &str) {
        let id: AccountId = account_id.to_string();
        self.notifier
            .prompt_admins(
                text,
                vec![AdminAction::Approve(id.clone()), AdminAction::Reject(id)],
            )
            .await;
    }

    /// Approve a pending account, with a pooled or an admin-supplied credential.
    ///
    /// A supplied credential is checked with the provider first; a rejected
    /// one changes nothing.
    #[instrument(skip(self, credential))]
    pub async fn approve(
        &self,
        actor: &str,
        account_id: &str,
        credential: Option<(String, String)>,
    ) -> EngineResult<CredentialRecord> {
        self.require_admin(actor)?;

        if let Some((sid, token)) = &credential {
            self.pool.validate(sid, token).await?;
        }

        let record = self
            .store
            .write(|data| {
                let status = data.account(account_id)?.status;
                if status != EntitlementStatus::Pending {
                    return Err(EngineError::InvalidTransition {
                        from: status.to_string(),
                        to: EntitlementStatus::Approved.to_string(),
                    });
                }

                let record = match &credential {
                    Some((sid, token)) => claim_explicit(data, account_id, sid, token)?,
                    None => claim_free(data, account_id)?,
                };
                transition(data, account_id, EntitlementStatus::Pending, EntitlementStatus::Approved)?;
                data.account_mut(account_id)?.approval_requested_at = None;
                data.log(account_id, format!("Approved by {}", actor));
                Ok(record)
            })
            .await?;

        info!("Admin {} approved {}", actor, account_id);
        self.notifier
            .notify(
                &account_id.to_string(),
                "Your account has been approved. You can now buy numbers.",
            )
            .await;
        Ok(record)
    }

    /// Replace an account's credential with a supplied pair, whatever its state.
    #[instrument(skip(self, token))]
    pub async fn set_credential(
        &self,
        actor: &str,
        account_id: &str,
        sid: &str,
        token: &str,
    ) -> EngineResult<CredentialRecord> {
        self.require_admin(actor)?;
        self.pool.validate(sid, token).await?;

        // A number belongs to the sub-account it was bought under
        let switching = |data: &StoreData| {
            data.credential_for(account_id).map(|c| c.account_sid.as_str()) != Some(sid)
        };
        let drop_number = self
            .store
            .read(|data| {
                let account = data.account(account_id)?;
                if account.allocation_in_progress {
                    return Err(EngineError::AllocationInProgress);
                }
                Ok(account.leased.is_some() && switching(data))
            })
            .await?;
        if drop_number {
            self.release_number_best_effort(account_id).await;
        }

        let record = self
            .store
            .write(|data| {
                if data.account(account_id)?.allocation_in_progress {
                    return Err(EngineError::AllocationInProgress);
                }
                if switching(data) {
                    if let Some(lease) = data.clear_lease(account_id) {
                        data.log(
                            account_id,
                            format!("Dropped {} with the old credential", lease.number()),
                        );
                    }
                }
                let record = claim_explicit(data, account_id, sid, token)?;
                let account = data.account_mut(account_id)?;
                account.status = EntitlementStatus::Approved;
                account.approval_requested_at = None;
                data.log(account_id, format!("Credential set by {}", actor));
                Ok(record)
            })
            .await?;

        info!("Admin {} set credential of {}", actor, account_id);
        self.notifier
            .notify(&account_id.to_string(), "Your provider credential has been updated.")
            .await;
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn reject(&self, actor: &str, account_id: &str) -> EngineResult<()> {
        self.require_admin(actor)?;

        self.store
            .write(|data| {
                transition(data, account_id, EntitlementStatus::Pending, EntitlementStatus::Rejected)?;
                data.log(account_id, format!("Rejected by {}", actor));
                Ok(())
            })
            .await?;

        info!("Admin {} rejected {}", actor, account_id);
        self.notifier
            .notify(
                &account_id.to_string(),
                "Your access request was rejected. Contact an admin if you think this is a mistake.",
            )
            .await;
        Ok(())
    }

    /// Approve every pending account from the pool until it runs dry.
    #[instrument(skip(self))]
    pub async fn bulk_approve(&self, actor: &str) -> EngineResult<BulkReport> {
        self.require_admin(actor)?;

        let pending = self.store.pending_accounts().await;
        let mut report = BulkReport::default();

        for (index, account) in pending.iter().enumerate() {
            let result = self
                .store
                .write(|data| {
                    let status = data.account(&account.id)?.status;
                    if status != EntitlementStatus::Pending {
                        return Err(EngineError::InvalidTransition {
                            from: status.to_string(),
                            to: EntitlementStatus::Approved.to_string(),
                        });
                    }
                    claim_free(data, &account.id)?;
                    transition(data, &account.id, EntitlementStatus::Pending, EntitlementStatus::Approved)?;
                    data.account_mut(&account.id)?.approval_requested_at = None;
                    data.log(&account.id, format!("Approved by {} (bulk)", actor));
                    Ok(())
                })
                .await;

            match result {
                Ok(()) => {
                    report.succeeded += 1;
                    self.notifier
                        .notify(
                            &account.id,
                            "Your account has been approved. You can now buy numbers.",
                        )
                        .await;
                }
                Err(EngineError::NoCredentialAvailable) => {
                    report.skipped += pending.len() - index;
                    warn!("Credential pool exhausted during bulk approve");
                    break;
                }
                Err(e @ EngineError::Storage(_)) => return Err(e),
                Err(e) => {
                    warn!("Bulk approve skipped {}: {}", account.id, e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            "Admin {} bulk approved {} account(s), skipped {}",
            actor, report.succeeded, report.skipped
        );
        Ok(report)
    }

    /// Reject every pending account.
    #[instrument(skip(self))]
    pub async fn bulk_reject(&self, actor: &str) -> EngineResult<BulkReport> {
        self.require_admin(actor)?;

        let pending = self.store.pending_accounts().await;
        let mut report = BulkReport::default();

        for account in &pending {
            let result = self
                .store
                .write(|data| {
                    transition(data, &account.id, EntitlementStatus::Pending, EntitlementStatus::Rejected)?;
                    data.log(&account.id, format!("Rejected by {} (bulk)", actor));
                    Ok(())
                })
                .await;

            match result {
                Ok(()) => {
                    report.succeeded += 1;
                    self.notifier
                        .notify(&account.id, "Your access request was rejected.")
                        .await;
                }
                Err(e @ EngineError::Storage(_)) => return Err(e),
                Err(e) => {
                    warn!("Bulk reject skipped {}: {}", account.id, e);
                    report.skipped += 1;
                }
            }
        }

        info!("Admin {} bulk rejected {} account(s)", actor, report.succeeded);
        Ok(report)
    }

    /// Take an approved account's credential and number back, returning it to `pending`.
    #[instrument(skip(self))]
    pub async fn revoke(&self, actor: &str, account_id: &str) -> EngineResult<()> {
        self.require_admin(actor)?;

        let account = self.store.account(account_id).await?;
        if account.status != EntitlementStatus::Approved {
            return Err(EngineError::InvalidTransition {
                from: account.status.to_string(),
                to: EntitlementStatus::Pending.to_string(),
            });
        }
        if account.allocation_in_progress {
            return Err(EngineError::AllocationInProgress);
        }

        self.release_number_best_effort(account_id).await;

        let name = self
            .store
            .write(|data| {
                let account = data.account(account_id)?;
                if account.allocation_in_progress {
                    return Err(EngineError::AllocationInProgress);
                }
                transition(data, account_id, EntitlementStatus::Approved, EntitlementStatus::Pending)?;
                data.clear_lease(account_id);
                data.release_credential(account_id);

                let account = data.account_mut(account_id)?;
                account.approval_requested_at = Some(Utc::now());
                let name = account.display_name();
                data.log(account_id, format!("Credential revoked by {}", actor));
                Ok(name)
            })
            .await?;

        info!("Admin {} revoked {}", actor, account_id);
        self.notifier
            .notify(
                &account_id.to_string(),
                "Your provider credential was revoked. Your request is pending admin approval again.",
            )
            .await;
        self.prompt_admins(account_id, &format!("{} is pending again after revocation.", name))
            .await;
        Ok(())
    }

    /// Delete an account, releasing its number and credential and zeroing its balances.
    #[instrument(skip(self))]
    pub async fn remove_account(&self, actor: &str, account_id: &str) -> EngineResult<()> {
        self.require_admin(actor)?;

        let account = self.store.account(account_id).await?;
        if account.allocation_in_progress {
            return Err(EngineError::AllocationInProgress);
        }

        self.release_number_best_effort(account_id).await;

        self.store
            .write(|data| {
                if data.account(account_id)?.allocation_in_progress {
                    return Err(EngineError::AllocationInProgress);
                }
                data.clear_lease(account_id);
                data.release_credential(account_id);

                let account = data.account_mut(account_id)?;
                let (points, credits) = (account.balance_points, account.balance_credits);
                account.balance_points = 0;
                account.balance_credits = 0;

                data.log(
                    account_id,
                    format!(
                        "Account removed by {} ({} points, {} credits forfeited)",
                        actor, points, credits
                    ),
                );
                data.accounts.remove(account_id);
                Ok(())
            })
            .await?;

        info!("Admin {} removed account {}", actor, account_id);
        Ok(())
    }

    async fn release_number_best_effort(&self, account_id: &str) {
        if let Err(e) = self.allocator.release_current(account_id).await {
            warn!(
                "Could not release number of {} at the provider, dropping it locally: {}",
                account_id, e
            );
        }
    }
}
