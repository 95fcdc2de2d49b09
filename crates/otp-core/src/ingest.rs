//! Inbound message ingestion.
//!
//! Messages for leased numbers arrive through the background poll, the
//! provider webhook or a user-triggered refresh. Whichever transport sees a
//! message first records it; the processed-message map keyed by provider
//! message id makes every later sighting a no-op.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::notify::Notifier;
use crate::retry::{check_cooldown, RetryPolicy};
use crate::store::EntitlementStore;
use crate::types::{AccountId, InboundMessage, ProcessedMessage, Transport};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use telephony_client::{ProviderCredentials, ProviderMessage, TelephonyProvider};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Accounts polled at the same time.
const POLL_CONCURRENCY: usize = 8;

/// Why a message was dropped without being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    EmptyBody,
    /// No account leases the destination number.
    UnknownNumber,
}

/// Result of feeding one message to the ingestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Delivered(AccountId),
    Duplicate,
    Discarded(DiscardReason),
}

/// Counters for one poll sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub accounts: usize,
    pub delivered: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Accounts whose lease was dropped because the provider ran out of funds.
    pub exhausted: usize,
}

/// Messages returned by an OTP refresh.
#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub number: String,
    /// Newest first.
    pub messages: Vec<ProviderMessage>,
    /// How many of them had not been seen before.
    pub new: usize,
}

struct PollTarget {
    account_id: AccountId,
    number: String,
    creds: ProviderCredentials,
    last_check: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct AccountSweep {
    delivered: usize,
    duplicates: usize,
    failed: bool,
    exhausted: bool,
}

impl From<ProviderMessage> for InboundMessage {
    fn from(m: ProviderMessage) -> Self {
        InboundMessage {
            message_id: m.id,
            to: m.to,
            from: m.from,
            body: m.body,
        }
    }
}

/// Text sent to the account for a new message.
pub fn format_delivery(message: &InboundMessage) -> String {
    format!(
        "New message on {}\nFrom: {}\n\n{}",
        message.to, message.from, message.body
    )
}

/// Routes inbound messages to the accounts leasing their numbers.
pub struct MessageIngestor {
    store: EntitlementStore,
    provider: Arc<dyn TelephonyProvider>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    config: Arc<EngineConfig>,
}

impl MessageIngestor {
    pub fn new(
        store: EntitlementStore,
        provider: Arc<dyn TelephonyProvider>,
        notifier: Arc<dyn Notifier>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            provider,
            notifier,
            retry: RetryPolicy::new(&config.retry),
            config,
        }
    }

    /// Record a message and notify its owner, exactly once per message id.
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn ingest(
        &self,
        message: InboundMessage,
        transport: Transport,
    ) -> EngineResult<IngestOutcome> {
        let outcome = self.record(&message, transport).await?;

        if let IngestOutcome::Delivered(account_id) = &outcome {
            self.notifier
                .notify(account_id, &format_delivery(&message))
                .await;
            self.broadcast(account_id, &message).await;
        }
        Ok(outcome)
    }

    /// Resolve, dedupe and record in one store write.
    async fn record(
        &self,
        message: &InboundMessage,
        transport: Transport,
    ) -> EngineResult<IngestOutcome> {
        if message.body.trim().is_empty() {
            debug!("Dropping empty message {} to {}", message.message_id, message.to);
            return Ok(IngestOutcome::Discarded(DiscardReason::EmptyBody));
        }

        let outcome = self
            .store
            .write(|data| {
                let Some(account) = data.account_for_number(&message.to) else {
                    return Ok(IngestOutcome::Discarded(DiscardReason::UnknownNumber));
                };
                let account_id = account.id.clone();

                if data.processed_messages.contains_key(&message.message_id) {
                    return Ok(IngestOutcome::Duplicate);
                }

                data.processed_messages.insert(
                    message.message_id.clone(),
                    ProcessedMessage {
                        message_id: message.message_id.clone(),
                        account_id: account_id.clone(),
                        from_number: message.from.clone(),
                        to_number: message.to.clone(),
                        body: message.body.clone(),
                        received_at: Utc::now(),
                        transport,
                    },
                );
                data.log(
                    &account_id,
                    format!("Received message on {} via {}", message.to, transport),
                );
                Ok(IngestOutcome::Delivered(account_id))
            })
            .await?;

        match &outcome {
            IngestOutcome::Delivered(account_id) => info!(
                "Delivered {} to {} via {}",
                message.message_id, account_id, transport
            ),
            IngestOutcome::Duplicate => debug!(
                "Message {} already processed, {} copy ignored",
                message.message_id, transport
            ),
            IngestOutcome::Discarded(_) => warn!(
                "No account leases {}, discarding {}",
                message.to, message.message_id
            ),
        }
        Ok(outcome)
    }

    async fn broadcast(&self, account_id: &str, message: &InboundMessage) {
        if self.config.broadcast_target.is_none() {
            return;
        }
        let text = format!(
            "OTP for {} on {}\nFrom: {}\n\n{}",
            account_id, message.to, message.from, message.body
        );
        self.notifier.broadcast(&text).await;
    }

    /// Fetch the latest messages of the account's number on demand.
    ///
    /// Guarded by the OTP refresh cooldown, which only starts once a fetch
    /// succeeds. Messages are recorded through the same dedupe path as the
    /// other transports and returned for display rather than sent as
    /// separate notifications.
    #[instrument(skip(self))]
    pub async fn refresh_otps(&self, account_id: &str) -> EngineResult<RefreshResult> {
        let window = self.config.otp_refresh_cooldown;
        let (number, creds) = self
            .store
            .read(|data| {
                let account = data.account(account_id)?;
                let number = account
                    .leased_number()
                    .ok_or(EngineError::NoNumber)?
                    .to_string();
                check_cooldown(account.last_otp_refresh_at, window, Utc::now())?;
                let creds = data
                    .credential_for(account_id)
                    .map(|c| c.provider_credentials())
                    .ok_or(EngineError::NotEntitled)?;
                Ok::<_, EngineError>((number, creds))
            })
            .await?;

        let limit = self.config.recent_messages_limit;
        let messages = self
            .retry
            .call("list_recent_messages", || {
                self.provider.list_recent_messages(&creds, &number, None, limit)
            })
            .await?;

        // A concurrent refresh may have finished while this one fetched
        self.store
            .write(|data| {
                let now = Utc::now();
                let account = data.account(account_id)?;
                check_cooldown(account.last_otp_refresh_at, window, now)?;
                data.account_mut(account_id)?.last_otp_refresh_at = Some(now);
                Ok(())
            })
            .await?;

        let mut new = 0;
        for message in messages.iter().rev() {
            let inbound = InboundMessage::from(message.clone());
            if let IngestOutcome::Delivered(owner) = self.record(&inbound, Transport::Refresh).await? {
                new += 1;
                self.broadcast(&owner, &inbound).await;
            }
        }

        Ok(RefreshResult {
            number,
            messages,
            new,
        })
    }

    /// Sweep every leased number once.
    pub async fn poll_once(&self) -> PollReport {
        let sweep_start = Utc::now();
        let targets: Vec<PollTarget> = self
            .store
            .read(|data| {
                data.accounts
                    .values()
                    .filter_map(|account| {
                        let number = account.leased_number()?.to_string();
                        let creds = data.credential_for(&account.id)?.provider_credentials();
                        Some(PollTarget {
                            account_id: account.id.clone(),
                            number,
                            creds,
                            last_check: account.last_check,
                        })
                    })
                    .collect()
            })
            .await;

        let mut report = PollReport {
            accounts: targets.len(),
            ..PollReport::default()
        };

        let sweeps: Vec<AccountSweep> = stream::iter(targets)
            .map(|target| self.poll_account(target, sweep_start))
            .buffer_unordered(POLL_CONCURRENCY)
            .collect()
            .await;

        for sweep in sweeps {
            report.delivered += sweep.delivered;
            report.duplicates += sweep.duplicates;
            report.failed += usize::from(sweep.failed);
            report.exhausted += usize::from(sweep.exhausted);
        }
        report
    }

    async fn poll_account(&self, target: PollTarget, sweep_start: DateTime<Utc>) -> AccountSweep {
        let mut sweep = AccountSweep::default();
        let lookback = chrono::Duration::from_std(self.config.initial_lookback)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let since = target.last_check.unwrap_or(sweep_start - lookback);
        let limit = self.config.poll_messages_limit;

        let fetched = self
            .retry
            .call("list_recent_messages", || {
                self.provider
                    .list_recent_messages(&target.creds, &target.number, Some(since), limit)
            })
            .await;

        let messages = match fetched {
            Ok(messages) => messages,
            Err(EngineError::ProviderFundsExhausted(reason)) => {
                sweep.exhausted = true;
                self.drop_exhausted_lease(&target, &reason).await;
                return sweep;
            }
            Err(e) => {
                warn!("Poll of {} for {} failed: {}", target.number, target.account_id, e);
                sweep.failed = true;
                return sweep;
            }
        };

        for message in messages.into_iter().rev() {
            match self.ingest(message.into(), Transport::Poll).await {
                Ok(IngestOutcome::Delivered(_)) => sweep.delivered += 1,
                Ok(IngestOutcome::Duplicate) => sweep.duplicates += 1,
                Ok(IngestOutcome::Discarded(_)) => {}
                Err(e) => {
                    error!("Failed to record polled message: {}", e);
                    sweep.failed = true;
                }
            }
        }

        if sweep.failed {
            return sweep;
        }

        let advanced = self
            .store
            .write(|data| {
                if let Ok(account) = data.account_mut(&target.account_id) {
                    // A purchase mid-sweep may have moved the watermark further already
                    if account.last_check.map_or(true, |t| t < sweep_start) {
                        account.last_check = Some(sweep_start);
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = advanced {
            error!("Failed to advance poll watermark for {}: {}", target.account_id, e);
            sweep.failed = true;
        }
        sweep
    }

    async fn drop_exhausted_lease(&self, target: &PollTarget, reason: &str) {
        warn!(
            "Provider out of funds for {}, dropping {}: {}",
            target.account_id, target.number, reason
        );

        let cleared = self
            .store
            .write(|data| {
                let still_leased = data
                    .account(&target.account_id)
                    .map(|a| a.leased_number() == Some(target.number.as_str()))
                    .unwrap_or(false);
                if still_leased {
                    data.clear_lease(&target.account_id);
                    data.log(
                        &target.account_id,
                        format!("Lost {}: provider out of funds", target.number),
                    );
                }
                Ok(still_leased)
            })
            .await;

        match cleared {
            Ok(true) => {
                self.notifier
                    .notify(
                        &target.account_id,
                        &format!(
                            "Your number {} was dropped because the provider account ran out of funds. Contact an admin for a new credential.",
                            target.number
                        ),
                    )
                    .await;
            }
            Ok(false) => {}
            Err(e) => error!("Failed to drop lease of {}: {}", target.account_id, e),
        }
    }

    /// Poll on the configured interval forever.
    pub async fn run(&self) {
        info!(
            "Starting message poller, interval: {:?}",
            self.config.poll_interval
        );

        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let report = self.poll_once().await;
            if report.delivered > 0 || report.failed > 0 || report.exhausted > 0 {
                info!(
                    "Poll complete: {} account(s), {} delivered, {} failed, {} out of funds",
                    report.accounts, report.delivered, report.failed, report.exhausted
                );
            } else {
                debug!("Poll complete: {} account(s), nothing new", report.accounts);
            }
        }
    }
}

/// Spawn the message poller as a background task.
pub fn spawn_poller(ingestor: Arc<MessageIngestor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        ingestor.run().await;
    })
}
