//! Messaging front end interface.

use crate::types::{AccountId, AdminAction};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Outbound messages to users and admins.
///
/// Delivery is best effort: implementations log failures and never
/// return them, so a chat outage cannot fail an engine operation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Message one account.
    async fn notify(&self, account_id: &AccountId, text: &str);

    /// Message every admin, offering the given actions.
    async fn prompt_admins(&self, text: &str, actions: Vec<AdminAction>);

    /// Copy to the audit channel, if one is configured.
    async fn broadcast(&self, text: &str);
}

/// Notifier that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _account_id: &AccountId, _text: &str) {}

    async fn prompt_admins(&self, _text: &str, _actions: Vec<AdminAction>) {}

    async fn broadcast(&self, _text: &str) {}
}
