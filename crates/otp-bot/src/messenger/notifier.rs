//! Engine notifications delivered over Signal.

use super::client::SignalClient;
use async_trait::async_trait;
use otp_core::{AccountId, AdminAction, Notifier};
use tracing::{debug, error};

/// Sends engine notifications as Signal messages.
///
/// Account ids are Signal identities, so they are used as recipients as-is.
pub struct SignalNotifier {
    client: SignalClient,
    admin_ids: Vec<String>,
    broadcast_target: Option<String>,
}

impl SignalNotifier {
    pub fn new(
        client: SignalClient,
        admin_ids: Vec<String>,
        broadcast_target: Option<String>,
    ) -> Self {
        Self {
            client,
            admin_ids,
            broadcast_target,
        }
    }

    async fn deliver(&self, recipient: &str, text: &str) {
        if let Err(e) = self.client.send(recipient, text).await {
            error!("Failed to notify {}: {}", recipient, e);
        }
    }
}

/// Admin prompt text with one reply command per action.
pub fn format_admin_prompt(text: &str, actions: &[AdminAction]) -> String {
    if actions.is_empty() {
        return text.to_string();
    }

    let commands: Vec<String> = actions.iter().map(|a| format!("- {}", a.command())).collect();
    format!("{}\n\nReply with:\n{}", text, commands.join("\n"))
}

#[async_trait]
impl Notifier for SignalNotifier {
    async fn notify(&self, account_id: &AccountId, text: &str) {
        self.deliver(account_id, text).await;
    }

    async fn prompt_admins(&self, text: &str, actions: Vec<AdminAction>) {
        let prompt = format_admin_prompt(text, &actions);
        for admin in &self.admin_ids {
            self.deliver(admin, &prompt).await;
        }
        debug!("Prompted {} admin(s)", self.admin_ids.len());
    }

    async fn broadcast(&self, text: &str) {
        if let Some(target) = &self.broadcast_target {
            self.deliver(target, text).await;
        }
    }
}
