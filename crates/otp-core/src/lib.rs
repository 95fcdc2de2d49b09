//! OTP virtual-number engine
//!
//! Users earn points, convert them to credits and spend credits to lease a
//! virtual phone number from a shared pool of provider credentials. Messages
//! arriving at a leased number are routed back to the account exactly once.
//!
//! # Architecture
//!
//! ```text
//! chat command → ApprovalWorkflow (unprovisioned) → Allocator → provider
//!                                                       ↓
//!                                                EntitlementStore ← Ledger
//!                                                       ↑
//! poll loop / SMS webhook / refresh → MessageIngestor ──┘ → Notifier
//! ```
//!
//! # Modules
//!
//! - [`store`] - Shared state with encrypted snapshot persistence
//! - [`ledger`] - Points and credits
//! - [`pool`] - Provider credential pool
//! - [`allocation`] - Number purchase transaction
//! - [`approval`] - Admin approval state machine
//! - [`ingest`] - Inbound message routing and the poll loop
//! - [`api`] - Webhook HTTP server

pub mod allocation;
pub mod api;
pub mod approval;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod notify;
pub mod pool;
pub mod retry;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use allocation::{normalize_number, Allocator, Purchase};
pub use approval::{ApprovalWorkflow, Entitlement};
pub use config::{EngineConfig, RetryConfig, ServerConfig, StorageConfig};
pub use engine::{OtpEngine, Registration};
pub use error::{format_wait, EngineError, EngineResult};
pub use ingest::{spawn_poller, IngestOutcome, MessageIngestor, PollReport, RefreshResult};
pub use ledger::{Balances, Ledger};
pub use notify::{NoopNotifier, Notifier};
pub use pool::{parse_credential_pair, CredentialPool};
pub use retry::RetryPolicy;
pub use store::EntitlementStore;
pub use types::*;

use api::AppState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

/// Bind the webhook server and run it as a background task.
///
/// Returns a JoinHandle for the server task.
pub async fn spawn_webhook_server(
    engine: OtpEngine,
    config: &ServerConfig,
) -> EngineResult<JoinHandle<EngineResult<()>>> {
    let state = Arc::new(AppState::new(engine));
    let router = api::create_router(state);

    let addr = format!("{}:{}", config.listen_addr, config.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        EngineError::Config(format!("Failed to bind to {}: {}", addr, e))
    })?;

    info!("Webhook server ready on {}", addr);

    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .map_err(|e| EngineError::Internal(format!("Server error: {}", e)))
    });

    Ok(handle)
}
