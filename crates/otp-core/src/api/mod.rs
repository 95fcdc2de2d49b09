//! HTTP surface: provider webhooks and health.

mod handlers;
mod types;

pub use handlers::{create_router, AppState};
pub use types::*;
