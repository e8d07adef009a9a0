//! Mutating admission webhook for NodePort Services
//!
//! Intercepts Service create/update operations and routes them through the
//! allocator: ports with `nodePort: 0` receive a free port from the matched
//! range via JSON patch, explicitly requested ports are validated, and every
//! allocation decision is surfaced as an admission warning.
//!
//! The webhook is stateless across requests and safe to run on every
//! replica: allocation mutates the authoritative store with optimistic
//! concurrency, so racing replicas converge.

pub mod service;

use std::sync::Arc;

use axum::{routing::post, Router};

use crate::manager::Manager;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Port manager owning the range bitmaps
    pub manager: Arc<Manager>,
}

impl WebhookState {
    /// Create webhook state over the given manager
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

/// Create the webhook router
///
/// Currently serves:
/// - POST /mutate - Service NodePort allocation and validation
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate", post(service::mutate_handler))
        .with_state(state)
}
