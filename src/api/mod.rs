//! API module
//!
//! HTTP transport over the transaction coordinator.

pub mod middleware;
pub mod password;
pub mod routes;

use axum::{middleware as axum_middleware, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::ledger::Ledger;
use crate::worker::TaskOptions;

pub use routes::create_router;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    /// Delivery options of the verification mail scheduled on signup
    pub verify_email_options: TaskOptions,
}

impl AppState {
    pub fn new(ledger: Ledger, verify_email_options: TaskOptions) -> Self {
        Self {
            ledger,
            verify_email_options,
        }
    }
}

/// Full application router with middleware applied
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .nest("/v1", create_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum_middleware::from_fn(middleware::context_middleware))
                .layer(axum_middleware::from_fn(middleware::logging_middleware)),
        )
        .with_state(state)
}
