//! Management API
//!
//! Thin HTTP surface over the trade store and the supervisor: create, list,
//! inspect and cancel trades. Execution never happens in a request handler.

pub mod error;
pub mod handlers;
pub mod types;

pub use error::ApiError;

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::common::clock::Clock;
use crate::common::errors::{EngineError, Result};
use crate::common::market::MarketCatalog;
use crate::common::traits::TradeStore;
use crate::engine::SupervisorClient;

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<dyn TradeStore>,
    pub catalog: MarketCatalog,
    pub supervisor: SupervisorClient,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TradeStore>,
        catalog: MarketCatalog,
        supervisor: SupervisorClient,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            supervisor,
            clock,
        }
    }
}

/// Create the REST API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/trades",
            post(handlers::create_trade).get(handlers::list_trades),
        )
        .route("/trades/{id}", get(handlers::get_trade))
        .route("/trades/{id}/stats", get(handlers::trade_stats))
        .route("/trades/{id}/cancel", post(handlers::cancel_trade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(bind: &str, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| EngineError::Configuration(format!("Cannot bind {}: {}", bind, e)))?;
    info!(bind = %bind, "Management API listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))
}
