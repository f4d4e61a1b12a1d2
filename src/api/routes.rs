use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use super::handlers;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub redis_client: Option<redis::Client>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(pool: PgPool, redis_client: Option<redis::Client>) -> Self {
        Self {
            pool,
            redis_client,
            metrics_handle: None,
        }
    }

    /// Adds the Prometheus handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Creates the facade router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/wallets", post(handlers::create_wallet))
        .route("/wallets/:id", get(handlers::get_wallet))
        .route("/wallets/:id/deposit", post(handlers::deposit))
        .route("/wallets/:id/withdrawals", post(handlers::schedule_withdrawal))
        .route(
            "/wallets/:id/transactions",
            get(handlers::list_wallet_transactions),
        )
        .route("/transactions/:id", get(handlers::get_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
