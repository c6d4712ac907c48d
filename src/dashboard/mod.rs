//! Dashboard surface: a thin `axum` router serialising what the
//! Ledger/Supervisor already expose — no new business logic lives here.

pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::exchange::ExchangeAdapter;
use crate::ledger::Ledger;
use crate::middleware::logging::request_logging_simple;
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer};
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub supervisor: Arc<Supervisor>,
}

/// Builds the dashboard router: the read-only REST surface plus the `/ws`
/// upgrade for `dashboardUpdate`/`priceUpdate` events.
pub fn router(state: AppState) -> Router {
    let limiter = RateLimitLayer::new(RateLimitConfig {
        window: Duration::from_secs(1),
        max_requests: 20,
        burst: 10,
    });

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route("/api/traders", get(routes::get_traders))
        .route("/api/traders/:id", get(routes::get_trader))
        .route("/api/performance", get(routes::get_performance))
        .route("/api/history", get(routes::get_history))
        .route("/api/top-gainers", get(routes::get_top_gainers))
        .route("/ws", get(routes::websocket_handler))
        .route("/health", get(routes::health_check))
        .route_layer(axum::middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(axum::middleware::from_fn(request_logging_simple))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
