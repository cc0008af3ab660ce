use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tracing::info;

use crate::cache::{LeakReport, LeakThresholds};

use super::PageCache;
use super::middleware::log_responses;

#[derive(Clone)]
pub struct AdminState {
    pub cache: PageCache,
}

#[derive(Debug, Serialize)]
struct StatsBody {
    #[serde(flatten)]
    report: LeakReport,
    thresholds: LeakThresholds,
    healthy: bool,
}

#[derive(Debug, Serialize)]
struct ClearBody {
    cleared: usize,
}

/// Admin listener: health, structure sizes, manual clear.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(cache_clear))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
}

async fn health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

async fn cache_stats(State(state): State<AdminState>) -> Response {
    let report = state.cache.leak_report();
    let body = StatsBody {
        healthy: report.is_healthy(),
        thresholds: state.cache.leak_monitor().thresholds(),
        report,
    };
    Json(body).into_response()
}

async fn cache_clear(State(state): State<AdminState>) -> Response {
    let cleared = state.cache.clear();
    info!(
        target: "render_cache::http::admin",
        cleared,
        "Render cache cleared on request"
    );
    Json(ClearBody { cleared }).into_response()
}
