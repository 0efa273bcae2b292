//! REST API layer built on Axum.
//!
//! Client-plane endpoints: `/insert`, `/remove`, `/search`, `/members`,
//! `/health`, `/metrics`. The Raft RPC plane lives in
//! [`crate::cluster::api`] and is served on a separate listener.

/// API error types mapped to HTTP status codes.
pub mod errors;
/// HTTP request handlers and application state.
pub mod handlers;
/// Prometheus metrics recording.
pub mod metrics;
/// Request and response data transfer objects.
pub mod models;

use crate::config;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use handlers::AppState;
use std::time::Instant;
use tower_http::trace::TraceLayer;

async fn metrics_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    metrics::record_request(&method, &path, response.status().as_u16(), start.elapsed());
    response
}

/// Builds the Axum router for the client plane.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/insert", post(handlers::insert))
        .route("/remove", post(handlers::remove))
        .route("/search", post(handlers::search))
        .route("/members", post(handlers::members))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_endpoint))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(config::MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}
