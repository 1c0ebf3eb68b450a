//! HTTP API handlers and routing.

pub mod auth;
pub mod error;
pub mod exec;

use axum::{
    http::{header, Method},
    response::Response,
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::gateway;
use crate::state::AppState;

/// Create the main router: the two host endpoints, everything else falls
/// through to the gateway's path-priority routing.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        // Version query (no auth required)
        .route("/terraform/v1/host/versions", get(versions))
        // Authenticated command dispatch
        .route("/terraform/v1/host/exec", post(exec::exec))
        // Static UI and reverse proxying
        .fallback(gateway::route)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Application state
        .with_state(state)
}

/// `GET /terraform/v1/host/versions`. Reports the version without the
/// release tag's leading `v`.
async fn versions() -> Response {
    error::ok_data(json!({
        "version": crate::VERSION.trim_start_matches('v'),
    }))
}
