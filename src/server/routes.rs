//! Router configuration for the web server.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/count", get(handlers::count))
        .route("/delete/:id", post(handlers::delete))
        // Counts are requested by browser clients on arbitrary origins
        .layer(CorsLayer::permissive())
        .with_state(state)
}
