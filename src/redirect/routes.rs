use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use tower_http::cors::CorsLayer;

use super::handlers::{health_check, redirect, track_visit, RedirectState};
use super::middleware::record_request_start;

pub fn create_redirect_router(state: Arc<RedirectState>) -> Router {
    // The tracking snippet posts from arbitrary origins.
    Router::new()
        .route("/", get(health_check))
        .route("/visits", post(track_visit))
        .route("/{alias}", get(redirect))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(record_request_start))
        .with_state(state)
}
