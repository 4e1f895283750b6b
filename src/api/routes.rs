use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AuthService};

use super::handlers::{
    create_link, deactivate_link, get_link, health_check, link_stats, list_links,
    reactivate_link, AppState,
};

pub fn create_api_router(state: Arc<AppState>, auth_service: Arc<AuthService>) -> Router {
    let protected_routes = Router::new()
        .route("/api/links", post(create_link))
        .route("/api/links", get(list_links))
        .route("/api/links/{alias}", get(get_link))
        .route("/api/links/{alias}", delete(deactivate_link))
        .route("/api/links/{alias}/reactivate", post(reactivate_link))
        .route("/api/links/{alias}/stats", get(link_stats))
        .route_layer(middleware::from_fn(move |headers, req, next| {
            let auth = Arc::clone(&auth_service);
            auth_middleware(auth, headers, req, next)
        }))
        .with_state(state);

    Router::new()
        .route("/health", get(health_check))
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
}
