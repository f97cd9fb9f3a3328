//! Axum router setup.

use crate::auth::require_auth;
use crate::handlers::{items, users};
use crate::AppState;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Extra request-body headroom over the sealed secret limit, for the JSON
/// envelope and base64 expansion.
const BODY_SLACK: usize = 256 * 1024;

pub fn build_router(state: AppState) -> Router {
    // Every route here requires the username/authorization metadata pair.
    let authenticated = Router::new()
        .route("/api/v1/users/{username}", get(users::get_user))
        .route("/api/v1/users/{username}/revision", get(users::get_revision))
        .route("/api/v1/users", put(users::update_user))
        .route("/api/v1/users/{username}", delete(users::delete_user))
        .route("/api/v1/items/create", post(items::create_item))
        .route("/api/v1/items/get", post(items::get_item))
        .route("/api/v1/items/list", post(items::get_item_list))
        .route("/api/v1/items/batch", post(items::get_items))
        .route("/api/v1/items/hash", post(items::get_item_hash))
        .route("/api/v1/items/update", post(items::update_item))
        .route("/api/v1/items/delete", post(items::delete_item))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Registration and login are exempt from authentication.
    let public = Router::new()
        .route("/api/v1/users/register", post(users::register))
        .route("/api/v1/users/login", post(users::login))
        .route("/health", get(health));

    let body_limit = state.storage.max_secret_size() as usize * 2 + BODY_SLACK;

    Router::new()
        .merge(authenticated)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
