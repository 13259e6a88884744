//! HTTP API.
//!
//! Client routes take the credential header and charge the configured
//! per-call cost before doing any work:
//!
//! - `GET /api/ping`
//! - `POST /api/echo`
//!
//! Admin routes take the admin header:
//!
//! - `GET /api/admin/users/{id}`
//! - `POST /api/admin/users/{id}/balance` with `{"delta": "10.5"}`
//! - `POST /api/admin/users/{id}/ban`, `POST /api/admin/users/{id}/unban`
//! - `GET /api/admin/users/{id}/api-key`
//! - `POST /api/admin/users/{id}/api-key/issue`,
//!   `POST /api/admin/users/{id}/api-key/revoke`

mod auth;
mod error;
mod handlers;

use axum::Router;
use axum::routing::{get, post};
pub use error::ApiError;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/users/:id", get(handlers::get_user))
        .route("/users/:id/balance", post(handlers::adjust_balance))
        .route("/users/:id/ban", post(handlers::ban_user))
        .route("/users/:id/unban", post(handlers::unban_user))
        .route("/users/:id/api-key", get(handlers::credential_status))
        .route("/users/:id/api-key/issue", post(handlers::issue_credential))
        .route("/users/:id/api-key/revoke", post(handlers::revoke_credential));

    Router::new()
        .route("/", get(handlers::banner))
        .route("/api/ping", get(handlers::ping))
        .route("/api/echo", post(handlers::echo))
        .nest("/api/admin", admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
