//! Request authentication.

use axum::http::HeaderMap;
use tracing::debug;
use vexa_core::credentials::Authenticated;

use super::error::ApiError;
use crate::state::AppState;

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Authenticates a client call and charges the per-call cost.
///
/// Runs on the blocking pool: the debit may wait on a locked database.
pub(crate) async fn charge_client(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Authenticated, ApiError> {
    let presented = header_value(headers, &state.credential_header).map(str::to_owned);
    let credentials = state.credentials.clone();
    let cost = state.call_cost;

    let auth = run_blocking(move || {
        credentials
            .consume_and_authenticate(presented.as_deref(), cost)
            .map_err(ApiError::from)
    })
    .await?;

    debug!(account_id = %auth.account.id, charged = %auth.charged, remaining = %auth.remaining, "client call charged");
    Ok(auth)
}

/// Checks the administrative secret.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    state
        .admin_secret
        .verify(header_value(headers, &state.admin_header))
        .map_err(ApiError::from)
}

/// Runs a store operation on the blocking pool.
pub(crate) async fn run_blocking<T, F>(op: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}
