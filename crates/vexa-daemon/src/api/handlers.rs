//! Route handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use vexa_core::amount::Credits;
use vexa_core::ledger::AccountId;

use super::auth::{charge_client, require_admin, run_blocking};
use super::error::ApiError;
use crate::state::AppState;

type ApiResult = Result<Json<Value>, ApiError>;

pub(crate) async fn banner() -> &'static str {
    "vexa-daemon\n\nGET  /api/ping - authenticated liveness check\nPOST /api/echo - authenticated echo\n"
}

// =============================================================================
// Client routes
// =============================================================================

pub(crate) async fn ping(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let auth = charge_client(&state, &headers).await?;
    Ok(Json(json!({
        "status": "ok",
        "user_id": auth.account.id,
        "credits_remaining": auth.remaining,
    })))
}

pub(crate) async fn echo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> ApiResult {
    let auth = charge_client(&state, &headers).await?;
    Ok(Json(json!({
        "echo": payload,
        "user_id": auth.account.id,
        "credits_remaining": auth.remaining,
    })))
}

// =============================================================================
// Admin routes
// =============================================================================

fn parse_account_id(raw: &str) -> Result<AccountId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid user id: {raw}")))
}

pub(crate) async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let id = parse_account_id(&raw_id)?;

    let accounts = state.accounts.clone();
    let account = run_blocking(move || {
        accounts
            .get(id)?
            .ok_or(ApiError::AccountNotFound(id))
    })
    .await?;

    Ok(Json(json!({ "user": account })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct BalanceAdjustment {
    delta: String,
}

pub(crate) async fn adjust_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
    Json(body): Json<BalanceAdjustment>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let id = parse_account_id(&raw_id)?;
    let delta: Credits = body
        .delta
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid amount: {}", body.delta)))?;

    let accounts = state.accounts.clone();
    let balance = run_blocking(move || Ok(accounts.adjust_balance(id, delta)?)).await?;

    info!(account_id = %id, delta = %delta, "admin adjusted balance");
    Ok(Json(json!({ "user_id": id, "balance": balance })))
}

async fn set_banned(state: &AppState, headers: &HeaderMap, raw_id: &str, banned: bool) -> ApiResult {
    require_admin(state, headers)?;
    let id = parse_account_id(raw_id)?;

    let accounts = state.accounts.clone();
    run_blocking(move || Ok(accounts.set_banned(id, banned)?)).await?;

    Ok(Json(json!({ "user_id": id, "banned": banned })))
}

pub(crate) async fn ban_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> ApiResult {
    set_banned(&state, &headers, &raw_id, true).await
}

pub(crate) async fn unban_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> ApiResult {
    set_banned(&state, &headers, &raw_id, false).await
}

pub(crate) async fn credential_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let id = parse_account_id(&raw_id)?;

    let credentials = state.credentials.clone();
    let status = run_blocking(move || {
        if credentials.accounts().get(id)?.is_none() {
            return Err(ApiError::AccountNotFound(id));
        }
        Ok(credentials.status(id)?)
    })
    .await?;

    Ok(Json(json!({
        "user_id": id,
        "active": status.is_some(),
        "credential": status,
    })))
}

/// Issues a new credential, replacing any existing one.
///
/// The plain credential appears in this response only.
pub(crate) async fn issue_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let id = parse_account_id(&raw_id)?;

    let credentials = state.credentials.clone();
    let issued = run_blocking(move || Ok(credentials.issue(id)?)).await?;

    Ok(Json(json!({
        "user_id": id,
        "api_key": issued.expose(),
        "hint": issued.hint(),
    })))
}

pub(crate) async fn revoke_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> ApiResult {
    require_admin(&state, &headers)?;
    let id = parse_account_id(&raw_id)?;

    let credentials = state.credentials.clone();
    let revoked = run_blocking(move || Ok(credentials.revoke(id)?)).await?;

    Ok(Json(json!({ "user_id": id, "revoked": revoked })))
}
