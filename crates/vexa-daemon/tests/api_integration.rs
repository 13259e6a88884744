//! Integration tests for the HTTP API.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{Value, json};
use vexa_core::amount::Credits;
use vexa_core::config::ApiConfig;
use vexa_core::credentials::AdminSecret;
use vexa_core::db::Database;
use vexa_core::ledger::{AccountId, DisplayHints};
use vexa_daemon::{AppState, router};

const ADMIN_SECRET: &str = "test-admin-secret";

fn api_key_header() -> HeaderName {
    HeaderName::from_static("x-api-key")
}

fn admin_header() -> HeaderName {
    HeaderName::from_static("x-admin-api-key")
}

fn value(text: &str) -> HeaderValue {
    HeaderValue::from_str(text).unwrap()
}

fn create_test_server(admin_secret: &str) -> (TestServer, AppState) {
    let db = Database::in_memory().unwrap();
    let state = AppState::new(db, &ApiConfig::default(), AdminSecret::new(admin_secret)).unwrap();
    let server = TestServer::new(router(state.clone())).unwrap();
    (server, state)
}

/// Creates an account with `balance` and returns its id and a fresh key.
fn account_with_key(state: &AppState, id: i64, balance: Credits) -> (AccountId, String) {
    let id = AccountId::new(id);
    state
        .accounts
        .get_or_create(id, &DisplayHints::new("user", "User"), balance)
        .unwrap();
    let key = state.credentials.issue(id).unwrap();
    (id, key.expose().to_string())
}

// ============ Client Endpoint Tests ============

#[tokio::test]
async fn test_banner() {
    let (server, _) = create_test_server(ADMIN_SECRET);

    let response = server.get("/").await;

    response.assert_status_ok();
    assert!(response.text().contains("/api/ping"));
}

#[tokio::test]
async fn test_ping_charges_call_cost() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    let (id, key) = account_with_key(&state, 100, Credits::whole(80));

    let response = server
        .get("/api/ping")
        .add_header(api_key_header(), value(&key))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["user_id"], 100);
    assert_eq!(body["credits_remaining"], "79");
    assert_eq!(state.accounts.balance(id).unwrap(), Some(Credits::whole(79)));
}

#[tokio::test]
async fn test_missing_key_is_unauthorized() {
    let (server, _) = create_test_server(ADMIN_SECRET);

    let response = server.get("/api/ping").await;

    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get("www-authenticate"),
        Some(&value("ApiKey"))
    );
    let body: Value = response.json();
    assert_eq!(body["detail"], "API key is required.");
}

#[tokio::test]
async fn test_unknown_key_is_unauthorized() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    let (id, _) = account_with_key(&state, 100, Credits::whole(80));
    let forged = format!("vx_{}", "0".repeat(64));

    let response = server
        .get("/api/ping")
        .add_header(api_key_header(), value(&forged))
        .await;

    assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get("www-authenticate"),
        Some(&value("ApiKey"))
    );
    let body: Value = response.json();
    assert_eq!(body["detail"], "API key is invalid or has been revoked.");
    assert_eq!(state.accounts.balance(id).unwrap(), Some(Credits::whole(80)));
}

#[tokio::test]
async fn test_empty_balance_is_payment_required() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    let (id, key) = account_with_key(&state, 100, Credits::ZERO);

    let response = server
        .get("/api/ping")
        .add_header(api_key_header(), value(&key))
        .await;

    assert_eq!(response.status_code(), StatusCode::PAYMENT_REQUIRED);
    let body: Value = response.json();
    assert_eq!(body["detail"], "Not enough credits to fulfil the request.");
    assert_eq!(body["required"], "1");
    assert_eq!(body["available"], "0");
    assert_eq!(state.accounts.balance(id).unwrap(), Some(Credits::ZERO));
}

#[tokio::test]
async fn test_banned_account_is_forbidden_without_charge() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    let (id, key) = account_with_key(&state, 100, Credits::whole(5));
    state.accounts.set_banned(id, true).unwrap();

    let response = server
        .get("/api/ping")
        .add_header(api_key_header(), value(&key))
        .await;

    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(state.accounts.balance(id).unwrap(), Some(Credits::whole(5)));
}

#[tokio::test]
async fn test_echo_returns_payload() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    let (_, key) = account_with_key(&state, 100, Credits::whole(2));

    let response = server
        .post("/api/echo")
        .add_header(api_key_header(), value(&key))
        .json(&json!({ "text": "salam" }))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["echo"]["text"], "salam");
    assert_eq!(body["credits_remaining"], "1");
}

#[tokio::test]
async fn test_calls_stop_when_credits_run_out() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    let (id, key) = account_with_key(&state, 100, Credits::whole(2));

    for _ in 0..2 {
        server
            .get("/api/ping")
            .add_header(api_key_header(), value(&key))
            .await
            .assert_status_ok();
    }
    let response = server
        .get("/api/ping")
        .add_header(api_key_header(), value(&key))
        .await;

    assert_eq!(response.status_code(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(state.accounts.balance(id).unwrap(), Some(Credits::ZERO));
}

// ============ Admin Endpoint Tests ============

#[tokio::test]
async fn test_admin_disabled_without_secret() {
    let (server, state) = create_test_server("");
    account_with_key(&state, 100, Credits::whole(80));

    let response = server
        .get("/api/admin/users/100")
        .add_header(admin_header(), value("anything"))
        .await;

    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_admin_requires_valid_secret() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    account_with_key(&state, 100, Credits::whole(80));

    let missing = server.get("/api/admin/users/100").await;
    assert_eq!(missing.status_code(), StatusCode::UNAUTHORIZED);
    assert!(missing.headers().get("www-authenticate").is_none());

    let wrong = server
        .get("/api/admin/users/100")
        .add_header(admin_header(), value("not-the-secret"))
        .await;
    assert_eq!(wrong.status_code(), StatusCode::UNAUTHORIZED);

    // A client credential does not open admin routes.
    let (_, key) = account_with_key(&state, 101, Credits::whole(1));
    let client = server
        .get("/api/admin/users/100")
        .add_header(api_key_header(), value(&key))
        .await;
    assert_eq!(client.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_get_user() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    account_with_key(&state, 100, Credits::whole(80));

    let response = server
        .get("/api/admin/users/100")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["user"]["id"], 100);
    assert_eq!(body["user"]["balance"], "80");
    assert_eq!(body["user"]["banned"], false);

    let unknown = server
        .get("/api/admin/users/999")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .await;
    unknown.assert_status_not_found();

    let malformed = server
        .get("/api/admin/users/abc")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .await;
    assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_adjust_balance() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    let (id, _) = account_with_key(&state, 100, Credits::whole(80));

    let response = server
        .post("/api/admin/users/100/balance")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .json(&json!({ "delta": "10.5" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["balance"], "90.5");

    let overdraw = server
        .post("/api/admin/users/100/balance")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .json(&json!({ "delta": "-100" }))
        .await;
    assert_eq!(overdraw.status_code(), StatusCode::PAYMENT_REQUIRED);

    let garbage = server
        .post("/api/admin/users/100/balance")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .json(&json!({ "delta": "lots" }))
        .await;
    assert_eq!(garbage.status_code(), StatusCode::BAD_REQUEST);

    let unknown = server
        .post("/api/admin/users/999/balance")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .json(&json!({ "delta": "1" }))
        .await;
    unknown.assert_status_not_found();

    assert_eq!(
        state.accounts.balance(id).unwrap(),
        Some(Credits::from_minor(9_050))
    );
}

#[tokio::test]
async fn test_admin_ban_and_unban() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    let (id, key) = account_with_key(&state, 100, Credits::whole(80));

    server
        .post("/api/admin/users/100/ban")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .await
        .assert_status_ok();
    assert!(state.accounts.get(id).unwrap().unwrap().banned);
    let blocked = server
        .get("/api/ping")
        .add_header(api_key_header(), value(&key))
        .await;
    assert_eq!(blocked.status_code(), StatusCode::FORBIDDEN);

    server
        .post("/api/admin/users/100/unban")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .await
        .assert_status_ok();
    server
        .get("/api/ping")
        .add_header(api_key_header(), value(&key))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_admin_rotate_and_revoke_credential() {
    let (server, state) = create_test_server(ADMIN_SECRET);
    let (_, old_key) = account_with_key(&state, 100, Credits::whole(80));

    let issued = server
        .post("/api/admin/users/100/api-key/issue")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .await;
    issued.assert_status_ok();
    let body: Value = issued.json();
    let new_key = body["api_key"].as_str().unwrap().to_string();
    assert!(new_key.starts_with("vx_"));
    assert_ne!(new_key, old_key);
    assert_eq!(body["hint"], &new_key[new_key.len() - 4..]);

    let stale = server
        .get("/api/ping")
        .add_header(api_key_header(), value(&old_key))
        .await;
    assert_eq!(stale.status_code(), StatusCode::UNAUTHORIZED);
    server
        .get("/api/ping")
        .add_header(api_key_header(), value(&new_key))
        .await
        .assert_status_ok();

    let status = server
        .get("/api/admin/users/100/api-key")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .await;
    status.assert_status_ok();
    let body: Value = status.json();
    assert_eq!(body["active"], true);
    assert!(!body["credential"]["last_used_at"].is_null());
    assert!(!status.text().contains(&new_key));

    let revoked = server
        .post("/api/admin/users/100/api-key/revoke")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .await;
    revoked.assert_status_ok();
    let body: Value = revoked.json();
    assert_eq!(body["revoked"], true);

    let after = server
        .get("/api/ping")
        .add_header(api_key_header(), value(&new_key))
        .await;
    assert_eq!(after.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_issue_for_unknown_account_is_not_found() {
    let (server, _) = create_test_server(ADMIN_SECRET);

    let response = server
        .post("/api/admin/users/555/api-key/issue")
        .add_header(admin_header(), value(ADMIN_SECRET))
        .await;

    response.assert_status_not_found();
}
