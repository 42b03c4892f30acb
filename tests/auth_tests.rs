//! Authentication surface tests

mod common;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{ADMIN_PASSWORD, request, spawn_app};
use fleetplane::config::Config;

#[tokio::test]
async fn login_returns_token_pair() {
    let app = spawn_app().await;
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "login": "admin", "password": ADMIN_PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["access_token"].as_str().is_some());
    assert!(body["refresh_token"].as_str().unwrap().starts_with("fpr_"));
}

#[tokio::test]
async fn wrong_password_is_unauthorized_with_envelope() {
    let app = spawn_app().await;
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "login": "admin", "password": "nope-nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "authentication");
}

#[tokio::test]
async fn lockout_after_threshold_failures() {
    let config = Config {
        initial_admin_password: Some(ADMIN_PASSWORD.to_string()),
        lockout_threshold: 3,
        rate_limit_per_sec: 10_000,
        rate_limit_burst: 10_000,
        ..Config::default()
    };
    let app = common::spawn_app_with(config).await;

    for _ in 0..3 {
        let (status, _) = request(
            &app.router,
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({ "login": "admin", "password": "wrong" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // The account is now locked regardless of credential correctness.
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "login": "admin", "password": ADMIN_PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["error"]["kind"], "authentication");
}

#[tokio::test]
async fn refresh_rotates_and_is_single_use() {
    let app = spawn_app().await;
    let (_, login_body) = request(
        &app.router,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "login": "admin", "password": ADMIN_PASSWORD })),
    )
    .await;
    let refresh = login_body["refresh_token"].as_str().unwrap().to_string();

    let (status, refreshed) = request(
        &app.router,
        "POST",
        "/api/v1/auth/refresh",
        None,
        Some(json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(refreshed["refresh_token"].as_str().unwrap(), refresh);

    // The consumed token cannot be replayed.
    let (status, _) = request(
        &app.router,
        "POST",
        "/api/v1/auth/refresh",
        None,
        Some(json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_revokes_the_refresh_token() {
    let app = spawn_app().await;
    let (_, login_body) = request(
        &app.router,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "login": "admin", "password": ADMIN_PASSWORD })),
    )
    .await;
    let access = login_body["access_token"].as_str().unwrap().to_string();
    let refresh = login_body["refresh_token"].as_str().unwrap().to_string();

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/v1/auth/logout",
        Some(&access),
        Some(json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/v1/auth/refresh",
        None,
        Some(json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mutating_endpoints_require_a_bearer_token() {
    let app = spawn_app().await;
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/v1/clusters",
        None,
        Some(json!({ "name": "prod", "tier": "community" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "authentication");
}

#[tokio::test]
async fn totp_enabled_user_must_supply_code() {
    let app = spawn_app().await;

    let (status, created) = request(
        &app.router,
        "POST",
        "/api/v1/users",
        Some(&app.admin_token),
        Some(json!({
            "login": "mfa-op",
            "password": "long-enough-pw",
            "roles": [],
            "totp_enabled": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let secret = created["totp_secret"].as_str().unwrap().to_string();

    // Missing code: 428.
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "login": "mfa-op", "password": "long-enough-pw" })),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_REQUIRED, "{body}");

    // A freshly computed code passes.
    let now = chrono::Utc::now().timestamp() as u64;
    let code = current_totp(&secret, now);
    let (status, _) = request(
        &app.router,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({
            "login": "mfa-op",
            "password": "long-enough-pw",
            "totp_code": code,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

/// Client-side RFC 6238 computation matching the server's parameters.
fn current_totp(secret_hex: &str, unix_time: u64) -> String {
    use hmac::{Hmac, Mac};
    use sha1::Sha1;
    let secret = hex::decode(secret_hex).unwrap();
    let counter = unix_time / 30;
    let mut mac = Hmac::<Sha1>::new_from_slice(&secret).unwrap();
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let bin = ((digest[offset] & 0x7f) as u32) << 24
        | (digest[offset + 1] as u32) << 16
        | (digest[offset + 2] as u32) << 8
        | digest[offset + 3] as u32;
    format!("{:06}", bin % 1_000_000)
}
