//! Proxy lifecycle tests: registration, quota, heartbeats, key rotation

mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{request, seed_cluster, spawn_app};

async fn register(
    app: &common::TestApp,
    api_key: &str,
) -> (StatusCode, serde_json::Value) {
    request(
        &app.router,
        "POST",
        "/api/v1/proxies/register",
        Some(api_key),
        Some(json!({
            "kind": "l7",
            "capabilities": ["tls", "http2"],
            "software_version": "1.4.2",
        })),
    )
    .await
}

#[tokio::test]
async fn register_returns_token_certificate_and_anchors() {
    let app = spawn_app().await;
    let (_cluster_id, api_key) = seed_cluster(&app.state, "prod").await;

    let (status, body) = register(&app, &api_key).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert!(body["proxy_token"].as_str().unwrap().starts_with("fpp_"));
    assert!(body["certificate_pem"].as_str().unwrap().contains("BEGIN CERTIFICATE"));
    assert!(body["private_key_pem"].as_str().unwrap().contains("PRIVATE KEY"));
    assert_eq!(body["trust_anchors"].as_array().unwrap().len(), 1);
    assert_eq!(body["proxy"]["status"], "registering");
    assert_eq!(body["proxy"]["kind"], "l7");
}

#[tokio::test]
async fn wrong_api_key_is_unauthorized() {
    let app = spawn_app().await;
    seed_cluster(&app.state, "prod").await;
    let (status, _) = register(&app, "fpk_not-a-real-key").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn community_quota_denies_the_fourth_proxy() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;

    for _ in 0..3 {
        let (status, _) = register(&app, &api_key).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let certs_before = app.state.store.list_certificates(&cluster_id).await.unwrap().len();

    let (status, body) = register(&app, &api_key).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["kind"], "quota");

    // No registration row and no client certificate were created.
    assert_eq!(app.state.store.list_proxies(&cluster_id).await.unwrap().len(), 3);
    assert_eq!(
        app.state.store.list_certificates(&cluster_id).await.unwrap().len(),
        certs_before
    );
}

#[tokio::test]
async fn heartbeat_activates_and_is_idempotent() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;
    let (_, registered) = register(&app, &api_key).await;
    let proxy_id = registered["proxy"]["id"].as_str().unwrap().to_string();
    let token = registered["proxy_token"].as_str().unwrap().to_string();

    let audit_before = app.state.audit.list(Some(&cluster_id), 1000).await.unwrap().len();

    let beat = json!({ "status": "serving", "metrics": { "rps": 120 } });
    for _ in 0..2 {
        let (status, _) = request(
            &app.router,
            "POST",
            &format!("/api/v1/proxies/{proxy_id}/heartbeat"),
            Some(&token),
            Some(beat.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    let proxy = app.state.store.get_proxy(&proxy_id).await.unwrap();
    assert_eq!(proxy.status, fleetplane::types::ProxyStatus::Active);
    assert!(proxy.last_seen.is_some());

    // Heartbeats do not generate audit events.
    let audit_after = app.state.audit.list(Some(&cluster_id), 1000).await.unwrap().len();
    assert_eq!(audit_before, audit_after);
}

#[tokio::test]
async fn heartbeat_with_someone_elses_id_is_not_found() {
    let app = spawn_app().await;
    let (_cluster_id, api_key) = seed_cluster(&app.state, "prod").await;
    let (_, registered) = register(&app, &api_key).await;
    let token = registered["proxy_token"].as_str().unwrap().to_string();

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/v1/proxies/other-proxy/heartbeat",
        Some(&token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn revoked_proxy_loses_token_and_certificate() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;
    let (_, registered) = register(&app, &api_key).await;
    let proxy_id = registered["proxy"]["id"].as_str().unwrap().to_string();
    let token = registered["proxy_token"].as_str().unwrap().to_string();
    let cert_id = registered["proxy"]["certificate_id"].as_str().unwrap().to_string();

    let (status, _) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/proxies/{proxy_id}/revoke"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = request(
        &app.router,
        "POST",
        &format!("/api/v1/proxies/{proxy_id}/heartbeat"),
        Some(&token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let crl = app.state.ca.crl(&cluster_id).await.unwrap();
    assert_eq!(crl.len(), 1);
    let cert = app.state.store.get_certificate(&cluster_id, &cert_id).await.unwrap();
    assert_eq!(cert.status, fleetplane::ca::CertStatus::Revoked);
}

#[tokio::test]
async fn cluster_key_rotation_has_an_overlap_window() {
    let app = spawn_app().await;
    let (cluster_id, old_key) = seed_cluster(&app.state, "prod").await;
    let (_, registered) = register(&app, &old_key).await;
    let old_token = registered["proxy_token"].as_str().unwrap().to_string();

    // Rotate: both keys and old-generation tokens keep working.
    let (status, rotated) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/rotate-key"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_key = rotated["api_key"].as_str().unwrap().to_string();

    let (status, _) = register(&app, &old_key).await;
    assert_eq!(status, StatusCode::CREATED, "old key within overlap");
    let (status, _) = register(&app, &new_key).await;
    assert_eq!(status, StatusCode::CREATED, "new key");
    assert!(app.state.sessions.verify_proxy_token(&old_token).await.is_ok());

    // Push the rotation timestamp past the overlap window.
    let mut cluster = app.state.store.get_cluster(&cluster_id).await.unwrap();
    cluster.key_rotated_at = Some(Utc::now() - Duration::days(61));
    app.state.store.update_cluster(cluster).await.unwrap();

    let (status, _) = register(&app, &old_key).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "old key after overlap");
    let err = app
        .state
        .sessions
        .verify_proxy_token(&old_token)
        .await
        .unwrap_err();
    assert!(matches!(err, fleetplane::error::ControlError::TokenExpired));

    let (status, _) = register(&app, &new_key).await;
    // Community quota: three proxies already admitted.
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
}
