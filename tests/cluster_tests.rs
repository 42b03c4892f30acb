//! Cluster endpoint tests

mod common;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{request, spawn_app};

#[tokio::test]
async fn create_cluster_returns_id_and_key_once() {
    let app = spawn_app().await;
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/v1/clusters",
        Some(&app.admin_token),
        Some(json!({ "name": "prod", "tier": "community" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["cluster"]["id"].as_str().is_some());
    assert!(body["api_key"].as_str().unwrap().starts_with("fpk_"));
    // The key hash never serializes.
    assert!(body["cluster"].get("api_key_hash").is_none());
}

#[tokio::test]
async fn duplicate_cluster_name_conflicts() {
    let app = spawn_app().await;
    for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
        let (status, _) = request(
            &app.router,
            "POST",
            "/api/v1/clusters",
            Some(&app.admin_token),
            Some(json!({ "name": "prod", "tier": "community" })),
        )
        .await;
        assert_eq!(status, expected);
    }
}

#[tokio::test]
async fn enterprise_tier_denied_without_license() {
    let app = spawn_app().await;
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/v1/clusters",
        Some(&app.admin_token),
        Some(json!({ "name": "big", "tier": "enterprise" })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["kind"], "quota");
}

#[tokio::test]
async fn get_and_list_clusters() {
    let app = spawn_app().await;
    let (_, created) = request(
        &app.router,
        "POST",
        "/api/v1/clusters",
        Some(&app.admin_token),
        Some(json!({ "name": "prod", "tier": "community" })),
    )
    .await;
    let id = created["cluster"]["id"].as_str().unwrap();

    let (status, cluster) = request(
        &app.router,
        "GET",
        &format!("/api/v1/clusters/{id}"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cluster["name"], "prod");

    let (status, listed) = request(
        &app.router,
        "GET",
        "/api/v1/clusters",
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = request(
        &app.router,
        "GET",
        "/api/v1/clusters/no-such-id",
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rotate_key_returns_a_fresh_key() {
    let app = spawn_app().await;
    let (_, created) = request(
        &app.router,
        "POST",
        "/api/v1/clusters",
        Some(&app.admin_token),
        Some(json!({ "name": "prod", "tier": "community" })),
    )
    .await;
    let id = created["cluster"]["id"].as_str().unwrap();
    let original_key = created["api_key"].as_str().unwrap();

    let (status, rotated) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{id}/rotate-key"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_key = rotated["api_key"].as_str().unwrap();
    assert_ne!(new_key, original_key);
    assert_eq!(rotated["cluster"]["key_generation"], 2);
}

#[tokio::test]
async fn delete_cluster_cascades() {
    let app = spawn_app().await;
    let (cluster_id, _key) = common::seed_cluster(&app.state, "prod").await;
    common::seed_service(&app, &cluster_id, "web", "8080", "none").await;

    let (status, _) = request(
        &app.router,
        "DELETE",
        &format!("/api/v1/clusters/{cluster_id}"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = request(
        &app.router,
        "GET",
        &format!("/api/v1/clusters/{cluster_id}"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(app.state.store.list_services(&cluster_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn service_owner_cannot_manage_keys() {
    let app = spawn_app().await;
    let (cluster_id, _key) = common::seed_cluster(&app.state, "prod").await;

    let (status, _) = request(
        &app.router,
        "POST",
        "/api/v1/users",
        Some(&app.admin_token),
        Some(json!({
            "login": "owner",
            "password": "long-enough-pw",
            "roles": [{ "cluster_id": cluster_id, "role": "service-owner" }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let owner_token = common::login(&app.router, "owner", "long-enough-pw").await;
    let (status, body) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/rotate-key"),
        Some(&owner_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "authorization");

    // The denial was audited.
    let events = app.state.audit.list(Some(&cluster_id), 100).await.unwrap();
    assert!(events.iter().any(|e| e.action == "keys.manage"));
}
