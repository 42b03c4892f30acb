//! Shared fixtures for surface tests
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use fleetplane::api::{self, AppState};
use fleetplane::audit::Actor;
use fleetplane::clusters::CreateClusterRequest;
use fleetplane::config::Config;
use fleetplane::daemon;
use fleetplane::types::Tier;

pub const ADMIN_LOGIN: &str = "admin";
pub const ADMIN_PASSWORD: &str = "bootstrap-secret";

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub admin_token: String,
}

fn test_config() -> Config {
    Config {
        initial_admin_password: Some(ADMIN_PASSWORD.to_string()),
        // Generous limits so surface tests never trip the limiter.
        rate_limit_per_sec: 10_000,
        rate_limit_burst: 10_000,
        ..Config::default()
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(test_config()).await
}

pub async fn spawn_app_with(config: Config) -> TestApp {
    let state = daemon::build_state(config).await.expect("state builds");
    let router = api::router(state.clone());
    let admin_token = login(&router, ADMIN_LOGIN, ADMIN_PASSWORD).await;
    TestApp {
        router,
        state,
        admin_token,
    }
}

pub async fn request(
    router: &Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

pub async fn login(router: &Router, login: &str, password: &str) -> String {
    let (status, body) = request(
        router,
        "POST",
        "/api/v1/auth/login",
        None,
        Some(json!({ "login": login, "password": password })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["access_token"].as_str().unwrap().to_string()
}

/// Create a cluster through the entity layer and return `(id, api_key)`.
pub async fn seed_cluster(state: &Arc<AppState>, name: &str) -> (String, String) {
    let created = state
        .clusters
        .create(
            &Actor::System,
            CreateClusterRequest::builder()
                .name(name)
                .tier(Tier::Community)
                .build(),
        )
        .await
        .expect("cluster creates");
    (created.cluster.id, created.api_key)
}

/// Create a basic HTTP service via the API and return its JSON.
pub async fn seed_service(
    app: &TestApp,
    cluster_id: &str,
    name: &str,
    ports: &str,
    auth_mode: &str,
) -> Value {
    let (status, body) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/services"),
        Some(&app.admin_token),
        Some(json!({
            "name": name,
            "address": "10.0.0.7",
            "ports": ports,
            "protocol": "http",
            "auth_mode": auth_mode,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "service create failed: {body}");
    body
}
