//! Service endpoint tests: validation, optimistic updates, cascade deletes

mod common;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{request, seed_cluster, seed_service, spawn_app};

#[tokio::test]
async fn created_service_reads_back_with_the_same_spec() {
    let app = spawn_app().await;
    let (cluster_id, _) = seed_cluster(&app.state, "prod").await;
    let created = seed_service(&app, &cluster_id, "web", "80,8000-8010", "none").await;
    let sid = created["id"].as_str().unwrap();

    let (status, fetched) = request(
        &app.router,
        "GET",
        &format!("/api/v1/clusters/{cluster_id}/services/{sid}"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "web");
    assert_eq!(fetched["address"], "10.0.0.7");
    assert_eq!(fetched["protocol"], "http");
    assert_eq!(fetched["auth_mode"], "none");
    assert_eq!(fetched["version"], 1);
}

#[tokio::test]
async fn port_grammar_boundaries() {
    let app = spawn_app().await;
    let (cluster_id, _) = seed_cluster(&app.state, "prod").await;

    for (ports, expected) in [
        ("80", StatusCode::CREATED),
        ("80-90", StatusCode::CREATED),
        ("80,443", StatusCode::CREATED),
        ("80,8000-8010", StatusCode::CREATED),
        ("", StatusCode::BAD_REQUEST),
        ("80-", StatusCode::BAD_REQUEST),
        ("-80", StatusCode::BAD_REQUEST),
        ("90-80", StatusCode::BAD_REQUEST),
        ("0", StatusCode::BAD_REQUEST),
        ("65536", StatusCode::BAD_REQUEST),
    ] {
        let name = format!("svc-{}", ports.replace([',', '-'], "x"));
        let (status, body) = request(
            &app.router,
            "POST",
            &format!("/api/v1/clusters/{cluster_id}/services"),
            Some(&app.admin_token),
            Some(json!({
                "name": name,
                "address": "10.0.0.7",
                "ports": ports,
                "protocol": "tcp",
            })),
        )
        .await;
        assert_eq!(status, expected, "ports `{ports}`: {body}");
        if expected == StatusCode::BAD_REQUEST {
            assert_eq!(body["error"]["kind"], "validation");
            assert_eq!(body["error"]["details"][0]["field"], "ports");
        }
    }
}

#[tokio::test]
async fn bearer_auth_on_raw_protocol_is_rejected() {
    let app = spawn_app().await;
    let (cluster_id, _) = seed_cluster(&app.state, "prod").await;
    let (status, body) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/services"),
        Some(&app.admin_token),
        Some(json!({
            "name": "ping",
            "address": "10.0.0.7",
            "ports": "7",
            "protocol": "icmp",
            "auth_mode": "bearer_jwt",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation");
}

#[tokio::test]
async fn duplicate_service_name_in_cluster_conflicts() {
    let app = spawn_app().await;
    let (cluster_id, _) = seed_cluster(&app.state, "prod").await;
    seed_service(&app, &cluster_id, "web", "80", "none").await;

    let (status, _) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/services"),
        Some(&app.admin_token),
        Some(json!({
            "name": "web",
            "address": "10.0.0.8",
            "ports": "81",
            "protocol": "http",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn stale_update_returns_current_version_and_keeps_winner() {
    let app = spawn_app().await;
    let (cluster_id, _) = seed_cluster(&app.state, "prod").await;
    let created = seed_service(&app, &cluster_id, "web", "8080", "none").await;
    let sid = created["id"].as_str().unwrap();

    // Operator A wins.
    let (status, updated) = request(
        &app.router,
        "PUT",
        &format!("/api/v1/clusters/{cluster_id}/services/{sid}"),
        Some(&app.admin_token),
        Some(json!({ "expected_version": 1, "address": "10.0.0.21" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["version"], 2);

    // Operator B replays the same expected version and loses.
    let (status, body) = request(
        &app.router,
        "PUT",
        &format!("/api/v1/clusters/{cluster_id}/services/{sid}"),
        Some(&app.admin_token),
        Some(json!({ "expected_version": 1, "address": "10.0.0.99" })),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["error"]["kind"], "conflict");
    assert_eq!(body["error"]["details"][0]["message"], "current version is 2");

    // The stored state reflects only the winner.
    let (_, fetched) = request(
        &app.router,
        "GET",
        &format!("/api/v1/clusters/{cluster_id}/services/{sid}"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(fetched["address"], "10.0.0.21");
    assert_eq!(fetched["version"], 2);
}

#[tokio::test]
async fn delete_in_use_requires_cascade() {
    let app = spawn_app().await;
    let (cluster_id, _) = seed_cluster(&app.state, "prod").await;
    let ext = seed_service(&app, &cluster_id, "ext", "80", "none").await;
    let web = seed_service(&app, &cluster_id, "web", "8080", "none").await;
    let web_id = web["id"].as_str().unwrap();

    let (status, _) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/mappings"),
        Some(&app.admin_token),
        Some(json!({
            "sources": [ext["id"]],
            "destinations": [web_id],
            "protocols": ["tcp"],
            "ports": "80",
            "auth_required": false,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Plain delete conflicts while the mapping references the service.
    let (status, body) = request(
        &app.router,
        "DELETE",
        &format!("/api/v1/clusters/{cluster_id}/services/{web_id}"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    // Cascade removes the service and rewrites the mapping away.
    let (status, _) = request(
        &app.router,
        "DELETE",
        &format!("/api/v1/clusters/{cluster_id}/services/{web_id}?cascade=true"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.state.store.list_mappings(&cluster_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn every_successful_mutation_appends_one_audit_event() {
    let app = spawn_app().await;
    let (cluster_id, _) = seed_cluster(&app.state, "prod").await;
    let baseline = app
        .state
        .audit
        .list(Some(&cluster_id), 1000)
        .await
        .unwrap()
        .len();

    seed_service(&app, &cluster_id, "web", "8080", "none").await;

    let events = app.state.audit.list(Some(&cluster_id), 1000).await.unwrap();
    let created: Vec<_> = events
        .iter()
        .filter(|e| e.action == "service.create")
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(events.len(), baseline + 1);

    // Sequence numbers are strictly increasing.
    let all = app.state.audit.list(None, 10_000).await.unwrap();
    for pair in all.windows(2) {
        assert!(pair[1].sequence > pair[0].sequence);
    }
}
