//! Certificate authority surface tests: rotation overlap and revocation

mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use common::{request, seed_cluster, spawn_app};
use fleetplane::ca::CaStatus;

#[tokio::test]
async fn rotation_keeps_both_trust_anchors_until_overlap_ends() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;

    // A proxy holds a certificate issued by the original CA.
    let (status, registered) = request(
        &app.router,
        "POST",
        "/api/v1/proxies/register",
        Some(&api_key),
        Some(serde_json::json!({ "kind": "l7", "software_version": "1.0.0" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let cert_id = registered["proxy"]["certificate_id"].as_str().unwrap().to_string();

    let version_before = app.state.hub.current(&cluster_id).unwrap().version.clone();

    let (status, rotated) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/ca/rotate"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(rotated["status"], "active");

    // Both anchors are published and pushed through the snapshot.
    let anchors = app.state.ca.trust_anchors(&cluster_id).await.unwrap();
    assert_eq!(anchors.len(), 2);
    let snapshot = app.state.hub.current(&cluster_id).unwrap();
    assert_ne!(snapshot.version, version_before);
    assert_eq!(snapshot.resources.secrets.trust_anchors.len(), 2);

    // The old certificate still verifies during the overlap.
    assert!(app
        .state
        .ca
        .certificate_is_current(&cluster_id, &cert_id)
        .await
        .unwrap());

    // A second rotation while one is pending conflicts.
    let (status, _) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/ca/rotate"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // After the overlap elapses the retiring anchor drops out and the
    // snapshot version moves again.
    let cas = app.state.store.list_cas(&cluster_id).await.unwrap();
    for mut ca in cas {
        if ca.status == CaStatus::Retiring {
            ca.rotated_at = Some(Utc::now() - Duration::days(61));
            app.state.store.update_ca(ca).await.unwrap();
        }
    }
    let anchors = app.state.ca.trust_anchors(&cluster_id).await.unwrap();
    assert_eq!(anchors.len(), 1);

    let refreshed = app.state.hub.refresh(&cluster_id).await.unwrap();
    assert_ne!(refreshed.version, snapshot.version);
    assert_eq!(refreshed.resources.secrets.trust_anchors.len(), 1);
}

#[tokio::test]
async fn certificate_revocation_is_idempotent_and_reflected_in_snapshots() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;
    let (_, registered) = request(
        &app.router,
        "POST",
        "/api/v1/proxies/register",
        Some(&api_key),
        Some(serde_json::json!({ "kind": "l3l4", "software_version": "0.9.1" })),
    )
    .await;
    let cert_id = registered["proxy"]["certificate_id"].as_str().unwrap().to_string();

    let snapshot = app.state.hub.current(&cluster_id).unwrap();
    assert!(snapshot
        .resources
        .secrets
        .certificate_handles
        .contains(&cert_id));

    for _ in 0..2 {
        let (status, _) = request(
            &app.router,
            "POST",
            &format!("/api/v1/clusters/{cluster_id}/certs/{cert_id}/revoke"),
            Some(&app.admin_token),
            Some(serde_json::json!({ "reason": "compromised" })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    // One CRL entry despite two calls.
    assert_eq!(app.state.ca.crl(&cluster_id).await.unwrap().len(), 1);

    // The snapshot no longer references the revoked handle.
    let snapshot = app.state.hub.current(&cluster_id).unwrap();
    assert!(!snapshot
        .resources
        .secrets
        .certificate_handles
        .contains(&cert_id));
}

#[tokio::test]
async fn issued_server_certificate_feeds_the_secrets_bundle() {
    let app = spawn_app().await;
    let (cluster_id, _) = seed_cluster(&app.state, "prod").await;

    let (status, issued) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/certs/server"),
        Some(&app.admin_token),
        Some(serde_json::json!({
            "subject": "edge.prod.internal",
            "sans": ["edge.prod.internal", "10.0.0.1"],
            "validity_days": 90,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{issued}");
    assert!(issued["certificate_pem"].as_str().unwrap().contains("BEGIN CERTIFICATE"));
    assert!(issued["private_key_pem"].as_str().unwrap().contains("PRIVATE KEY"));
    let handle = issued["record"]["id"].as_str().unwrap().to_string();

    let snapshot = app.state.hub.current(&cluster_id).unwrap();
    assert!(snapshot
        .resources
        .secrets
        .certificate_handles
        .contains(&handle));
}

#[tokio::test]
async fn certificate_listing_shows_monotone_serials() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;
    for _ in 0..3 {
        let (status, _) = request(
            &app.router,
            "POST",
            "/api/v1/proxies/register",
            Some(&api_key),
            Some(serde_json::json!({ "kind": "l7", "software_version": "1.0.0" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, certs) = request(
        &app.router,
        "GET",
        &format!("/api/v1/clusters/{cluster_id}/certs"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let serials: Vec<u64> = certs
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["serial"].as_u64().unwrap())
        .collect();
    assert_eq!(serials, vec![1, 2, 3]);
}
