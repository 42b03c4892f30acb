//! Discovery stream tests over real TCP

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use common::{TestApp, request, seed_cluster, seed_service, spawn_app};
use fleetplane::discovery::wire::{self, Frame, SubscribeRequest};
use fleetplane::discovery::{DiscoveryLimits, DiscoveryServer};
use fleetplane::snapshot::ResourceType;

const PUSH_DEADLINE: Duration = Duration::from_secs(2);

async fn start_discovery(app: &TestApp) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(DiscoveryServer::new(
        app.state.sessions.clone(),
        app.state.hub.clone(),
        app.state.audit.clone(),
        DiscoveryLimits {
            max_streams_per_cluster: 4,
            heartbeat_interval: Duration::from_secs(1),
            miss_threshold: 3,
        },
    ));
    tokio::spawn(server.run(listener));
    addr
}

async fn connect(addr: SocketAddr, token: &str) -> Framed<TcpStream, LengthDelimitedCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = wire::framed(stream);
    framed
        .send(
            wire::encode(&Frame::Hello {
                token: token.to_string(),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    framed
}

async fn subscribe(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    resource_type: ResourceType,
) {
    framed
        .send(
            wire::encode(&Frame::Subscribe(SubscribeRequest {
                resource_type,
                resource_names: vec![],
                last_acked_version: None,
            }))
            .unwrap(),
        )
        .await
        .unwrap();
}

/// Next frame that is not a keep-alive ping; pings are answered so the
/// server does not count the test client as unresponsive.
async fn next_frame(framed: &mut Framed<TcpStream, LengthDelimitedCodec>) -> Option<Frame> {
    loop {
        let bytes = tokio::time::timeout(PUSH_DEADLINE, framed.next())
            .await
            .ok()??
            .ok()?;
        match wire::decode(&bytes).ok()? {
            Frame::Ping => {
                framed.send(wire::encode(&Frame::Pong).ok()?).await.ok()?;
            }
            frame => return Some(frame),
        }
    }
}

async fn register_proxy(app: &TestApp, api_key: &str) -> (String, String) {
    let (status, body) = request(
        &app.router,
        "POST",
        "/api/v1/proxies/register",
        Some(api_key),
        Some(json!({ "kind": "l7", "software_version": "1.0.0" })),
    )
    .await;
    assert_eq!(status, axum::http::StatusCode::CREATED, "{body}");
    (
        body["proxy"]["id"].as_str().unwrap().to_string(),
        body["proxy_token"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn create_and_distribute_end_to_end() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;
    let ext = seed_service(&app, &cluster_id, "ext", "80", "none").await;
    let web = seed_service(&app, &cluster_id, "web", "8080", "none").await;
    let (status, _) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/mappings"),
        Some(&app.admin_token),
        Some(json!({
            "sources": [ext["id"]],
            "destinations": [web["id"]],
            "protocols": ["tcp"],
            "ports": "80",
        })),
    )
    .await;
    assert_eq!(status, axum::http::StatusCode::CREATED);

    let (_proxy_id, token) = register_proxy(&app, &api_key).await;
    let addr = start_discovery(&app).await;
    let mut framed = connect(addr, &token).await;

    let expected_version = app.state.hub.current(&cluster_id).unwrap().version.clone();

    for resource_type in ResourceType::ALL {
        subscribe(&mut framed, resource_type).await;
        let frame = next_frame(&mut framed).await.expect("a discovery response");
        let Frame::Response(response) = frame else {
            panic!("expected a response, got {frame:?}");
        };
        assert_eq!(response.resource_type, resource_type);
        assert_eq!(response.version, expected_version);
        assert!(!response.secrets.trust_anchors.is_empty());
    }
}

#[tokio::test]
async fn version_changes_are_pushed_in_order() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;
    seed_service(&app, &cluster_id, "web", "8080", "none").await;

    let (_proxy_id, token) = register_proxy(&app, &api_key).await;
    let addr = start_discovery(&app).await;
    let mut framed = connect(addr, &token).await;

    subscribe(&mut framed, ResourceType::Clusters).await;
    let Some(Frame::Response(first)) = next_frame(&mut framed).await else {
        panic!("no initial push");
    };

    framed
        .send(
            wire::encode(&Frame::Ack(wire::AckFrame {
                resource_type: ResourceType::Clusters,
                version: first.version.clone(),
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    // A deployable change triggers a push with the new version.
    seed_service(&app, &cluster_id, "api", "9000", "none").await;
    let Some(Frame::Response(second)) = next_frame(&mut framed).await else {
        panic!("no push after change");
    };
    assert_ne!(second.version, first.version);
    assert_eq!(
        second.version,
        app.state.hub.current(&cluster_id).unwrap().version
    );

    // Another change, another strictly newer push; never a repeat.
    seed_service(&app, &cluster_id, "cache", "6379", "none").await;
    let Some(Frame::Response(third)) = next_frame(&mut framed).await else {
        panic!("no second push");
    };
    assert_ne!(third.version, second.version);
}

#[tokio::test]
async fn nack_is_audited_and_not_retracted() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;
    let (proxy_id, token) = register_proxy(&app, &api_key).await;
    let addr = start_discovery(&app).await;
    let mut framed = connect(addr, &token).await;

    subscribe(&mut framed, ResourceType::Listeners).await;
    let Some(Frame::Response(response)) = next_frame(&mut framed).await else {
        panic!("no initial push");
    };

    framed
        .send(
            wire::encode(&Frame::Nack(wire::NackFrame {
                resource_type: ResourceType::Listeners,
                version: response.version.clone(),
                error: "cannot bind port".to_string(),
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    // The nack lands in the audit trail attributed to the proxy.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let events = app.state.audit.list(Some(&cluster_id), 100).await.unwrap();
    let nacks: Vec<_> = events.iter().filter(|e| e.action == "discovery.nack").collect();
    assert_eq!(nacks.len(), 1);
    assert_eq!(
        nacks[0].actor,
        fleetplane::audit::Actor::Proxy(proxy_id.clone())
    );

    // The stream stays open; the next change still arrives.
    seed_service(&app, &cluster_id, "web", "8080", "none").await;
    let Some(Frame::Response(after)) = next_frame(&mut framed).await else {
        panic!("no push after nack");
    };
    assert_ne!(after.version, response.version);
}

#[tokio::test]
async fn bad_token_gets_goaway() {
    let app = spawn_app().await;
    seed_cluster(&app.state, "prod").await;
    let addr = start_discovery(&app).await;
    let mut framed = connect(addr, "fpp_bogus").await;

    match next_frame(&mut framed).await {
        Some(Frame::GoAway { .. }) | None => {}
        other => panic!("expected goaway or close, got {other:?}"),
    }
}

#[tokio::test]
async fn rotation_past_overlap_closes_the_stream_on_keepalive() {
    let app = spawn_app().await;
    let (cluster_id, api_key) = seed_cluster(&app.state, "prod").await;
    let (_proxy_id, token) = register_proxy(&app, &api_key).await;
    let addr = start_discovery(&app).await;
    let mut framed = connect(addr, &token).await;

    subscribe(&mut framed, ResourceType::Endpoints).await;
    assert!(matches!(
        next_frame(&mut framed).await,
        Some(Frame::Response(_))
    ));

    // Rotate the cluster key and expire the overlap window.
    let (status, _) = request(
        &app.router,
        "POST",
        &format!("/api/v1/clusters/{cluster_id}/rotate-key"),
        Some(&app.admin_token),
        None,
    )
    .await;
    assert_eq!(status, axum::http::StatusCode::OK);
    let mut cluster = app.state.store.get_cluster(&cluster_id).await.unwrap();
    cluster.key_rotated_at = Some(Utc::now() - chrono::Duration::days(61));
    app.state.store.update_cluster(cluster).await.unwrap();

    // The next token re-validation (1 s keep-alive) terminates the stream.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("stream not closed after rotation");
        }
        match tokio::time::timeout(remaining, framed.next()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(Ok(bytes))) => match wire::decode(&bytes) {
                Ok(Frame::GoAway { .. }) => break,
                _ => continue,
            },
            Ok(Some(Err(_))) => break,
        }
    }
}
