//! Discovery stream server
//!
//! One lightweight task per subscriber stream. Each task blocks on the
//! cluster's snapshot watch channel and on inbound frames; pushes are
//! delivered in version order per stream. Stream close is final: the
//! subscriber reconnects and re-expresses its subscriptions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audit::{Actor, AuditLog, AuditOutcome};
use crate::error::{ControlError, Result};
use crate::sessions::{ProxyTokenRecord, SessionManager};
use crate::snapshot::{ResourceType, Snapshot, SnapshotHub};

use super::wire::{self, DiscoveryResponse, Frame, Resources};

/// How long a fresh connection has to present its `Hello`.
const HELLO_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DiscoveryLimits {
    pub max_streams_per_cluster: usize,
    pub heartbeat_interval: Duration,
    pub miss_threshold: u32,
}

struct Subscription {
    last_sent: Option<String>,
    last_acked: Option<String>,
}

pub struct DiscoveryServer {
    sessions: Arc<SessionManager>,
    hub: Arc<SnapshotHub>,
    audit: Arc<AuditLog>,
    limits: DiscoveryLimits,
    stream_counts: DashMap<String, usize>,
}

impl DiscoveryServer {
    pub fn new(
        sessions: Arc<SessionManager>,
        hub: Arc<SnapshotHub>,
        audit: Arc<AuditLog>,
        limits: DiscoveryLimits,
    ) -> Self {
        DiscoveryServer {
            sessions,
            hub,
            audit,
            limits,
            stream_counts: DashMap::new(),
        }
    }

    /// Accept loop; runs until the listener errors.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "discovery listener up");
        loop {
            let (socket, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                debug!(%peer, "discovery stream opened");
                if let Err(err) = server.clone().handle_stream(socket).await {
                    debug!(%peer, error = %err, "discovery stream ended");
                }
            });
        }
    }

    async fn handle_stream(self: Arc<Self>, socket: TcpStream) -> Result<()> {
        let mut framed = wire::framed(socket);

        // Initial metadata: the proxy token, within a bounded window.
        let hello = tokio::time::timeout(HELLO_DEADLINE, framed.next())
            .await
            .map_err(|_| ControlError::validation("no hello before deadline"))?
            .ok_or_else(|| ControlError::validation("stream closed before hello"))??;
        let token = match wire::decode(&hello)? {
            Frame::Hello { token } => token,
            _ => {
                let frame = wire::encode(&Frame::GoAway {
                    reason: "expected hello".into(),
                })?;
                let _ = framed.send(frame).await;
                return Err(ControlError::validation("first frame was not hello"));
            }
        };
        let identity = match self.sessions.verify_proxy_token(&token).await {
            Ok(identity) => identity,
            Err(err) => {
                counter!("fleetplane_discovery_auth_failures_total").increment(1);
                let frame = wire::encode(&Frame::GoAway {
                    reason: err.to_string(),
                })?;
                let _ = framed.send(frame).await;
                return Err(err);
            }
        };
        let cluster_id = identity.cluster_id.clone();

        if !self.try_admit(&cluster_id) {
            counter!("fleetplane_discovery_overload_total").increment(1);
            let frame = wire::encode(&Frame::GoAway {
                reason: "stream limit for cluster reached".into(),
            })?;
            let _ = framed.send(frame).await;
            return Err(ControlError::Overload(format!(
                "cluster {cluster_id} at stream limit"
            )));
        }
        let result = self.serve_stream(&mut framed, &identity).await;
        self.release(&cluster_id);
        result
    }

    fn try_admit(&self, cluster_id: &str) -> bool {
        let mut count = self.stream_counts.entry(cluster_id.to_string()).or_insert(0);
        if *count >= self.limits.max_streams_per_cluster {
            return false;
        }
        *count += 1;
        gauge!("fleetplane_discovery_streams", "cluster" => cluster_id.to_string())
            .set(*count as f64);
        true
    }

    fn release(&self, cluster_id: &str) {
        if let Some(mut count) = self.stream_counts.get_mut(cluster_id) {
            *count = count.saturating_sub(1);
            gauge!("fleetplane_discovery_streams", "cluster" => cluster_id.to_string())
                .set(*count as f64);
        }
    }

    async fn serve_stream(
        &self,
        framed: &mut tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        identity: &ProxyTokenRecord,
    ) -> Result<()> {
        let mut pinned: Option<String> = None;
        let result = self.stream_loop(framed, identity, &mut pinned).await;
        if let Some(version) = pinned {
            self.hub.unpin(&identity.cluster_id, &version);
        }
        result
    }

    async fn stream_loop(
        &self,
        framed: &mut tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        identity: &ProxyTokenRecord,
        pinned: &mut Option<String>,
    ) -> Result<()> {
        let cluster_id = identity.cluster_id.clone();
        let mut watch_rx = self.hub.subscribe(&cluster_id).await?;
        let mut subscriptions: HashMap<ResourceType, Subscription> = HashMap::new();

        let mut keepalive = tokio::time::interval_at(
            Instant::now() + self.limits.heartbeat_interval,
            self.limits.heartbeat_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut unanswered_pings: u32 = 0;

        loop {
            tokio::select! {
                changed = watch_rx.changed() => {
                    if changed.is_err() {
                        // Cluster deleted; close is final.
                        let frame = wire::encode(&Frame::GoAway { reason: "cluster removed".into() })?;
                        let _ = framed.send(frame).await;
                        return Ok(());
                    }
                    let snapshot = watch_rx.borrow_and_update().clone();
                    self.push(framed, &snapshot, &mut subscriptions).await?;
                }
                inbound = framed.next() => {
                    let Some(bytes) = inbound else {
                        return Ok(());
                    };
                    let bytes = bytes?;
                    unanswered_pings = 0;
                    match wire::decode(&bytes)? {
                        Frame::Subscribe(request) => {
                            subscriptions.insert(request.resource_type, Subscription {
                                last_sent: None,
                                last_acked: request.last_acked_version,
                            });
                            let snapshot = watch_rx.borrow_and_update().clone();
                            self.push(framed, &snapshot, &mut subscriptions).await?;
                        }
                        Frame::Ack(ack) => {
                            counter!("fleetplane_discovery_acks_total").increment(1);
                            if let Some(sub) = subscriptions.get_mut(&ack.resource_type) {
                                sub.last_acked = Some(ack.version.clone());
                            }
                            // Keep the acked version resident until the
                            // subscriber moves on.
                            if pinned.as_deref() != Some(ack.version.as_str()) {
                                if let Some(old) = pinned.take() {
                                    self.hub.unpin(&cluster_id, &old);
                                }
                                self.hub.pin(&cluster_id, &ack.version);
                                *pinned = Some(ack.version);
                            }
                        }
                        Frame::Nack(nack) => {
                            counter!("fleetplane_discovery_nacks_total").increment(1);
                            warn!(
                                cluster = %cluster_id,
                                proxy = %identity.proxy_id,
                                version = %nack.version,
                                error = %nack.error,
                                "subscriber nacked configuration"
                            );
                            // No retraction: the version stays pending and
                            // the lag is the operator's signal.
                            self.audit
                                .record(
                                    Actor::Proxy(identity.proxy_id.clone()),
                                    Some(&cluster_id),
                                    "discovery.nack",
                                    None,
                                    None,
                                    AuditOutcome::Failed,
                                )
                                .await;
                        }
                        Frame::Ping => {
                            framed.send(wire::encode(&Frame::Pong)?).await?;
                        }
                        Frame::Pong => {}
                        Frame::Hello { .. } | Frame::Response(_) | Frame::GoAway { .. } => {
                            let frame = wire::encode(&Frame::GoAway {
                                reason: "unexpected frame".into(),
                            })?;
                            let _ = framed.send(frame).await;
                            return Err(ControlError::validation("unexpected frame on stream"));
                        }
                    }
                }
                _ = keepalive.tick() => {
                    // A subscriber stuck behind the pushed version shows up
                    // as configuration lag.
                    let lagging = subscriptions
                        .values()
                        .filter(|s| s.last_sent.is_some() && s.last_acked != s.last_sent)
                        .count();
                    gauge!(
                        "fleetplane_discovery_lagging_subscriptions",
                        "proxy" => identity.proxy_id.clone()
                    )
                    .set(lagging as f64);

                    // Token expiry boundary: rotation past overlap and
                    // revocation both close the stream here.
                    if let Err(err) = self.sessions.verify_proxy_token_record(identity).await {
                        let frame = wire::encode(&Frame::GoAway { reason: err.to_string() })?;
                        let _ = framed.send(frame).await;
                        return Err(err);
                    }
                    if unanswered_pings >= self.limits.miss_threshold {
                        let frame = wire::encode(&Frame::GoAway { reason: "keep-alive missed".into() })?;
                        let _ = framed.send(frame).await;
                        return Err(ControlError::Unavailable("subscriber unresponsive".into()));
                    }
                    framed.send(wire::encode(&Frame::Ping)?).await?;
                    unanswered_pings += 1;
                }
            }
        }
    }

    async fn push(
        &self,
        framed: &mut tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        snapshot: &Arc<Snapshot>,
        subscriptions: &mut HashMap<ResourceType, Subscription>,
    ) -> Result<()> {
        let started = std::time::Instant::now();
        for resource_type in ResourceType::ALL {
            let Some(sub) = subscriptions.get_mut(&resource_type) else {
                continue;
            };
            // Per-stream versions are monotone: never re-send a version
            // already delivered on this stream.
            if sub.last_sent.as_deref() == Some(snapshot.version.as_str()) {
                continue;
            }
            let resources = match resource_type {
                ResourceType::Listeners => {
                    Resources::Listeners(snapshot.resources.listeners.clone())
                }
                ResourceType::Routes => Resources::Routes(snapshot.resources.routes.clone()),
                ResourceType::Clusters => {
                    Resources::Clusters(snapshot.resources.clusters.clone())
                }
                ResourceType::Endpoints => {
                    Resources::Endpoints(snapshot.resources.endpoints.clone())
                }
            };
            let response = Frame::Response(DiscoveryResponse {
                resource_type,
                version: snapshot.version.clone(),
                resources,
                secrets: snapshot.resources.secrets.clone(),
            });
            framed.send(wire::encode(&response)?).await?;
            sub.last_sent = Some(snapshot.version.clone());
            counter!("fleetplane_discovery_pushes_total").increment(1);
        }
        histogram!("fleetplane_discovery_push_seconds").record(started.elapsed().as_secs_f64());
        Ok(())
    }
}
