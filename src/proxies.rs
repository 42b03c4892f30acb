//! Data-plane proxy registrations
//!
//! ## Overview
//! - Bootstrap: cluster API key in, proxy token and client certificate out
//! - License-gated admission; denials leave no registration row behind
//! - Heartbeat liveness with `registering → active → stale` transitions
//! - Operator revocation cuts the token, the certificate, and the stream

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use typed_builder::TypedBuilder;

use crate::audit::{Actor, AuditLog, entity_hash};
use crate::ca::CertificateAuthority;
use crate::clusters::ClusterService;
use crate::error::{ControlError, Result};
use crate::license::{LicenseGate, LicenseRequest};
use crate::sessions::SessionManager;
use crate::snapshot::SnapshotHub;
use crate::store::Store;
use crate::types::{ProxyKind, ProxyStatus};

/// Client certificates issued at registration run for 30 days; proxies
/// re-register to roll them.
const PROXY_CERT_VALIDITY: std::time::Duration =
    std::time::Duration::from_secs(30 * 86_400);

/// One data-plane instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRegistration {
    pub id: String,
    pub cluster_id: String,
    pub kind: ProxyKind,
    pub capabilities: Vec<String>,
    pub software_version: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: ProxyStatus,
    /// Latest self-reported status tag from the data plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_status: Option<String>,
    /// Latest metric samples, surfaced on dashboards only; the
    /// authoritative series lives in the metrics backend.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub reported_metrics: Value,
    pub certificate_id: String,
    pub key_generation: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TypedBuilder)]
pub struct RegisterProxyRequest {
    pub kind: ProxyKind,
    #[serde(default)]
    #[builder(default)]
    pub capabilities: Vec<String>,
    #[builder(setter(into))]
    pub software_version: String,
}

/// Registration response: the proxy token and client-certificate key pair
/// appear here exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredProxy {
    pub proxy: ProxyRegistration,
    pub proxy_token: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub trust_anchors: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, TypedBuilder)]
pub struct HeartbeatRequest {
    /// Free-form status tag reported by the data plane.
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub status: Option<String>,
    /// Non-authoritative metric samples surfaced on dashboards; the
    /// authoritative series lives in the metrics backend.
    #[serde(default)]
    #[builder(default)]
    pub metrics: Value,
}

pub struct ProxyService {
    store: Arc<dyn Store>,
    license: Arc<LicenseGate>,
    ca: Arc<CertificateAuthority>,
    sessions: Arc<SessionManager>,
    clusters: Arc<ClusterService>,
    hub: Arc<SnapshotHub>,
    audit: Arc<AuditLog>,
    heartbeat_deadline: Duration,
}

impl ProxyService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        license: Arc<LicenseGate>,
        ca: Arc<CertificateAuthority>,
        sessions: Arc<SessionManager>,
        clusters: Arc<ClusterService>,
        hub: Arc<SnapshotHub>,
        audit: Arc<AuditLog>,
        heartbeat_interval: std::time::Duration,
        miss_threshold: u32,
    ) -> Self {
        let deadline = heartbeat_interval * miss_threshold.max(1);
        ProxyService {
            store,
            license,
            ca,
            sessions,
            clusters,
            hub,
            audit,
            heartbeat_deadline: Duration::from_std(deadline)
                .unwrap_or_else(|_| Duration::seconds(90)),
        }
    }

    /// Bootstrap a data-plane instance.
    pub async fn register(
        &self,
        api_key: &str,
        request: RegisterProxyRequest,
    ) -> Result<RegisteredProxy> {
        let (cluster, key_generation) = self
            .clusters
            .authenticate_key(&self.sessions, api_key)
            .await?;

        let admitted = self.store.count_quota_proxies(&cluster.id).await?;
        if let Err(err) = self
            .license
            .check(&cluster.id, LicenseRequest::RegisterProxy { admitted })
            .await
        {
            self.audit
                .denied(Actor::System, Some(&cluster.id), "proxy.register")
                .await;
            return Err(err);
        }

        let proxy_id = uuid::Uuid::new_v4().to_string();
        let issued = self
            .ca
            .issue_client(&cluster.id, &format!("proxy-{proxy_id}"), PROXY_CERT_VALIDITY)
            .await?;
        self.audit
            .success(
                Actor::Proxy(proxy_id.clone()),
                Some(&cluster.id),
                "certificate.issue",
                Some(entity_hash(&issued.record)),
            )
            .await;

        let proxy = ProxyRegistration {
            id: proxy_id.clone(),
            cluster_id: cluster.id.clone(),
            kind: request.kind,
            capabilities: request.capabilities,
            software_version: request.software_version,
            last_seen: None,
            status: ProxyStatus::Registering,
            reported_status: None,
            reported_metrics: Value::Null,
            certificate_id: issued.record.id.clone(),
            key_generation,
            version: 1,
            created_at: Utc::now(),
        };
        let proxy = self.store.insert_proxy(proxy).await?;
        let proxy_token = self
            .sessions
            .issue_proxy_token(&proxy.id, &cluster.id, key_generation)
            .await?;
        let trust_anchors = self.ca.trust_anchors(&cluster.id).await?;

        // New certificate handle lands in the secrets sub-bundle.
        self.hub.refresh(&cluster.id).await?;

        info!(cluster = %cluster.name, proxy = %proxy.id, "registered proxy");
        self.audit
            .success(
                Actor::Proxy(proxy.id.clone()),
                Some(&cluster.id),
                "proxy.register",
                Some(entity_hash(&proxy)),
            )
            .await;
        Ok(RegisteredProxy {
            proxy,
            proxy_token,
            certificate_pem: issued.certificate_pem,
            private_key_pem: issued.private_key_pem,
            trust_anchors,
        })
    }

    /// Liveness report. Identical payloads are idempotent apart from the
    /// advancing `last_seen`; heartbeats do not produce audit events.
    pub async fn heartbeat(&self, proxy_token: &str, request: HeartbeatRequest) -> Result<()> {
        let token = self.sessions.verify_proxy_token(proxy_token).await?;
        let mut proxy = self.store.get_proxy(&token.proxy_id).await?;
        match proxy.status {
            ProxyStatus::Revoked => return Err(ControlError::TokenRevoked),
            ProxyStatus::Registering | ProxyStatus::Stale => {
                proxy.status = ProxyStatus::Active;
            }
            ProxyStatus::Active => {}
        }
        proxy.last_seen = Some(Utc::now());
        if request.status.is_some() {
            proxy.reported_status = request.status;
        }
        if !request.metrics.is_null() {
            proxy.reported_metrics = request.metrics;
        }
        self.store.update_proxy(proxy).await?;
        Ok(())
    }

    pub async fn get(&self, cluster_id: &str, id: &str) -> Result<ProxyRegistration> {
        let proxy = self.store.get_proxy(id).await?;
        if proxy.cluster_id != cluster_id {
            return Err(ControlError::NotFound(format!("proxy {id}")));
        }
        Ok(proxy)
    }

    pub async fn list(&self, cluster_id: &str) -> Result<Vec<ProxyRegistration>> {
        self.store.get_cluster(cluster_id).await?;
        self.store.list_proxies(cluster_id).await
    }

    /// Operator revocation: the registration, its token, and its client
    /// certificate all stop working; the discovery stream closes on its
    /// next keep-alive.
    pub async fn revoke(&self, actor: &Actor, cluster_id: &str, id: &str) -> Result<()> {
        let mut proxy = self.get(cluster_id, id).await?;
        if proxy.status == ProxyStatus::Revoked {
            return Ok(());
        }
        let before = entity_hash(&proxy);
        proxy.status = ProxyStatus::Revoked;
        let proxy = self.store.update_proxy(proxy).await?;
        self.sessions.revoke_proxy_tokens(&proxy.id).await?;
        self.ca
            .revoke(cluster_id, &proxy.certificate_id, "operator revocation")
            .await?;
        self.hub.refresh(cluster_id).await?;
        self.audit
            .record(
                actor.clone(),
                Some(cluster_id),
                "proxy.revoke",
                Some(before),
                Some(entity_hash(&proxy)),
                crate::audit::AuditOutcome::Success,
            )
            .await;
        Ok(())
    }

    /// Background sweep: active proxies past the heartbeat deadline turn
    /// stale.
    pub async fn sweep_stale(&self) -> Result<u32> {
        let now = Utc::now();
        let mut transitioned = 0;
        for cluster in self.store.list_clusters().await? {
            for proxy in self.store.list_proxies(&cluster.id).await? {
                let expired = match (proxy.status, proxy.last_seen) {
                    (ProxyStatus::Active, Some(seen)) => seen + self.heartbeat_deadline < now,
                    (ProxyStatus::Registering, None) => {
                        proxy.created_at + self.heartbeat_deadline < now
                    }
                    _ => false,
                };
                if expired {
                    let mut stale = proxy;
                    stale.status = ProxyStatus::Stale;
                    self.store.update_proxy(stale).await?;
                    transitioned += 1;
                }
            }
        }
        Ok(transitioned)
    }
}
