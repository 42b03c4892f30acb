//! Snapshot builder and versioned cache
//!
//! ## Overview
//! - Canonicalizes one cluster's deployable state into discovery resources
//! - Versions are SHA-256 over the canonical form: equal states hash equal,
//!   irrelevant orderings do not change the hash
//! - In-memory cache per cluster keeps the current version plus any version
//!   still pinned by a live subscriber
//!
//! The builder only reads persisted state; it never mutates entities.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use crate::ca::{CertStatus, CertUsage, CertificateAuthority};
use crate::clusters::LoggingProfile;
use crate::error::{ControlError, Result};
use crate::store::Store;
use crate::types::{AuthMode, LbPolicy, Protocol, RateLimitPolicy};

/// The four discovery resource collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Listeners,
    Routes,
    Clusters,
    Endpoints,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Listeners,
        ResourceType::Routes,
        ResourceType::Clusters,
        ResourceType::Endpoints,
    ];
}

/// One ingress surface the L7 proxy exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    pub protocol: Protocol,
    /// Canonical port-set string.
    pub ports: String,
    /// Certificate handle when the listener terminates TLS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

/// Ordered match-and-dispatch rule derived from a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub name: String,
    pub listener: String,
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub auth_required: bool,
}

/// One destination service as a cluster-of-endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointCluster {
    pub name: String,
    pub lb_policy: LbPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,
    pub auth_mode: AuthMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub ports: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointGroup {
    pub cluster: String,
    pub endpoints: Vec<Endpoint>,
}

/// Which secret handles the data plane must hold, plus the trust anchors
/// it validates peers against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsBundle {
    pub trust_anchors: Vec<String>,
    pub certificate_handles: Vec<String>,
}

/// Canonical deployable state; the version hash covers exactly this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub listeners: Vec<Listener>,
    pub routes: Vec<RouteRule>,
    pub clusters: Vec<EndpointCluster>,
    pub endpoints: Vec<EndpointGroup>,
    pub secrets: SecretsBundle,
    pub logging: LoggingProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cluster_id: String,
    pub version: String,
    pub built_at: DateTime<Utc>,
    pub resources: ResourceSet,
}

impl Snapshot {
    pub fn resource_count(&self) -> usize {
        self.resources.listeners.len()
            + self.resources.routes.len()
            + self.resources.clusters.len()
            + self.resources.endpoints.len()
    }
}

fn version_of(resources: &ResourceSet) -> Result<String> {
    let canonical = serde_json::to_vec(resources)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

struct ClusterEntry {
    current: Arc<Snapshot>,
    retained: HashMap<String, Arc<Snapshot>>,
    pins: HashMap<String, usize>,
    tx: watch::Sender<Arc<Snapshot>>,
}

/// Owns snapshot building, the versioned cache, and change notification.
pub struct SnapshotHub {
    store: Arc<dyn Store>,
    ca: Arc<CertificateAuthority>,
    max_resources: usize,
    entries: RwLock<HashMap<String, ClusterEntry>>,
    build_locks: dashmap::DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SnapshotHub {
    pub fn new(store: Arc<dyn Store>, ca: Arc<CertificateAuthority>, max_resources: usize) -> Self {
        SnapshotHub {
            store,
            ca,
            max_resources,
            entries: RwLock::new(HashMap::new()),
            build_locks: dashmap::DashMap::new(),
        }
    }

    fn build_lock(&self, cluster_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.build_locks
            .entry(cluster_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Rebuild the cluster's snapshot from persisted state and publish it
    /// if the version changed. Single writer per cluster.
    pub async fn refresh(&self, cluster_id: &str) -> Result<Arc<Snapshot>> {
        let lock = self.build_lock(cluster_id);
        let _guard = lock.lock().await;

        let snapshot = Arc::new(self.build(cluster_id).await?);
        counter!("fleetplane_snapshot_builds_total").increment(1);

        let mut entries = self.entries.write();
        match entries.get_mut(cluster_id) {
            Some(entry) => {
                if entry.current.version != snapshot.version {
                    entry
                        .retained
                        .insert(snapshot.version.clone(), snapshot.clone());
                    entry.current = snapshot.clone();
                    let _ = entry.tx.send(snapshot.clone());
                    Self::collect_garbage(entry);
                    debug!(cluster = cluster_id, version = %snapshot.version, "published snapshot");
                }
            }
            None => {
                let (tx, _rx) = watch::channel(snapshot.clone());
                let mut retained = HashMap::new();
                retained.insert(snapshot.version.clone(), snapshot.clone());
                entries.insert(
                    cluster_id.to_string(),
                    ClusterEntry {
                        current: snapshot.clone(),
                        retained,
                        pins: HashMap::new(),
                        tx,
                    },
                );
            }
        }
        gauge!("fleetplane_snapshot_resources", "cluster" => cluster_id.to_string())
            .set(snapshot.resource_count() as f64);
        Ok(snapshot)
    }

    async fn build(&self, cluster_id: &str) -> Result<Snapshot> {
        let cluster = self.store.get_cluster(cluster_id).await?;
        let services = self.store.list_services(cluster_id).await?;
        let mappings = self.store.list_mappings(cluster_id).await?;
        let certificates = self.store.list_certificates(cluster_id).await?;
        let trust_anchors = self.ca.trust_anchors(cluster_id).await?;

        let service_names: HashMap<&str, &str> = services
            .iter()
            .map(|s| (s.id.as_str(), s.name.as_str()))
            .collect();

        // Latest issued server certificate backs TLS-terminating listeners.
        let server_cert = certificates
            .iter()
            .filter(|c| c.usage == CertUsage::Server && c.status == CertStatus::Issued)
            .max_by_key(|c| c.serial)
            .map(|c| c.id.clone());

        let mut clusters: Vec<EndpointCluster> = Vec::new();
        let mut endpoints: Vec<EndpointGroup> = Vec::new();
        for service in &services {
            clusters.push(EndpointCluster {
                name: service.name.clone(),
                lb_policy: service.lb_policy.unwrap_or(LbPolicy::RoundRobin),
                rate_limit: service.rate_limit,
                auth_mode: service.auth_mode,
            });
            endpoints.push(EndpointGroup {
                cluster: service.name.clone(),
                endpoints: vec![Endpoint {
                    address: service.address.clone(),
                    ports: service.ports.to_string(),
                    weight: 1,
                }],
            });
        }
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints.sort_by(|a, b| a.cluster.cmp(&b.cluster));

        let mut listeners: Vec<Listener> = Vec::new();
        let mut routes: Vec<RouteRule> = Vec::new();
        for mapping in &mappings {
            let ports = mapping.ports.to_string();
            let mut protocols = mapping.protocols.clone();
            protocols.sort();
            protocols.dedup();
            for protocol in protocols {
                let listener_name = format!("ingress-{protocol}-{ports}");
                if !listeners.iter().any(|l| l.name == listener_name) {
                    let terminates_tls =
                        matches!(protocol, Protocol::Https | Protocol::Grpc);
                    listeners.push(Listener {
                        name: listener_name.clone(),
                        protocol,
                        ports: ports.clone(),
                        tls_secret: terminates_tls.then(|| server_cert.clone()).flatten(),
                    });
                }
                let mut sources: Vec<String> = mapping
                    .sources
                    .iter()
                    .filter_map(|id| service_names.get(id.as_str()).map(|n| n.to_string()))
                    .collect();
                sources.sort();
                let mut destinations: Vec<String> = mapping
                    .destinations
                    .iter()
                    .filter_map(|id| service_names.get(id.as_str()).map(|n| n.to_string()))
                    .collect();
                destinations.sort();
                routes.push(RouteRule {
                    name: format!("route-{}-{protocol}", mapping.id),
                    listener: listener_name,
                    sources,
                    destinations,
                    auth_required: mapping.auth_required,
                });
            }
        }
        listeners.sort_by(|a, b| a.name.cmp(&b.name));
        routes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut certificate_handles: Vec<String> = certificates
            .iter()
            .filter(|c| c.status == CertStatus::Issued)
            .map(|c| c.id.clone())
            .collect();
        certificate_handles.sort();

        let resources = ResourceSet {
            listeners,
            routes,
            clusters,
            endpoints,
            secrets: SecretsBundle {
                trust_anchors,
                certificate_handles,
            },
            logging: cluster.logging.clone(),
        };

        let total = resources.listeners.len()
            + resources.routes.len()
            + resources.clusters.len()
            + resources.endpoints.len();
        if total > self.max_resources {
            return Err(ControlError::Overload(format!(
                "snapshot for cluster {cluster_id} holds {total} resources, bound is {}",
                self.max_resources
            )));
        }

        Ok(Snapshot {
            cluster_id: cluster_id.to_string(),
            version: version_of(&resources)?,
            built_at: Utc::now(),
            resources,
        })
    }

    /// Change feed for one cluster; builds the first snapshot on demand.
    pub async fn subscribe(&self, cluster_id: &str) -> Result<watch::Receiver<Arc<Snapshot>>> {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(cluster_id) {
                return Ok(entry.tx.subscribe());
            }
        }
        self.refresh(cluster_id).await?;
        let entries = self.entries.read();
        entries
            .get(cluster_id)
            .map(|entry| entry.tx.subscribe())
            .ok_or_else(|| ControlError::NotFound(format!("cluster {cluster_id}")))
    }

    pub fn current(&self, cluster_id: &str) -> Option<Arc<Snapshot>> {
        self.entries.read().get(cluster_id).map(|e| e.current.clone())
    }

    /// Record that a subscriber holds `version`; pinned versions survive GC.
    pub fn pin(&self, cluster_id: &str, version: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(cluster_id) {
            *entry.pins.entry(version.to_string()).or_insert(0) += 1;
        }
    }

    pub fn unpin(&self, cluster_id: &str, version: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(cluster_id) {
            if let Some(count) = entry.pins.get_mut(version) {
                *count -= 1;
                if *count == 0 {
                    entry.pins.remove(version);
                }
            }
            Self::collect_garbage(entry);
        }
    }

    fn collect_garbage(entry: &mut ClusterEntry) {
        let current = entry.current.version.clone();
        let pins = entry.pins.clone();
        entry
            .retained
            .retain(|version, _| *version == current || pins.contains_key(version));
    }

    /// Drop a cluster's cache entirely; subscribed streams observe the
    /// closed channel and terminate.
    pub fn remove(&self, cluster_id: &str) {
        self.entries.write().remove(cluster_id);
        self.build_locks.remove(cluster_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::ca::MemorySink;
    use crate::license::LicenseGate;
    use crate::services::{CreateServiceRequest, ServiceCatalog};
    use crate::store::MemoryStore;
    use crate::types::Tier;

    async fn fixture() -> (Arc<dyn Store>, Arc<SnapshotHub>, Arc<ServiceCatalog>, String) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sink: Arc<dyn crate::ca::SecretSink> = Arc::new(MemorySink::new());
        let ca = Arc::new(CertificateAuthority::new(
            store.clone(),
            sink,
            std::time::Duration::from_secs(60 * 86_400),
        ));
        let hub = Arc::new(SnapshotHub::new(store.clone(), ca.clone(), 10_000));
        let audit = Arc::new(AuditLog::open(store.clone()).await.unwrap());
        let catalog = Arc::new(ServiceCatalog::new(store.clone(), hub.clone(), audit.clone()));

        let license = Arc::new(
            LicenseGate::new(
                None,
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(60),
                std::time::Duration::from_secs(60),
            )
            .unwrap(),
        );
        let clusters = crate::clusters::ClusterService::new(
            store.clone(),
            license,
            ca,
            hub.clone(),
            audit,
        );
        let created = clusters
            .create(
                &crate::audit::Actor::System,
                crate::clusters::CreateClusterRequest::builder()
                    .name("prod")
                    .tier(Tier::Community)
                    .build(),
            )
            .await
            .unwrap();
        (store, hub, catalog, created.cluster.id)
    }

    #[tokio::test]
    async fn equal_states_hash_equal() {
        let (_store, hub, catalog, cluster_id) = fixture().await;
        catalog
            .create(
                &crate::audit::Actor::System,
                &cluster_id,
                CreateServiceRequest::builder()
                    .name("web")
                    .address("10.0.0.7")
                    .ports("8080")
                    .protocol(Protocol::Http)
                    .build(),
            )
            .await
            .unwrap();

        let first = hub.refresh(&cluster_id).await.unwrap();
        let second = hub.refresh(&cluster_id).await.unwrap();
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn deployable_change_changes_the_version() {
        let (_store, hub, catalog, cluster_id) = fixture().await;
        let before = hub.refresh(&cluster_id).await.unwrap();
        catalog
            .create(
                &crate::audit::Actor::System,
                &cluster_id,
                CreateServiceRequest::builder()
                    .name("web")
                    .address("10.0.0.7")
                    .ports("8080")
                    .protocol(Protocol::Http)
                    .build(),
            )
            .await
            .unwrap();
        let after = hub.refresh(&cluster_id).await.unwrap();
        assert_ne!(before.version, after.version);
        assert_eq!(after.resources.clusters.len(), 1);
        assert_eq!(after.resources.endpoints[0].endpoints[0].address, "10.0.0.7");
    }

    #[tokio::test]
    async fn gc_keeps_pinned_versions() {
        let (_store, hub, catalog, cluster_id) = fixture().await;
        let v1 = hub.refresh(&cluster_id).await.unwrap();
        hub.pin(&cluster_id, &v1.version);

        catalog
            .create(
                &crate::audit::Actor::System,
                &cluster_id,
                CreateServiceRequest::builder()
                    .name("web")
                    .address("10.0.0.7")
                    .ports("8080")
                    .protocol(Protocol::Http)
                    .build(),
            )
            .await
            .unwrap();
        let v2 = hub.refresh(&cluster_id).await.unwrap();
        assert_ne!(v1.version, v2.version);

        {
            let entries = hub.entries.read();
            let entry = entries.get(&cluster_id).unwrap();
            assert!(entry.retained.contains_key(&v1.version));
            assert!(entry.retained.contains_key(&v2.version));
        }

        hub.unpin(&cluster_id, &v1.version);
        let entries = hub.entries.read();
        let entry = entries.get(&cluster_id).unwrap();
        assert!(!entry.retained.contains_key(&v1.version));
        assert!(entry.retained.contains_key(&v2.version));
    }

    #[tokio::test]
    async fn subscribers_see_version_changes() {
        let (_store, hub, catalog, cluster_id) = fixture().await;
        let mut rx = hub.subscribe(&cluster_id).await.unwrap();
        let initial = rx.borrow().version.clone();

        catalog
            .create(
                &crate::audit::Actor::System,
                &cluster_id,
                CreateServiceRequest::builder()
                    .name("web")
                    .address("10.0.0.7")
                    .ports("8080")
                    .protocol(Protocol::Http)
                    .build(),
            )
            .await
            .unwrap();

        rx.changed().await.unwrap();
        assert_ne!(rx.borrow().version, initial);
    }
}
