//! Cluster management
//!
//! ## Overview
//! - Tenant boundary: a cluster owns its services, mappings, proxies, CA,
//!   certificates, and snapshots
//! - Creation is license-gated by tier
//! - API key rotation with an overlap window during which both keys verify

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use typed_builder::TypedBuilder;

use crate::audit::{Actor, AuditLog, entity_hash};
use crate::ca::CertificateAuthority;
use crate::error::Result;
use crate::license::{LicenseGate, LicenseRequest};
use crate::sessions;
use crate::snapshot::SnapshotHub;
use crate::store::Store;
use crate::types::{Tier, validate_name};

/// Per-cluster logging profile forwarded to data planes through snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingProfile {
    pub level: String,
    pub format: String,
}

impl Default for LoggingProfile {
    fn default() -> Self {
        LoggingProfile {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Tenant boundary row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub tier: Tier,
    #[serde(default, skip_serializing)]
    pub api_key_hash: String,
    #[serde(default, skip_serializing)]
    pub prev_api_key_hash: Option<String>,
    pub key_generation: u64,
    pub key_rotated_at: Option<DateTime<Utc>>,
    pub logging: LoggingProfile,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
impl Cluster {
    pub fn new_for_tests(name: &str) -> Self {
        let now = Utc::now();
        Cluster {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            tier: Tier::Community,
            api_key_hash: String::new(),
            prev_api_key_hash: None,
            key_generation: 1,
            key_rotated_at: None,
            logging: LoggingProfile::default(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Deserialize, TypedBuilder)]
pub struct CreateClusterRequest {
    #[builder(setter(into))]
    pub name: String,
    pub tier: Tier,
    #[serde(default)]
    #[builder(default)]
    pub logging: Option<LoggingProfile>,
}

/// Creation response; the API key appears here exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedCluster {
    pub cluster: Cluster,
    pub api_key: String,
}

/// Key rotation response; the new key appears here exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotatedKey {
    pub cluster: Cluster,
    pub api_key: String,
}

pub struct ClusterService {
    store: Arc<dyn Store>,
    license: Arc<LicenseGate>,
    ca: Arc<CertificateAuthority>,
    hub: Arc<SnapshotHub>,
    audit: Arc<AuditLog>,
}

impl ClusterService {
    pub fn new(
        store: Arc<dyn Store>,
        license: Arc<LicenseGate>,
        ca: Arc<CertificateAuthority>,
        hub: Arc<SnapshotHub>,
        audit: Arc<AuditLog>,
    ) -> Self {
        ClusterService {
            store,
            license,
            ca,
            hub,
            audit,
        }
    }

    pub async fn create(&self, actor: &Actor, request: CreateClusterRequest) -> Result<CreatedCluster> {
        validate_name("name", &request.name)?;
        if let Err(err) = self
            .license
            .check(&request.name, LicenseRequest::CreateCluster { tier: request.tier })
            .await
        {
            self.audit.denied(actor.clone(), None, "cluster.create").await;
            return Err(err);
        }

        let (api_key, api_key_hash) = sessions::generate_cluster_key();
        let now = Utc::now();
        let cluster = Cluster {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            tier: request.tier,
            api_key_hash,
            prev_api_key_hash: None,
            key_generation: 1,
            key_rotated_at: None,
            logging: request.logging.unwrap_or_default(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let cluster = self.store.insert_cluster(cluster).await?;

        // The cluster's root of trust exists from the start so the first
        // proxy registration does not race CA generation.
        self.ca.ensure_ca(&cluster.id).await?;
        self.hub.refresh(&cluster.id).await?;

        info!(cluster = %cluster.name, tier = %cluster.tier, "created cluster");
        self.audit
            .success(
                actor.clone(),
                Some(&cluster.id),
                "cluster.create",
                Some(entity_hash(&cluster)),
            )
            .await;
        Ok(CreatedCluster { cluster, api_key })
    }

    pub async fn get(&self, id: &str) -> Result<Cluster> {
        self.store.get_cluster(id).await
    }

    pub async fn list(&self) -> Result<Vec<Cluster>> {
        self.store.list_clusters().await
    }

    /// Rotate the cluster API key. The previous key keeps verifying for the
    /// configured overlap window; proxy tokens derived from it expire with
    /// it.
    pub async fn rotate_key(&self, actor: &Actor, id: &str) -> Result<RotatedKey> {
        let mut cluster = self.store.get_cluster(id).await?;
        let (api_key, api_key_hash) = sessions::generate_cluster_key();
        cluster.prev_api_key_hash = Some(std::mem::replace(
            &mut cluster.api_key_hash,
            api_key_hash,
        ));
        cluster.key_generation += 1;
        cluster.key_rotated_at = Some(Utc::now());
        let cluster = self.store.update_cluster(cluster).await?;

        info!(cluster = %cluster.name, generation = cluster.key_generation, "rotated cluster key");
        self.audit
            .success(
                actor.clone(),
                Some(&cluster.id),
                "cluster.rotate_key",
                Some(entity_hash(&cluster)),
            )
            .await;
        Ok(RotatedKey { cluster, api_key })
    }

    /// Delete the cluster and everything it owns.
    pub async fn delete(&self, actor: &Actor, id: &str) -> Result<()> {
        let cluster = self.store.get_cluster(id).await?;
        let before = entity_hash(&cluster);
        self.store.delete_cluster(id).await?;
        self.hub.remove(id);
        self.audit
            .record(
                actor.clone(),
                Some(id),
                "cluster.delete",
                Some(before),
                None,
                crate::audit::AuditOutcome::Success,
            )
            .await;
        Ok(())
    }

    /// Locate the cluster a presented API key belongs to, verifying the key
    /// against the current generation and the rotation overlap.
    pub async fn authenticate_key(
        &self,
        sessions: &crate::sessions::SessionManager,
        api_key: &str,
    ) -> Result<(Cluster, u64)> {
        for cluster in self.store.list_clusters().await? {
            if let Ok(generation) = sessions.verify_cluster_key(&cluster, api_key) {
                return Ok((cluster, generation));
            }
        }
        Err(crate::error::ControlError::InvalidCredentials)
    }
}
