//! Traffic mappings
//!
//! ## Overview
//! - Declarative routing rules linking source and destination services
//! - Every referenced service must live in the mapping's cluster
//! - Requested ports must be served by at least one referenced service
//! - The authentication-required flag must agree with destination auth modes

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::audit::{Actor, AuditLog, entity_hash};
use crate::error::{ControlError, Result};
use crate::services::Service;
use crate::snapshot::SnapshotHub;
use crate::store::Store;
use crate::types::{PortSet, Protocol};

/// Traffic rule row. Sources and destinations hold service ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub id: String,
    pub cluster_id: String,
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub protocols: Vec<Protocol>,
    pub ports: PortSet,
    pub auth_required: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TypedBuilder)]
pub struct CreateMappingRequest {
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub protocols: Vec<Protocol>,
    #[builder(setter(into))]
    pub ports: String,
    #[serde(default)]
    #[builder(default)]
    pub auth_required: bool,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize, TypedBuilder)]
pub struct UpdateMappingRequest {
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub destinations: Option<Vec<String>>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub protocols: Option<Vec<Protocol>>,
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub ports: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub auth_required: Option<bool>,
}

pub struct MappingService {
    store: Arc<dyn Store>,
    hub: Arc<SnapshotHub>,
    audit: Arc<AuditLog>,
}

impl MappingService {
    pub fn new(store: Arc<dyn Store>, hub: Arc<SnapshotHub>, audit: Arc<AuditLog>) -> Self {
        MappingService { store, hub, audit }
    }

    async fn resolve_services(
        &self,
        cluster_id: &str,
        ids: &[String],
        field: &'static str,
    ) -> Result<HashMap<String, Service>> {
        if ids.is_empty() {
            return Err(ControlError::invalid_field(field, "must not be empty"));
        }
        let mut resolved = HashMap::new();
        for id in ids {
            let service = self
                .store
                .get_service(cluster_id, id)
                .await
                .map_err(|err| match err {
                    ControlError::NotFound(_) => ControlError::invalid_field(
                        field,
                        format!("service `{id}` does not exist in this cluster"),
                    ),
                    other => other,
                })?;
            resolved.insert(id.clone(), service);
        }
        Ok(resolved)
    }

    fn validate_rule(
        &self,
        mapping: &Mapping,
        sources: &HashMap<String, Service>,
        destinations: &HashMap<String, Service>,
    ) -> Result<()> {
        if mapping.protocols.is_empty() {
            return Err(ControlError::invalid_field("protocols", "must not be empty"));
        }

        // Each requested port must be served by at least one referenced
        // service, source or destination side.
        let all_sets: Vec<&PortSet> = sources
            .values()
            .chain(destinations.values())
            .map(|s| &s.ports)
            .collect();
        for range in mapping.ports.ranges() {
            for port in range.start..=range.end {
                if !all_sets.iter().any(|set| set.contains(port)) {
                    return Err(ControlError::invalid_field(
                        "ports",
                        format!("port {port} is not served by any referenced service"),
                    ));
                }
            }
        }

        let any_dest_authenticated = destinations
            .values()
            .any(|s| s.auth_mode.requires_bearer());
        if mapping.auth_required && !any_dest_authenticated {
            return Err(ControlError::invalid_field(
                "auth_required",
                "no destination service declares an authentication mode",
            ));
        }
        if !mapping.auth_required && any_dest_authenticated {
            return Err(ControlError::invalid_field(
                "auth_required",
                "destination services require authentication",
            ));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        actor: &Actor,
        cluster_id: &str,
        request: CreateMappingRequest,
    ) -> Result<Mapping> {
        self.store.get_cluster(cluster_id).await?;
        let sources = self
            .resolve_services(cluster_id, &request.sources, "sources")
            .await?;
        let destinations = self
            .resolve_services(cluster_id, &request.destinations, "destinations")
            .await?;

        let now = Utc::now();
        let mapping = Mapping {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster_id.to_string(),
            sources: request.sources,
            destinations: request.destinations,
            protocols: request.protocols,
            ports: request.ports.parse()?,
            auth_required: request.auth_required,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.validate_rule(&mapping, &sources, &destinations)?;

        let mapping = self.store.insert_mapping(mapping).await?;
        self.hub.refresh(cluster_id).await?;
        self.audit
            .success(
                actor.clone(),
                Some(cluster_id),
                "mapping.create",
                Some(entity_hash(&mapping)),
            )
            .await;
        Ok(mapping)
    }

    pub async fn get(&self, cluster_id: &str, id: &str) -> Result<Mapping> {
        self.store.get_mapping(cluster_id, id).await
    }

    pub async fn list(&self, cluster_id: &str) -> Result<Vec<Mapping>> {
        self.store.get_cluster(cluster_id).await?;
        self.store.list_mappings(cluster_id).await
    }

    pub async fn update(
        &self,
        actor: &Actor,
        cluster_id: &str,
        id: &str,
        request: UpdateMappingRequest,
        expected_version: u64,
    ) -> Result<Mapping> {
        let current = self.store.get_mapping(cluster_id, id).await?;
        if current.version != expected_version {
            return Err(ControlError::StaleWrite {
                current_version: current.version,
            });
        }
        let before = entity_hash(&current);

        let mut updated = current;
        if let Some(sources) = request.sources {
            updated.sources = sources;
        }
        if let Some(destinations) = request.destinations {
            updated.destinations = destinations;
        }
        if let Some(protocols) = request.protocols {
            updated.protocols = protocols;
        }
        if let Some(ports) = request.ports {
            updated.ports = ports.parse()?;
        }
        if let Some(auth_required) = request.auth_required {
            updated.auth_required = auth_required;
        }

        let sources = self
            .resolve_services(cluster_id, &updated.sources, "sources")
            .await?;
        let destinations = self
            .resolve_services(cluster_id, &updated.destinations, "destinations")
            .await?;
        self.validate_rule(&updated, &sources, &destinations)?;

        let mapping = self.store.update_mapping(updated).await?;
        self.hub.refresh(cluster_id).await?;
        self.audit
            .record(
                actor.clone(),
                Some(cluster_id),
                "mapping.update",
                Some(before),
                Some(entity_hash(&mapping)),
                crate::audit::AuditOutcome::Success,
            )
            .await;
        Ok(mapping)
    }

    pub async fn delete(&self, actor: &Actor, cluster_id: &str, id: &str) -> Result<()> {
        let mapping = self.store.get_mapping(cluster_id, id).await?;
        self.store.delete_mapping(cluster_id, id).await?;
        self.hub.refresh(cluster_id).await?;
        self.audit
            .record(
                actor.clone(),
                Some(cluster_id),
                "mapping.delete",
                Some(entity_hash(&mapping)),
                None,
                crate::audit::AuditOutcome::Success,
            )
            .await;
        Ok(())
    }
}
