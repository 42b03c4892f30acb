//! Backend service catalog
//!
//! ## Overview
//! - Validated service definitions: address, ports, protocol, auth mode
//! - Optimistic updates keyed on the entity version
//! - Cascade-aware deletion coordinated with mappings
//!
//! A service's declared protocol must be able to carry its authentication
//! mode: bearer modes are rejected on raw transport protocols.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::audit::{Actor, AuditLog, entity_hash};
use crate::error::{ControlError, Result};
use crate::snapshot::SnapshotHub;
use crate::store::{CascadeOutcome, Store};
use crate::types::{AuthMode, LbPolicy, PortSet, Protocol, RateLimitPolicy, validate_address, validate_name};

/// Backend service row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub cluster_id: String,
    pub name: String,
    pub address: String,
    pub ports: PortSet,
    pub protocol: Protocol,
    pub auth_mode: AuthMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lb_policy: Option<LbPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TypedBuilder)]
pub struct CreateServiceRequest {
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub address: String,
    /// Port grammar: `"80"`, `"80-90"`, `"80,443"`, `"80,8000-8010"`.
    #[builder(setter(into))]
    pub ports: String,
    pub protocol: Protocol,
    #[serde(default = "default_auth_mode")]
    #[builder(default = AuthMode::None)]
    pub auth_mode: AuthMode,
    #[serde(default)]
    #[builder(default)]
    pub lb_policy: Option<LbPolicy>,
    #[serde(default)]
    #[builder(default)]
    pub rate_limit: Option<RateLimitPolicy>,
}

fn default_auth_mode() -> AuthMode {
    AuthMode::None
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize, TypedBuilder)]
pub struct UpdateServiceRequest {
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub address: Option<String>,
    #[serde(default)]
    #[builder(default, setter(into, strip_option))]
    pub ports: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub auth_mode: Option<AuthMode>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub lb_policy: Option<LbPolicy>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub rate_limit: Option<RateLimitPolicy>,
}

fn check_protocol_auth(protocol: Protocol, auth_mode: AuthMode) -> Result<()> {
    if auth_mode.requires_bearer() && !protocol.supports_bearer_auth() {
        return Err(ControlError::invalid_field(
            "auth_mode",
            format!("bearer authentication is incompatible with {protocol}"),
        ));
    }
    Ok(())
}

pub struct ServiceCatalog {
    store: Arc<dyn Store>,
    hub: Arc<SnapshotHub>,
    audit: Arc<AuditLog>,
}

impl ServiceCatalog {
    pub fn new(store: Arc<dyn Store>, hub: Arc<SnapshotHub>, audit: Arc<AuditLog>) -> Self {
        ServiceCatalog { store, hub, audit }
    }

    pub async fn create(
        &self,
        actor: &Actor,
        cluster_id: &str,
        request: CreateServiceRequest,
    ) -> Result<Service> {
        // Reject unknown clusters before validating the body.
        self.store.get_cluster(cluster_id).await?;
        validate_name("name", &request.name)?;
        validate_address(&request.address)?;
        let ports: PortSet = request.ports.parse()?;
        check_protocol_auth(request.protocol, request.auth_mode)?;

        let now = Utc::now();
        let service = Service {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster_id.to_string(),
            name: request.name,
            address: request.address,
            ports,
            protocol: request.protocol,
            auth_mode: request.auth_mode,
            lb_policy: request.lb_policy,
            rate_limit: request.rate_limit,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let service = self.store.insert_service(service).await?;
        self.hub.refresh(cluster_id).await?;
        self.audit
            .success(
                actor.clone(),
                Some(cluster_id),
                "service.create",
                Some(entity_hash(&service)),
            )
            .await;
        Ok(service)
    }

    pub async fn get(&self, cluster_id: &str, id: &str) -> Result<Service> {
        self.store.get_service(cluster_id, id).await
    }

    pub async fn list(&self, cluster_id: &str) -> Result<Vec<Service>> {
        self.store.get_cluster(cluster_id).await?;
        self.store.list_services(cluster_id).await
    }

    /// Optimistic update: fails with `conflict` (carrying the current
    /// version) unless `expected_version` matches.
    pub async fn update(
        &self,
        actor: &Actor,
        cluster_id: &str,
        id: &str,
        request: UpdateServiceRequest,
        expected_version: u64,
    ) -> Result<Service> {
        let current = self.store.get_service(cluster_id, id).await?;
        if current.version != expected_version {
            return Err(ControlError::StaleWrite {
                current_version: current.version,
            });
        }
        let before = entity_hash(&current);

        let mut updated = current;
        if let Some(address) = request.address {
            validate_address(&address)?;
            updated.address = address;
        }
        if let Some(ports) = request.ports {
            updated.ports = ports.parse()?;
        }
        if let Some(protocol) = request.protocol {
            updated.protocol = protocol;
        }
        if let Some(auth_mode) = request.auth_mode {
            updated.auth_mode = auth_mode;
        }
        if let Some(lb_policy) = request.lb_policy {
            updated.lb_policy = Some(lb_policy);
        }
        if let Some(rate_limit) = request.rate_limit {
            updated.rate_limit = Some(rate_limit);
        }
        check_protocol_auth(updated.protocol, updated.auth_mode)?;

        let service = self.store.update_service(updated).await?;
        self.hub.refresh(cluster_id).await?;
        self.audit
            .record(
                actor.clone(),
                Some(cluster_id),
                "service.update",
                Some(before),
                Some(entity_hash(&service)),
                crate::audit::AuditOutcome::Success,
            )
            .await;
        Ok(service)
    }

    /// Delete a service. Without `cascade`, referencing mappings make this
    /// a conflict; with it, those mappings are rewritten or removed in the
    /// same transaction.
    pub async fn delete(
        &self,
        actor: &Actor,
        cluster_id: &str,
        id: &str,
        cascade: bool,
    ) -> Result<CascadeOutcome> {
        let service = self.store.get_service(cluster_id, id).await?;
        let before = entity_hash(&service);
        let outcome = if cascade {
            self.store.delete_service_cascade(cluster_id, id).await?
        } else {
            let referencing = self.store.mappings_referencing(cluster_id, id).await?;
            if !referencing.is_empty() {
                return Err(ControlError::Conflict(format!(
                    "service `{}` is referenced by {} mapping(s)",
                    service.name,
                    referencing.len()
                )));
            }
            self.store.delete_service(cluster_id, id).await?;
            CascadeOutcome::default()
        };
        self.hub.refresh(cluster_id).await?;
        self.audit
            .record(
                actor.clone(),
                Some(cluster_id),
                "service.delete",
                Some(before),
                None,
                crate::audit::AuditOutcome::Success,
            )
            .await;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_on_icmp_is_rejected() {
        assert!(check_protocol_auth(Protocol::Icmp, AuthMode::BearerJwt).is_err());
        assert!(check_protocol_auth(Protocol::Http, AuthMode::BearerJwt).is_ok());
        assert!(check_protocol_auth(Protocol::Udp, AuthMode::None).is_ok());
    }
}
