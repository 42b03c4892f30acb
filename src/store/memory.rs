//! In-memory store implementation
//!
//! Backs embedded deployments and tests. A single `RwLock` over the table
//! map is the serialization point; composite operations hold the write lock
//! for their whole span, which gives the all-or-none semantics the trait
//! promises. No lock is held across an await point.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::audit::AuditEvent;
use crate::ca::{CaRecord, CaStatus, CertificateRecord, CrlEntry};
use crate::clusters::Cluster;
use crate::error::{ControlError, Result};
use crate::mappings::Mapping;
use crate::proxies::ProxyRegistration;
use crate::services::Service;
use crate::sessions::{ProxyTokenRecord, RefreshTokenRecord};
use crate::users::User;

use super::{CascadeOutcome, Store};

#[derive(Default)]
struct Tables {
    migrations: Vec<String>,
    clusters: HashMap<String, Cluster>,
    services: HashMap<String, Service>,
    mappings: HashMap<String, Mapping>,
    proxies: HashMap<String, ProxyRegistration>,
    users: HashMap<String, User>,
    cas: HashMap<String, CaRecord>,
    certificates: HashMap<String, CertificateRecord>,
    crl: Vec<CrlEntry>,
    audit: Vec<AuditEvent>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    proxy_tokens: HashMap<String, ProxyTokenRecord>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

fn not_found(what: &str, id: &str) -> ControlError {
    ControlError::NotFound(format!("{what} {id}"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn applied_migrations(&self) -> Result<Vec<String>> {
        Ok(self.tables.read().migrations.clone())
    }

    async fn record_migration(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.migrations.iter().any(|m| m == name) {
            tables.migrations.push(name.to_string());
        }
        Ok(())
    }

    async fn insert_cluster(&self, cluster: Cluster) -> Result<Cluster> {
        let mut tables = self.tables.write();
        if tables.clusters.values().any(|c| c.name == cluster.name) {
            return Err(ControlError::Conflict(format!(
                "cluster name `{}` already exists",
                cluster.name
            )));
        }
        tables.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster> {
        self.tables
            .read()
            .clusters
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("cluster", id))
    }

    async fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(self
            .tables
            .read()
            .clusters
            .values()
            .find(|c| c.name == name)
            .cloned())
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let mut clusters: Vec<Cluster> = self.tables.read().clusters.values().cloned().collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }

    async fn update_cluster(&self, mut cluster: Cluster) -> Result<Cluster> {
        let mut tables = self.tables.write();
        let current = tables
            .clusters
            .get(&cluster.id)
            .ok_or_else(|| not_found("cluster", &cluster.id))?;
        if current.version != cluster.version {
            return Err(ControlError::StaleWrite {
                current_version: current.version,
            });
        }
        cluster.version += 1;
        cluster.updated_at = Utc::now();
        tables.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn delete_cluster(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.clusters.remove(id).is_none() {
            return Err(not_found("cluster", id));
        }
        tables.services.retain(|_, s| s.cluster_id != id);
        tables.mappings.retain(|_, m| m.cluster_id != id);
        let proxy_ids: Vec<String> = tables
            .proxies
            .values()
            .filter(|p| p.cluster_id == id)
            .map(|p| p.id.clone())
            .collect();
        tables.proxies.retain(|_, p| p.cluster_id != id);
        let ca_ids: Vec<String> = tables
            .cas
            .values()
            .filter(|ca| ca.cluster_id == id)
            .map(|ca| ca.id.clone())
            .collect();
        tables.cas.retain(|_, ca| ca.cluster_id != id);
        tables.certificates.retain(|_, c| c.cluster_id != id);
        tables.crl.retain(|e| !ca_ids.contains(&e.ca_id));
        tables
            .proxy_tokens
            .retain(|_, t| !proxy_ids.contains(&t.proxy_id));
        Ok(())
    }

    async fn insert_service(&self, service: Service) -> Result<Service> {
        let mut tables = self.tables.write();
        let taken = tables
            .services
            .values()
            .any(|s| s.cluster_id == service.cluster_id && s.name == service.name);
        if taken {
            return Err(ControlError::Conflict(format!(
                "service name `{}` already exists in cluster",
                service.name
            )));
        }
        tables.services.insert(service.id.clone(), service.clone());
        Ok(service)
    }

    async fn get_service(&self, cluster_id: &str, id: &str) -> Result<Service> {
        self.tables
            .read()
            .services
            .get(id)
            .filter(|s| s.cluster_id == cluster_id)
            .cloned()
            .ok_or_else(|| not_found("service", id))
    }

    async fn find_service_by_name(
        &self,
        cluster_id: &str,
        name: &str,
    ) -> Result<Option<Service>> {
        Ok(self
            .tables
            .read()
            .services
            .values()
            .find(|s| s.cluster_id == cluster_id && s.name == name)
            .cloned())
    }

    async fn list_services(&self, cluster_id: &str) -> Result<Vec<Service>> {
        let mut services: Vec<Service> = self
            .tables
            .read()
            .services
            .values()
            .filter(|s| s.cluster_id == cluster_id)
            .cloned()
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn update_service(&self, mut service: Service) -> Result<Service> {
        let mut tables = self.tables.write();
        let current = tables
            .services
            .get(&service.id)
            .filter(|s| s.cluster_id == service.cluster_id)
            .ok_or_else(|| not_found("service", &service.id))?;
        if current.version != service.version {
            return Err(ControlError::StaleWrite {
                current_version: current.version,
            });
        }
        service.version += 1;
        service.updated_at = Utc::now();
        tables.services.insert(service.id.clone(), service.clone());
        Ok(service)
    }

    async fn delete_service(&self, cluster_id: &str, id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let existed = tables
            .services
            .get(id)
            .is_some_and(|s| s.cluster_id == cluster_id);
        if !existed {
            return Err(not_found("service", id));
        }
        tables.services.remove(id);
        Ok(())
    }

    async fn delete_service_cascade(
        &self,
        cluster_id: &str,
        id: &str,
    ) -> Result<CascadeOutcome> {
        let mut tables = self.tables.write();
        let existed = tables
            .services
            .get(id)
            .is_some_and(|s| s.cluster_id == cluster_id);
        if !existed {
            return Err(not_found("service", id));
        }
        tables.services.remove(id);

        let mut outcome = CascadeOutcome::default();
        let affected: Vec<String> = tables
            .mappings
            .values()
            .filter(|m| {
                m.cluster_id == cluster_id
                    && (m.sources.iter().any(|s| s == id)
                        || m.destinations.iter().any(|d| d == id))
            })
            .map(|m| m.id.clone())
            .collect();
        for mapping_id in affected {
            let Some(mut mapping) = tables.mappings.get(&mapping_id).cloned() else {
                continue;
            };
            mapping.sources.retain(|s| s != id);
            mapping.destinations.retain(|d| d != id);
            if mapping.sources.is_empty() || mapping.destinations.is_empty() {
                tables.mappings.remove(&mapping_id);
                outcome.deleted.push(mapping);
            } else {
                mapping.version += 1;
                mapping.updated_at = Utc::now();
                tables.mappings.insert(mapping_id, mapping.clone());
                outcome.rewritten.push(mapping);
            }
        }
        Ok(outcome)
    }

    async fn mappings_referencing(
        &self,
        cluster_id: &str,
        service_id: &str,
    ) -> Result<Vec<Mapping>> {
        Ok(self
            .tables
            .read()
            .mappings
            .values()
            .filter(|m| {
                m.cluster_id == cluster_id
                    && (m.sources.iter().any(|s| s == service_id)
                        || m.destinations.iter().any(|d| d == service_id))
            })
            .cloned()
            .collect())
    }

    async fn insert_mapping(&self, mapping: Mapping) -> Result<Mapping> {
        let mut tables = self.tables.write();
        tables.mappings.insert(mapping.id.clone(), mapping.clone());
        Ok(mapping)
    }

    async fn get_mapping(&self, cluster_id: &str, id: &str) -> Result<Mapping> {
        self.tables
            .read()
            .mappings
            .get(id)
            .filter(|m| m.cluster_id == cluster_id)
            .cloned()
            .ok_or_else(|| not_found("mapping", id))
    }

    async fn list_mappings(&self, cluster_id: &str) -> Result<Vec<Mapping>> {
        let mut mappings: Vec<Mapping> = self
            .tables
            .read()
            .mappings
            .values()
            .filter(|m| m.cluster_id == cluster_id)
            .cloned()
            .collect();
        mappings.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(mappings)
    }

    async fn update_mapping(&self, mut mapping: Mapping) -> Result<Mapping> {
        let mut tables = self.tables.write();
        let current = tables
            .mappings
            .get(&mapping.id)
            .filter(|m| m.cluster_id == mapping.cluster_id)
            .ok_or_else(|| not_found("mapping", &mapping.id))?;
        if current.version != mapping.version {
            return Err(ControlError::StaleWrite {
                current_version: current.version,
            });
        }
        mapping.version += 1;
        mapping.updated_at = Utc::now();
        tables.mappings.insert(mapping.id.clone(), mapping.clone());
        Ok(mapping)
    }

    async fn delete_mapping(&self, cluster_id: &str, id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let existed = tables
            .mappings
            .get(id)
            .is_some_and(|m| m.cluster_id == cluster_id);
        if !existed {
            return Err(not_found("mapping", id));
        }
        tables.mappings.remove(id);
        Ok(())
    }

    async fn insert_proxy(&self, proxy: ProxyRegistration) -> Result<ProxyRegistration> {
        let mut tables = self.tables.write();
        tables.proxies.insert(proxy.id.clone(), proxy.clone());
        Ok(proxy)
    }

    async fn get_proxy(&self, id: &str) -> Result<ProxyRegistration> {
        self.tables
            .read()
            .proxies
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("proxy", id))
    }

    async fn list_proxies(&self, cluster_id: &str) -> Result<Vec<ProxyRegistration>> {
        let mut proxies: Vec<ProxyRegistration> = self
            .tables
            .read()
            .proxies
            .values()
            .filter(|p| p.cluster_id == cluster_id)
            .cloned()
            .collect();
        proxies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(proxies)
    }

    async fn update_proxy(&self, mut proxy: ProxyRegistration) -> Result<ProxyRegistration> {
        let mut tables = self.tables.write();
        let current = tables
            .proxies
            .get(&proxy.id)
            .ok_or_else(|| not_found("proxy", &proxy.id))?;
        if current.version != proxy.version {
            return Err(ControlError::StaleWrite {
                current_version: current.version,
            });
        }
        proxy.version += 1;
        tables.proxies.insert(proxy.id.clone(), proxy.clone());
        Ok(proxy)
    }

    async fn count_quota_proxies(&self, cluster_id: &str) -> Result<u32> {
        Ok(self
            .tables
            .read()
            .proxies
            .values()
            .filter(|p| p.cluster_id == cluster_id && p.status.counts_against_quota())
            .count() as u32)
    }

    async fn insert_user(&self, user: User) -> Result<User> {
        let mut tables = self.tables.write();
        if tables.users.values().any(|u| u.login == user.login) {
            return Err(ControlError::Conflict(format!(
                "login `{}` already exists",
                user.login
            )));
        }
        tables.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: &str) -> Result<User> {
        self.tables
            .read()
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("user", id))
    }

    async fn find_user_by_login(&self, login: &str) -> Result<Option<User>> {
        Ok(self
            .tables
            .read()
            .users
            .values()
            .find(|u| u.login == login)
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.tables.read().users.values().cloned().collect();
        users.sort_by(|a, b| a.login.cmp(&b.login));
        Ok(users)
    }

    async fn update_user(&self, mut user: User) -> Result<User> {
        let mut tables = self.tables.write();
        let current = tables
            .users
            .get(&user.id)
            .ok_or_else(|| not_found("user", &user.id))?;
        if current.version != user.version {
            return Err(ControlError::StaleWrite {
                current_version: current.version,
            });
        }
        user.version += 1;
        user.updated_at = Utc::now();
        tables.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.users.remove(id).is_none() {
            return Err(not_found("user", id));
        }
        tables.refresh_tokens.retain(|_, t| t.user_id != id);
        Ok(())
    }

    async fn insert_ca(&self, ca: CaRecord) -> Result<CaRecord> {
        let mut tables = self.tables.write();
        tables.cas.insert(ca.id.clone(), ca.clone());
        Ok(ca)
    }

    async fn get_ca(&self, id: &str) -> Result<CaRecord> {
        self.tables
            .read()
            .cas
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("ca", id))
    }

    async fn active_ca(&self, cluster_id: &str) -> Result<Option<CaRecord>> {
        Ok(self
            .tables
            .read()
            .cas
            .values()
            .find(|ca| ca.cluster_id == cluster_id && ca.status == CaStatus::Active)
            .cloned())
    }

    async fn list_cas(&self, cluster_id: &str) -> Result<Vec<CaRecord>> {
        let mut cas: Vec<CaRecord> = self
            .tables
            .read()
            .cas
            .values()
            .filter(|ca| ca.cluster_id == cluster_id)
            .cloned()
            .collect();
        cas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(cas)
    }

    async fn update_ca(&self, ca: CaRecord) -> Result<CaRecord> {
        let mut tables = self.tables.write();
        if !tables.cas.contains_key(&ca.id) {
            return Err(not_found("ca", &ca.id));
        }
        tables.cas.insert(ca.id.clone(), ca.clone());
        Ok(ca)
    }

    async fn insert_certificate(&self, cert: CertificateRecord) -> Result<CertificateRecord> {
        let mut tables = self.tables.write();
        let duplicate = tables
            .certificates
            .values()
            .any(|c| c.ca_id == cert.ca_id && c.serial == cert.serial);
        if duplicate {
            return Err(ControlError::Conflict(format!(
                "serial {} already issued by ca {}",
                cert.serial, cert.ca_id
            )));
        }
        tables
            .certificates
            .insert(cert.id.clone(), cert.clone());
        Ok(cert)
    }

    async fn get_certificate(&self, cluster_id: &str, id: &str) -> Result<CertificateRecord> {
        self.tables
            .read()
            .certificates
            .get(id)
            .filter(|c| c.cluster_id == cluster_id)
            .cloned()
            .ok_or_else(|| not_found("certificate", id))
    }

    async fn list_certificates(&self, cluster_id: &str) -> Result<Vec<CertificateRecord>> {
        let mut certs: Vec<CertificateRecord> = self
            .tables
            .read()
            .certificates
            .values()
            .filter(|c| c.cluster_id == cluster_id)
            .cloned()
            .collect();
        certs.sort_by_key(|c| c.serial);
        Ok(certs)
    }

    async fn update_certificate(&self, cert: CertificateRecord) -> Result<CertificateRecord> {
        let mut tables = self.tables.write();
        if !tables.certificates.contains_key(&cert.id) {
            return Err(not_found("certificate", &cert.id));
        }
        tables
            .certificates
            .insert(cert.id.clone(), cert.clone());
        Ok(cert)
    }

    async fn append_crl(&self, entry: CrlEntry) -> Result<bool> {
        let mut tables = self.tables.write();
        let present = tables
            .crl
            .iter()
            .any(|e| e.ca_id == entry.ca_id && e.serial == entry.serial);
        if present {
            return Ok(false);
        }
        tables.crl.push(entry);
        Ok(true)
    }

    async fn list_crl(&self, cluster_id: &str) -> Result<Vec<CrlEntry>> {
        let tables = self.tables.read();
        let ca_ids: Vec<&String> = tables
            .cas
            .values()
            .filter(|ca| ca.cluster_id == cluster_id)
            .map(|ca| &ca.id)
            .collect();
        Ok(tables
            .crl
            .iter()
            .filter(|e| ca_ids.contains(&&e.ca_id))
            .cloned()
            .collect())
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<()> {
        self.tables.write().audit.push(event);
        Ok(())
    }

    async fn list_audit(
        &self,
        cluster_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        let tables = self.tables.read();
        let mut events: Vec<AuditEvent> = tables
            .audit
            .iter()
            .filter(|e| match cluster_id {
                Some(id) => e.cluster_id.as_deref() == Some(id),
                None => true,
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence);
        if events.len() > limit {
            let skip = events.len() - limit;
            events.drain(..skip);
        }
        Ok(events)
    }

    async fn max_audit_sequence(&self) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .audit
            .iter()
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0))
    }

    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> Result<()> {
        self.tables
            .write()
            .refresh_tokens
            .insert(record.token_hash.clone(), record);
        Ok(())
    }

    async fn take_refresh_token(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>> {
        Ok(self.tables.write().refresh_tokens.remove(token_hash))
    }

    async fn revoke_refresh_tokens_for_user(&self, user_id: &str) -> Result<()> {
        self.tables
            .write()
            .refresh_tokens
            .retain(|_, t| t.user_id != user_id);
        Ok(())
    }

    async fn insert_proxy_token(&self, record: ProxyTokenRecord) -> Result<()> {
        self.tables
            .write()
            .proxy_tokens
            .insert(record.token_hash.clone(), record);
        Ok(())
    }

    async fn get_proxy_token(&self, token_hash: &str) -> Result<Option<ProxyTokenRecord>> {
        Ok(self.tables.read().proxy_tokens.get(token_hash).cloned())
    }

    async fn revoke_proxy_tokens_for_proxy(&self, proxy_id: &str) -> Result<()> {
        self.tables
            .write()
            .proxy_tokens
            .retain(|_, t| t.proxy_id != proxy_id);
        Ok(())
    }
}
