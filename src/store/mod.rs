//! Persistence repository
//!
//! ## Overview
//! - Typed CRUD per aggregate with optimistic concurrency
//! - Composite operations where writes must be all-or-none
//! - Ordered, idempotent, forward-only migrations applied on startup
//!
//! The relational backend is an external collaborator; everything in the
//! crate talks to the [`Store`] trait. The in-memory implementation in
//! [`memory`] backs embedded deployments (`store_dsn = "memory:"`) and every
//! test. Repository operations enforce uniqueness only; business invariants
//! live in the entity service layer.

pub mod memory;
pub mod migrations;

use async_trait::async_trait;

use crate::audit::AuditEvent;
use crate::ca::{CaRecord, CertificateRecord, CrlEntry};
use crate::clusters::Cluster;
use crate::error::Result;
use crate::mappings::Mapping;
use crate::proxies::ProxyRegistration;
use crate::services::Service;
use crate::sessions::{ProxyTokenRecord, RefreshTokenRecord};
use crate::users::User;

pub use memory::MemoryStore;
pub use migrations::{Migration, run_migrations};

/// Result of a cascading service delete: mappings rewritten to drop the
/// service, and mappings deleted because a side became empty.
#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    pub rewritten: Vec<Mapping>,
    pub deleted: Vec<Mapping>,
}

/// Typed, transactional access to the persistent store.
///
/// Updates take the full row and fail with `StaleWrite` unless the stored
/// version matches the row's `version`; the stored version is then bumped.
#[async_trait]
pub trait Store: Send + Sync {
    // Migration bookkeeping
    async fn applied_migrations(&self) -> Result<Vec<String>>;
    async fn record_migration(&self, name: &str) -> Result<()>;

    // Clusters
    async fn insert_cluster(&self, cluster: Cluster) -> Result<Cluster>;
    async fn get_cluster(&self, id: &str) -> Result<Cluster>;
    async fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>>;
    async fn list_clusters(&self) -> Result<Vec<Cluster>>;
    async fn update_cluster(&self, cluster: Cluster) -> Result<Cluster>;
    /// Deletes the cluster and everything it owns: services, mappings,
    /// proxies, CAs, certificates, CRL entries, and proxy tokens.
    async fn delete_cluster(&self, id: &str) -> Result<()>;

    // Services
    async fn insert_service(&self, service: Service) -> Result<Service>;
    async fn get_service(&self, cluster_id: &str, id: &str) -> Result<Service>;
    async fn find_service_by_name(&self, cluster_id: &str, name: &str)
    -> Result<Option<Service>>;
    async fn list_services(&self, cluster_id: &str) -> Result<Vec<Service>>;
    async fn update_service(&self, service: Service) -> Result<Service>;
    async fn delete_service(&self, cluster_id: &str, id: &str) -> Result<()>;
    /// Atomically deletes a service and rewrites or removes every mapping
    /// that references it.
    async fn delete_service_cascade(
        &self,
        cluster_id: &str,
        id: &str,
    ) -> Result<CascadeOutcome>;
    async fn mappings_referencing(
        &self,
        cluster_id: &str,
        service_id: &str,
    ) -> Result<Vec<Mapping>>;

    // Mappings
    async fn insert_mapping(&self, mapping: Mapping) -> Result<Mapping>;
    async fn get_mapping(&self, cluster_id: &str, id: &str) -> Result<Mapping>;
    async fn list_mappings(&self, cluster_id: &str) -> Result<Vec<Mapping>>;
    async fn update_mapping(&self, mapping: Mapping) -> Result<Mapping>;
    async fn delete_mapping(&self, cluster_id: &str, id: &str) -> Result<()>;

    // Proxy registrations
    async fn insert_proxy(&self, proxy: ProxyRegistration) -> Result<ProxyRegistration>;
    async fn get_proxy(&self, id: &str) -> Result<ProxyRegistration>;
    async fn list_proxies(&self, cluster_id: &str) -> Result<Vec<ProxyRegistration>>;
    async fn update_proxy(&self, proxy: ProxyRegistration) -> Result<ProxyRegistration>;
    /// Number of registrations currently counted against the license quota
    /// (`registering` or `active`).
    async fn count_quota_proxies(&self, cluster_id: &str) -> Result<u32>;

    // Users
    async fn insert_user(&self, user: User) -> Result<User>;
    async fn get_user(&self, id: &str) -> Result<User>;
    async fn find_user_by_login(&self, login: &str) -> Result<Option<User>>;
    async fn list_users(&self) -> Result<Vec<User>>;
    async fn update_user(&self, user: User) -> Result<User>;
    async fn delete_user(&self, id: &str) -> Result<()>;

    // Certificate authorities
    async fn insert_ca(&self, ca: CaRecord) -> Result<CaRecord>;
    async fn get_ca(&self, id: &str) -> Result<CaRecord>;
    async fn active_ca(&self, cluster_id: &str) -> Result<Option<CaRecord>>;
    async fn list_cas(&self, cluster_id: &str) -> Result<Vec<CaRecord>>;
    async fn update_ca(&self, ca: CaRecord) -> Result<CaRecord>;

    // Certificates
    async fn insert_certificate(&self, cert: CertificateRecord) -> Result<CertificateRecord>;
    async fn get_certificate(&self, cluster_id: &str, id: &str) -> Result<CertificateRecord>;
    async fn list_certificates(&self, cluster_id: &str) -> Result<Vec<CertificateRecord>>;
    async fn update_certificate(&self, cert: CertificateRecord) -> Result<CertificateRecord>;

    // Certificate revocation list
    /// Appends an entry unless the (ca, serial) pair is already present.
    /// Returns `false` on the idempotent no-op.
    async fn append_crl(&self, entry: CrlEntry) -> Result<bool>;
    async fn list_crl(&self, cluster_id: &str) -> Result<Vec<CrlEntry>>;

    // Audit (append-only; never updated or deleted)
    async fn append_audit(&self, event: AuditEvent) -> Result<()>;
    async fn list_audit(&self, cluster_id: Option<&str>, limit: usize) -> Result<Vec<AuditEvent>>;
    async fn max_audit_sequence(&self) -> Result<u64>;

    // Refresh tokens (single-use)
    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> Result<()>;
    /// Removes and returns the record; a second take of the same hash
    /// returns `None`.
    async fn take_refresh_token(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>>;
    async fn revoke_refresh_tokens_for_user(&self, user_id: &str) -> Result<()>;

    // Proxy tokens
    async fn insert_proxy_token(&self, record: ProxyTokenRecord) -> Result<()>;
    async fn get_proxy_token(&self, token_hash: &str) -> Result<Option<ProxyTokenRecord>>;
    async fn revoke_proxy_tokens_for_proxy(&self, proxy_id: &str) -> Result<()>;
}
