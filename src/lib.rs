//! Fleetplane control plane
//!
//! The control plane of a dual-tier proxy fleet: it stores the user-facing
//! model of clusters, backend services, routing mappings, and data-plane
//! proxies; authenticates operators and proxies; runs the per-cluster
//! certificate authority; enforces licensed admission; and translates the
//! entity graph into versioned discovery snapshots pushed to subscribers.
//!
//! # Architecture
//!
//! Operator requests flow REST → entity service → repository → audit. Any
//! mutation that changes a cluster's deployable configuration triggers a
//! snapshot rebuild; the discovery server pushes the new version to every
//! stream subscribed to that cluster. Data planes bootstrap through
//! `POST /api/v1/proxies/register` with the cluster API key, then hold a
//! long-lived framed stream authenticated by their proxy token.
//!
//! # Module Organization
//!
//! - **Model & services**: [`clusters`], [`services`], [`mappings`],
//!   [`proxies`], [`users`]
//! - **Security**: [`auth`], [`sessions`], [`ca`], [`license`]
//! - **Distribution**: [`snapshot`], [`discovery`]
//! - **Surfaces**: [`api`], [`client`], [`cli`], [`daemon`]
//! - **Foundation**: [`store`], [`audit`], [`config`], [`error`],
//!   [`types`], [`metrics`]
//!
//! # Quick Start
//!
//! Run the daemon with the embedded store:
//!
//! ```bash
//! fleetplane serve --config fleetplane.toml
//! ```
//!
//! Drive it from code:
//!
//! ```no_run
//! use fleetplane::client::ControlClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ControlClient::builder()
//!     .base_url("http://127.0.0.1:8080")
//!     .bearer_token("<access token>")
//!     .build()?;
//!
//! let clusters: serde_json::Value = client.get("/api/v1/clusters").await?;
//! println!("{clusters}");
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! Every component returns [`error::ControlError`]; the REST surface maps
//! its kinds onto status codes and the fixed envelope
//! `{"error": {"kind", "message", "details"?}}`. Only `unavailable` and
//! `overload` are retry-safe.

pub mod api;
pub mod audit;
pub mod auth;
pub mod ca;
pub mod cli;
pub mod client;
pub mod clusters;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod license;
pub mod mappings;
pub mod metrics;
pub mod proxies;
pub mod services;
pub mod sessions;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod users;

// Core error types
pub use error::{ControlError, ErrorEnvelope, FieldViolation, Result};

// Configuration
pub use config::Config;

// Domain scalars
pub use types::{AuthMode, LbPolicy, PortSet, Protocol, ProxyKind, ProxyStatus, RateLimitPolicy, Tier};

// Clusters
pub use clusters::{Cluster, ClusterService, CreateClusterRequest, CreatedCluster, RotatedKey};

// Services
pub use services::{CreateServiceRequest, Service, ServiceCatalog, UpdateServiceRequest};

// Mappings
pub use mappings::{CreateMappingRequest, Mapping, MappingService, UpdateMappingRequest};

// Proxies
pub use proxies::{
    HeartbeatRequest, ProxyRegistration, ProxyService, RegisterProxyRequest, RegisteredProxy,
};

// Users & sessions
pub use sessions::{AccessClaims, SessionManager};
pub use users::{CreateUserRequest, Role, RoleAssignment, TokenPair, User, UserService};

// Certificate authority
pub use ca::{CaRecord, CertificateAuthority, CertificateRecord, CrlEntry, SecretSink};

// License gate
pub use license::{LicenseGate, LicenseRequest, LicenseVerdict, VerdictState};

// Snapshots & discovery
pub use discovery::{DiscoveryLimits, DiscoveryServer, Frame};
pub use snapshot::{ResourceType, Snapshot, SnapshotHub};

// Store
pub use store::{MemoryStore, Store};

// REST client
pub use client::{ControlClient, ControlClientBuilder};
