//! Long-running daemon assembly
//!
//! Wires the store, secret sink, CA, license gate, session core, entity
//! services, snapshot hub, REST router, and discovery server together, then
//! runs until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api::middleware::ApiRateLimiter;
use crate::api::{self, AppState};
use crate::audit::AuditLog;
use crate::auth::{LoginThrottle, PasswordPolicy};
use crate::ca::{self, CertificateAuthority};
use crate::clusters::ClusterService;
use crate::config::Config;
use crate::discovery::{DiscoveryLimits, DiscoveryServer};
use crate::error::{ControlError, Result};
use crate::license::LicenseGate;
use crate::mappings::MappingService;
use crate::proxies::ProxyService;
use crate::services::ServiceCatalog;
use crate::sessions::SessionManager;
use crate::snapshot::SnapshotHub;
use crate::store::{self, MemoryStore, Store};
use crate::users::UserService;

fn open_store(dsn: &str) -> Result<Arc<dyn Store>> {
    if dsn == "memory:" {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Err(ControlError::invalid_field(
            "store_dsn",
            format!("unsupported store `{dsn}`; embedded builds support `memory:`"),
        ))
    }
}

/// Build the shared application state from configuration.
pub async fn build_state(config: Config) -> Result<Arc<AppState>> {
    let store = open_store(&config.store_dsn)?;
    store::run_migrations(&store).await?;

    let sink = ca::open_sink(&config.secret_sink)?;
    let audit = Arc::new(AuditLog::open(store.clone()).await?);
    let ca = Arc::new(CertificateAuthority::new(
        store.clone(),
        sink.clone(),
        config.rotation_overlap(),
    ));
    let license = Arc::new(LicenseGate::new(
        config.license_endpoint.clone(),
        config.license_timeout(),
        config.license_cache_ttl(),
        config.license_grace(),
    )?);
    let hub = Arc::new(SnapshotHub::new(
        store.clone(),
        ca.clone(),
        config.max_snapshot_resources,
    ));
    let sessions = Arc::new(
        SessionManager::open(
            store.clone(),
            &sink,
            config.access_token_ttl(),
            config.refresh_token_ttl(),
            config.rotation_overlap(),
        )
        .await?,
    );
    let passwords = PasswordPolicy::open(&sink).await?;
    let throttle = LoginThrottle::new(config.lockout_threshold, config.lockout_window());
    let users = Arc::new(UserService::new(
        store.clone(),
        passwords,
        sessions.clone(),
        throttle,
        audit.clone(),
    ));

    // Bootstrap administrator on an empty store. A generated password goes
    // to the secret sink, never to the log.
    let admin_password = match &config.initial_admin_password {
        Some(password) => password.clone(),
        None => {
            let generated = crate::sessions::generate_cluster_key().0;
            sink.put("auth/initial-admin-password", generated.as_bytes())
                .await?;
            generated
        }
    };
    if let Some(admin) = users
        .ensure_bootstrap_admin(&config.initial_admin_login, &admin_password)
        .await?
    {
        warn!(
            login = %admin.login,
            "bootstrap administrator created; generated credentials are in the secret sink"
        );
    }

    let clusters = Arc::new(ClusterService::new(
        store.clone(),
        license.clone(),
        ca.clone(),
        hub.clone(),
        audit.clone(),
    ));
    let catalog = Arc::new(ServiceCatalog::new(
        store.clone(),
        hub.clone(),
        audit.clone(),
    ));
    let mappings = Arc::new(MappingService::new(
        store.clone(),
        hub.clone(),
        audit.clone(),
    ));
    let proxies = Arc::new(ProxyService::new(
        store.clone(),
        license.clone(),
        ca.clone(),
        sessions.clone(),
        clusters.clone(),
        hub.clone(),
        audit.clone(),
        config.heartbeat_interval(),
        config.heartbeat_miss_threshold,
    ));

    let prometheus = match crate::metrics::install() {
        Ok(handle) => Some(handle),
        Err(err) => {
            // A second recorder in the same process (tests) is fine to run
            // without.
            warn!(error = %err, "metrics recorder unavailable");
            None
        }
    };
    let limiter = ApiRateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    Ok(Arc::new(AppState {
        config,
        store,
        clusters,
        catalog,
        mappings,
        proxies,
        users,
        sessions,
        license,
        ca,
        hub,
        audit,
        prometheus,
        limiter,
    }))
}

/// Run the daemon until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    if config.tls_listener_cert.is_some() {
        warn!("tls_listener_cert set: embedded builds expect TLS termination at the front proxy");
    }
    let state = build_state(config).await?;

    let rest_listener = TcpListener::bind(&state.config.bind_rest).await?;
    let discovery_listener = TcpListener::bind(&state.config.bind_discovery).await?;
    info!(rest = %state.config.bind_rest, discovery = %state.config.bind_discovery, "fleetplane up");

    let discovery = Arc::new(DiscoveryServer::new(
        state.sessions.clone(),
        state.hub.clone(),
        state.audit.clone(),
        DiscoveryLimits {
            max_streams_per_cluster: state.config.max_streams_per_cluster,
            heartbeat_interval: state.config.heartbeat_interval(),
            miss_threshold: state.config.heartbeat_miss_threshold,
        },
    ));
    tokio::spawn(discovery.run(discovery_listener));

    // Heartbeat-deadline sweep marks silent proxies stale.
    let sweeper_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweeper_state.config.heartbeat_interval());
        loop {
            interval.tick().await;
            match sweeper_state.proxies.sweep_stale().await {
                Ok(0) => {}
                Ok(n) => info!(transitioned = n, "proxies marked stale"),
                Err(err) => warn!(error = %err, "stale sweep failed"),
            }
        }
    });

    let router = api::router(state.clone());
    axum::serve(
        rest_listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await?;
    Ok(())
}
