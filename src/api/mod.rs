//! REST surface
//!
//! ## Overview
//! - Versioned JSON API mounted under `/api/v1`
//! - Fixed error envelope `{"error": {"kind", "message", "details"?}}`
//! - Bearer authentication on every mutating endpoint
//! - Correlation ids, access logs, rate limiting, body-size limits
//!
//! Middleware is explicit composition: every request flows through the
//! correlation/access-log layer, then the rate limiter, then the handler.

pub mod extract;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::audit::AuditLog;
use crate::ca::CertificateAuthority;
use crate::clusters::ClusterService;
use crate::config::Config;
use crate::error::{ControlError, ErrorEnvelope};
use crate::license::LicenseGate;
use crate::mappings::MappingService;
use crate::proxies::ProxyService;
use crate::services::ServiceCatalog;
use crate::sessions::SessionManager;
use crate::snapshot::SnapshotHub;
use crate::store::Store;
use crate::users::UserService;

use middleware::ApiRateLimiter;

/// Everything the handlers need, shared behind one `Arc`.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub clusters: Arc<ClusterService>,
    pub catalog: Arc<ServiceCatalog>,
    pub mappings: Arc<MappingService>,
    pub proxies: Arc<ProxyService>,
    pub users: Arc<UserService>,
    pub sessions: Arc<SessionManager>,
    pub license: Arc<LicenseGate>,
    pub ca: Arc<CertificateAuthority>,
    pub hub: Arc<SnapshotHub>,
    pub audit: Arc<AuditLog>,
    pub prometheus: Option<PrometheusHandle>,
    pub limiter: ApiRateLimiter,
}

/// Handler error wrapper carrying the crate error into a response.
#[derive(Debug)]
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        metrics::counter!(
            "fleetplane_request_errors_total",
            "kind" => self.0.kind().to_string()
        )
        .increment(1);
        (status, Json(ErrorEnvelope::from_error(&self.0, None))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // Authentication
        .route("/auth/login", post(handlers::login))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/logout", post(handlers::logout))
        // Clusters
        .route("/clusters", post(handlers::create_cluster).get(handlers::list_clusters))
        .route(
            "/clusters/{id}",
            get(handlers::get_cluster).delete(handlers::delete_cluster),
        )
        .route("/clusters/{id}/rotate-key", post(handlers::rotate_cluster_key))
        // Services
        .route(
            "/clusters/{id}/services",
            post(handlers::create_service).get(handlers::list_services),
        )
        .route(
            "/clusters/{id}/services/{sid}",
            get(handlers::get_service)
                .put(handlers::update_service)
                .delete(handlers::delete_service),
        )
        // Mappings
        .route(
            "/clusters/{id}/mappings",
            post(handlers::create_mapping).get(handlers::list_mappings),
        )
        .route(
            "/clusters/{id}/mappings/{mid}",
            get(handlers::get_mapping)
                .put(handlers::update_mapping)
                .delete(handlers::delete_mapping),
        )
        // Proxies (operator view)
        .route("/clusters/{id}/proxies", get(handlers::list_proxies))
        .route("/clusters/{id}/proxies/{pid}/revoke", post(handlers::revoke_proxy))
        // Certificate authority
        .route("/clusters/{id}/ca/rotate", post(handlers::rotate_ca))
        .route(
            "/clusters/{id}/certs",
            get(handlers::list_certificates),
        )
        .route(
            "/clusters/{id}/certs/server",
            post(handlers::issue_server_certificate),
        )
        .route("/clusters/{id}/certs/{sid}/revoke", post(handlers::revoke_certificate))
        // Audit
        .route("/clusters/{id}/audit", get(handlers::list_audit))
        // Data-plane bootstrap
        .route("/proxies/register", post(handlers::register_proxy))
        .route("/proxies/{id}/heartbeat", post(handlers::proxy_heartbeat))
        // Users
        .route("/users", post(handlers::create_user).get(handlers::list_users))
        .route("/users/{id}", get(handlers::get_user))
        .route("/users/{id}/roles", put(handlers::update_user_roles))
        .route("/users/{id}/lock", post(handlers::lock_user))
        .route("/users/{id}/unlock", post(handlers::unlock_user));

    Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics_scrape))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::request_pipeline,
        ))
        .layer(RequestBodyLimitLayer::new(state.config.max_body_bytes))
        .with_state(state)
}
