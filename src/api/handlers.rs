//! Endpoint handlers
//!
//! Handlers stay thin: authenticate, run the uniform authorization check,
//! delegate to the entity services, and shape the response. Every denial
//! is audited by the check itself.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::audit::{Actor, AuditEvent};
use crate::auth::{self, AuthAction};
use crate::ca::{CaRecord, CertificateRecord};
use crate::clusters::{Cluster, CreateClusterRequest, CreatedCluster, RotatedKey};
use crate::error::ControlError;
use crate::license::VerdictState;
use crate::mappings::{CreateMappingRequest, Mapping, UpdateMappingRequest};
use crate::proxies::{
    HeartbeatRequest, ProxyRegistration, RegisterProxyRequest, RegisteredProxy,
};
use crate::services::{CreateServiceRequest, Service, UpdateServiceRequest};
use crate::users::{CreateUserRequest, CreatedUser, RoleAssignment, TokenPair, User};

use super::extract::{AuthedUser, ClientAddr, RawBearer};
use super::{ApiError, ApiResult, AppState};

/// Uniform `(actor, action, cluster)` check; denials land in the audit log.
async fn allow(
    state: &AppState,
    user: &AuthedUser,
    action: AuthAction,
    cluster_id: Option<&str>,
) -> ApiResult<()> {
    if let Err(err) = auth::authorize(&user.user, action, cluster_id) {
        state
            .audit
            .denied(user.actor(), cluster_id, action.as_str())
            .await;
        return Err(ApiError(err));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Authentication

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub totp_code: Option<String>,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    ClientAddr(addr): ClientAddr,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<TokenPair>> {
    let tokens = state
        .users
        .login(&body.login, &body.password, body.totp_code.as_deref(), &addr)
        .await?;
    metrics::counter!("fleetplane_auth_outcomes_total", "outcome" => "success").increment(1);
    Ok(Json(tokens))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    Ok(Json(state.users.refresh(&body.refresh_token).await?))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<StatusCode> {
    state.users.logout(&user.user.id, &body.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Clusters

pub async fn create_cluster(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
    Json(body): Json<CreateClusterRequest>,
) -> ApiResult<(StatusCode, Json<CreatedCluster>)> {
    allow(&state, &user, AuthAction::CreateCluster, None).await?;
    let created = state.clusters.create(&user.actor(), body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_clusters(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
) -> ApiResult<Json<Vec<Cluster>>> {
    let clusters = state.clusters.list().await?;
    let global_admin = user
        .user
        .roles
        .iter()
        .any(|r| r.cluster_id.is_none() && r.role == crate::users::Role::Administrator);
    let visible = if global_admin {
        clusters
    } else {
        clusters
            .into_iter()
            .filter(|c| {
                user.user
                    .roles
                    .iter()
                    .any(|r| r.cluster_id.as_deref() == Some(c.id.as_str()))
            })
            .collect()
    };
    Ok(Json(visible))
}

pub async fn get_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<Json<Cluster>> {
    allow(&state, &user, AuthAction::ReadCluster, Some(&id)).await?;
    Ok(Json(state.clusters.get(&id).await?))
}

pub async fn delete_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<StatusCode> {
    allow(&state, &user, AuthAction::ManageCluster, Some(&id)).await?;
    state.clusters.delete(&user.actor(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rotate_cluster_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<Json<RotatedKey>> {
    allow(&state, &user, AuthAction::ManageKeys, Some(&id)).await?;
    Ok(Json(state.clusters.rotate_key(&user.actor(), &id).await?))
}

// ---------------------------------------------------------------------------
// Services

pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
    Json(body): Json<CreateServiceRequest>,
) -> ApiResult<(StatusCode, Json<Service>)> {
    allow(&state, &user, AuthAction::MutateService, Some(&id)).await?;
    let service = state.catalog.create(&user.actor(), &id, body).await?;
    Ok((StatusCode::CREATED, Json(service)))
}

pub async fn list_services(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<Json<Vec<Service>>> {
    allow(&state, &user, AuthAction::ReadCluster, Some(&id)).await?;
    Ok(Json(state.catalog.list(&id).await?))
}

pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path((id, sid)): Path<(String, String)>,
    user: AuthedUser,
) -> ApiResult<Json<Service>> {
    allow(&state, &user, AuthAction::ReadCluster, Some(&id)).await?;
    Ok(Json(state.catalog.get(&id, &sid).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceBody {
    pub expected_version: u64,
    #[serde(flatten)]
    pub spec: UpdateServiceRequest,
}

pub async fn update_service(
    State(state): State<Arc<AppState>>,
    Path((id, sid)): Path<(String, String)>,
    user: AuthedUser,
    Json(body): Json<UpdateServiceBody>,
) -> ApiResult<Json<Service>> {
    allow(&state, &user, AuthAction::MutateService, Some(&id)).await?;
    let service = state
        .catalog
        .update(&user.actor(), &id, &sid, body.spec, body.expected_version)
        .await?;
    Ok(Json(service))
}

#[derive(Debug, Default, Deserialize)]
pub struct CascadeQuery {
    #[serde(default)]
    pub cascade: bool,
}

pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    Path((id, sid)): Path<(String, String)>,
    Query(query): Query<CascadeQuery>,
    user: AuthedUser,
) -> ApiResult<StatusCode> {
    allow(&state, &user, AuthAction::MutateService, Some(&id)).await?;
    state
        .catalog
        .delete(&user.actor(), &id, &sid, query.cascade)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Mappings

pub async fn create_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
    Json(body): Json<CreateMappingRequest>,
) -> ApiResult<(StatusCode, Json<Mapping>)> {
    allow(&state, &user, AuthAction::MutateMapping, Some(&id)).await?;
    let mapping = state.mappings.create(&user.actor(), &id, body).await?;
    Ok((StatusCode::CREATED, Json(mapping)))
}

pub async fn list_mappings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<Json<Vec<Mapping>>> {
    allow(&state, &user, AuthAction::ReadCluster, Some(&id)).await?;
    Ok(Json(state.mappings.list(&id).await?))
}

pub async fn get_mapping(
    State(state): State<Arc<AppState>>,
    Path((id, mid)): Path<(String, String)>,
    user: AuthedUser,
) -> ApiResult<Json<Mapping>> {
    allow(&state, &user, AuthAction::ReadCluster, Some(&id)).await?;
    Ok(Json(state.mappings.get(&id, &mid).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateMappingBody {
    pub expected_version: u64,
    #[serde(flatten)]
    pub spec: UpdateMappingRequest,
}

pub async fn update_mapping(
    State(state): State<Arc<AppState>>,
    Path((id, mid)): Path<(String, String)>,
    user: AuthedUser,
    Json(body): Json<UpdateMappingBody>,
) -> ApiResult<Json<Mapping>> {
    allow(&state, &user, AuthAction::MutateMapping, Some(&id)).await?;
    let mapping = state
        .mappings
        .update(&user.actor(), &id, &mid, body.spec, body.expected_version)
        .await?;
    Ok(Json(mapping))
}

pub async fn delete_mapping(
    State(state): State<Arc<AppState>>,
    Path((id, mid)): Path<(String, String)>,
    user: AuthedUser,
) -> ApiResult<StatusCode> {
    allow(&state, &user, AuthAction::MutateMapping, Some(&id)).await?;
    state.mappings.delete(&user.actor(), &id, &mid).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Proxies

pub async fn list_proxies(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<Json<Vec<ProxyRegistration>>> {
    allow(&state, &user, AuthAction::ReadCluster, Some(&id)).await?;
    let proxies = state.proxies.list(&id).await?;
    metrics::gauge!("fleetplane_known_proxies", "cluster" => id.clone())
        .set(proxies.len() as f64);
    Ok(Json(proxies))
}

pub async fn revoke_proxy(
    State(state): State<Arc<AppState>>,
    Path((id, pid)): Path<(String, String)>,
    user: AuthedUser,
) -> ApiResult<StatusCode> {
    allow(&state, &user, AuthAction::ManageProxies, Some(&id)).await?;
    state.proxies.revoke(&user.actor(), &id, &pid).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn register_proxy(
    State(state): State<Arc<AppState>>,
    RawBearer(api_key): RawBearer,
    Json(body): Json<RegisterProxyRequest>,
) -> ApiResult<(StatusCode, Json<RegisteredProxy>)> {
    let registered = state.proxies.register(&api_key, body).await?;
    metrics::counter!("fleetplane_certificates_issued_total").increment(1);
    Ok((StatusCode::CREATED, Json(registered)))
}

pub async fn proxy_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    RawBearer(token): RawBearer,
    Json(body): Json<HeartbeatRequest>,
) -> ApiResult<StatusCode> {
    let record = state.sessions.verify_proxy_token(&token).await?;
    if record.proxy_id != id {
        return Err(ApiError(ControlError::NotFound(format!("proxy {id}"))));
    }
    state.proxies.heartbeat(&token, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Certificate authority

pub async fn rotate_ca(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<(StatusCode, Json<CaRecord>)> {
    allow(&state, &user, AuthAction::ManageCa, Some(&id)).await?;
    let fresh = state.ca.rotate(&id).await?;
    state.hub.refresh(&id).await?;
    state
        .audit
        .success(user.actor(), Some(&id), "ca.rotate", None)
        .await;
    Ok((StatusCode::ACCEPTED, Json(fresh)))
}

#[derive(Debug, Deserialize)]
pub struct IssueServerCertRequest {
    pub subject: String,
    pub sans: Vec<String>,
    #[serde(default = "default_server_cert_days")]
    pub validity_days: u32,
}

fn default_server_cert_days() -> u32 {
    365
}

/// Issue a server certificate for a TLS-terminating listener. The private
/// key appears in this response exactly once.
pub async fn issue_server_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
    Json(body): Json<IssueServerCertRequest>,
) -> ApiResult<(StatusCode, Json<crate::ca::IssuedCertificate>)> {
    allow(&state, &user, AuthAction::ManageCa, Some(&id)).await?;
    state.clusters.get(&id).await?;
    let validity = std::time::Duration::from_secs(u64::from(body.validity_days) * 86_400);
    let issued = state
        .ca
        .issue_server(&id, &body.subject, &body.sans, validity)
        .await?;
    metrics::counter!("fleetplane_certificates_issued_total").increment(1);
    // The new handle becomes the TLS reference on terminating listeners.
    state.hub.refresh(&id).await?;
    state
        .audit
        .success(user.actor(), Some(&id), "certificate.issue", None)
        .await;
    Ok((StatusCode::CREATED, Json(issued)))
}

pub async fn list_certificates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<Json<Vec<CertificateRecord>>> {
    allow(&state, &user, AuthAction::ReadCluster, Some(&id)).await?;
    Ok(Json(state.store.list_certificates(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RevokeCertRequest {
    #[serde(default = "default_revoke_reason")]
    pub reason: String,
}

fn default_revoke_reason() -> String {
    "unspecified".to_string()
}

pub async fn revoke_certificate(
    State(state): State<Arc<AppState>>,
    Path((id, sid)): Path<(String, String)>,
    user: AuthedUser,
    body: Option<Json<RevokeCertRequest>>,
) -> ApiResult<StatusCode> {
    allow(&state, &user, AuthAction::ManageCa, Some(&id)).await?;
    let reason = body.map(|b| b.0.reason).unwrap_or_else(default_revoke_reason);
    state.ca.revoke(&id, &sid, &reason).await?;
    // Discovery must re-emit resources that referenced the certificate.
    state.hub.refresh(&id).await?;
    state
        .audit
        .success(user.actor(), Some(&id), "certificate.revoke", None)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Audit

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
}

fn default_audit_limit() -> usize {
    100
}

pub async fn list_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<AuditQuery>,
    user: AuthedUser,
) -> ApiResult<Json<Vec<AuditEvent>>> {
    allow(&state, &user, AuthAction::ReadAudit, Some(&id)).await?;
    Ok(Json(state.audit.list(Some(&id), query.limit).await?))
}

// ---------------------------------------------------------------------------
// Users

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
    Json(body): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<CreatedUser>)> {
    allow(&state, &user, AuthAction::ManageUsers, None).await?;
    let created = state.users.create(&user.actor(), body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
) -> ApiResult<Json<Vec<User>>> {
    allow(&state, &user, AuthAction::ManageUsers, None).await?;
    Ok(Json(state.users.list().await?))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<Json<User>> {
    allow(&state, &user, AuthAction::ManageUsers, None).await?;
    Ok(Json(state.users.get(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRolesRequest {
    pub roles: Vec<RoleAssignment>,
}

pub async fn update_user_roles(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
    Json(body): Json<UpdateRolesRequest>,
) -> ApiResult<Json<User>> {
    allow(&state, &user, AuthAction::ManageUsers, None).await?;
    Ok(Json(
        state.users.update_roles(&user.actor(), &id, body.roles).await?,
    ))
}

pub async fn lock_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<Json<User>> {
    allow(&state, &user, AuthAction::ManageUsers, None).await?;
    Ok(Json(state.users.set_locked(&user.actor(), &id, true).await?))
}

pub async fn unlock_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    user: AuthedUser,
) -> ApiResult<Json<User>> {
    allow(&state, &user, AuthAction::ManageUsers, None).await?;
    Ok(Json(state.users.set_locked(&user.actor(), &id, false).await?))
}

// ---------------------------------------------------------------------------
// Health & metrics

pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct Readiness {
    pub store: &'static str,
    pub license: VerdictState,
}

pub async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = state.store.list_clusters().await.is_ok();
    let license = state.license.current().await.state;
    let readiness = Readiness {
        store: if store_ok { "ok" } else { "unreachable" },
        license,
    };
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

pub async fn metrics_scrape(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
