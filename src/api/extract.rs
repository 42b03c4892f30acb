//! Request extractors for the two identity domains

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::audit::Actor;
use crate::error::ControlError;
use crate::sessions::AccessClaims;
use crate::users::User;

use super::middleware::SourceAddr;
use super::{ApiError, AppState};

fn bearer_token(parts: &Parts) -> Result<String, ControlError> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ControlError::InvalidCredentials)?;
    header
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or(ControlError::InvalidCredentials)
}

/// An authenticated operator: bearer access token, verified and resolved
/// to the stored user.
pub struct AuthedUser {
    pub user: User,
    pub claims: AccessClaims,
}

impl AuthedUser {
    pub fn actor(&self) -> Actor {
        Actor::User(self.user.id.clone())
    }
}

impl FromRequestParts<Arc<AppState>> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let claims = state.sessions.verify_access(&token)?;
        let user = state.store.get_user(&claims.sub).await.map_err(|_| {
            // The token outlived its user; do not leak which.
            ApiError(ControlError::InvalidCredentials)
        })?;
        if user.locked {
            return Err(ApiError(ControlError::Locked));
        }
        Ok(AuthedUser { user, claims })
    }
}

/// The raw bearer credential, for endpoints authenticated by cluster API
/// key or proxy token rather than an operator session.
pub struct RawBearer(pub String);

impl<S> FromRequestParts<S> for RawBearer
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(RawBearer(bearer_token(parts)?))
    }
}

/// Client source address recorded by the middleware.
pub struct ClientAddr(pub String);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientAddr(
            parts
                .extensions
                .get::<SourceAddr>()
                .map(|s| s.0.clone())
                .unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}
