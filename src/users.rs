//! Operator identity management
//!
//! ## Overview
//! - Login with password and optional TOTP, behind the lockout throttle
//! - Refresh-token rotation and logout
//! - User CRUD and per-cluster role assignment
//!
//! Example
//! ```no_run
//! # use std::sync::Arc;
//! # use fleetplane::users::UserService;
//! # async fn example(users: Arc<UserService>) -> fleetplane::error::Result<()> {
//! let tokens = users.login("admin", "secret", None, "10.1.2.3").await?;
//! println!("access token expires {}", tokens.access_expires_at);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use typed_builder::TypedBuilder;

use crate::audit::{Actor, AuditLog, entity_hash};
use crate::auth::{self, LoginThrottle, PasswordPolicy};
use crate::error::{ControlError, Result};
use crate::sessions::SessionManager;
use crate::store::Store;

/// Operator roles, assigned per cluster. A `None` cluster scope on an
/// administrator assignment grants global reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Administrator,
    ServiceOwner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub cluster_id: Option<String>,
    pub role: Role,
}

/// Operator identity row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub login: String,
    #[serde(default, skip_serializing)]
    pub password_hash: String,
    #[serde(default, skip_serializing)]
    pub totp_secret: Option<String>,
    pub roles: Vec<RoleAssignment>,
    pub locked: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tokens handed out on login and refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize, TypedBuilder)]
pub struct CreateUserRequest {
    #[builder(setter(into))]
    pub login: String,
    #[builder(setter(into))]
    pub password: String,
    #[builder(default)]
    pub roles: Vec<RoleAssignment>,
    /// When set, a TOTP secret is generated and returned once.
    #[serde(default)]
    #[builder(default)]
    pub totp_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedUser {
    pub user: User,
    /// Present only when TOTP was enabled at creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp_secret: Option<String>,
}

pub struct UserService {
    store: Arc<dyn Store>,
    passwords: PasswordPolicy,
    sessions: Arc<SessionManager>,
    throttle: LoginThrottle,
    audit: Arc<AuditLog>,
}

impl UserService {
    pub fn new(
        store: Arc<dyn Store>,
        passwords: PasswordPolicy,
        sessions: Arc<SessionManager>,
        throttle: LoginThrottle,
        audit: Arc<AuditLog>,
    ) -> Self {
        UserService {
            store,
            passwords,
            sessions,
            throttle,
            audit,
        }
    }

    /// Exchange credentials (+ optional TOTP code) for a token pair.
    pub async fn login(
        &self,
        login: &str,
        password: &str,
        totp_code: Option<&str>,
        source_addr: &str,
    ) -> Result<TokenPair> {
        let account_key = format!("user:{login}");
        let addr_key = format!("addr:{source_addr}");
        self.throttle.check(&account_key)?;
        self.throttle.check(&addr_key)?;

        let failure = |err: ControlError| {
            self.throttle.record_failure(&account_key);
            self.throttle.record_failure(&addr_key);
            err
        };

        let Some(user) = self.store.find_user_by_login(login).await? else {
            // Hash anyway so missing accounts cost the same as wrong
            // passwords.
            let _ = self.passwords.hash(password);
            self.audit
                .denied(Actor::System, None, "auth.login")
                .await;
            return Err(failure(ControlError::InvalidCredentials));
        };
        if user.locked {
            self.audit
                .denied(Actor::User(user.id.clone()), None, "auth.login")
                .await;
            return Err(ControlError::Locked);
        }
        if let Err(err) = self.passwords.verify(password, &user.password_hash) {
            self.audit
                .denied(Actor::User(user.id.clone()), None, "auth.login")
                .await;
            return Err(failure(err));
        }
        if let Some(secret) = &user.totp_secret {
            let Some(code) = totp_code else {
                return Err(ControlError::MfaRequired);
            };
            if !auth::verify_totp(secret, code) {
                self.audit
                    .denied(Actor::User(user.id.clone()), None, "auth.login")
                    .await;
                return Err(failure(ControlError::InvalidCredentials));
            }
        }

        self.throttle.clear(&account_key);
        self.throttle.clear(&addr_key);
        let (access_token, access_expires_at) = self.sessions.issue_access(&user)?;
        let refresh_token = self.sessions.issue_refresh(&user.id).await?;
        self.audit
            .success(Actor::User(user.id.clone()), None, "auth.login", None)
            .await;
        Ok(TokenPair {
            access_token,
            access_expires_at,
            refresh_token,
        })
    }

    /// Rotate a refresh token into a fresh token pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let user_id = self.sessions.rotate_refresh(refresh_token).await?;
        let user = self.store.get_user(&user_id).await?;
        if user.locked {
            return Err(ControlError::Locked);
        }
        let (access_token, access_expires_at) = self.sessions.issue_access(&user)?;
        let refresh_token = self.sessions.issue_refresh(&user.id).await?;
        Ok(TokenPair {
            access_token,
            access_expires_at,
            refresh_token,
        })
    }

    pub async fn logout(&self, user_id: &str, refresh_token: &str) -> Result<()> {
        self.sessions.revoke_refresh(refresh_token).await?;
        self.audit
            .success(Actor::User(user_id.to_string()), None, "auth.logout", None)
            .await;
        Ok(())
    }

    pub async fn create(&self, actor: &Actor, request: CreateUserRequest) -> Result<CreatedUser> {
        if request.login.is_empty() {
            return Err(ControlError::invalid_field("login", "login is empty"));
        }
        if request.password.len() < 8 {
            return Err(ControlError::invalid_field(
                "password",
                "password must be at least 8 characters",
            ));
        }
        let totp_secret = request.totp_enabled.then(auth::generate_totp_secret);
        let now = Utc::now();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            login: request.login,
            password_hash: self.passwords.hash(&request.password)?,
            totp_secret: totp_secret.clone(),
            roles: request.roles,
            locked: false,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let user = self.store.insert_user(user).await?;
        info!(login = %user.login, "created operator");
        self.audit
            .success(actor.clone(), None, "user.create", Some(entity_hash(&user)))
            .await;
        Ok(CreatedUser { user, totp_secret })
    }

    pub async fn update_roles(
        &self,
        actor: &Actor,
        user_id: &str,
        roles: Vec<RoleAssignment>,
    ) -> Result<User> {
        let mut user = self.store.get_user(user_id).await?;
        user.roles = roles;
        let user = self.store.update_user(user).await?;
        self.audit
            .success(
                actor.clone(),
                None,
                "user.update_roles",
                Some(entity_hash(&user)),
            )
            .await;
        Ok(user)
    }

    pub async fn set_locked(&self, actor: &Actor, user_id: &str, locked: bool) -> Result<User> {
        let mut user = self.store.get_user(user_id).await?;
        user.locked = locked;
        let user = self.store.update_user(user).await?;
        if locked {
            self.sessions.revoke_all_refresh(&user.id).await?;
        }
        let action = if locked { "user.lock" } else { "user.unlock" };
        self.audit
            .success(actor.clone(), None, action, Some(entity_hash(&user)))
            .await;
        Ok(user)
    }

    pub async fn get(&self, user_id: &str) -> Result<User> {
        self.store.get_user(user_id).await
    }

    pub async fn list(&self) -> Result<Vec<User>> {
        self.store.list_users().await
    }

    /// Creates the bootstrap administrator when the store has no users.
    pub async fn ensure_bootstrap_admin(&self, login: &str, password: &str) -> Result<Option<User>> {
        if !self.store.list_users().await?.is_empty() {
            return Ok(None);
        }
        let created = self
            .create(
                &Actor::System,
                CreateUserRequest::builder()
                    .login(login)
                    .password(password)
                    .roles(vec![RoleAssignment {
                        cluster_id: None,
                        role: Role::Administrator,
                    }])
                    .build(),
            )
            .await?;
        Ok(Some(created.user))
    }
}
