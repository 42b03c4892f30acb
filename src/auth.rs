//! Authentication primitives and authorization policy
//!
//! ## Overview
//! - Argon2id password hashing with per-user salt and a process pepper
//! - TOTP verification with a ±1 step window against clock skew
//! - Token-bucket login lockout per account and per source address
//! - Role-based authorization scoped per cluster
//!
//! The pepper lives in the secret sink (`auth/pepper`) and never appears in
//! configuration or logs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::ca::SecretSink;
use crate::error::{ControlError, Result};
use crate::users::{Role, User};

const PEPPER_SINK_KEY: &str = "auth/pepper";
const TOTP_STEP_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 1_000_000;

type HmacSha1 = Hmac<Sha1>;

/// Password hashing and verification with the process-wide pepper.
pub struct PasswordPolicy {
    pepper: Vec<u8>,
}

impl PasswordPolicy {
    /// Loads the pepper from the sink, generating it on first start.
    pub async fn open(sink: &Arc<dyn SecretSink>) -> Result<Self> {
        let pepper = match sink.get(PEPPER_SINK_KEY).await? {
            Some(pepper) => pepper,
            None => {
                let mut pepper = vec![0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut pepper);
                sink.put(PEPPER_SINK_KEY, &pepper).await?;
                pepper
            }
        };
        Ok(PasswordPolicy { pepper })
    }

    fn hasher(&self) -> Result<Argon2<'_>> {
        Argon2::new_with_secret(
            &self.pepper,
            Algorithm::Argon2id,
            Version::V0x13,
            Params::default(),
        )
        .map_err(|e| ControlError::Internal(format!("argon2 setup: {e}")))
    }

    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| ControlError::Internal(format!("password hash: {e}")))?;
        Ok(hash.to_string())
    }

    pub fn verify(&self, password: &str, stored: &str) -> Result<()> {
        let parsed = PasswordHash::new(stored)
            .map_err(|e| ControlError::Internal(format!("stored hash unusable: {e}")))?;
        self.hasher()?
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| ControlError::InvalidCredentials)
    }
}

/// Generate a fresh TOTP secret, hex-encoded for storage.
pub fn generate_totp_secret() -> String {
    let mut secret = [0u8; 20];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    hex::encode(secret)
}

fn hotp(secret: &[u8], counter: u64) -> Option<u32> {
    let mut mac = HmacSha1::new_from_slice(secret).ok()?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let bin = ((digest[offset] & 0x7f) as u32) << 24
        | (digest[offset + 1] as u32) << 16
        | (digest[offset + 2] as u32) << 8
        | digest[offset + 3] as u32;
    Some(bin % TOTP_DIGITS)
}

/// RFC 6238 verification at an explicit time, ±1 step of skew.
pub fn verify_totp_at(secret_hex: &str, code: &str, unix_time: u64) -> bool {
    if code.len() != 6 {
        return false;
    }
    let Ok(expected) = code.parse::<u32>() else {
        return false;
    };
    let Ok(secret) = hex::decode(secret_hex) else {
        return false;
    };
    let counter = unix_time / TOTP_STEP_SECS;
    for step in [counter.wrapping_sub(1), counter, counter + 1] {
        if hotp(&secret, step) == Some(expected) {
            return true;
        }
    }
    false
}

pub fn verify_totp(secret_hex: &str, code: &str) -> bool {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    verify_totp_at(secret_hex, code, now)
}

struct ThrottleEntry {
    failures: Vec<Instant>,
    locked_until: Option<Instant>,
}

/// Token-bucket lockout for failed logins, keyed per account and per
/// source address by the caller.
pub struct LoginThrottle {
    threshold: u32,
    window: Duration,
    entries: DashMap<String, ThrottleEntry>,
}

impl LoginThrottle {
    pub fn new(threshold: u32, window: Duration) -> Self {
        LoginThrottle {
            threshold,
            window,
            entries: DashMap::new(),
        }
    }

    /// Errors with `Locked` while the cool-off window is open, regardless
    /// of credential correctness.
    pub fn check(&self, key: &str) -> Result<()> {
        if let Some(entry) = self.entries.get(key) {
            if let Some(until) = entry.locked_until {
                if until > Instant::now() {
                    return Err(ControlError::Locked);
                }
            }
        }
        Ok(())
    }

    pub fn record_failure(&self, key: &str) {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(ThrottleEntry {
            failures: Vec::new(),
            locked_until: None,
        });
        if entry.locked_until.is_some_and(|until| until <= now) {
            entry.locked_until = None;
            entry.failures.clear();
        }
        entry.failures.push(now);
        let window = self.window;
        entry.failures.retain(|at| now.duration_since(*at) < window);
        if entry.failures.len() as u32 >= self.threshold {
            entry.locked_until = Some(now + window);
        }
    }

    pub fn clear(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Actions gated by the uniform `(actor, action, cluster)` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    ReadCluster,
    CreateCluster,
    ManageCluster,
    MutateService,
    MutateMapping,
    ManageKeys,
    ManageCa,
    ManageProxies,
    ManageUsers,
    ReadAudit,
}

impl AuthAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthAction::ReadCluster => "cluster.read",
            AuthAction::CreateCluster => "cluster.create",
            AuthAction::ManageCluster => "cluster.manage",
            AuthAction::MutateService => "service.mutate",
            AuthAction::MutateMapping => "mapping.mutate",
            AuthAction::ManageKeys => "keys.manage",
            AuthAction::ManageCa => "ca.manage",
            AuthAction::ManageProxies => "proxies.manage",
            AuthAction::ManageUsers => "users.manage",
            AuthAction::ReadAudit => "audit.read",
        }
    }
}

/// Role-based check: administrators may do anything within their scope;
/// service owners read cluster state and mutate services and mappings.
pub fn authorize(user: &User, action: AuthAction, cluster_id: Option<&str>) -> Result<()> {
    let global_admin = user
        .roles
        .iter()
        .any(|r| r.role == Role::Administrator && r.cluster_id.is_none());
    if global_admin {
        return Ok(());
    }

    // Everything below needs a cluster scope.
    let Some(cluster_id) = cluster_id else {
        return Err(ControlError::Forbidden(format!(
            "{} requires global administrator",
            action.as_str()
        )));
    };

    let cluster_admin = user.roles.iter().any(|r| {
        r.role == Role::Administrator && r.cluster_id.as_deref() == Some(cluster_id)
    });
    let service_owner = user.roles.iter().any(|r| {
        r.role == Role::ServiceOwner && r.cluster_id.as_deref() == Some(cluster_id)
    });

    let allowed = match action {
        AuthAction::ReadCluster => cluster_admin || service_owner,
        AuthAction::MutateService | AuthAction::MutateMapping => cluster_admin || service_owner,
        AuthAction::ManageCluster
        | AuthAction::ManageKeys
        | AuthAction::ManageCa
        | AuthAction::ManageProxies
        | AuthAction::ReadAudit => cluster_admin,
        AuthAction::CreateCluster | AuthAction::ManageUsers => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(ControlError::Forbidden(format!(
            "{} denied on cluster {cluster_id}",
            action.as_str()
        )))
    }
}
