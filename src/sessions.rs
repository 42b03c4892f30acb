//! Tokens and session state
//!
//! ## Overview
//! - JWT access tokens carrying role claims (short TTL)
//! - Opaque single-use refresh tokens, rotated on every refresh
//! - Proxy tokens bound to one registration and one key generation
//! - Cluster API key verification with rotation overlap
//!
//! Opaque tokens are stored as SHA-256 hashes; plaintext leaves the process
//! exactly once, in the response that issues it.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ca::SecretSink;
use crate::clusters::Cluster;
use crate::error::{ControlError, Result};
use crate::store::Store;
use crate::types::ProxyStatus;
use crate::users::{Role, User};

const JWT_SECRET_SINK_KEY: &str = "auth/jwt-secret";

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub roles: Vec<RoleClaim>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleClaim {
    pub cluster: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token_hash: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyTokenRecord {
    pub token_hash: String,
    pub proxy_id: String,
    pub cluster_id: String,
    pub key_generation: u64,
    pub created_at: DateTime<Utc>,
}

/// SHA-256 hex digest used for API keys and opaque tokens at rest.
pub fn hash_secret(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn random_token(prefix: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{prefix}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate a cluster API key; returns `(plaintext, hash)`.
pub fn generate_cluster_key() -> (String, String) {
    let key = random_token("fpk_");
    let hash = hash_secret(&key);
    (key, hash)
}

pub struct SessionManager {
    store: Arc<dyn Store>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    rotation_overlap: Duration,
}

impl SessionManager {
    /// Loads (or creates) the JWT signing secret from the sink.
    pub async fn open(
        store: Arc<dyn Store>,
        sink: &Arc<dyn SecretSink>,
        access_ttl: std::time::Duration,
        refresh_ttl: std::time::Duration,
        rotation_overlap: std::time::Duration,
    ) -> Result<Self> {
        let secret = match sink.get(JWT_SECRET_SINK_KEY).await? {
            Some(secret) => secret,
            None => {
                let mut secret = vec![0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut secret);
                sink.put(JWT_SECRET_SINK_KEY, &secret).await?;
                secret
            }
        };
        Ok(SessionManager {
            store,
            encoding: EncodingKey::from_secret(&secret),
            decoding: DecodingKey::from_secret(&secret),
            access_ttl: Duration::from_std(access_ttl)
                .map_err(|_| ControlError::validation("access_token_ttl out of range"))?,
            refresh_ttl: Duration::from_std(refresh_ttl)
                .map_err(|_| ControlError::validation("refresh_token_ttl out of range"))?,
            rotation_overlap: Duration::from_std(rotation_overlap)
                .map_err(|_| ControlError::validation("rotation_overlap out of range"))?,
        })
    }

    pub fn issue_access(&self, user: &User) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now + self.access_ttl;
        let claims = AccessClaims {
            sub: user.id.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            roles: user
                .roles
                .iter()
                .map(|r| RoleClaim {
                    cluster: r.cluster_id.clone(),
                    role: r.role,
                })
                .collect(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| ControlError::Internal(format!("token encode: {e}")))?;
        Ok((token, expires_at))
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => ControlError::TokenExpired,
                _ => ControlError::InvalidCredentials,
            })
    }

    pub async fn issue_refresh(&self, user_id: &str) -> Result<String> {
        let token = random_token("fpr_");
        let now = Utc::now();
        self.store
            .insert_refresh_token(RefreshTokenRecord {
                token_hash: hash_secret(&token),
                user_id: user_id.to_string(),
                expires_at: now + self.refresh_ttl,
                created_at: now,
            })
            .await?;
        Ok(token)
    }

    /// Consumes a refresh token and returns its owner. Each token rotates:
    /// the caller must issue a replacement.
    pub async fn rotate_refresh(&self, token: &str) -> Result<String> {
        let record = self
            .store
            .take_refresh_token(&hash_secret(token))
            .await?
            .ok_or(ControlError::TokenRevoked)?;
        if record.expires_at <= Utc::now() {
            return Err(ControlError::TokenExpired);
        }
        Ok(record.user_id)
    }

    pub async fn revoke_refresh(&self, token: &str) -> Result<()> {
        self.store.take_refresh_token(&hash_secret(token)).await?;
        Ok(())
    }

    pub async fn revoke_all_refresh(&self, user_id: &str) -> Result<()> {
        self.store.revoke_refresh_tokens_for_user(user_id).await
    }

    pub async fn issue_proxy_token(
        &self,
        proxy_id: &str,
        cluster_id: &str,
        key_generation: u64,
    ) -> Result<String> {
        let token = random_token("fpp_");
        self.store
            .insert_proxy_token(ProxyTokenRecord {
                token_hash: hash_secret(&token),
                proxy_id: proxy_id.to_string(),
                cluster_id: cluster_id.to_string(),
                key_generation,
                created_at: Utc::now(),
            })
            .await?;
        Ok(token)
    }

    pub async fn revoke_proxy_tokens(&self, proxy_id: &str) -> Result<()> {
        self.store.revoke_proxy_tokens_for_proxy(proxy_id).await
    }

    /// Validates a proxy token: the registration must not be revoked and
    /// the token's key generation must still verify under the cluster's
    /// rotation overlap.
    pub async fn verify_proxy_token(&self, token: &str) -> Result<ProxyTokenRecord> {
        let record = self
            .store
            .get_proxy_token(&hash_secret(token))
            .await?
            .ok_or(ControlError::InvalidCredentials)?;
        self.verify_proxy_token_record(&record).await?;
        Ok(record)
    }

    /// Re-validation at token-expiry boundaries on long-lived streams; the
    /// record was verified at stream open.
    pub async fn verify_proxy_token_record(&self, record: &ProxyTokenRecord) -> Result<()> {
        if self
            .store
            .get_proxy_token(&record.token_hash)
            .await?
            .is_none()
        {
            return Err(ControlError::TokenRevoked);
        }
        let proxy = self.store.get_proxy(&record.proxy_id).await?;
        if proxy.status == ProxyStatus::Revoked {
            return Err(ControlError::TokenRevoked);
        }
        let cluster = self.store.get_cluster(&record.cluster_id).await?;
        if !self.generation_is_valid(&cluster, record.key_generation) {
            return Err(ControlError::TokenExpired);
        }
        Ok(())
    }

    fn generation_is_valid(&self, cluster: &Cluster, generation: u64) -> bool {
        if generation == cluster.key_generation {
            return true;
        }
        generation + 1 == cluster.key_generation
            && cluster
                .key_rotated_at
                .is_some_and(|at| at + self.rotation_overlap > Utc::now())
    }

    /// Verifies a presented cluster API key against the current key and,
    /// within the overlap window, the previous one. Returns the generation
    /// the key belongs to.
    pub fn verify_cluster_key(&self, cluster: &Cluster, presented: &str) -> Result<u64> {
        let presented_hash = hash_secret(presented);
        if presented_hash == cluster.api_key_hash {
            return Ok(cluster.key_generation);
        }
        let prev_valid = cluster.prev_api_key_hash.as_deref() == Some(presented_hash.as_str())
            && cluster
                .key_rotated_at
                .is_some_and(|at| at + self.rotation_overlap > Utc::now());
        if prev_valid {
            Ok(cluster.key_generation - 1)
        } else {
            Err(ControlError::InvalidCredentials)
        }
    }
}
