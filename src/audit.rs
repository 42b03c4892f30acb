//! Immutable audit trail
//!
//! Every authenticated mutation, auth outcome, certificate issuance or
//! revocation, and license denial lands here. Events are persisted through
//! the repository's append-only path; the writer owns the process-monotonic
//! sequence, seeded from the store on startup.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::Result;
use crate::store::Store;

/// Who performed the action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Actor {
    User(String),
    Proxy(String),
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    /// `None` for system-wide events.
    pub cluster_id: Option<String>,
    pub action: String,
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
    pub outcome: AuditOutcome,
}

/// SHA-256 over the canonical JSON form of an entity, for before/after
/// references in audit events.
pub fn entity_hash<T: Serialize>(entity: &T) -> String {
    let bytes = serde_json::to_vec(entity).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Single writer for the audit stream.
pub struct AuditLog {
    store: Arc<dyn Store>,
    sequence: AtomicU64,
}

impl AuditLog {
    /// Seeds the sequence from the highest persisted event.
    pub async fn open(store: Arc<dyn Store>) -> Result<Self> {
        let max = store.max_audit_sequence().await?;
        Ok(AuditLog {
            store,
            sequence: AtomicU64::new(max),
        })
    }

    pub async fn record(
        &self,
        actor: Actor,
        cluster_id: Option<&str>,
        action: &str,
        before_hash: Option<String>,
        after_hash: Option<String>,
        outcome: AuditOutcome,
    ) {
        let event = AuditEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: Utc::now(),
            actor,
            cluster_id: cluster_id.map(str::to_string),
            action: action.to_string(),
            before_hash,
            after_hash,
            outcome,
        };
        // An unreachable store must not fail the mutation that already
        // committed; the gap is visible in the sequence numbers.
        if let Err(err) = self.store.append_audit(event).await {
            warn!(action, error = %err, "failed to append audit event");
        }
    }

    pub async fn success(
        &self,
        actor: Actor,
        cluster_id: Option<&str>,
        action: &str,
        after_hash: Option<String>,
    ) {
        self.record(actor, cluster_id, action, None, after_hash, AuditOutcome::Success)
            .await;
    }

    pub async fn denied(&self, actor: Actor, cluster_id: Option<&str>, action: &str) {
        self.record(actor, cluster_id, action, None, None, AuditOutcome::Denied)
            .await;
    }

    pub async fn list(
        &self,
        cluster_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        self.store.list_audit(cluster_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn sequence_is_strictly_increasing_and_survives_reopen() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let log = AuditLog::open(store.clone()).await.unwrap();
        log.success(Actor::System, None, "startup", None).await;
        log.success(Actor::User("u1".into()), Some("c1"), "cluster.create", None)
            .await;

        let events = log.list(None, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[1].sequence, 2);

        // Reopening seeds the sequence past what is persisted.
        let reopened = AuditLog::open(store).await.unwrap();
        reopened
            .success(Actor::System, None, "startup", None)
            .await;
        let events = reopened.list(None, 10).await.unwrap();
        assert_eq!(events.last().unwrap().sequence, 3);
    }

    #[test]
    fn entity_hash_is_stable() {
        #[derive(Serialize)]
        struct Row {
            a: u32,
            b: &'static str,
        }
        let h1 = entity_hash(&Row { a: 1, b: "x" });
        let h2 = entity_hash(&Row { a: 1, b: "x" });
        let h3 = entity_hash(&Row { a: 2, b: "x" });
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }
}
