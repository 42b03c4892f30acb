//! Forward-only schema migrations
//!
//! Each migration is idempotent and applied in order on startup; the store
//! records which ones have run. Relational backends translate the same
//! registry into DDL; the in-memory store only needs the bookkeeping so
//! that a later backend swap starts from a known schema position.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;

use super::Store;

/// One named, idempotent schema step.
pub struct Migration {
    pub name: &'static str,
    pub description: &'static str,
}

/// The ordered registry. Append only; never reorder or remove entries.
pub fn registry() -> Vec<Migration> {
    vec![
        Migration {
            name: "0001_base_entities",
            description: "clusters, services, mappings, users",
        },
        Migration {
            name: "0002_proxy_registrations",
            description: "proxy registrations and proxy tokens",
        },
        Migration {
            name: "0003_certificate_authority",
            description: "cas, certificates, crl_entries",
        },
        Migration {
            name: "0004_audit_events",
            description: "append-only audit_events",
        },
        Migration {
            name: "0005_sessions",
            description: "refresh tokens and rate_limit_counters",
        },
        Migration {
            name: "0006_cluster_key_generations",
            description: "cluster key generation and rotation timestamps",
        },
    ]
}

/// Apply every unapplied migration in registry order.
pub async fn run_migrations(store: &Arc<dyn Store>) -> Result<()> {
    let applied = store.applied_migrations().await?;
    for migration in registry() {
        if applied.iter().any(|name| name == migration.name) {
            continue;
        }
        info!(migration = migration.name, "applying migration");
        store.record_migration(migration.name).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn migrations_apply_once_and_in_order() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        run_migrations(&store).await.unwrap();
        let applied = store.applied_migrations().await.unwrap();
        let expected: Vec<String> = registry().iter().map(|m| m.name.to_string()).collect();
        assert_eq!(applied, expected);

        // Second run is a no-op.
        run_migrations(&store).await.unwrap();
        assert_eq!(store.applied_migrations().await.unwrap(), expected);
    }
}
