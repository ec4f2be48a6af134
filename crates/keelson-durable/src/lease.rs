//! Fenced, TTL-based mutual exclusion over the durable store
//!
//! The lease manager is the only cross-replica coordination primitive in the
//! system. It is an explicit, constructed component passed by reference -
//! never a process-wide singleton.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::persistence::{DurableStore, StoreError};

/// A held lease on a key
///
/// The fence token increases monotonically with every successful acquire on
/// the same key. A holder whose renew fails must discard any in-flight
/// action: another replica has taken over.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub holder_id: String,
    pub fence_token: i64,
}

/// Lease manager bound to one replica identity
pub struct LeaseManager {
    store: Arc<dyn DurableStore>,
    holder_id: String,
}

impl LeaseManager {
    /// Create a lease manager for this replica
    pub fn new(store: Arc<dyn DurableStore>, holder_id: impl Into<String>) -> Self {
        Self {
            store,
            holder_id: holder_id.into(),
        }
    }

    /// This replica's identity
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Attempt to acquire the lease on `key` for `ttl`
    ///
    /// Returns `None` when another holder owns a live lease - routine
    /// contention, retried on the next poll tick.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let fence = self.store.acquire_lease(key, &self.holder_id, ttl).await?;
        Ok(fence.map(|fence_token| Lease {
            key: key.to_string(),
            holder_id: self.holder_id.clone(),
            fence_token,
        }))
    }

    /// Extend a held lease
    ///
    /// Returns false when ownership changed after expiry; the caller must
    /// stop acting on the leased resource.
    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<bool, StoreError> {
        let renewed = self
            .store
            .renew_lease(&lease.key, &lease.holder_id, ttl)
            .await?;
        if !renewed {
            debug!(key = %lease.key, "lease lost to another holder");
        }
        Ok(renewed)
    }

    /// Release a held lease
    pub async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        self.store
            .release_lease(&lease.key, &lease.holder_id)
            .await
    }
}

/// Lease key guarding one execution's replay
pub(crate) fn execution_key(id: uuid::Uuid) -> String {
    format!("workflow:{}", id)
}

/// Lease key guarding one cron job's ticks
pub(crate) fn cron_key(name: &str) -> String {
    format!("cron:{}", name)
}
