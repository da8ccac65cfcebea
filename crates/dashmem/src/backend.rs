// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The backend contract shared by the structured and vector stores.
//!
//! Read-path absence is `Option::None`. Within a single backend, writes are
//! linearizable; ordering across backends is the router's concern.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    BackendStats, HealthCheckResult, MemoryEntry, MemoryPatch, MemoryQuery,
};

/// Storage backend contract.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Store an entry. A (namespace, key) collision replaces the prior entry
    /// atomically.
    async fn store(&self, entry: MemoryEntry) -> Result<()>;

    /// Fetch by id. Bumps the entry's access bookkeeping.
    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>>;

    /// Fetch by (namespace, key).
    async fn get_by_key(&self, namespace: &str, key: &str) -> Result<Option<MemoryEntry>>;

    /// Apply a partial update. Returns the updated entry, or `None` when the
    /// id does not exist.
    async fn update(&self, id: &str, patch: MemoryPatch) -> Result<Option<MemoryEntry>>;

    /// Delete by id. Returns whether the id existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Run a structural query. Results are ordered by descending
    /// `created_at`, ties broken by id.
    async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>>;

    /// Insert a batch. The default loops over [`MemoryBackend::store`].
    async fn bulk_insert(&self, entries: Vec<MemoryEntry>) -> Result<()> {
        for entry in entries {
            self.store(entry).await?;
        }
        Ok(())
    }

    /// Delete a batch. Returns the number actually removed.
    async fn bulk_delete(&self, ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if self.delete(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Count entries, optionally scoped to a namespace.
    async fn count(&self, namespace: Option<&str>) -> Result<usize>;

    /// All namespaces with at least one entry, sorted.
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Remove every entry in a namespace. Returns the number removed.
    async fn clear_namespace(&self, namespace: &str) -> Result<usize>;

    /// Statistics snapshot.
    async fn stats(&self) -> Result<BackendStats>;

    /// Liveness/consistency probe.
    async fn health_check(&self) -> Result<HealthCheckResult>;
}
