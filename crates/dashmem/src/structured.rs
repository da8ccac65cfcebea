// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The structured store: an id-keyed map plus three secondary indexes.
//!
//! | Index | Shape |
//! |-------|-------|
//! | namespace | `namespace -> set<id>` |
//! | key | `(namespace, key) -> id` |
//! | tag | `tag -> set<id>` |
//!
//! Every query axis except semantic similarity resolves here. Updates run in
//! a single critical section: the new record is composed (`updated_at = now`,
//! `version += 1`) and all indexes reflect it before the call returns.
//! Query results are ordered by descending `created_at`, ties by id.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::MemoryBackend;
use crate::error::Result;
use crate::events::{EventBus, MemoryEvent};
use crate::types::{
    now_ms, BackendStats, HealthCheckResult, MemoryEntry, MemoryPatch, MemoryQuery,
};

#[derive(Default)]
struct StructuredInner {
    entries: HashMap<String, MemoryEntry>,
    by_namespace: HashMap<String, BTreeSet<String>>,
    by_key: HashMap<(String, String), String>,
    by_tag: HashMap<String, BTreeSet<String>>,
}

impl StructuredInner {
    fn index(&mut self, entry: &MemoryEntry) {
        self.by_namespace
            .entry(entry.namespace.clone())
            .or_default()
            .insert(entry.id.clone());
        self.by_key.insert(
            (entry.namespace.clone(), entry.key.clone()),
            entry.id.clone(),
        );
        for tag in &entry.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(entry.id.clone());
        }
    }

    fn unindex(&mut self, entry: &MemoryEntry) {
        if let Some(ids) = self.by_namespace.get_mut(&entry.namespace) {
            ids.remove(&entry.id);
            if ids.is_empty() {
                self.by_namespace.remove(&entry.namespace);
            }
        }
        // Only drop the key mapping if it still points at this entry; a
        // colliding store may have re-pointed it already.
        let key = (entry.namespace.clone(), entry.key.clone());
        if self.by_key.get(&key) == Some(&entry.id) {
            self.by_key.remove(&key);
        }
        for tag in &entry.tags {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(&entry.id);
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    /// Narrowest candidate id set for a query, before per-entry filtering.
    fn candidates(&self, query: &MemoryQuery) -> Vec<String> {
        if let (Some(ns), Some(key)) = (&query.namespace, &query.key) {
            return self
                .by_key
                .get(&(ns.clone(), key.clone()))
                .map(|id| vec![id.clone()])
                .unwrap_or_default();
        }
        if let Some(first_tag) = query.tags.first() {
            return self
                .by_tag
                .get(first_tag)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();
        }
        if let Some(ns) = &query.namespace {
            return self
                .by_namespace
                .get(ns)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();
        }
        self.entries.keys().cloned().collect()
    }
}

/// In-memory structured backend.
pub struct StructuredStore {
    inner: RwLock<StructuredInner>,
    events: EventBus,
}

impl StructuredStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: RwLock::new(StructuredInner::default()),
            events,
        }
    }
}

impl Default for StructuredStore {
    fn default() -> Self {
        Self::new(EventBus::new())
    }
}

#[async_trait]
impl MemoryBackend for StructuredStore {
    async fn store(&self, entry: MemoryEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        // Same id re-stored: rewrite indexes for the replaced values.
        if let Some(old) = inner.entries.remove(&entry.id) {
            inner.unindex(&old);
        }
        // (namespace, key) collision with a different id: the old entry
        // becomes unreachable by key but stays fetchable by id.
        let colliding = inner
            .by_key
            .get(&(entry.namespace.clone(), entry.key.clone()))
            .cloned();
        if let Some(other_id) = colliding {
            if other_id != entry.id {
                tracing::debug!(
                    namespace = %entry.namespace,
                    key = %entry.key,
                    shadowed = %other_id,
                    "key collision: prior entry shadowed"
                );
            }
        }
        inner.index(&entry);
        let (id, namespace) = (entry.id.clone(), entry.namespace.clone());
        inner.entries.insert(entry.id.clone(), entry);
        drop(inner);
        self.events
            .publish(MemoryEvent::EntryStored { id, namespace });
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(id) else {
            return Ok(None);
        };
        entry.access_count += 1;
        entry.last_accessed_at = now_ms();
        let copy = entry.clone();
        drop(inner);
        self.events.publish(MemoryEvent::EntryRetrieved {
            id: copy.id.clone(),
        });
        Ok(Some(copy))
    }

    async fn get_by_key(&self, namespace: &str, key: &str) -> Result<Option<MemoryEntry>> {
        let id = {
            let inner = self.inner.read().await;
            inner
                .by_key
                .get(&(namespace.to_string(), key.to_string()))
                .cloned()
        };
        match id {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    async fn update(&self, id: &str, patch: MemoryPatch) -> Result<Option<MemoryEntry>> {
        let mut inner = self.inner.write().await;
        let Some(mut entry) = inner.entries.get(id).cloned() else {
            return Ok(None);
        };
        inner.unindex(&entry);
        entry.apply_patch(patch);
        inner.index(&entry);
        inner.entries.insert(entry.id.clone(), entry.clone());
        drop(inner);
        self.events.publish(MemoryEvent::EntryUpdated {
            id: entry.id.clone(),
            version: entry.version,
        });
        Ok(Some(entry))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.remove(id) else {
            return Ok(false);
        };
        inner.unindex(&entry);
        drop(inner);
        self.events.publish(MemoryEvent::EntryDeleted {
            id: id.to_string(),
        });
        Ok(true)
    }

    async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        let now = now_ms();
        let inner = self.inner.read().await;
        let mut matched: Vec<&MemoryEntry> = inner
            .candidates(query)
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|e| query.matches_structural(e, now))
            .collect();
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let limit = if query.limit == 0 {
            usize::MAX
        } else {
            query.limit
        };
        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, namespace: Option<&str>) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(match namespace {
            Some(ns) => inner.by_namespace.get(ns).map_or(0, BTreeSet::len),
            None => inner.entries.len(),
        })
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let mut namespaces: Vec<String> = inner.by_namespace.keys().cloned().collect();
        namespaces.sort();
        Ok(namespaces)
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let ids: Vec<String> = inner
            .by_namespace
            .get(namespace)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        for id in &ids {
            if let Some(entry) = inner.entries.remove(id) {
                inner.unindex(&entry);
            }
        }
        Ok(ids.len())
    }

    async fn stats(&self) -> Result<BackendStats> {
        let inner = self.inner.read().await;
        Ok(BackendStats {
            entries: inner.entries.len(),
            namespaces: inner.by_namespace.len(),
            bytes: inner.entries.values().map(MemoryEntry::byte_estimate).sum(),
            index: None,
            cache: None,
        })
    }

    async fn health_check(&self) -> Result<HealthCheckResult> {
        let inner = self.inner.read().await;
        // The key index must never point at a missing entry.
        let key_index_consistent = inner
            .by_key
            .values()
            .all(|id| inner.entries.contains_key(id));
        let mut checks = HashMap::new();
        checks.insert("key_index".to_string(), key_index_consistent);
        Ok(HealthCheckResult {
            healthy: key_index_consistent,
            status: if key_index_consistent {
                "ok".to_string()
            } else {
                "key index references missing entries".to_string()
            },
            checks,
            checked_at: now_ms(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::MemoryType;

    fn entry(key: &str, ns: &str) -> MemoryEntry {
        MemoryEntry::new(key, format!("content for {key}"), ns)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let store = StructuredStore::default();
        let e = entry("k1", "ns");
        let id = e.id.clone();
        store.store(e.clone()).await.unwrap();
        let got = store.get(&id).await.unwrap().unwrap();
        assert_eq!(got.key, "k1");
        assert_eq!(got.access_count, 1, "read bumps access count");
    }

    #[tokio::test]
    async fn test_get_by_key() {
        let store = StructuredStore::default();
        store.store(entry("k1", "ns")).await.unwrap();
        let got = store.get_by_key("ns", "k1").await.unwrap().unwrap();
        assert_eq!(got.key, "k1");
        assert!(store.get_by_key("ns", "other").await.unwrap().is_none());
        assert!(store.get_by_key("other", "k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_collision_shadows_old_entry() {
        let store = StructuredStore::default();
        let old = entry("k1", "ns");
        let old_id = old.id.clone();
        store.store(old).await.unwrap();

        let new = entry("k1", "ns");
        let new_id = new.id.clone();
        store.store(new).await.unwrap();

        // get_by_key resolves to the newer entry; the old one is still
        // reachable by id.
        let by_key = store.get_by_key("ns", "k1").await.unwrap().unwrap();
        assert_eq!(by_key.id, new_id);
        assert!(store.get(&old_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_indexes() {
        let store = StructuredStore::default();
        let e = entry("k1", "ns").with_tag("old-tag");
        let id = e.id.clone();
        store.store(e).await.unwrap();

        let updated = store
            .update(
                &id,
                MemoryPatch {
                    tags: Some(vec!["new-tag".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.version, 1);

        // The tag index reflects the new value before update returns.
        let by_new = store
            .query(&MemoryQuery {
                tags: vec!["new-tag".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_new.len(), 1);
        let by_old = store
            .query(&MemoryQuery {
                tags: vec!["old-tag".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(by_old.is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_returns_none() {
        let store = StructuredStore::default();
        assert!(store
            .update("missing", MemoryPatch::content("x"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let store = StructuredStore::default();
        let e = entry("k1", "ns");
        let id = e.id.clone();
        store.store(e).await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.get_by_key("ns", "k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_descending_created_at_ties_by_id() {
        let store = StructuredStore::default();
        let mut a = entry("a", "ns");
        let mut b = entry("b", "ns");
        let mut c = entry("c", "ns");
        a.created_at = 100;
        b.created_at = 300;
        c.created_at = 100;
        a.id = "id-a".to_string();
        c.id = "id-c".to_string();
        store.store(a).await.unwrap();
        store.store(b).await.unwrap();
        store.store(c).await.unwrap();

        let results = store
            .query(&MemoryQuery {
                namespace: Some("ns".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results[0].key, "b");
        assert_eq!(results[1].id, "id-a", "ties break by id ascending");
        assert_eq!(results[2].id, "id-c");
    }

    #[tokio::test]
    async fn test_query_offset_limit() {
        let store = StructuredStore::default();
        for i in 0..10 {
            let mut e = entry(&format!("k{i}"), "ns");
            e.created_at = 1000 + i;
            store.store(e).await.unwrap();
        }
        let results = store
            .query(&MemoryQuery {
                namespace: Some("ns".to_string()),
                limit: 3,
                offset: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].key, "k7");
    }

    #[tokio::test]
    async fn test_inverted_time_range_returns_empty() {
        let store = StructuredStore::default();
        store.store(entry("k", "ns")).await.unwrap();
        let results = store
            .query(&MemoryQuery {
                created_after: Some(now_ms() + 10_000),
                created_before: Some(now_ms() - 10_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_query_by_type() {
        let store = StructuredStore::default();
        store
            .store(entry("e", "ns").with_type(MemoryType::Episodic))
            .await
            .unwrap();
        store
            .store(entry("s", "ns").with_type(MemoryType::Semantic))
            .await
            .unwrap();
        let results = store
            .query(&MemoryQuery {
                memory_type: Some(MemoryType::Episodic),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "e");
    }

    #[tokio::test]
    async fn test_clear_namespace_and_count() {
        let store = StructuredStore::default();
        store.store(entry("a", "ns1")).await.unwrap();
        store.store(entry("b", "ns1")).await.unwrap();
        store.store(entry("c", "ns2")).await.unwrap();
        assert_eq!(store.count(Some("ns1")).await.unwrap(), 2);
        assert_eq!(store.count(None).await.unwrap(), 3);

        assert_eq!(store.clear_namespace("ns1").await.unwrap(), 2);
        assert_eq!(store.count(Some("ns1")).await.unwrap(), 0);
        assert_eq!(store.count(None).await.unwrap(), 1);
        assert_eq!(store.list_namespaces().await.unwrap(), vec!["ns2"]);
    }

    #[tokio::test]
    async fn test_bulk_insert_and_bulk_delete() {
        let store = StructuredStore::default();
        let entries: Vec<MemoryEntry> = (0..5).map(|i| entry(&format!("k{i}"), "ns")).collect();
        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        store.bulk_insert(entries).await.unwrap();
        assert_eq!(store.count(None).await.unwrap(), 5);

        let removed = store.bulk_delete(&ids[..3]).await.unwrap();
        assert_eq!(removed, 3);
        // Deleting again removes nothing.
        assert_eq!(store.bulk_delete(&ids[..3]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = StructuredStore::default();
        store.store(entry("k", "ns")).await.unwrap();
        let health = store.health_check().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.checks.get("key_index"), Some(&true));
    }

    #[tokio::test]
    async fn test_expired_hidden_unless_requested() {
        let store = StructuredStore::default();
        let e = entry("k", "ns")
            .with_tag("t")
            .with_expires_at(now_ms() - 5);
        store.store(e).await.unwrap();

        let hidden = store
            .query(&MemoryQuery {
                tags: vec!["t".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(hidden.is_empty());

        let shown = store
            .query(&MemoryQuery {
                tags: vec!["t".to_string()],
                include_expired: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(shown.len(), 1);
    }
}
