// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The vector store: authoritative id->entry map, HNSW index, and cache.
//!
//! Implements the same backend contract as the structured store, plus
//! [`VectorMemoryStore::search`]. Distances convert to similarity scores as
//! `1 - d` for cosine/dot and `1 / (1 + d)` for euclidean/manhattan, so
//! scores are comparable under a single `[0, 1]`-ish convention regardless
//! of metric.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use dashmem_hnsw::{DistanceMetric, HnswConfig, HnswIndex};

use crate::backend::MemoryBackend;
use crate::cache::{CacheConfig, LruTtlCache};
use crate::error::Result;
use crate::events::{EventBus, MemoryEvent};
use crate::types::{
    now_ms, BackendStats, HealthCheckResult, MemoryEntry, MemoryPatch, MemoryQuery, SearchOptions,
    SearchResult,
};

/// Convert an index distance to a similarity score.
#[must_use]
pub fn distance_to_score(metric: DistanceMetric, distance: f32) -> f32 {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::DotProduct => 1.0 - distance,
        DistanceMetric::L2 | DistanceMetric::L1 => 1.0 / (1.0 + distance),
    }
}

#[derive(Default)]
struct VectorInner {
    entries: HashMap<String, MemoryEntry>,
    by_namespace: HashMap<String, BTreeSet<String>>,
    by_key: HashMap<(String, String), String>,
}

impl VectorInner {
    fn index(&mut self, entry: &MemoryEntry) {
        self.by_namespace
            .entry(entry.namespace.clone())
            .or_default()
            .insert(entry.id.clone());
        self.by_key.insert(
            (entry.namespace.clone(), entry.key.clone()),
            entry.id.clone(),
        );
    }

    fn unindex(&mut self, entry: &MemoryEntry) {
        if let Some(ids) = self.by_namespace.get_mut(&entry.namespace) {
            ids.remove(&entry.id);
            if ids.is_empty() {
                self.by_namespace.remove(&entry.namespace);
            }
        }
        let key = (entry.namespace.clone(), entry.key.clone());
        if self.by_key.get(&key) == Some(&entry.id) {
            self.by_key.remove(&key);
        }
    }
}

/// Vector-indexed memory backend.
pub struct VectorMemoryStore {
    index: HnswIndex,
    inner: RwLock<VectorInner>,
    cache: LruTtlCache<MemoryEntry>,
    events: EventBus,
}

impl VectorMemoryStore {
    /// Create a store with the given index and cache configuration.
    #[must_use]
    pub fn new(hnsw: HnswConfig, cache: CacheConfig, events: EventBus) -> Self {
        Self {
            index: HnswIndex::new(hnsw),
            inner: RwLock::new(VectorInner::default()),
            cache: LruTtlCache::new(cache).with_events(events.clone()),
            events,
        }
    }

    /// The configured distance metric.
    #[must_use]
    pub fn metric(&self) -> DistanceMetric {
        self.index.config().metric
    }

    /// The configured vector dimension.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.index.config().dimension
    }

    /// Semantic search per the backend contract: delegate to the index,
    /// resolve entries, convert distance to score, apply the threshold and
    /// structural filters, return up to `k` by descending score.
    pub async fn search(&self, embedding: &[f32], opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        if opts.k == 0 {
            return Ok(Vec::new());
        }
        // Post-filters (threshold, structural, expiry) shrink the candidate
        // set, so over-fetch when any is in play.
        let has_filters =
            opts.filters.is_some() || opts.threshold.is_some() || !opts.include_expired;
        let fetch_k = if has_filters {
            opts.k.saturating_mul(3)
        } else {
            opts.k
        };
        let candidates = self.index.search(embedding, fetch_k, opts.ef)?;

        let now = now_ms();
        let metric = self.metric();
        let inner = self.inner.read().await;
        let mut results = Vec::with_capacity(opts.k);
        for (id, distance) in candidates {
            let Some(entry) = inner.entries.get(&id) else {
                continue;
            };
            if !opts.include_expired && entry.is_expired(now) {
                continue;
            }
            let score = distance_to_score(metric, distance);
            if opts.threshold.is_some_and(|t| score < t) {
                continue;
            }
            if let Some(filters) = &opts.filters {
                if !filters.matches_structural(entry, now) {
                    continue;
                }
            }
            results.push(SearchResult {
                entry: entry.clone(),
                score,
                distance,
            });
            if results.len() >= opts.k {
                break;
            }
        }
        Ok(results)
    }

    /// Rebuild the HNSW index by replaying `add_point` over all entries in
    /// id order. Used after a snapshot load.
    pub async fn rebuild_index(&self) -> Result<()> {
        let inner = self.inner.read().await;
        let mut indexed: Vec<(String, Vec<f32>)> = inner
            .entries
            .values()
            .filter_map(|e| e.embedding.as_ref().map(|v| (e.id.clone(), v.clone())))
            .collect();
        drop(inner);
        indexed.sort_by(|a, b| a.0.cmp(&b.0));
        let count = indexed.len();
        self.index.rebuild(indexed)?;
        self.events.publish(MemoryEvent::IndexRebuilt { count });
        Ok(())
    }

    /// All entries, cloned. Used by snapshot persistence.
    pub async fn dump_entries(&self) -> Vec<MemoryEntry> {
        let inner = self.inner.read().await;
        inner.entries.values().cloned().collect()
    }
}

#[async_trait]
impl MemoryBackend for VectorMemoryStore {
    async fn store(&self, entry: MemoryEntry) -> Result<()> {
        // Index first: dimension/capacity failures must leave the store
        // untouched.
        if let Some(embedding) = &entry.embedding {
            self.index.add_point(&entry.id, embedding)?;
            self.events.publish(MemoryEvent::IndexAdded {
                id: entry.id.clone(),
            });
        } else {
            // Replacing an indexed entry with an embedding-less one.
            self.index.remove_point(&entry.id);
        }
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.entries.remove(&entry.id) {
            inner.unindex(&old);
        }
        inner.index(&entry);
        let (id, namespace) = (entry.id.clone(), entry.namespace.clone());
        self.cache.set(id.clone(), entry.clone());
        inner.entries.insert(entry.id.clone(), entry);
        drop(inner);
        self.events
            .publish(MemoryEvent::EntryStored { id, namespace });
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        // The cache read records hit/miss telemetry; the authoritative map
        // still owns access bookkeeping.
        let cached = self.cache.get(id);
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(id) else {
            if cached.is_some() {
                self.cache.delete(id);
            }
            return Ok(None);
        };
        entry.access_count += 1;
        entry.last_accessed_at = now_ms();
        let copy = entry.clone();
        drop(inner);
        self.cache.set(id.to_string(), copy.clone());
        self.events.publish(MemoryEvent::EntryRetrieved {
            id: id.to_string(),
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
        // Validate a replacement embedding before touching anything.
        if let Some(Some(embedding)) = &patch.embedding {
            if embedding.len() != self.dimension() {
                return Err(crate::error::MemoryError::DimensionMismatch {
                    expected: self.dimension(),
                    actual: embedding.len(),
                });
            }
        }
        let mut inner = self.inner.write().await;
        let Some(mut entry) = inner.entries.get(id).cloned() else {
            return Ok(None);
        };
        inner.unindex(&entry);
        let embedding_changed = patch.embedding.is_some();
        entry.apply_patch(patch);
        inner.index(&entry);
        inner.entries.insert(entry.id.clone(), entry.clone());
        drop(inner);

        if embedding_changed {
            match &entry.embedding {
                Some(embedding) => {
                    self.index.add_point(&entry.id, embedding)?;
                }
                None => {
                    self.index.remove_point(&entry.id);
                }
            }
        }
        self.cache.set(entry.id.clone(), entry.clone());
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
        if self.index.remove_point(id) {
            self.events.publish(MemoryEvent::IndexRemoved {
                id: id.to_string(),
            });
        }
        self.cache.delete(id);
        self.events.publish(MemoryEvent::EntryDeleted {
            id: id.to_string(),
        });
        Ok(true)
    }

    async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        let now = now_ms();
        let inner = self.inner.read().await;
        let mut matched: Vec<&MemoryEntry> = inner
            .entries
            .values()
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
            self.index.remove_point(id);
            self.cache.delete(id);
        }
        Ok(ids.len())
    }

    async fn stats(&self) -> Result<BackendStats> {
        let inner = self.inner.read().await;
        Ok(BackendStats {
            entries: inner.entries.len(),
            namespaces: inner.by_namespace.len(),
            bytes: inner.entries.values().map(MemoryEntry::byte_estimate).sum(),
            index: Some(self.index.stats()),
            cache: Some(self.cache.stats()),
        })
    }

    async fn health_check(&self) -> Result<HealthCheckResult> {
        let inner = self.inner.read().await;
        let embedded = inner
            .entries
            .values()
            .filter(|e| e.embedding.is_some())
            .count();
        let index_consistent = self.index.len() == embedded;
        let mut checks = HashMap::new();
        checks.insert("index_entry_parity".to_string(), index_consistent);
        Ok(HealthCheckResult {
            healthy: index_consistent,
            status: if index_consistent {
                "ok".to_string()
            } else {
                format!(
                    "index holds {} vectors but {} entries carry embeddings",
                    self.index.len(),
                    embedded
                )
            },
            checks,
            checked_at: now_ms(),
        })
    }
}
