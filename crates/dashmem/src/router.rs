// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The hybrid router: query classification, dispatch, merge, and dual-write.
//!
//! Routing rules:
//!
//! | Query kind | Backend |
//! |------------|---------|
//! | exact / prefix / tag | structured |
//! | semantic | vector |
//! | hybrid | both in parallel, merged per [`CombineStrategy`] |
//!
//! Auto classification (no explicit kind) prefers semantic when an embedding
//! or content+embedder exists, then structured when a key or prefix is
//! present, then the configured default.
//!
//! Mutations dual-write to both backends in parallel by default; a partial
//! failure surfaces [`MemoryError::PartialWrite`] naming the failed side and
//! the caller retries. Read routing is fixed: `get_by_key` reads structured,
//! `search` reads vector, `get(id)` reads vector (it has the cache). Dual
//! writes are not linearizable across backends - callers needing total order
//! use `get` after the write returns.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::MemoryBackend;
use crate::cache::{CacheConfig, LruTtlCache};
use crate::config::MemoryConfig;
use crate::embeddings::EmbeddingGenerator;
use crate::error::{MemoryError, Result, WriteTarget};
use crate::events::{EventBus, MemoryEvent};
use crate::persistence;
use crate::query::DEFAULT_QUERY_LIMIT;
use crate::structured::StructuredStore;
use crate::types::{
    BackendStats, CombineStrategy, HealthCheckResult, MemoryEntry, MemoryPatch, MemoryQuery,
    QueryKind, SearchOptions, SearchResult,
};
use crate::vector::VectorMemoryStore;

/// Router-specific configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Route for auto-classified queries with no distinguishing fields.
    pub default_route: QueryKind,
    /// Front `query()` with an LRU+TTL result cache.
    pub enable_query_cache: bool,
    /// Result cache tuning.
    pub query_cache: CacheConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_route: QueryKind::Hybrid,
            enable_query_cache: true,
            query_cache: CacheConfig {
                max_size: 1_000,
                ttl_ms: Some(30_000),
                ..Default::default()
            },
        }
    }
}

/// Merge structured and semantic result lists under a combine policy.
/// Exposed for direct testing; `query()` calls this for hybrid queries.
#[must_use]
pub fn merge_results(
    combine: CombineStrategy,
    structured: Vec<MemoryEntry>,
    semantic: Vec<MemoryEntry>,
) -> Vec<MemoryEntry> {
    match combine {
        CombineStrategy::Union | CombineStrategy::StructuredFirst => {
            let mut seen: HashSet<String> = HashSet::new();
            let mut merged = Vec::with_capacity(structured.len() + semantic.len());
            for entry in structured.into_iter().chain(semantic) {
                if seen.insert(entry.id.clone()) {
                    merged.push(entry);
                }
            }
            merged
        }
        CombineStrategy::SemanticFirst => {
            let mut seen: HashSet<String> = HashSet::new();
            let mut merged = Vec::with_capacity(structured.len() + semantic.len());
            for entry in semantic.into_iter().chain(structured) {
                if seen.insert(entry.id.clone()) {
                    merged.push(entry);
                }
            }
            merged
        }
        CombineStrategy::Intersection => {
            let structured_ids: HashSet<String> =
                structured.into_iter().map(|e| e.id).collect();
            semantic
                .into_iter()
                .filter(|e| structured_ids.contains(&e.id))
                .collect()
        }
    }
}

/// The unified memory facade: structured + vector backends behind one API.
pub struct HybridMemory {
    structured: Arc<StructuredStore>,
    vector: Arc<VectorMemoryStore>,
    embedder: Option<Arc<dyn EmbeddingGenerator>>,
    config: MemoryConfig,
    router: RouterConfig,
    query_cache: LruTtlCache<Vec<MemoryEntry>>,
    events: EventBus,
}

impl HybridMemory {
    /// Create a hybrid memory with fresh backends sharing one event bus.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_router_config(config, RouterConfig::default())
    }

    /// Create with explicit router tuning.
    #[must_use]
    pub fn with_router_config(config: MemoryConfig, router: RouterConfig) -> Self {
        let events = EventBus::new();
        let structured = Arc::new(StructuredStore::new(events.clone()));
        let vector = Arc::new(VectorMemoryStore::new(
            config.hnsw.clone(),
            config.cache.clone(),
            events.clone(),
        ));
        let query_cache = LruTtlCache::new(router.query_cache.clone());
        Self {
            structured,
            vector,
            embedder: None,
            config,
            router,
            query_cache,
            events,
        }
    }

    /// Inject an embedding generator for content-only semantic queries.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingGenerator>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// The shared event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The structured backend handle.
    #[must_use]
    pub fn structured(&self) -> &Arc<StructuredStore> {
        &self.structured
    }

    /// The vector backend handle.
    #[must_use]
    pub fn vector(&self) -> &Arc<VectorMemoryStore> {
        &self.vector
    }

    /// Classify a query for routing.
    #[must_use]
    pub fn classify(&self, query: &MemoryQuery) -> QueryKind {
        if let Some(kind) = query.kind {
            return kind;
        }
        if query.embedding.is_some() || (query.content.is_some() && self.embedder.is_some()) {
            return QueryKind::Semantic;
        }
        if query.key.is_some() {
            return QueryKind::Exact;
        }
        if query.key_prefix.is_some() {
            return QueryKind::Prefix;
        }
        self.router.default_route
    }

    fn kind_label(kind: QueryKind) -> &'static str {
        match kind {
            QueryKind::Exact => "exact",
            QueryKind::Prefix => "prefix",
            QueryKind::Tag => "tag",
            QueryKind::Semantic => "semantic",
            QueryKind::Hybrid => "hybrid",
        }
    }

    fn cache_key(query: &MemoryQuery, kind: QueryKind) -> Option<String> {
        if query.custom_filter.is_some() {
            return None;
        }
        let serialized = serde_json::to_string(query).ok()?;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        serialized.hash(&mut hasher);
        Self::kind_label(kind).hash(&mut hasher);
        let namespace = query.namespace.as_deref().unwrap_or("*");
        Some(format!("{namespace}:{:016x}", hasher.finish()))
    }

    fn invalidate_namespace(&self, namespace: &str) {
        let pattern = format!("^{}:", regex::escape(namespace));
        if let Ok(re) = regex::Regex::new(&pattern) {
            self.query_cache.invalidate_pattern(&re);
        }
        // Namespace-less cache keys can span any namespace.
        if let Ok(re) = regex::Regex::new(r"^\*:") {
            self.query_cache.invalidate_pattern(&re);
        }
    }

    async fn query_embedding(&self, query: &MemoryQuery) -> Result<Vec<f32>> {
        if let Some(embedding) = &query.embedding {
            return Ok(embedding.clone());
        }
        let Some(content) = &query.content else {
            return Err(MemoryError::InvalidQuery {
                reason: "semantic query needs content or an embedding".to_string(),
            });
        };
        let Some(embedder) = &self.embedder else {
            return Err(MemoryError::EmbedderUnavailable);
        };
        embedder.embed(content).await
    }

    /// Run the semantic half of a query, returning bare entries in
    /// descending-score order.
    async fn semantic_entries(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        let embedding = self.query_embedding(query).await?;
        let k = if query.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            query.limit
        };
        let opts = SearchOptions {
            k,
            threshold: query.threshold,
            ef: query.ef,
            filters: Some(query.clone()),
            include_expired: query.include_expired,
        };
        let results = self.vector.search(&embedding, &opts).await?;
        Ok(results.into_iter().map(|r| r.entry).collect())
    }

    /// Route and run a query, merging hybrid results per the query's
    /// combine policy and fronting the whole thing with the query cache.
    pub async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        let kind = self.classify(query);
        let cache_key = if self.router.enable_query_cache {
            Self::cache_key(query, kind)
        } else {
            None
        };
        if let Some(key) = &cache_key {
            if let Some(hit) = self.query_cache.get(key) {
                // Entries may have expired since the page was cached; the
                // expiry invariant outranks cache freshness.
                let now = crate::types::now_ms();
                let page: Vec<MemoryEntry> = hit
                    .into_iter()
                    .filter(|e| query.include_expired || !e.is_expired(now))
                    .collect();
                self.events.publish(MemoryEvent::QueryExecuted {
                    kind: Self::kind_label(kind).to_string(),
                    results: page.len(),
                });
                return Ok(page);
            }
        }

        // Backends see an un-paginated query; offset/limit apply post-merge.
        let mut backend_query = query.clone();
        backend_query.offset = 0;
        backend_query.limit = if query.limit == 0 {
            0
        } else {
            query.limit + query.offset
        };

        let merged = match kind {
            QueryKind::Exact | QueryKind::Prefix | QueryKind::Tag => {
                self.structured.query(&backend_query).await?
            }
            QueryKind::Semantic => self.semantic_entries(&backend_query).await?,
            QueryKind::Hybrid => {
                let (structured, semantic) = tokio::join!(
                    self.structured.query(&backend_query),
                    self.semantic_entries(&backend_query)
                );
                // A hybrid query without semantic inputs degrades to its
                // structured half rather than failing.
                let semantic = match semantic {
                    Ok(entries) => entries,
                    Err(
                        MemoryError::EmbedderUnavailable | MemoryError::InvalidQuery { .. },
                    ) => Vec::new(),
                    Err(other) => return Err(other),
                };
                merge_results(query.combine, structured?, semantic)
            }
        };

        let limit = if query.limit == 0 {
            usize::MAX
        } else {
            query.limit
        };
        let page: Vec<MemoryEntry> = merged
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .collect();

        if let Some(key) = cache_key {
            self.query_cache.set(key, page.clone());
        }
        self.events.publish(MemoryEvent::QueryExecuted {
            kind: Self::kind_label(kind).to_string(),
            results: page.len(),
        });
        Ok(page)
    }

    /// Direct vector search; always reads the vector backend.
    pub async fn search(&self, embedding: &[f32], opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        self.vector.search(embedding, opts).await
    }

    /// Dual-dispatch a mutation and fold the pair of outcomes into one.
    fn join_writes<T>(
        structured: Result<T>,
        vector: Result<T>,
    ) -> Result<(T, T)> {
        match (structured, vector) {
            (Ok(s), Ok(v)) => Ok((s, v)),
            (Err(err), Ok(_)) => Err(MemoryError::PartialWrite {
                backend: WriteTarget::Structured,
                source: Box::new(err),
            }),
            (Ok(_), Err(err)) => Err(MemoryError::PartialWrite {
                backend: WriteTarget::Vector,
                source: Box::new(err),
            }),
            // Both failed: not partial, surface the authoritative side.
            (Err(_), Err(err)) => Err(err),
        }
    }

    /// Persist the full entry set to a snapshot file.
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let entries = self.vector.dump_entries().await;
        persistence::write_snapshot(path, &entries)?;
        tracing::info!(path = %path.display(), entries = entries.len(), "snapshot saved");
        Ok(())
    }

    /// Load a snapshot: entries land in both backends and the HNSW index is
    /// rebuilt by replaying inserts in id order.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let mut entries = persistence::read_snapshot(path)?;
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let count = entries.len();
        for entry in entries {
            self.store(entry).await?;
        }
        tracing::info!(path = %path.display(), entries = count, "snapshot loaded");
        Ok(count)
    }

    /// Save a snapshot when a path is configured. Call on shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(path) = self.config.snapshot_path.clone() {
            self.save_snapshot(&path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryBackend for HybridMemory {
    async fn store(&self, entry: MemoryEntry) -> Result<()> {
        // Validate the embedding up front so a bad dimension is a clean
        // error rather than a partial write.
        if let Some(embedding) = &entry.embedding {
            if embedding.len() != self.vector.dimension() {
                return Err(MemoryError::DimensionMismatch {
                    expected: self.vector.dimension(),
                    actual: embedding.len(),
                });
            }
        }
        let namespace = entry.namespace.clone();
        if self.config.dual_write {
            let (s, v) = tokio::join!(
                self.structured.store(entry.clone()),
                self.vector.store(entry)
            );
            Self::join_writes(s, v)?;
        } else {
            self.vector.store(entry).await?;
        }
        self.invalidate_namespace(&namespace);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        self.vector.get(id).await
    }

    async fn get_by_key(&self, namespace: &str, key: &str) -> Result<Option<MemoryEntry>> {
        if self.config.dual_write {
            self.structured.get_by_key(namespace, key).await
        } else {
            self.vector.get_by_key(namespace, key).await
        }
    }

    async fn query(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        HybridMemory::query(self, query).await
    }

    async fn update(&self, id: &str, patch: MemoryPatch) -> Result<Option<MemoryEntry>> {
        let updated = if self.config.dual_write {
            let (s, v) = tokio::join!(
                self.structured.update(id, patch.clone()),
                self.vector.update(id, patch)
            );
            let (_, vector_entry) = Self::join_writes(s, v)?;
            vector_entry
        } else {
            self.vector.update(id, patch).await?
        };
        // The patch may have moved the entry's visibility; drop everything.
        self.query_cache.clear();
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let removed = if self.config.dual_write {
            let (s, v) = tokio::join!(self.structured.delete(id), self.vector.delete(id));
            let (s_removed, v_removed) = Self::join_writes(s, v)?;
            s_removed || v_removed
        } else {
            self.vector.delete(id).await?
        };
        self.query_cache.clear();
        Ok(removed)
    }

    async fn bulk_insert(&self, entries: Vec<MemoryEntry>) -> Result<()> {
        for entry in entries {
            self.store(entry).await?;
        }
        Ok(())
    }

    async fn bulk_delete(&self, ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if self.delete(id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count(&self, namespace: Option<&str>) -> Result<usize> {
        if self.config.dual_write {
            self.structured.count(namespace).await
        } else {
            self.vector.count(namespace).await
        }
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        if self.config.dual_write {
            self.structured.list_namespaces().await
        } else {
            self.vector.list_namespaces().await
        }
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        let removed = if self.config.dual_write {
            let (s, v) = tokio::join!(
                self.structured.clear_namespace(namespace),
                self.vector.clear_namespace(namespace)
            );
            let (s_removed, v_removed) = Self::join_writes(s, v)?;
            s_removed.max(v_removed)
        } else {
            self.vector.clear_namespace(namespace).await?
        };
        self.invalidate_namespace(namespace);
        Ok(removed)
    }

    async fn stats(&self) -> Result<BackendStats> {
        let vector_stats = self.vector.stats().await?;
        if self.config.dual_write {
            let structured_stats = self.structured.stats().await?;
            Ok(BackendStats {
                entries: structured_stats.entries,
                namespaces: structured_stats.namespaces,
                bytes: structured_stats.bytes,
                index: vector_stats.index,
                cache: vector_stats.cache,
            })
        } else {
            Ok(vector_stats)
        }
    }

    async fn health_check(&self) -> Result<HealthCheckResult> {
        let (structured, vector) = tokio::join!(
            self.structured.health_check(),
            self.vector.health_check()
        );
        let structured = structured?;
        let vector = vector?;
        let mut checks = std::collections::HashMap::new();
        for (name, ok) in structured.checks {
            checks.insert(format!("structured.{name}"), ok);
        }
        for (name, ok) in vector.checks {
            checks.insert(format!("vector.{name}"), ok);
        }
        let healthy = structured.healthy && vector.healthy;
        Ok(HealthCheckResult {
            healthy,
            status: if healthy {
                "ok".to_string()
            } else {
                format!("structured: {}; vector: {}", structured.status, vector.status)
            },
            checks,
            checked_at: crate::types::now_ms(),
        })
    }
}
