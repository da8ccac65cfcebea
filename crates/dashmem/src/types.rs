// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Core data model: memory entries, queries, and result shapes.
//!
//! The primary aggregate is [`MemoryEntry`]. Entries are owned exclusively by
//! the stores; callers always receive clones, never aliased mutable state.
//! Metadata values are a typed union of scalars ([`ScalarValue`]) rather than
//! a pass-through JSON container, so equality filtering stays well-defined.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A scalar metadata value. Filters match on exact equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Absent / null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Numeric (stored as f64).
    Number(f64),
    /// UTF-8 string.
    String(String),
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Memory classification. Informational only; no behavior hangs off it
/// beyond filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Event-like memories tied to a point in time.
    Episodic,
    /// Facts and knowledge.
    Semantic,
    /// How-to / skills.
    Procedural,
    /// Scratch state for in-flight work.
    Working,
    /// Derived, recomputable values.
    Cache,
}

impl Default for MemoryType {
    fn default() -> Self {
        Self::Semantic
    }
}

/// Access-control level, used as a filter axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Visible to the owner only.
    Private,
    /// Visible to the owner's team.
    Team,
    /// Visible to the whole swarm.
    Swarm,
    /// World-readable.
    Public,
    /// Reserved for the system itself.
    System,
}

impl Default for AccessLevel {
    fn default() -> Self {
        Self::Private
    }
}

/// The primary aggregate: one stored memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Globally unique, immutable id (generated at create time).
    pub id: String,
    /// Unique within `namespace`.
    pub key: String,
    /// Payload. May be large.
    pub content: String,
    /// Fixed-dimension embedding; present implies the entry is indexable.
    pub embedding: Option<Vec<f32>>,
    /// Classification.
    pub memory_type: MemoryType,
    /// Partition scope.
    pub namespace: String,
    /// Filter axis with intersection semantics.
    pub tags: Vec<String>,
    /// Opaque scalar metadata, equality-matched by filters.
    pub metadata: HashMap<String, ScalarValue>,
    /// Access-control key.
    pub owner_id: Option<String>,
    /// Access-control level.
    pub access_level: AccessLevel,
    /// Creation timestamp (ms).
    pub created_at: i64,
    /// Last successful update (ms).
    pub updated_at: i64,
    /// Last successful read (ms).
    pub last_accessed_at: i64,
    /// The entry is live iff absent or in the future.
    pub expires_at: Option<i64>,
    /// Incremented on every successful update.
    pub version: u64,
    /// Ids of related entries. Not enforced referentially; cycles are
    /// harmless because nothing dereferences them eagerly.
    pub references: Vec<String>,
    /// Incremented on every successful read.
    pub access_count: u64,
}

impl MemoryEntry {
    /// Create a new entry with a fresh id and current timestamps.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        content: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.into(),
            content: content.into(),
            embedding: None,
            memory_type: MemoryType::default(),
            namespace: namespace.into(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            owner_id: None,
            access_level: AccessLevel::default(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            expires_at: None,
            version: 0,
            references: Vec::new(),
            access_count: 0,
        }
    }

    /// Attach an embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Set the classification.
    #[must_use]
    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add a metadata pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the expiry timestamp (ms).
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the owner.
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Set the access level.
    #[must_use]
    pub fn with_access_level(mut self, level: AccessLevel) -> Self {
        self.access_level = level;
        self
    }

    /// True when the entry has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Rough in-memory footprint in bytes, used for cache byte caps.
    #[must_use]
    pub fn byte_estimate(&self) -> usize {
        let mut bytes = self.id.len() + self.key.len() + self.content.len() + self.namespace.len();
        bytes += self.embedding.as_ref().map_or(0, |e| e.len() * 4);
        bytes += self.tags.iter().map(String::len).sum::<usize>();
        bytes += self
            .metadata
            .iter()
            .map(|(k, v)| {
                k.len()
                    + match v {
                        ScalarValue::String(s) => s.len(),
                        _ => 8,
                    }
            })
            .sum::<usize>();
        bytes += self.references.iter().map(String::len).sum::<usize>();
        bytes + 96
    }

    /// Apply a patch: bump `version`, refresh `updated_at`, overwrite the
    /// provided fields. The id, key, namespace, and `created_at` are
    /// immutable through this path.
    pub fn apply_patch(&mut self, patch: MemoryPatch) {
        if let Some(content) = patch.content {
            self.content = content;
        }
        if let Some(embedding) = patch.embedding {
            self.embedding = embedding;
        }
        if let Some(memory_type) = patch.memory_type {
            self.memory_type = memory_type;
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
        if let Some(metadata) = patch.metadata {
            self.metadata = metadata;
        }
        if let Some(owner_id) = patch.owner_id {
            self.owner_id = owner_id;
        }
        if let Some(access_level) = patch.access_level {
            self.access_level = access_level;
        }
        if let Some(expires_at) = patch.expires_at {
            self.expires_at = expires_at;
        }
        if let Some(references) = patch.references {
            self.references = references;
        }
        self.version += 1;
        self.updated_at = now_ms().max(self.updated_at);
    }
}

/// A partial update. `None` leaves the field untouched; `Some(None)` on the
/// nested options clears the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryPatch {
    /// Replace the content.
    pub content: Option<String>,
    /// Replace (`Some(Some(_))`) or clear (`Some(None)`) the embedding.
    pub embedding: Option<Option<Vec<f32>>>,
    /// Replace the classification.
    pub memory_type: Option<MemoryType>,
    /// Replace the tag set.
    pub tags: Option<Vec<String>>,
    /// Replace the metadata map.
    pub metadata: Option<HashMap<String, ScalarValue>>,
    /// Replace or clear the owner.
    pub owner_id: Option<Option<String>>,
    /// Replace the access level.
    pub access_level: Option<AccessLevel>,
    /// Replace or clear the expiry.
    pub expires_at: Option<Option<i64>>,
    /// Replace the reference list.
    pub references: Option<Vec<String>>,
}

impl MemoryPatch {
    /// Patch that replaces the content.
    #[must_use]
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Patch that replaces the tag set.
    #[must_use]
    pub fn tags(tags: Vec<String>) -> Self {
        Self {
            tags: Some(tags),
            ..Default::default()
        }
    }
}

/// Query classification tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryKind {
    /// Exact (namespace, key) lookup.
    Exact,
    /// Key-prefix scan.
    Prefix,
    /// Tag intersection.
    Tag,
    /// Vector similarity.
    Semantic,
    /// Structured and semantic in parallel, merged.
    Hybrid,
}

/// How hybrid results are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CombineStrategy {
    /// First-seen order (structured then semantic), deduped by id.
    Union,
    /// Only ids present in both, in semantic order.
    Intersection,
    /// Semantic results first, then structured-only additions.
    SemanticFirst,
    /// Structured results first, then semantic-only additions.
    StructuredFirst,
}

impl Default for CombineStrategy {
    fn default() -> Self {
        Self::Union
    }
}

/// Caller-supplied predicate extension point. The only non-data hook the
/// query model admits.
#[derive(Clone)]
pub struct CustomFilter(pub Arc<dyn Fn(&MemoryEntry) -> bool + Send + Sync>);

impl CustomFilter {
    /// Wrap a predicate.
    pub fn new(predicate: impl Fn(&MemoryEntry) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }
}

impl std::fmt::Debug for CustomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CustomFilter(..)")
    }
}

/// The query model. Build with [`crate::query::QueryBuilder`]; every field
/// is a conjunctive filter when set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Explicit routing tag; `None` means auto-classify.
    pub kind: Option<QueryKind>,
    /// Namespace filter.
    pub namespace: Option<String>,
    /// Exact key (within namespace).
    pub key: Option<String>,
    /// Key prefix.
    pub key_prefix: Option<String>,
    /// Tags that must all be present.
    pub tags: Vec<String>,
    /// Classification filter.
    pub memory_type: Option<MemoryType>,
    /// Owner filter.
    pub owner_id: Option<String>,
    /// Access-level filter.
    pub access_level: Option<AccessLevel>,
    /// Semantic content (embedded on demand).
    pub content: Option<String>,
    /// Pre-computed query embedding.
    pub embedding: Option<Vec<f32>>,
    /// Metadata equality filters.
    pub metadata: HashMap<String, ScalarValue>,
    /// Lower bound on `created_at` (inclusive, ms).
    pub created_after: Option<i64>,
    /// Upper bound on `created_at` (inclusive, ms).
    pub created_before: Option<i64>,
    /// Maximum results.
    pub limit: usize,
    /// Results to skip.
    pub offset: usize,
    /// Minimum similarity score in [0, 1] for semantic results.
    pub threshold: Option<f32>,
    /// Candidate-list size override for the vector index.
    pub ef: Option<usize>,
    /// Include entries whose `expires_at` has passed.
    pub include_expired: bool,
    /// Hybrid merge policy.
    pub combine: CombineStrategy,
    /// Caller-supplied predicate, applied last. Not serialized.
    #[serde(skip)]
    pub custom_filter: Option<CustomFilter>,
}

impl MemoryQuery {
    /// Structural match (everything except semantic similarity) against one
    /// entry at time `now`.
    #[must_use]
    pub fn matches_structural(&self, entry: &MemoryEntry, now: i64) -> bool {
        if !self.include_expired && entry.is_expired(now) {
            return false;
        }
        if let Some(ns) = &self.namespace {
            if &entry.namespace != ns {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if &entry.key != key {
                return false;
            }
        }
        if let Some(prefix) = &self.key_prefix {
            if !entry.key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if !self.tags.iter().all(|t| entry.tags.contains(t)) {
            return false;
        }
        if let Some(mt) = self.memory_type {
            if entry.memory_type != mt {
                return false;
            }
        }
        if let Some(owner) = &self.owner_id {
            if entry.owner_id.as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        if let Some(level) = self.access_level {
            if entry.access_level != level {
                return false;
            }
        }
        for (k, v) in &self.metadata {
            if entry.metadata.get(k) != Some(v) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if entry.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if entry.created_at > before {
                return false;
            }
        }
        if let Some(filter) = &self.custom_filter {
            if !(filter.0)(entry) {
                return false;
            }
        }
        true
    }
}

/// Options for a direct vector search.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Number of results requested.
    pub k: usize,
    /// Minimum similarity score in [0, 1].
    pub threshold: Option<f32>,
    /// Candidate-list size override.
    pub ef: Option<usize>,
    /// Structural filters applied after the index returns candidates.
    pub filters: Option<MemoryQuery>,
    /// Include expired entries.
    pub include_expired: bool,
}

impl SearchOptions {
    /// Options requesting `k` results with defaults elsewhere.
    #[must_use]
    pub fn top_k(k: usize) -> Self {
        Self {
            k,
            ..Default::default()
        }
    }
}

/// One vector search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// The matched entry (a copy).
    pub entry: MemoryEntry,
    /// Similarity score, higher = closer.
    pub score: f32,
    /// Raw index distance, smaller = closer.
    pub distance: f32,
}

/// Backend statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendStats {
    /// Live entries.
    pub entries: usize,
    /// Distinct namespaces.
    pub namespaces: usize,
    /// Approximate bytes held.
    pub bytes: usize,
    /// Vector index stats, when the backend carries an index.
    pub index: Option<dashmem_hnsw::IndexStats>,
    /// Cache stats, when the backend fronts a cache.
    pub cache: Option<crate::cache::CacheStats>,
}

/// Health probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Overall verdict.
    pub healthy: bool,
    /// Human-readable summary.
    pub status: String,
    /// Per-subsystem verdicts.
    pub checks: HashMap<String, bool>,
    /// Probe timestamp (ms).
    pub checked_at: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_defaults() {
        let e = MemoryEntry::new("k", "hello", "ns");
        assert_eq!(e.version, 0);
        assert_eq!(e.access_count, 0);
        assert!(e.embedding.is_none());
        assert!(!e.id.is_empty());
        assert_eq!(e.created_at, e.updated_at);
    }

    #[test]
    fn test_entry_expiry() {
        let now = now_ms();
        let live = MemoryEntry::new("k", "c", "ns");
        assert!(!live.is_expired(now));
        let expired = MemoryEntry::new("k", "c", "ns").with_expires_at(now - 1);
        assert!(expired.is_expired(now));
        let future = MemoryEntry::new("k", "c", "ns").with_expires_at(now + 60_000);
        assert!(!future.is_expired(now));
    }

    #[test]
    fn test_apply_patch_bumps_version_and_updated_at() {
        let mut e = MemoryEntry::new("k", "old", "ns");
        let before = e.clone();
        e.apply_patch(MemoryPatch::content("new"));
        assert_eq!(e.content, "new");
        assert_eq!(e.version, before.version + 1);
        assert!(e.updated_at >= before.updated_at);
        assert_eq!(e.id, before.id);
        assert_eq!(e.created_at, before.created_at);
    }

    #[test]
    fn test_patch_clears_expiry() {
        let mut e = MemoryEntry::new("k", "c", "ns").with_expires_at(now_ms() + 1000);
        e.apply_patch(MemoryPatch {
            expires_at: Some(None),
            ..Default::default()
        });
        assert!(e.expires_at.is_none());
    }

    #[test]
    fn test_matches_structural_tags_are_intersection() {
        let e = MemoryEntry::new("k", "c", "ns")
            .with_tag("alpha")
            .with_tag("beta");
        let now = now_ms();
        let mut q = MemoryQuery {
            tags: vec!["alpha".to_string()],
            ..Default::default()
        };
        assert!(q.matches_structural(&e, now));
        q.tags.push("beta".to_string());
        assert!(q.matches_structural(&e, now));
        q.tags.push("gamma".to_string());
        assert!(!q.matches_structural(&e, now));
    }

    #[test]
    fn test_matches_structural_hides_expired() {
        let now = now_ms();
        let e = MemoryEntry::new("k", "c", "ns").with_expires_at(now - 10);
        let mut q = MemoryQuery::default();
        assert!(!q.matches_structural(&e, now));
        q.include_expired = true;
        assert!(q.matches_structural(&e, now));
    }

    #[test]
    fn test_matches_structural_metadata_equality() {
        let e = MemoryEntry::new("k", "c", "ns").with_metadata("source", "web");
        let now = now_ms();
        let mut q = MemoryQuery::default();
        q.metadata
            .insert("source".to_string(), ScalarValue::from("web"));
        assert!(q.matches_structural(&e, now));
        q.metadata
            .insert("source".to_string(), ScalarValue::from("disk"));
        assert!(!q.matches_structural(&e, now));
    }

    #[test]
    fn test_matches_structural_time_window() {
        let e = MemoryEntry::new("k", "c", "ns");
        let q = MemoryQuery {
            created_after: Some(e.created_at + 1),
            ..Default::default()
        };
        assert!(!q.matches_structural(&e, now_ms()));
        let q = MemoryQuery {
            created_after: Some(e.created_at),
            created_before: Some(e.created_at),
            ..Default::default()
        };
        assert!(q.matches_structural(&e, now_ms()));
    }

    #[test]
    fn test_custom_filter() {
        let e = MemoryEntry::new("k", "hello world", "ns");
        let q = MemoryQuery {
            custom_filter: Some(CustomFilter::new(|e| e.content.contains("world"))),
            ..Default::default()
        };
        assert!(q.matches_structural(&e, now_ms()));
        let q = MemoryQuery {
            custom_filter: Some(CustomFilter::new(|e| e.content.contains("mars"))),
            ..Default::default()
        };
        assert!(!q.matches_structural(&e, now_ms()));
    }

    #[test]
    fn test_entry_serde_round_trip() {
        let e = MemoryEntry::new("k", "c", "ns")
            .with_embedding(vec![0.1, 0.2])
            .with_metadata("n", 7i64)
            .with_tag("t");
        let json = serde_json::to_string(&e).unwrap();
        let back: MemoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_byte_estimate_counts_embedding() {
        let plain = MemoryEntry::new("k", "c", "ns");
        let vectored = plain.clone().with_embedding(vec![0.0; 100]);
        assert!(vectored.byte_estimate() >= plain.byte_estimate() + 400);
    }
}
