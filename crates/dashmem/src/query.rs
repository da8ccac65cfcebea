// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Fluent query builder and the named template registry.
//!
//! The builder is pure: every chained call consumes and returns the builder,
//! and nothing touches a backend until [`QueryBuilder::build`] validates the
//! composed query. Templates are sugar - named functions that pre-seed a
//! builder - and carry no additional contract.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::types::{
    AccessLevel, CombineStrategy, CustomFilter, MemoryEntry, MemoryQuery, MemoryType, QueryKind,
    ScalarValue,
};

/// Default result limit when the caller never sets one.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Immutable fluent builder for [`MemoryQuery`].
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    query: MemoryQuery,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryBuilder {
    /// Start a builder with defaults (`limit = 100`).
    #[must_use]
    pub fn new() -> Self {
        Self {
            query: MemoryQuery {
                limit: DEFAULT_QUERY_LIMIT,
                ..Default::default()
            },
        }
    }

    /// Tag the query with an explicit routing kind.
    #[must_use]
    pub fn kind(mut self, kind: QueryKind) -> Self {
        self.query.kind = Some(kind);
        self
    }

    /// Semantic content to embed and match.
    #[must_use]
    pub fn semantic(mut self, content: impl Into<String>) -> Self {
        self.query.content = Some(content.into());
        self
    }

    /// Pre-computed query embedding.
    #[must_use]
    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.query.embedding = Some(embedding);
        self
    }

    /// Namespace filter.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.query.namespace = Some(namespace.into());
        self
    }

    /// Exact key filter.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.query.key = Some(key.into());
        self
    }

    /// Key-prefix filter.
    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.query.key_prefix = Some(prefix.into());
        self
    }

    /// Add a tag to the intersection filter.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.query.tags.push(tag.into());
        self
    }

    /// Replace the tag set.
    #[must_use]
    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.query.tags = tags;
        self
    }

    /// Classification filter.
    #[must_use]
    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.query.memory_type = Some(memory_type);
        self
    }

    /// Owner filter.
    #[must_use]
    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.query.owner_id = Some(owner_id.into());
        self
    }

    /// Access-level filter.
    #[must_use]
    pub fn access_level(mut self, level: AccessLevel) -> Self {
        self.query.access_level = Some(level);
        self
    }

    /// Metadata equality filter.
    #[must_use]
    pub fn metadata_eq(mut self, key: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.query.metadata.insert(key.into(), value.into());
        self
    }

    /// Lower bound on `created_at` (inclusive, ms).
    #[must_use]
    pub fn created_after(mut self, after: i64) -> Self {
        self.query.created_after = Some(after);
        self
    }

    /// Upper bound on `created_at` (inclusive, ms).
    #[must_use]
    pub fn created_before(mut self, before: i64) -> Self {
        self.query.created_before = Some(before);
        self
    }

    /// Maximum results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = limit;
        self
    }

    /// Results to skip.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = offset;
        self
    }

    /// Minimum similarity score for semantic results.
    #[must_use]
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.query.threshold = Some(threshold);
        self
    }

    /// Candidate-list size override for the vector index.
    #[must_use]
    pub fn ef(mut self, ef: usize) -> Self {
        self.query.ef = Some(ef);
        self
    }

    /// Include expired entries.
    #[must_use]
    pub fn include_expired(mut self, include: bool) -> Self {
        self.query.include_expired = include;
        self
    }

    /// Hybrid merge policy.
    #[must_use]
    pub fn combine(mut self, combine: CombineStrategy) -> Self {
        self.query.combine = combine;
        self
    }

    /// Caller-supplied predicate, applied after all structural filters.
    #[must_use]
    pub fn custom_filter(
        mut self,
        predicate: impl Fn(&MemoryEntry) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.query.custom_filter = Some(CustomFilter::new(predicate));
        self
    }

    /// Validate and produce the query.
    ///
    /// # Errors
    ///
    /// `InvalidQuery` when `limit == 0`, the threshold is outside [0, 1], or
    /// the time range is inverted. No backend is contacted on failure.
    pub fn build(self) -> Result<MemoryQuery> {
        let q = self.query;
        if q.limit == 0 {
            return Err(MemoryError::InvalidQuery {
                reason: "limit must be greater than 0".to_string(),
            });
        }
        if let Some(t) = q.threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(MemoryError::InvalidQuery {
                    reason: format!("threshold {t} outside [0, 1]"),
                });
            }
        }
        if let (Some(after), Some(before)) = (q.created_after, q.created_before) {
            if after > before {
                return Err(MemoryError::InvalidQuery {
                    reason: format!("inverted time range: created_after {after} > created_before {before}"),
                });
            }
        }
        if q.kind == Some(QueryKind::Semantic) && q.content.is_none() && q.embedding.is_none() {
            return Err(MemoryError::InvalidQuery {
                reason: "semantic query needs content or an embedding".to_string(),
            });
        }
        Ok(q)
    }
}

type TemplateFn = dyn Fn() -> QueryBuilder + Send + Sync;

/// Named query templates: builder factories keyed by name.
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<TemplateFn>>,
}

impl TemplateRegistry {
    /// Registry pre-seeded with the built-in templates.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            templates: HashMap::new(),
        };
        registry.register("recent-episodic", || {
            QueryBuilder::new()
                .memory_type(MemoryType::Episodic)
                .limit(20)
        });
        registry.register("tag-intersect", || {
            QueryBuilder::new().kind(QueryKind::Tag)
        });
        registry.register("semantic-search", || {
            QueryBuilder::new().kind(QueryKind::Semantic).threshold(0.7)
        });
        registry.register("namespace-dump", || {
            QueryBuilder::new().include_expired(true).limit(1000)
        });
        registry
    }

    /// Register (or replace) a template.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        template: impl Fn() -> QueryBuilder + Send + Sync + 'static,
    ) {
        self.templates.insert(name.into(), Arc::new(template));
    }

    /// Start a builder from a template.
    #[must_use]
    pub fn builder(&self, name: &str) -> Option<QueryBuilder> {
        self.templates.get(name).map(|t| t())
    }

    /// Registered template names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_composes_fields() {
        let q = QueryBuilder::new()
            .namespace("agents")
            .tag("alpha")
            .tag("beta")
            .memory_type(MemoryType::Working)
            .limit(5)
            .offset(10)
            .threshold(0.5)
            .build()
            .unwrap();
        assert_eq!(q.namespace.as_deref(), Some("agents"));
        assert_eq!(q.tags, vec!["alpha", "beta"]);
        assert_eq!(q.limit, 5);
        assert_eq!(q.offset, 10);
        assert_eq!(q.threshold, Some(0.5));
    }

    #[test]
    fn test_builder_is_pure() {
        let base = QueryBuilder::new().namespace("ns");
        let with_tag = base.clone().tag("t");
        let without = base.build().unwrap();
        assert!(without.tags.is_empty());
        assert_eq!(with_tag.build().unwrap().tags, vec!["t"]);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = QueryBuilder::new().limit(0).build().unwrap_err();
        assert!(matches!(err, MemoryError::InvalidQuery { .. }));
    }

    #[test]
    fn test_threshold_bounds() {
        assert!(QueryBuilder::new().threshold(0.0).build().is_ok());
        assert!(QueryBuilder::new().threshold(1.0).build().is_ok());
        assert!(QueryBuilder::new().threshold(1.5).build().is_err());
        assert!(QueryBuilder::new().threshold(-0.1).build().is_err());
    }

    #[test]
    fn test_inverted_time_range_rejected() {
        let err = QueryBuilder::new()
            .created_after(2000)
            .created_before(1000)
            .build()
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidQuery { .. }));
        assert!(QueryBuilder::new()
            .created_after(1000)
            .created_before(1000)
            .build()
            .is_ok());
    }

    #[test]
    fn test_semantic_kind_requires_content_or_embedding() {
        assert!(QueryBuilder::new()
            .kind(QueryKind::Semantic)
            .build()
            .is_err());
        assert!(QueryBuilder::new()
            .kind(QueryKind::Semantic)
            .semantic("find me")
            .build()
            .is_ok());
        assert!(QueryBuilder::new()
            .kind(QueryKind::Semantic)
            .embedding(vec![0.1, 0.2])
            .build()
            .is_ok());
    }

    #[test]
    fn test_default_limit() {
        let q = QueryBuilder::new().build().unwrap();
        assert_eq!(q.limit, DEFAULT_QUERY_LIMIT);
    }

    #[test]
    fn test_builtin_templates() {
        let registry = TemplateRegistry::new();
        assert!(registry.names().contains(&"recent-episodic".to_string()));

        let q = registry.builder("recent-episodic").unwrap().build().unwrap();
        assert_eq!(q.memory_type, Some(MemoryType::Episodic));
        assert_eq!(q.limit, 20);

        assert!(registry.builder("no-such-template").is_none());
    }

    #[test]
    fn test_template_is_sugar_over_builder() {
        let registry = TemplateRegistry::new();
        // Template defaults can be overridden through normal chaining.
        let q = registry
            .builder("semantic-search")
            .unwrap()
            .semantic("query text")
            .threshold(0.2)
            .build()
            .unwrap();
        assert_eq!(q.threshold, Some(0.2));
        assert_eq!(q.kind, Some(QueryKind::Semantic));
    }

    #[test]
    fn test_custom_template_registration() {
        let mut registry = TemplateRegistry::new();
        registry.register("mine", || QueryBuilder::new().namespace("custom"));
        let q = registry.builder("mine").unwrap().build().unwrap();
        assert_eq!(q.namespace.as_deref(), Some("custom"));
    }
}
