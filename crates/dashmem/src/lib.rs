// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # DashMem
//!
//! Unified memory core for agent orchestration: structured key/value/tag
//! storage and approximate-nearest-neighbor vector search behind one fluent
//! query facade.
//!
//! ## Architecture
//!
//! ```text
//! Query -> QueryBuilder -> HybridMemory (router)
//!                              |- StructuredStore   (exact/prefix/tag/time)
//!                              |- VectorMemoryStore (semantic, HNSW + cache)
//!                              `- merge + query cache -> caller
//! ```
//!
//! Mutations dual-write to both backends by default; `get_by_key` always
//! reads the structured side, `search` and `get(id)` the vector side.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use dashmem::{
//!     HashEmbeddings, HybridMemory, MemoryBackend, MemoryConfig, MemoryEntry, QueryBuilder,
//! };
//! use dashmem_hnsw::HnswConfig;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> dashmem::Result<()> {
//! let config = MemoryConfig {
//!     hnsw: HnswConfig { dimension: 16, ..Default::default() },
//!     ..Default::default()
//! };
//! let memory = HybridMemory::new(config).with_embedder(Arc::new(HashEmbeddings::new(16)));
//!
//! let entry = MemoryEntry::new("greeting", "hello from the swarm", "agents");
//! let id = entry.id.clone();
//! memory.store(entry).await?;
//!
//! let results = memory
//!     .query(&QueryBuilder::new().namespace("agents").key("greeting").build()?)
//!     .await?;
//! assert_eq!(results[0].id, id);
//! # Ok(())
//! # }
//! ```

/// Backend contract shared by the structured and vector stores.
pub mod backend;
/// LRU+TTL cache and the tiered L1/L2 variant.
pub mod cache;
/// Configuration structs, env accessors, and feature flags.
pub mod config;
/// Embedding generation abstraction.
pub mod embeddings;
/// Error taxonomy.
pub mod error;
/// Fire-and-forget observation events.
pub mod events;
/// Streaming backend-to-backend migration.
pub mod migration;
/// Snapshot persistence with integrity headers.
pub mod persistence;
/// Fluent query builder and templates.
pub mod query;
/// Hybrid router over both backends.
pub mod router;
/// Structured key/value/tag store.
pub mod structured;
/// Core data model.
pub mod types;
/// Vector-indexed store.
pub mod vector;

pub use backend::MemoryBackend;
pub use cache::{ByteEstimate, CacheConfig, CacheStats, LruTtlCache, SecondTier, TieredCache};
pub use config::{FeatureFlags, MemoryConfig};
pub use embeddings::{EmbeddingGenerator, HashEmbeddings};
pub use error::{MemoryError, Result, WriteTarget};
pub use events::{EventBus, MemoryEvent};
pub use migration::{MigrationConfig, MigrationReport, Migrator};
pub use query::{QueryBuilder, TemplateRegistry};
pub use router::{merge_results, HybridMemory, RouterConfig};
pub use structured::StructuredStore;
pub use types::{
    AccessLevel, BackendStats, CombineStrategy, CustomFilter, HealthCheckResult, MemoryEntry,
    MemoryPatch, MemoryQuery, MemoryType, QueryKind, ScalarValue, SearchOptions, SearchResult,
};
pub use vector::VectorMemoryStore;
