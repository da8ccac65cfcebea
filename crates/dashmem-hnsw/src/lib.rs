// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # DashMem HNSW
//!
//! Approximate nearest-neighbor search for the DashMem memory core.
//!
//! This crate is the vector-search substrate: distance kernels, the binary
//! heaps used by best-first traversal, optional lossy quantization, and the
//! hierarchical navigable small-world graph itself.
//!
//! ## Quick start
//!
//! ```rust
//! use dashmem_hnsw::{HnswConfig, HnswIndex};
//!
//! let index = HnswIndex::new(HnswConfig {
//!     dimension: 4,
//!     ..Default::default()
//! });
//! index.add_point("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
//! index.add_point("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
//!
//! let hits = index.search(&[0.9, 0.1, 0.0, 0.0], 1, None).unwrap();
//! assert_eq!(hits[0].0, "a");
//! ```
//!
//! ## Guarantees
//!
//! - Single-writer / multi-reader: concurrent searches run against a
//!   consistent snapshot; mutations serialize on the write lock.
//! - Stable ordering: equal distances tie-break by insertion order.
//! - No NaN escape: zero vectors normalize to themselves and score as
//!   maximally dissimilar under cosine.

/// Distance kernels over f32 vectors.
pub mod distance;
/// Multilayer HNSW graph: insert, delete, search, rebuild.
pub mod graph;
/// Binary heaps backing best-first traversal.
pub mod heap;
/// Binary / scalar / product vector compression.
pub mod quantizer;

pub use distance::{cosine_similarity, normalize, DistanceMetric};
pub use graph::{HnswConfig, HnswIndex, IndexError, IndexResult, IndexStats, MAX_LEVEL};
pub use heap::{BoundedMaxHeap, MinHeap};
pub use quantizer::{EncodedVector, QuantizationMode, Quantizer};
