// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Hierarchical Navigable Small World (HNSW) index.
//!
//! A multilayer proximity graph supporting online insert/delete and
//! best-first top-k search. Level assignment follows the standard
//! `floor(-ln(U) * 1/ln(M))` draw capped at [`MAX_LEVEL`]; per-level
//! adjacency is pruned back to `M` once it exceeds `2*M`.
//!
//! Concurrency: single-writer / multi-reader. Searches take a read lock and
//! never observe a partially linked node; `add_point`, `remove_point`, and
//! `rebuild` take the write lock.
//!
//! Ties on distance are broken by insertion order, so repeated searches over
//! identical vectors return a stable ordering.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::distance::{cosine_distance_normalized, normalize, DistanceMetric};
use crate::heap::{BoundedMaxHeap, MinHeap};
use crate::quantizer::{EncodedVector, QuantizationMode, Quantizer};

/// Hard cap on the level a node can be assigned.
pub const MAX_LEVEL: usize = 16;

/// Errors surfaced by index operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum IndexError {
    /// Vector length differs from the configured dimension.
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The configured index dimension.
        expected: usize,
        /// The length of the offending vector.
        actual: usize,
    },
    /// The index already holds `max_elements` vectors.
    #[error("Index capacity exceeded: max_elements = {max_elements}")]
    CapacityExceeded {
        /// The configured element cap.
        max_elements: usize,
    },
}

/// Result alias for index operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Configuration for the HNSW index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Dimension of indexed vectors.
    pub dimension: usize,
    /// Maximum number of elements the index will hold.
    pub max_elements: usize,
    /// Maximum adjacency degree per layer (M parameter).
    pub m: usize,
    /// Candidate-list size during construction (`ef_construction`).
    pub ef_construction: usize,
    /// Baseline candidate-list size during search; the effective value is
    /// `max(k, ef_search)` unless the caller supplies its own ef.
    pub ef_search: usize,
    /// Distance metric.
    pub metric: DistanceMetric,
    /// Optional quantization applied transparently at index entry.
    pub quantization: Option<QuantizationMode>,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimension: 1536,
            max_elements: 10_000,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            metric: DistanceMetric::Cosine,
            quantization: None,
        }
    }
}

/// Index statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    /// Number of vectors currently indexed.
    pub vector_count: usize,
    /// Approximate memory footprint in bytes (vectors + adjacency).
    pub memory_bytes: usize,
    /// Mean search latency in milliseconds over the index lifetime.
    pub avg_search_time_ms: f64,
    /// Cumulative time spent in insert/rebuild, in milliseconds.
    pub build_time_ms: u64,
    /// Nominal compression ratio (1.0 when quantization is off).
    pub compression_ratio: f32,
}

struct HnswNode {
    id: String,
    /// Monotonic insertion counter, used as the stable tie-break.
    seq: u64,
    stored: EncodedVector,
    /// Pre-normalized copy, present iff metric is cosine and no quantizer.
    normalized: Option<Vec<f32>>,
    level: usize,
    /// Adjacency per level, indices 0..=level.
    neighbors: Vec<Vec<u32>>,
}

#[derive(Default)]
struct HnswInner {
    nodes: Vec<Option<HnswNode>>,
    free: Vec<u32>,
    id_to_slot: HashMap<String, u32>,
    entry_point: Option<u32>,
    max_level: usize,
    count: usize,
    next_seq: u64,
    build_time_ms: u64,
}

impl HnswInner {
    fn node(&self, slot: u32) -> &HnswNode {
        // Slots handed out by traversal always point at live nodes; the
        // write lock guarantees no concurrent detach.
        self.nodes[slot as usize]
            .as_ref()
            .unwrap_or_else(|| unreachable!("dangling slot {slot}"))
    }

    fn node_mut(&mut self, slot: u32) -> &mut HnswNode {
        self.nodes[slot as usize]
            .as_mut()
            .unwrap_or_else(|| unreachable!("dangling slot {slot}"))
    }
}

/// Query vector prepared once per operation.
struct PreparedQuery {
    raw: Vec<f32>,
    normalized: Option<Vec<f32>>,
}

#[derive(Default)]
struct SearchTimings {
    searches: u64,
    total_micros: u64,
}

/// HNSW vector index.
pub struct HnswIndex {
    config: HnswConfig,
    quantizer: Option<Quantizer>,
    inner: RwLock<HnswInner>,
    timings: Mutex<SearchTimings>,
}

impl HnswIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new(config: HnswConfig) -> Self {
        let quantizer = config.quantization.map(Quantizer::new);
        Self {
            config,
            quantizer,
            inner: RwLock::new(HnswInner::default()),
            timings: Mutex::new(SearchTimings::default()),
        }
    }

    /// The index configuration.
    #[must_use]
    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Number of vectors currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().count
    }

    /// True when the index holds no vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `id` is indexed.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().id_to_slot.contains_key(id)
    }

    fn prepare_query(&self, v: &[f32]) -> PreparedQuery {
        let normalized = if self.config.metric == DistanceMetric::Cosine
            && self.quantizer.is_none()
        {
            Some(normalize(v))
        } else {
            None
        };
        PreparedQuery {
            raw: v.to_vec(),
            normalized,
        }
    }

    fn check_dimension(&self, v: &[f32]) -> IndexResult<()> {
        if v.len() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                actual: v.len(),
            });
        }
        Ok(())
    }

    /// Distance from a prepared query to a stored node. Quantized vectors go
    /// through the single decode path before the kernel runs.
    fn query_distance(&self, q: &PreparedQuery, node: &HnswNode) -> f32 {
        if let (Some(qn), Some(nn)) = (&q.normalized, &node.normalized) {
            return cosine_distance_normalized(qn, nn);
        }
        match &node.stored {
            EncodedVector::Raw(v) => self.config.metric.distance(&q.raw, v),
            encoded => {
                let decoded = encoded.decode();
                self.config.metric.distance(&q.raw, &decoded)
            }
        }
    }

    /// Distance between two stored nodes (used by neighbor pruning).
    fn node_distance(&self, a: &HnswNode, b: &HnswNode) -> f32 {
        if let (Some(an), Some(bn)) = (&a.normalized, &b.normalized) {
            return cosine_distance_normalized(an, bn);
        }
        let da;
        let db;
        let va: &[f32] = match &a.stored {
            EncodedVector::Raw(v) => v,
            encoded => {
                da = encoded.decode();
                &da
            }
        };
        let vb: &[f32] = match &b.stored {
            EncodedVector::Raw(v) => v,
            encoded => {
                db = encoded.decode();
                &db
            }
        };
        self.config.metric.distance(va, vb)
    }

    /// Greedy single-neighbor descent (ef = 1) on one level.
    fn greedy_closest(
        &self,
        inner: &HnswInner,
        q: &PreparedQuery,
        start: u32,
        level: usize,
    ) -> u32 {
        let mut current = start;
        let mut current_dist = self.query_distance(q, inner.node(current));
        loop {
            let mut improved = false;
            for &nb in &inner.node(current).neighbors[level] {
                let d = self.query_distance(q, inner.node(nb));
                if d < current_dist {
                    current = nb;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first search on one level, returning up to `ef` candidates
    /// sorted by ascending distance (ties by insertion order).
    fn search_layer(
        &self,
        inner: &HnswInner,
        q: &PreparedQuery,
        entry: u32,
        level: usize,
        ef: usize,
    ) -> Vec<(f32, u32)> {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates: MinHeap<u32> = MinHeap::new();
        let mut results: BoundedMaxHeap<(u32, u64)> = BoundedMaxHeap::new(ef);

        let entry_dist = self.query_distance(q, inner.node(entry));
        visited.insert(entry);
        candidates.push(entry, entry_dist);
        results.insert((entry, inner.node(entry).seq), entry_dist);

        while let Some((dist, slot)) = candidates.extract_min() {
            // Termination: the next candidate is farther than the worst
            // retained result and the result set is already full.
            if results.is_full() && results.max_priority().is_some_and(|worst| dist > worst) {
                break;
            }
            for &nb in &inner.node(slot).neighbors[level] {
                if !visited.insert(nb) {
                    continue;
                }
                let node = inner.node(nb);
                let d = self.query_distance(q, node);
                if !results.is_full()
                    || results.max_priority().is_some_and(|worst| d < worst)
                {
                    candidates.push(nb, d);
                    results.insert((nb, node.seq), d);
                }
            }
        }

        let mut sorted = results.into_sorted();
        sorted.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1 .1.cmp(&b.1 .1))
        });
        sorted.into_iter().map(|(d, (slot, _seq))| (d, slot)).collect()
    }

    /// Draw a level: `floor(-ln(U) * 1/ln(M))`, capped at [`MAX_LEVEL`].
    fn random_level(&self) -> usize {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..=1.0);
        let scale = 1.0 / (self.config.m.max(2) as f64).ln();
        ((-u.ln() * scale).floor() as usize).min(MAX_LEVEL)
    }

    /// Insert a vector. An existing point with the same id is replaced.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` when `v.len() != dimension`; `CapacityExceeded`
    /// when the index is full. Failed inserts leave the graph untouched.
    pub fn add_point(&self, id: &str, v: &[f32]) -> IndexResult<()> {
        self.check_dimension(v)?;
        let started = Instant::now();
        let mut inner = self.inner.write();

        if inner.id_to_slot.contains_key(id) {
            detach(&mut inner, id);
        }
        if inner.count >= self.config.max_elements {
            return Err(IndexError::CapacityExceeded {
                max_elements: self.config.max_elements,
            });
        }

        let q = self.prepare_query(v);
        let level = self.random_level();
        let stored = match &self.quantizer {
            Some(quantizer) => quantizer.encode(v),
            None => EncodedVector::Raw(v.to_vec()),
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let node = HnswNode {
            id: id.to_string(),
            seq,
            stored,
            normalized: q.normalized.clone(),
            level,
            neighbors: vec![Vec::new(); level + 1],
        };

        let slot = match inner.free.pop() {
            Some(slot) => {
                inner.nodes[slot as usize] = Some(node);
                slot
            }
            None => {
                inner.nodes.push(Some(node));
                (inner.nodes.len() - 1) as u32
            }
        };
        inner.id_to_slot.insert(id.to_string(), slot);
        inner.count += 1;

        let Some(mut current) = inner.entry_point else {
            inner.entry_point = Some(slot);
            inner.max_level = level;
            inner.build_time_ms += started.elapsed().as_millis() as u64;
            return Ok(());
        };

        // Greedy descent through the levels above the new node.
        for l in ((level + 1)..=inner.max_level).rev() {
            current = self.greedy_closest(&inner, &q, current, l);
        }

        // Link into every level the new node participates in.
        let m = self.config.m;
        for l in (0..=level.min(inner.max_level)).rev() {
            let candidates = self.search_layer(&inner, &q, current, l, self.config.ef_construction);
            let selected: Vec<u32> = candidates
                .iter()
                .filter(|(_, s)| *s != slot)
                .take(m)
                .map(|(_, s)| *s)
                .collect();
            for &nb in &selected {
                inner.node_mut(slot).neighbors[l].push(nb);
                inner.node_mut(nb).neighbors[l].push(slot);
                if inner.node(nb).neighbors[l].len() > 2 * m {
                    self.prune_neighbors(&mut inner, nb, l);
                }
            }
            if let Some((_, closest)) = candidates.first() {
                current = *closest;
            }
        }

        if level > inner.max_level {
            inner.entry_point = Some(slot);
            inner.max_level = level;
        }
        inner.build_time_ms += started.elapsed().as_millis() as u64;
        Ok(())
    }

    /// Prune a node's adjacency on one level back to the M closest.
    fn prune_neighbors(&self, inner: &mut HnswInner, slot: u32, level: usize) {
        let neighbors = inner.node(slot).neighbors[level].clone();
        let mut scored: Vec<(f32, u64, u32)> = neighbors
            .iter()
            .map(|&nb| {
                let d = self.node_distance(inner.node(slot), inner.node(nb));
                (d, inner.node(nb).seq, nb)
            })
            .collect();
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        let keep: Vec<u32> = scored
            .into_iter()
            .take(self.config.m)
            .map(|(_, _, nb)| nb)
            .collect();
        let dropped: Vec<u32> = neighbors
            .iter()
            .copied()
            .filter(|nb| !keep.contains(nb))
            .collect();
        inner.node_mut(slot).neighbors[level] = keep;
        // Keep adjacency symmetric: dropped neighbors forget this node too.
        for nb in dropped {
            inner.node_mut(nb).neighbors[level].retain(|&s| s != slot);
        }
    }

    /// Remove a point. Returns `true` when the id was present.
    pub fn remove_point(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        detach(&mut inner, id)
    }

    /// Search for the `k` nearest neighbors of `q`.
    ///
    /// The effective candidate-list size is `max(k, ef)` where `ef` defaults
    /// to the configured `ef_search`; an `ef` smaller than `k` is silently
    /// raised. `k == 0` returns an empty result.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` when the query length differs from the configured
    /// dimension.
    pub fn search(&self, q: &[f32], k: usize, ef: Option<usize>) -> IndexResult<Vec<(String, f32)>> {
        self.check_dimension(q)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let inner = self.inner.read();
        let Some(entry) = inner.entry_point else {
            return Ok(Vec::new());
        };
        let prepared = self.prepare_query(q);

        let mut current = entry;
        for l in (1..=inner.max_level).rev() {
            current = self.greedy_closest(&inner, &prepared, current, l);
        }
        let effective_ef = k.max(ef.unwrap_or(self.config.ef_search));
        let found = self.search_layer(&inner, &prepared, current, 0, effective_ef);
        let results: Vec<(String, f32)> = found
            .into_iter()
            .take(k)
            .map(|(d, slot)| (inner.node(slot).id.clone(), d))
            .collect();
        drop(inner);

        let mut timings = self.timings.lock();
        timings.searches += 1;
        timings.total_micros += started.elapsed().as_micros() as u64;
        Ok(results)
    }

    /// Search with a post-filter predicate on ids. Over-fetches by a factor
    /// of 3 and filters; the returned length is best-effort up to `k`.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` as for [`Self::search`].
    pub fn search_filtered(
        &self,
        q: &[f32],
        k: usize,
        predicate: &dyn Fn(&str) -> bool,
        ef: Option<usize>,
    ) -> IndexResult<Vec<(String, f32)>> {
        let overfetch = k.saturating_mul(3);
        let candidates = self.search(q, overfetch, ef.map(|e| e.max(overfetch)))?;
        Ok(candidates
            .into_iter()
            .filter(|(id, _)| predicate(id))
            .take(k)
            .collect())
    }

    /// Drop everything and re-insert from a batch.
    ///
    /// # Errors
    ///
    /// Propagates the first insert failure; earlier inserts remain.
    pub fn rebuild<I>(&self, points: I) -> IndexResult<()>
    where
        I: IntoIterator<Item = (String, Vec<f32>)>,
    {
        {
            let mut inner = self.inner.write();
            *inner = HnswInner::default();
        }
        for (id, v) in points {
            self.add_point(&id, &v)?;
        }
        tracing::debug!(count = self.len(), "index rebuilt");
        Ok(())
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read();
        let mut memory_bytes = 0usize;
        for node in inner.nodes.iter().flatten() {
            memory_bytes += node.stored.byte_size();
            memory_bytes += node.normalized.as_ref().map_or(0, |n| n.len() * 4);
            memory_bytes += node.neighbors.iter().map(|n| n.len() * 4).sum::<usize>();
            memory_bytes += node.id.len();
        }
        let timings = self.timings.lock();
        let avg_search_time_ms = if timings.searches == 0 {
            0.0
        } else {
            timings.total_micros as f64 / timings.searches as f64 / 1000.0
        };
        IndexStats {
            vector_count: inner.count,
            memory_bytes,
            avg_search_time_ms,
            build_time_ms: inner.build_time_ms,
            compression_ratio: self
                .quantizer
                .as_ref()
                .map_or(1.0, |q| q.compression_ratio(self.config.dimension)),
        }
    }
}

/// Detach and free a node by id. Returns `true` when the id was present.
fn detach(inner: &mut HnswInner, id: &str) -> bool {
    let Some(slot) = inner.id_to_slot.remove(id) else {
        return false;
    };
    let Some(node) = inner.nodes[slot as usize].take() else {
        return false;
    };
    // Symmetric detach from every adjacency list that references the node.
    for (level, neighbors) in node.neighbors.iter().enumerate() {
        for &nb in neighbors {
            if let Some(other) = inner.nodes[nb as usize].as_mut() {
                other.neighbors[level].retain(|&s| s != slot);
            }
        }
    }
    inner.free.push(slot);
    inner.count -= 1;

    if inner.entry_point == Some(slot) {
        // Re-elect: highest remaining level wins, ties arbitrary.
        let replacement = inner
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (i as u32, n.level)))
            .max_by_key(|(_, level)| *level);
        match replacement {
            Some((new_entry, level)) => {
                inner.entry_point = Some(new_entry);
                inner.max_level = level;
            }
            None => {
                inner.entry_point = None;
                inner.max_level = 0;
            }
        }
    }
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn small_config(dim: usize) -> HnswConfig {
        HnswConfig {
            dimension: dim,
            max_elements: 100,
            m: 8,
            ef_construction: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_find() {
        let index = HnswIndex::new(small_config(4));
        index.add_point("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add_point("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        index.add_point("c", &[1.0, 1.0, 0.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.01, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "a");
        assert_eq!(results[1].0, "c");
        assert!(results[0].1 < results[1].1, "distances must strictly increase");
    }

    #[test]
    fn test_self_recall() {
        let index = HnswIndex::new(HnswConfig {
            dimension: 8,
            max_elements: 200,
            ..Default::default()
        });
        // The 0.001 * i term keeps every vector distinct.
        let vectors: Vec<Vec<f32>> = (0..50)
            .map(|i| {
                (0..8)
                    .map(|j| ((i * 31 + j * 7) % 13) as f32 / 13.0 + i as f32 * 0.001)
                    .collect()
            })
            .collect();
        for (i, v) in vectors.iter().enumerate() {
            index.add_point(&format!("v{i}"), v).unwrap();
        }
        for (i, v) in vectors.iter().enumerate() {
            let results = index.search(v, 1, None).unwrap();
            assert_eq!(results[0].0, format!("v{i}"), "self-recall failed for v{i}");
        }
    }

    #[test]
    fn test_dimension_mismatch_leaves_index_unchanged() {
        let index = HnswIndex::new(small_config(4));
        index.add_point("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        let err = index.add_point("bad", &[1.0, 0.0]).unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        );
        assert_eq!(index.len(), 1);
        assert!(!index.contains("bad"));
    }

    #[test]
    fn test_capacity_exceeded() {
        let config = HnswConfig {
            dimension: 2,
            max_elements: 3,
            m: 4,
            ef_construction: 8,
            ..Default::default()
        };
        let index = HnswIndex::new(config);
        for i in 0..3 {
            index.add_point(&format!("v{i}"), &[i as f32, 1.0]).unwrap();
        }
        let err = index.add_point("overflow", &[9.0, 1.0]).unwrap_err();
        assert_eq!(err, IndexError::CapacityExceeded { max_elements: 3 });
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_search_k_zero_returns_empty() {
        let index = HnswIndex::new(small_config(2));
        index.add_point("a", &[1.0, 0.0]).unwrap();
        assert!(index.search(&[1.0, 0.0], 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_search_empty_index() {
        let index = HnswIndex::new(small_config(2));
        assert!(index.search(&[1.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_search_ef_smaller_than_k_is_raised() {
        let index = HnswIndex::new(small_config(2));
        for i in 0..10 {
            index
                .add_point(&format!("v{i}"), &[i as f32 + 1.0, 1.0])
                .unwrap();
        }
        // ef = 1 < k = 5 must still return 5 results.
        let results = index.search(&[1.0, 1.0], 5, Some(1)).unwrap();
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn test_remove_point() {
        let index = HnswIndex::new(small_config(2));
        index.add_point("a", &[1.0, 0.0]).unwrap();
        index.add_point("b", &[0.0, 1.0]).unwrap();
        assert!(index.remove_point("a"));
        assert!(!index.remove_point("a"), "second delete is false");
        assert_eq!(index.len(), 1);
        let results = index.search(&[1.0, 0.0], 2, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "b");
    }

    #[test]
    fn test_remove_entry_point_reelects() {
        let index = HnswIndex::new(small_config(2));
        for i in 0..20 {
            index
                .add_point(&format!("v{i}"), &[(i % 5) as f32, (i / 5) as f32 + 1.0])
                .unwrap();
        }
        // Remove half the points, including whichever is the entry point.
        for i in 0..10 {
            assert!(index.remove_point(&format!("v{i}")));
        }
        let results = index.search(&[0.0, 1.0], 5, None).unwrap();
        assert_eq!(results.len(), 5);
        for (id, _) in &results {
            let n: usize = id[1..].parse().unwrap();
            assert!(n >= 10, "deleted point {id} resurfaced");
        }
    }

    #[test]
    fn test_identical_vectors_stable_order() {
        let index = HnswIndex::new(small_config(2));
        index.add_point("first", &[1.0, 1.0]).unwrap();
        index.add_point("second", &[1.0, 1.0]).unwrap();
        let a = index.search(&[1.0, 1.0], 2, None).unwrap();
        let b = index.search(&[1.0, 1.0], 2, None).unwrap();
        assert_eq!(a, b, "order must be stable across repeated calls");
        assert_eq!(a[0].1, a[1].1, "identical vectors share a distance");
        assert_eq!(a[0].0, "first", "ties break by insertion order");
    }

    #[test]
    fn test_replace_existing_id() {
        let index = HnswIndex::new(small_config(2));
        index.add_point("a", &[1.0, 0.0]).unwrap();
        index.add_point("a", &[0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);
        let results = index.search(&[0.0, 1.0], 1, None).unwrap();
        assert_eq!(results[0].0, "a");
        assert!(results[0].1 < 0.01);
    }

    #[test]
    fn test_search_filtered() {
        let index = HnswIndex::new(small_config(2));
        for i in 0..12 {
            index
                .add_point(&format!("v{i}"), &[(i as f32).cos(), (i as f32).sin()])
                .unwrap();
        }
        let results = index
            .search_filtered(
                &[1.0, 0.0],
                3,
                &|id: &str| id[1..].parse::<usize>().unwrap() % 2 == 0,
                None,
            )
            .unwrap();
        assert!(results.len() <= 3);
        assert!(!results.is_empty());
        for (id, _) in &results {
            let n: usize = id[1..].parse().unwrap();
            assert_eq!(n % 2, 0);
        }
    }

    #[test]
    fn test_rebuild() {
        let index = HnswIndex::new(small_config(2));
        index.add_point("old", &[1.0, 0.0]).unwrap();
        index
            .rebuild(vec![
                ("x".to_string(), vec![1.0, 0.0]),
                ("y".to_string(), vec![0.0, 1.0]),
            ])
            .unwrap();
        assert_eq!(index.len(), 2);
        assert!(!index.contains("old"));
        assert!(index.contains("x"));
    }

    #[test]
    fn test_quantized_index_still_searches() {
        let config = HnswConfig {
            dimension: 8,
            max_elements: 100,
            m: 8,
            ef_construction: 32,
            quantization: Some(QuantizationMode::Scalar { bits: 8 }),
            ..Default::default()
        };
        let index = HnswIndex::new(config);
        index
            .add_point("a", &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();
        index
            .add_point("b", &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0])
            .unwrap();
        let results = index
            .search(&[0.9, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1, None)
            .unwrap();
        assert_eq!(results[0].0, "a");
        assert!(index.stats().compression_ratio > 1.0);
    }

    #[test]
    fn test_stats() {
        let index = HnswIndex::new(small_config(4));
        index.add_point("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add_point("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        let _ = index.search(&[1.0, 0.0, 0.0, 0.0], 1, None).unwrap();
        let stats = index.stats();
        assert_eq!(stats.vector_count, 2);
        assert!(stats.memory_bytes > 0);
        assert!(stats.avg_search_time_ms >= 0.0);
        assert_eq!(stats.compression_ratio, 1.0);
    }

    #[test]
    fn test_larger_index_recall_with_default_ef() {
        let index = HnswIndex::new(HnswConfig {
            dimension: 4,
            max_elements: 1000,
            m: 16,
            ef_construction: 100,
            ..Default::default()
        });
        for i in 0..300usize {
            let angle = i as f32 * 0.021;
            index
                .add_point(
                    &format!("v{i}"),
                    &[angle.cos(), angle.sin(), (angle * 2.0).cos(), 1.0],
                )
                .unwrap();
        }
        // Query exactly at a stored point: it must come back first.
        let angle: f32 = 150.0 * 0.021;
        let results = index
            .search(&[angle.cos(), angle.sin(), (angle * 2.0).cos(), 1.0], 5, None)
            .unwrap();
        assert_eq!(results[0].0, "v150");
        for window in results.windows(2) {
            assert!(window[0].1 <= window[1].1, "distances must be ascending");
        }
    }
}
