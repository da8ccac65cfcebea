// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Distance kernels over fixed-dimension f32 vectors.
//!
//! All kernels return a *distance* (smaller = closer). Score conversion for
//! callers that want similarity lives in the store layer, not here.
//!
//! Zero-vector inputs never produce NaN: normalization returns the input
//! unchanged, and the cosine kernel reports maximal distance (1.0) when a
//! denominator would be zero.

use serde::{Deserialize, Serialize};

/// Distance metric for vector similarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Cosine distance (1 - cosine similarity)
    Cosine,
    /// Euclidean distance (L2)
    L2,
    /// Manhattan distance (L1)
    L1,
    /// Dot product (inner product), expressed as `1 - dot` so smaller = closer
    DotProduct,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        Self::Cosine
    }
}

impl DistanceMetric {
    /// Compute the distance between two equal-length vectors.
    #[must_use]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine_distance(a, b),
            Self::L2 => euclidean_distance(a, b),
            Self::L1 => manhattan_distance(a, b),
            Self::DotProduct => dot_distance(a, b),
        }
    }
}

/// Dot product of two equal-length vectors.
#[must_use]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine distance `1 - (a . b) / (|a| * |b|)`.
///
/// A zero denominator (either vector is all zeros) reports 1.0, maximally
/// dissimilar, rather than NaN.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product(a, b);
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom == 0.0 {
        return 1.0;
    }
    1.0 - dot / denom
}

/// Cosine distance for pre-normalized inputs: `1 - a . b`, skipping the
/// square roots entirely.
#[must_use]
pub fn cosine_distance_normalized(a: &[f32], b: &[f32]) -> f32 {
    1.0 - dot_product(a, b)
}

/// Euclidean (L2) distance.
#[must_use]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Manhattan (L1) distance.
#[must_use]
pub fn manhattan_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

/// Dot-product distance `1 - a . b`, so that larger inner products sort
/// closer. Callers converting back to similarity recover the raw dot.
#[must_use]
pub fn dot_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - dot_product(a, b)
}

/// Cosine similarity in [-1, 1]. Zero vectors score 0 (no NaN escape).
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product(a, b);
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}

/// Normalize a vector to unit length. Zero vectors are returned unchanged.
#[must_use]
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}
