// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Lossy vector compression for the HNSW index.
//!
//! Three modes, all with a single decode path back to D-dim f32:
//!
//! | Mode | Encoding | Nominal ratio |
//! |------|----------|---------------|
//! | Binary | sign bit per dimension, 32 dims per word | 32x |
//! | Scalar | b-bit code per dimension with min/max header | 32/b |
//! | Product | D dims split into s segments, each stored as its mean | D/s |
//!
//! The index stores encoded vectors and decodes before every distance
//! evaluation; recall loss is accepted and not quantified here.

use serde::{Deserialize, Serialize};

/// Quantization mode selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantizationMode {
    /// One sign bit per dimension.
    Binary,
    /// `bits`-bit linear code per dimension (1..=8).
    Scalar {
        /// Bits per dimension.
        bits: u8,
    },
    /// `segments` subquantizers, each segment stored as its mean.
    Product {
        /// Number of segments the dimensions are split into.
        segments: usize,
    },
}

/// An encoded vector, tagged by mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EncodedVector {
    /// Uncompressed pass-through.
    Raw(Vec<f32>),
    /// Packed sign bits.
    Binary {
        /// Sign bits packed 32 per word, little-endian within each word.
        words: Vec<u32>,
        /// Original dimensionality.
        dim: usize,
    },
    /// Linear scalar codes with a min/max header.
    Scalar {
        /// Smallest component of the original vector.
        min: f32,
        /// Largest component of the original vector.
        max: f32,
        /// Bits per code (1..=8).
        bits: u8,
        /// One code per dimension.
        codes: Vec<u8>,
    },
    /// Segment means.
    Product {
        /// One mean per segment.
        means: Vec<f32>,
        /// Original dimensionality.
        dim: usize,
    },
}

impl EncodedVector {
    /// Decode back to a D-dim f32 vector. This is the single decode path the
    /// index uses before any distance evaluation.
    #[must_use]
    pub fn decode(&self) -> Vec<f32> {
        match self {
            Self::Raw(v) => v.clone(),
            Self::Binary { words, dim } => (0..*dim)
                .map(|i| {
                    let word = words[i / 32];
                    if word & (1 << (i % 32)) != 0 {
                        1.0
                    } else {
                        -1.0
                    }
                })
                .collect(),
            Self::Scalar {
                min,
                max,
                bits,
                codes,
            } => {
                let levels = ((1u32 << bits) - 1) as f32;
                let range = max - min;
                codes
                    .iter()
                    .map(|&c| {
                        if range == 0.0 {
                            *min
                        } else {
                            min + (c as f32 / levels) * range
                        }
                    })
                    .collect()
            }
            Self::Product { means, dim } => {
                let segments = means.len();
                let base = dim / segments;
                let extra = dim % segments;
                let mut out = Vec::with_capacity(*dim);
                for (s, mean) in means.iter().enumerate() {
                    // The first `extra` segments absorb the remainder dims.
                    let seg_len = base + usize::from(s < extra);
                    out.extend(std::iter::repeat(*mean).take(seg_len));
                }
                out
            }
        }
    }

    /// Approximate in-memory footprint of the encoded form, in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Raw(v) => v.len() * 4,
            Self::Binary { words, .. } => words.len() * 4,
            Self::Scalar { codes, .. } => codes.len() + 9,
            Self::Product { means, .. } => means.len() * 4,
        }
    }
}

/// Vector quantizer applied transparently at index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quantizer {
    mode: QuantizationMode,
}

impl Quantizer {
    /// Create a quantizer. Scalar bits are clamped to 1..=8; product
    /// segment counts are clamped to at least 1.
    #[must_use]
    pub fn new(mode: QuantizationMode) -> Self {
        let mode = match mode {
            QuantizationMode::Scalar { bits } => QuantizationMode::Scalar {
                bits: bits.clamp(1, 8),
            },
            QuantizationMode::Product { segments } => QuantizationMode::Product {
                segments: segments.max(1),
            },
            other => other,
        };
        Self { mode }
    }

    /// The configured mode.
    #[must_use]
    pub fn mode(&self) -> QuantizationMode {
        self.mode
    }

    /// Encode a vector.
    #[must_use]
    pub fn encode(&self, v: &[f32]) -> EncodedVector {
        match self.mode {
            QuantizationMode::Binary => {
                let dim = v.len();
                let mut words = vec![0u32; dim.div_ceil(32)];
                for (i, &x) in v.iter().enumerate() {
                    if x > 0.0 {
                        words[i / 32] |= 1 << (i % 32);
                    }
                }
                EncodedVector::Binary { words, dim }
            }
            QuantizationMode::Scalar { bits } => {
                let min = v.iter().copied().fold(f32::INFINITY, f32::min);
                let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let (min, max) = if v.is_empty() { (0.0, 0.0) } else { (min, max) };
                let levels = ((1u32 << bits) - 1) as f32;
                let range = max - min;
                let codes = v
                    .iter()
                    .map(|&x| {
                        if range == 0.0 {
                            0
                        } else {
                            (((x - min) / range) * levels).round() as u8
                        }
                    })
                    .collect();
                EncodedVector::Scalar {
                    min,
                    max,
                    bits,
                    codes,
                }
            }
            QuantizationMode::Product { segments } => {
                let dim = v.len();
                let segments = segments.min(dim.max(1));
                let base = dim / segments;
                let extra = dim % segments;
                let mut means = Vec::with_capacity(segments);
                let mut offset = 0;
                for s in 0..segments {
                    let seg_len = base + usize::from(s < extra);
                    let seg = &v[offset..offset + seg_len];
                    let mean = if seg.is_empty() {
                        0.0
                    } else {
                        seg.iter().sum::<f32>() / seg.len() as f32
                    };
                    means.push(mean);
                    offset += seg_len;
                }
                EncodedVector::Product { means, dim }
            }
        }
    }

    /// Nominal compression ratio for `dim`-dimensional vectors.
    #[must_use]
    pub fn compression_ratio(&self, dim: usize) -> f32 {
        match self.mode {
            QuantizationMode::Binary => 32.0,
            QuantizationMode::Scalar { bits } => 32.0 / f32::from(bits),
            QuantizationMode::Product { segments } => {
                if segments == 0 {
                    1.0
                } else {
                    dim as f32 / segments as f32
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_encode_decode_signs() {
        let q = Quantizer::new(QuantizationMode::Binary);
        let v = vec![0.7, -0.2, 0.0, 3.5, -9.0];
        let decoded = q.encode(&v).decode();
        assert_eq!(decoded, vec![1.0, -1.0, -1.0, 1.0, -1.0]);
    }

    #[test]
    fn test_binary_packs_32_dims_per_word() {
        let q = Quantizer::new(QuantizationMode::Binary);
        let v = vec![1.0; 64];
        match q.encode(&v) {
            EncodedVector::Binary { words, dim } => {
                assert_eq!(words.len(), 2);
                assert_eq!(dim, 64);
            }
            other => panic!("expected binary encoding, got {other:?}"),
        }
    }

    #[test]
    fn test_scalar_round_trip_within_step() {
        let q = Quantizer::new(QuantizationMode::Scalar { bits: 8 });
        let v = vec![-1.0, -0.5, 0.0, 0.5, 1.0];
        let decoded = q.encode(&v).decode();
        let step = 2.0 / 255.0;
        for (orig, dec) in v.iter().zip(decoded.iter()) {
            assert!((orig - dec).abs() <= step, "{orig} vs {dec}");
        }
    }

    #[test]
    fn test_scalar_constant_vector() {
        let q = Quantizer::new(QuantizationMode::Scalar { bits: 4 });
        let v = vec![0.25; 8];
        assert_eq!(q.encode(&v).decode(), v);
    }

    #[test]
    fn test_scalar_bits_clamped() {
        let q = Quantizer::new(QuantizationMode::Scalar { bits: 13 });
        assert_eq!(q.mode(), QuantizationMode::Scalar { bits: 8 });
    }

    #[test]
    fn test_product_decode_repeats_segment_means() {
        let q = Quantizer::new(QuantizationMode::Product { segments: 2 });
        let v = vec![1.0, 3.0, 10.0, 20.0];
        let decoded = q.encode(&v).decode();
        assert_eq!(decoded, vec![2.0, 2.0, 15.0, 15.0]);
    }

    #[test]
    fn test_product_uneven_segments_preserve_dim() {
        let q = Quantizer::new(QuantizationMode::Product { segments: 3 });
        let v = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let decoded = q.encode(&v).decode();
        assert_eq!(decoded.len(), 7);
    }

    #[test]
    fn test_compression_ratios() {
        assert_eq!(
            Quantizer::new(QuantizationMode::Binary).compression_ratio(128),
            32.0
        );
        assert_eq!(
            Quantizer::new(QuantizationMode::Scalar { bits: 8 }).compression_ratio(128),
            4.0
        );
        assert_eq!(
            Quantizer::new(QuantizationMode::Product { segments: 16 }).compression_ratio(128),
            8.0
        );
    }

    #[test]
    fn test_encoded_byte_size_shrinks() {
        let v = vec![0.5; 128];
        let raw = EncodedVector::Raw(v.clone()).byte_size();
        let binary = Quantizer::new(QuantizationMode::Binary).encode(&v).byte_size();
        let scalar = Quantizer::new(QuantizationMode::Scalar { bits: 8 })
            .encode(&v)
            .byte_size();
        assert!(binary < scalar);
        assert!(scalar < raw);
    }
}
