// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Key/value cache and causal mask for incremental decoding.
//!
//! KvCache layout: k, v each [batch, max_seq_length, n_query_groups, head_size].
//! Slots are written at caller-supplied positions. A single-token write at a
//! position >= capacity shifts every slot left by one (dropping the oldest) and
//! lands in the last slot, so the cache behaves as a sliding window.

use crate::error::{ModelError, Result};
use crate::tensor::{DType, Shape, Tensor, TensorError, TensorResult};

#[derive(Debug, Clone)]
pub struct KvCache {
    pub k: Tensor,
    pub v: Tensor,
}

impl KvCache {
    pub fn new(batch: usize, max_seq_length: usize, n_query_groups: usize, head_size: usize) -> Self {
        let shape = Shape::new(&[batch, max_seq_length, n_query_groups, head_size]);
        Self {
            k: Tensor::zeros(shape.clone(), DType::F32),
            v: Tensor::zeros(shape, DType::F32),
        }
    }

    pub fn batch(&self) -> usize {
        self.k.dims()[0]
    }

    /// Number of slots (the `max_seq_length` it was built with).
    pub fn capacity(&self) -> usize {
        self.k.dims()[1]
    }

    /// Width of one slot: n_query_groups * head_size.
    fn slot_width(&self) -> usize {
        self.k.dims()[2] * self.k.dims()[3]
    }

    /// Store `k`, `v` ([batch, T, groups, head_size]) at `input_pos` (length T).
    pub fn write_at(&mut self, input_pos: &[usize], k: &Tensor, v: &Tensor) -> Result<()> {
        let dims = self.k.dims().to_vec();
        for t in [k, v] {
            let d = t.dims();
            if d.len() != 4 || d[0] != dims[0] || d[2] != dims[2] || d[3] != dims[3] {
                return Err(TensorError::ShapeMismatch {
                    lhs: dims.clone(),
                    rhs: d.to_vec(),
                }
                .into());
            }
        }
        let seq = k.dims()[1];
        if v.dims()[1] != seq || input_pos.len() != seq {
            return Err(ModelError::PositionCountMismatch {
                expected: seq,
                got: input_pos.len(),
            });
        }
        let Some(&last) = input_pos.last() else {
            return Ok(());
        };

        let capacity = self.capacity();
        let evicting = last >= capacity;
        if evicting && seq != 1 {
            return Err(ModelError::CacheOverflow {
                tokens: seq,
                capacity,
            });
        }
        if !evicting && input_pos.iter().any(|&p| p >= capacity) {
            return Err(ModelError::CacheOverflow {
                tokens: seq,
                capacity,
            });
        }

        if evicting {
            tracing::debug!(position = last, capacity, "kv cache full, evicting oldest slot");
            self.shift_left();
        }
        let width = self.slot_width();
        let batch = self.batch();
        for (dst, src) in [(&mut self.k, k), (&mut self.v, v)] {
            let dst = dst.data_mut();
            let src = src.data();
            for b in 0..batch {
                for (t, &p) in input_pos.iter().enumerate() {
                    let slot = if evicting { capacity - 1 } else { p };
                    let d = (b * capacity + slot) * width;
                    let s = (b * seq + t) * width;
                    dst[d..d + width].copy_from_slice(&src[s..s + width]);
                }
            }
        }
        Ok(())
    }

    /// Same as [`KvCache::write_at`], returning the updated cache and leaving
    /// `self` untouched.
    pub fn written_at(&self, input_pos: &[usize], k: &Tensor, v: &Tensor) -> Result<KvCache> {
        let mut next = self.clone();
        next.write_at(input_pos, k, v)?;
        Ok(next)
    }

    /// Roll every batch row left by one slot; the last slot keeps the old
    /// first entry until it is overwritten.
    fn shift_left(&mut self) {
        let row = self.capacity() * self.slot_width();
        let width = self.slot_width();
        for t in [&mut self.k, &mut self.v] {
            for chunk in t.data_mut().chunks_exact_mut(row) {
                chunk.rotate_left(width);
            }
        }
    }

    pub fn reset(&mut self) {
        self.k.zero_();
        self.v.zero_();
    }
}

/// Attention mask over (query, key) pairs, broadcast over batch and heads.
#[derive(Debug, Clone)]
pub enum AttentionMask {
    /// `true` where the query may attend to the key; `false` becomes -inf.
    Bool {
        rows: usize,
        cols: usize,
        allowed: Vec<bool>,
    },
    /// Added to the scaled scores as-is, shape [rows, cols].
    Additive(Tensor),
}

impl AttentionMask {
    pub fn dims(&self) -> (usize, usize) {
        match self {
            Self::Bool { rows, cols, .. } => (*rows, *cols),
            Self::Additive(t) => {
                let d = t.dims();
                (d[0], d[d.len() - 1])
            }
        }
    }

    /// Additive bias for query row `i`, key column `j`.
    pub fn bias(&self, i: usize, j: usize) -> f32 {
        match self {
            Self::Bool { cols, allowed, .. } => {
                if allowed[i * cols + j] {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            }
            Self::Additive(t) => t.data()[i * t.shape().last_dim() + j],
        }
    }
}

/// Lower-triangular boolean [block_size, block_size].
#[derive(Debug, Clone)]
pub struct MaskCache {
    size: usize,
    tril: Vec<bool>,
}

impl MaskCache {
    pub fn new(block_size: usize) -> Self {
        let mut tril = vec![false; block_size * block_size];
        for i in 0..block_size {
            tril[i * block_size..=i * block_size + i].fill(true);
        }
        Self {
            size: block_size,
            tril,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Rows at `positions`, truncated to the first `width` columns.
    pub fn rows(&self, positions: &[usize], width: usize) -> TensorResult<AttentionMask> {
        if width > self.size {
            return Err(TensorError::IndexOutOfBounds {
                axis: 1,
                index: width,
                bound: self.size,
            });
        }
        let mut allowed = Vec::with_capacity(positions.len() * width);
        for &p in positions {
            if p >= self.size {
                return Err(TensorError::IndexOutOfBounds {
                    axis: 0,
                    index: p,
                    bound: self.size,
                });
            }
            allowed.extend_from_slice(&self.tril[p * self.size..p * self.size + width]);
        }
        Ok(AttentionMask::Bool {
            rows: positions.len(),
            cols: width,
            allowed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(batch: usize, value: f32) -> Tensor {
        Tensor::full(Shape::new(&[batch, 1, 1, 2]), value)
    }

    #[test]
    fn test_write_at_positions() {
        let mut cache = KvCache::new(1, 4, 1, 2);
        let k = Tensor::from_slice(&[1.0, 1.0, 2.0, 2.0], Shape::new(&[1, 2, 1, 2]));
        cache.write_at(&[0, 1], &k, &k.scale(-1.0)).unwrap();
        assert_eq!(&cache.k.data()[..6], &[1.0, 1.0, 2.0, 2.0, 0.0, 0.0]);
        assert_eq!(&cache.v.data()[..4], &[-1.0, -1.0, -2.0, -2.0]);
    }

    #[test]
    fn test_eviction_shifts_left() {
        let mut cache = KvCache::new(2, 3, 1, 2);
        for p in 0..3 {
            cache.write_at(&[p], &token(2, p as f32 + 1.0), &token(2, 0.0)).unwrap();
        }
        cache.write_at(&[3], &token(2, 9.0), &token(2, 0.0)).unwrap();
        let expected = [2.0, 2.0, 3.0, 3.0, 9.0, 9.0];
        assert_eq!(&cache.k.data()[..6], &expected);
        assert_eq!(&cache.k.data()[6..], &expected);
    }

    #[test]
    fn test_multi_token_overflow_fails() {
        let mut cache = KvCache::new(1, 2, 1, 2);
        let k = Tensor::zeros(Shape::new(&[1, 2, 1, 2]), DType::F32);
        assert!(matches!(
            cache.write_at(&[1, 2], &k, &k),
            Err(ModelError::CacheOverflow { tokens: 2, capacity: 2 })
        ));
    }

    #[test]
    fn test_written_at_is_pure() {
        let cache = KvCache::new(1, 2, 1, 2);
        let next = cache.written_at(&[1], &token(1, 5.0), &token(1, 6.0)).unwrap();
        assert!(cache.k.data().iter().all(|&x| x == 0.0));
        assert_eq!(&next.k.data()[2..], &[5.0, 5.0]);
        assert_eq!(&next.v.data()[2..], &[6.0, 6.0]);
    }

    #[test]
    fn test_write_rejects_bad_shapes() {
        let mut cache = KvCache::new(1, 4, 2, 2);
        assert!(matches!(
            cache.write_at(&[0], &token(1, 1.0), &token(1, 1.0)),
            Err(ModelError::Tensor(_))
        ));
        let k = Tensor::zeros(Shape::new(&[1, 2, 2, 2]), DType::F32);
        assert!(matches!(
            cache.write_at(&[0], &k, &k),
            Err(ModelError::PositionCountMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_mask_rows() {
        let mask = MaskCache::new(4);
        let rows = mask.rows(&[1, 3], 3).unwrap();
        assert_eq!(rows.dims(), (2, 3));
        assert_eq!(rows.bias(0, 1), 0.0);
        assert_eq!(rows.bias(0, 2), f32::NEG_INFINITY);
        assert_eq!(rows.bias(1, 2), 0.0);
        assert!(mask.rows(&[4], 3).is_err());
    }
}
