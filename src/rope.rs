// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Rotary position embedding (RoPE), half-split layout.
//!
//! Cache: theta[i, j] = (i / condense_ratio) / base^(2j / d)
//!        cos, sin = cos(theta), sin(theta), each [n_positions, d/2]
//!
//! Rotation of one head vector x (first d dims, halves x1 | x2):
//!   out1 = x1 * cos - x2 * sin
//!   out2 = x2 * cos + x1 * sin
//! which is `x * cos + concat(-x2, x1) * sin` with cos/sin repeated across both
//! halves. Dims [d, head_dim) pass through. The backward pass is the inverse
//! rotation (same formula with -sin).

use crate::tensor::{DType, Shape, Tensor, TensorError, TensorResult};

/// cos/sin tables, one row per position.
#[derive(Debug, Clone)]
pub struct RopeCache {
    pub cos: Tensor,
    pub sin: Tensor,
}

impl RopeCache {
    /// Build tables for `seq_len` positions and `n_elem` rotated dims, rounded
    /// through `dtype`.
    pub fn new(seq_len: usize, n_elem: usize, dtype: DType, base: f32, condense_ratio: usize) -> Self {
        let half = n_elem / 2;
        let theta: Vec<f32> = (0..half)
            .map(|j| 1.0 / base.powf((2 * j) as f32 / n_elem as f32))
            .collect();

        let mut cos = Vec::with_capacity(seq_len * half);
        let mut sin = Vec::with_capacity(seq_len * half);
        for i in 0..seq_len {
            let pos = i as f32 / condense_ratio as f32;
            for &t in &theta {
                let (s, c) = (pos * t).sin_cos();
                cos.push(c);
                sin.push(s);
            }
        }

        let shape = Shape::new(&[seq_len, half]);
        Self {
            cos: Tensor::from_vec(cos, shape.clone()).round_to(dtype),
            sin: Tensor::from_vec(sin, shape).round_to(dtype),
        }
    }

    pub fn n_positions(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Rotated dims per head.
    pub fn n_elem(&self) -> usize {
        self.cos.shape().last_dim() * 2
    }

    /// Rows for positions `0..len`.
    pub fn prefix(&self, len: usize) -> TensorResult<RopeCache> {
        let rows: Vec<usize> = (0..len).collect();
        self.select(&rows)
    }

    /// Rows for arbitrary positions (`index_select` along axis 0).
    pub fn select(&self, positions: &[usize]) -> TensorResult<RopeCache> {
        Ok(Self {
            cos: self.cos.try_index_rows(positions)?,
            sin: self.sin.try_index_rows(positions)?,
        })
    }
}

fn rotate(x: &Tensor, rope: &RopeCache, sign: f32) -> TensorResult<Tensor> {
    let dims = x.dims();
    if dims.len() != 4 {
        return Err(TensorError::InvalidDimension {
            expected: 4,
            got: dims.len(),
        });
    }
    let (batch, seq, heads, head_dim) = (dims[0], dims[1], dims[2], dims[3]);
    let half = rope.cos.shape().last_dim();
    if rope.n_positions() != seq || 2 * half > head_dim {
        return Err(TensorError::ShapeMismatch {
            lhs: dims.to_vec(),
            rhs: rope.cos.dims().to_vec(),
        });
    }

    let cos = rope.cos.data();
    let sin = rope.sin.data();
    let mut out = x.data().to_vec();
    for b in 0..batch {
        for t in 0..seq {
            let c_row = &cos[t * half..(t + 1) * half];
            let s_row = &sin[t * half..(t + 1) * half];
            for h in 0..heads {
                let off = ((b * seq + t) * heads + h) * head_dim;
                let src = &x.data()[off..off + 2 * half];
                let dst = &mut out[off..off + 2 * half];
                for i in 0..half {
                    let (x1, x2) = (src[i], src[i + half]);
                    let s = sign * s_row[i];
                    dst[i] = x1 * c_row[i] - x2 * s;
                    dst[i + half] = x2 * c_row[i] + x1 * s;
                }
            }
        }
    }
    Ok(Tensor::from_vec(out, x.shape().clone()))
}

/// Rotate the leading rotary dims of x: [batch, seq, heads, head_dim].
/// `rope` must hold exactly one row per sequence position.
pub fn apply_rope(x: &Tensor, rope: &RopeCache) -> TensorResult<Tensor> {
    rotate(x, rope, 1.0)
}

/// Gradient of [`apply_rope`]: rotate the incoming gradient backwards.
pub fn apply_rope_backward(grad: &Tensor, rope: &RopeCache) -> TensorResult<Tensor> {
    rotate(grad, rope, -1.0)
}
