// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Tensor primitives and CPU ops.
//!
//! All storage is f32, row-major, flat `Vec<f32>`. Shape metadata is kept
//! separately in [`Shape`]. Reduced-precision dtypes are emulated: the data
//! stays f32, but [`Tensor::round_to`] rounds every element through the
//! narrower format so numerics match a bf16/f16 pipeline.
//!
//! Key design decisions:
//! - `from_vec()` takes ownership (zero-copy), `from_slice()` copies.
//! - Fallible ops come in pairs: `try_*` returns [`TensorResult`], the plain
//!   name panics with the error message (generated by `panic_wrapper!`).

use std::fmt;

use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tensor shape with row-major semantics.
///
/// Empty shape `[]` represents a scalar with `numel() = 1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn numel(&self) -> usize {
        if self.0.is_empty() {
            1
        } else {
            self.0.iter().product()
        }
    }

    pub fn last_dim(&self) -> usize {
        self.0.last().copied().unwrap_or(1)
    }

    pub fn matrix_dims(&self) -> (usize, usize) {
        let n = self.0.len();
        assert!(n >= 2, "matrix_dims requires >=2D");
        (self.0[n - 2], self.0[n - 1])
    }

    pub fn with_last_dim(&self, new_last: usize) -> Shape {
        let mut dims = self.0.clone();
        if let Some(last) = dims.last_mut() {
            *last = new_last;
        } else {
            dims.push(new_last);
        }
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Numeric precision a tensor is meant to carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// 16-bit brain floating point
    BF16,
}

impl DType {
    /// Round one value through this dtype and back to f32.
    pub fn round(self, x: f32) -> f32 {
        match self {
            Self::F32 => x,
            Self::F16 => f16::from_f32(x).to_f32(),
            Self::BF16 => bf16::from_f32(x).to_f32(),
        }
    }
}

/// Tensor op errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("shape mismatch: lhs={lhs:?}, rhs={rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("invalid dimension: expected {expected}, got {got}")]
    InvalidDimension { expected: usize, got: usize },
    #[error("matrix op requires >=2D, got {shape:?}")]
    InvalidMatrixRank { shape: Vec<usize> },
    #[error("numel mismatch: expected {expected}, got {got}")]
    NumelMismatch { expected: usize, got: usize },
    #[error("index rank mismatch: expected {expected}, got {got}")]
    IndexRankMismatch { expected: usize, got: usize },
    #[error("index out of bounds at axis {axis}: index={index}, bound={bound}")]
    IndexOutOfBounds {
        axis: usize,
        index: usize,
        bound: usize,
    },
}

pub type TensorResult<T> = Result<T, TensorError>;

macro_rules! panic_wrapper {
    (pub fn $name:ident(&self $(, $arg:ident : $ty:ty)*) -> $ret:ty => $try_name:ident) => {
        pub fn $name(&self $(, $arg: $ty)*) -> $ret {
            match self.$try_name($($arg),*) {
                Ok(v) => v,
                Err(e) => panic!("{e}"),
            }
        }
    };
}

/// CPU tensor with row-major f32 storage.
///
/// Gradient is stored as an optional boxed Tensor (same shape), keeping
/// param + grad colocated for an external optimizer.
#[derive(Debug, Clone)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
    dtype: DType,
    grad: Option<Box<Tensor>>,
}

impl Tensor {
    fn from_parts(data: Vec<f32>, shape: Shape, dtype: DType) -> Tensor {
        Tensor {
            data,
            shape,
            dtype,
            grad: None,
        }
    }

    fn like_with_data(&self, data: Vec<f32>) -> Tensor {
        Self::from_parts(data, self.shape.clone(), self.dtype)
    }

    fn with_shape_like(&self, data: Vec<f32>, shape: Shape) -> Tensor {
        Self::from_parts(data, shape, self.dtype)
    }

    pub fn zeros(shape: Shape, dtype: DType) -> Self {
        Self::from_parts(vec![0.0; shape.numel()], shape, dtype)
    }

    pub fn ones(shape: Shape, dtype: DType) -> Self {
        Self::from_parts(vec![1.0; shape.numel()], shape, dtype)
    }

    pub fn full(shape: Shape, value: f32) -> Self {
        Self::from_parts(vec![value; shape.numel()], shape, DType::F32)
    }

    pub fn from_slice(data: &[f32], shape: Shape) -> Self {
        assert_eq!(data.len(), shape.numel(), "data length vs shape mismatch");
        Self::from_parts(data.to_vec(), shape, DType::F32)
    }

    /// Create tensor from an owned `Vec<f32>`, zero-copy.
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Self {
        assert_eq!(data.len(), shape.numel(), "data length vs shape mismatch");
        Self::from_parts(data, shape, DType::F32)
    }

    pub fn scalar(value: f32) -> Self {
        Self::from_parts(vec![value], Shape::new(&[]), DType::F32)
    }

    /// N(0,1) samples from a seeded `StdRng`, for reproducible weight init.
    pub fn randn(shape: Shape, dtype: DType, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut t = Self::zeros(shape, dtype);
        t.normal_(0.0, 1.0, &mut rng);
        t
    }

    /// Refill in place with N(mean, std) samples drawn from `rng`.
    pub fn normal_(&mut self, mean: f32, std: f32, rng: &mut StdRng) {
        match Normal::new(mean, std) {
            Ok(dist) => {
                for v in self.data.iter_mut() {
                    *v = dist.sample(rng);
                }
            }
            // Zero or non-finite std degenerates to a constant fill.
            Err(_) => self.data.fill(mean),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the tensor and return the underlying data Vec (zero-copy).
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn item(&self) -> f32 {
        assert_eq!(self.numel(), 1, "item() requires scalar tensor");
        self.data[0]
    }

    pub fn try_dims_3d(&self) -> TensorResult<(usize, usize, usize)> {
        let d = self.shape.dims();
        if d.len() != 3 {
            return Err(TensorError::InvalidDimension {
                expected: 3,
                got: d.len(),
            });
        }
        Ok((d[0], d[1], d[2]))
    }

    pub fn try_get(&self, indices: &[usize]) -> TensorResult<f32> {
        self.try_flat_index(indices).map(|idx| self.data[idx])
    }

    panic_wrapper!(pub fn get(&self, indices: &[usize]) -> f32 => try_get);

    /// Convert multi-dim indices to a flat offset: acc = acc*bound + idx.
    fn try_flat_index(&self, indices: &[usize]) -> TensorResult<usize> {
        let dims = self.shape.dims();
        if indices.len() != dims.len() {
            return Err(TensorError::IndexRankMismatch {
                expected: dims.len(),
                got: indices.len(),
            });
        }
        dims.iter()
            .zip(indices)
            .enumerate()
            .try_fold(0usize, |acc, (axis, (&bound, &i))| {
                if i >= bound {
                    Err(TensorError::IndexOutOfBounds {
                        axis,
                        index: i,
                        bound,
                    })
                } else {
                    Ok(acc * bound + i)
                }
            })
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_deref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut Tensor> {
        self.grad.as_deref_mut()
    }

    pub fn set_grad(&mut self, grad: Tensor) {
        self.grad = Some(Box::new(grad));
    }

    /// Zero gradient in place if it exists, avoiding reallocation.
    pub fn clear_grad(&mut self) {
        if let Some(g) = &mut self.grad {
            g.zero_();
        }
    }

    /// Round every element through `dtype` and tag the result with it.
    pub fn round_to(&self, dtype: DType) -> Tensor {
        let data = self.data.iter().map(|&x| dtype.round(x)).collect();
        Self::from_parts(data, self.shape.clone(), dtype)
    }

    fn map_unary(&self, op: impl Fn(f32) -> f32) -> Tensor {
        self.like_with_data(self.data.iter().copied().map(op).collect())
    }

    pub fn scale(&self, s: f32) -> Tensor {
        self.map_unary(|x| x * s)
    }

    fn ensure_same_shape(&self, other: &Tensor) -> TensorResult<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                lhs: self.shape.dims().to_vec(),
                rhs: other.shape.dims().to_vec(),
            });
        }
        Ok(())
    }

    fn map_binary(&self, other: &Tensor, op: impl Fn(f32, f32) -> f32) -> TensorResult<Tensor> {
        self.ensure_same_shape(other)?;
        let out = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| op(a, b))
            .collect();
        Ok(self.like_with_data(out))
    }

    pub fn try_add(&self, other: &Tensor) -> TensorResult<Tensor> {
        self.map_binary(other, |a, b| a + b)
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f32 {
        let n = self.numel();
        if n == 0 { 0.0 } else { self.sum() / n as f32 }
    }

    /// Largest absolute element-wise difference; used by tolerance checks.
    pub fn try_max_abs_diff(&self, other: &Tensor) -> TensorResult<f32> {
        self.ensure_same_shape(other)?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max))
    }

    panic_wrapper!(pub fn max_abs_diff(&self, other: &Tensor) -> f32 => try_max_abs_diff);

    fn try_matrix_dims(&self) -> TensorResult<(usize, usize)> {
        if self.shape.ndim() < 2 {
            return Err(TensorError::InvalidMatrixRank {
                shape: self.shape.dims().to_vec(),
            });
        }
        Ok(self.shape.matrix_dims())
    }

    /// Reshape that only changes shape metadata (zero-copy).
    pub fn reshape_move(mut self, new_shape: Shape) -> Tensor {
        assert_eq!(
            self.shape.numel(),
            new_shape.numel(),
            "reshape_move: numel mismatch {} vs {}",
            self.shape.numel(),
            new_shape.numel()
        );
        self.shape = new_shape;
        self
    }

    /// Gather rows of a 2-D tensor (`index_select` along axis 0).
    pub fn try_index_rows(&self, rows: &[usize]) -> TensorResult<Tensor> {
        let (n_rows, width) = self.try_matrix_dims()?;
        let mut out = Vec::with_capacity(rows.len() * width);
        for &r in rows {
            if r >= n_rows {
                return Err(TensorError::IndexOutOfBounds {
                    axis: 0,
                    index: r,
                    bound: n_rows,
                });
            }
            out.extend_from_slice(&self.data[r * width..(r + 1) * width]);
        }
        Ok(self.with_shape_like(out, Shape::new(&[rows.len(), width])))
    }

    /// In-place SiLU: x[i] = x[i] / (1 + exp(-x[i])).
    pub fn silu_in_place(&mut self) {
        for v in self.data.iter_mut() {
            *v = *v / (1.0 + (-*v).exp());
        }
    }

    /// In-place element-wise multiply: self[i] *= other[i].
    pub fn mul_in_place(&mut self, other: &Tensor) {
        debug_assert_eq!(self.numel(), other.numel());
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a *= b;
        }
    }

    /// In-place element-wise add: self[i] += other[i].
    pub fn add_in_place(&mut self, other: &Tensor) {
        debug_assert_eq!(self.numel(), other.numel());
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
    }

    pub fn fill_(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn zero_(&mut self) {
        self.fill_(0.0);
    }
}

/// Softmax: p_i = exp(x_i - max(x)) / sum_j(exp(x_j - max(x)))
///
/// Only sampling uses it; attention scores are rectified, not normalized.
pub fn softmax_in_place(xs: &mut [f32]) {
    if xs.is_empty() {
        return;
    }
    let max_v = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in xs.iter_mut() {
        *v = (*v - max_v).exp();
        sum += *v;
    }
    let inv = 1.0 / sum.max(1e-12);
    for v in xs.iter_mut() {
        *v *= inv;
    }
}

/// L1-normalize a slice in place: x_i = x_i / sum(x).
pub(crate) fn normalize_in_place(xs: &mut [f32]) {
    let sum: f32 = xs.iter().sum();
    if sum <= 0.0 {
        return;
    }
    let inv = 1.0 / sum;
    for v in xs.iter_mut() {
        *v *= inv;
    }
}
