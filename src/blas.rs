// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Portable sgemm kernels.
//!
//! Same calling convention as CBLAS `sgemm` in row-major order, implemented in
//! plain Rust so the crate builds on every target. Output rows are distributed
//! over the rayon pool once the problem is large enough; each output element is
//! always accumulated in the same order (p = 0..k), so results do not depend on
//! the thread count.
//!
//! Row-major stride rules:
//! - No transpose: A is [M, K], lda = K (stride between rows)
//! - No transpose: B is [K, N], ldb = N
//! - B transposed: B is [N, K], ldb = K (stride of the un-transposed storage)
//! - Output C is always [M, N], ldc = N

use rayon::prelude::*;

/// Below this many multiply-adds the rayon fork/join costs more than it saves.
const PAR_THRESHOLD: usize = 1 << 16;

/// C = alpha * A @ B + beta * C  (no transpose)
#[allow(clippy::too_many_arguments)]
pub fn sgemm(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) {
    debug_assert!(a.len() >= m * k, "a.len()={} < m*k={}", a.len(), m * k);
    debug_assert!(b.len() >= k * n, "b.len()={} < k*n={}", b.len(), k * n);
    debug_assert!(c.len() >= m * n, "c.len()={} < m*n={}", c.len(), m * n);
    sgemm_raw(false, false, m, n, k, alpha, a, k, b, n, beta, c, n);
}

/// C = alpha * A^T @ B + beta * C  (A transposed)
///
/// A: [k, m] row-major (stored transposed). This is the weight-gradient path:
/// dW = grad_output^T @ input.
#[allow(clippy::too_many_arguments)]
pub fn sgemm_transa(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) {
    debug_assert!(a.len() >= k * m, "a.len()={} < k*m={}", a.len(), k * m);
    debug_assert!(b.len() >= k * n, "b.len()={} < k*n={}", b.len(), k * n);
    debug_assert!(c.len() >= m * n, "c.len()={} < m*n={}", c.len(), m * n);
    sgemm_raw(true, false, m, n, k, alpha, a, m, b, n, beta, c, n);
}

/// C = alpha * A @ B^T + beta * C  (B transposed)
///
/// B: [n, k] row-major. This is the Linear forward path where weight W is
/// [out_features, in_features] and we compute input @ W^T.
#[allow(clippy::too_many_arguments)]
pub fn sgemm_transb(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) {
    debug_assert!(a.len() >= m * k, "a.len()={} < m*k={}", a.len(), m * k);
    debug_assert!(b.len() >= n * k, "b.len()={} < n*k={}", b.len(), n * k);
    debug_assert!(c.len() >= m * n, "c.len()={} < m*n={}", c.len(), m * n);
    sgemm_raw(false, true, m, n, k, alpha, a, k, b, k, beta, c, n);
}

/// General strided sgemm with explicit trans flags and leading dimensions.
///
/// Used for strided views, e.g. a per-head [seq, head_dim] slice of a
/// [batch, seq, n_heads, head_dim] buffer passed as `&data[offset..]`.
///   - No trans A[M,K]: element A[i,j] at offset i*lda + j
///   - Trans A (stored [K,M]): element A[i,j] at offset j*lda + i
///   - Output C[M,N]: element C[i,j] at offset i*ldc + j
///
/// `beta == 0` overwrites C without reading it, matching BLAS semantics.
#[allow(clippy::too_many_arguments)]
pub fn sgemm_raw(
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    if m == 0 || n == 0 {
        return;
    }
    debug_assert!(ldc >= n, "ldc={ldc} < n={n}");

    let a_at = |i: usize, p: usize| {
        if trans_a { a[p * lda + i] } else { a[i * lda + p] }
    };
    let b_at = |p: usize, j: usize| {
        if trans_b { b[j * ldb + p] } else { b[p * ldb + j] }
    };

    let row_kernel = |i: usize, row: &mut [f32]| {
        for (j, out) in row[..n].iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a_at(i, p) * b_at(p, j);
            }
            *out = if beta == 0.0 {
                alpha * acc
            } else {
                alpha * acc + beta * *out
            };
        }
    };

    if m * n * k >= PAR_THRESHOLD && m > 1 {
        c.par_chunks_mut(ldc)
            .take(m)
            .enumerate()
            .for_each(|(i, row)| row_kernel(i, row));
    } else {
        for (i, row) in c.chunks_mut(ldc).take(m).enumerate() {
            row_kernel(i, row);
        }
    }
}
