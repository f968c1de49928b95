// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Layer traits and basic layer implementations.
//!
//! Building blocks: Embedding, Linear, NormedLinear, IdentityNorm, SwiGLU.
//! Each layer implements [`Layer`] (forward, backward) and [`Parameters`]
//! (named parameter traversal in checkpoint order).
//!
//! Helper macros reduce boilerplate for parameter collection:
//! - `collect_named_params!` / `collect_named_params_mut!` -- flatten named
//!   params from sub-layers under a dotted prefix

use rand::rngs::StdRng;

use crate::blas::{sgemm, sgemm_transa, sgemm_transb};
use crate::tensor::{DType, Shape, Tensor, TensorError, TensorResult};

// ---- Parameter collection macros ----
// Each composite layer aggregates its sub-layers' parameters by hand; the
// field name becomes the next segment of the dotted checkpoint name.

macro_rules! collect_named_params {
    ($prefix:expr; $($name:expr => $layer:expr),+ $(,)?) => {{
        let mut params = Vec::new();
        $(params.extend($layer.named_parameters(&$crate::layers::join_name($prefix, $name)));)+
        params
    }};
}

macro_rules! collect_named_params_mut {
    ($prefix:expr; $($name:expr => $layer:expr),+ $(,)?) => {{
        let mut params = Vec::new();
        $(params.extend($layer.named_parameters_mut(&$crate::layers::join_name($prefix, $name)));)+
        params
    }};
}

pub(crate) use collect_named_params;
pub(crate) use collect_named_params_mut;

/// `prefix.name`, or just `name` at the root.
pub fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Named access to trainable tensors.
pub trait Parameters {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)>;
    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)>;

    fn parameters(&self) -> Vec<&Tensor> {
        self.named_parameters("").into_iter().map(|(_, p)| p).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.named_parameters_mut("").into_iter().map(|(_, p)| p).collect()
    }
}

pub trait Layer: Parameters {
    fn forward(&mut self, input: &Tensor) -> Tensor;
    fn backward(&mut self, grad_output: &Tensor) -> Tensor;
    fn set_inference_mode(&mut self, _mode: bool) {}
}

/// Accumulate gradient into a parameter's grad field.
/// If grad already exists (zeroed by clear_grad), add in-place.
/// If grad is None (first ever call), allocate and copy.
pub(crate) fn accumulate_grad(param: &mut Tensor, grad: &[f32]) {
    if let Some(existing) = param.grad_mut() {
        for (d, g) in existing.data_mut().iter_mut().zip(grad.iter()) {
            *d += g;
        }
    } else {
        param.set_grad(Tensor::from_vec(grad.to_vec(), param.shape().clone()));
    }
}

/// Sum of `grad_output` rows, the bias gradient of an affine layer.
fn column_sums(go: &[f32], width: usize) -> Vec<f32> {
    let mut sums = vec![0.0f32; width];
    for row in go.chunks_exact(width) {
        for (s, &g) in sums.iter_mut().zip(row) {
            *s += g;
        }
    }
    sums
}

/// Y = X @ W^T + b  via sgemm_transb (avoids materializing the transpose).
/// X: [batch, in], W: [out, in], Y: [batch, out]
fn affine_forward(input: &Tensor, weight: &[f32], bias: Option<&Tensor>, out_features: usize) -> Tensor {
    let in_features = input.shape().last_dim();
    let batch = input.numel() / in_features.max(1);
    let mut out = vec![0.0; batch * out_features];
    sgemm_transb(
        batch,
        out_features,
        in_features,
        1.0,
        input.data(),
        weight,
        0.0,
        &mut out,
    );
    if let Some(b) = bias {
        for row in out.chunks_exact_mut(out_features) {
            for (y, &bj) in row.iter_mut().zip(b.data()) {
                *y += bj;
            }
        }
    }
    Tensor::from_vec(out, input.shape().with_last_dim(out_features))
}

/// Embedding lookup table: token_id -> hidden vector.
///
/// Embedding(token) = W[token, :] where W is [vocab_size, hidden_dim].
pub struct Embedding {
    pub weight: Tensor,
    /// Cached token IDs from the last forward pass for backward.
    last_ids: Option<Vec<usize>>,
    inference_mode: bool,
}

impl Embedding {
    pub fn new(vocab_size: usize, hidden_dim: usize) -> Self {
        let std = (2.0 / hidden_dim as f32).sqrt();
        Self {
            weight: Tensor::randn(Shape::new(&[vocab_size, hidden_dim]), DType::F32, 42).scale(std),
            last_ids: None,
            inference_mode: false,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn init_normal(&mut self, std: f32, rng: &mut StdRng) {
        self.weight.normal_(0.0, std, rng);
    }

    /// Integer-indexed lookup. Fails on any id `>= vocab_size` before
    /// touching the backward cache.
    pub fn try_forward_with_ids(
        &mut self,
        token_ids: &[usize],
        batch: usize,
        seq_len: usize,
    ) -> TensorResult<Tensor> {
        let vocab_size = self.vocab_size();
        if let Some(&token) = token_ids.iter().find(|&&t| t >= vocab_size) {
            return Err(TensorError::IndexOutOfBounds {
                axis: 0,
                index: token,
                bound: vocab_size,
            });
        }
        if token_ids.len() != batch * seq_len {
            return Err(TensorError::NumelMismatch {
                expected: batch * seq_len,
                got: token_ids.len(),
            });
        }
        let hidden_dim = self.weight.shape().last_dim();
        let mut out = vec![0.0; batch * seq_len * hidden_dim];

        for (i, &token) in token_ids.iter().enumerate() {
            let src = token * hidden_dim;
            let dst = i * hidden_dim;
            out[dst..dst + hidden_dim].copy_from_slice(&self.weight.data()[src..src + hidden_dim]);
        }

        if !self.inference_mode {
            self.last_ids = Some(token_ids.to_vec());
        }
        Ok(Tensor::from_vec(out, Shape::new(&[batch, seq_len, hidden_dim])))
    }
}

impl Layer for Embedding {
    /// `input` holds integral token ids as f32, shaped [batch, seq].
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let dims = input.dims();
        let token_ids: Vec<usize> = input.data().iter().map(|&x| x as usize).collect();
        match self.try_forward_with_ids(&token_ids, dims[0], dims[1]) {
            Ok(out) => out,
            Err(e) => panic!("{e}"),
        }
    }

    /// Scatter-add grad_output into weight.grad at token indices.
    /// Returns zeros (no meaningful gradient for discrete token IDs).
    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        if let Some(ids) = self.last_ids.take() {
            let hidden_dim = self.weight.shape().last_dim();
            let mut grad_w = vec![0.0f32; self.weight.numel()];
            for (row, &token_id) in grad_output.data().chunks_exact(hidden_dim).zip(&ids) {
                let dst = &mut grad_w[token_id * hidden_dim..(token_id + 1) * hidden_dim];
                for (d, &g) in dst.iter_mut().zip(row) {
                    *d += g;
                }
            }
            accumulate_grad(&mut self.weight, &grad_w);
        }
        Tensor::zeros(grad_output.shape().clone(), DType::F32)
    }

    fn set_inference_mode(&mut self, mode: bool) {
        self.inference_mode = mode;
    }
}

impl Parameters for Embedding {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        vec![(join_name(prefix, "weight"), &self.weight)]
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        vec![(join_name(prefix, "weight"), &mut self.weight)]
    }
}

/// Fully connected layer with optional bias.
///
/// Forward:  Y = X @ W^T + b   where W is [out_features, in_features]
/// Backward: dX = dY @ W
///           dW = dY^T @ X
///           db = sum_rows(dY)
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    /// Cached flattened input from forward for backward weight gradient.
    last_input: Option<Vec<f32>>,
    /// Pre-allocated backward scratch buffer (reused across steps)
    dw_buf: Option<Vec<f32>>,
    inference_mode: bool,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        let std = (2.0 / in_features as f32).sqrt();
        Self {
            weight: Tensor::randn(Shape::new(&[out_features, in_features]), DType::F32, 123)
                .scale(std),
            bias: bias.then(|| Tensor::zeros(Shape::new(&[out_features]), DType::F32)),
            last_input: None,
            dw_buf: None,
            inference_mode: false,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().last_dim()
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Weight ~ N(0, std), bias zeroed.
    pub fn init_normal(&mut self, std: f32, rng: &mut StdRng) {
        self.weight.normal_(0.0, std, rng);
        if let Some(b) = &mut self.bias {
            b.zero_();
        }
    }
}

impl Layer for Linear {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        if !self.inference_mode {
            self.last_input = Some(input.data().to_vec());
        }
        affine_forward(input, self.weight.data(), self.bias.as_ref(), self.out_features())
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let out_features = self.out_features();
        let in_features = self.in_features();
        let batch = grad_output.numel() / out_features.max(1);

        // dX = dY @ W (W is already [out, in])
        let mut dx = vec![0.0; batch * in_features];
        sgemm(
            batch,
            in_features,
            out_features,
            1.0,
            grad_output.data(),
            self.weight.data(),
            0.0,
            &mut dx,
        );

        if let Some(input_data) = self.last_input.take() {
            // dW = dY^T @ X: [out, in]
            let mut dw = self.dw_buf.take().unwrap_or_default();
            dw.resize(out_features * in_features, 0.0);
            sgemm_transa(
                out_features,
                in_features,
                batch,
                1.0,
                grad_output.data(),
                &input_data,
                0.0,
                &mut dw,
            );
            accumulate_grad(&mut self.weight, &dw);
            self.dw_buf = Some(dw);
            if let Some(b) = &mut self.bias {
                accumulate_grad(b, &column_sums(grad_output.data(), out_features));
            }
        }

        Tensor::from_vec(dx, grad_output.shape().with_last_dim(in_features))
    }

    fn set_inference_mode(&mut self, mode: bool) {
        self.inference_mode = mode;
    }
}

impl Parameters for Linear {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        let mut params = vec![(join_name(prefix, "weight"), &self.weight)];
        if let Some(b) = &self.bias {
            params.push((join_name(prefix, "bias"), b));
        }
        params
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![(join_name(prefix, "weight"), &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push((join_name(prefix, "bias"), b));
        }
        params
    }
}

/// Smallest column norm used as divisor.
const NORM_EPS: f32 = 1e-12;

/// Linear layer with a column-normalized weight and one learnable gain.
///
///   V   = W - mean(W, axis=0)          center every input column over outputs
///   N   = V / max(||V[:, j]||, eps)    unit L2 norm per input column
///   W_e = s * N
///   Y   = X @ W_e^T + b
///
/// Backward (per column j, n = N[:, j], r = ||V[:, j]||, dN = s * dW_e[:, j]):
///   ds = sum(dW_e * N)
///   dV = (dN - n * (n . dN)) / r      (dN / eps when r <= eps)
///   dW = dV - mean(dV)
pub struct NormedLinear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub scale: Tensor,
    last_input: Option<Vec<f32>>,
    /// N and the column norms from the last forward.
    last_normalized: Option<Vec<f32>>,
    last_norms: Option<Vec<f32>>,
    inference_mode: bool,
}

pub const NORMED_LINEAR_INIT_SCALE: f32 = 0.01;

impl NormedLinear {
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        let std = (2.0 / in_features as f32).sqrt();
        Self {
            weight: Tensor::randn(Shape::new(&[out_features, in_features]), DType::F32, 321)
                .scale(std),
            bias: bias.then(|| Tensor::zeros(Shape::new(&[out_features]), DType::F32)),
            scale: Tensor::scalar(NORMED_LINEAR_INIT_SCALE),
            last_input: None,
            last_normalized: None,
            last_norms: None,
            inference_mode: false,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().last_dim()
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Weight ~ N(0, std), bias zeroed, gain back to its initial value.
    pub fn init_normal(&mut self, std: f32, rng: &mut StdRng) {
        self.weight.normal_(0.0, std, rng);
        if let Some(b) = &mut self.bias {
            b.zero_();
        }
        self.scale.fill_(NORMED_LINEAR_INIT_SCALE);
    }

    /// Centered and column-normalized weight N (before the gain), with the
    /// pre-normalization column norms.
    pub fn normalized_weight(&self) -> (Tensor, Vec<f32>) {
        let out_f = self.out_features();
        let in_f = self.in_features();
        let w = self.weight.data();
        let mut v = w.to_vec();
        let mut norms = vec![0.0f32; in_f];

        for j in 0..in_f {
            let mean = (0..out_f).map(|o| w[o * in_f + j]).sum::<f32>() / out_f as f32;
            let mut sq = 0.0f32;
            for o in 0..out_f {
                let c = w[o * in_f + j] - mean;
                v[o * in_f + j] = c;
                sq += c * c;
            }
            norms[j] = sq.sqrt();
            let inv = 1.0 / norms[j].max(NORM_EPS);
            for o in 0..out_f {
                v[o * in_f + j] *= inv;
            }
        }
        (Tensor::from_vec(v, self.weight.shape().clone()), norms)
    }

    /// W_e = s * N, the weight the forward pass multiplies by.
    pub fn effective_weight(&self) -> Tensor {
        self.normalized_weight().0.scale(self.scale.item())
    }
}

impl Layer for NormedLinear {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let (normalized, norms) = self.normalized_weight();
        let effective = normalized.scale(self.scale.item());
        let out = affine_forward(input, effective.data(), self.bias.as_ref(), self.out_features());
        if !self.inference_mode {
            self.last_input = Some(input.data().to_vec());
            self.last_normalized = Some(normalized.into_data());
            self.last_norms = Some(norms);
        }
        out
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let (Some(input_data), Some(normalized), Some(norms)) = (
            self.last_input.take(),
            self.last_normalized.take(),
            self.last_norms.take(),
        ) else {
            return grad_output.clone();
        };
        let out_f = self.out_features();
        let in_f = self.in_features();
        let batch = grad_output.numel() / out_f.max(1);
        let s = self.scale.item();
        let go = grad_output.data();

        // dX = dY @ W_e
        let effective: Vec<f32> = normalized.iter().map(|&n| n * s).collect();
        let mut dx = vec![0.0; batch * in_f];
        sgemm(batch, in_f, out_f, 1.0, go, &effective, 0.0, &mut dx);

        // dW_e = dY^T @ X
        let mut dwe = vec![0.0; out_f * in_f];
        sgemm_transa(out_f, in_f, batch, 1.0, go, &input_data, 0.0, &mut dwe);

        let ds: f32 = dwe.iter().zip(&normalized).map(|(g, n)| g * n).sum();

        let mut dw = vec![0.0f32; out_f * in_f];
        let mut dv = vec![0.0f32; out_f];
        for j in 0..in_f {
            let r = norms[j];
            let dot: f32 = (0..out_f)
                .map(|o| normalized[o * in_f + j] * s * dwe[o * in_f + j])
                .sum();
            for (o, d) in dv.iter_mut().enumerate() {
                let dn = s * dwe[o * in_f + j];
                *d = if r > NORM_EPS {
                    (dn - normalized[o * in_f + j] * dot) / r
                } else {
                    dn / NORM_EPS
                };
            }
            let mean = dv.iter().sum::<f32>() / out_f as f32;
            for (o, &d) in dv.iter().enumerate() {
                dw[o * in_f + j] = d - mean;
            }
        }

        accumulate_grad(&mut self.weight, &dw);
        accumulate_grad(&mut self.scale, &[ds]);
        if let Some(b) = &mut self.bias {
            accumulate_grad(b, &column_sums(go, out_f));
        }
        Tensor::from_vec(dx, grad_output.shape().with_last_dim(in_f))
    }

    fn set_inference_mode(&mut self, mode: bool) {
        self.inference_mode = mode;
    }
}

impl Parameters for NormedLinear {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        let mut params = vec![(join_name(prefix, "weight"), &self.weight)];
        if let Some(b) = &self.bias {
            params.push((join_name(prefix, "bias"), b));
        }
        params.push((join_name(prefix, "scale"), &self.scale));
        params
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![(join_name(prefix, "weight"), &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push((join_name(prefix, "bias"), b));
        }
        params.push((join_name(prefix, "scale"), &mut self.scale));
        params
    }
}

/// Placeholder normalization slot. Keeps `eps` for config parity and returns
/// its input unchanged.
pub struct IdentityNorm {
    pub eps: f32,
    size: usize,
}

impl IdentityNorm {
    pub fn new(size: usize, eps: f32) -> Self {
        Self { eps, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Layer for IdentityNorm {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        input.clone()
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        grad_output.clone()
    }
}

impl Parameters for IdentityNorm {
    fn named_parameters(&self, _prefix: &str) -> Vec<(String, &Tensor)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self, _prefix: &str) -> Vec<(String, &mut Tensor)> {
        Vec::new()
    }
}

/// SwiGLU feed-forward network (Shazeer 2020).
///
///   a   = w1 @ x                    [hidden -> ffn_dim]
///   b   = w2 @ x                    [hidden -> ffn_dim]
///   h   = silu(a) * b
///   out = w3 @ h                    [ffn_dim -> hidden]
pub struct SwiGLU {
    pub w1: Linear,
    pub w2: Linear,
    pub w3: Linear,
    /// Cached activations for backward
    last_gate_pre_silu: Option<Vec<f32>>,
    last_up_out: Option<Vec<f32>>,
    inference_mode: bool,
}

impl SwiGLU {
    pub fn new(hidden_dim: usize, ffn_dim: usize, bias: bool) -> Self {
        Self {
            w1: Linear::new(hidden_dim, ffn_dim, bias),
            w2: Linear::new(hidden_dim, ffn_dim, bias),
            w3: Linear::new(ffn_dim, hidden_dim, bias),
            last_gate_pre_silu: None,
            last_up_out: None,
            inference_mode: false,
        }
    }
}

impl Layer for SwiGLU {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let mut gate = self.w1.forward(input);
        if !self.inference_mode {
            self.last_gate_pre_silu = Some(gate.data().to_vec());
        }
        gate.silu_in_place();

        let up = self.w2.forward(input);
        gate.mul_in_place(&up);
        if !self.inference_mode {
            self.last_up_out = Some(up.into_data());
        }
        self.w3.forward(&gate)
    }

    /// Backward for SwiGLU:
    ///   grad_h = w3.backward(grad_output)
    ///   grad_b = grad_h * silu(a)
    ///   grad_a = grad_h * b * silu'(a)
    ///     where silu'(z) = sigmoid(z) * (1 + z * (1 - sigmoid(z)))
    ///   grad_input = w1.backward(grad_a) + w2.backward(grad_b)
    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let grad_hidden = self.w3.backward(grad_output);
        let gh = grad_hidden.data();

        let (Some(gate_pre_silu), Some(up_out)) =
            (self.last_gate_pre_silu.take(), self.last_up_out.take())
        else {
            return Tensor::zeros(grad_output.shape().clone(), DType::F32);
        };

        let mut grad_gate = vec![0.0f32; gh.len()];
        let mut grad_up = vec![0.0f32; gh.len()];
        for i in 0..gh.len() {
            let z = gate_pre_silu[i];
            let sig = 1.0 / (1.0 + (-z).exp());
            grad_up[i] = gh[i] * z * sig;
            grad_gate[i] = gh[i] * up_out[i] * sig * (1.0 + z * (1.0 - sig));
        }

        let mut grad_x = self
            .w1
            .backward(&Tensor::from_vec(grad_gate, grad_hidden.shape().clone()));
        let grad_x_up = self
            .w2
            .backward(&Tensor::from_vec(grad_up, grad_hidden.shape().clone()));
        grad_x.add_in_place(&grad_x_up);
        grad_x
    }

    fn set_inference_mode(&mut self, mode: bool) {
        self.inference_mode = mode;
        self.w1.set_inference_mode(mode);
        self.w2.set_inference_mode(mode);
        self.w3.set_inference_mode(mode);
    }
}

impl Parameters for SwiGLU {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        collect_named_params!(prefix; "w1" => self.w1, "w2" => self.w2, "w3" => self.w3)
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        collect_named_params_mut!(prefix; "w1" => self.w1, "w2" => self.w2, "w3" => self.w3)
    }
}
