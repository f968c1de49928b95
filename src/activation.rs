// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Surrogate-gradient activations.
//!
//! Spiking activation (Heaviside step, arctangent surrogate):
//!   forward:  y = alpha * 1[x - beta > 0]
//!   backward: u = x - beta
//!             dy/dx     = alpha * s / (pi * ((s*u)^2 + 1))
//!             dy/dbeta  = -dy/dx
//!             dy/dalpha = atan(u) / pi + 1/2
//!   where s = `SPIKE_SHARPNESS`. The backward is the derivative of the smooth
//!   surrogate f(x) = alpha * (atan(s*u) / pi + 1/2), except for alpha whose
//!   gradient uses the unsharpened arctangent.
//!
//! Learnable quantizer (uniform b-bit, clipped straight-through):
//!   forward:  n = x / alpha, q = round(clamp(n, 0, 1) * L) / L, y = q * alpha,
//!             L = 2^b - 1
//!   backward: i = 1[n > 1]
//!             dy/dx     = 1 - i
//!             dy/dalpha = i + (q - n) * (1 - i)
//!
//! Both scale their output by a per-channel `AlphaInit` that is initialized
//! from the first batch it sees. Channels are the last tensor dimension; alpha
//! and beta gradients are summed over every other dimension.

use std::f32::consts::PI;

use crate::config::ActivationKind;
use crate::error::{ModelError, Result};
use crate::layers::{accumulate_grad, join_name, Layer, Parameters};
use crate::tensor::{DType, Shape, Tensor, TensorError};

/// Slope of the arctangent surrogate around the threshold.
pub const SPIKE_SHARPNESS: f32 = 4.0;

/// Smooth stand-in for the step, f(u) = alpha * (atan(s*u)/pi + 1/2).
pub fn surrogate(u: f32, alpha: f32) -> f32 {
    alpha * ((SPIKE_SHARPNESS * u).atan() / PI + 0.5)
}

/// d surrogate / du.
pub fn surrogate_grad_x(u: f32, alpha: f32) -> f32 {
    let su = SPIKE_SHARPNESS * u;
    alpha * SPIKE_SHARPNESS / (PI * (su * su + 1.0))
}

pub fn surrogate_grad_alpha(u: f32) -> f32 {
    u.atan() / PI + 0.5
}

/// Per-channel scale that takes its initial value from data.
///
/// `Uninitialized` still carries a placeholder tensor (all ones) so the
/// parameter has a fixed shape and can be enumerated before the first forward.
#[derive(Debug, Clone)]
pub enum AlphaInit {
    Uninitialized { placeholder: Tensor },
    Initialized(Tensor),
}

impl AlphaInit {
    pub fn new(size: usize) -> Self {
        Self::Uninitialized {
            placeholder: Tensor::ones(Shape::new(&[size]), DType::F32),
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::Initialized(_))
    }

    pub fn size(&self) -> usize {
        self.tensor().numel()
    }

    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Uninitialized { placeholder } => placeholder,
            Self::Initialized(value) => value,
        }
    }

    pub fn tensor_mut(&mut self) -> &mut Tensor {
        match self {
            Self::Uninitialized { placeholder } => placeholder,
            Self::Initialized(value) => value,
        }
    }

    /// Move to `Initialized(value)`. Fails if already initialized.
    pub fn initialize(&mut self, value: Tensor) -> Result<()> {
        if self.is_initialized() {
            return Err(ModelError::AlreadyInitialized);
        }
        if value.shape() != self.tensor().shape() {
            return Err(TensorError::ShapeMismatch {
                lhs: self.tensor().dims().to_vec(),
                rhs: value.dims().to_vec(),
            }
            .into());
        }
        *self = Self::Initialized(value);
        Ok(())
    }

    /// Initialize to `4 * mean(|x|)` per channel, with `x` viewed as `(-1, size)`.
    pub fn initialize_from(&mut self, x: &Tensor) -> Result<()> {
        if self.is_initialized() {
            return Err(ModelError::AlreadyInitialized);
        }
        let size = self.size();
        if size == 0 || x.numel() % size != 0 {
            return Err(TensorError::NumelMismatch {
                expected: size,
                got: x.numel(),
            }
            .into());
        }
        if x.numel() == 0 {
            return Err(ModelError::EmptyThresholdBatch);
        }
        let rows = x.numel() / size;
        let mut sums = vec![0.0f32; size];
        for row in x.data().chunks_exact(size) {
            for (s, &v) in sums.iter_mut().zip(row) {
                *s += v.abs();
            }
        }
        let init: Vec<f32> = sums.iter().map(|s| 4.0 * s / rows as f32).collect();
        tracing::debug!(size, rows, "initializing learnable threshold from first batch");
        self.initialize(Tensor::from_vec(init, Shape::new(&[size])))
    }

    /// Treat the current value (e.g. just loaded from a checkpoint) as initialized.
    pub fn mark_initialized(&mut self) {
        if let Self::Uninitialized { placeholder } = self {
            let value = std::mem::replace(placeholder, Tensor::scalar(0.0));
            *self = Self::Initialized(value);
        }
    }
}

/// Heaviside step activation with a learnable threshold and scale.
pub struct SpikingActivation {
    /// beta, per channel
    pub zero_point: Tensor,
    /// alpha, per channel
    pub embed_scale: AlphaInit,
    /// Cached u = x - beta from the last forward pass.
    last_shifted: Option<Vec<f32>>,
    inference_mode: bool,
}

impl SpikingActivation {
    pub fn new(size: usize) -> Self {
        Self {
            zero_point: Tensor::zeros(Shape::new(&[size]), DType::F32),
            embed_scale: AlphaInit::new(size),
            last_shifted: None,
            inference_mode: false,
        }
    }

    pub fn size(&self) -> usize {
        self.zero_point.numel()
    }
}

impl Layer for SpikingActivation {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let c = self.size();
        assert_eq!(
            input.shape().last_dim(),
            c,
            "spiking activation expects {c} channels, got shape {}",
            input.shape()
        );
        if !self.embed_scale.is_initialized() {
            if let Err(e) = self.embed_scale.initialize_from(input) {
                panic!("{e}");
            }
        }

        let beta = self.zero_point.data();
        let alpha = self.embed_scale.tensor().data();
        let mut shifted = Vec::with_capacity(input.numel());
        let mut out = Vec::with_capacity(input.numel());
        for row in input.data().chunks_exact(c) {
            for j in 0..c {
                let u = row[j] - beta[j];
                shifted.push(u);
                out.push(if u > 0.0 { alpha[j] } else { 0.0 });
            }
        }
        if !self.inference_mode {
            self.last_shifted = Some(shifted);
        }
        Tensor::from_vec(out, input.shape().clone())
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let Some(shifted) = self.last_shifted.take() else {
            return grad_output.clone();
        };
        let c = self.size();
        let alpha = self.embed_scale.tensor().data();
        let go = grad_output.data();
        let mut grad_x = vec![0.0f32; go.len()];
        let mut grad_beta = vec![0.0f32; c];
        let mut grad_alpha = vec![0.0f32; c];

        for (i, (&u, &g)) in shifted.iter().zip(go).enumerate() {
            let j = i % c;
            let gx = surrogate_grad_x(u, alpha[j]) * g;
            grad_x[i] = gx;
            grad_beta[j] -= gx;
            grad_alpha[j] += surrogate_grad_alpha(u) * g;
        }

        accumulate_grad(&mut self.zero_point, &grad_beta);
        accumulate_grad(self.embed_scale.tensor_mut(), &grad_alpha);
        Tensor::from_vec(grad_x, grad_output.shape().clone())
    }

    fn set_inference_mode(&mut self, mode: bool) {
        self.inference_mode = mode;
    }
}

impl Parameters for SpikingActivation {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        vec![
            (join_name(prefix, "zero_point"), &self.zero_point),
            (join_name(prefix, "embed_scale"), self.embed_scale.tensor()),
        ]
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        vec![
            (join_name(prefix, "zero_point"), &mut self.zero_point),
            (join_name(prefix, "embed_scale"), self.embed_scale.tensor_mut()),
        ]
    }
}

/// Uniform quantizer with a learnable per-channel clipping scale.
pub struct LearnableQuantizer {
    pub act_alpha: AlphaInit,
    bits: u32,
    /// Cached x / alpha and the quantized levels from the last forward pass.
    last_normalized: Option<Vec<f32>>,
    last_levels: Option<Vec<f32>>,
    inference_mode: bool,
}

impl LearnableQuantizer {
    pub fn new(size: usize, bits: u32) -> Self {
        assert!((1..=16).contains(&bits), "quantizer supports 1..=16 bits, got {bits}");
        Self {
            act_alpha: AlphaInit::new(size),
            bits,
            last_normalized: None,
            last_levels: None,
            inference_mode: false,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of quantization steps, 2^b - 1.
    fn steps(&self) -> f32 {
        ((1u32 << self.bits) - 1) as f32
    }
}

impl Layer for LearnableQuantizer {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let c = self.act_alpha.size();
        assert_eq!(
            input.shape().last_dim(),
            c,
            "quantizer expects {c} channels, got shape {}",
            input.shape()
        );
        if !self.act_alpha.is_initialized() {
            if let Err(e) = self.act_alpha.initialize_from(input) {
                panic!("{e}");
            }
        }

        let steps = self.steps();
        let alpha = self.act_alpha.tensor().data();
        let mut normalized = Vec::with_capacity(input.numel());
        let mut levels = Vec::with_capacity(input.numel());
        let mut out = Vec::with_capacity(input.numel());
        for row in input.data().chunks_exact(c) {
            for j in 0..c {
                let n = if alpha[j] != 0.0 { row[j] / alpha[j] } else { 0.0 };
                let q = (n.clamp(0.0, 1.0) * steps).round_ties_even() / steps;
                normalized.push(n);
                levels.push(q);
                out.push(q * alpha[j]);
            }
        }
        if !self.inference_mode {
            self.last_normalized = Some(normalized);
            self.last_levels = Some(levels);
        }
        Tensor::from_vec(out, input.shape().clone())
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let (Some(normalized), Some(levels)) = (self.last_normalized.take(), self.last_levels.take())
        else {
            return grad_output.clone();
        };
        let c = self.act_alpha.size();
        let go = grad_output.data();
        let mut grad_x = vec![0.0f32; go.len()];
        let mut grad_alpha = vec![0.0f32; c];

        for (i, ((&n, &q), &g)) in normalized.iter().zip(&levels).zip(go).enumerate() {
            let j = i % c;
            if n > 1.0 {
                grad_alpha[j] += g;
            } else {
                grad_alpha[j] += g * (q - n);
                grad_x[i] = g;
            }
        }

        accumulate_grad(self.act_alpha.tensor_mut(), &grad_alpha);
        Tensor::from_vec(grad_x, grad_output.shape().clone())
    }

    fn set_inference_mode(&mut self, mode: bool) {
        self.inference_mode = mode;
    }
}

impl Parameters for LearnableQuantizer {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        vec![(join_name(prefix, "act_alpha"), self.act_alpha.tensor())]
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        vec![(join_name(prefix, "act_alpha"), self.act_alpha.tensor_mut())]
    }
}

/// Activation site, one variant per `ActivationKind`.
pub enum Activation {
    Spiking(SpikingActivation),
    Quantized(LearnableQuantizer),
}

impl Activation {
    pub fn new(kind: ActivationKind, size: usize) -> Self {
        match kind {
            ActivationKind::Spiking => Self::Spiking(SpikingActivation::new(size)),
            ActivationKind::Quantized { bits } => Self::Quantized(LearnableQuantizer::new(size, bits)),
        }
    }

    pub fn kind(&self) -> ActivationKind {
        match self {
            Self::Spiking(_) => ActivationKind::Spiking,
            Self::Quantized(q) => ActivationKind::Quantized { bits: q.bits() },
        }
    }

    pub fn size(&self) -> usize {
        self.alpha().size()
    }

    /// Back to construction state: beta zeros, alpha an uninitialized placeholder.
    pub fn reset(&mut self) {
        *self = Self::new(self.kind(), self.size());
    }

    pub fn alpha(&self) -> &AlphaInit {
        match self {
            Self::Spiking(a) => &a.embed_scale,
            Self::Quantized(q) => &q.act_alpha,
        }
    }

    pub fn alpha_mut(&mut self) -> &mut AlphaInit {
        match self {
            Self::Spiking(a) => &mut a.embed_scale,
            Self::Quantized(q) => &mut q.act_alpha,
        }
    }
}

impl Layer for Activation {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        match self {
            Self::Spiking(a) => a.forward(input),
            Self::Quantized(q) => q.forward(input),
        }
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        match self {
            Self::Spiking(a) => a.backward(grad_output),
            Self::Quantized(q) => q.backward(grad_output),
        }
    }

    fn set_inference_mode(&mut self, mode: bool) {
        match self {
            Self::Spiking(a) => a.set_inference_mode(mode),
            Self::Quantized(q) => q.set_inference_mode(mode),
        }
    }
}

impl Parameters for Activation {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        match self {
            Self::Spiking(a) => a.named_parameters(prefix),
            Self::Quantized(q) => q.named_parameters(prefix),
        }
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        match self {
            Self::Spiking(a) => a.named_parameters_mut(prefix),
            Self::Quantized(q) => q.named_parameters_mut(prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpha_init_from_first_batch() {
        let mut alpha = AlphaInit::new(2);
        let x = Tensor::from_slice(&[1.0, -2.0, -3.0, 4.0], Shape::new(&[2, 2]));
        alpha.initialize_from(&x).unwrap();
        assert!(alpha.is_initialized());
        // channel 0: 4 * (1 + 3) / 2, channel 1: 4 * (2 + 4) / 2
        assert_eq!(alpha.tensor().data(), &[8.0, 12.0]);
    }

    #[test]
    fn test_alpha_init_twice_fails() {
        let mut alpha = AlphaInit::new(2);
        let x = Tensor::ones(Shape::new(&[3, 2]), DType::F32);
        alpha.initialize_from(&x).unwrap();
        assert!(matches!(
            alpha.initialize_from(&x),
            Err(ModelError::AlreadyInitialized)
        ));
        assert!(matches!(
            alpha.initialize(Tensor::ones(Shape::new(&[2]), DType::F32)),
            Err(ModelError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_alpha_init_rejects_channel_mismatch() {
        let mut alpha = AlphaInit::new(3);
        let x = Tensor::ones(Shape::new(&[2, 2]), DType::F32);
        assert!(matches!(alpha.initialize_from(&x), Err(ModelError::Tensor(_))));
        assert!(!alpha.is_initialized());
    }

    #[test]
    fn test_alpha_init_rejects_empty_batch() {
        let mut alpha = AlphaInit::new(2);
        let empty = Tensor::zeros(Shape::new(&[0, 2]), DType::F32);
        assert!(matches!(
            alpha.initialize_from(&empty),
            Err(ModelError::EmptyThresholdBatch)
        ));
        assert!(!alpha.is_initialized());

        let x = Tensor::from_slice(&[1.0, -1.0], Shape::new(&[1, 2]));
        alpha.initialize_from(&x).unwrap();
        assert_eq!(alpha.tensor().data(), &[4.0, 4.0]);
    }

    #[test]
    fn test_mark_initialized_keeps_value() {
        let mut alpha = AlphaInit::new(2);
        alpha.tensor_mut().data_mut().copy_from_slice(&[0.5, 0.25]);
        alpha.mark_initialized();
        assert!(alpha.is_initialized());
        assert_eq!(alpha.tensor().data(), &[0.5, 0.25]);
    }

    #[test]
    fn test_spiking_forward_is_binary() {
        let mut act = SpikingActivation::new(3);
        let x = Tensor::from_slice(&[0.5, -1.0, 2.0, -0.5, 1.0, 0.0], Shape::new(&[2, 3]));
        let y = act.forward(&x);
        let alpha = act.embed_scale.tensor().data().to_vec();
        assert_eq!(alpha, vec![2.0, 4.0, 4.0]);
        assert_eq!(y.data(), &[alpha[0], 0.0, alpha[2], 0.0, alpha[1], 0.0]);
    }

    #[test]
    fn test_spiking_initializes_only_on_first_call() {
        let mut act = SpikingActivation::new(2);
        act.forward(&Tensor::ones(Shape::new(&[1, 2]), DType::F32));
        let first = act.embed_scale.tensor().data().to_vec();
        act.forward(&Tensor::full(Shape::new(&[1, 2]), 10.0));
        assert_eq!(act.embed_scale.tensor().data(), first.as_slice());
    }

    #[test]
    fn test_spiking_backward_formulas() {
        let mut act = SpikingActivation::new(1);
        act.embed_scale
            .initialize(Tensor::from_slice(&[2.0], Shape::new(&[1])))
            .unwrap();
        act.zero_point.data_mut()[0] = 0.25;
        let x = Tensor::from_slice(&[0.5, -0.5], Shape::new(&[2, 1]));
        act.forward(&x);
        let g = Tensor::from_slice(&[1.0, 3.0], Shape::new(&[2, 1]));
        let dx = act.backward(&g);

        let u = [0.25f32, -0.75];
        for (i, &ui) in u.iter().enumerate() {
            let expected = 2.0 * 4.0 / (PI * ((4.0 * ui).powi(2) + 1.0)) * g.data()[i];
            assert!((dx.data()[i] - expected).abs() < 1e-6);
        }
        let grad_beta = act.zero_point.grad().unwrap().data()[0];
        assert!((grad_beta + dx.data().iter().sum::<f32>()).abs() < 1e-6);
        let expected_alpha: f32 = u
            .iter()
            .zip(g.data())
            .map(|(&ui, &gi)| (ui.atan() / PI + 0.5) * gi)
            .sum();
        let grad_alpha = act.embed_scale.tensor().grad().unwrap().data()[0];
        assert!((grad_alpha - expected_alpha).abs() < 1e-6);
    }

    #[test]
    fn test_surrogate_grad_matches_finite_difference() {
        let h = 1e-3f32;
        for &u in &[-1.0f32, -0.2, 0.0, 0.1, 0.7] {
            let numeric = (surrogate(u + h, 1.5) - surrogate(u - h, 1.5)) / (2.0 * h);
            assert!((numeric - surrogate_grad_x(u, 1.5)).abs() < 1e-2, "u={u}");
        }
    }

    #[test]
    fn test_quantizer_levels() {
        let mut q = LearnableQuantizer::new(1, 2);
        q.act_alpha
            .initialize(Tensor::from_slice(&[3.0], Shape::new(&[1])))
            .unwrap();
        let x = Tensor::from_slice(&[-1.0, 0.4, 1.6, 2.9, 7.0], Shape::new(&[5, 1]));
        let y = q.forward(&x);
        // levels {0, 1/3, 2/3, 1} * 3
        assert_eq!(y.data(), &[0.0, 0.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_quantizer_backward_clips() {
        let mut q = LearnableQuantizer::new(1, 2);
        q.act_alpha
            .initialize(Tensor::from_slice(&[3.0], Shape::new(&[1])))
            .unwrap();
        let x = Tensor::from_slice(&[1.6, 7.0], Shape::new(&[2, 1]));
        q.forward(&x);
        let dx = q.backward(&Tensor::ones(Shape::new(&[2, 1]), DType::F32));
        assert_eq!(dx.data(), &[1.0, 0.0]);
        // (q - n) for 1.6/3 -> level 2/3, plus 1 for the clipped element
        let expected = (2.0 / 3.0 - 1.6 / 3.0) + 1.0;
        let got = q.act_alpha.tensor().grad().unwrap().data()[0];
        assert!((got - expected).abs() < 1e-6);
    }

    #[test]
    fn test_activation_variant_names() {
        let spiking = Activation::new(ActivationKind::Spiking, 4);
        let names: Vec<String> = spiking.named_parameters("act").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["act.zero_point", "act.embed_scale"]);

        let quant = Activation::new(ActivationKind::Quantized { bits: 4 }, 4);
        let names: Vec<String> = quant.named_parameters("act").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["act.act_alpha"]);
        assert!(!quant.alpha().is_initialized());
    }
}
