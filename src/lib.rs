// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! CPU QuantGPT: a decoder-only transformer whose activations are learnable
//! spike thresholds (or low-bit quantizers) and whose output projections are
//! column-normalized.
//!
//! Public API facade. All internal modules are private; users write
//! `quant_gpt::QuantGpt`, not `quant_gpt::model::QuantGpt`.
//!
//! # Module organization
//! - `tensor`     -- Tensor type, shape, emulated bf16/f16 rounding
//! - `blas`       -- Portable row-major sgemm kernels
//! - `error`      -- `ModelError` and the crate `Result`
//! - `config`     -- Model hyperparameter profiles and JSON loading
//! - `activation` -- Spiking threshold and learnable quantizer activations
//! - `layers`     -- Embedding, Linear, NormedLinear, IdentityNorm, SwiGLU
//! - `rope`       -- Rotary tables and rotation
//! - `cache`      -- Per-layer kv cache and attention mask tables
//! - `attention`  -- Rectified grouped-query self-attention
//! - `mlp`        -- Spiking and gated feed-forward variants
//! - `block`      -- Parallel / sequential residual block
//! - `model`      -- QuantGpt (embed -> blocks -> ln_f -> lm_head), checkpoints
//! - `generate`   -- Sampling strategies and cached autoregressive generation

#![deny(unsafe_code)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]

mod activation;
mod attention;
mod blas;
mod block;
mod cache;
mod config;
mod error;
mod generate;
mod layers;
mod mlp;
mod model;
mod rope;
mod tensor;

// ---- Public API re-exports (facade pattern) ----

pub use activation::{
    surrogate, surrogate_grad_alpha, surrogate_grad_x, Activation, AlphaInit, LearnableQuantizer,
    SpikingActivation, SPIKE_SHARPNESS,
};
pub use attention::{attention_weights, relu_attention, weighted_values, CausalSelfAttention};
pub use block::Block;
pub use cache::{AttentionMask, KvCache, MaskCache};
pub use config::{find_multiple, ActivationKind, Config, MlpClass};
pub use error::{ModelError, Result};
pub use generate::{
    generate, generate_greedy, generate_sample, generate_top_k, generate_top_p, pick_token,
    SamplingStrategy,
};
pub use layers::{
    join_name, Embedding, IdentityNorm, Layer, Linear, NormedLinear, Parameters, SwiGLU,
    NORMED_LINEAR_INIT_SCALE,
};
pub use mlp::{FeedForward, SpikingMlp};
pub use model::{Device, QuantGpt, StateDict, DEFAULT_SEED};
pub use rope::{apply_rope, apply_rope_backward, RopeCache};
pub use tensor::{softmax_in_place, DType, Shape, Tensor, TensorError, TensorResult};

// Re-export BLAS wrappers for direct benchmarking (bypasses Tensor overhead).
pub use blas::{sgemm, sgemm_transa, sgemm_transb};

// Convenience aliases matching the checkpoint vocabulary.
pub type ModelConfig = Config;
