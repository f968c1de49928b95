// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Model configuration profiles.
//!
//! Key relationships:
//! - `n_head * head_size` = packed attention output width (must equal `n_embd`).
//! - `n_query_groups` < `n_head` enables grouped-query attention; each group
//!   owns one key and one value head shared by `n_head / n_query_groups` queries.
//! - `rotary_percentage * head_size` dims of every q/k head are rotated.
//! - `padded_vocab_size` is the embedding/head row count; `finalize()` derives
//!   it from `vocab_size` and `padding_multiple` when unset.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::tensor::DType;

/// Feed-forward variant, fixed at model construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MlpClass {
    /// activation -> fc -> activation -> normalized proj
    Spiking,
    /// silu(w1 x) * (w2 x) -> w3
    Gated,
}

/// Nonlinearity used at every activation site of attention and the spiking MLP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Heaviside step with arctangent surrogate gradient.
    Spiking,
    /// Uniform `bits`-bit quantizer with clipped straight-through gradient.
    Quantized { bits: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    /// Maximum sequence length the rotary and mask caches cover.
    pub block_size: usize,
    pub vocab_size: usize,
    pub padding_multiple: usize,
    pub padded_vocab_size: Option<usize>,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub head_size: usize,
    pub n_query_groups: usize,
    pub intermediate_size: usize,
    pub rotary_percentage: f32,
    /// Positions are divided by this ratio before computing rotary angles.
    pub condense_ratio: usize,
    pub rope_base: f32,
    /// Precision the rotary tables are rounded to.
    pub rope_dtype: DType,
    pub bias: bool,
    pub parallel_residual: bool,
    pub shared_attention_norm: bool,
    pub norm_eps: f32,
    pub mlp_class: MlpClass,
    pub activation: ActivationKind,
}

impl Default for Config {
    fn default() -> Self {
        Self::tiny()
    }
}

impl Config {
    /// Minimal config for unit tests and benchmarks.
    pub fn tiny() -> Self {
        Self {
            name: "tiny".to_string(),
            block_size: 32,
            vocab_size: 100,
            padding_multiple: 64,
            padded_vocab_size: Some(128),
            n_layer: 2,
            n_head: 4,
            n_embd: 32,
            head_size: 8,
            n_query_groups: 2,
            intermediate_size: 64,
            rotary_percentage: 1.0,
            condense_ratio: 1,
            rope_base: 10000.0,
            rope_dtype: DType::F32,
            bias: true,
            parallel_residual: true,
            shared_attention_norm: false,
            norm_eps: 1e-5,
            mlp_class: MlpClass::Spiking,
            activation: ActivationKind::Spiking,
        }
    }

    pub fn small() -> Self {
        Self {
            name: "small".to_string(),
            block_size: 256,
            vocab_size: 1000,
            padding_multiple: 64,
            padded_vocab_size: Some(1024),
            n_layer: 4,
            n_head: 8,
            n_embd: 256,
            head_size: 32,
            n_query_groups: 2,
            intermediate_size: 1024,
            rotary_percentage: 1.0,
            condense_ratio: 1,
            rope_base: 10000.0,
            rope_dtype: DType::BF16,
            bias: false,
            parallel_residual: false,
            shared_attention_norm: false,
            norm_eps: 1e-5,
            mlp_class: MlpClass::Spiking,
            activation: ActivationKind::Spiking,
        }
    }

    /// TinyLlama 1.1B geometry with the spiking blocks swapped in.
    pub fn tiny_llama_1_1b() -> Self {
        Self {
            name: "tiny-llama-1.1b".to_string(),
            block_size: 2048,
            vocab_size: 32000,
            padding_multiple: 64,
            padded_vocab_size: Some(32000),
            n_layer: 22,
            n_head: 32,
            n_embd: 2048,
            head_size: 64,
            n_query_groups: 4,
            intermediate_size: 5632,
            rotary_percentage: 1.0,
            condense_ratio: 1,
            rope_base: 10000.0,
            rope_dtype: DType::BF16,
            bias: false,
            parallel_residual: false,
            shared_attention_norm: false,
            norm_eps: 1e-5,
            mlp_class: MlpClass::Spiking,
            activation: ActivationKind::Spiking,
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "tiny" => Ok(Self::tiny()),
            "small" => Ok(Self::small()),
            "tiny-llama-1.1b" => Ok(Self::tiny_llama_1_1b()),
            other => Err(ModelError::InvalidConfig(format!("unknown config name `{other}`"))),
        }
    }

    /// Parse a JSON config; missing fields fall back to the `tiny` preset.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| ModelError::InvalidConfig(e.to_string()))?;
        Ok(config.finalize())
    }

    /// Fill in `padded_vocab_size` when the caller left it unset.
    pub fn finalize(mut self) -> Self {
        if self.padded_vocab_size.is_none() {
            self.padded_vocab_size = Some(find_multiple(self.vocab_size, self.padding_multiple));
        }
        self
    }

    /// Number of leading head dims that receive the rotary embedding.
    pub fn rope_n_elem(&self) -> usize {
        (self.rotary_percentage * self.head_size as f32) as usize
    }

    pub fn q_per_kv(&self) -> usize {
        self.n_head / self.n_query_groups
    }

    /// Width of the packed q/k/v projection.
    pub fn qkv_width(&self) -> usize {
        (self.n_head + 2 * self.n_query_groups) * self.head_size
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ModelError::InvalidConfig(msg));
        if self.n_layer == 0 || self.n_head == 0 || self.n_embd == 0 || self.head_size == 0 {
            return invalid("layer, head, embedding and head sizes must be non-zero".into());
        }
        if self.n_query_groups == 0 || self.n_head % self.n_query_groups != 0 {
            return invalid(format!(
                "n_head={} is not divisible by n_query_groups={}",
                self.n_head, self.n_query_groups
            ));
        }
        if self.n_head * self.head_size != self.n_embd {
            return invalid(format!(
                "n_head*head_size={} does not match n_embd={}",
                self.n_head * self.head_size,
                self.n_embd
            ));
        }
        let n_elem = self.rope_n_elem();
        if !(0.0..=1.0).contains(&self.rotary_percentage) || n_elem % 2 != 0 {
            return invalid(format!(
                "rotary dims {n_elem} (rotary_percentage={}) must be even and within head_size",
                self.rotary_percentage
            ));
        }
        if self.condense_ratio == 0 || self.block_size == 0 || self.intermediate_size == 0 {
            return invalid("condense_ratio, block_size and intermediate_size must be non-zero".into());
        }
        match self.padded_vocab_size {
            None => invalid("padded_vocab_size must be set before model construction".into()),
            Some(p) if p < self.vocab_size => invalid(format!(
                "padded_vocab_size={p} is smaller than vocab_size={}",
                self.vocab_size
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Smallest multiple of `k` that is >= `n`.
pub fn find_multiple(n: usize, k: usize) -> usize {
    if k == 0 || n % k == 0 {
        return n;
    }
    n + k - (n % k)
}
