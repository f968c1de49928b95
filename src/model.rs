// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Top-level QuantGPT model.
//!
//! Architecture:
//!   Embedding -> [Block x n_layer] -> IdentityNorm -> Linear (lm_head, no bias)
//!
//! Two forward modes:
//!   - full sequence (`input_pos` = None): rotary rows 0..T, causal attention
//!     inside the sequence, no cache touched, backward available afterwards.
//!   - incremental decode (`input_pos` = Some): rotary rows and mask rows are
//!     selected by position, k/v go through per-layer caches sized by
//!     `max_seq_length` on first use and kept until `reset_cache`.
//!
//! Rotary and mask tables are built lazily on first use and reused.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::block::Block;
use crate::cache::{KvCache, MaskCache};
use crate::config::Config;
use crate::error::{ModelError, Result};
use crate::generate;
use crate::layers::{join_name, Embedding, IdentityNorm, Layer, Linear, Parameters};
use crate::rope::RopeCache;
use crate::tensor::{Tensor, TensorError};

/// Checkpoint exchange format: parameter name -> tensor.
pub type StateDict = HashMap<String, Tensor>;

/// Seed used by the constructor's weight init.
pub const DEFAULT_SEED: u64 = 1337;

/// Where the model's tensors live. Lazy-tensor devices must rebuild the
/// rotary and mask tables after a cache reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
    Xla,
}

pub struct QuantGpt {
    config: Config,
    lm_head: Linear,
    wte: Embedding,
    h: Vec<Block>,
    ln_f: IdentityNorm,
    rope_cache: Option<RopeCache>,
    mask_cache: Option<MaskCache>,
    kv_caches: Vec<KvCache>,
    device: Device,
    inference_mode: bool,
    /// Set by a full-sequence training forward, consumed by backward.
    backward_ready: bool,
}

impl QuantGpt {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_seed(config, DEFAULT_SEED)
    }

    pub fn with_seed(config: Config, seed: u64) -> Result<Self> {
        config.validate()?;
        let padded_vocab = config.padded_vocab_size.unwrap_or(config.vocab_size);
        let h = (0..config.n_layer)
            .map(|_| Block::new(&config))
            .collect::<Result<Vec<_>>>()?;
        let mut model = Self {
            lm_head: Linear::new(config.n_embd, padded_vocab, false),
            wte: Embedding::new(padded_vocab, config.n_embd),
            h,
            ln_f: IdentityNorm::new(config.n_embd, config.norm_eps),
            rope_cache: None,
            mask_cache: None,
            kv_caches: Vec::new(),
            device: Device::Cpu,
            inference_mode: false,
            backward_ready: false,
            config,
        };
        model.reset_parameters(seed);
        info!(
            name = %model.config.name,
            n_layer = model.config.n_layer,
            parameters = model.num_parameters(),
            "built model"
        );
        Ok(model)
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::new(Config::from_name(name)?)
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn num_layers(&self) -> usize {
        self.h.len()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.h
    }

    pub fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.h
    }

    pub fn kv_caches(&self) -> &[KvCache] {
        &self.kv_caches
    }

    pub fn has_rope_cache(&self) -> bool {
        self.rope_cache.is_some()
    }

    pub fn has_mask_cache(&self) -> bool {
        self.mask_cache.is_some()
    }

    /// Redraw every parameter from `seed`:
    ///   embedding and linear weights ~ N(0, sqrt(2 / (5 * n_embd))), biases 0
    ///   output projections (attn proj, mlp proj / w3) ~ N(0, 1 / (sqrt(n_embd) * n_layer))
    ///   NormedLinear gains 0.01, activations back to uninitialized
    pub fn reset_parameters(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let n_embd = self.config.n_embd as f32;
        let std = (2.0 / 5.0 / n_embd).sqrt();
        let proj_std = 1.0 / n_embd.sqrt() / self.config.n_layer as f32;

        self.wte.init_normal(std, &mut rng);
        for block in &mut self.h {
            block.init_weights(std, proj_std, &mut rng);
        }
        self.lm_head.init_normal(std, &mut rng);
        self.set_inference_mode(self.inference_mode);
        info!(seed, std, proj_std, "initialized parameters");
    }

    pub fn inference_mode(&self) -> bool {
        self.inference_mode
    }

    pub fn set_inference_mode(&mut self, mode: bool) {
        self.inference_mode = mode;
        self.wte.set_inference_mode(mode);
        for block in &mut self.h {
            block.set_inference_mode(mode);
        }
        self.lm_head.set_inference_mode(mode);
        if mode {
            self.backward_ready = false;
        }
    }

    /// Drop the per-layer kv caches. On a lazy-tensor device the rotary and
    /// mask tables are dropped too.
    pub fn reset_cache(&mut self) {
        self.kv_caches.clear();
        if self.device == Device::Xla && self.mask_cache.is_some() {
            self.rope_cache = None;
            self.mask_cache = None;
        }
        info!(device = ?self.device, "reset kv caches");
    }

    fn build_rope_cache(config: &Config) -> RopeCache {
        info!(
            block_size = config.block_size,
            n_elem = config.rope_n_elem(),
            dtype = ?config.rope_dtype,
            "building rope cache"
        );
        RopeCache::new(
            config.block_size,
            config.rope_n_elem(),
            config.rope_dtype,
            config.rope_base,
            config.condense_ratio,
        )
    }

    fn build_kv_caches(&self, batch: usize, max_seq_length: usize) -> Vec<KvCache> {
        info!(batch, max_seq_length, n_layer = self.config.n_layer, "building kv caches");
        (0..self.config.n_layer)
            .map(|_| {
                KvCache::new(
                    batch,
                    max_seq_length,
                    self.config.n_query_groups,
                    self.config.head_size,
                )
            })
            .collect()
    }

    /// Tokens [batch * seq] -> logits [batch, seq, padded_vocab_size].
    ///
    /// `max_seq_length` defaults to `block_size`. Passing `input_pos` (one
    /// position per sequence step) selects incremental decoding.
    pub fn forward(
        &mut self,
        tokens: &[usize],
        (batch, seq): (usize, usize),
        max_seq_length: Option<usize>,
        input_pos: Option<&[usize]>,
    ) -> Result<Tensor> {
        let block_size = self.config.block_size;
        let max_seq_length = max_seq_length.unwrap_or(block_size);
        let use_kv_cache = input_pos.is_some();

        if tokens.len() != batch * seq {
            return Err(TensorError::NumelMismatch {
                expected: batch * seq,
                got: tokens.len(),
            }
            .into());
        }
        if batch == 0 || seq == 0 {
            return Err(ModelError::EmptyInput { batch, seq });
        }
        if use_kv_cache && max_seq_length < seq {
            return Err(ModelError::DecodeLengthExceeded {
                seq_len: seq,
                max_seq_length,
            });
        }
        if max_seq_length > block_size {
            return Err(ModelError::MaxSeqLenTooLong {
                max_seq_length,
                block_size,
            });
        }
        if seq > block_size {
            return Err(ModelError::SequenceTooLong {
                seq_len: seq,
                block_size,
            });
        }
        let vocab_size = self.wte.vocab_size();
        if let Some(&token) = tokens.iter().find(|&&t| t >= vocab_size) {
            return Err(ModelError::TokenOutOfRange { token, vocab_size });
        }
        if let Some(pos) = input_pos {
            if pos.len() != seq {
                return Err(ModelError::PositionCountMismatch {
                    expected: seq,
                    got: pos.len(),
                });
            }
            if let Some(&position) = pos.iter().find(|&&p| p >= block_size) {
                return Err(ModelError::PositionOutOfRange {
                    position,
                    block_size,
                });
            }
        }
        debug!(batch, seq, max_seq_length, use_kv_cache, "forward");

        let rope_table = self
            .rope_cache
            .get_or_insert_with(|| Self::build_rope_cache(&self.config));
        let rope = match input_pos {
            None => rope_table.prefix(seq)?,
            Some(pos) => rope_table.select(pos)?,
        };

        let mut x = self.wte.try_forward_with_ids(tokens, batch, seq)?;

        match input_pos {
            None => {
                for block in &mut self.h {
                    x = block.forward(&x, &rope, max_seq_length, None, None, None)?;
                }
            }
            Some(pos) => {
                let mask = self
                    .mask_cache
                    .get_or_insert_with(|| {
                        info!(block_size, "building mask cache");
                        MaskCache::new(block_size)
                    })
                    .rows(pos, max_seq_length)?;
                if self.kv_caches.is_empty() {
                    self.kv_caches = self.build_kv_caches(batch, max_seq_length);
                }
                for (block, cache) in self.h.iter_mut().zip(self.kv_caches.iter_mut()) {
                    x = block.forward(&x, &rope, max_seq_length, Some(&mask), Some(pos), Some(cache))?;
                }
            }
        }

        let x = self.ln_f.forward(&x);
        let logits = self.lm_head.forward(&x);
        self.backward_ready = !use_kv_cache && !self.inference_mode;
        Ok(logits)
    }

    /// Full-sequence forward.
    pub fn forward_ids(&mut self, tokens: &[usize], batch: usize, seq: usize) -> Result<Tensor> {
        self.forward(tokens, (batch, seq), None, None)
    }

    pub fn generate_greedy(&mut self, prompt: &[usize], max_len: usize) -> Result<Vec<usize>> {
        generate::generate_greedy(self, prompt, max_len)
    }

    pub fn generate_sample(
        &mut self,
        prompt: &[usize],
        max_len: usize,
        temperature: f32,
        seed: u64,
    ) -> Result<Vec<usize>> {
        generate::generate_sample(self, prompt, max_len, temperature, seed)
    }

    pub fn generate_top_k(
        &mut self,
        prompt: &[usize],
        max_len: usize,
        k: usize,
        temperature: f32,
        seed: u64,
    ) -> Result<Vec<usize>> {
        generate::generate_top_k(self, prompt, max_len, k, temperature, seed)
    }

    pub fn generate_top_p(
        &mut self,
        prompt: &[usize],
        max_len: usize,
        top_p: f32,
        temperature: f32,
        seed: u64,
    ) -> Result<Vec<usize>> {
        generate::generate_top_p(self, prompt, max_len, top_p, temperature, seed)
    }

    /// Backpropagate `grad_logits` [batch, seq, padded_vocab_size] through the
    /// last full-sequence forward. Gradients accumulate into every parameter;
    /// returns the gradient with respect to the embedding output.
    pub fn backward(&mut self, grad_logits: &Tensor) -> Result<Tensor> {
        if !self.backward_ready {
            return Err(ModelError::BackwardUnavailable);
        }
        self.backward_ready = false;

        let g = self.lm_head.backward(grad_logits);
        let mut g = self.ln_f.backward(&g);
        for block in self.h.iter_mut().rev() {
            g = block.backward(&g)?;
        }
        self.wte.backward(&g);
        Ok(g)
    }

    /// Parameters in checkpoint naming (`lm_head.weight`, `transformer.wte.weight`,
    /// `transformer.h.{i}.attn.attn.weight`, ...).
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = self.lm_head.named_parameters("lm_head");
        params.extend(self.wte.named_parameters("transformer.wte"));
        for (i, block) in self.h.iter().enumerate() {
            params.extend(block.named_parameters(&join_name("transformer.h", &i.to_string())));
        }
        params
    }

    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = self.lm_head.named_parameters_mut("lm_head");
        params.extend(self.wte.named_parameters_mut("transformer.wte"));
        for (i, block) in self.h.iter_mut().enumerate() {
            params.extend(block.named_parameters_mut(&join_name("transformer.h", &i.to_string())));
        }
        params
    }

    pub fn parameters(&self) -> Vec<&Tensor> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.named_parameters_mut().into_iter().map(|(_, p)| p).collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    pub fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.clear_grad();
        }
    }

    /// Copy of every parameter, keyed by checkpoint name.
    pub fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| (name, Tensor::from_slice(p.data(), p.shape().clone())))
            .collect()
    }

    /// Load parameters by name. All names and shapes are checked before
    /// anything is written; loaded thresholds count as initialized.
    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let expected: HashMap<String, Vec<usize>> = self
            .named_parameters()
            .into_iter()
            .map(|(name, p)| (name, p.dims().to_vec()))
            .collect();

        let mut names: Vec<&String> = state.keys().collect();
        names.sort();
        if let Some(name) = names.into_iter().find(|n| !expected.contains_key(*n)) {
            return Err(ModelError::UnknownParameter(name.clone()));
        }
        for (name, p) in self.named_parameters() {
            match state.get(&name) {
                None => return Err(ModelError::MissingParameter(name)),
                Some(src) if src.dims() != p.dims() => {
                    return Err(ModelError::ParameterShape {
                        expected: p.dims().to_vec(),
                        got: src.dims().to_vec(),
                        name,
                    })
                }
                Some(_) => {}
            }
        }

        for (name, p) in self.named_parameters_mut() {
            if let Some(src) = state.get(&name) {
                p.data_mut().copy_from_slice(src.data());
            }
        }
        for block in &mut self.h {
            for act in block.activations_mut() {
                act.alpha_mut().mark_initialized();
            }
        }
        info!(tensors = state.len(), "loaded state dict");
        Ok(())
    }
}
