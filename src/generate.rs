// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Token generation with sampling strategies.
//!
//! Autoregressive generation with the kv cache: the prompt is prefilled at
//! positions 0..n in one decode call, then each new token is fed alone at
//! the next position. Caches are reset before and after the run.
//!
//! Sampling strategies:
//! - **Greedy**: argmax(logits)
//! - **Temperature**: softmax(logits / T), then sample from distribution
//! - **Top-k**: zero out all but the top-k logits, then temperature sample
//! - **Top-p (nucleus)**: keep smallest set of tokens with cumulative prob >= p
//!
//! Only the first `vocab_size` logits are sampled; padded rows never win.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::model::QuantGpt;
use crate::tensor;

/// Sampling strategy for token generation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplingStrategy {
    /// Always pick the highest-probability token
    Greedy,
    /// Sample from softmax(logits / temperature)
    Sample { temperature: f32 },
    /// Keep only top-k logits, then temperature sample
    TopK { k: usize, temperature: f32 },
    /// Keep tokens until cumulative probability >= top_p, then temperature sample
    TopP { top_p: f32, temperature: f32 },
}

pub fn pick_token(logits: &[f32], strategy: &SamplingStrategy, rng: &mut StdRng) -> usize {
    match *strategy {
        SamplingStrategy::Greedy => argmax(logits),
        SamplingStrategy::Sample { temperature } => sample_from_logits(logits, temperature, rng),
        SamplingStrategy::TopK { k, temperature } => sample_top_k(logits, k, temperature, rng),
        SamplingStrategy::TopP { top_p, temperature } => {
            sample_top_p(logits, top_p, temperature, rng)
        }
    }
}

/// Generate until the sequence holds `max_len` tokens.
///
/// `max_len` sizes the kv caches and must fit in the block size. An empty
/// prompt starts from token 0; a prompt already at `max_len` is returned as is.
pub fn generate(
    model: &mut QuantGpt,
    prompt: &[usize],
    max_len: usize,
    strategy: &SamplingStrategy,
    seed: u64,
) -> Result<Vec<usize>> {
    let block_size = model.config().block_size;
    if max_len > block_size {
        return Err(ModelError::MaxSeqLenTooLong {
            max_seq_length: max_len,
            block_size,
        });
    }
    let mut tokens = if prompt.is_empty() {
        vec![0]
    } else {
        prompt.to_vec()
    };
    if tokens.len() >= max_len {
        return Ok(tokens);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let vocab = model.config().vocab_size;
    let was_inference = model.inference_mode();
    model.set_inference_mode(true);
    model.reset_cache();

    let result = decode_loop(model, &mut tokens, max_len, vocab, strategy, &mut rng);

    model.reset_cache();
    model.set_inference_mode(was_inference);
    result.map(|()| tokens)
}

fn decode_loop(
    model: &mut QuantGpt,
    tokens: &mut Vec<usize>,
    max_len: usize,
    vocab: usize,
    strategy: &SamplingStrategy,
    rng: &mut StdRng,
) -> Result<()> {
    let prefill: Vec<usize> = (0..tokens.len()).collect();
    let mut logits = model.forward(
        tokens,
        (1, tokens.len()),
        Some(max_len),
        Some(&prefill[..]),
    )?;
    debug!(prompt_len = tokens.len(), max_len, "prefilled prompt");

    loop {
        // Logits layout: [1, seq, padded_vocab]; the last row predicts the next token.
        let padded = logits.shape().last_dim();
        let rows = logits.numel() / padded;
        let last = &logits.data()[(rows - 1) * padded..(rows - 1) * padded + vocab];
        let next = pick_token(last, strategy, rng);
        tokens.push(next);
        if tokens.len() >= max_len {
            return Ok(());
        }
        let pos = [tokens.len() - 1];
        logits = model.forward(&[next], (1, 1), Some(max_len), Some(&pos[..]))?;
    }
}

pub fn generate_greedy(model: &mut QuantGpt, prompt: &[usize], max_len: usize) -> Result<Vec<usize>> {
    generate(model, prompt, max_len, &SamplingStrategy::Greedy, 0)
}

pub fn generate_sample(
    model: &mut QuantGpt,
    prompt: &[usize],
    max_len: usize,
    temperature: f32,
    seed: u64,
) -> Result<Vec<usize>> {
    generate(model, prompt, max_len, &SamplingStrategy::Sample { temperature }, seed)
}

pub fn generate_top_k(
    model: &mut QuantGpt,
    prompt: &[usize],
    max_len: usize,
    k: usize,
    temperature: f32,
    seed: u64,
) -> Result<Vec<usize>> {
    generate(model, prompt, max_len, &SamplingStrategy::TopK { k, temperature }, seed)
}

pub fn generate_top_p(
    model: &mut QuantGpt,
    prompt: &[usize],
    max_len: usize,
    top_p: f32,
    temperature: f32,
    seed: u64,
) -> Result<Vec<usize>> {
    generate(model, prompt, max_len, &SamplingStrategy::TopP { top_p, temperature }, seed)
}

fn argmax(slice: &[f32]) -> usize {
    slice
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn sorted_indices_desc(values: &[f32]) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..values.len()).collect();
    idxs.sort_unstable_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(Ordering::Equal));
    idxs
}

/// Temperature sampling: softmax(logits / T), then categorical sample.
/// T <= 0 falls back to greedy.
fn sample_from_logits(logits: &[f32], temperature: f32, rng: &mut StdRng) -> usize {
    if temperature <= 0.0 {
        return argmax(logits);
    }
    let inv_temp = 1.0 / temperature;
    let mut probs: Vec<f32> = logits.iter().map(|x| x * inv_temp).collect();
    tensor::softmax_in_place(&mut probs);
    sample_from_probs(&probs, rng)
}

fn sample_top_k(logits: &[f32], k: usize, temperature: f32, rng: &mut StdRng) -> usize {
    if k == 0 || k >= logits.len() {
        return sample_from_logits(logits, temperature, rng);
    }
    let idxs = sorted_indices_desc(logits);
    let mut filtered = vec![f32::NEG_INFINITY; logits.len()];
    for &idx in &idxs[..k] {
        filtered[idx] = logits[idx];
    }
    sample_from_logits(&filtered, temperature, rng)
}

/// Nucleus sampling: keep the smallest prefix of tokens (by probability)
/// whose mass reaches `top_p`, renormalize, sample.
fn sample_top_p(logits: &[f32], top_p: f32, temperature: f32, rng: &mut StdRng) -> usize {
    if !(0.0..1.0).contains(&top_p) {
        return sample_from_logits(logits, temperature, rng);
    }
    if temperature <= 0.0 {
        return argmax(logits);
    }
    let inv_temp = 1.0 / temperature;
    let mut probs: Vec<f32> = logits.iter().map(|x| x * inv_temp).collect();
    tensor::softmax_in_place(&mut probs);

    let idxs = sorted_indices_desc(&probs);
    let mut kept = Vec::new();
    let mut mass = 0.0;
    for idx in idxs {
        kept.push(idx);
        mass += probs[idx];
        if mass >= top_p {
            break;
        }
    }

    let mut truncated: Vec<f32> = kept.iter().map(|&idx| probs[idx]).collect();
    tensor::normalize_in_place(&mut truncated);
    kept[sample_from_probs(&truncated, rng)]
}

/// Inverse-CDF categorical draw. Falls back to the last index when rounding
/// leaves the cumulative sum just under `r`.
fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> usize {
    let r: f32 = rng.gen();
    let mut cum = 0.0;
    for (i, p) in probs.iter().enumerate() {
        cum += *p;
        if r <= cum {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}
