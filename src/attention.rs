// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Grouped-query causal self-attention with spiking encoders.
//!
//! Forward:
//!   x'      = act_in(x)
//!   qkv     = W_attn @ x'                       [C -> (n_head + 2G) * hs]
//!   q, k, v = split per group                   group g owns q_per_kv queries, 1 key, 1 value
//!   q, k    = act_q(rope(q)), act_k(rope(k))
//!   (k, v)  = cache.write_at(input_pos, k, v)   decode mode only
//!   W       = ReLU(q @ k^T / hs + bias)         bias: causal, boolean or additive mask
//!   y       = act_out(dropout(W) @ v)
//!   out     = NormedLinear(y)
//!
//! Query head h reads key/value group h / q_per_kv. Scores are scaled by
//! 1/head_size and rectified instead of softmax-normalized.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::activation::Activation;
use crate::blas::sgemm_raw;
use crate::cache::{AttentionMask, KvCache};
use crate::config::Config;
use crate::error::{ModelError, Result};
use crate::layers::{collect_named_params, collect_named_params_mut, Layer, Linear, NormedLinear, Parameters};
use crate::rope::{apply_rope, apply_rope_backward, RopeCache};
use crate::tensor::{Shape, Tensor, TensorError, TensorResult};

/// Post-ReLU attention weights [batch, n_head, T, S] for q [batch, T, n_head, hs]
/// against k [batch, S, groups, hs].
///
/// Without a mask the bias is causal, aligned top-left (key j visible to query i
/// iff j <= i).
pub fn attention_weights(
    q: &Tensor,
    k: &Tensor,
    scale: f32,
    mask: Option<&AttentionMask>,
) -> TensorResult<Vec<f32>> {
    let (qd, kd) = (q.dims(), k.dims());
    if qd.len() != 4 || kd.len() != 4 || qd[0] != kd[0] || qd[3] != kd[3] || qd[2] % kd[2] != 0 {
        return Err(TensorError::ShapeMismatch {
            lhs: qd.to_vec(),
            rhs: kd.to_vec(),
        });
    }
    let (batch, t, nh, hs) = (qd[0], qd[1], qd[2], qd[3]);
    let (s, groups) = (kd[1], kd[2]);
    if let Some(m) = mask {
        if m.dims() != (t, s) {
            return Err(TensorError::ShapeMismatch {
                lhs: vec![t, s],
                rhs: vec![m.dims().0, m.dims().1],
            });
        }
    }
    let q_per_kv = nh / groups;

    let mut weights = vec![0.0f32; batch * nh * t * s];
    for b in 0..batch {
        for h in 0..nh {
            let g = h / q_per_kv;
            let q_off = (b * t * nh + h) * hs;
            let k_off = (b * s * groups + g) * hs;
            let w = &mut weights[(b * nh + h) * t * s..(b * nh + h + 1) * t * s];
            sgemm_raw(
                false,
                true,
                t,
                s,
                hs,
                scale,
                &q.data()[q_off..],
                nh * hs,
                &k.data()[k_off..],
                groups * hs,
                0.0,
                w,
                s,
            );
            for i in 0..t {
                for j in 0..s {
                    let bias = match mask {
                        Some(m) => m.bias(i, j),
                        None if j > i => f32::NEG_INFINITY,
                        None => 0.0,
                    };
                    let x = &mut w[i * s + j];
                    *x = (*x + bias).max(0.0);
                }
            }
        }
    }
    Ok(weights)
}

/// y [batch, T, n_head, hs] = W @ v per head, v [batch, S, groups, hs].
pub fn weighted_values(weights: &[f32], v: &Tensor, n_head: usize, t: usize) -> Tensor {
    let vd = v.dims();
    let (batch, s, groups, hs) = (vd[0], vd[1], vd[2], vd[3]);
    let q_per_kv = n_head / groups;
    let mut y = vec![0.0f32; batch * t * n_head * hs];
    for b in 0..batch {
        for h in 0..n_head {
            let g = h / q_per_kv;
            let w_off = (b * n_head + h) * t * s;
            let y_off = (b * t * n_head + h) * hs;
            let v_off = (b * s * groups + g) * hs;
            sgemm_raw(
                false,
                false,
                t,
                hs,
                s,
                1.0,
                &weights[w_off..w_off + t * s],
                s,
                &v.data()[v_off..],
                groups * hs,
                0.0,
                &mut y[y_off..],
                n_head * hs,
            );
        }
    }
    Tensor::from_vec(y, Shape::new(&[batch, t, n_head, hs]))
}

/// Attention without dropout: weights then weighted values.
pub fn relu_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f32,
    mask: Option<&AttentionMask>,
) -> TensorResult<Tensor> {
    let weights = attention_weights(q, k, scale, mask)?;
    Ok(weighted_values(&weights, v, q.dims()[2], q.dims()[1]))
}

/// Activations saved by a full-sequence forward for backward.
struct SavedAttention {
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    weights: Vec<f32>,
    /// Per-weight dropout multiplier (0 or 1/(1-p)); None when dropout is off.
    keep: Option<Vec<f32>>,
    rope: RopeCache,
    batch: usize,
    seq: usize,
}

pub struct CausalSelfAttention {
    pub attn: Linear,
    pub encoder_input: Activation,
    pub encoder_k: Activation,
    pub encoder_q: Activation,
    pub encoder_output: Activation,
    pub proj: NormedLinear,
    n_head: usize,
    n_query_groups: usize,
    head_size: usize,
    /// Attention-weight dropout probability, kept at 0.
    pub(crate) dropout_p: f32,
    rng: StdRng,
    saved: Option<SavedAttention>,
    inference_mode: bool,
}

impl CausalSelfAttention {
    pub fn new(config: &Config) -> Self {
        Self {
            attn: Linear::new(config.n_embd, config.qkv_width(), config.bias),
            encoder_input: Activation::new(config.activation, config.n_embd),
            encoder_k: Activation::new(config.activation, config.head_size),
            encoder_q: Activation::new(config.activation, config.head_size),
            encoder_output: Activation::new(config.activation, config.n_embd),
            proj: NormedLinear::new(config.n_embd, config.n_embd, config.bias),
            n_head: config.n_head,
            n_query_groups: config.n_query_groups,
            head_size: config.head_size,
            dropout_p: 0.0,
            rng: StdRng::seed_from_u64(0),
            saved: None,
            inference_mode: false,
        }
    }

    pub fn scale(&self) -> f32 {
        1.0 / self.head_size as f32
    }

    fn q_per_kv(&self) -> usize {
        self.n_head / self.n_query_groups
    }

    pub fn init_weights(&mut self, std: f32, proj_std: f32, rng: &mut StdRng) {
        self.attn.init_normal(std, rng);
        self.proj.init_normal(std, rng);
        self.proj.weight.normal_(0.0, proj_std, rng);
        for act in self.activations_mut() {
            act.reset();
        }
    }

    pub fn activations_mut(&mut self) -> [&mut Activation; 4] {
        [
            &mut self.encoder_input,
            &mut self.encoder_k,
            &mut self.encoder_q,
            &mut self.encoder_output,
        ]
    }

    /// [B, T, G * (q_per_kv + 2) * hs] -> q [B, T, n_head, hs], k, v [B, T, G, hs]
    fn split_qkv(&self, qkv: &Tensor, batch: usize, seq: usize) -> (Tensor, Tensor, Tensor) {
        let (g, qpk, hs) = (self.n_query_groups, self.q_per_kv(), self.head_size);
        let mut q = Vec::with_capacity(batch * seq * self.n_head * hs);
        let mut k = Vec::with_capacity(batch * seq * g * hs);
        let mut v = Vec::with_capacity(batch * seq * g * hs);
        for group in qkv.data().chunks_exact((qpk + 2) * hs) {
            q.extend_from_slice(&group[..qpk * hs]);
            k.extend_from_slice(&group[qpk * hs..(qpk + 1) * hs]);
            v.extend_from_slice(&group[(qpk + 1) * hs..]);
        }
        (
            Tensor::from_vec(q, Shape::new(&[batch, seq, self.n_head, hs])),
            Tensor::from_vec(k, Shape::new(&[batch, seq, g, hs])),
            Tensor::from_vec(v, Shape::new(&[batch, seq, g, hs])),
        )
    }

    /// Inverse of `split_qkv`, for gradients.
    fn merge_qkv(&self, dq: &[f32], dk: &[f32], dv: &[f32], batch: usize, seq: usize) -> Tensor {
        let (qpk, hs) = (self.q_per_kv(), self.head_size);
        let mut out = Vec::with_capacity(batch * seq * self.n_query_groups * (qpk + 2) * hs);
        for ((q, k), v) in dq
            .chunks_exact(qpk * hs)
            .zip(dk.chunks_exact(hs))
            .zip(dv.chunks_exact(hs))
        {
            out.extend_from_slice(q);
            out.extend_from_slice(k);
            out.extend_from_slice(v);
        }
        let width = out.len() / (batch * seq).max(1);
        Tensor::from_vec(out, Shape::new(&[batch, seq, width]))
    }

    fn dropout_keep(&mut self, len: usize) -> Option<Vec<f32>> {
        if self.dropout_p <= 0.0 || self.inference_mode {
            return None;
        }
        let keep_prob = 1.0 - self.dropout_p;
        let scale = 1.0 / keep_prob;
        Some(
            (0..len)
                .map(|_| if self.rng.gen::<f32>() < keep_prob { scale } else { 0.0 })
                .collect(),
        )
    }

    /// `rope` holds the rows for the T positions of `x` [B, T, C]. With a cache,
    /// k/v are written at `input_pos` (0..T when absent) and attention runs over
    /// every cache slot.
    pub fn forward(
        &mut self,
        x: &Tensor,
        rope: &RopeCache,
        max_seq_length: usize,
        mask: Option<&AttentionMask>,
        input_pos: Option<&[usize]>,
        kv_cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let (batch, seq, c) = x.try_dims_3d()?;

        let x_act = self.encoder_input.forward(x);
        let qkv = self.attn.forward(&x_act);
        let (q, k, v) = self.split_qkv(&qkv, batch, seq);
        let q = self.encoder_q.forward(&apply_rope(&q, rope)?);
        let k = self.encoder_k.forward(&apply_rope(&k, rope)?);

        let cached = match kv_cache {
            Some(cache) => {
                if cache.capacity() != max_seq_length {
                    return Err(ModelError::CacheLengthMismatch {
                        capacity: cache.capacity(),
                        max_seq_length,
                    });
                }
                let default_pos: Vec<usize>;
                let positions = match input_pos {
                    Some(p) => p,
                    None => {
                        default_pos = (0..seq).collect();
                        &default_pos
                    }
                };
                cache.write_at(positions, &k, &v)?;
                Some((cache.k.clone(), cache.v.clone()))
            }
            None => None,
        };
        let (keys, values) = match &cached {
            Some((ck, cv)) => (ck, cv),
            None => (&k, &v),
        };

        let weights = attention_weights(&q, keys, self.scale(), mask)?;
        let keep = self.dropout_keep(weights.len());
        let y = match &keep {
            Some(keep) => {
                let dropped: Vec<f32> = weights.iter().zip(keep).map(|(w, m)| w * m).collect();
                weighted_values(&dropped, values, self.n_head, seq)
            }
            None => weighted_values(&weights, values, self.n_head, seq),
        };

        let y = self.encoder_output.forward(&y.reshape_move(Shape::new(&[batch, seq, c])));
        let out = self.proj.forward(&y);

        self.saved = if cached.is_none() && !self.inference_mode {
            Some(SavedAttention {
                q: q.into_data(),
                k: k.into_data(),
                v: v.into_data(),
                weights,
                keep,
                rope: rope.clone(),
                batch,
                seq,
            })
        } else {
            None
        };
        Ok(out)
    }

    /// Backward through a full-sequence forward:
    ///   dy            = act_out'(proj'(grad))
    ///   dV_g         += W_h^T @ dy_h                  (summed over the group's heads)
    ///   dW_h          = dy_h @ V_g^T, masked by dropout and ReLU
    ///   dQ_h          = dW_h @ K_g / hs
    ///   dK_g         += dW_h^T @ Q_h / hs
    ///   dq, dk        through the q/k activations and the inverse rotation
    ///   dx            = act_in'(W_attn'(merge(dq, dk, dv)))
    pub fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let Some(saved) = self.saved.take() else {
            return Err(ModelError::BackwardUnavailable);
        };
        let (batch, t) = (saved.batch, saved.seq);
        let s = t;
        let (nh, g, hs) = (self.n_head, self.n_query_groups, self.head_size);
        let qpk = self.q_per_kv();
        let scale = self.scale();

        let dy = self.proj.backward(grad_output);
        let dy = self.encoder_output.backward(&dy);
        let dy = dy.data();

        let mut dq = vec![0.0f32; batch * t * nh * hs];
        let mut dk = vec![0.0f32; batch * s * g * hs];
        let mut dv = vec![0.0f32; batch * s * g * hs];
        let mut dw = vec![0.0f32; t * s];
        let mut used = vec![0.0f32; t * s];

        for b in 0..batch {
            for h in 0..nh {
                let grp = h / qpk;
                let w_off = (b * nh + h) * t * s;
                let w = &saved.weights[w_off..w_off + t * s];
                let keep = saved.keep.as_ref().map(|k| &k[w_off..w_off + t * s]);
                let y_off = (b * t * nh + h) * hs;
                let kv_off = (b * s * g + grp) * hs;

                match keep {
                    Some(keep) => {
                        for ((u, &wi), &m) in used.iter_mut().zip(w).zip(keep) {
                            *u = wi * m;
                        }
                    }
                    None => used.copy_from_slice(w),
                }

                // dV_g += W^T @ dy_h
                sgemm_raw(
                    true, false, s, hs, t, 1.0, &used, s, &dy[y_off..], nh * hs, 1.0,
                    &mut dv[kv_off..], g * hs,
                );
                // dW = dy_h @ V_g^T
                sgemm_raw(
                    false, true, t, s, hs, 1.0, &dy[y_off..], nh * hs, &saved.v[kv_off..], g * hs,
                    0.0, &mut dw, s,
                );
                for (i, d) in dw.iter_mut().enumerate() {
                    if let Some(keep) = keep {
                        *d *= keep[i];
                    }
                    if w[i] <= 0.0 {
                        *d = 0.0;
                    }
                }
                // dQ_h = dW @ K_g * scale
                sgemm_raw(
                    false, false, t, hs, s, scale, &dw, s, &saved.k[kv_off..], g * hs, 0.0,
                    &mut dq[y_off..], nh * hs,
                );
                // dK_g += dW^T @ Q_h * scale
                sgemm_raw(
                    true, false, s, hs, t, scale, &dw, s, &saved.q[y_off..], nh * hs, 1.0,
                    &mut dk[kv_off..], g * hs,
                );
            }
        }

        let dq = self
            .encoder_q
            .backward(&Tensor::from_vec(dq, Shape::new(&[batch, t, nh, hs])));
        let dq = apply_rope_backward(&dq, &saved.rope)?;
        let dk = self
            .encoder_k
            .backward(&Tensor::from_vec(dk, Shape::new(&[batch, s, g, hs])));
        let dk = apply_rope_backward(&dk, &saved.rope)?;

        let dqkv = self.merge_qkv(dq.data(), dk.data(), &dv, batch, t);
        let dx = self.attn.backward(&dqkv);
        Ok(self.encoder_input.backward(&dx))
    }

    pub fn set_inference_mode(&mut self, mode: bool) {
        self.inference_mode = mode;
        self.attn.set_inference_mode(mode);
        self.proj.set_inference_mode(mode);
        for act in self.activations_mut() {
            act.set_inference_mode(mode);
        }
        if mode {
            self.saved = None;
        }
    }
}

impl Parameters for CausalSelfAttention {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        collect_named_params!(prefix;
            "attn" => self.attn,
            "encoder_input" => self.encoder_input,
            "encoder_k" => self.encoder_k,
            "encoder_q" => self.encoder_q,
            "encoder_output" => self.encoder_output,
            "proj" => self.proj,
        )
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        collect_named_params_mut!(prefix;
            "attn" => self.attn,
            "encoder_input" => self.encoder_input,
            "encoder_k" => self.encoder_k,
            "encoder_q" => self.encoder_q,
            "encoder_output" => self.encoder_output,
            "proj" => self.proj,
        )
    }
}
