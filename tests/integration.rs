// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

use quant_gpt::{
    relu_attention, ActivationKind, CausalSelfAttention, Config, DType, Device, KvCache, Layer,
    MaskCache, MlpClass, ModelError, Parameters, QuantGpt, RopeCache, SamplingStrategy, Shape,
    Tensor,
};

fn tokens(n: usize, salt: usize) -> Vec<usize> {
    (0..n).map(|i| (i * 13 + salt) % 100).collect()
}

fn max_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

// --- config ---

#[test]
fn test_config_presets_and_json() {
    let config = Config::from_name("tiny-llama-1.1b").unwrap();
    assert_eq!(config.n_layer, 22);
    assert_eq!(config.q_per_kv(), 8);

    let config = Config::from_json_str(r#"{"name":"json","n_layer":1}"#).unwrap();
    assert_eq!(config.n_layer, 1);
    QuantGpt::new(config).unwrap();
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = Config {
        n_embd: 30,
        ..Config::tiny()
    };
    assert!(matches!(QuantGpt::new(config), Err(ModelError::InvalidConfig(_))));
}

// --- model ---

#[test]
fn test_model_creation() {
    let model = QuantGpt::from_name("tiny").unwrap();
    assert_eq!(model.config().n_embd, 32);
    assert_eq!(model.num_layers(), 2);
    assert_eq!(model.device(), Device::Cpu);
    assert!(model.num_parameters() > 0);
}

#[test]
fn test_tiny_model_forward() {
    let mut model = QuantGpt::new(Config::tiny()).unwrap();
    let logits = model.forward_ids(&[1, 2, 3, 4], 1, 4).unwrap();
    assert_eq!(logits.shape().dims(), &[1, 4, 128]);
    assert!(logits.data().iter().all(|x| x.is_finite()));
}

#[test]
fn test_model_forward_backward() {
    let mut model = QuantGpt::new(Config::tiny()).unwrap();
    let logits = model.forward_ids(&[10, 20, 30, 40], 1, 4).unwrap();
    let grad = Tensor::ones(logits.shape().clone(), DType::F32);
    let input_grad = model.backward(&grad).unwrap();
    assert_eq!(input_grad.shape().dims(), &[1, 4, 32]);
    assert!(model.parameters().iter().all(|p| p.grad().is_some()));

    model.zero_grad();
    assert!(model
        .parameters()
        .iter()
        .all(|p| p.grad().map_or(true, |g| g.data().iter().all(|&x| x == 0.0))));
}

#[test]
fn test_every_layout_runs() {
    let layouts = [
        (MlpClass::Spiking, ActivationKind::Spiking, true, false),
        (MlpClass::Spiking, ActivationKind::Quantized { bits: 4 }, false, false),
        (MlpClass::Gated, ActivationKind::Spiking, true, true),
        (MlpClass::Gated, ActivationKind::Quantized { bits: 2 }, false, false),
    ];
    for (mlp_class, activation, parallel_residual, shared_attention_norm) in layouts {
        let config = Config {
            mlp_class,
            activation,
            parallel_residual,
            shared_attention_norm,
            ..Config::tiny()
        };
        let mut model = QuantGpt::new(config).unwrap();
        let logits = model.forward_ids(&tokens(6, 1), 2, 3).unwrap();
        let dx = model
            .backward(&Tensor::ones(logits.shape().clone(), DType::F32))
            .unwrap();
        assert_eq!(dx.dims(), &[2, 3, 32]);
        let decoded = model.forward(&tokens(1, 2), (1, 1), Some(4), Some(&[0][..])).unwrap();
        assert_eq!(decoded.dims(), &[1, 1, 128]);
    }
}

#[test]
fn test_causality() {
    let mut model = QuantGpt::new(Config::tiny()).unwrap();
    let a = tokens(8, 3);
    let mut b = a.clone();
    for t in &mut b[5..] {
        *t = (*t + 41) % 100;
    }
    let la = model.forward_ids(&a, 1, 8).unwrap();
    let lb = model.forward_ids(&b, 1, 8).unwrap();
    let row = 128;
    assert_eq!(&la.data()[..5 * row], &lb.data()[..5 * row]);
    assert_ne!(&la.data()[5 * row..], &lb.data()[5 * row..]);
}

#[test]
fn test_incremental_decode_matches_full_sequence() {
    let mut model = QuantGpt::new(Config::tiny()).unwrap();
    let ids = tokens(6, 7);
    let full = model.forward_ids(&ids, 1, 6).unwrap();

    model.set_inference_mode(true);
    model.reset_cache();
    let row = 128;
    for (pos, &id) in ids.iter().enumerate() {
        let step = model.forward(&[id], (1, 1), Some(6), Some(&[pos][..])).unwrap();
        let expected = &full.data()[pos * row..(pos + 1) * row];
        assert!(max_diff(step.data(), expected) < 1e-5, "position {pos}");
    }
}

#[test]
fn test_prefill_then_decode_matches_full_sequence() {
    let mut model = QuantGpt::new(Config::small()).unwrap();
    let ids = tokens(10, 5);
    let full = model.forward_ids(&ids, 1, 10).unwrap();
    let row = full.shape().last_dim();

    model.reset_cache();
    let prefill: Vec<usize> = (0..7).collect();
    let head = model.forward(&ids[..7], (1, 7), Some(16), Some(&prefill[..])).unwrap();
    assert!(max_diff(head.data(), &full.data()[..7 * row]) < 1e-4);
    for pos in 7..10 {
        let step = model.forward(&ids[pos..=pos], (1, 1), Some(16), Some(&[pos][..])).unwrap();
        assert!(max_diff(step.data(), &full.data()[pos * row..(pos + 1) * row]) < 1e-4);
    }
}

#[test]
fn test_decode_errors() {
    let mut model = QuantGpt::new(Config::tiny()).unwrap();
    model.forward(&[1], (1, 1), Some(8), Some(&[0][..])).unwrap();
    // caches keep their first size until reset
    assert!(matches!(
        model.forward(&[1], (1, 1), Some(16), Some(&[1][..])),
        Err(ModelError::CacheLengthMismatch { capacity: 8, max_seq_length: 16 })
    ));
    assert!(matches!(
        model.forward(&[1, 2], (1, 2), Some(8), Some(&[8, 9][..])),
        Err(ModelError::CacheOverflow { tokens: 2, capacity: 8 })
    ));
    model.reset_cache();
    model.forward(&[1], (1, 1), Some(16), Some(&[1][..])).unwrap();
}

#[test]
fn test_decode_past_capacity_slides_window() {
    let mut model = QuantGpt::new(Config::tiny()).unwrap();
    model.forward_ids(&tokens(4, 0), 1, 4).unwrap();
    for pos in 0..10 {
        let logits = model.forward(&[pos % 100], (1, 1), Some(4), Some(&[pos][..])).unwrap();
        assert!(logits.data().iter().all(|x| x.is_finite()));
    }
    assert!(model.kv_caches().iter().all(|c| c.capacity() == 4));
}

// --- attention ---

/// One attention layer with its activation thresholds fixed on shared data,
/// switched to inference mode, plus rope and mask tables for `config`.
fn warmed_attention(config: &Config) -> (CausalSelfAttention, RopeCache, MaskCache) {
    let mut attn = CausalSelfAttention::new(config);
    let rope = RopeCache::new(config.block_size, config.rope_n_elem(), DType::F32, 10000.0, 1);
    let masks = MaskCache::new(config.block_size);

    let warm = Tensor::randn(Shape::new(&[1, 4, config.n_embd]), DType::F32, 5);
    attn.forward(&warm, &rope.prefix(4).unwrap(), 4, None, None, None)
        .unwrap();
    attn.set_inference_mode(true);
    (attn, rope, masks)
}

/// Decode `cap + 1` single tokens through one attention layer with a
/// `cap`-slot cache. Only the first input differs between calls.
fn decode_through_eviction(first: f32, cap: usize) -> (Tensor, KvCache) {
    let config = Config::tiny();
    let (mut attn, rope, masks) = warmed_attention(&config);

    let mut cache = KvCache::new(1, cap, config.n_query_groups, config.head_size);
    let mut y = Tensor::zeros(Shape::new(&[1, 1, config.n_embd]), DType::F32);
    for pos in 0..=cap {
        let x = if pos == 0 {
            Tensor::full(Shape::new(&[1, 1, config.n_embd]), first)
        } else {
            Tensor::randn(Shape::new(&[1, 1, config.n_embd]), DType::F32, 100 + pos as u64)
        };
        let p = [pos];
        let mask = masks.rows(&p, cap).unwrap();
        y = attn
            .forward(&x, &rope.select(&p).unwrap(), cap, Some(&mask), Some(&p[..]), Some(&mut cache))
            .unwrap();
    }
    (y, cache)
}

#[test]
fn test_evicted_entry_no_longer_contributes() {
    let (ya, ca) = decode_through_eviction(0.5, 4);
    let (yb, cb) = decode_through_eviction(-3.0, 4);
    assert_eq!(ca.k.data(), cb.k.data());
    assert_eq!(ca.v.data(), cb.v.data());
    assert_eq!(ya.data(), yb.data());
}

#[test]
fn test_evicting_cache_matches_freshly_windowed_cache() {
    let cap = 4;
    let config = Config::tiny();
    let (groups, hs) = (config.n_query_groups, config.head_size);
    let slot = groups * hs;
    let (mut attn, rope, masks) = warmed_attention(&config);

    let inputs: Vec<Tensor> = (0..=cap)
        .map(|pos| Tensor::randn(Shape::new(&[1, 1, config.n_embd]), DType::F32, 200 + pos as u64))
        .collect();
    let mut cache = KvCache::new(1, cap, groups, hs);
    let mut trailing_k = Vec::new();
    let mut trailing_v = Vec::new();
    let mut y = Tensor::zeros(Shape::new(&[1, 1, config.n_embd]), DType::F32);
    for (pos, x) in inputs.iter().enumerate() {
        let p = [pos];
        let mask = masks.rows(&p, cap).unwrap();
        y = attn
            .forward(x, &rope.select(&p).unwrap(), cap, Some(&mask), Some(&p[..]), Some(&mut cache))
            .unwrap();
        if pos == cap - 1 {
            // roped entries for positions 1..cap, before anything is evicted
            trailing_k.extend_from_slice(&cache.k.data()[slot..]);
            trailing_v.extend_from_slice(&cache.v.data()[slot..]);
        }
    }

    // reference: the trailing window sits in slots 0..cap-1 of a fresh cache,
    // and the last token goes into the final slot without any eviction
    let n = cap - 1;
    let window: Vec<usize> = (0..n).collect();
    let mut windowed = KvCache::new(1, cap, groups, hs)
        .written_at(
            &window,
            &Tensor::from_vec(trailing_k, Shape::new(&[1, n, groups, hs])),
            &Tensor::from_vec(trailing_v, Shape::new(&[1, n, groups, hs])),
        )
        .unwrap();
    let (mut reference, _, _) = warmed_attention(&config);
    let last = [cap - 1];
    let y_ref = reference
        .forward(
            &inputs[cap],
            &rope.select(&[cap]).unwrap(),
            cap,
            Some(&masks.rows(&last, cap).unwrap()),
            Some(&last[..]),
            Some(&mut windowed),
        )
        .unwrap();

    assert_eq!(windowed.k.data(), cache.k.data());
    assert_eq!(windowed.v.data(), cache.v.data());
    assert_eq!(y_ref.data(), y.data());
}

#[test]
fn test_gqa_extremes_match_expanded_heads() {
    let q = Tensor::randn(Shape::new(&[1, 5, 4, 8]), DType::F32, 1);

    // n_query_groups == n_head: one key/value head per query head
    let k = Tensor::randn(Shape::new(&[1, 5, 4, 8]), DType::F32, 2);
    let v = Tensor::randn(Shape::new(&[1, 5, 4, 8]), DType::F32, 3);
    let mha = relu_attention(&q, &k, &v, 0.125, None).unwrap();
    assert_eq!(mha.dims(), &[1, 5, 4, 8]);
    // per-head reference: y[i, h] = sum_{j <= i} relu(q[i, h] . k[j, h] * scale) v[j, h]
    fn at(t: &Tensor, pos: usize, head: usize) -> &[f32] {
        &t.data()[(pos * 4 + head) * 8..(pos * 4 + head + 1) * 8]
    }
    let mut expected = vec![0.0f32; 5 * 4 * 8];
    for h in 0..4 {
        for i in 0..5 {
            let out = &mut expected[(i * 4 + h) * 8..(i * 4 + h + 1) * 8];
            for j in 0..=i {
                let score: f32 = at(&q, i, h).iter().zip(at(&k, j, h)).map(|(a, b)| a * b).sum();
                let w = (score * 0.125).max(0.0);
                for (o, &x) in out.iter_mut().zip(at(&v, j, h)) {
                    *o += w * x;
                }
            }
        }
    }
    assert!(max_diff(mha.data(), &expected) < 1e-5);

    // n_query_groups == 1: the single head is broadcast
    let k1 = Tensor::randn(Shape::new(&[1, 5, 1, 8]), DType::F32, 4);
    let v1 = Tensor::randn(Shape::new(&[1, 5, 1, 8]), DType::F32, 5);
    let expand = |t: &Tensor| {
        let mut out = Vec::new();
        for head in t.data().chunks_exact(8) {
            for _ in 0..4 {
                out.extend_from_slice(head);
            }
        }
        Tensor::from_vec(out, Shape::new(&[1, 5, 4, 8]))
    };
    let mqa = relu_attention(&q, &k1, &v1, 0.125, None).unwrap();
    let expanded = relu_attention(&q, &expand(&k1), &expand(&v1), 0.125, None).unwrap();
    assert_eq!(mqa.data(), expanded.data());

    for n_query_groups in [1, 4] {
        let config = Config {
            n_query_groups,
            ..Config::tiny()
        };
        let mut model = QuantGpt::new(config).unwrap();
        assert_eq!(model.forward_ids(&tokens(3, 0), 1, 3).unwrap().dims(), &[1, 3, 128]);
    }
}

// --- checkpoints ---

#[test]
fn test_state_dict_exchange() {
    let mut a = QuantGpt::with_seed(Config::tiny(), 10).unwrap();
    a.forward_ids(&tokens(5, 2), 1, 5).unwrap();
    let state = a.state_dict();
    assert!(state.contains_key("transformer.h.1.attn.encoder_output.zero_point"));
    assert!(state.contains_key("lm_head.weight"));
    assert_eq!(state.len(), a.named_parameters().len());

    let mut b = QuantGpt::with_seed(Config::tiny(), 20).unwrap();
    b.load_state_dict(&state).unwrap();
    let ids = tokens(5, 9);
    assert_eq!(
        a.forward_ids(&ids, 1, 5).unwrap().data(),
        b.forward_ids(&ids, 1, 5).unwrap().data()
    );
}

#[test]
fn test_gated_checkpoint_names() {
    let config = Config {
        mlp_class: MlpClass::Gated,
        ..Config::tiny()
    };
    let model = QuantGpt::new(config).unwrap();
    let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
    assert!(names.contains(&"transformer.h.0.mlp.swiglu.w3.weight".to_string()));
    assert!(!names.iter().any(|n| n.contains("mlp.act1")));
}

// --- generation ---

#[test]
fn test_generation_interfaces() {
    let mut model = QuantGpt::new(Config::tiny()).unwrap();
    let prompt = vec![1, 2, 3];

    assert_eq!(model.generate_greedy(&prompt, 8).unwrap().len(), 8);
    assert_eq!(model.generate_sample(&prompt, 8, 1.0, 42).unwrap().len(), 8);
    assert_eq!(model.generate_top_k(&prompt, 8, 10, 1.0, 42).unwrap().len(), 8);
    assert_eq!(model.generate_top_p(&prompt, 8, 0.9, 1.0, 42).unwrap().len(), 8);

    let out = quant_gpt::generate(&mut model, &prompt, 6, &SamplingStrategy::Greedy, 0).unwrap();
    assert_eq!(out, model.generate_greedy(&prompt, 6).unwrap());
}

// --- layers ---

#[test]
fn test_layer_trait_objects() {
    let config = Config::tiny();
    let mut layers: Vec<Box<dyn Layer>> = vec![
        Box::new(quant_gpt::Linear::new(32, 32, true)),
        Box::new(quant_gpt::NormedLinear::new(32, 32, false)),
        Box::new(quant_gpt::Activation::new(config.activation, 32)),
        Box::new(quant_gpt::SwiGLU::new(32, 64, false)),
    ];
    let mut x = Tensor::randn(Shape::new(&[2, 32]), DType::F32, 8);
    for layer in &mut layers {
        x = layer.forward(&x);
        assert_eq!(x.dims(), &[2, 32]);
        assert!(!layer.parameters().is_empty());
    }
}
