// SPDX-License-Identifier: CC-BY-NC-SA-4.0
// Copyright (c) 2025-2026 fumi-engineer

//! Feed-forward blocks.
//!
//! Spiking:  y = proj(act2(fc(act1(x))))     fc: C -> I, proj: NormedLinear I -> C
//! Gated:    y = w3(silu(w1 x) * (w2 x))     see [`SwiGLU`]

use rand::rngs::StdRng;

use crate::activation::Activation;
use crate::config::{Config, MlpClass};
use crate::layers::{
    collect_named_params, collect_named_params_mut, join_name, Layer, Linear, NormedLinear, Parameters,
    SwiGLU,
};
use crate::tensor::Tensor;

pub struct SpikingMlp {
    pub fc: Linear,
    pub act2: Activation,
    pub act1: Activation,
    pub proj: NormedLinear,
}

impl SpikingMlp {
    pub fn new(config: &Config) -> Self {
        Self {
            fc: Linear::new(config.n_embd, config.intermediate_size, config.bias),
            act2: Activation::new(config.activation, config.intermediate_size),
            act1: Activation::new(config.activation, config.n_embd),
            proj: NormedLinear::new(config.intermediate_size, config.n_embd, config.bias),
        }
    }
}

impl Layer for SpikingMlp {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let x = self.act1.forward(input);
        let x = self.fc.forward(&x);
        let x = self.act2.forward(&x);
        self.proj.forward(&x)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let g = self.proj.backward(grad_output);
        let g = self.act2.backward(&g);
        let g = self.fc.backward(&g);
        self.act1.backward(&g)
    }

    fn set_inference_mode(&mut self, mode: bool) {
        self.fc.set_inference_mode(mode);
        self.act2.set_inference_mode(mode);
        self.act1.set_inference_mode(mode);
        self.proj.set_inference_mode(mode);
    }
}

impl Parameters for SpikingMlp {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        collect_named_params!(prefix;
            "fc" => self.fc,
            "act2" => self.act2,
            "act1" => self.act1,
            "proj" => self.proj,
        )
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        collect_named_params_mut!(prefix;
            "fc" => self.fc,
            "act2" => self.act2,
            "act1" => self.act1,
            "proj" => self.proj,
        )
    }
}

/// Feed-forward variant selected by `Config::mlp_class`.
pub enum FeedForward {
    Spiking(SpikingMlp),
    /// Checkpoint names live under `swiglu.`.
    Gated(SwiGLU),
}

impl FeedForward {
    pub fn new(config: &Config) -> Self {
        match config.mlp_class {
            MlpClass::Spiking => Self::Spiking(SpikingMlp::new(config)),
            MlpClass::Gated => Self::Gated(SwiGLU::new(config.n_embd, config.intermediate_size, config.bias)),
        }
    }

    /// Every linear weight ~ N(0, std); the output projection is redrawn with
    /// `proj_std`. Activations return to their uninitialized state.
    pub fn init_weights(&mut self, std: f32, proj_std: f32, rng: &mut StdRng) {
        match self {
            Self::Spiking(m) => {
                m.fc.init_normal(std, rng);
                m.proj.init_normal(std, rng);
                m.proj.weight.normal_(0.0, proj_std, rng);
                m.act1.reset();
                m.act2.reset();
            }
            Self::Gated(m) => {
                m.w1.init_normal(std, rng);
                m.w2.init_normal(std, rng);
                m.w3.init_normal(std, rng);
                m.w3.weight.normal_(0.0, proj_std, rng);
            }
        }
    }

    pub fn activations_mut(&mut self) -> Vec<&mut Activation> {
        match self {
            Self::Spiking(m) => vec![&mut m.act2, &mut m.act1],
            Self::Gated(_) => Vec::new(),
        }
    }
}

impl Layer for FeedForward {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        match self {
            Self::Spiking(m) => m.forward(input),
            Self::Gated(m) => m.forward(input),
        }
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        match self {
            Self::Spiking(m) => m.backward(grad_output),
            Self::Gated(m) => m.backward(grad_output),
        }
    }

    fn set_inference_mode(&mut self, mode: bool) {
        match self {
            Self::Spiking(m) => m.set_inference_mode(mode),
            Self::Gated(m) => m.set_inference_mode(mode),
        }
    }
}

impl Parameters for FeedForward {
    fn named_parameters(&self, prefix: &str) -> Vec<(String, &Tensor)> {
        match self {
            Self::Spiking(m) => m.named_parameters(prefix),
            Self::Gated(m) => m.named_parameters(&join_name(prefix, "swiglu")),
        }
    }

    fn named_parameters_mut(&mut self, prefix: &str) -> Vec<(String, &mut Tensor)> {
        match self {
            Self::Spiking(m) => m.named_parameters_mut(prefix),
            Self::Gated(m) => m.named_parameters_mut(&join_name(prefix, "swiglu")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, Shape};
    use rand::SeedableRng;

    #[test]
    fn test_spiking_mlp_shapes_and_names() {
        let config = Config::tiny();
        let mut mlp = FeedForward::new(&config);
        let x = Tensor::randn(Shape::new(&[2, 3, config.n_embd]), DType::F32, 4);
        let y = mlp.forward(&x);
        assert_eq!(y.dims(), x.dims());
        let names: Vec<String> = mlp.named_parameters("mlp").into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "mlp.fc.weight",
                "mlp.fc.bias",
                "mlp.act2.zero_point",
                "mlp.act2.embed_scale",
                "mlp.act1.zero_point",
                "mlp.act1.embed_scale",
                "mlp.proj.weight",
                "mlp.proj.bias",
                "mlp.proj.scale",
            ]
        );
        assert_eq!(mlp.activations_mut().len(), 2);
    }

    #[test]
    fn test_gated_variant_names() {
        let config = Config {
            mlp_class: MlpClass::Gated,
            bias: false,
            ..Config::tiny()
        };
        let mlp = FeedForward::new(&config);
        let names: Vec<String> = mlp.named_parameters("mlp").into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["mlp.swiglu.w1.weight", "mlp.swiglu.w2.weight", "mlp.swiglu.w3.weight"]
        );
    }

    #[test]
    fn test_backward_shapes() {
        for mlp_class in [MlpClass::Spiking, MlpClass::Gated] {
            let config = Config {
                mlp_class,
                ..Config::tiny()
            };
            let mut mlp = FeedForward::new(&config);
            let x = Tensor::randn(Shape::new(&[1, 4, config.n_embd]), DType::F32, 6);
            let y = mlp.forward(&x);
            let dx = mlp.backward(&Tensor::ones(y.shape().clone(), DType::F32));
            assert_eq!(dx.dims(), x.dims());
            assert!(mlp.parameters().iter().all(|p| p.grad().is_some()));
        }
    }

    #[test]
    fn test_init_resets_activations_and_redraws_proj() {
        let config = Config::tiny();
        let mut mlp = FeedForward::new(&config);
        mlp.forward(&Tensor::ones(Shape::new(&[1, 1, config.n_embd]), DType::F32));
        let mut rng = StdRng::seed_from_u64(0);
        mlp.init_weights(0.02, 0.0, &mut rng);
        for act in mlp.activations_mut() {
            assert!(!act.alpha().is_initialized());
        }
        let FeedForward::Spiking(m) = &mlp else {
            panic!("default config builds the spiking variant");
        };
        // proj_std of 0 degenerates to a constant fill
        assert!(m.proj.weight.data().iter().all(|&w| w == 0.0));
        assert!(m.fc.weight.data().iter().any(|&w| w != 0.0));
    }
}
