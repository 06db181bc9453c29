use crate::config::T5Config;
use crate::error::Result;
use crate::nn::gated_linear::{ForwardMode, GatedProjection};
use crate::nn::Seq2SeqEngine;
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A plain `x W` projection that ignores gates.
pub struct FixedProjection {
    pub weight: Tensor,
}

impl FixedProjection {
    pub fn filled(fan_in: usize, fan_out: usize, value: f32) -> Box<dyn GatedProjection> {
        Box::new(FixedProjection {
            weight: Tensor::new(ArrayD::from_elem(IxDyn(&[fan_in, fan_out]), value), true),
        })
    }

    pub fn identity(n: usize) -> Box<dyn GatedProjection> {
        let w = ndarray::Array2::<f32>::eye(n).into_dyn();
        Box::new(FixedProjection {
            weight: Tensor::new(w, true),
        })
    }
}

impl GatedProjection for FixedProjection {
    fn forward(
        &self,
        input: &Tensor,
        _gate: Option<&Tensor>,
        _mask: Option<&Tensor>,
        _mode: ForwardMode,
    ) -> Result<Tensor> {
        input.linear(&self.weight)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone()]
    }
}

pub fn random_tensor(shape: &[usize], seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-1.0f32..1.0));
    Tensor::new(data, false)
}

pub fn tiny_engine(seed: u64) -> Seq2SeqEngine {
    let mut rng = StdRng::seed_from_u64(seed);
    Seq2SeqEngine::new(T5Config::tiny(10), &mut rng).expect("tiny engine")
}

pub fn assert_close(a: &ArrayD<f32>, b: &ArrayD<f32>, tol: f32) {
    assert_eq!(a.shape(), b.shape(), "shape mismatch");
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= tol, "{} vs {} (tol {})", x, y, tol);
    }
}

pub fn softmax(v: &[f32]) -> Vec<f32> {
    let max = v.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = v.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}
