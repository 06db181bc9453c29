use crate::dtype::DType;
use crate::error::Result;
use crate::tensor::Tensor;
use ndarray::{Array2, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::Rng;

pub mod attention;
pub mod block;
pub mod checkpoint;
pub mod feed_forward;
pub mod gated_linear;
pub mod gates;
pub mod kv_cache;
pub mod mask;
pub mod optim;
pub mod relative_bias;
pub mod seq2seq;
pub mod stack;

pub use attention::{Attention, AttentionInput, AttentionOutput};
pub use block::{Block, BlockInput, LayerOutput};
pub use feed_forward::FeedForward;
pub use gated_linear::{
    ForwardMode, GatedLinear, GatedProjection, ProjectionFactory, ProjectionKind, ProjectionSite,
};
pub use gates::{GateBundle, LayerGates};
pub use kv_cache::{KvPair, LayerKv, LayerPast};
pub use optim::{Adam, Optimizer, SGD};
pub use relative_bias::RelativePositionBias;
pub use seq2seq::{Seq2SeqEngine, Seq2SeqInput, Seq2SeqOutput};
pub use stack::{Stack, StackInput, StackOutput};

#[cfg(test)]
mod tests;

/// A trait for neural network modules.
pub trait Module {
    /// Returns the parameters of the module.
    fn parameters(&self) -> Vec<Tensor>;

    /// Default: return a vector of (name, Tensor) pairs for module parameters
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("{}param{}", prefix, i), p))
            .collect()
    }
}

/// A trainable leaf with values drawn from `U(-bound, bound)`.
pub fn init_uniform(shape: &[usize], bound: f32, rng: &mut StdRng) -> Tensor {
    let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || {
        if bound > 0.0 {
            rng.gen_range(-bound..bound)
        } else {
            0.0
        }
    });
    Tensor::new(data, true)
}

/// Token embedding table, `(vocab, d_model)`.
pub struct Embedding {
    pub weight: Tensor,
}

impl Embedding {
    pub fn new(vocab_size: usize, d_model: usize, rng: &mut StdRng) -> Self {
        Embedding {
            weight: init_uniform(&[vocab_size, d_model], 1.0, rng),
        }
    }

    /// `(batch, seq)` ids to `(batch, seq, d_model)` embeddings.
    pub fn forward(&self, ids: &Array2<usize>) -> Result<Tensor> {
        let (batch, seq) = ids.dim();
        let flat: Vec<usize> = ids.iter().copied().collect();
        self.weight.embedding(&flat, vec![batch, seq])
    }
}

impl Module for Embedding {
    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone()]
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        vec![(format!("{}weight", prefix), self.weight.clone())]
    }
}

/// Scale-only RMS layer norm used throughout T5.
pub struct T5LayerNorm {
    pub weight: Tensor,
    pub eps: f32,
}

impl T5LayerNorm {
    pub fn new(d_model: usize, eps: f32) -> Self {
        T5LayerNorm {
            weight: Tensor::new(ArrayD::ones(IxDyn(&[d_model])), true),
            eps,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        x.rms_norm(&self.weight, self.eps)
    }
}

impl Module for T5LayerNorm {
    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone()]
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        vec![(format!("{}weight", prefix), self.weight.clone())]
    }
}

/// Plain linear map with an `(in, out)` weight, used for the untied head.
pub struct Linear {
    pub weight: Tensor,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        Linear {
            weight: init_uniform(&[in_features, out_features], bound, rng),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.linear(&self.weight)
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone()]
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        vec![(format!("{}weight", prefix), self.weight.clone())]
    }
}

/// Call-scoped execution settings threaded through every sublayer.
///
/// Dropout masks are derived from `seed` and a fixed site number, never from
/// mutable RNG state, so a block replayed with the same context reproduces
/// its forward pass exactly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunContext {
    pub training: bool,
    pub dropout_rate: f32,
    pub dtype: DType,
    pub seed: u64,
}

impl RunContext {
    pub fn eval(dtype: DType) -> Self {
        RunContext {
            training: false,
            dropout_rate: 0.0,
            dtype,
            seed: 0,
        }
    }

    /// Context for one layer; sites inside different layers never share a mask.
    pub fn for_layer(&self, layer: usize) -> RunContext {
        RunContext {
            seed: mix_seed(self.seed, 0x1000 + layer as u64),
            ..*self
        }
    }

    /// Context for one sublayer of a block.
    pub fn for_sublayer(&self, index: usize) -> RunContext {
        RunContext {
            seed: mix_seed(self.seed, 0x100 + index as u64),
            ..*self
        }
    }

    pub fn dropout(&self, x: &Tensor, site: u64) -> Tensor {
        if !self.training || self.dropout_rate <= 0.0 {
            return x.clone();
        }
        x.dropout(self.dropout_rate, mix_seed(self.seed, site))
    }

    /// Casts to the compute precision.
    pub fn cast(&self, x: &Tensor) -> Tensor {
        x.astype(self.dtype)
    }

    /// Clamps overflow to the largest finite value of a reduced precision,
    /// less a margin of 1000. Identity for f32 or finite inputs.
    pub fn clamp_inf(&self, x: &Tensor) -> Tensor {
        if !self.dtype.is_reduced() || !x.has_inf() {
            return x.clone();
        }
        let limit = self.dtype.max_finite() - 1000.0;
        log::debug!("clamping {} overflow to +/-{}", self.dtype, limit);
        x.clamp(-limit, limit)
    }
}

// splitmix64 finaliser over (seed, site).
pub(crate) fn mix_seed(seed: u64, site: u64) -> u64 {
    let mut z = seed ^ site.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
