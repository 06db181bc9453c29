use crate::dtype::DType;
use crate::error::Result;
use crate::nn::gated_linear::{ForwardMode, GatedProjection};
use crate::nn::gates::{AttentionGates, ProjectionGates};
use crate::nn::kv_cache::KvPair;
use crate::nn::relative_bias::RelativePositionBias;
use crate::nn::{Module, RunContext, T5LayerNorm};
use crate::tensor::Tensor;

/// Dropout sites inside one attention sublayer.
const SITE_WEIGHTS: u64 = 0;
const SITE_OUTPUT: u64 = 1;

/// Multi-head attention with relative position bias, usable as self- or
/// cross-attention.
///
/// Scores are the raw `q . k` products with no `1 / sqrt(d_kv)` factor; the
/// relative position tables are trained against unscaled scores.
pub struct Attention {
    pub q: Box<dyn GatedProjection>,
    pub k: Box<dyn GatedProjection>,
    pub v: Box<dyn GatedProjection>,
    pub o: Box<dyn GatedProjection>,
    /// Present only on the self-attention of layer 0.
    pub relative_bias: Option<RelativePositionBias>,
    pub num_heads: usize,
    pub d_kv: usize,
    pub is_decoder: bool,
}

pub struct AttentionInput<'a> {
    pub hidden_states: &'a Tensor,
    /// Encoder states for cross-attention; `None` means self-attention.
    pub key_value_states: Option<&'a Tensor>,
    pub mask: Option<&'a Tensor>,
    /// Bias shared from an earlier layer; already includes `mask`.
    pub position_bias: Option<&'a Tensor>,
    pub past: Option<&'a KvPair>,
    /// `(heads,)` multiplier on the attention weights.
    pub layer_head_mask: Option<&'a Tensor>,
    /// Overrides the cached length when recovering the true query position
    /// for cross-attention after the self-attention cache has grown.
    pub query_length: Option<usize>,
    pub use_cache: bool,
    pub output_attentions: bool,
    pub gates: &'a AttentionGates,
    pub mode: ForwardMode,
}

pub struct AttentionOutput {
    pub hidden_states: Tensor,
    pub present: Option<KvPair>,
    /// Bias actually added to the scores, mask included.
    pub position_bias: Tensor,
    pub weights: Option<Tensor>,
}

impl Attention {
    fn inner_dim(&self) -> usize {
        self.num_heads * self.d_kv
    }

    // (batch, seq, inner) -> (batch, heads, seq, d_kv)
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.shape();
        x.reshape(vec![s[0], s[1], self.num_heads, self.d_kv])?
            .permute(vec![0, 2, 1, 3])
    }

    // (batch, heads, seq, d_kv) -> (batch, seq, inner)
    fn merge_heads(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.shape();
        x.permute(vec![0, 2, 1, 3])?
            .reshape(vec![s[0], s[2], self.inner_dim()])
    }

    fn project(
        &self,
        proj: &dyn GatedProjection,
        x: &Tensor,
        gates: &ProjectionGates,
        mode: ForwardMode,
    ) -> Result<Tensor> {
        let y = proj.forward(x, gates.gate.as_ref(), gates.mask.as_ref(), mode)?;
        self.split_heads(&y)
    }

    /// Bias for `real_len` query positions against `key_len` keys, restricted
    /// to the last `seq_len` queries. Zero when this layer owns no table.
    pub fn compute_position_bias(
        &self,
        real_len: usize,
        key_len: usize,
        seq_len: usize,
        like: &Tensor,
    ) -> Result<Tensor> {
        let bias = match &self.relative_bias {
            Some(rb) => rb.compute_bias(real_len, key_len)?,
            None => Tensor::zeros(&[1, self.num_heads, real_len, key_len]),
        };
        let bias = if real_len > seq_len {
            bias.narrow(2, real_len - seq_len, seq_len)?
        } else {
            bias
        };
        Ok(bias.with_placement(like.dtype(), like.device()))
    }

    pub fn forward(&self, input: AttentionInput<'_>, ctx: &RunContext) -> Result<AttentionOutput> {
        let hidden = input.hidden_states;
        let seq_len = hidden.shape()[1];
        let past_len = match input.past {
            Some(past) => input.query_length.unwrap_or_else(|| past.seq_len()),
            None => 0,
        };
        let real_len = seq_len + past_len;

        let query = self.project(self.q.as_ref(), hidden, &input.gates.q, input.mode)?;

        let (key, value) = match (input.key_value_states, input.past) {
            (None, past) => {
                let k = self.project(self.k.as_ref(), hidden, &input.gates.k, input.mode)?;
                let v = self.project(self.v.as_ref(), hidden, &input.gates.v, input.mode)?;
                match past {
                    Some(p) => {
                        let grown = p.append(&k, &v)?;
                        (grown.key, grown.value)
                    }
                    None => (k, v),
                }
            }
            // Cross-attention keys and values are frozen once cached.
            (Some(_), Some(p)) => (p.key.clone(), p.value.clone()),
            (Some(kv), None) => (
                self.project(self.k.as_ref(), kv, &input.gates.k, input.mode)?,
                self.project(self.v.as_ref(), kv, &input.gates.v, input.mode)?,
            ),
        };
        let key_len = key.shape()[2];

        let scores = query.batched_matmul(&key.transpose_last()?)?;

        let position_bias = match input.position_bias {
            Some(shared) => shared.clone(),
            None => {
                let bias = self.compute_position_bias(real_len, key_len, seq_len, &scores)?;
                match input.mask {
                    Some(mask) => bias.add(mask),
                    None => bias,
                }
            }
        };

        let scores = scores.add(&position_bias);
        let score_dtype = scores.dtype();
        let mut weights = scores.astype(DType::F32).softmax(3).astype(score_dtype);
        weights = ctx.dropout(&weights, SITE_WEIGHTS);
        if let Some(head_mask) = input.layer_head_mask {
            weights = weights.mul(&head_mask.reshape(vec![1, self.num_heads, 1, 1])?);
        }

        let context = self.merge_heads(&weights.batched_matmul(&value)?)?;
        let gates = &input.gates.o;
        let output = self
            .o
            .forward(&context, gates.gate.as_ref(), gates.mask.as_ref(), input.mode)?;

        let present = if self.is_decoder && input.use_cache {
            Some(KvPair::new(key, value))
        } else {
            None
        };

        Ok(AttentionOutput {
            hidden_states: output,
            present,
            position_bias,
            weights: if input.output_attentions {
                Some(weights)
            } else {
                None
            },
        })
    }
}

impl Module for Attention {
    fn parameters(&self) -> Vec<Tensor> {
        let mut params = Vec::new();
        for proj in [&self.q, &self.k, &self.v, &self.o] {
            params.extend(proj.parameters());
        }
        if let Some(rb) = &self.relative_bias {
            params.extend(rb.parameters());
        }
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        for (name, proj) in [("q", &self.q), ("k", &self.k), ("v", &self.v), ("o", &self.o)] {
            out.extend(proj.named_parameters(&format!("{}{}.", prefix, name)));
        }
        if let Some(rb) = &self.relative_bias {
            out.extend(rb.named_parameters(prefix));
        }
        out
    }
}

/// Pre-norm residual wrapper: `x + dropout(attention(layer_norm(x)))`.
pub struct AttentionSublayer {
    pub layer_norm: T5LayerNorm,
    pub attention: Attention,
}

impl AttentionSublayer {
    pub fn forward(&self, input: AttentionInput<'_>, ctx: &RunContext) -> Result<AttentionOutput> {
        let residual = input.hidden_states.clone();
        let normed = self.layer_norm.forward(&residual);
        let out = self.attention.forward(
            AttentionInput {
                hidden_states: &normed,
                ..input
            },
            ctx,
        )?;
        let hidden = residual.add(&ctx.dropout(&out.hidden_states, SITE_OUTPUT));
        Ok(AttentionOutput {
            hidden_states: hidden,
            ..out
        })
    }
}

impl Module for AttentionSublayer {
    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.attention.parameters();
        params.extend(self.layer_norm.parameters());
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = self.attention.named_parameters(&format!("{}attention.", prefix));
        out.extend(self.layer_norm.named_parameters(&format!("{}layer_norm.", prefix)));
        out
    }
}
