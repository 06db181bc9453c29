use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Per-layer cache in its flat exchange form: empty (no cache yet), two
/// tensors (self-attention key, value) or four (plus cross-attention key,
/// value). This is what callers carry between incremental decode calls.
pub type LayerPast = Vec<Tensor>;

/// Key/value states of one attention sublayer, each `(batch, heads, len, d_kv)`.
#[derive(Clone, Debug)]
pub struct KvPair {
    pub key: Tensor,
    pub value: Tensor,
}

impl KvPair {
    pub fn new(key: Tensor, value: Tensor) -> Self {
        KvPair { key, value }
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.key.shape().get(2).copied().unwrap_or(0)
    }

    /// Appends new key/value states along the sequence axis.
    pub fn append(&self, new_key: &Tensor, new_value: &Tensor) -> Result<KvPair> {
        let ks = self.key.shape();
        let nk = new_key.shape();
        if ks.len() != 4 || nk.len() != 4 {
            return Err(Error::Shape(format!(
                "cached keys must be (batch, heads, len, d_kv), got {:?} and {:?}",
                ks, nk
            )));
        }
        if ks[0] != nk[0] || ks[1] != nk[1] || ks[3] != nk[3] {
            return Err(Error::Shape(format!(
                "batch, head or d_kv mismatch appending {:?} to cache {:?}",
                nk, ks
            )));
        }
        Ok(KvPair {
            key: Tensor::concat(&[self.key.clone(), new_key.clone()], 2)?,
            value: Tensor::concat(&[self.value.clone(), new_value.clone()], 2)?,
        })
    }
}

/// Typed view of one layer's cache.
#[derive(Clone, Debug)]
pub struct LayerKv {
    pub self_attn: KvPair,
    pub cross_attn: Option<KvPair>,
}

impl LayerKv {
    /// Parses the flat form. `has_cross` says whether the block will run
    /// cross-attention this call, which fixes the expected arity at 4,
    /// otherwise 2.
    pub fn from_states(states: &[Tensor], has_cross: bool) -> Result<LayerKv> {
        let expected = if has_cross { 4 } else { 2 };
        if states.len() != expected {
            return Err(Error::InvalidCacheState {
                expected,
                found: states.len(),
            });
        }
        let self_attn = KvPair::new(states[0].clone(), states[1].clone());
        let cross_attn = if has_cross {
            Some(KvPair::new(states[2].clone(), states[3].clone()))
        } else {
            None
        };
        Ok(LayerKv {
            self_attn,
            cross_attn,
        })
    }

    pub fn to_states(&self) -> LayerPast {
        let mut out = vec![self.self_attn.key.clone(), self.self_attn.value.clone()];
        if let Some(cross) = &self.cross_attn {
            out.push(cross.key.clone());
            out.push(cross.value.clone());
        }
        out
    }

    pub fn past_len(&self) -> usize {
        self.self_attn.seq_len()
    }
}

/// Seen length of a whole-stack cache, read from the first layer.
pub fn past_length(past: &[LayerPast]) -> usize {
    past.first()
        .and_then(|layer| layer.first())
        .and_then(|k| k.shape().get(2).copied())
        .unwrap_or(0)
}
