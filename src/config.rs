use crate::dtype::DType;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_vocab_size() -> usize {
    32128
}
fn default_d_model() -> usize {
    512
}
fn default_d_kv() -> usize {
    64
}
fn default_d_ff() -> usize {
    2048
}
fn default_num_layers() -> usize {
    6
}
fn default_num_heads() -> usize {
    8
}
fn default_num_buckets() -> usize {
    32
}
fn default_max_distance() -> usize {
    128
}
fn default_dropout() -> f32 {
    0.1
}
fn default_eps() -> f32 {
    1e-6
}
fn default_true() -> bool {
    true
}
fn default_adapter_rank() -> usize {
    8
}

/// Model hyper-parameters, using the field names of the usual T5 JSON config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct T5Config {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_d_kv")]
    pub d_kv: usize,
    #[serde(default = "default_d_ff")]
    pub d_ff: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Decoder depth; falls back to `num_layers` when absent.
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    #[serde(default = "default_dropout")]
    pub dropout_rate: f32,
    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f32,
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub output_attentions: bool,
    #[serde(default)]
    pub output_hidden_states: bool,
    #[serde(default)]
    pub gradient_checkpointing: bool,
    #[serde(default)]
    pub pad_token_id: usize,
    #[serde(default)]
    pub decoder_start_token_id: usize,
    /// Rank of the low-rank adapter inside every gated projection.
    #[serde(default = "default_adapter_rank")]
    pub adapter_rank: usize,
    #[serde(default)]
    pub dtype: DType,
}

impl Default for T5Config {
    fn default() -> Self {
        T5Config {
            vocab_size: default_vocab_size(),
            d_model: default_d_model(),
            d_kv: default_d_kv(),
            d_ff: default_d_ff(),
            num_layers: default_num_layers(),
            num_decoder_layers: None,
            num_heads: default_num_heads(),
            relative_attention_num_buckets: default_num_buckets(),
            relative_attention_max_distance: default_max_distance(),
            dropout_rate: default_dropout(),
            layer_norm_epsilon: default_eps(),
            tie_word_embeddings: true,
            use_cache: true,
            output_attentions: false,
            output_hidden_states: false,
            gradient_checkpointing: false,
            pad_token_id: 0,
            decoder_start_token_id: 0,
            adapter_rank: default_adapter_rank(),
            dtype: DType::F32,
        }
    }
}

impl T5Config {
    /// A tiny configuration for tests and benches.
    pub fn tiny(vocab_size: usize) -> Self {
        T5Config {
            vocab_size,
            d_model: 8,
            d_kv: 4,
            d_ff: 16,
            num_layers: 2,
            num_decoder_layers: Some(2),
            num_heads: 2,
            relative_attention_num_buckets: 8,
            relative_attention_max_distance: 16,
            dropout_rate: 0.0,
            adapter_rank: 2,
            ..T5Config::default()
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: T5Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        T5Config::from_json_str(&text)
    }

    pub fn decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_layers)
    }

    /// Width of the concatenated attention heads.
    pub fn inner_dim(&self) -> usize {
        self.num_heads * self.d_kv
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("vocab_size", self.vocab_size),
            ("d_model", self.d_model),
            ("d_kv", self.d_kv),
            ("d_ff", self.d_ff),
            ("num_layers", self.num_layers),
            ("num_decoder_layers", self.decoder_layers()),
            ("num_heads", self.num_heads),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidConfiguration(format!("{} must be non-zero", name)));
        }
        if self.relative_attention_num_buckets < 2 {
            return Err(Error::InvalidConfiguration(
                "relative_attention_num_buckets must be at least 2".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::InvalidConfiguration(format!(
                "dropout_rate {} outside [0, 1)",
                self.dropout_rate
            )));
        }
        Ok(())
    }
}

/// Per-call overrides; `None` falls back to the config value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardFlags {
    pub use_cache: Option<bool>,
    pub output_attentions: Option<bool>,
    pub output_hidden_states: Option<bool>,
}

/// `ForwardFlags` with every field decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFlags {
    pub use_cache: bool,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
}

impl ForwardFlags {
    pub fn resolve(&self, config: &T5Config) -> ResolvedFlags {
        ResolvedFlags {
            use_cache: self.use_cache.unwrap_or(config.use_cache),
            output_attentions: self.output_attentions.unwrap_or(config.output_attentions),
            output_hidden_states: self
                .output_hidden_states
                .unwrap_or(config.output_hidden_states),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_depth_defaults_to_encoder_depth() {
        let c = T5Config::from_json_str(r#"{"d_model": 16, "num_layers": 3}"#).unwrap();
        assert_eq!(c.decoder_layers(), 3);
        assert_eq!(c.d_model, 16);
        assert_eq!(c.dtype, DType::F32);
    }

    #[test]
    fn zero_heads_rejected() {
        let err = T5Config::from_json_str(r#"{"num_heads": 0}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn flags_fall_back_to_config() {
        let c = T5Config::default();
        let f = ForwardFlags {
            use_cache: Some(false),
            ..Default::default()
        };
        let r = f.resolve(&c);
        assert!(!r.use_cache);
        assert!(!r.output_attentions);
    }
}
