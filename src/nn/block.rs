use crate::error::{Error, Result};
use crate::nn::attention::{AttentionInput, AttentionSublayer};
use crate::nn::feed_forward::FeedForward;
use crate::nn::gated_linear::ForwardMode;
use crate::nn::gates::{layer_gates, AttentionGates, LayerGates};
use crate::nn::kv_cache::LayerKv;
use crate::nn::{Module, RunContext};
use crate::tensor::Tensor;

/// Everything one block needs for a call. Shared tensors are borrowed from
/// the stack loop.
#[derive(Clone, Copy)]
pub struct BlockInput<'a> {
    pub hidden_states: &'a Tensor,
    pub attention_mask: Option<&'a Tensor>,
    pub position_bias: Option<&'a Tensor>,
    pub encoder_hidden_states: Option<&'a Tensor>,
    pub encoder_attention_mask: Option<&'a Tensor>,
    pub encoder_decoder_position_bias: Option<&'a Tensor>,
    pub layer_head_mask: Option<&'a Tensor>,
    pub cross_attn_layer_head_mask: Option<&'a Tensor>,
    /// Flat cache of this layer: empty, or 2 / 4 key-value tensors.
    pub past: Option<&'a [Tensor]>,
    pub use_cache: bool,
    pub output_attentions: bool,
    pub gates: Option<&'a LayerGates>,
    pub masks: Option<&'a LayerGates>,
    pub mode: ForwardMode,
}

impl<'a> BlockInput<'a> {
    pub fn new(hidden_states: &'a Tensor) -> Self {
        BlockInput {
            hidden_states,
            attention_mask: None,
            position_bias: None,
            encoder_hidden_states: None,
            encoder_attention_mask: None,
            encoder_decoder_position_bias: None,
            layer_head_mask: None,
            cross_attn_layer_head_mask: None,
            past: None,
            use_cache: false,
            output_attentions: false,
            gates: None,
            masks: None,
            mode: ForwardMode::default(),
        }
    }
}

/// Result of one block, with every optional part named.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub hidden_states: Tensor,
    pub present: Option<LayerKv>,
    pub position_bias: Option<Tensor>,
    pub self_attn_weights: Option<Tensor>,
    pub cross_position_bias: Option<Tensor>,
    pub cross_attn_weights: Option<Tensor>,
}

/// One transformer layer: self-attention, cross-attention (decoder only),
/// feed-forward.
pub struct Block {
    pub self_attn: AttentionSublayer,
    pub cross_attn: Option<AttentionSublayer>,
    pub feed_forward: FeedForward,
    pub is_decoder: bool,
}

impl Block {
    pub fn has_relative_bias(&self) -> bool {
        self.self_attn.attention.relative_bias.is_some()
    }

    pub fn forward(&self, input: BlockInput<'_>, ctx: &RunContext) -> Result<LayerOutput> {
        let past = match input.past {
            Some(states) if !states.is_empty() => {
                if !self.is_decoder {
                    return Err(Error::InvalidConfiguration(
                        "only decoder blocks can use cached key/value states".to_string(),
                    ));
                }
                Some(LayerKv::from_states(
                    states,
                    input.encoder_hidden_states.is_some(),
                )?)
            }
            _ => None,
        };

        let (attn_gates, ff_gates) = layer_gates(input.gates, input.masks);

        let self_out = self.self_attn.forward(
            AttentionInput {
                hidden_states: input.hidden_states,
                key_value_states: None,
                mask: input.attention_mask,
                position_bias: input.position_bias,
                past: past.as_ref().map(|p| &p.self_attn),
                layer_head_mask: input.layer_head_mask,
                query_length: None,
                use_cache: input.use_cache,
                output_attentions: input.output_attentions,
                gates: &attn_gates,
                mode: input.mode,
            },
            &ctx.for_sublayer(0),
        )?;
        let mut hidden = ctx.clamp_inf(&ctx.cast(&self_out.hidden_states));
        let self_present = self_out.present;

        let mut cross_present = None;
        let mut cross_position_bias = None;
        let mut cross_attn_weights = None;
        let cross = match (&self.cross_attn, input.encoder_hidden_states) {
            (Some(layer), Some(enc)) if self.is_decoder => Some((layer, enc)),
            _ => None,
        };
        if let Some((layer, enc)) = cross {
            // True query position once the self-attention cache has grown.
            let query_length = self_present.as_ref().map(|p| p.seq_len());
            // Cross-attention is never gated.
            let ungated = AttentionGates::default();
            let cross_out = layer.forward(
                AttentionInput {
                    hidden_states: &hidden,
                    key_value_states: Some(enc),
                    mask: input.encoder_attention_mask,
                    position_bias: input.encoder_decoder_position_bias,
                    past: past.as_ref().and_then(|p| p.cross_attn.as_ref()),
                    layer_head_mask: input.cross_attn_layer_head_mask,
                    query_length,
                    use_cache: input.use_cache,
                    output_attentions: input.output_attentions,
                    gates: &ungated,
                    mode: ForwardMode::default(),
                },
                &ctx.for_sublayer(1),
            )?;
            hidden = ctx.clamp_inf(&ctx.cast(&cross_out.hidden_states));
            cross_present = cross_out.present;
            cross_position_bias = Some(cross_out.position_bias);
            cross_attn_weights = cross_out.weights;
        }

        let hidden = self
            .feed_forward
            .forward(&hidden, &ff_gates, input.mode, &ctx.for_sublayer(2))?;
        let hidden = ctx.clamp_inf(&ctx.cast(&hidden));

        Ok(LayerOutput {
            hidden_states: hidden,
            present: self_present.map(|self_attn| LayerKv {
                self_attn,
                cross_attn: cross_present,
            }),
            position_bias: Some(self_out.position_bias),
            self_attn_weights: self_out.weights,
            cross_position_bias,
            cross_attn_weights,
        })
    }
}

impl Module for Block {
    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.self_attn.parameters();
        if let Some(cross) = &self.cross_attn {
            params.extend(cross.parameters());
        }
        params.extend(self.feed_forward.parameters());
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = self.self_attn.named_parameters(&format!("{}layer.0.", prefix));
        let ff_index = match &self.cross_attn {
            Some(cross) => {
                out.extend(cross.named_parameters(&format!("{}layer.1.", prefix)));
                2
            }
            None => 1,
        };
        out.extend(
            self.feed_forward
                .named_parameters(&format!("{}layer.{}.", prefix, ff_index)),
        );
        out
    }
}
