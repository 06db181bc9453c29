use crate::device::{Device, DeviceMap};
use crate::error::{Error, Result};
use crate::nn::block::{Block, BlockInput, LayerOutput};
use crate::nn::checkpoint::{checkpoint, ReplayFn};
use crate::nn::gated_linear::ForwardMode;
use crate::nn::gates::{GateBundle, LayerGates};
use crate::nn::kv_cache::{past_length, LayerPast};
use crate::nn::mask::{extended_attention_mask, full_mask, invert_attention_mask};
use crate::nn::{Embedding, Module, RunContext, T5LayerNorm};
use crate::tensor::Tensor;
use ndarray::Array2;
use std::sync::Arc;

const SITE_EMBED: u64 = 0;
const SITE_FINAL: u64 = 1;

/// Inputs of one stack call. Exactly one of `input_ids` and `inputs_embeds`
/// must be set.
#[derive(Clone, Copy)]
pub struct StackInput<'a> {
    pub input_ids: Option<&'a Array2<usize>>,
    pub inputs_embeds: Option<&'a Tensor>,
    /// `(batch, past + seq)` 0/1 padding mask; all ones when absent.
    pub attention_mask: Option<&'a Array2<f32>>,
    pub encoder_hidden_states: Option<&'a Tensor>,
    pub encoder_attention_mask: Option<&'a Array2<f32>>,
    /// `(layers, heads)` multipliers on self-attention weights.
    pub head_mask: Option<&'a Tensor>,
    pub cross_attn_head_mask: Option<&'a Tensor>,
    pub past_key_values: Option<&'a [LayerPast]>,
    pub gates: Option<&'a GateBundle>,
    pub masks: Option<&'a GateBundle>,
    pub mode: ForwardMode,
    pub use_cache: bool,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
}

impl<'a> StackInput<'a> {
    pub fn ids(input_ids: &'a Array2<usize>) -> Self {
        StackInput {
            input_ids: Some(input_ids),
            ..StackInput::empty()
        }
    }

    pub fn embeds(inputs_embeds: &'a Tensor) -> Self {
        StackInput {
            inputs_embeds: Some(inputs_embeds),
            ..StackInput::empty()
        }
    }

    pub fn empty() -> Self {
        StackInput {
            input_ids: None,
            inputs_embeds: None,
            attention_mask: None,
            encoder_hidden_states: None,
            encoder_attention_mask: None,
            head_mask: None,
            cross_attn_head_mask: None,
            past_key_values: None,
            gates: None,
            masks: None,
            mode: ForwardMode::default(),
            use_cache: false,
            output_attentions: false,
            output_hidden_states: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StackOutput {
    pub last_hidden_state: Tensor,
    pub past_key_values: Option<Vec<LayerPast>>,
    /// Input of every layer, then the final normed state.
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
}

/// An ordered run of blocks for one side of the model.
pub struct Stack {
    pub blocks: Vec<Arc<Block>>,
    pub final_layer_norm: T5LayerNorm,
    pub is_decoder: bool,
    pub num_heads: usize,
    pub gradient_checkpointing: bool,
    device_map: Option<DeviceMap>,
}

// Positions of the optional tensors in a checkpointed block's input list.
#[derive(Clone, Copy, Default)]
struct ReplaySlots {
    encoder_hidden_states: Option<usize>,
    encoder_attention_mask: Option<usize>,
    encoder_decoder_position_bias: Option<usize>,
    layer_head_mask: Option<usize>,
    cross_attn_layer_head_mask: Option<usize>,
}

fn push_slot(inputs: &mut Vec<Tensor>, t: Option<&Tensor>) -> Option<usize> {
    t.map(|t| {
        inputs.push(t.clone());
        inputs.len() - 1
    })
}

fn move_opt(t: Option<Tensor>, device: Device) -> Option<Tensor> {
    t.map(|t| t.to_device(device))
}

impl Stack {
    pub fn new(
        blocks: Vec<Block>,
        final_layer_norm: T5LayerNorm,
        is_decoder: bool,
        num_heads: usize,
    ) -> Self {
        Stack {
            blocks: blocks.into_iter().map(Arc::new).collect(),
            final_layer_norm,
            is_decoder,
            num_heads,
            gradient_checkpointing: false,
            device_map: None,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn device_map(&self) -> Option<&DeviceMap> {
        self.device_map.as_ref()
    }

    pub fn first_device(&self) -> Device {
        self.device_map
            .as_ref()
            .map(|m| m.first_device())
            .unwrap_or_default()
    }

    /// Places each block's parameters on its mapped device and the final
    /// norm on the last one.
    pub fn parallelize(&mut self, map: DeviceMap) {
        for (i, block) in self.blocks.iter().enumerate() {
            let device = map.device_for(i);
            for p in block.parameters() {
                p.lock().device = device;
            }
        }
        self.final_layer_norm.weight.lock().device = map.last_device();
        self.device_map = Some(map);
    }

    pub fn deparallelize(&mut self) {
        for p in self.parameters() {
            p.lock().device = Device::Cpu;
        }
        self.device_map = None;
    }

    fn layer_head_mask(&self, mask: Option<&Tensor>, layer: usize) -> Result<Option<Tensor>> {
        let Some(mask) = mask else {
            return Ok(None);
        };
        let shape = mask.shape();
        if shape != [self.blocks.len(), self.num_heads] {
            return Err(Error::Shape(format!(
                "head mask must be ({}, {}), got {:?}",
                self.blocks.len(),
                self.num_heads,
                shape
            )));
        }
        Ok(Some(
            mask.narrow(0, layer, 1)?.reshape(vec![self.num_heads])?,
        ))
    }

    pub fn forward(
        &self,
        input: StackInput<'_>,
        embed: &Embedding,
        ctx: &RunContext,
    ) -> Result<StackOutput> {
        let side = if self.is_decoder { "decoder_" } else { "" };
        let hidden = match (input.input_ids, input.inputs_embeds) {
            (Some(_), Some(_)) => return Err(Error::AmbiguousInputBoth { side }),
            (None, None) => return Err(Error::AmbiguousInputNeither { side }),
            (Some(ids), None) => embed.forward(ids)?,
            (None, Some(e)) => e.clone(),
        };
        let shape = hidden.shape();
        if shape.len() != 3 {
            return Err(Error::Shape(format!(
                "hidden states must be (batch, seq, d_model), got {:?}",
                shape
            )));
        }
        let (batch, seq_len) = (shape[0], shape[1]);

        let mut use_cache = input.use_cache;
        if use_cache && !self.is_decoder {
            return Err(Error::InvalidConfiguration(
                "use_cache can only be set for the decoder stack".to_string(),
            ));
        }

        let past_len = match input.past_key_values {
            Some(past) => {
                if past.len() != self.blocks.len() {
                    return Err(Error::InvalidCacheState {
                        expected: self.blocks.len(),
                        found: past.len(),
                    });
                }
                past_length(past)
            }
            None => 0,
        };

        let checkpointing = ctx.training && self.gradient_checkpointing;
        if checkpointing && use_cache {
            log::warn!("use_cache=true is incompatible with gradient checkpointing; disabling cache");
            use_cache = false;
        }

        let mask_len = past_len + seq_len;
        let attention_mask = match input.attention_mask {
            Some(m) if m.dim() != (batch, mask_len) => {
                return Err(Error::Shape(format!(
                    "attention mask must be ({}, {}), got {:?}",
                    batch,
                    mask_len,
                    m.dim()
                )))
            }
            Some(m) => m.clone(),
            None => full_mask(batch, mask_len),
        };
        let mut extended_mask = extended_attention_mask(&attention_mask, seq_len, self.is_decoder)?;

        let mut encoder_hidden_states = if self.is_decoder {
            input.encoder_hidden_states.cloned()
        } else {
            None
        };
        let mut encoder_mask = match &encoder_hidden_states {
            Some(enc) => {
                let enc_len = enc.shape()[1];
                let m = match input.encoder_attention_mask {
                    Some(m) if m.dim() != (batch, enc_len) => {
                        return Err(Error::Shape(format!(
                            "encoder attention mask must be ({}, {}), got {:?}",
                            batch,
                            enc_len,
                            m.dim()
                        )))
                    }
                    Some(m) => m.clone(),
                    None => full_mask(batch, enc_len),
                };
                Some(invert_attention_mask(&m))
            }
            None => None,
        };

        let mut hidden = ctx.cast(&ctx.dropout(&hidden, SITE_EMBED));

        let mut position_bias: Option<Tensor> = None;
        let mut encoder_decoder_position_bias: Option<Tensor> = None;
        if checkpointing {
            let (bias, cross_bias) = self.replay_biases(
                &hidden,
                past_len,
                &extended_mask,
                encoder_hidden_states.as_ref(),
                encoder_mask.as_ref(),
            )?;
            position_bias = Some(bias);
            encoder_decoder_position_bias = cross_bias;
        }

        let mut presents: Vec<LayerPast> = Vec::new();
        let mut all_hidden_states: Vec<Tensor> = Vec::new();
        let mut all_attentions: Vec<Tensor> = Vec::new();
        let mut all_cross_attentions: Vec<Tensor> = Vec::new();

        for (i, block) in self.blocks.iter().enumerate() {
            if let Some(map) = &self.device_map {
                let device = map.device_for(i);
                if hidden.device() != device {
                    log::debug!("layer {}: moving activations to {}", i, device);
                }
                hidden = hidden.to_device(device);
                extended_mask = extended_mask.to_device(device);
                position_bias = move_opt(position_bias, device);
                encoder_hidden_states = move_opt(encoder_hidden_states, device);
                encoder_mask = move_opt(encoder_mask, device);
                encoder_decoder_position_bias = move_opt(encoder_decoder_position_bias, device);
            }
            let layer_head_mask = self.layer_head_mask(input.head_mask, i)?;
            let cross_head_mask = self.layer_head_mask(input.cross_attn_head_mask, i)?;

            if input.output_hidden_states {
                all_hidden_states.push(hidden.clone());
            }

            let gates = input.gates.and_then(|g| g.layer(i));
            let masks = input.masks.and_then(|m| m.layer(i));
            let layer_ctx = ctx.for_layer(i);

            let out = if checkpointing {
                self.checkpointed_layer(
                    i,
                    &hidden,
                    &extended_mask,
                    position_bias.as_ref(),
                    encoder_hidden_states.as_ref(),
                    encoder_mask.as_ref(),
                    encoder_decoder_position_bias.as_ref(),
                    layer_head_mask.as_ref(),
                    cross_head_mask.as_ref(),
                    gates,
                    masks,
                    input.mode,
                    layer_ctx,
                )?
            } else {
                block.forward(
                    BlockInput {
                        hidden_states: &hidden,
                        attention_mask: Some(&extended_mask),
                        position_bias: position_bias.as_ref(),
                        encoder_hidden_states: encoder_hidden_states.as_ref(),
                        encoder_attention_mask: encoder_mask.as_ref(),
                        encoder_decoder_position_bias: encoder_decoder_position_bias.as_ref(),
                        layer_head_mask: layer_head_mask.as_ref(),
                        cross_attn_layer_head_mask: cross_head_mask.as_ref(),
                        past: input.past_key_values.map(|p| p[i].as_slice()),
                        use_cache,
                        output_attentions: input.output_attentions,
                        gates,
                        masks,
                        mode: input.mode,
                    },
                    &layer_ctx,
                )?
            };

            hidden = out.hidden_states;
            // Set once by the first layer, then shared by every later one.
            if position_bias.is_none() {
                position_bias = out.position_bias;
            }
            if encoder_decoder_position_bias.is_none() && encoder_hidden_states.is_some() {
                encoder_decoder_position_bias = out.cross_position_bias;
            }
            if use_cache {
                presents.push(out.present.map(|p| p.to_states()).unwrap_or_default());
            }
            if input.output_attentions {
                all_attentions.extend(out.self_attn_weights);
                if self.is_decoder {
                    all_cross_attentions.extend(out.cross_attn_weights);
                }
            }

            if let Some(next) = self.device_map.as_ref().and_then(|m| m.handoff_after(i)) {
                log::debug!("layer {}: handing off to {}", i, next);
                hidden = hidden.to_device(next);
            }
        }

        let hidden = self.final_layer_norm.forward(&hidden);
        let hidden = ctx.dropout(&hidden, SITE_FINAL);
        if input.output_hidden_states {
            all_hidden_states.push(hidden.clone());
        }

        Ok(StackOutput {
            last_hidden_state: hidden,
            past_key_values: if use_cache { Some(presents) } else { None },
            hidden_states: input.output_hidden_states.then_some(all_hidden_states),
            attentions: input.output_attentions.then_some(all_attentions),
            cross_attentions: (input.output_attentions && self.is_decoder)
                .then_some(all_cross_attentions),
        })
    }

    // Layer 0 biases computed up front, so checkpointed blocks receive them
    // as explicit inputs instead of producing them inside a replay.
    fn replay_biases(
        &self,
        hidden: &Tensor,
        past_len: usize,
        extended_mask: &Tensor,
        encoder_hidden_states: Option<&Tensor>,
        encoder_mask: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let first = self
            .blocks
            .first()
            .ok_or_else(|| Error::InvalidConfiguration("stack has no layers".to_string()))?;
        let seq_len = hidden.shape()[1];
        let real_len = past_len + seq_len;
        let bias = first
            .self_attn
            .attention
            .compute_position_bias(real_len, real_len, seq_len, hidden)?
            .add(extended_mask);
        let cross_bias = match (&first.cross_attn, encoder_hidden_states, encoder_mask) {
            (Some(cross), Some(enc), Some(mask)) => {
                let enc_len = enc.shape()[1];
                Some(
                    cross
                        .attention
                        .compute_position_bias(seq_len, enc_len, seq_len, hidden)?
                        .add(mask),
                )
            }
            _ => None,
        };
        Ok((bias, cross_bias))
    }

    #[allow(clippy::too_many_arguments)]
    fn checkpointed_layer(
        &self,
        layer: usize,
        hidden: &Tensor,
        extended_mask: &Tensor,
        position_bias: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        encoder_mask: Option<&Tensor>,
        encoder_decoder_position_bias: Option<&Tensor>,
        layer_head_mask: Option<&Tensor>,
        cross_head_mask: Option<&Tensor>,
        gates: Option<&LayerGates>,
        masks: Option<&LayerGates>,
        mode: ForwardMode,
        ctx: RunContext,
    ) -> Result<LayerOutput> {
        let position_bias = position_bias
            .ok_or_else(|| Error::InvalidConfiguration("checkpointing without a position bias".to_string()))?
            .clone();
        let mut inputs = vec![hidden.clone(), extended_mask.clone(), position_bias.clone()];
        let slots = ReplaySlots {
            encoder_hidden_states: push_slot(&mut inputs, encoder_hidden_states),
            encoder_attention_mask: push_slot(&mut inputs, encoder_mask),
            encoder_decoder_position_bias: push_slot(&mut inputs, encoder_decoder_position_bias),
            layer_head_mask: push_slot(&mut inputs, layer_head_mask),
            cross_attn_layer_head_mask: push_slot(&mut inputs, cross_head_mask),
        };

        let block = Arc::clone(&self.blocks[layer]);
        let gates = gates.cloned();
        let masks = masks.cloned();
        let replay: Arc<ReplayFn> = Arc::new(move |ts: &[Tensor]| {
            let get = |slot: Option<usize>| slot.map(|k| &ts[k]);
            let out = block.forward(
                BlockInput {
                    hidden_states: &ts[0],
                    attention_mask: Some(&ts[1]),
                    position_bias: Some(&ts[2]),
                    encoder_hidden_states: get(slots.encoder_hidden_states),
                    encoder_attention_mask: get(slots.encoder_attention_mask),
                    encoder_decoder_position_bias: get(slots.encoder_decoder_position_bias),
                    layer_head_mask: get(slots.layer_head_mask),
                    cross_attn_layer_head_mask: get(slots.cross_attn_layer_head_mask),
                    past: None,
                    use_cache: false,
                    output_attentions: false,
                    gates: gates.as_ref(),
                    masks: masks.as_ref(),
                    mode,
                },
                &ctx,
            )?;
            Ok(out.hidden_states)
        });

        let hidden = checkpoint(replay, &inputs)?;
        Ok(LayerOutput {
            hidden_states: hidden,
            present: None,
            position_bias: Some(position_bias),
            self_attn_weights: None,
            cross_position_bias: encoder_decoder_position_bias.cloned(),
            cross_attn_weights: None,
        })
    }
}

impl Module for Stack {
    fn parameters(&self) -> Vec<Tensor> {
        let mut params: Vec<Tensor> = self.blocks.iter().flat_map(|b| b.parameters()).collect();
        params.extend(self.final_layer_norm.parameters());
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        for (i, b) in self.blocks.iter().enumerate() {
            out.extend(b.named_parameters(&format!("{}block.{}.", prefix, i)));
        }
        out.extend(
            self.final_layer_norm
                .named_parameters(&format!("{}final_layer_norm.", prefix)),
        );
        out
    }
}
