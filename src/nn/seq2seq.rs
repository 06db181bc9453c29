use crate::config::{ForwardFlags, T5Config};
use crate::device::{Device, DeviceMap};
use crate::error::{Error, Result};
use crate::nn::attention::{Attention, AttentionSublayer};
use crate::nn::block::Block;
use crate::nn::feed_forward::FeedForward;
use crate::nn::gated_linear::{
    ForwardMode, GatedLinear, GatedProjection, ProjectionFactory, ProjectionKind, ProjectionSite,
};
use crate::nn::gates::GateBundle;
use crate::nn::kv_cache::LayerPast;
use crate::nn::relative_bias::RelativePositionBias;
use crate::nn::stack::{Stack, StackInput, StackOutput};
use crate::nn::{mix_seed, Embedding, Linear, Module, RunContext, T5LayerNorm};
use crate::tensor::Tensor;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Builds teacher-forcing decoder inputs: labels shifted one step right with
/// `start` in front, and ignored positions replaced by `pad`.
pub fn shift_right(labels: &Array2<i64>, start: usize, pad: usize) -> Result<Array2<usize>> {
    let (batch, len) = labels.dim();
    let mut out = Array2::<usize>::zeros((batch, len));
    for b in 0..batch {
        for t in 0..len {
            let v = if t == 0 {
                start as i64
            } else {
                labels[[b, t - 1]]
            };
            out[[b, t]] = match v {
                IGNORE_INDEX => pad,
                v if v < 0 => {
                    return Err(Error::InvalidConfiguration(format!(
                        "label {} at ({}, {}) is negative and not the ignore index",
                        v,
                        b,
                        t - 1
                    )))
                }
                v => v as usize,
            };
        }
    }
    Ok(out)
}

/// Inputs of one encoder-decoder call.
#[derive(Clone, Copy, Default)]
pub struct Seq2SeqInput<'a> {
    pub input_ids: Option<&'a Array2<usize>>,
    pub inputs_embeds: Option<&'a Tensor>,
    pub attention_mask: Option<&'a Array2<f32>>,
    pub decoder_input_ids: Option<&'a Array2<usize>>,
    pub decoder_inputs_embeds: Option<&'a Tensor>,
    pub decoder_attention_mask: Option<&'a Array2<f32>>,
    pub labels: Option<&'a Array2<i64>>,
    /// Skips the encoder.
    pub encoder_outputs: Option<&'a StackOutput>,
    pub past_key_values: Option<&'a [LayerPast]>,
    pub head_mask: Option<&'a Tensor>,
    pub decoder_head_mask: Option<&'a Tensor>,
    pub cross_attn_head_mask: Option<&'a Tensor>,
    /// Gates for encoder and decoder layers together.
    pub gates: Option<&'a GateBundle>,
    pub dimension_masks: Option<&'a GateBundle>,
    pub mode: ForwardMode,
    pub flags: ForwardFlags,
}

#[derive(Debug, Clone)]
pub struct Seq2SeqOutput {
    pub loss: Option<Tensor>,
    pub logits: Tensor,
    pub past_key_values: Option<Vec<LayerPast>>,
    pub decoder_hidden_states: Option<Vec<Tensor>>,
    pub decoder_attentions: Option<Vec<Tensor>>,
    pub cross_attentions: Option<Vec<Tensor>>,
    pub encoder_last_hidden_state: Tensor,
    pub encoder_hidden_states: Option<Vec<Tensor>>,
    pub encoder_attentions: Option<Vec<Tensor>>,
}

/// Encoder-decoder model with a language-modelling head.
pub struct Seq2SeqEngine {
    pub config: T5Config,
    pub shared: Embedding,
    pub encoder: Stack,
    pub decoder: Stack,
    /// Present only when input and output embeddings are untied.
    pub lm_head: Option<Linear>,
    training: bool,
    seed: u64,
    calls: AtomicU64,
}

fn build_stack(
    config: &T5Config,
    decoder: bool,
    rng: &mut StdRng,
    factory: &mut ProjectionFactory<'_>,
) -> Stack {
    let num_layers = if decoder {
        config.decoder_layers()
    } else {
        config.num_layers
    };
    let d_model = config.d_model;
    let inner = config.inner_dim();
    let eps = config.layer_norm_epsilon;

    let attention = |layer: usize,
                     cross: bool,
                     rng: &mut StdRng,
                     factory: &mut ProjectionFactory<'_>| {
        let site = |kind| ProjectionSite {
            kind,
            layer,
            decoder,
            cross,
        };
        AttentionSublayer {
            layer_norm: T5LayerNorm::new(d_model, eps),
            attention: Attention {
                q: factory(site(ProjectionKind::Query), d_model, inner),
                k: factory(site(ProjectionKind::Key), d_model, inner),
                v: factory(site(ProjectionKind::Value), d_model, inner),
                o: factory(site(ProjectionKind::Output), inner, d_model),
                relative_bias: (layer == 0 && !cross).then(|| {
                    RelativePositionBias::new(
                        config.relative_attention_num_buckets,
                        config.relative_attention_max_distance,
                        config.num_heads,
                        !decoder,
                        rng,
                    )
                }),
                num_heads: config.num_heads,
                d_kv: config.d_kv,
                is_decoder: decoder,
            },
        }
    };

    let mut blocks = Vec::with_capacity(num_layers);
    for layer in 0..num_layers {
        let self_attn = attention(layer, false, rng, factory);
        let cross_attn = decoder.then(|| attention(layer, true, rng, factory));
        let site = |kind| ProjectionSite {
            kind,
            layer,
            decoder,
            cross: false,
        };
        let feed_forward = FeedForward {
            layer_norm: T5LayerNorm::new(d_model, eps),
            wi: factory(site(ProjectionKind::FfIn), d_model, config.d_ff),
            wo: factory(site(ProjectionKind::FfOut), config.d_ff, d_model),
        };
        blocks.push(Block {
            self_attn,
            cross_attn,
            feed_forward,
            is_decoder: decoder,
        });
    }
    let mut stack = Stack::new(
        blocks,
        T5LayerNorm::new(d_model, eps),
        decoder,
        config.num_heads,
    );
    stack.gradient_checkpointing = config.gradient_checkpointing;
    stack
}

impl Seq2SeqEngine {
    /// Builds a model with `GatedLinear` projections of rank
    /// `config.adapter_rank`.
    pub fn new(config: T5Config, rng: &mut StdRng) -> Result<Self> {
        let rank = config.adapter_rank;
        let mut proj_rng = StdRng::seed_from_u64(rng.gen());
        let mut factory = move |_: ProjectionSite, fan_in: usize, fan_out: usize| {
            Box::new(GatedLinear::new(fan_in, fan_out, rank, &mut proj_rng)) as Box<dyn GatedProjection>
        };
        Seq2SeqEngine::with_projections(config, rng, &mut factory)
    }

    /// Builds a model whose projections come from `factory`.
    pub fn with_projections(
        config: T5Config,
        rng: &mut StdRng,
        factory: &mut ProjectionFactory<'_>,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Embedding::new(config.vocab_size, config.d_model, rng);
        let encoder = build_stack(&config, false, rng, factory);
        let decoder = build_stack(&config, true, rng, factory);
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(Linear::new(config.d_model, config.vocab_size, rng))
        };
        let seed = rng.gen();
        Ok(Seq2SeqEngine {
            config,
            shared,
            encoder,
            decoder,
            lm_head,
            training: false,
            seed,
            calls: AtomicU64::new(0),
        })
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn set_gradient_checkpointing(&mut self, enabled: bool) {
        self.config.gradient_checkpointing = enabled;
        self.encoder.gradient_checkpointing = enabled;
        self.decoder.gradient_checkpointing = enabled;
    }

    /// Spreads the stacks over devices. The shared embedding and the head
    /// live on the encoder's first device.
    pub fn parallelize(&mut self, encoder_map: DeviceMap, decoder_map: DeviceMap) -> Result<()> {
        for (map, stack, name) in [
            (&encoder_map, &self.encoder, "encoder"),
            (&decoder_map, &self.decoder, "decoder"),
        ] {
            if map.num_layers() != stack.num_layers() {
                return Err(Error::InvalidConfiguration(format!(
                    "{} device map covers {} layers, stack has {}",
                    name,
                    map.num_layers(),
                    stack.num_layers()
                )));
            }
        }
        let head_device = encoder_map.first_device();
        self.shared.weight.lock().device = head_device;
        if let Some(head) = &self.lm_head {
            head.weight.lock().device = head_device;
        }
        self.encoder.parallelize(encoder_map);
        self.decoder.parallelize(decoder_map);
        Ok(())
    }

    pub fn deparallelize(&mut self) {
        self.encoder.deparallelize();
        self.decoder.deparallelize();
        self.shared.weight.lock().device = Device::Cpu;
        if let Some(head) = &self.lm_head {
            head.weight.lock().device = Device::Cpu;
        }
    }

    fn run_context(&self, stream: u64) -> RunContext {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        RunContext {
            training: self.training,
            dropout_rate: self.config.dropout_rate,
            dtype: self.config.dtype,
            seed: mix_seed(mix_seed(self.seed, call), stream),
        }
    }

    /// Runs only the encoder.
    pub fn encode(&self, input: &Seq2SeqInput<'_>) -> Result<StackOutput> {
        let flags = input.flags.resolve(&self.config);
        let encoder_gates = input
            .gates
            .map(|g| g.split_at(self.encoder.num_layers()).0);
        let encoder_masks = input
            .dimension_masks
            .map(|m| m.split_at(self.encoder.num_layers()).0);
        self.encoder.forward(
            StackInput {
                input_ids: input.input_ids,
                inputs_embeds: input.inputs_embeds,
                attention_mask: input.attention_mask,
                head_mask: input.head_mask,
                gates: encoder_gates.as_ref(),
                masks: encoder_masks.as_ref(),
                mode: input.mode,
                output_attentions: flags.output_attentions,
                output_hidden_states: flags.output_hidden_states,
                ..StackInput::empty()
            },
            &self.shared,
            &self.run_context(1),
        )
    }

    pub fn forward(&self, input: Seq2SeqInput<'_>) -> Result<Seq2SeqOutput> {
        let flags = input.flags.resolve(&self.config);
        let enc_layers = self.encoder.num_layers();

        let mut decoder_head_mask = input.decoder_head_mask;
        if input.head_mask.is_some()
            && decoder_head_mask.is_none()
            && enc_layers == self.decoder.num_layers()
        {
            log::warn!(
                "head_mask was split into head_mask and decoder_head_mask; copying head_mask \
                 to the decoder is deprecated, pass decoder_head_mask explicitly"
            );
            decoder_head_mask = input.head_mask;
        }

        let decoder_gates = input.gates.map(|g| g.split_at(enc_layers).1);
        let decoder_masks = input.dimension_masks.map(|m| m.split_at(enc_layers).1);

        let encoder_outputs = match input.encoder_outputs {
            Some(out) => out.clone(),
            None => self.encode(&input)?,
        };

        if input.labels.is_some() && input.past_key_values.is_some() {
            return Err(Error::InvalidCombination(
                "labels cannot be combined with cached key/value states".to_string(),
            ));
        }
        let shifted;
        let mut decoder_input_ids = input.decoder_input_ids;
        if let Some(labels) = input.labels {
            if decoder_input_ids.is_none() && input.decoder_inputs_embeds.is_none() {
                shifted = shift_right(
                    labels,
                    self.config.decoder_start_token_id,
                    self.config.pad_token_id,
                )?;
                decoder_input_ids = Some(&shifted);
            }
        }

        // With a cache only the newest token is projected.
        let last_ids;
        let last_embeds;
        let mut decoder_inputs_embeds = input.decoder_inputs_embeds;
        if input.past_key_values.is_some() {
            if let Some(ids) = decoder_input_ids {
                let len = ids.ncols();
                last_ids = ids.slice(ndarray::s![.., len.saturating_sub(1)..]).to_owned();
                decoder_input_ids = Some(&last_ids);
            }
            if let Some(e) = decoder_inputs_embeds {
                let len = e.shape()[1];
                last_embeds = e.narrow(1, len.saturating_sub(1), len.min(1))?;
                decoder_inputs_embeds = Some(&last_embeds);
            }
        }

        let encoder_hidden = encoder_outputs
            .last_hidden_state
            .to_device(self.decoder.first_device());
        let decoder_out = self.decoder.forward(
            StackInput {
                input_ids: decoder_input_ids,
                inputs_embeds: decoder_inputs_embeds,
                attention_mask: input.decoder_attention_mask,
                encoder_hidden_states: Some(&encoder_hidden),
                encoder_attention_mask: input.attention_mask,
                head_mask: decoder_head_mask,
                cross_attn_head_mask: input.cross_attn_head_mask,
                past_key_values: input.past_key_values,
                gates: decoder_gates.as_ref(),
                masks: decoder_masks.as_ref(),
                mode: input.mode,
                use_cache: flags.use_cache,
                output_attentions: flags.output_attentions,
                output_hidden_states: flags.output_hidden_states,
            },
            &self.shared,
            &self.run_context(2),
        )?;

        let sequence_output = decoder_out
            .last_hidden_state
            .to_device(self.shared.weight.device());
        let logits = self.project(&sequence_output)?;

        let loss = match input.labels {
            Some(labels) => {
                let shape = logits.shape();
                let rows = shape[0] * shape[1];
                let flat = logits.reshape(vec![rows, shape[2]])?;
                let targets: Vec<i64> = labels.iter().copied().collect();
                Some(flat.cross_entropy(&targets, IGNORE_INDEX)?)
            }
            None => None,
        };

        Ok(Seq2SeqOutput {
            loss,
            logits,
            past_key_values: decoder_out.past_key_values,
            decoder_hidden_states: decoder_out.hidden_states,
            decoder_attentions: decoder_out.attentions,
            cross_attentions: decoder_out.cross_attentions,
            encoder_last_hidden_state: encoder_outputs.last_hidden_state,
            encoder_hidden_states: encoder_outputs.hidden_states,
            encoder_attentions: encoder_outputs.attentions,
        })
    }

    /// Vocabulary logits for decoder states. Tied embeddings rescale the
    /// states by `d_model^-0.5` first.
    pub fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        match &self.lm_head {
            Some(head) => head.forward(hidden),
            None => {
                let scale = (self.config.d_model as f32).powf(-0.5);
                let table = self.shared.weight.permute(vec![1, 0])?;
                hidden.scale(scale).linear(&table)
            }
        }
    }
}

impl Module for Seq2SeqEngine {
    /// Every trainable tensor once, even when shared.
    fn parameters(&self) -> Vec<Tensor> {
        let mut seen = HashSet::new();
        self.named_parameters("")
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = self.shared.named_parameters(&format!("{}shared.", prefix));
        out.extend(self.encoder.named_parameters(&format!("{}encoder.", prefix)));
        out.extend(self.decoder.named_parameters(&format!("{}decoder.", prefix)));
        if let Some(head) = &self.lm_head {
            out.extend(head.named_parameters(&format!("{}lm_head.", prefix)));
        }
        out
    }
}
