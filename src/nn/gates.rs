//! Routing of structural gates and dimension masks to projections.
//!
//! A bundle holds one `LayerGates` per layer over the encoder and decoder
//! together: entries `[0, encoder_layers)` belong to the encoder, the rest to
//! the decoder. Inside a layer the attention slots come first, then the
//! feed-forward pair. Dimension masks use the same layout and slicing.

use crate::tensor::Tensor;

/// Gate slots of one layer.
#[derive(Debug, Clone, Default)]
pub struct LayerGates {
    pub slots: Vec<Tensor>,
}

impl LayerGates {
    pub fn new(slots: Vec<Tensor>) -> Self {
        LayerGates { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Splits into (attention, feed-forward) slots at `min(4, len)`.
    ///
    /// Six slots are `(q, k, v, o, w_in, w_out)`. Four slots gate the
    /// attention projections only, and two slots are the reduced `(q, v)`
    /// attention layout.
    pub fn split(&self) -> (&[Tensor], &[Tensor]) {
        self.slots.split_at(self.slots.len().min(4))
    }
}

/// Per-layer gates for a whole encoder-decoder model, or for one side of it.
#[derive(Debug, Clone, Default)]
pub struct GateBundle {
    pub layers: Vec<LayerGates>,
}

impl GateBundle {
    pub fn new(layers: Vec<LayerGates>) -> Self {
        GateBundle { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Splits into (encoder, decoder) halves at the encoder depth. A bundle
    /// shorter than the encoder leaves the decoder half empty.
    pub fn split_at(&self, encoder_layers: usize) -> (GateBundle, GateBundle) {
        let at = encoder_layers.min(self.layers.len());
        let (enc, dec) = self.layers.split_at(at);
        (GateBundle::new(enc.to_vec()), GateBundle::new(dec.to_vec()))
    }

    pub fn layer(&self, i: usize) -> Option<&LayerGates> {
        self.layers.get(i)
    }
}

/// Gate and mask for one projection call.
#[derive(Debug, Clone, Default)]
pub struct ProjectionGates {
    pub gate: Option<Tensor>,
    pub mask: Option<Tensor>,
}

impl ProjectionGates {
    fn pick(gates: &[Tensor], masks: &[Tensor], i: usize) -> ProjectionGates {
        let gate = gates.get(i).cloned();
        // Masks only take part alongside a gate.
        let mask = if gate.is_some() && masks.len() == gates.len() {
            masks.get(i).cloned()
        } else {
            None
        };
        ProjectionGates { gate, mask }
    }
}

/// Gates of the four attention projections.
#[derive(Debug, Clone, Default)]
pub struct AttentionGates {
    pub q: ProjectionGates,
    pub k: ProjectionGates,
    pub v: ProjectionGates,
    pub o: ProjectionGates,
}

impl AttentionGates {
    /// Four slots gate `(q, k, v, o)`; two slots gate `(q, v)`. Any other
    /// count runs the sublayer ungated.
    pub fn from_slots(gates: &[Tensor], masks: &[Tensor]) -> AttentionGates {
        match gates.len() {
            4 => AttentionGates {
                q: ProjectionGates::pick(gates, masks, 0),
                k: ProjectionGates::pick(gates, masks, 1),
                v: ProjectionGates::pick(gates, masks, 2),
                o: ProjectionGates::pick(gates, masks, 3),
            },
            2 => AttentionGates {
                q: ProjectionGates::pick(gates, masks, 0),
                v: ProjectionGates::pick(gates, masks, 1),
                ..Default::default()
            },
            0 => AttentionGates::default(),
            n => {
                log::warn!("{} attention gate slots, expected 2 or 4; running ungated", n);
                AttentionGates::default()
            }
        }
    }
}

/// Gates of the two feed-forward projections.
#[derive(Debug, Clone, Default)]
pub struct FeedForwardGates {
    pub w_in: ProjectionGates,
    pub w_out: ProjectionGates,
}

impl FeedForwardGates {
    /// Exactly two slots gate `(w_in, w_out)`. Any other count falls back to
    /// ungated execution.
    pub fn from_slots(gates: &[Tensor], masks: &[Tensor]) -> FeedForwardGates {
        match gates.len() {
            2 => FeedForwardGates {
                w_in: ProjectionGates::pick(gates, masks, 0),
                w_out: ProjectionGates::pick(gates, masks, 1),
            },
            0 => FeedForwardGates::default(),
            n => {
                log::warn!("{} feed-forward gate slots, expected 2; running ungated", n);
                FeedForwardGates::default()
            }
        }
    }
}

/// Resolves the gates of both sublayers of one layer.
pub fn layer_gates(
    gates: Option<&LayerGates>,
    masks: Option<&LayerGates>,
) -> (AttentionGates, FeedForwardGates) {
    let Some(gates) = gates else {
        return (AttentionGates::default(), FeedForwardGates::default());
    };
    let (attn_g, ff_g) = gates.split();
    let (attn_m, ff_m) = match masks {
        Some(m) => m.split(),
        None => (&[][..], &[][..]),
    };
    (
        AttentionGates::from_slots(attn_g, attn_m),
        FeedForwardGates::from_slots(ff_g, ff_m),
    )
}
