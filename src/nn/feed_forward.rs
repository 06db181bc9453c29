use crate::error::Result;
use crate::nn::gated_linear::{ForwardMode, GatedProjection};
use crate::nn::gates::FeedForwardGates;
use crate::nn::{Module, RunContext, T5LayerNorm};
use crate::tensor::Tensor;

const SITE_HIDDEN: u64 = 0;
const SITE_OUTPUT: u64 = 1;

/// `x + dropout(wo(dropout(relu(wi(layer_norm(x))))))`.
pub struct FeedForward {
    pub layer_norm: T5LayerNorm,
    pub wi: Box<dyn GatedProjection>,
    pub wo: Box<dyn GatedProjection>,
}

impl FeedForward {
    /// Projections without a gate run in the default mode.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        gates: &FeedForwardGates,
        mode: ForwardMode,
        ctx: &RunContext,
    ) -> Result<Tensor> {
        let normed = self.layer_norm.forward(hidden_states);
        let h = match &gates.w_in.gate {
            Some(g) => self.wi.forward(&normed, Some(g), gates.w_in.mask.as_ref(), mode)?,
            None => self.wi.forward(&normed, None, None, ForwardMode::default())?,
        };
        let h = ctx.dropout(&h.relu(), SITE_HIDDEN);
        let y = match &gates.w_out.gate {
            Some(g) => self.wo.forward(&h, Some(g), gates.w_out.mask.as_ref(), mode)?,
            None => self.wo.forward(&h, None, None, ForwardMode::default())?,
        };
        Ok(hidden_states.add(&ctx.dropout(&y, SITE_OUTPUT)))
    }
}

impl Module for FeedForward {
    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.wi.parameters();
        params.extend(self.wo.parameters());
        params.extend(self.layer_norm.parameters());
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut out = self.wi.named_parameters(&format!("{}wi.", prefix));
        out.extend(self.wo.named_parameters(&format!("{}wo.", prefix)));
        out.extend(self.layer_norm.named_parameters(&format!("{}layer_norm.", prefix)));
        out
    }
}
