//! Linear projections with an optional structural gate.
//!
//! `GatedLinear` is a base weight plus a low-rank adapter whose rank axis is
//! the gated structure:
//!
//! ```text
//! y = x W + ((x A) * gate * mask) B
//! ```
//!
//! The surrounding engine treats projections only through `GatedProjection`,
//! so any other gated transform with the same contract can be swapped in.

use crate::error::{Error, Result};
use crate::nn::init_uniform;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Execution-mode flags for architecture-search training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardMode {
    /// Keep only the first `k` adapter ranks (nested ordering).
    pub iterative_order: Option<usize>,
    /// `false` selects the search path: the base weight is used detached so
    /// gradients reach only the adapter and the gate.
    pub main_forward: bool,
}

impl Default for ForwardMode {
    fn default() -> Self {
        ForwardMode {
            iterative_order: None,
            main_forward: true,
        }
    }
}

/// A linear map with optional per-call gate and dimension mask. Neither the
/// gate, the mask nor the mode may change the output shape.
pub trait GatedProjection: Send + Sync {
    fn forward(
        &self,
        input: &Tensor,
        gate: Option<&Tensor>,
        mask: Option<&Tensor>,
        mode: ForwardMode,
    ) -> Result<Tensor>;

    fn parameters(&self) -> Vec<Tensor>;

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("{}param{}", prefix, i), p))
            .collect()
    }
}

/// Which projection a factory is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectionKind {
    Query,
    Key,
    Value,
    Output,
    FfIn,
    FfOut,
}

/// Builds the projections of a model from their site and in/out widths.
pub type ProjectionFactory<'a> =
    dyn FnMut(ProjectionSite, usize, usize) -> Box<dyn GatedProjection> + 'a;

/// Location of a projection in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProjectionSite {
    pub kind: ProjectionKind,
    pub layer: usize,
    pub decoder: bool,
    pub cross: bool,
}

pub struct GatedLinear {
    pub weight: Tensor,
    pub lora_a: Tensor,
    pub lora_b: Tensor,
}

impl GatedLinear {
    /// Creates a projection with uniformly initialised base and adapter
    /// weights.
    pub fn new(in_features: usize, out_features: usize, rank: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        GatedLinear {
            weight: init_uniform(&[in_features, out_features], bound, rng),
            lora_a: init_uniform(&[in_features, rank], bound, rng),
            lora_b: init_uniform(&[rank, out_features], 0.02, rng),
        }
    }

    pub fn rank(&self) -> usize {
        self.lora_a.shape()[1]
    }

    // Restrict a per-rank gate or mask to the active ranks.
    fn active(t: &Tensor, full_rank: usize, keep: usize) -> Result<Tensor> {
        let shape = t.shape();
        match shape.last() {
            Some(&last) if last == full_rank && keep < full_rank => {
                t.narrow(shape.len() - 1, 0, keep)
            }
            _ => Ok(t.clone()),
        }
    }
}

impl GatedProjection for GatedLinear {
    fn forward(
        &self,
        input: &Tensor,
        gate: Option<&Tensor>,
        mask: Option<&Tensor>,
        mode: ForwardMode,
    ) -> Result<Tensor> {
        let weight = if mode.main_forward {
            self.weight.clone()
        } else {
            self.weight.detach()
        };
        let base = input.linear(&weight)?;
        let rank = self.rank();
        if rank == 0 {
            return Ok(base);
        }
        let keep = match mode.iterative_order {
            Some(k) if k > rank => {
                return Err(Error::InvalidConfiguration(format!(
                    "iterative_order {} exceeds adapter rank {}",
                    k, rank
                )))
            }
            Some(k) => k,
            None => rank,
        };
        if keep == 0 {
            return Ok(base);
        }
        let a = self.lora_a.narrow(1, 0, keep)?;
        let b = self.lora_b.narrow(0, 0, keep)?;
        let mut low = input.linear(&a)?;
        if let Some(g) = gate {
            low = low.mul(&Self::active(g, rank, keep)?);
        }
        if let Some(m) = mask {
            low = low.mul(&Self::active(m, rank, keep)?);
        }
        Ok(base.add(&low.linear(&b)?))
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.lora_a.clone(), self.lora_b.clone()]
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        vec![
            (format!("{}weight", prefix), self.weight.clone()),
            (format!("{}lora_a", prefix), self.lora_a.clone()),
            (format!("{}lora_b", prefix), self.lora_b.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::tests::common::{assert_close, random_tensor};
    use ndarray::arr1;
    use rand::SeedableRng;

    fn projection() -> GatedLinear {
        let mut rng = StdRng::seed_from_u64(7);
        GatedLinear::new(4, 3, 2, &mut rng)
    }

    fn per_rank(values: &[f32], requires_grad: bool) -> Tensor {
        Tensor::new(arr1(values).into_dyn(), requires_grad)
    }

    #[test]
    fn zero_gate_leaves_the_base_map() {
        let p = projection();
        let x = random_tensor(&[3, 4], 1);
        let zero = per_rank(&[0.0, 0.0], false);
        let out = p.forward(&x, Some(&zero), None, ForwardMode::default()).unwrap();
        assert_close(&out.array(), &x.linear(&p.weight).unwrap().array(), 1e-6);

        // No gate runs the full adapter, the same as an all-ones gate.
        let ungated = p.forward(&x, None, None, ForwardMode::default()).unwrap();
        let ones = per_rank(&[1.0, 1.0], false);
        let open = p.forward(&x, Some(&ones), None, ForwardMode::default()).unwrap();
        assert_close(&ungated.array(), &open.array(), 1e-6);
        assert!((&ungated.array() - &out.array()).iter().any(|d| d.abs() > 1e-6));
    }

    #[test]
    fn mask_drops_its_ranks() {
        let p = projection();
        let x = random_tensor(&[3, 4], 2);
        let ones = per_rank(&[1.0, 1.0], false);
        let first_only = per_rank(&[1.0, 0.0], false);
        let masked = p
            .forward(&x, Some(&ones), Some(&first_only), ForwardMode::default())
            .unwrap();
        let gated = p.forward(&x, Some(&first_only), None, ForwardMode::default()).unwrap();
        assert_close(&masked.array(), &gated.array(), 1e-6);
    }

    #[test]
    fn iterative_order_keeps_leading_ranks() {
        let p = projection();
        let x = random_tensor(&[3, 4], 3);
        let gate = per_rank(&[1.0, 1.0], true);
        let mode = ForwardMode {
            iterative_order: Some(1),
            main_forward: true,
        };
        let narrowed = p.forward(&x, Some(&gate), None, mode).unwrap();
        let first_only = per_rank(&[1.0, 0.0], false);
        let expected = p.forward(&x, Some(&first_only), None, ForwardMode::default()).unwrap();
        assert_close(&narrowed.array(), &expected.array(), 1e-6);
        assert_eq!(narrowed.shape(), vec![3, 3]);

        narrowed.sum().backward();
        let g = gate.grad().expect("gate grad");
        assert_eq!(g[[1]], 0.0);

        let too_deep = ForwardMode {
            iterative_order: Some(3),
            main_forward: true,
        };
        assert!(matches!(
            p.forward(&x, None, None, too_deep),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn search_path_detaches_the_base_weight() {
        let p = projection();
        let x = random_tensor(&[3, 4], 4);
        let gate = per_rank(&[0.5, 1.0], true);
        let search = ForwardMode {
            iterative_order: None,
            main_forward: false,
        };
        let out = p.forward(&x, Some(&gate), None, search).unwrap();
        let main = p.forward(&x, Some(&gate), None, ForwardMode::default()).unwrap();
        assert_close(&out.array(), &main.array(), 1e-6);

        p.weight.zero_grad();
        out.sum().backward();
        assert!(p.weight.grad().map_or(true, |g| g.iter().all(|v| *v == 0.0)));
        assert!(p.lora_a.grad().is_some());
        assert!(gate.grad().is_some());
    }
}
