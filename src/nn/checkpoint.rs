//! Activation checkpointing.
//!
//! The wrapped function runs once without recording a graph. During
//! backward it is replayed on fresh leaves carrying the saved input values
//! and differentiated on the spot. Parameters and gates the function
//! captures receive their gradients during that replay; gradients for the
//! explicit inputs flow on through the outer graph.

use crate::error::Result;
use crate::ops::Operation;
use crate::tensor::{no_grad, Tensor};
use ndarray::{ArrayD, IxDyn};
use std::any::Any;
use std::sync::{Arc, Mutex};

/// A pure function of its inputs; it must produce identical values when
/// called again with identical inputs.
pub type ReplayFn = dyn Fn(&[Tensor]) -> Result<Tensor> + Send + Sync;

pub struct Checkpoint {
    f: Arc<ReplayFn>,
    first_pass: Mutex<Option<ArrayD<f32>>>,
}

impl Checkpoint {
    fn leaves(inputs: &[Tensor]) -> Vec<Tensor> {
        inputs
            .iter()
            .map(|t| {
                let lock = t.lock();
                Tensor::new(lock.data.clone(), lock.requires_grad)
                    .with_placement(lock.dtype, lock.device)
            })
            .collect()
    }
}

impl Operation for Checkpoint {
    fn forward(&self, inputs: &[Tensor], output: &mut ArrayD<f32>) {
        let taken = self
            .first_pass
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        *output = match taken {
            Some(v) => v,
            None => match no_grad(|| (self.f)(inputs)) {
                Ok(t) => t.array(),
                Err(e) => {
                    log::error!("checkpointed forward failed: {}", e);
                    ArrayD::zeros(IxDyn(&[0]))
                }
            },
        };
    }

    fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        let leaves = Checkpoint::leaves(inputs);
        match (self.f)(&leaves) {
            Ok(out) => out.backward_with_grad(output_grad.clone()),
            Err(e) => panic!("checkpoint replay failed after a successful forward: {}", e),
        }
        leaves
            .iter()
            .zip(inputs)
            .map(|(leaf, t)| {
                leaf.grad()
                    .unwrap_or_else(|| ArrayD::zeros(IxDyn(&t.shape())))
            })
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Runs `f(inputs)` without keeping its intermediate activations.
///
/// # Panics
///
/// Backward panics if the replay of `f` returns an error. The first pass
/// succeeded, so a failing replay means `f` is not pure.
pub fn checkpoint(f: Arc<ReplayFn>, inputs: &[Tensor]) -> Result<Tensor> {
    let first = no_grad(|| f(inputs))?;
    let (dtype, device) = (first.dtype(), first.device());
    let op = Checkpoint {
        f,
        first_pass: Mutex::new(Some(first.array())),
    };
    Ok(Tensor::apply_tracked(Arc::new(op), inputs).with_placement(dtype, device))
}
