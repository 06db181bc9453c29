use crate::tensor::Tensor;
use ndarray::ArrayD;
use std::collections::HashMap;

/// A trait for optimizers.
pub trait Optimizer {
    /// Performs a single optimization step.
    fn step(&mut self, parameters: &[Tensor]);

    /// Sets the gradients of all parameters to zero.
    fn zero_grad(&mut self, parameters: &[Tensor]) {
        for param in parameters {
            param.zero_grad();
        }
    }
}

/// Stochastic gradient descent with momentum.
pub struct SGD {
    lr: f32,
    momentum: f32,
    velocity: HashMap<Tensor, ArrayD<f32>>,
}

impl SGD {
    pub fn new(lr: f32, momentum: f32) -> Self {
        SGD {
            lr,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, parameters: &[Tensor]) {
        for param in parameters {
            let mut param_lock = param.lock();
            let Some(grad) = param_lock.grad.clone() else {
                continue;
            };
            let velocity = self
                .velocity
                .entry(param.clone())
                .or_insert_with(|| ArrayD::zeros(grad.dim()));
            *velocity = &*velocity * self.momentum + &grad * (1.0 - self.momentum);
            let update = velocity.mapv(|v| v * self.lr);
            param_lock.data -= &update;
        }
    }
}

/// Adam optimizer.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: usize,
    m: HashMap<Tensor, ArrayD<f32>>,
    v: HashMap<Tensor, ArrayD<f32>>,
}

impl Adam {
    pub fn new(lr: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Adam {
            lr,
            beta1,
            beta2,
            eps,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, parameters: &[Tensor]) {
        self.t += 1;
        for param in parameters {
            let mut param_lock = param.lock();
            let Some(grad) = param_lock.grad.clone() else {
                continue;
            };
            let m = self
                .m
                .entry(param.clone())
                .or_insert_with(|| ArrayD::zeros(grad.dim()));
            *m = &*m * self.beta1 + &grad * (1.0 - self.beta1);
            let m_hat = &*m / (1.0 - self.beta1.powi(self.t as i32));

            let v = self
                .v
                .entry(param.clone())
                .or_insert_with(|| ArrayD::zeros(grad.dim()));
            *v = &*v * self.beta2 + &(&grad * &grad) * (1.0 - self.beta2);
            let v_hat = &*v / (1.0 - self.beta2.powi(self.t as i32));

            let update = (m_hat / (v_hat.mapv(|x| x.sqrt()) + self.eps)) * self.lr;
            param_lock.data -= &update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn sgd_moves_against_gradient() {
        let p = Tensor::new(arr1(&[1.0f32, -1.0]).into_dyn(), true);
        p.sum().backward();
        let mut opt = SGD::new(0.5, 0.0);
        opt.step(&[p.clone()]);
        assert_eq!(p.array(), arr1(&[0.5f32, -1.5]).into_dyn());
        opt.zero_grad(&[p.clone()]);
        assert!(p.grad().is_none());
    }

    #[test]
    fn adam_first_step_is_lr_sized() {
        let p = Tensor::new(arr1(&[0.0f32]).into_dyn(), true);
        p.scale(3.0).sum().backward();
        let mut opt = Adam::new(0.1, 0.9, 0.999, 1e-8);
        opt.step(&[p.clone()]);
        assert!((p.array()[[0]] + 0.1).abs() < 1e-4);
    }
}
