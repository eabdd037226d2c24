// Optimizer trait and the first-order optimizers
//
// Parameters are updated in place through `Tensor::update_data_inplace`, so
// every clone of a parameter (the model's, the optimizer caller's) sees the
// new values. Parameters without a gradient are left untouched.

use std::collections::HashMap;

use marten_core::backend::Backend;
use marten_core::op::TensorId;
use marten_core::tensor::Tensor;
use marten_core::{Error, GradStore, Result};

pub trait Optimizer<B: Backend> {
    /// Apply one update to `params` from `grads`.
    fn step(&mut self, params: &[Tensor<B>], grads: &GradStore<B>) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

/// Host copies of a parameter and its gradient, with matching sizes.
pub(crate) fn param_and_grad<B: Backend>(param: &Tensor<B>, grad: &Tensor<B>) -> Result<(Vec<f64>, Vec<f64>)> {
    if param.dims() != grad.dims() {
        return Err(Error::ShapeMismatch {
            expected: param.shape().clone(),
            got: grad.shape().clone(),
        });
    }
    Ok((param.to_f64_vec()?, grad.to_f64_vec()?))
}

/// Plain gradient descent: `w -= lr * (g + weight_decay * w)`.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub lr: f64,
    pub weight_decay: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { lr, weight_decay: 0.0 }
    }

    pub fn weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }
}

impl<B: Backend> Optimizer<B> for Sgd {
    fn step(&mut self, params: &[Tensor<B>], grads: &GradStore<B>) -> Result<()> {
        for param in params {
            let Some(grad) = grads.get(param) else {
                continue;
            };
            let (mut w, g) = param_and_grad(param, grad)?;
            for (w, g) in w.iter_mut().zip(&g) {
                *w -= self.lr * (g + self.weight_decay * *w);
            }
            param.update_data_inplace(&w)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Gradient descent with a velocity per parameter:
///
/// ```text
/// v = momentum * v + g
/// w -= lr * (nesterov ? g + momentum * v : v)
/// ```
#[derive(Debug, Clone)]
pub struct Momentum {
    pub lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
    pub weight_decay: f64,
    velocity: HashMap<TensorId, Vec<f64>>,
}

impl Momentum {
    pub fn new(lr: f64, momentum: f64) -> Self {
        Self {
            lr,
            momentum,
            nesterov: false,
            weight_decay: 0.0,
            velocity: HashMap::new(),
        }
    }

    pub fn nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    pub fn weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    pub fn velocity(&self, id: TensorId) -> Option<&[f64]> {
        self.velocity.get(&id).map(Vec::as_slice)
    }
}

impl<B: Backend> Optimizer<B> for Momentum {
    fn step(&mut self, params: &[Tensor<B>], grads: &GradStore<B>) -> Result<()> {
        for param in params {
            let Some(grad) = grads.get(param) else {
                continue;
            };
            let (mut w, g) = param_and_grad(param, grad)?;
            let v = self
                .velocity
                .entry(param.id())
                .or_insert_with(|| vec![0.0; w.len()]);
            for ((w, g), v) in w.iter_mut().zip(&g).zip(v.iter_mut()) {
                let g = g + self.weight_decay * *w;
                *v = self.momentum * *v + g;
                let update = if self.nesterov { g + self.momentum * *v } else { *v };
                *w -= self.lr * update;
            }
            param.update_data_inplace(&w)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::DType;
    use marten_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;

    fn param(data: &[f64]) -> T {
        T::from_f64_slice(data, vec![data.len()], DType::F64, &CpuDevice).unwrap()
    }

    fn grads_for(p: &T, g: &[f64]) -> GradStore<CpuBackend> {
        let mut store = GradStore::new();
        store.insert(p.id(), param(g));
        store
    }

    #[test]
    fn test_sgd_step() {
        let p = param(&[1.0, 2.0]);
        let mut opt = Sgd::new(0.1);
        opt.step(&[p.clone()], &grads_for(&p, &[0.5, -0.5])).unwrap();
        let w = p.to_f64_vec().unwrap();
        assert!((w[0] - 0.95).abs() < 1e-12);
        assert!((w[1] - 2.05).abs() < 1e-12);
    }

    #[test]
    fn test_sgd_weight_decay_and_missing_grad() {
        let p = param(&[1.0]);
        let q = param(&[3.0]);
        let mut opt = Sgd::new(0.5).weight_decay(0.2);
        opt.step(&[p.clone(), q.clone()], &grads_for(&p, &[0.0])).unwrap();
        assert!((p.to_f64_vec().unwrap()[0] - 0.9).abs() < 1e-12);
        assert_eq!(q.to_f64_vec().unwrap(), vec![3.0]);
    }

    #[test]
    fn test_momentum_accumulates_velocity() {
        let p = param(&[0.0]);
        let mut opt = Momentum::new(1.0, 0.9);
        let grads = grads_for(&p, &[1.0]);
        opt.step(&[p.clone()], &grads).unwrap();
        opt.step(&[p.clone()], &grads).unwrap();
        // v1 = 1, v2 = 1.9
        assert!((p.to_f64_vec().unwrap()[0] + 2.9).abs() < 1e-12);
        assert!((opt.velocity(p.id()).unwrap()[0] - 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_nesterov_looks_ahead() {
        let p = param(&[0.0]);
        let mut opt = Momentum::new(1.0, 0.5).nesterov(true);
        opt.step(&[p.clone()], &grads_for(&p, &[1.0])).unwrap();
        // v = 1, update = 1 + 0.5
        assert!((p.to_f64_vec().unwrap()[0] + 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_shape_mismatch() {
        let p = param(&[1.0, 2.0]);
        let mut opt = Sgd::new(0.1);
        <Sgd as Optimizer<CpuBackend>>::set_learning_rate(&mut opt, 0.2);
        assert_eq!(<Sgd as Optimizer<CpuBackend>>::learning_rate(&opt), 0.2);
        assert!(opt.step(&[p.clone()], &grads_for(&p, &[1.0])).is_err());
    }
}
