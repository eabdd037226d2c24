// DimReduce — gradient descent in a PCA subspace with a quasi-Newton step
//
// The parameters, flattened and concatenated in order, form a vector of n
// values. A k×n PCA matrix P (rows are principal directions of earlier
// weight trajectories) maps gradients into a k-dim subspace:
//
//   gk   = P·g                           projected gradient
//   bk   = BFGS update of the inverse Hessian from (sk, gk - gk_last)
//   dk   = -bk·gk                        subspace descent direction
//   dn   = Pᵀ·dk                         direction in parameter space
//
// A backtracking line search tries rho^0, rho^1, ... (max_search_time
// values) and keeps the first step size satisfying the Armijo condition.
// Gradient components outside the subspace accumulate in a residual
// momentum, and the final update is `alpha * momentum - rho * dn`, applied
// through the inner optimizer.
//
// With several ranks the caller averages loss and gradients first.

use std::marker::PhantomData;

use marten_core::backend::Backend;
use marten_core::tensor::Tensor;
use marten_core::{Error, GradStore, Result};

use crate::optimizer::Optimizer;

/// Hyper-parameters of [`DimReduce`].
#[derive(Debug, Clone)]
pub struct DimReduceConfig {
    /// Rows of the PCA matrix.
    pub n_components: usize,
    /// Base of the line-search step sizes.
    pub rho: f64,
    /// Weight of the `Σ w²/2` term added to the loss.
    pub ls_weight_decay: f64,
    /// Decay of the residual gradient momentum.
    pub gamma: f64,
    /// Scale of the residual momentum in the update.
    pub alpha: f64,
    /// Armijo sufficient-decrease factor.
    pub sigma: f64,
    pub max_search_time: usize,
}

impl Default for DimReduceConfig {
    fn default() -> Self {
        Self {
            n_components: 32,
            rho: 0.55,
            ls_weight_decay: 0.0001,
            gamma: 0.9,
            alpha: 0.001,
            sigma: 0.4,
            max_search_time: 3,
        }
    }
}

impl DimReduceConfig {
    pub fn n_components(mut self, k: usize) -> Self {
        self.n_components = k;
        self
    }

    pub fn rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    pub fn ls_weight_decay(mut self, wd: f64) -> Self {
        self.ls_weight_decay = wd;
        self
    }

    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }
}

/// Curvature below which the inverse Hessian is not updated.
const CURVATURE_EPSILON: f64 = 1e-20;

/// Result of one [`DimReduce::step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimReduceStep {
    /// Loss plus weight penalty before the step.
    pub old_loss: f64,
    /// Step size used for the subspace direction.
    pub rho: f64,
    /// Whether the line search accepted `rho`.
    pub accepted: bool,
}

pub struct DimReduce<B: Backend, O: Optimizer<B>> {
    config: DimReduceConfig,
    optimizer: O,
    /// k×n, row-major.
    pca_mat: Vec<f64>,
    sizes: Vec<usize>,
    gk_last: Vec<f64>,
    gk_last_init: bool,
    /// k×k, row-major.
    bk: Vec<f64>,
    sk: Vec<f64>,
    grad_res_momentum: Vec<Vec<f64>>,
    rho_list: Vec<f64>,
    _backend: PhantomData<B>,
}

impl<B: Backend, O: Optimizer<B>> DimReduce<B, O> {
    /// `pca_mat` is k×n row-major, n being the total size of `params`.
    pub fn new(optimizer: O, params: &[Tensor<B>], pca_mat: Vec<f64>, config: DimReduceConfig) -> Result<Self> {
        let k = config.n_components;
        if k == 0 || config.max_search_time == 0 {
            return Err(Error::msg("DimReduce: n_components and max_search_time must be at least 1"));
        }
        let sizes: Vec<usize> = params.iter().map(|p| p.elem_count()).collect();
        let n: usize = sizes.iter().sum();
        if n == 0 {
            return Err(Error::msg("DimReduce: no parameter values to optimize"));
        }
        if pca_mat.len() != k * n {
            return Err(Error::ElementCountMismatch {
                shape: vec![k, n].into(),
                expected: k * n,
                got: pca_mat.len(),
            });
        }
        let rho_list = (0..config.max_search_time).map(|i| config.rho.powi(i as i32)).collect();
        tracing::debug!(k, n, params = params.len(), "DimReduce initialised");
        Ok(Self {
            optimizer,
            pca_mat,
            gk_last: vec![0.0; k],
            gk_last_init: false,
            bk: identity(k),
            sk: vec![0.0; k],
            grad_res_momentum: sizes.iter().map(|&s| vec![0.0; s]).collect(),
            sizes,
            rho_list,
            config,
            _backend: PhantomData,
        })
    }

    pub fn config(&self) -> &DimReduceConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn rho_list(&self) -> &[f64] {
        &self.rho_list
    }

    pub fn bk(&self) -> &[f64] {
        &self.bk
    }

    pub fn sk(&self) -> &[f64] {
        &self.sk
    }

    pub fn gk_last(&self) -> &[f64] {
        &self.gk_last
    }

    pub fn grad_res_momentum(&self) -> &[Vec<f64>] {
        &self.grad_res_momentum
    }

    /// One DimReduce update.
    ///
    /// `loss` is the loss at the current weights and `grads` its gradients;
    /// `closure` recomputes the loss at whatever weights `params` hold.
    pub fn step<F>(&mut self, loss: f64, params: &[Tensor<B>], grads: &GradStore<B>, mut closure: F) -> Result<DimReduceStep>
    where
        F: FnMut() -> Result<f64>,
    {
        if params.len() != self.sizes.len() {
            return Err(Error::msg(format!(
                "DimReduce: built for {} parameters, got {}",
                self.sizes.len(),
                params.len()
            )));
        }
        let weights = params.iter().map(|p| p.to_f64_vec()).collect::<Result<Vec<_>>>()?;
        let grad = self.flat_grad(params, grads)?;
        let old_loss = loss + self.weight_penalty(&weights);

        let gk = self.project(&grad);
        let dk = self.quasi_newton_direction(&gk);
        let dn = self.split(&self.back_project(&dk));
        let grad_proj = self.split(&self.back_project(&gk));

        let (rho, accepted) = self.line_search(params, &weights, &gk, &dk, &dn, old_loss, &mut closure)?;

        let mut deltas = Vec::with_capacity(params.len());
        let mut offset = 0;
        for (i, size) in self.sizes.iter().enumerate() {
            let m = &mut self.grad_res_momentum[i];
            let g = &grad[offset..offset + size];
            let delta: Vec<f64> = m
                .iter_mut()
                .zip(g)
                .zip(&grad_proj[i])
                .zip(&dn[i])
                .map(|(((m, g), gp), d)| {
                    *m = self.config.gamma * *m + g - gp;
                    self.config.alpha * *m - rho * d
                })
                .collect();
            deltas.push(delta);
            offset += size;
        }
        let update = self.as_grads(params, &deltas)?;
        self.optimizer.step(params, &update)?;

        tracing::debug!(old_loss, rho, accepted, "DimReduce step");
        Ok(DimReduceStep { old_loss, rho, accepted })
    }

    fn flat_grad(&self, params: &[Tensor<B>], grads: &GradStore<B>) -> Result<Vec<f64>> {
        let mut flat = Vec::with_capacity(self.sizes.iter().sum());
        for p in params {
            let g = grads
                .get(p)
                .ok_or_else(|| Error::msg(format!("DimReduce: no gradient for parameter {:?}", p.id())))?;
            if g.elem_count() != p.elem_count() {
                return Err(Error::ShapeMismatch {
                    expected: p.shape().clone(),
                    got: g.shape().clone(),
                });
            }
            flat.extend(g.to_f64_vec()?);
        }
        Ok(flat)
    }

    fn weight_penalty(&self, weights: &[Vec<f64>]) -> f64 {
        let l2: f64 = weights.iter().flatten().map(|w| w * w / 2.0).sum();
        self.config.ls_weight_decay * l2
    }

    /// P·v
    fn project(&self, v: &[f64]) -> Vec<f64> {
        let n = v.len();
        self.pca_mat.chunks(n).map(|row| dot(row, v)).collect()
    }

    /// Pᵀ·v
    fn back_project(&self, v: &[f64]) -> Vec<f64> {
        let n: usize = self.sizes.iter().sum();
        let mut out = vec![0.0; n];
        for (row, &vi) in self.pca_mat.chunks(n).zip(v) {
            for (o, p) in out.iter_mut().zip(row) {
                *o += p * vi;
            }
        }
        out
    }

    fn split(&self, flat: &[f64]) -> Vec<Vec<f64>> {
        let mut parts = Vec::with_capacity(self.sizes.len());
        let mut offset = 0;
        for &size in &self.sizes {
            parts.push(flat[offset..offset + size].to_vec());
            offset += size;
        }
        parts
    }

    /// Update `bk` from the last step and return `-bk·gk`.
    fn quasi_newton_direction(&mut self, gk: &[f64]) -> Vec<f64> {
        let k = gk.len();
        if self.gk_last_init {
            let yk: Vec<f64> = gk.iter().zip(&self.gk_last).map(|(a, b)| a - b).collect();
            let g = dot(&yk, &self.sk);
            if g > CURVATURE_EPSILON {
                let pk = 1.0 / g;
                // t1 = I - pk·yk·skᵀ
                let mut t1 = identity(k);
                for i in 0..k {
                    for j in 0..k {
                        t1[i * k + j] -= pk * yk[i] * self.sk[j];
                    }
                }
                let t1_t = transpose(&t1, k);
                let mut bk = matmul(&matmul(&t1_t, &self.bk, k), &t1, k);
                for i in 0..k {
                    for j in 0..k {
                        bk[i * k + j] += pk * self.sk[i] * self.sk[j];
                    }
                }
                self.bk = bk;
            }
        } else {
            self.gk_last_init = true;
        }
        self.gk_last = gk.to_vec();
        self.bk.chunks(k).map(|row| -dot(row, gk)).collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn line_search<F>(
        &mut self,
        params: &[Tensor<B>],
        weights: &[Vec<f64>],
        gk: &[f64],
        dk: &[f64],
        dn: &[Vec<f64>],
        old_loss: f64,
        closure: &mut F,
    ) -> Result<(f64, bool)>
    where
        F: FnMut() -> Result<f64>,
    {
        let slope = dot(gk, dk);
        for i in 0..self.rho_list.len() {
            let rho = self.rho_list[i];
            let trial: Vec<Vec<f64>> = dn.iter().map(|d| d.iter().map(|v| -rho * v).collect()).collect();
            let trial = self.as_grads(params, &trial)?;
            self.optimizer.step(params, &trial)?;

            let moved = params.iter().map(|p| p.to_f64_vec()).collect::<Result<Vec<_>>>()?;
            let new_loss = closure()? + self.weight_penalty(&moved);
            let accepted = old_loss + self.config.sigma * rho * slope > new_loss;
            if accepted {
                self.sk = dk.iter().map(|v| rho * v).collect();
            }
            for (p, w) in params.iter().zip(weights) {
                p.update_data_inplace(w)?;
            }
            tracing::trace!(rho, new_loss, accepted, "DimReduce line search");
            if accepted {
                return Ok((rho, true));
            }
        }
        let last = self.rho_list[self.rho_list.len() - 1];
        Ok((last, false))
    }

    /// Per-parameter values as a gradient store for the inner optimizer.
    fn as_grads(&self, params: &[Tensor<B>], values: &[Vec<f64>]) -> Result<GradStore<B>> {
        let mut store = GradStore::new();
        for (p, v) in params.iter().zip(values) {
            let t = Tensor::<B>::from_f64_slice(v, p.shape().clone(), p.dtype(), p.device())?;
            store.insert(p.id(), t);
        }
        Ok(store)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn identity(k: usize) -> Vec<f64> {
    let mut m = vec![0.0; k * k];
    for i in 0..k {
        m[i * k + i] = 1.0;
    }
    m
}

fn transpose(m: &[f64], k: usize) -> Vec<f64> {
    let mut t = vec![0.0; k * k];
    for i in 0..k {
        for j in 0..k {
            t[j * k + i] = m[i * k + j];
        }
    }
    t
}

/// k×k square product.
fn matmul(a: &[f64], b: &[f64], k: usize) -> Vec<f64> {
    let mut out = vec![0.0; k * k];
    for i in 0..k {
        for l in 0..k {
            let a_il = a[i * k + l];
            for j in 0..k {
                out[i * k + j] += a_il * b[l * k + j];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_helpers() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(transpose(&a, 2), vec![1.0, 3.0, 2.0, 4.0]);
        assert_eq!(matmul(&a, &identity(2), 2), a);
        assert_eq!(matmul(&a, &a, 2), vec![7.0, 10.0, 15.0, 22.0]);
        assert_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
    }
}
