// Tests for marten-optim: DimReduce driving an inner optimizer

use marten_core::{DType, Error, GradStore, Result, Tensor};
use marten_cpu::{CpuBackend, CpuDevice};
use marten_optim::{DimReduce, DimReduceConfig, Momentum, Optimizer, Sgd};

type T = Tensor<CpuBackend>;

fn param(data: &[f64]) -> T {
    T::from_f64_slice(data, vec![data.len()], DType::F64, &CpuDevice).unwrap()
}

/// `Σ w²/2` and its gradient `w`.
fn quadratic(p: &T) -> Result<(f64, GradStore<CpuBackend>)> {
    let w = p.to_f64_vec()?;
    let loss = w.iter().map(|v| v * v / 2.0).sum();
    let mut grads = GradStore::new();
    grads.insert(p.id(), param(&w));
    Ok((loss, grads))
}

fn loss_of(p: &T) -> impl FnMut() -> Result<f64> + '_ {
    move || Ok(quadratic(p)?.0)
}

fn config(rho: f64) -> DimReduceConfig {
    DimReduceConfig::default()
        .n_components(1)
        .rho(rho)
        .ls_weight_decay(0.0)
        .gamma(0.0)
        .alpha(0.1)
        .sigma(0.4)
}

fn assert_close(got: &[f64], expected: &[f64]) {
    assert_eq!(got.len(), expected.len());
    for (g, e) in got.iter().zip(expected) {
        assert!((g - e).abs() < 1e-9, "got {got:?}, expected {expected:?}");
    }
}

#[test]
fn test_dim_reduce_accepts_full_step() {
    let p = param(&[1.0, 1.0]);
    let mut opt = DimReduce::new(Sgd::new(1.0), &[p.clone()], vec![1.0, 0.0], config(0.5)).unwrap();
    assert_close(opt.rho_list(), &[1.0, 0.5, 0.25]);

    let (loss, grads) = quadratic(&p).unwrap();
    let step = opt.step(loss, &[p.clone()], &grads, loss_of(&p)).unwrap();
    assert!(step.accepted);
    assert_eq!(step.rho, 1.0);
    assert_close(&[step.old_loss], &[1.0]);

    // gk = 1, dk = -1: the subspace coordinate is solved exactly and the
    // residual direction moves by alpha.
    assert_close(&p.to_f64_vec().unwrap(), &[0.0, 0.9]);
    assert_close(opt.sk(), &[-1.0]);
    assert_close(opt.gk_last(), &[1.0]);
    assert_close(&opt.grad_res_momentum()[0], &[0.0, 1.0]);
}

#[test]
fn test_dim_reduce_updates_inverse_hessian() {
    let p = param(&[1.0, 1.0]);
    let mut opt = DimReduce::new(Sgd::new(1.0), &[p.clone()], vec![1.0, 0.0], config(0.5)).unwrap();
    for _ in 0..2 {
        let (loss, grads) = quadratic(&p).unwrap();
        opt.step(loss, &[p.clone()], &grads, loss_of(&p)).unwrap();
    }
    // yk = -1, sk = -1: curvature 1 keeps bk at the identity.
    assert_close(opt.bk(), &[1.0]);
    assert_close(opt.gk_last(), &[0.0]);
}

#[test]
fn test_dim_reduce_rejected_search_uses_last_rho() {
    let p = param(&[1.0, 1.0]);
    let mut opt = DimReduce::new(Sgd::new(1.0), &[p.clone()], vec![1.0, 0.0], config(0.5)).unwrap();
    let (loss, grads) = quadratic(&p).unwrap();
    let step = opt.step(loss, &[p.clone()], &grads, || Ok(100.0)).unwrap();
    assert!(!step.accepted);
    assert_eq!(step.rho, 0.25);
    assert_close(opt.sk(), &[0.0]);
    // Trials are undone; only the final delta (0.25, 0.1) applies.
    assert_close(&p.to_f64_vec().unwrap(), &[0.75, 0.9]);
}

#[test]
fn test_dim_reduce_with_momentum_inner() {
    let p = param(&[2.0, -1.0]);
    let q = param(&[0.5]);
    let pca = vec![0.6, 0.0, 0.8, 0.0, 1.0, 0.0];
    let cfg = DimReduceConfig::default().n_components(2).ls_weight_decay(0.01);
    let mut opt = DimReduce::new(Momentum::new(0.1, 0.9), &[p.clone(), q.clone()], pca, cfg).unwrap();
    let mut grads = GradStore::new();
    grads.insert(p.id(), param(&[2.0, -1.0]));
    grads.insert(q.id(), param(&[0.5]));
    let before = p.to_f64_vec().unwrap();
    opt.step(1.0, &[p.clone(), q.clone()], &grads, || Ok(0.5)).unwrap();
    assert_ne!(p.to_f64_vec().unwrap(), before);
    assert_eq!(opt.bk().len(), 4);
    assert_eq!(<Momentum as Optimizer<CpuBackend>>::learning_rate(opt.optimizer()), 0.1);
}

#[test]
fn test_dim_reduce_rejects_bad_inputs() {
    let p = param(&[1.0, 1.0]);
    let err = DimReduce::new(Sgd::new(1.0), &[p.clone()], vec![1.0], config(0.5)).err().unwrap();
    assert!(matches!(err, Error::ElementCountMismatch { expected: 2, got: 1, .. }));

    let mut opt = DimReduce::new(Sgd::new(1.0), &[p.clone()], vec![1.0, 0.0], config(0.5)).unwrap();
    let empty = GradStore::new();
    assert!(opt.step(1.0, &[p.clone()], &empty, || Ok(0.0)).is_err());
    assert!(opt.step(1.0, &[], &empty, || Ok(0.0)).is_err());
}
