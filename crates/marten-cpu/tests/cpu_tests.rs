use marten_core::{DType, Error, Result, Tensor};
use marten_cpu::{set_seed, CpuBackend, CpuDevice, CpuTensor, DynamicMemPool};

const DEV: CpuDevice = CpuDevice;

fn t(data: &[f64], shape: &[usize]) -> CpuTensor {
    Tensor::from_f64_slice(data, shape, DType::F64, &DEV).unwrap()
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < tol, "index {}: {} vs {}", i, x, y);
    }
}

/// Compare `backward()` against central differences for every input.
fn grad_check(inputs: &[CpuTensor], f: impl Fn(&[CpuTensor]) -> Result<CpuTensor>) {
    let vars: Vec<CpuTensor> = inputs.iter().map(|x| x.clone().set_variable()).collect();
    let loss = f(&vars).unwrap();
    let grads = loss.backward().unwrap();
    let h = 1e-6;
    for (k, var) in vars.iter().enumerate() {
        let base = var.to_f64_vec().unwrap();
        let analytic = match grads.get(var) {
            Some(g) => g.to_f64_vec().unwrap(),
            None => vec![0.0; base.len()],
        };
        for i in 0..base.len() {
            let eval = |delta: f64| {
                let mut data = base.clone();
                data[i] += delta;
                let mut probe = vars.clone();
                probe[k] = t(&data, var.dims());
                f(&probe).unwrap().to_scalar_f64().unwrap()
            };
            let numeric = (eval(h) - eval(-h)) / (2.0 * h);
            assert!(
                (numeric - analytic[i]).abs() < 1e-3,
                "input {} element {}: numeric {} analytic {}",
                k,
                i,
                numeric,
                analytic[i]
            );
        }
    }
}

fn randn(shape: &[usize]) -> CpuTensor {
    Tensor::randn(shape, DType::F64, &DEV).unwrap()
}

// Forward ops

#[test]
fn test_broadcast_add() {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let b = t(&[10.0, 20.0, 30.0], &[3]);
    assert_eq!(a.add(&b).unwrap().to_f64_vec().unwrap(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
}

#[test]
fn test_matmul_and_transpose_view() {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let at = a.t().unwrap();
    assert!(at.shares_storage(&a));
    assert!(!at.is_contiguous());
    let c = a.matmul(&at).unwrap();
    assert_eq!(c.dims(), &[2, 2]);
    assert_eq!(c.to_f64_vec().unwrap(), vec![14.0, 32.0, 32.0, 77.0]);
}

#[test]
fn test_matmul_inner_mismatch() {
    let a = t(&[0.0; 6], &[2, 3]);
    let b = t(&[0.0; 4], &[2, 2]);
    assert!(matches!(a.matmul(&b), Err(Error::MatmulShapeMismatch { k1: 3, k2: 2, .. })));
}

#[test]
fn test_reductions() {
    let a = t(&[1.0, 5.0, 3.0, 4.0, 2.0, 6.0], &[2, 3]);
    assert_eq!(a.sum(1, false).unwrap().to_f64_vec().unwrap(), vec![9.0, 12.0]);
    assert_eq!(a.mean(0, true).unwrap().dims(), &[1, 3]);
    assert_eq!(a.max(1, false).unwrap().to_f64_vec().unwrap(), vec![5.0, 6.0]);
    let am = a.argmax(1, false).unwrap();
    assert_eq!(am.dtype(), DType::I64);
    assert_eq!(am.to_f64_vec().unwrap(), vec![1.0, 2.0]);
    assert_eq!(a.sum_all().unwrap().to_scalar_f64().unwrap(), 21.0);
}

#[test]
fn test_comparisons_are_u8() {
    let a = t(&[1.0, 2.0, 3.0], &[3]);
    let b = t(&[2.0], &[1]);
    let m = a.ge(&b).unwrap();
    assert_eq!(m.dtype(), DType::U8);
    assert_eq!(m.to_f64_vec().unwrap(), vec![0.0, 1.0, 1.0]);
}

#[test]
fn test_round_half_even() {
    let a = t(&[0.5, 1.5, 2.5, -0.5, -2.5], &[5]);
    assert_eq!(a.round().unwrap().to_f64_vec().unwrap(), vec![0.0, 2.0, 2.0, 0.0, -2.0]);
}

#[test]
fn test_softmax_rows_sum_to_one() {
    let a = randn(&[4, 5]);
    let s = a.softmax(1).unwrap().sum(1, false).unwrap();
    assert_close(&s.to_f64_vec().unwrap(), &[1.0; 4], 1e-12);
}

#[test]
fn test_cat_pad_gather_index_select() {
    let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let b = t(&[5.0, 6.0], &[1, 2]);
    let c = Tensor::cat(&[a.clone(), b], 0).unwrap();
    assert_eq!(c.dims(), &[3, 2]);
    assert_eq!(c.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    let p = a.pad(&[[0, 0], [1, 1]], 0.0).unwrap();
    assert_eq!(p.to_f64_vec().unwrap(), vec![0.0, 1.0, 2.0, 0.0, 0.0, 3.0, 4.0, 0.0]);

    let idx = Tensor::<CpuBackend>::from_slice(&[1i64, 0, 0, 1], (2, 2), &DEV).unwrap();
    assert_eq!(a.gather(1, &idx).unwrap().to_f64_vec().unwrap(), vec![2.0, 1.0, 3.0, 4.0]);

    let rows = Tensor::<CpuBackend>::from_slice(&[1i64, 1], 2, &DEV).unwrap();
    assert_eq!(a.index_select(0, &rows).unwrap().to_f64_vec().unwrap(), vec![3.0, 4.0, 3.0, 4.0]);
}

#[test]
fn test_update_data_inplace_is_shared() {
    let w = t(&[1.0, 2.0], &[2]).set_variable();
    let alias = w.clone();
    w.update_data_inplace(&[7.0, 8.0]).unwrap();
    assert_eq!(alias.to_f64_vec().unwrap(), vec![7.0, 8.0]);
    assert!(w.update_data_inplace(&[1.0]).is_err());
}

#[test]
fn test_half_precision_roundtrip() {
    let a = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.5], 2, DType::F16, &DEV).unwrap();
    let b = a.mul(&a).unwrap();
    assert_eq!(b.dtype(), DType::F16);
    assert_eq!(b.to_f64_vec().unwrap(), vec![1.0, 6.25]);
    assert_eq!(b.to_dtype(DType::F32).unwrap().dtype(), DType::F32);
}

#[test]
fn test_from_slice_takes_dtype_from_element_type() {
    let h = [half::f16::from_f64(0.5), half::f16::from_f64(-2.0)];
    let a = Tensor::<CpuBackend>::from_slice(&h, 2, &DEV).unwrap();
    assert_eq!(a.dtype(), DType::F16);
    assert_eq!(a.to_f64_vec().unwrap(), vec![0.5, -2.0]);

    let b = Tensor::<CpuBackend>::from_slice(&[3i64, -1, 7], 3, &DEV).unwrap();
    assert_eq!(b.dtype(), DType::I64);
    assert_eq!(b.to_f64_vec().unwrap(), vec![3.0, -1.0, 7.0]);

    let c = Tensor::<CpuBackend>::from_slice(&[half::bf16::from_f64(1.5)], (), &DEV).unwrap();
    assert_eq!(c.dtype(), DType::BF16);
    assert_eq!(c.to_scalar_f64().unwrap(), 1.5);
}

#[test]
fn test_seeded_randn_is_reproducible() {
    set_seed(42);
    let a = randn(&[8]).to_f64_vec().unwrap();
    set_seed(42);
    let b = randn(&[8]).to_f64_vec().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_backward_requires_scalar() {
    let a = t(&[1.0, 2.0], &[2]).set_variable();
    assert!(matches!(a.exp().unwrap().backward(), Err(Error::NotAScalar { .. })));
}

// Gradient checks

#[test]
fn test_grad_binary_broadcast() {
    let a = randn(&[2, 3]);
    let b = randn(&[3]);
    grad_check(&[a.clone(), b.clone()], |x| x[0].mul(&x[1])?.add(&x[1])?.sum_all());
    let denom = b.abs().unwrap().affine(1.0, 1.0).unwrap();
    grad_check(&[a, denom], |x| x[0].div(&x[1])?.sub(&x[1])?.sum_all());
}

#[test]
fn test_grad_maximum_minimum_pow() {
    let a = randn(&[5]);
    let b = randn(&[5]);
    grad_check(&[a.clone(), b.clone()], |x| x[0].maximum(&x[1])?.sum_all());
    grad_check(&[a.clone(), b.clone()], |x| x[0].minimum(&x[1])?.sum_all());
    let pos = a.abs().unwrap().affine(1.0, 0.5).unwrap();
    grad_check(&[pos, b], |x| x[0].pow(&x[1])?.sum_all());
}

#[test]
fn test_grad_unary() {
    let x = randn(&[6]);
    let pos = x.abs().unwrap().affine(1.0, 0.1).unwrap();
    grad_check(&[x.clone()], |v| v[0].exp()?.sum_all());
    grad_check(&[pos.clone()], |v| v[0].log()?.add(&v[0].sqrt()?)?.sum_all());
    grad_check(&[x.clone()], |v| v[0].tanh()?.add(&v[0].sigmoid()?)?.sum_all());
    grad_check(&[x.clone()], |v| v[0].gelu()?.add(&v[0].silu()?)?.sum_all());
    grad_check(&[x.clone()], |v| v[0].sin()?.mul(&v[0].cos()?)?.sum_all());
    grad_check(&[pos], |v| v[0].recip()?.add(&v[0].square()?)?.sum_all());
    grad_check(&[x], |v| v[0].powf(3.0)?.affine(2.0, 1.0)?.sum_all());
}

#[test]
fn test_grad_piecewise_constant_is_zero() {
    let x = randn(&[4]).set_variable();
    let g = x.floor().unwrap().add(&x.round().unwrap()).unwrap().sum_all().unwrap().backward().unwrap();
    assert_eq!(g.get(&x).unwrap().to_f64_vec().unwrap(), vec![0.0; 4]);
}

#[test]
fn test_grad_reductions() {
    let x = randn(&[3, 4]);
    grad_check(&[x.clone()], |v| v[0].sum(1, false)?.square()?.sum_all());
    grad_check(&[x.clone()], |v| v[0].mean(0, true)?.exp()?.sum_all());
    grad_check(&[x.clone()], |v| v[0].max(1, false)?.sum_all());
    grad_check(&[x], |v| v[0].min(0, true)?.mean_all());
}

#[test]
fn test_grad_matmul_batched() {
    let a = randn(&[2, 3, 4]);
    let b = randn(&[4, 2]);
    grad_check(&[a, b], |x| x[0].matmul(&x[1])?.tanh()?.sum_all());
}

#[test]
fn test_grad_views() {
    let x = randn(&[2, 3, 4]);
    grad_check(&[x.clone()], |v| v[0].permute(&[2, 0, 1])?.narrow(0, 1, 2)?.exp()?.sum_all());
    grad_check(&[x.clone()], |v| v[0].reshape((6, 4))?.t()?.contiguous()?.sin()?.sum_all());
    grad_check(&[x], |v| v[0].sum(0, true)?.broadcast_as((5, 3, 4))?.square()?.sum_all());
}

#[test]
fn test_grad_softmax_family() {
    let x = randn(&[2, 5]);
    let w = randn(&[2, 5]);
    grad_check(&[x.clone(), w.clone()], |v| v[0].softmax(1)?.mul(&v[1])?.sum_all());
    grad_check(&[x, w], |v| v[0].log_softmax(1)?.mul(&v[1])?.sum_all());
}

#[test]
fn test_grad_indexing_and_concat() {
    let x = randn(&[3, 4]);
    let y = randn(&[2, 4]);
    let idx = Tensor::<CpuBackend>::from_slice(&[0i64, 3, 3, 1, 2, 2], (3, 2), &DEV).unwrap();
    let rows = Tensor::<CpuBackend>::from_slice(&[2i64, 0, 2], 3, &DEV).unwrap();
    grad_check(&[x.clone()], |v| v[0].gather(1, &idx)?.square()?.sum_all());
    grad_check(&[x.clone()], |v| v[0].index_select(0, &rows)?.exp()?.sum_all());
    grad_check(&[x.clone(), y], |v| Tensor::cat(&[v[0].clone(), v[1].clone()], 0)?.square()?.sum_all());
    grad_check(&[x], |v| v[0].pad(&[[1, 0], [2, 1]], 3.0)?.sin()?.sum_all());
}

#[test]
fn test_grad_composites() {
    let x = randn(&[8]);
    let target = randn(&[8]);
    grad_check(&[x.clone()], |v| v[0].leaky_relu(0.1)?.sum_all());
    grad_check(&[x.clone()], |v| v[0].affine(2.0, 0.0)?.hswish()?.sum_all());
    grad_check(&[x.clone(), target.clone()], |v| v[0].smooth_l1_loss(&v[1], 1.0)?.sum_all());
    let mask = x.gt(&target).unwrap();
    grad_check(&[x, target], |v| Tensor::where_cond(&mask, &v[0].exp()?, &v[1])?.sum_all());
}

#[test]
fn test_grad_accumulates_over_uses() {
    let x = t(&[3.0], &[1]).set_variable();
    let y = x.mul(&x).unwrap().add(&x).unwrap().sum_all().unwrap();
    let g = y.backward().unwrap();
    assert_close(&g.get(&x).unwrap().to_f64_vec().unwrap(), &[7.0], 1e-12);
}

#[test]
fn test_grad_to_dtype() {
    let x = t(&[1.0, -2.0], &[2]).set_variable();
    let y = x.to_dtype(DType::F32).unwrap().square().unwrap().sum_all().unwrap();
    let g = y.backward().unwrap();
    let gx = g.get(&x).unwrap();
    assert_eq!(gx.dtype(), DType::F64);
    assert_close(&gx.to_f64_vec().unwrap(), &[2.0, -4.0], 1e-6);
}

// Memory pool

#[test]
fn test_pool_invariants_over_random_sequence() {
    use rand::{Rng, SeedableRng};
    let pool = DynamicMemPool::new(1 << 22, 1 << 14);
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    let mut live: Vec<usize> = Vec::new();
    for _ in 0..400 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(0..20_000);
            let persistent = rng.gen_bool(0.2);
            live.push(pool.alloc(size, persistent).unwrap());
        } else {
            let i = rng.gen_range(0..live.len());
            pool.free(live.swap_remove(i)).unwrap();
        }
        let stats = pool.stats().unwrap();
        assert_eq!(stats.used_mem, pool.used_bytes_by_walk().unwrap());
        assert!(stats.peak_mem >= stats.used_mem);
        assert!(stats.total_mem <= pool.capacity());
    }
    for addr in live.drain(..) {
        pool.free(addr).unwrap();
    }
    assert_eq!(pool.stats().unwrap().used_mem, 0);
    assert!(pool.fully_coalesced().unwrap());
    let total = pool.stats().unwrap().total_mem;
    assert_eq!(pool.release_idle_blocks().unwrap(), total);
    assert_eq!(pool.stats().unwrap().block_count, 0);
    assert_eq!(pool.free_budget().unwrap(), 1 << 22);
}

#[test]
fn test_pool_alloc_continuous() {
    let pool = DynamicMemPool::new(1 << 20, 1 << 12);
    let addrs = pool.alloc_continuous(3000, &[1000, 1000, 500]).unwrap();
    assert_eq!(addrs.len(), 3);
    assert_eq!(addrs[1], addrs[0] + 1000);
    assert_eq!(addrs[2], addrs[1] + 1000);
    // The 3072-byte aligned allocation leaves 1072 bytes for the last entry.
    assert_eq!(pool.buf_size(addrs[2]).unwrap(), Some(1072));
    assert_eq!(pool.stats().unwrap().used_mem, pool.used_bytes_by_walk().unwrap());
    for a in addrs {
        pool.free(a).unwrap();
    }
    assert!(pool.fully_coalesced().unwrap());
    assert!(pool.alloc_continuous(100, &[60, 60]).is_err());
}

#[test]
fn test_pool_merges_neighbours() {
    let pool = DynamicMemPool::new(1 << 20, 1 << 13);
    let a = pool.alloc(512, false).unwrap();
    let b = pool.alloc(512, false).unwrap();
    let c = pool.alloc(512, false).unwrap();
    pool.free(a).unwrap();
    pool.free(c).unwrap();
    let before = pool.stats().unwrap().idle_buf_count;
    pool.free(b).unwrap();
    // a, b, c and the block tail collapse into one idle buf.
    assert_eq!(pool.stats().unwrap().idle_buf_count, before - 1);
    assert!(pool.fully_coalesced().unwrap());
}
