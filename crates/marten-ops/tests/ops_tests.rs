use marten_core::{DType, Error, Tensor};
use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};
use marten_ops::{prim, AbstractTensor, Attrs, KernelRegistry, KernelTarget, OpSet};

const DEV: CpuDevice = CpuDevice;

fn t(data: &[f64], shape: &[usize]) -> CpuTensor {
    Tensor::from_f64_slice(data, shape, DType::F64, &DEV).unwrap()
}

fn ti(data: &[i64], shape: &[usize]) -> CpuTensor {
    Tensor::from_slice(data, shape, &DEV).unwrap()
}

fn reg() -> KernelRegistry<CpuBackend> {
    KernelRegistry::with_defaults()
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < tol, "index {}: {} vs {}", i, x, y);
    }
}

// Selection

#[test]
fn test_select_exact_native() {
    let sel = reg().select_kernel(prim::ADD, &[DType::F32, DType::F32]).unwrap();
    assert_eq!(sel.target, KernelTarget::Native);
    assert_eq!(sel.kernel_dtype, DType::F32);
    assert!(!sel.needs_cast);
}

#[test]
fn test_select_widens_half_to_f32() {
    let sel = reg().select_kernel(prim::EXP, &[DType::F16]).unwrap();
    assert_eq!(sel.target, KernelTarget::Native);
    assert_eq!(sel.kernel_dtype, DType::F32);
    assert_eq!(sel.input_dtype, DType::F16);
    assert!(sel.needs_cast);
}

#[test]
fn test_select_integer_chain_reaches_f64() {
    let sel = reg().select_kernel(prim::EXP, &[DType::U8]).unwrap();
    assert_eq!(sel.kernel_dtype, DType::F64);
    let sel = reg().select_kernel(prim::ADD, &[DType::U32, DType::U32]).unwrap();
    assert_eq!(sel.kernel_dtype, DType::I64);
}

#[test]
fn test_select_falls_back_to_host() {
    let sel = reg().select_kernel(prim::CHOLESKY, &[DType::F32]).unwrap();
    assert_eq!(sel.target, KernelTarget::Host);
    assert_eq!(sel.kernel_dtype, DType::F64);
    assert!(sel.needs_cast);
}

#[test]
fn test_key_dtype_skips_index_operands() {
    let sel = reg().select_kernel(prim::GATHER, &[DType::I64, DType::F32]).unwrap();
    assert_eq!(sel.input_dtype, DType::F32);
}

#[test]
fn test_unsupported_op() {
    let err = reg().select_kernel("Conv2D", &[DType::F32]).unwrap_err();
    match err {
        Error::UnsupportedOp { op, dtype, .. } => {
            assert_eq!(op, "Conv2D");
            assert_eq!(dtype, DType::F32);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(reg().select_kernel(prim::ADD, &[]).is_err());
}

#[test]
fn test_registered_kernel_takes_precedence() {
    let mut r = KernelRegistry::<CpuBackend>::new();
    assert!(r.is_empty());
    r.register_fn("Twice", KernelTarget::Native, &[DType::F64], |inputs: &[CpuTensor], _: &Attrs| {
        Ok(vec![inputs[0].affine(2.0, 0.0)?])
    });
    assert!(r.has_op("Twice"));
    let y = r.dispatch_one("Twice", &[t(&[1.0, 2.0], &[2])], &Attrs::new()).unwrap();
    assert_eq!(y.to_f64_vec().unwrap(), vec![2.0, 4.0]);
}

// Dispatch casts

#[test]
fn test_dispatch_casts_float_back() {
    let x = Tensor::from_f64_slice(&[0.0, 1.0], 2, DType::F16, &DEV).unwrap();
    let y = reg().dispatch_one(prim::EXP, &[x], &Attrs::new()).unwrap();
    assert_eq!(y.dtype(), DType::F16);
    assert_close(&y.to_f64_vec().unwrap(), &[1.0, std::f64::consts::E], 1e-2);
}

#[test]
fn test_dispatch_integer_input_keeps_widened_result() {
    let x = Tensor::from_f64_slice(&[0.0, 2.0], 2, DType::U8, &DEV).unwrap();
    let y = reg().dispatch_one(prim::SQRT, &[x], &Attrs::new()).unwrap();
    assert_eq!(y.dtype(), DType::F64);
    assert_close(&y.to_f64_vec().unwrap(), &[0.0, 2f64.sqrt()], 1e-12);
}

#[test]
fn test_dispatch_leaves_mask_outputs_alone() {
    let a = Tensor::from_f64_slice(&[1.0, 3.0], 2, DType::F16, &DEV).unwrap();
    let b = Tensor::from_f64_slice(&[2.0, 2.0], 2, DType::F16, &DEV).unwrap();
    let m = reg().dispatch_one(prim::GREATER, &[a, b], &Attrs::new()).unwrap();
    assert_eq!(m.dtype(), DType::U8);
    assert_eq!(m.to_f64_vec().unwrap(), vec![0.0, 1.0]);
}

#[test]
fn test_host_kernel_through_dispatch() {
    let a = Tensor::from_f64_slice(&[4.0, 2.0, 2.0, 3.0], (2, 2), DType::F32, &DEV).unwrap();
    let l = reg()
        .dispatch_one(prim::CHOLESKY, &[a], &Attrs::new().with("lower", true))
        .unwrap();
    assert_eq!(l.dtype(), DType::F32);
    assert_close(&l.to_f64_vec().unwrap(), &[2.0, 0.0, 1.0, 2f64.sqrt()], 1e-5);
}

// Native kernels

#[test]
fn test_matmul_transpose_and_activation() {
    let a = t(&[1.0, -2.0, 3.0, 4.0], &[2, 2]);
    let b = t(&[1.0, 0.0, 0.0, 1.0], &[2, 2]);
    let attrs = Attrs::new().with("transpose_a", true).with("activation", "relu");
    let y = reg().dispatch_one(prim::MATMUL, &[a, b], &attrs).unwrap();
    assert_eq!(y.to_f64_vec().unwrap(), vec![1.0, 3.0, 0.0, 4.0]);
}

#[test]
fn test_matmul_vector_promotion() {
    let a = t(&[1.0, 2.0, 3.0], &[3]);
    let b = t(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]);
    let y = reg().dispatch_one(prim::MATMUL, &[a, b], &Attrs::new()).unwrap();
    assert_eq!(y.dims(), &[2]);
    assert_eq!(y.to_f64_vec().unwrap(), vec![4.0, 5.0]);
}

#[test]
fn test_matmul_tiles_batch_multiple() {
    let a = t(&(0..12).map(f64::from).collect::<Vec<_>>(), &[2, 2, 3]);
    let b = t(&(0..60).map(|v| f64::from(v) * 0.1).collect::<Vec<_>>(), &[4, 3, 5]);
    let y = reg().dispatch_one(prim::MATMUL, &[a.clone(), b.clone()], &Attrs::new()).unwrap();
    assert_eq!(y.dims(), &[4, 2, 5]);
    // Batch 2 of the output pairs a[0] with b[2].
    let expected = a.narrow(0, 0, 1).unwrap().matmul(&b.narrow(0, 2, 1).unwrap()).unwrap();
    let got = y.narrow(0, 2, 1).unwrap();
    assert_close(&got.to_f64_vec().unwrap(), &expected.to_f64_vec().unwrap(), 1e-9);
}

#[test]
fn test_matmul_bias_add() {
    let x = t(&[1.0, 2.0], &[1, 2]);
    let w = t(&[1.0, 1.0, 1.0, -1.0], &[2, 2]);
    let b = t(&[0.5, 0.5], &[2]);
    let y = reg()
        .dispatch_one(prim::MATMUL_BIAS_ADD, &[x, w, b], &Attrs::new().with("activation", "relu"))
        .unwrap();
    assert_eq!(y.to_f64_vec().unwrap(), vec![3.5, 0.0]);
}

#[test]
fn test_reductions_with_keep_dims() {
    let x = t(&[1.0, 5.0, 3.0, 2.0, 4.0, 6.0], &[2, 3]);
    let attrs = Attrs::new().with("axis", vec![1i64]).with("keep_dims", true);
    let s = reg().dispatch_one(prim::REDUCE_SUM, &[x.clone()], &attrs).unwrap();
    assert_eq!(s.dims(), &[2, 1]);
    assert_eq!(s.to_f64_vec().unwrap(), vec![9.0, 12.0]);
    let m = reg().dispatch_one(prim::REDUCE_MAX, &[x.clone()], &Attrs::new()).unwrap();
    assert_eq!(m.to_f64_vec().unwrap(), vec![6.0]);
    let am = reg().dispatch_one(prim::ARGMAX, &[x], &Attrs::new()).unwrap();
    assert_eq!(am.dtype(), DType::I64);
    assert_eq!(am.to_f64_vec().unwrap(), vec![1.0, 2.0]);
}

#[test]
fn test_shape_kernels() {
    let x = t(&(0..6).map(f64::from).collect::<Vec<_>>(), &[2, 3]);
    let r = reg()
        .dispatch_one(prim::RESHAPE, &[x.clone()], &Attrs::new().with("shape", vec![3i64, -1]))
        .unwrap();
    assert_eq!(r.dims(), &[3, 2]);
    let tr = reg()
        .dispatch_one(prim::TRANSPOSE, &[x.clone()], &Attrs::new().with("perm", vec![1i64, 0]))
        .unwrap();
    assert_eq!(tr.to_f64_vec().unwrap(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    let s = reg()
        .dispatch_one(
            prim::SLICE,
            &[x.clone()],
            &Attrs::new().with("begin", vec![1i64, 1]).with("size", vec![1i64, -1]),
        )
        .unwrap();
    assert_eq!(s.to_f64_vec().unwrap(), vec![4.0, 5.0]);
    let u = reg()
        .dispatch_one(prim::UNSQUEEZE, &[x.clone()], &Attrs::new().with("axis", -1i64))
        .unwrap();
    assert_eq!(u.dims(), &[2, 3, 1]);
    let sq = reg().dispatch_one(prim::SQUEEZE, &[u], &Attrs::new()).unwrap();
    assert_eq!(sq.dims(), &[2, 3]);
    let p = reg()
        .dispatch_one(
            prim::PAD,
            &[x.clone()],
            &Attrs::new().with("paddings", vec![0i64, 0, 1, 0]).with("value", -1.0),
        )
        .unwrap();
    assert_eq!(p.dims(), &[2, 4]);
    assert_eq!(p.to_f64_vec().unwrap()[..4], [-1.0, 0.0, 1.0, 2.0]);
    let half = reg()
        .dispatch_one(
            prim::SPLIT,
            &[x.clone()],
            &Attrs::new().with("axis", 0i64).with("parts", 2i64).with("index", 1i64),
        )
        .unwrap();
    assert_eq!(half.to_f64_vec().unwrap(), vec![3.0, 4.0, 5.0]);
    let c = reg()
        .dispatch_one(prim::CONCAT, &[x.clone(), x], &Attrs::new().with("axis", 1i64))
        .unwrap();
    assert_eq!(c.dims(), &[2, 6]);
}

#[test]
fn test_gather_with_matrix_indices() {
    let params = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
    let idx = ti(&[2, 0], &[1, 2]);
    let y = reg().dispatch_one(prim::GATHER, &[params, idx], &Attrs::new()).unwrap();
    assert_eq!(y.dims(), &[1, 2, 2]);
    assert_eq!(y.to_f64_vec().unwrap(), vec![5.0, 6.0, 1.0, 2.0]);
}

#[test]
fn test_gather_nd_and_scatter_nd() {
    let params = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let idx = ti(&[1, 0, 0, 1], &[2, 2]);
    let g = reg().dispatch_one(prim::GATHER_ND, &[params, idx], &Attrs::new()).unwrap();
    assert_eq!(g.to_f64_vec().unwrap(), vec![3.0, 2.0]);

    let idx = ti(&[1, 1, 0], &[3, 1]);
    let updates = t(&[1.0, 1.0, 2.0, 2.0, 5.0, 5.0], &[3, 2]);
    let s = reg()
        .dispatch_one(prim::SCATTER_ND, &[idx, updates], &Attrs::new().with("shape", vec![2i64, 2]))
        .unwrap();
    assert_eq!(s.to_f64_vec().unwrap(), vec![5.0, 5.0, 3.0, 3.0]);

    let bad = ti(&[7], &[1, 1]);
    let err = reg().dispatch_one(prim::GATHER_ND, &[t(&[1.0, 2.0], &[2]), bad], &Attrs::new());
    assert!(err.is_err());
}

#[test]
fn test_unsorted_segment_sum_drops_out_of_range() {
    let data = t(&[1.0, 2.0, 3.0, 4.0], &[4]);
    let ids = ti(&[0, 2, 0, 5], &[4]);
    let y = reg()
        .dispatch_one(prim::UNSORTED_SEGMENT_SUM, &[data, ids], &Attrs::new().with("num_segments", 3i64))
        .unwrap();
    assert_eq!(y.to_f64_vec().unwrap(), vec![4.0, 0.0, 2.0]);
}

#[test]
fn test_one_hot() {
    let idx = ti(&[0, 2, 5], &[3]);
    let y = reg()
        .dispatch_one(prim::ONE_HOT, &[idx], &Attrs::new().with("depth", 3i64))
        .unwrap();
    assert_eq!(y.dtype(), DType::F32);
    assert_eq!(y.dims(), &[3, 3]);
    assert_eq!(
        y.to_f64_vec().unwrap(),
        vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]
    );
}

#[test]
fn test_select_and_cast() {
    let mask = Tensor::from_f64_slice(&[1.0, 0.0], 2, DType::U8, &DEV).unwrap();
    let y = reg()
        .dispatch_one(prim::SELECT, &[mask, t(&[1.0, 2.0], &[2]), t(&[-1.0, -2.0], &[2])], &Attrs::new())
        .unwrap();
    assert_eq!(y.to_f64_vec().unwrap(), vec![1.0, -2.0]);
    let c = reg()
        .dispatch_one(prim::CAST, &[y], &Attrs::new().with("dtype", DType::I64))
        .unwrap();
    assert_eq!(c.dtype(), DType::I64);
}

#[test]
fn test_derivative_helpers() {
    let g = reg()
        .dispatch_one(prim::GELU_GRAD, &[t(&[1.0], &[1]), t(&[0.0], &[1])], &Attrs::new())
        .unwrap();
    assert_close(&g.to_f64_vec().unwrap(), &[0.5], 1e-12);
    let s = reg()
        .dispatch_one(prim::SILU_GRAD, &[t(&[2.0], &[1]), t(&[0.0], &[1])], &Attrs::new())
        .unwrap();
    assert_close(&s.to_f64_vec().unwrap(), &[1.0], 1e-12);
    let l = reg()
        .dispatch_one(
            prim::SMOOTH_L1_LOSS_GRAD,
            &[t(&[0.5, 3.0, -4.0], &[3]), t(&[0.0; 3], &[3]), t(&[1.0, 2.0, 1.0], &[3])],
            &Attrs::new(),
        )
        .unwrap();
    assert_close(&l.to_f64_vec().unwrap(), &[0.5, 2.0, -1.0], 1e-12);
}

// Host linear algebra

#[test]
fn test_matrix_inverse() {
    let a = t(&[4.0, 7.0, 2.0, 6.0], &[2, 2]);
    let inv = reg().dispatch_one(prim::MATRIX_INVERSE, &[a], &Attrs::new()).unwrap();
    assert_close(&inv.to_f64_vec().unwrap(), &[0.6, -0.7, -0.2, 0.4], 1e-12);
    let singular = t(&[1.0, 2.0, 2.0, 4.0], &[2, 2]);
    assert!(reg().dispatch_one(prim::MATRIX_INVERSE, &[singular], &Attrs::new()).is_err());
}

#[test]
fn test_lu_factor_then_solve() {
    let a = t(&[2.0, 1.0, 1.0, 1.0, 3.0, 2.0, 1.0, 0.0, 0.0], &[3, 3]);
    let b = t(&[4.0, 5.0, 6.0], &[3]);
    let out = reg().dispatch(prim::LU_FACTOR, &[a.clone()], &Attrs::new()).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[1].dtype(), DType::I64);
    let x = reg()
        .dispatch_one(prim::LU_SOLVE, &[out[0].clone(), out[1].clone(), b.clone()], &Attrs::new())
        .unwrap();
    assert_eq!(x.dims(), &[3]);
    let ax = a.matmul(&x.unsqueeze(1).unwrap()).unwrap();
    assert_close(&ax.to_f64_vec().unwrap(), &b.to_f64_vec().unwrap(), 1e-9);
}

#[test]
fn test_lu_reconstructs() {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
    let plu = reg().dispatch(prim::LU, &[a.clone()], &Attrs::new()).unwrap();
    assert_eq!(plu.len(), 3);
    let rebuilt = plu[0].matmul(&plu[1]).unwrap().matmul(&plu[2]).unwrap();
    assert_close(&rebuilt.to_f64_vec().unwrap(), &a.to_f64_vec().unwrap(), 1e-12);
}

#[test]
fn test_eigh_and_cho_solve() {
    let a = t(&[2.0, 1.0, 1.0, 2.0], &[2, 2]);
    let wv = reg().dispatch(prim::EIGH, &[a.clone()], &Attrs::new()).unwrap();
    assert_close(&wv[0].to_f64_vec().unwrap(), &[1.0, 3.0], 1e-10);

    let c = reg().dispatch_one(prim::CHOLESKY, &[a.clone()], &Attrs::new()).unwrap();
    let b = t(&[3.0, 3.0], &[2]);
    let x = reg().dispatch_one(prim::CHO_SOLVE, &[c, b], &Attrs::new()).unwrap();
    assert_close(&x.to_f64_vec().unwrap(), &[1.0, 1.0], 1e-10);
}

#[test]
fn test_block_diag() {
    let y = reg()
        .dispatch_one(prim::BLOCK_DIAG, &[t(&[1.0], &[1, 1]), t(&[2.0, 3.0], &[2])], &Attrs::new())
        .unwrap();
    assert_eq!(y.dims(), &[2, 3]);
    assert_eq!(y.to_f64_vec().unwrap(), vec![1.0, 0.0, 0.0, 0.0, 2.0, 3.0]);
}

// Inference agrees with kernels

#[test]
fn test_kernel_outputs_match_inference() {
    let ops = OpSet::builtin();
    let x = t(&(0..24).map(f64::from).collect::<Vec<_>>(), &[2, 3, 4]);
    let attrs = Attrs::new().with("axis", vec![0i64, 2]);
    let y = reg().dispatch_one(prim::REDUCE_MEAN, &[x.clone()], &attrs).unwrap();
    let abs = ops
        .infer(prim::REDUCE_MEAN, &[AbstractTensor::new(x.shape().clone(), x.dtype())], &attrs)
        .unwrap();
    assert_eq!(y.shape(), &abs.shape);
    assert_eq!(y.dtype(), abs.dtype);
}
