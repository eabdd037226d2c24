use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use marten_core::backend::{Backend, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp};
use marten_core::dtype::{DType, WithDType};
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;
use marten_core::shape::Shape;

use crate::{with_rng, CpuBackend, CpuDevice, CpuStorage, PAR_THRESHOLD};

// Helpers

/// Apply `f` to every value, in parallel for large inputs.
fn map_values(data: Vec<f64>, f: impl Fn(f64) -> f64 + Sync + Send) -> Vec<f64> {
    if data.len() >= PAR_THRESHOLD {
        data.into_par_iter().map(f).collect()
    } else {
        data.into_iter().map(f).collect()
    }
}

fn zip_values(a: Vec<f64>, b: Vec<f64>, f: impl Fn(f64, f64) -> f64 + Sync + Send) -> Vec<f64> {
    if a.len() >= PAR_THRESHOLD {
        a.into_par_iter().zip(b).map(|(x, y)| f(x, y)).collect()
    } else {
        a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect()
    }
}

/// Read `storage` as if it had `target`'s shape (stride-0 broadcast).
fn read_broadcast(storage: &CpuStorage, layout: &Layout, target: &Shape) -> Result<Vec<f64>> {
    Ok(storage.read_f64(&layout.broadcast_as(target)?))
}

/// Multi-dimensional coordinates of a row-major flat index.
fn unravel(mut flat: usize, strides: &[usize], coords: &mut [usize]) {
    for (c, &s) in coords.iter_mut().zip(strides) {
        *c = flat / s.max(1);
        flat %= s.max(1);
    }
}

fn check_index(op: &str, idx: f64, size: usize) -> Result<usize> {
    if idx < 0.0 || idx as usize >= size {
        return Err(Error::msg(format!(
            "{}: index {} out of range for dim of size {}",
            op, idx, size
        )));
    }
    Ok(idx as usize)
}

// Matmul

fn gemm<T>(a: &[T], b: &[T], out: &mut [T], batch: usize, m: usize, k: usize, n: usize)
where
    T: num_traits::Float + Send + Sync,
{
    const KB: usize = 64;
    let rows = |row: usize, c: &mut [T]| {
        let bi = row / m;
        let i = row % m;
        let a_row = &a[(bi * m + i) * k..(bi * m + i + 1) * k];
        let b_mat = &b[bi * k * n..(bi + 1) * k * n];
        for kk in (0..k).step_by(KB) {
            for p in kk..(kk + KB).min(k) {
                let av = a_row[p];
                let b_row = &b_mat[p * n..(p + 1) * n];
                for (cv, &bv) in c.iter_mut().zip(b_row) {
                    *cv = *cv + av * bv;
                }
            }
        }
    };
    if n == 0 {
        return;
    }
    if batch * m * n >= PAR_THRESHOLD {
        out.par_chunks_mut(n).enumerate().for_each(|(row, c)| rows(row, c));
    } else {
        out.chunks_mut(n).enumerate().for_each(|(row, c)| rows(row, c));
    }
}

fn typed_read<T: WithDType>(v: &[T], layout: &Layout) -> Vec<T> {
    layout.strided_indices().map(|i| v[i]).collect()
}

// Reduction

/// For each input element (row-major), its output position and its position
/// within the reduced sub-block.
fn reduce_positions(dims: &[usize], reduce: &[usize]) -> (usize, Vec<(usize, usize)>) {
    let all = reduce.is_empty();
    let is_reduced = |d: usize| all || reduce.contains(&d);
    let mut out_strides = vec![0usize; dims.len()];
    let mut red_strides = vec![0usize; dims.len()];
    let (mut out_acc, mut red_acc) = (1usize, 1usize);
    for d in (0..dims.len()).rev() {
        if is_reduced(d) {
            red_strides[d] = red_acc;
            red_acc *= dims[d];
        } else {
            out_strides[d] = out_acc;
            out_acc *= dims[d];
        }
    }
    let shape = Shape::from(dims);
    let in_strides = shape.stride_contiguous();
    let mut coords = vec![0usize; dims.len()];
    let positions = (0..shape.elem_count())
        .map(|flat| {
            unravel(flat, &in_strides, &mut coords);
            let mut o = 0;
            let mut r = 0;
            for d in 0..dims.len() {
                o += coords[d] * out_strides[d];
                r += coords[d] * red_strides[d];
            }
            (o, r)
        })
        .collect();
    (out_acc, positions)
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    // Creation

    fn zeros(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 0.0, dtype, device)
    }

    fn ones(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 1.0, dtype, device)
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_vec(vec![val; shape.elem_count()], dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_vec(data.to_vec(), dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        let data = with_rng(|rng| (0..n).map(|_| rng.gen::<f64>()).collect())?;
        Ok(CpuStorage::from_f64_vec(data, dtype))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        let data = with_rng(|rng| (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect())?;
        Ok(CpuStorage::from_f64_vec(data, dtype))
    }

    // Element-wise

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;
        let a = read_broadcast(lhs, lhs_layout, &shape)?;
        let b = read_broadcast(rhs, rhs_layout, &shape)?;
        Ok(CpuStorage::from_f64_vec(zip_values(a, b, |x, y| op.apply(x, y)), lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = map_values(input.read_f64(layout), |x| op.apply(x));
        Ok(CpuStorage::from_f64_vec(data, input.dtype()))
    }

    fn cmp_op(
        op: CmpOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;
        let a = read_broadcast(lhs, lhs_layout, &shape)?;
        let b = read_broadcast(rhs, rhs_layout, &shape)?;
        let mask = a.iter().zip(&b).map(|(&x, &y)| op.apply(x, y) as u8).collect();
        Ok(CpuStorage::U8(mask))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        let data = map_values(input.read_f64(layout), |x| x * mul + add);
        Ok(CpuStorage::from_f64_vec(data, input.dtype()))
    }

    fn powf(input: &CpuStorage, layout: &Layout, exponent: f64) -> Result<CpuStorage> {
        let data = map_values(input.read_f64(layout), |x| x.powf(exponent));
        Ok(CpuStorage::from_f64_vec(data, input.dtype()))
    }

    fn clamp(input: &CpuStorage, layout: &Layout, min: f64, max: f64) -> Result<CpuStorage> {
        let data = map_values(input.read_f64(layout), |x| x.clamp(min, max));
        Ok(CpuStorage::from_f64_vec(data, input.dtype()))
    }

    fn where_cond(
        mask: &CpuStorage,
        mask_layout: &Layout,
        on_true: &CpuStorage,
        on_true_layout: &Layout,
        on_false: &CpuStorage,
        on_false_layout: &Layout,
    ) -> Result<CpuStorage> {
        let shape = Shape::broadcast_shape(
            &Shape::broadcast_shape(mask_layout.shape(), on_true_layout.shape())?,
            on_false_layout.shape(),
        )?;
        let m = read_broadcast(mask, mask_layout, &shape)?;
        let t = read_broadcast(on_true, on_true_layout, &shape)?;
        let f = read_broadcast(on_false, on_false_layout, &shape)?;
        let data = m
            .iter()
            .zip(t.iter().zip(&f))
            .map(|(&c, (&x, &y))| if c != 0.0 { x } else { y })
            .collect();
        Ok(CpuStorage::from_f64_vec(data, on_true.dtype()))
    }

    // Reductions

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
        _keep_dim: bool,
    ) -> Result<CpuStorage> {
        let values = input.read_f64(layout);
        let (out_len, positions) = reduce_positions(layout.dims(), dims);
        let block = if out_len == 0 { 0 } else { values.len() / out_len };
        let out = match op {
            ReduceOp::Sum | ReduceOp::Mean => {
                let mut acc = vec![0.0f64; out_len];
                for (&v, &(o, _)) in values.iter().zip(&positions) {
                    acc[o] += v;
                }
                if op == ReduceOp::Mean {
                    // An empty block divides by zero and yields NaN.
                    let denom = block as f64;
                    acc.iter_mut().for_each(|a| *a /= denom);
                }
                acc
            }
            ReduceOp::Max | ReduceOp::Min | ReduceOp::ArgMax | ReduceOp::ArgMin => {
                if block == 0 && out_len > 0 {
                    return Err(Error::msg(format!("{:?} over an empty dimension", op)));
                }
                let want_max = matches!(op, ReduceOp::Max | ReduceOp::ArgMax);
                let mut best: Vec<Option<(f64, usize)>> = vec![None; out_len];
                for (&v, &(o, r)) in values.iter().zip(&positions) {
                    let replace = match best[o] {
                        None => true,
                        // First occurrence wins on ties; NaN propagates.
                        Some((b, _)) => {
                            !b.is_nan() && (v.is_nan() || if want_max { v > b } else { v < b })
                        }
                    };
                    if replace {
                        best[o] = Some((v, r));
                    }
                }
                let arg = matches!(op, ReduceOp::ArgMax | ReduceOp::ArgMin);
                let out: Vec<f64> = best
                    .into_iter()
                    .map(|b| match b {
                        Some((v, r)) => if arg { r as f64 } else { v },
                        None => 0.0,
                    })
                    .collect();
                if arg {
                    return Ok(CpuStorage::from_f64_vec(out, DType::I64));
                }
                out
            }
        };
        Ok(CpuStorage::from_f64_vec(out, input.dtype()))
    }

    // Linear algebra

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let l = lhs_layout.dims();
        let r = rhs_layout.dims();
        if l.len() < 2 || r.len() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: l.len().min(r.len()),
            });
        }
        let (m, k) = (l[l.len() - 2], l[l.len() - 1]);
        let (k2, n) = (r[r.len() - 2], r[r.len() - 1]);
        if k != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1: k, k2, n });
        }
        let batch_shape = Shape::broadcast_shape(
            &Shape::from(&l[..l.len() - 2]),
            &Shape::from(&r[..r.len() - 2]),
        )?;
        let batch = batch_shape.elem_count();
        let mut a_dims = batch_shape.dims().to_vec();
        a_dims.extend([m, k]);
        let mut b_dims = batch_shape.dims().to_vec();
        b_dims.extend([k, n]);
        let a_layout = lhs_layout.broadcast_as(&Shape::new(a_dims))?;
        let b_layout = rhs_layout.broadcast_as(&Shape::new(b_dims))?;

        match (lhs, rhs) {
            (CpuStorage::F32(a), CpuStorage::F32(b)) => {
                let (a, b) = (typed_read(a, &a_layout), typed_read(b, &b_layout));
                let mut out = vec![0f32; batch * m * n];
                gemm(&a, &b, &mut out, batch, m, k, n);
                Ok(CpuStorage::F32(out))
            }
            (CpuStorage::F64(a), CpuStorage::F64(b)) => {
                let (a, b) = (typed_read(a, &a_layout), typed_read(b, &b_layout));
                let mut out = vec![0f64; batch * m * n];
                gemm(&a, &b, &mut out, batch, m, k, n);
                Ok(CpuStorage::F64(out))
            }
            _ => {
                let a = lhs.read_f64(&a_layout);
                let b = rhs.read_f64(&b_layout);
                let mut out = vec![0f64; batch * m * n];
                gemm(&a, &b, &mut out, batch, m, k, n);
                Ok(CpuStorage::from_f64_vec(out, lhs.dtype()))
            }
        }
    }

    // Data movement

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        if layout.is_contiguous() && input.len() == layout.elem_count() {
            return Ok(input.clone());
        }
        Ok(input.pick(layout.strided_indices()))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(input.read_f64(layout))
    }

    // Indexing

    fn index_select(
        input: &CpuStorage,
        input_layout: &Layout,
        indices: &CpuStorage,
        indices_layout: &Layout,
        dim: usize,
    ) -> Result<CpuStorage> {
        let picks = indices
            .read_f64(indices_layout)
            .into_iter()
            .map(|i| check_index("index_select", i, input_layout.dims()[dim]))
            .collect::<Result<Vec<_>>>()?;
        let mut out_dims = input_layout.dims().to_vec();
        out_dims[dim] = picks.len();
        let out_shape = Shape::new(out_dims);
        let out_strides = out_shape.stride_contiguous();
        let mut coords = vec![0usize; out_shape.rank()];
        let positions: Vec<usize> = (0..out_shape.elem_count())
            .map(|flat| {
                unravel(flat, &out_strides, &mut coords);
                coords[dim] = picks[coords[dim]];
                input_layout.flat_index(&coords)
            })
            .collect();
        Ok(input.pick(positions.into_iter()))
    }

    fn gather(
        input: &CpuStorage,
        input_layout: &Layout,
        index: &CpuStorage,
        index_layout: &Layout,
        dim: usize,
    ) -> Result<CpuStorage> {
        let idx = index.read_f64(index_layout);
        let in_dims = input_layout.dims();
        let index_strides = index_layout.shape().stride_contiguous();
        let mut coords = vec![0usize; index_layout.rank()];
        let mut positions = Vec::with_capacity(idx.len());
        for (flat, &v) in idx.iter().enumerate() {
            unravel(flat, &index_strides, &mut coords);
            coords[dim] = check_index("gather", v, in_dims[dim])?;
            for (d, (&c, &size)) in coords.iter().zip(in_dims).enumerate() {
                if c >= size {
                    return Err(Error::msg(format!(
                        "gather: index shape exceeds input along dim {}",
                        d
                    )));
                }
            }
            positions.push(input_layout.flat_index(&coords));
        }
        Ok(input.pick(positions.into_iter()))
    }

    fn cat(inputs: &[(&CpuStorage, &Layout)], out_shape: &Shape, dim: usize) -> Result<CpuStorage> {
        let dtype = match inputs.first() {
            Some((s, _)) => s.dtype(),
            None => return Err(Error::msg("cat: no inputs")),
        };
        let outer: usize = out_shape.dims()[..dim].iter().product();
        let mut parts: Vec<(Vec<f64>, usize)> = Vec::with_capacity(inputs.len());
        for (storage, layout) in inputs {
            let inner: usize = layout.dims()[dim..].iter().product();
            parts.push((storage.read_f64(layout), inner));
        }
        let mut out = Vec::with_capacity(out_shape.elem_count());
        for o in 0..outer {
            for (data, inner) in &parts {
                out.extend_from_slice(&data[o * inner..(o + 1) * inner]);
            }
        }
        Ok(CpuStorage::from_f64_vec(out, dtype))
    }

    fn cast(input: &CpuStorage, layout: &Layout, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        if input.dtype() == dtype {
            return Self::to_contiguous(input, layout);
        }
        Ok(CpuStorage::from_f64_vec(input.read_f64(layout), dtype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f64s(s: &CpuStorage) -> Vec<f64> {
        s.read_f64(&Layout::contiguous(s.len()))
    }

    #[test]
    fn test_reduce_positions() {
        let (n, pos) = reduce_positions(&[2, 3], &[1]);
        assert_eq!(n, 2);
        assert_eq!(pos[4], (1, 1));
        let (n, _) = reduce_positions(&[2, 3], &[]);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_argmax_first_occurrence() {
        let s = CpuStorage::F32(vec![1.0, 5.0, 5.0, 2.0]);
        let out = CpuBackend::reduce_op(ReduceOp::ArgMax, &s, &Layout::contiguous(4), &[0], false).unwrap();
        assert_eq!(out, CpuStorage::I64(vec![1]));
    }

    #[test]
    fn test_batched_matmul_broadcast() {
        // [2, 1, 2] @ [2, 1] -> [2, 1, 1]
        let a = CpuStorage::F64(vec![1.0, 2.0, 3.0, 4.0]);
        let b = CpuStorage::F64(vec![10.0, 1.0]);
        let out = CpuBackend::matmul(
            &a,
            &Layout::contiguous((2, 1, 2)),
            &b,
            &Layout::contiguous((2, 1)),
        )
        .unwrap();
        assert_eq!(f64s(&out), vec![12.0, 34.0]);
    }

    #[test]
    fn test_index_out_of_range() {
        let s = CpuStorage::F32(vec![1.0, 2.0]);
        let idx = CpuStorage::I64(vec![2]);
        assert!(CpuBackend::index_select(&s, &Layout::contiguous(2), &idx, &Layout::contiguous(1), 0).is_err());
    }
}
