// Default kernels
//
// Native kernels are written once against `Tensor<B>` and therefore run on
// any backend. Ops whose data movement has no Tensor equivalent (GatherNd,
// ScatterNd, UnsortedSegmentSum, OneHot, the fused derivative helpers) read
// their inputs to the host and build the result on the input's device.
//
// Host kernels wrap the f64 routines of `linalg`.

use std::sync::OnceLock;

use marten_core::backprop::unary_derivative;
use marten_core::shape::normalize_axis;
use marten_core::{Backend, DType, Error, ReduceOp, Result, Shape, Tensor, UnaryOp};

use crate::attrs::Attrs;
use crate::linalg::{self, Matrix};
use crate::opdef::{
    block_dims, matmul_output_dims, pad_pairs, reduce_axes, resolve_broadcast_to, resolve_reshape,
    slice_bounds, AbstractTensor, OpSet,
};
use crate::prim;
use crate::registry::{KernelRegistry, KernelTarget};

const FLOATS: &[DType] = &[DType::F32, DType::F64];
const INT_SAFE: &[DType] = &[DType::F32, DType::F64, DType::I64];

fn builtin_ops() -> &'static OpSet {
    static OPS: OnceLock<OpSet> = OnceLock::new();
    OPS.get_or_init(OpSet::builtin)
}

fn input<'a, B: Backend>(inputs: &'a [Tensor<B>], i: usize, op: &str) -> Result<&'a Tensor<B>> {
    inputs
        .get(i)
        .ok_or_else(|| Error::msg(format!("{op}: missing input {i}")))
}

/// Output shape/dtype as the op catalogue infers it.
fn inferred<B: Backend>(op: &str, inputs: &[Tensor<B>], attrs: &Attrs) -> Result<AbstractTensor> {
    let abs: Vec<AbstractTensor> = inputs
        .iter()
        .map(|t| AbstractTensor::new(t.shape().clone(), t.dtype()))
        .collect();
    builtin_ops().infer(op, &abs, attrs)
}

fn axis(attrs: &Attrs, key: &str, default: i64, rank: usize) -> Result<usize> {
    normalize_axis(attrs.int_or(key, default)? as isize, rank)
}

/// Element offsets of the row-major strides of `dims`.
fn strides(dims: &[usize]) -> Vec<usize> {
    Shape::from(dims).stride_contiguous()
}

fn index_value(v: f64, bound: usize, what: &str) -> Result<usize> {
    if v < 0.0 || v as usize >= bound {
        return Err(Error::msg(format!("{what}: index {v} out of range [0, {bound})")));
    }
    Ok(v as usize)
}

// Registration

macro_rules! unary {
    ($reg:expr, $name:expr, $dtypes:expr, |$x:ident, $attrs:ident| $body:expr) => {
        $reg.register_fn(
            $name,
            KernelTarget::Native,
            $dtypes,
            move |inputs: &[Tensor<B>], $attrs: &Attrs| {
                let $x = input(inputs, 0, $name)?;
                Ok(vec![$body?])
            },
        );
    };
}

macro_rules! binary {
    ($reg:expr, $name:expr, $dtypes:expr, |$a:ident, $b:ident| $body:expr) => {
        $reg.register_fn(
            $name,
            KernelTarget::Native,
            $dtypes,
            move |inputs: &[Tensor<B>], _: &Attrs| {
                let $a = input(inputs, 0, $name)?;
                let $b = input(inputs, 1, $name)?;
                Ok(vec![$body?])
            },
        );
    };
}

/// Native kernels for every primitive of the builtin op set.
pub(crate) fn register_native<B: Backend>(reg: &mut KernelRegistry<B>) {
    use KernelTarget::Native;

    binary!(reg, prim::ADD, INT_SAFE, |a, b| a.add(b));
    binary!(reg, prim::SUB, INT_SAFE, |a, b| a.sub(b));
    binary!(reg, prim::MUL, INT_SAFE, |a, b| a.mul(b));
    binary!(reg, prim::DIV, FLOATS, |a, b| a.div(b));
    binary!(reg, prim::MAXIMUM, INT_SAFE, |a, b| a.maximum(b));
    binary!(reg, prim::MINIMUM, INT_SAFE, |a, b| a.minimum(b));
    binary!(reg, prim::POW, FLOATS, |a, b| a.pow(b));
    binary!(reg, prim::EQUAL, INT_SAFE, |a, b| a.eq(b));
    binary!(reg, prim::GREATER, INT_SAFE, |a, b| a.gt(b));
    binary!(reg, prim::LESS, INT_SAFE, |a, b| a.lt(b));
    binary!(reg, prim::BIAS_ADD, FLOATS, |x, bias| x.add(bias));

    unary!(reg, prim::NEG, INT_SAFE, |x, _a| x.neg());
    unary!(reg, prim::ABS, INT_SAFE, |x, _a| x.abs());
    unary!(reg, prim::EXP, FLOATS, |x, _a| x.exp());
    unary!(reg, prim::LOG, FLOATS, |x, _a| x.log());
    unary!(reg, prim::SQRT, FLOATS, |x, _a| x.sqrt());
    unary!(reg, prim::RELU, FLOATS, |x, _a| x.relu());
    unary!(reg, prim::RELU6, FLOATS, |x, _a| x.relu6());
    unary!(reg, prim::HSWISH, FLOATS, |x, _a| x.hswish());
    unary!(reg, prim::LEAKY_RELU, FLOATS, |x, a| x.leaky_relu(a.float_or("alpha", 0.2)?));
    unary!(reg, prim::SIGMOID, FLOATS, |x, _a| x.sigmoid());
    unary!(reg, prim::TANH, FLOATS, |x, _a| x.tanh());
    unary!(reg, prim::GELU, FLOATS, |x, _a| x.gelu());
    unary!(reg, prim::SILU, FLOATS, |x, _a| x.silu());
    unary!(reg, prim::SIN, FLOATS, |x, _a| x.sin());
    unary!(reg, prim::COS, FLOATS, |x, _a| x.cos());
    unary!(reg, prim::SQUARE, INT_SAFE, |x, _a| x.square());
    unary!(reg, prim::FLOOR, FLOATS, |x, _a| x.floor());
    unary!(reg, prim::CEIL, FLOATS, |x, _a| x.ceil());
    unary!(reg, prim::ROUND, FLOATS, |x, _a| x.round());
    unary!(reg, prim::SIGN, INT_SAFE, |x, _a| x.sign());
    unary!(reg, prim::RECIPROCAL, FLOATS, |x, _a| x.recip());
    unary!(reg, prim::IDENTITY, INT_SAFE, |x, _a| Ok::<_, Error>(x.clone()));
    unary!(reg, prim::ZEROS_LIKE, INT_SAFE, |x, _a| Tensor::zeros_like(x));
    unary!(reg, prim::ONES_LIKE, INT_SAFE, |x, _a| Tensor::ones_like(x));
    unary!(reg, prim::CAST, &DType::ALL, |x, a| x.to_dtype(a.dtype("dtype")?));

    for (name, op) in [
        (prim::REDUCE_SUM, ReduceOp::Sum),
        (prim::REDUCE_MEAN, ReduceOp::Mean),
        (prim::REDUCE_MAX, ReduceOp::Max),
        (prim::REDUCE_MIN, ReduceOp::Min),
    ] {
        let dtypes = if op == ReduceOp::Mean { FLOATS } else { INT_SAFE };
        reg.register_fn(name, Native, dtypes, move |inputs: &[Tensor<B>], attrs: &Attrs| {
            let x = input(inputs, 0, name)?;
            let axes = reduce_axes(attrs, x.rank())?;
            let keep = attrs.bool_or("keep_dims", false)?;
            Ok(vec![x.reduce_op(op, &axes, keep)?])
        });
    }
    unary!(reg, prim::ARGMAX, INT_SAFE, |x, a| x.argmax(axis(a, "axis", -1, x.rank())?, false));
    unary!(reg, prim::ARGMIN, INT_SAFE, |x, a| x.argmin(axis(a, "axis", -1, x.rank())?, false));
    unary!(reg, prim::SOFTMAX, FLOATS, |x, a| x.softmax(axis(a, "axis", -1, x.rank())?));
    unary!(reg, prim::LOG_SOFTMAX, FLOATS, |x, a| x.log_softmax(axis(a, "axis", -1, x.rank())?));

    reg.register_fn(prim::MATMUL, Native, INT_SAFE, |inputs: &[Tensor<B>], attrs: &Attrs| {
        let y = matmul(input(inputs, 0, prim::MATMUL)?, input(inputs, 1, prim::MATMUL)?, attrs)?;
        Ok(vec![activation(y, attrs)?])
    });
    reg.register_fn(prim::MATMUL_BIAS_ADD, Native, FLOATS, |inputs: &[Tensor<B>], attrs: &Attrs| {
        let op = prim::MATMUL_BIAS_ADD;
        let y = matmul(input(inputs, 0, op)?, input(inputs, 1, op)?, attrs)?;
        let y = y.add(input(inputs, 2, op)?)?;
        Ok(vec![activation(y, attrs)?])
    });

    // Shape manipulation
    unary!(reg, prim::RESHAPE, INT_SAFE, |x, a| x.reshape(resolve_reshape(x.shape(), &a.ints("shape")?)?));
    unary!(reg, prim::TRANSPOSE, INT_SAFE, |x, a| x.permute(&a.usizes("perm")?));
    unary!(reg, prim::SQUEEZE, INT_SAFE, |x, a| {
        x.reshape(inferred(prim::SQUEEZE, std::slice::from_ref(x), a)?.shape)
    });
    unary!(reg, prim::UNSQUEEZE, INT_SAFE, |x, a| x.unsqueeze(axis(a, "axis", 0, x.rank() + 1)?));
    unary!(reg, prim::BROADCAST_TO, INT_SAFE, |x, a| {
        x.broadcast_as(resolve_broadcast_to(x.shape(), &a.ints("shape")?)?)
    });
    unary!(reg, prim::SLICE, INT_SAFE, |x, a| slice(x, a));
    unary!(reg, prim::PAD, INT_SAFE, |x, a| {
        x.pad(&pad_pairs(a, x.rank())?, a.float_or("value", 0.0)?)
    });
    unary!(reg, prim::SUM_TO_SHAPE, INT_SAFE, |x, a| x.sum_to_shape(&Shape::new(a.usizes("shape")?)));
    unary!(reg, prim::SPLIT, INT_SAFE, |x, a| split(x, a));
    reg.register_fn(prim::CONCAT, Native, INT_SAFE, |inputs: &[Tensor<B>], attrs: &Attrs| {
        let first = input(inputs, 0, prim::CONCAT)?;
        let axis = axis(attrs, "axis", 0, first.rank())?;
        Ok(vec![Tensor::cat(inputs, axis)?])
    });

    // Indexing
    reg.register_fn(prim::GATHER, Native, INT_SAFE, |inputs: &[Tensor<B>], attrs: &Attrs| {
        let params = input(inputs, 0, prim::GATHER)?;
        let indices = input(inputs, 1, prim::GATHER)?;
        let out = inferred(prim::GATHER, inputs, attrs)?;
        let axis = axis(attrs, "axis", 0, params.rank())?;
        let flat = indices.flatten_all()?;
        Ok(vec![params.index_select(axis, &flat)?.reshape(out.shape)?])
    });
    reg.register_fn(prim::GATHER_ND, Native, INT_SAFE, |inputs: &[Tensor<B>], attrs: &Attrs| {
        Ok(vec![gather_nd(inputs, attrs)?])
    });
    reg.register_fn(prim::SCATTER_ND, Native, INT_SAFE, |inputs: &[Tensor<B>], attrs: &Attrs| {
        Ok(vec![scatter_nd(inputs, attrs)?])
    });
    reg.register_fn(
        prim::UNSORTED_SEGMENT_SUM,
        Native,
        INT_SAFE,
        |inputs: &[Tensor<B>], attrs: &Attrs| Ok(vec![unsorted_segment_sum(inputs, attrs)?]),
    );
    reg.register_fn(prim::ONE_HOT, Native, &[DType::I64], |inputs: &[Tensor<B>], attrs: &Attrs| {
        Ok(vec![one_hot(inputs, attrs)?])
    });
    reg.register_fn(prim::SELECT, Native, INT_SAFE, |inputs: &[Tensor<B>], _: &Attrs| {
        let op = prim::SELECT;
        Ok(vec![Tensor::where_cond(
            input(inputs, 0, op)?,
            input(inputs, 1, op)?,
            input(inputs, 2, op)?,
        )?])
    });

    // Losses and fused derivatives
    reg.register_fn(prim::SMOOTH_L1_LOSS, Native, FLOATS, |inputs: &[Tensor<B>], attrs: &Attrs| {
        let op = prim::SMOOTH_L1_LOSS;
        let beta = attrs.float_or("beta", 1.0)?;
        Ok(vec![input(inputs, 0, op)?.smooth_l1_loss(input(inputs, 1, op)?, beta)?])
    });
    reg.register_fn(
        prim::SMOOTH_L1_LOSS_GRAD,
        Native,
        FLOATS,
        |inputs: &[Tensor<B>], attrs: &Attrs| Ok(vec![smooth_l1_grad(inputs, attrs)?]),
    );
    for (name, op) in [(prim::GELU_GRAD, UnaryOp::Gelu), (prim::SILU_GRAD, UnaryOp::Silu)] {
        reg.register_fn(name, Native, FLOATS, move |inputs: &[Tensor<B>], _: &Attrs| {
            let dout = input(inputs, 0, name)?;
            let x = input(inputs, 1, name)?;
            let data: Vec<f64> = dout
                .to_f64_vec()?
                .iter()
                .zip(x.to_f64_vec()?)
                .map(|(g, xv)| g * unary_derivative(op, xv, 0.0))
                .collect();
            Ok(vec![Tensor::from_f64_slice(&data, x.shape().clone(), x.dtype(), x.device())?])
        });
    }
}

fn activation<B: Backend>(y: Tensor<B>, attrs: &Attrs) -> Result<Tensor<B>> {
    match attrs.str_or("activation", String::new())?.as_str() {
        "" => Ok(y),
        "relu" => y.relu(),
        "relu6" => y.relu6(),
        "sigmoid" => y.sigmoid(),
        "tanh" => y.tanh(),
        other => Err(Error::msg(format!("unknown fused activation '{other}'"))),
    }
}

/// `MatMul` with optional transposes, rank-1 promotion and batch tiling.
fn matmul<B: Backend>(a: &Tensor<B>, b: &Tensor<B>, attrs: &Attrs) -> Result<Tensor<B>> {
    let ta = attrs.bool_or("transpose_a", false)?;
    let tb = attrs.bool_or("transpose_b", false)?;
    let out_dims = matmul_output_dims(a.dims(), b.dims(), ta, tb)?;
    let swap_last = |t: &Tensor<B>| t.transpose(t.rank() - 2, t.rank() - 1);
    let mut a2 = match (a.rank(), ta) {
        (1, _) => a.unsqueeze(0)?,
        (_, true) => swap_last(a)?,
        _ => a.clone(),
    };
    let mut b2 = match (b.rank(), tb) {
        (1, _) => b.unsqueeze(1)?,
        (_, true) => swap_last(b)?,
        _ => b.clone(),
    };
    // Batch dims that differ without one being 1 are tiled up to the larger.
    let (batch_a, batch_b) = (a2.rank() - 2, b2.rank() - 2);
    let batch = batch_a.max(batch_b);
    let target: Vec<usize> = (0..batch)
        .map(|i| {
            let da = i.checked_sub(batch - batch_a).map_or(1, |j| a2.dims()[j]);
            let db = i.checked_sub(batch - batch_b).map_or(1, |j| b2.dims()[j]);
            da.max(db)
        })
        .collect();
    for t in [&mut a2, &mut b2] {
        let offset = batch - (t.rank() - 2);
        for d in 0..t.rank() - 2 {
            let (have, want) = (t.dims()[d], target[d + offset]);
            if have != want && have != 1 {
                let copies = vec![t.clone(); want / have];
                *t = Tensor::cat(&copies, d)?;
            }
        }
    }
    a2.matmul(&b2)?.reshape(out_dims)
}

fn slice<B: Backend>(x: &Tensor<B>, attrs: &Attrs) -> Result<Tensor<B>> {
    let bounds = slice_bounds(x.shape(), &attrs.ints("begin")?, &attrs.ints("size")?)?;
    let mut out = x.clone();
    for (d, (start, len)) in bounds.into_iter().enumerate() {
        if start != 0 || len != x.dims()[d] {
            out = out.narrow(d, start, len)?;
        }
    }
    Ok(out)
}

fn split<B: Backend>(x: &Tensor<B>, attrs: &Attrs) -> Result<Tensor<B>> {
    let out = inferred(prim::SPLIT, std::slice::from_ref(x), attrs)?;
    let axis = axis(attrs, "axis", 0, x.rank())?;
    let size = out.dims()[axis];
    let index = attrs.int("index")? as usize;
    x.narrow(axis, index * size, size)
}

fn gather_nd<B: Backend>(inputs: &[Tensor<B>], attrs: &Attrs) -> Result<Tensor<B>> {
    let params = input(inputs, 0, prim::GATHER_ND)?;
    let indices = input(inputs, 1, prim::GATHER_ND)?;
    let out = inferred(prim::GATHER_ND, inputs, attrs)?;
    let k = indices.dims()[indices.rank() - 1];
    let inner: usize = params.dims()[k..].iter().product();
    let pstrides = strides(params.dims());
    let pdata = params.to_f64_vec()?;
    let idata = indices.to_f64_vec()?;
    let mut data = Vec::with_capacity(out.shape.elem_count());
    let rows: usize = indices.dims()[..indices.rank() - 1].iter().product();
    for n in 0..rows {
        let mut offset = 0;
        for j in 0..k {
            offset += index_value(idata[n * k + j], params.dims()[j], "gather_nd")? * pstrides[j];
        }
        data.extend_from_slice(&pdata[offset..offset + inner]);
    }
    Tensor::from_f64_slice(&data, out.shape, params.dtype(), params.device())
}

/// Scatter `updates` into zeros of `shape`; duplicate indices accumulate.
fn scatter_nd<B: Backend>(inputs: &[Tensor<B>], attrs: &Attrs) -> Result<Tensor<B>> {
    let indices = input(inputs, 0, prim::SCATTER_ND)?;
    let updates = input(inputs, 1, prim::SCATTER_ND)?;
    let out = inferred(prim::SCATTER_ND, inputs, attrs)?;
    let k = indices.dims()[indices.rank() - 1];
    let inner: usize = out.dims()[k..].iter().product();
    let ostrides = strides(out.dims());
    let idata = indices.to_f64_vec()?;
    let udata = updates.to_f64_vec()?;
    let mut data = vec![0.0; out.shape.elem_count()];
    let rows: usize = indices.dims()[..indices.rank() - 1].iter().product();
    for n in 0..rows {
        let mut offset = 0;
        for j in 0..k {
            offset += index_value(idata[n * k + j], out.dims()[j], "scatter_nd")? * ostrides[j];
        }
        for (dst, src) in data[offset..offset + inner]
            .iter_mut()
            .zip(&udata[n * inner..(n + 1) * inner])
        {
            *dst += src;
        }
    }
    Tensor::from_f64_slice(&data, out.shape, updates.dtype(), updates.device())
}

/// Sum rows of `data` by segment id; ids outside `[0, num_segments)` are dropped.
fn unsorted_segment_sum<B: Backend>(inputs: &[Tensor<B>], attrs: &Attrs) -> Result<Tensor<B>> {
    let data = input(inputs, 0, prim::UNSORTED_SEGMENT_SUM)?;
    let ids = input(inputs, 1, prim::UNSORTED_SEGMENT_SUM)?;
    let out = inferred(prim::UNSORTED_SEGMENT_SUM, inputs, attrs)?;
    let segments = out.dims()[0];
    let inner: usize = out.dims()[1..].iter().product();
    let values = data.to_f64_vec()?;
    let mut acc = vec![0.0; out.shape.elem_count()];
    for (n, id) in ids.to_f64_vec()?.into_iter().enumerate() {
        if id < 0.0 || id as usize >= segments {
            continue;
        }
        let seg = id as usize;
        for (dst, src) in acc[seg * inner..(seg + 1) * inner]
            .iter_mut()
            .zip(&values[n * inner..(n + 1) * inner])
        {
            *dst += src;
        }
    }
    Tensor::from_f64_slice(&acc, out.shape, data.dtype(), data.device())
}

/// Out-of-range indices produce a row of `off_value`.
fn one_hot<B: Backend>(inputs: &[Tensor<B>], attrs: &Attrs) -> Result<Tensor<B>> {
    let indices = input(inputs, 0, prim::ONE_HOT)?;
    let out = inferred(prim::ONE_HOT, inputs, attrs)?;
    let on = attrs.float_or("on_value", 1.0)?;
    let off = attrs.float_or("off_value", 0.0)?;
    let axis = axis(attrs, "axis", -1, indices.rank() + 1)?;
    let depth = out.dims()[axis];
    let outer: usize = indices.dims()[..axis].iter().product();
    let inner: usize = indices.dims()[axis..].iter().product();
    let idata = indices.to_f64_vec()?;
    let mut data = vec![off; out.shape.elem_count()];
    for o in 0..outer {
        for i in 0..inner {
            let v = idata[o * inner + i];
            if v >= 0.0 && (v as usize) < depth {
                data[(o * depth + v as usize) * inner + i] = on;
            }
        }
    }
    Tensor::from_f64_slice(&data, out.shape, out.dtype, indices.device())
}

/// Derivative of the element-wise smooth L1 loss w.r.t. the prediction.
fn smooth_l1_grad<B: Backend>(inputs: &[Tensor<B>], attrs: &Attrs) -> Result<Tensor<B>> {
    let op = prim::SMOOTH_L1_LOSS_GRAD;
    let pred = input(inputs, 0, op)?;
    let target = input(inputs, 1, op)?;
    let dout = input(inputs, 2, op)?;
    let beta = attrs.float_or("beta", 1.0)?;
    let data: Vec<f64> = pred
        .to_f64_vec()?
        .into_iter()
        .zip(target.to_f64_vec()?)
        .zip(dout.to_f64_vec()?)
        .map(|((p, t), g)| {
            let d = p - t;
            let slope = if d.abs() < beta { d / beta } else { UnaryOp::Sign.apply(d) };
            g * slope
        })
        .collect();
    Tensor::from_f64_slice(&data, pred.shape().clone(), pred.dtype(), pred.device())
}

// Host kernels

fn to_matrix<B: Backend>(t: &Tensor<B>) -> Result<Matrix> {
    let (rows, cols) = block_dims(t.shape())?;
    Matrix::new(rows, cols, t.to_f64_vec()?)
}

fn from_matrix<B: Backend>(m: &Matrix, like: &Tensor<B>) -> Result<Tensor<B>> {
    Tensor::from_f64_slice(&m.data, (m.rows, m.cols), like.dtype(), like.device())
}

/// A right-hand side given as a vector is solved as one column.
fn rhs_matrix<B: Backend>(b: &Tensor<B>) -> Result<Matrix> {
    match b.dims() {
        [n] => Matrix::new(*n, 1, b.to_f64_vec()?),
        _ => to_matrix(b),
    }
}

fn solution<B: Backend>(x: &Matrix, b: &Tensor<B>) -> Result<Tensor<B>> {
    from_matrix(x, b)?.reshape(b.shape().clone())
}

/// Linear algebra kernels, registered for F64 on the host.
pub(crate) fn register_host<B: Backend>(reg: &mut KernelRegistry<B>) {
    use KernelTarget::Host;
    let f64_only = &[DType::F64];

    reg.register_fn(prim::MATRIX_INVERSE, Host, f64_only, |inputs: &[Tensor<B>], _: &Attrs| {
        let a = input(inputs, 0, prim::MATRIX_INVERSE)?;
        Ok(vec![from_matrix(&linalg::inv(&to_matrix(a)?)?, a)?])
    });
    reg.register_fn(prim::CHOLESKY, Host, f64_only, |inputs: &[Tensor<B>], attrs: &Attrs| {
        let a = input(inputs, 0, prim::CHOLESKY)?;
        let lower = attrs.bool_or("lower", true)?;
        Ok(vec![from_matrix(&linalg::cholesky(&to_matrix(a)?, lower)?, a)?])
    });
    reg.register_fn(prim::CHO_SOLVE, Host, f64_only, |inputs: &[Tensor<B>], attrs: &Attrs| {
        let c = input(inputs, 0, prim::CHO_SOLVE)?;
        let b = input(inputs, 1, prim::CHO_SOLVE)?;
        let lower = attrs.bool_or("lower", true)?;
        let x = linalg::cho_solve(&(to_matrix(c)?, lower), &rhs_matrix(b)?)?;
        Ok(vec![solution(&x, b)?])
    });
    reg.register_fn(prim::LU, Host, f64_only, |inputs: &[Tensor<B>], _: &Attrs| {
        let a = input(inputs, 0, prim::LU)?;
        let (p, l, u) = linalg::lu(&to_matrix(a)?)?;
        Ok(vec![from_matrix(&p, a)?, from_matrix(&l, a)?, from_matrix(&u, a)?])
    });
    reg.register_fn(prim::LU_FACTOR, Host, f64_only, |inputs: &[Tensor<B>], _: &Attrs| {
        let a = input(inputs, 0, prim::LU_FACTOR)?;
        let (lu, perm) = linalg::lu_factor(&to_matrix(a)?)?;
        let perm: Vec<i64> = perm.into_iter().map(|p| p as i64).collect();
        let n = perm.len();
        Ok(vec![from_matrix(&lu, a)?, Tensor::from_slice(&perm, n, a.device())?])
    });
    reg.register_fn(prim::LU_SOLVE, Host, f64_only, |inputs: &[Tensor<B>], _: &Attrs| {
        let lu = input(inputs, 0, prim::LU_SOLVE)?;
        let perm = input(inputs, 1, prim::LU_SOLVE)?;
        let b = input(inputs, 2, prim::LU_SOLVE)?;
        let rows = lu.dims().first().copied().unwrap_or(0);
        let perm = perm
            .to_f64_vec()?
            .into_iter()
            .map(|p| index_value(p, rows, "lu_solve"))
            .collect::<Result<Vec<_>>>()?;
        let x = linalg::lu_solve(&(to_matrix(lu)?, perm), &rhs_matrix(b)?)?;
        Ok(vec![solution(&x, b)?])
    });
    reg.register_fn(prim::EIGH, Host, f64_only, |inputs: &[Tensor<B>], attrs: &Attrs| {
        let a = input(inputs, 0, prim::EIGH)?;
        let lower = attrs.bool_or("lower", true)?;
        let (w, v) = linalg::eigh(&to_matrix(a)?, lower)?;
        let n = w.len();
        Ok(vec![
            Tensor::from_f64_slice(&w, n, a.dtype(), a.device())?,
            from_matrix(&v, a)?,
        ])
    });
    reg.register_fn(prim::BLOCK_DIAG, Host, f64_only, |inputs: &[Tensor<B>], _: &Attrs| {
        let first = input(inputs, 0, prim::BLOCK_DIAG)?;
        let blocks = inputs.iter().map(to_matrix).collect::<Result<Vec<_>>>()?;
        Ok(vec![from_matrix(&linalg::block_diag(&blocks), first)?])
    });
}
