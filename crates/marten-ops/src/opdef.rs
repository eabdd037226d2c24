// OpDef / OpSet — the catalogue of primitives and their abstract semantics
//
// An OpDef knows how many inputs a primitive takes, whether autodiff should
// expect a rule for it, and how to compute the output's shape and dtype from
// the inputs' (`infer`). The graph IR runs `infer` over every Apply node; the
// kernels in `kernels.rs` follow the same conventions at run time.
//
// Axis attributes accept negative values counted from the end.

use std::collections::HashMap;
use std::fmt;

use marten_core::shape::normalize_axis;
use marten_core::{DType, Error, Result, Shape};

use crate::attrs::Attrs;
use crate::prim;

/// Shape and dtype of a value, without data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbstractTensor {
    pub shape: Shape,
    pub dtype: DType,
}

impl AbstractTensor {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }
}

impl fmt::Display for AbstractTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// Number of inputs a primitive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variadic { min: usize },
}

impl Arity {
    fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Fixed(k) => n == k,
            Arity::Variadic { min } => n >= min,
        }
    }
}

pub type InferFn = fn(&[AbstractTensor], &Attrs) -> Result<AbstractTensor>;

/// Static description of one primitive.
#[derive(Clone)]
pub struct OpDef {
    pub name: &'static str,
    pub arity: Arity,
    /// When false, autodiff treats the primitive as having zero gradient.
    pub differentiable: bool,
    infer_fn: InferFn,
}

impl fmt::Debug for OpDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpDef")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("differentiable", &self.differentiable)
            .finish()
    }
}

impl OpDef {
    pub fn new(name: &'static str, arity: Arity, differentiable: bool, infer_fn: InferFn) -> Self {
        Self {
            name,
            arity,
            differentiable,
            infer_fn,
        }
    }

    pub fn is_collective(&self) -> bool {
        prim::is_collective(self.name)
    }

    /// Check the input count, then run the primitive's inference rule.
    pub fn infer(&self, inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
        if !self.arity.accepts(inputs.len()) {
            return Err(Error::msg(format!(
                "{} expects {:?} inputs, got {}",
                self.name,
                self.arity,
                inputs.len()
            )));
        }
        (self.infer_fn)(inputs, attrs)
    }
}

/// The set of known primitives, keyed by name.
#[derive(Debug, Clone)]
pub struct OpSet {
    defs: HashMap<&'static str, OpDef>,
}

impl Default for OpSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl OpSet {
    pub fn empty() -> Self {
        Self {
            defs: HashMap::new(),
        }
    }

    /// Every built-in primitive.
    pub fn builtin() -> Self {
        use Arity::{Fixed, Variadic};
        let mut set = Self::empty();
        for name in prim::BINARY {
            set.register(OpDef::new(name, Fixed(2), true, infer_binary));
        }
        for name in prim::COMPARE {
            set.register(OpDef::new(name, Fixed(2), false, infer_compare));
        }
        for name in prim::UNARY {
            let differentiable = !matches!(
                name,
                prim::FLOOR | prim::CEIL | prim::ROUND | prim::SIGN | prim::ZEROS_LIKE | prim::ONES_LIKE
            );
            set.register(OpDef::new(name, Fixed(1), differentiable, infer_same));
        }
        for name in prim::REDUCE {
            set.register(OpDef::new(name, Fixed(1), true, infer_reduce));
        }
        set.register(OpDef::new(prim::CAST, Fixed(1), true, infer_cast));
        set.register(OpDef::new(prim::GELU_GRAD, Fixed(2), true, infer_elementwise_grad));
        set.register(OpDef::new(prim::SILU_GRAD, Fixed(2), true, infer_elementwise_grad));
        set.register(OpDef::new(prim::SMOOTH_L1_LOSS_GRAD, Fixed(3), true, infer_smooth_l1_grad));
        set.register(OpDef::new(prim::MATMUL, Fixed(2), true, infer_matmul));
        set.register(OpDef::new(prim::MATMUL_BIAS_ADD, Fixed(3), true, infer_matmul_bias_add));
        set.register(OpDef::new(prim::BIAS_ADD, Fixed(2), true, infer_bias_add));
        set.register(OpDef::new(prim::ARGMAX, Fixed(1), false, infer_arg_reduce));
        set.register(OpDef::new(prim::ARGMIN, Fixed(1), false, infer_arg_reduce));
        set.register(OpDef::new(prim::SOFTMAX, Fixed(1), true, infer_axis_preserving));
        set.register(OpDef::new(prim::LOG_SOFTMAX, Fixed(1), true, infer_axis_preserving));
        set.register(OpDef::new(prim::RESHAPE, Fixed(1), true, infer_reshape));
        set.register(OpDef::new(prim::TRANSPOSE, Fixed(1), true, infer_transpose));
        set.register(OpDef::new(prim::SQUEEZE, Fixed(1), true, infer_squeeze));
        set.register(OpDef::new(prim::UNSQUEEZE, Fixed(1), true, infer_unsqueeze));
        set.register(OpDef::new(prim::BROADCAST_TO, Fixed(1), true, infer_broadcast_to));
        set.register(OpDef::new(prim::CONCAT, Variadic { min: 1 }, true, infer_concat));
        set.register(OpDef::new(prim::SLICE, Fixed(1), true, infer_slice));
        set.register(OpDef::new(prim::GATHER, Fixed(2), true, infer_gather));
        set.register(OpDef::new(prim::GATHER_ND, Fixed(2), true, infer_gather_nd));
        set.register(OpDef::new(prim::SCATTER_ND, Fixed(2), true, infer_scatter_nd));
        set.register(OpDef::new(
            prim::UNSORTED_SEGMENT_SUM,
            Fixed(2),
            true,
            infer_unsorted_segment_sum,
        ));
        set.register(OpDef::new(prim::ONE_HOT, Fixed(1), false, infer_one_hot));
        set.register(OpDef::new(prim::PAD, Fixed(1), true, infer_pad));
        set.register(OpDef::new(prim::SELECT, Fixed(3), true, infer_select));
        set.register(OpDef::new(prim::SMOOTH_L1_LOSS, Fixed(2), true, infer_smooth_l1));
        set.register(OpDef::new(prim::SUM_TO_SHAPE, Fixed(1), true, infer_sum_to_shape));
        set.register(OpDef::new(prim::SPLIT, Fixed(1), true, infer_split));
        set.register(OpDef::new(prim::ALL_REDUCE, Fixed(1), true, infer_same));
        set.register(OpDef::new(prim::BROADCAST, Fixed(1), true, infer_same));
        set.register(OpDef::new(prim::ALL_GATHER, Fixed(1), true, infer_all_gather));
        set.register(OpDef::new(prim::REDUCE_SCATTER, Fixed(1), true, infer_reduce_scatter));
        set.register(OpDef::new(prim::ALL_TO_ALL, Fixed(1), true, infer_all_to_all));
        set.register(OpDef::new(prim::MATRIX_INVERSE, Fixed(1), true, infer_square_matrix));
        set.register(OpDef::new(prim::CHOLESKY, Fixed(1), true, infer_square_matrix));
        set.register(OpDef::new(prim::BLOCK_DIAG, Variadic { min: 1 }, true, infer_block_diag));
        set
    }

    pub fn register(&mut self, def: OpDef) {
        self.defs.insert(def.name, def);
    }

    pub fn get(&self, name: &str) -> Result<&OpDef> {
        self.defs
            .get(name)
            .ok_or_else(|| Error::msg(format!("unknown primitive '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    /// Names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.defs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn infer(&self, name: &str, inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
        self.get(name)?.infer(inputs, attrs)
    }
}

// Shared helpers

fn same_dtype(a: &AbstractTensor, b: &AbstractTensor) -> Result<DType> {
    if a.dtype != b.dtype {
        return Err(Error::DTypeMismatch {
            expected: a.dtype,
            got: b.dtype,
        });
    }
    Ok(a.dtype)
}

fn require_integer(t: &AbstractTensor, what: &str) -> Result<()> {
    if t.dtype.is_float() {
        return Err(Error::msg(format!("{what} must have an integer dtype, got {}", t.dtype)));
    }
    Ok(())
}

fn axis_attr(attrs: &Attrs, key: &str, default: i64, rank: usize) -> Result<usize> {
    normalize_axis(attrs.int_or(key, default)? as isize, rank)
}

fn positive_attr(attrs: &Attrs, key: &str) -> Result<usize> {
    let v = attrs.int(key)?;
    if v < 1 {
        return Err(Error::msg(format!("attribute '{key}' must be >= 1, got {v}")));
    }
    Ok(v as usize)
}

/// Axes of a reduction; an empty list means every axis.
pub fn reduce_axes(attrs: &Attrs, rank: usize) -> Result<Vec<usize>> {
    let mut axes = attrs
        .ints_or("axis", Vec::new())?
        .into_iter()
        .map(|a| normalize_axis(a as isize, rank))
        .collect::<Result<Vec<_>>>()?;
    axes.sort_unstable();
    axes.dedup();
    Ok(axes)
}

/// Resolve a target shape with at most one `-1` entry against `src`.
pub fn resolve_reshape(src: &Shape, target: &[i64]) -> Result<Shape> {
    let mut infer_at = None;
    let mut known = 1usize;
    for (i, &d) in target.iter().enumerate() {
        match d {
            -1 if infer_at.is_none() => infer_at = Some(i),
            -1 => return Err(Error::msg("reshape: more than one -1 in target shape")),
            d if d < 0 => return Err(Error::msg(format!("reshape: invalid dim {d}"))),
            d => known *= d as usize,
        }
    }
    let mut dims: Vec<usize> = target.iter().map(|&d| d.max(0) as usize).collect();
    let src_count = src.elem_count();
    if let Some(i) = infer_at {
        if known == 0 || src_count % known != 0 {
            return Err(Error::ReshapeElementMismatch {
                src: src_count,
                dst: known,
                dst_shape: Shape::new(dims),
            });
        }
        dims[i] = src_count / known;
    }
    let shape = Shape::new(dims);
    if shape.elem_count() != src_count {
        return Err(Error::ReshapeElementMismatch {
            src: src_count,
            dst: shape.elem_count(),
            dst_shape: shape,
        });
    }
    Ok(shape)
}

/// Output dims of `MatMul` plus the batch broadcast.
///
/// Rank-1 operands are promoted (`[k]` as `[1, k]` on the left, `[k, 1]` on
/// the right) and the promoted dim is removed from the result. Batch dims are
/// aligned from the right; when they differ the larger must be a multiple of
/// the smaller, and the result takes the larger.
pub fn matmul_output_dims(a: &[usize], b: &[usize], transpose_a: bool, transpose_b: bool) -> Result<Vec<usize>> {
    if a.is_empty() || b.is_empty() {
        return Err(Error::RankMismatch {
            expected: 1,
            got: 0,
        });
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    let del_start = a.len() == 1;
    let del_end = b.len() == 1;
    if del_start {
        a.insert(0, 1);
    }
    if del_end {
        b.push(1);
    }
    let (ra, rb) = (a.len(), b.len());
    if transpose_a && !del_start {
        a.swap(ra - 1, ra - 2);
    }
    if transpose_b && !del_end {
        b.swap(rb - 1, rb - 2);
    }
    let (m, k1) = (a[ra - 2], a[ra - 1]);
    let (k2, n) = (b[rb - 2], b[rb - 1]);
    if k1 != k2 {
        return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
    }
    let batch_rank = (ra - 2).max(rb - 2);
    let mut out = Vec::with_capacity(batch_rank + 2);
    for i in 0..batch_rank {
        let da = if i + (ra - 2) >= batch_rank { a[i + (ra - 2) - batch_rank] } else { 1 };
        let db = if i + (rb - 2) >= batch_rank { b[i + (rb - 2) - batch_rank] } else { 1 };
        if da == db {
            out.push(da);
            continue;
        }
        let (lo, hi) = (da.min(db), da.max(db));
        if lo == 0 || hi % lo != 0 {
            return Err(Error::msg(format!(
                "matmul batch dims {da} and {db} are incompatible"
            )));
        }
        out.push(hi);
    }
    if !del_start {
        out.push(m);
    }
    if !del_end {
        out.push(n);
    }
    Ok(out)
}

// Inference rules

fn infer_same(inputs: &[AbstractTensor], _: &Attrs) -> Result<AbstractTensor> {
    Ok(inputs[0].clone())
}

fn infer_binary(inputs: &[AbstractTensor], _: &Attrs) -> Result<AbstractTensor> {
    let dtype = same_dtype(&inputs[0], &inputs[1])?;
    let shape = Shape::broadcast_shape(&inputs[0].shape, &inputs[1].shape)?;
    Ok(AbstractTensor { shape, dtype })
}

fn infer_compare(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let out = infer_binary(inputs, attrs)?;
    Ok(AbstractTensor::new(out.shape, DType::U8))
}

fn infer_cast(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    Ok(AbstractTensor::new(inputs[0].shape.clone(), attrs.dtype("dtype")?))
}

/// `(dout, x)` pairs of an elementwise derivative.
fn infer_elementwise_grad(inputs: &[AbstractTensor], _: &Attrs) -> Result<AbstractTensor> {
    same_dtype(&inputs[0], &inputs[1])?;
    if inputs[0].shape != inputs[1].shape {
        return Err(Error::ShapeMismatch {
            expected: inputs[1].shape.clone(),
            got: inputs[0].shape.clone(),
        });
    }
    Ok(inputs[1].clone())
}

fn infer_matmul(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let dtype = same_dtype(&inputs[0], &inputs[1])?;
    let dims = matmul_output_dims(
        inputs[0].dims(),
        inputs[1].dims(),
        attrs.bool_or("transpose_a", false)?,
        attrs.bool_or("transpose_b", false)?,
    )?;
    Ok(AbstractTensor::new(dims, dtype))
}

fn infer_matmul_bias_add(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let out = infer_matmul(&inputs[..2], attrs)?;
    infer_bias_add(&[out, inputs[2].clone()], attrs)
}

/// The bias is 1-D and runs along the last dim.
fn infer_bias_add(inputs: &[AbstractTensor], _: &Attrs) -> Result<AbstractTensor> {
    let (x, bias) = (&inputs[0], &inputs[1]);
    same_dtype(x, bias)?;
    let last = x.dims().last().copied().unwrap_or(1);
    if bias.rank() != 1 || bias.dims()[0] != last {
        return Err(Error::ShapeMismatch {
            expected: Shape::from(last),
            got: bias.shape.clone(),
        });
    }
    Ok(x.clone())
}

fn infer_reduce(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let axes = reduce_axes(attrs, x.rank())?;
    let keep = attrs.bool_or("keep_dims", false)?;
    Ok(AbstractTensor::new(x.shape.reduced(&axes, keep), x.dtype))
}

fn infer_arg_reduce(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let axis = axis_attr(attrs, "axis", -1, x.rank())?;
    Ok(AbstractTensor::new(x.shape.reduced(&[axis], false), DType::I64))
}

fn infer_axis_preserving(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    axis_attr(attrs, "axis", -1, inputs[0].rank())?;
    Ok(inputs[0].clone())
}

fn infer_reshape(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let shape = resolve_reshape(&inputs[0].shape, &attrs.ints("shape")?)?;
    Ok(AbstractTensor::new(shape, inputs[0].dtype))
}

fn infer_transpose(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let perm = attrs.usizes("perm")?;
    let mut seen = vec![false; x.rank()];
    if perm.len() != x.rank() {
        return Err(Error::RankMismatch {
            expected: x.rank(),
            got: perm.len(),
        });
    }
    for &p in &perm {
        if p >= x.rank() || seen[p] {
            return Err(Error::msg(format!("transpose: {perm:?} is not a permutation")));
        }
        seen[p] = true;
    }
    let dims: Vec<usize> = perm.iter().map(|&p| x.dims()[p]).collect();
    Ok(AbstractTensor::new(dims, x.dtype))
}

fn infer_squeeze(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let axes = reduce_axes(attrs, x.rank())?;
    let mut dims = Vec::with_capacity(x.rank());
    for (i, &d) in x.dims().iter().enumerate() {
        if axes.is_empty() {
            if d != 1 {
                dims.push(d);
            }
        } else if axes.contains(&i) {
            if d != 1 {
                return Err(Error::msg(format!("squeeze: dim {i} has size {d}, expected 1")));
            }
        } else {
            dims.push(d);
        }
    }
    Ok(AbstractTensor::new(dims, x.dtype))
}

fn infer_unsqueeze(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let axis = axis_attr(attrs, "axis", 0, x.rank() + 1)?;
    let mut dims = x.dims().to_vec();
    dims.insert(axis, 1);
    Ok(AbstractTensor::new(dims, x.dtype))
}

/// Target dims of `BroadcastTo`; `-1` keeps the input's dim.
pub fn resolve_broadcast_to(src: &Shape, target: &[i64]) -> Result<Shape> {
    if target.len() < src.rank() {
        return Err(Error::RankMismatch {
            expected: src.rank(),
            got: target.len(),
        });
    }
    let offset = target.len() - src.rank();
    let mut dims = Vec::with_capacity(target.len());
    for (i, &d) in target.iter().enumerate() {
        if d == -1 {
            if i < offset {
                return Err(Error::msg("broadcast_to: -1 in a new leading dim"));
            }
            dims.push(src.dims()[i - offset]);
        } else if d < 0 {
            return Err(Error::msg(format!("broadcast_to: invalid dim {d}")));
        } else {
            dims.push(d as usize);
        }
    }
    let shape = Shape::new(dims);
    if Shape::broadcast_shape(src, &shape)? != shape {
        return Err(Error::ShapeMismatch {
            expected: shape,
            got: src.clone(),
        });
    }
    Ok(shape)
}

fn infer_broadcast_to(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let shape = resolve_broadcast_to(&inputs[0].shape, &attrs.ints("shape")?)?;
    Ok(AbstractTensor::new(shape, inputs[0].dtype))
}

fn infer_concat(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let first = &inputs[0];
    let axis = axis_attr(attrs, "axis", 0, first.rank())?;
    let mut dims = first.dims().to_vec();
    for t in &inputs[1..] {
        same_dtype(first, t)?;
        if t.rank() != first.rank() {
            return Err(Error::RankMismatch {
                expected: first.rank(),
                got: t.rank(),
            });
        }
        for (d, (&a, &b)) in first.dims().iter().zip(t.dims()).enumerate() {
            if d != axis && a != b {
                return Err(Error::ShapeMismatch {
                    expected: first.shape.clone(),
                    got: t.shape.clone(),
                });
            }
        }
        dims[axis] += t.dims()[axis];
    }
    Ok(AbstractTensor::new(dims, first.dtype))
}

/// `(start, len)` per dim of a `Slice`; a size of `-1` runs to the end.
pub fn slice_bounds(shape: &Shape, begin: &[i64], size: &[i64]) -> Result<Vec<(usize, usize)>> {
    if begin.len() != shape.rank() || size.len() != shape.rank() {
        return Err(Error::RankMismatch {
            expected: shape.rank(),
            got: begin.len().max(size.len()),
        });
    }
    let mut out = Vec::with_capacity(shape.rank());
    for (d, &dim_size) in shape.dims().iter().enumerate() {
        if begin[d] < 0 {
            return Err(Error::msg(format!("slice: negative begin {} on dim {d}", begin[d])));
        }
        let start = begin[d] as usize;
        let len = if size[d] == -1 {
            dim_size.saturating_sub(start)
        } else {
            size[d].max(0) as usize
        };
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim: d,
                start,
                len,
                dim_size,
            });
        }
        out.push((start, len));
    }
    Ok(out)
}

fn infer_slice(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let bounds = slice_bounds(&x.shape, &attrs.ints("begin")?, &attrs.ints("size")?)?;
    let dims: Vec<usize> = bounds.iter().map(|&(_, len)| len).collect();
    Ok(AbstractTensor::new(dims, x.dtype))
}

fn infer_gather(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let (params, indices) = (&inputs[0], &inputs[1]);
    require_integer(indices, "gather indices")?;
    let axis = axis_attr(attrs, "axis", 0, params.rank())?;
    let mut dims = params.dims()[..axis].to_vec();
    dims.extend_from_slice(indices.dims());
    dims.extend_from_slice(&params.dims()[axis + 1..]);
    Ok(AbstractTensor::new(dims, params.dtype))
}

fn infer_gather_nd(inputs: &[AbstractTensor], _: &Attrs) -> Result<AbstractTensor> {
    let (params, indices) = (&inputs[0], &inputs[1]);
    require_integer(indices, "gather_nd indices")?;
    let k = match indices.dims().last() {
        Some(&k) => k,
        None => return Err(Error::msg("gather_nd: indices must have rank >= 1")),
    };
    if k > params.rank() {
        return Err(Error::msg(format!(
            "gather_nd: index depth {k} exceeds params rank {}",
            params.rank()
        )));
    }
    let mut dims = indices.dims()[..indices.rank() - 1].to_vec();
    dims.extend_from_slice(&params.dims()[k..]);
    Ok(AbstractTensor::new(dims, params.dtype))
}

fn infer_scatter_nd(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let (indices, updates) = (&inputs[0], &inputs[1]);
    require_integer(indices, "scatter_nd indices")?;
    let shape = Shape::new(attrs.usizes("shape")?);
    let k = match indices.dims().last() {
        Some(&k) if k <= shape.rank() => k,
        _ => return Err(Error::msg("scatter_nd: index depth must be in 1..=rank(shape)")),
    };
    let mut expected = indices.dims()[..indices.rank() - 1].to_vec();
    expected.extend_from_slice(&shape.dims()[k..]);
    if updates.dims() != expected.as_slice() {
        return Err(Error::ShapeMismatch {
            expected: Shape::new(expected),
            got: updates.shape.clone(),
        });
    }
    Ok(AbstractTensor::new(shape, updates.dtype))
}

fn infer_unsorted_segment_sum(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let (data, ids) = (&inputs[0], &inputs[1]);
    require_integer(ids, "segment ids")?;
    let segments = positive_attr(attrs, "num_segments")?;
    if ids.rank() > data.rank() || data.dims()[..ids.rank()] != *ids.dims() {
        return Err(Error::ShapeMismatch {
            expected: data.shape.clone(),
            got: ids.shape.clone(),
        });
    }
    let mut dims = vec![segments];
    dims.extend_from_slice(&data.dims()[ids.rank()..]);
    Ok(AbstractTensor::new(dims, data.dtype))
}

fn infer_one_hot(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let indices = &inputs[0];
    require_integer(indices, "one_hot indices")?;
    let depth = positive_attr(attrs, "depth")?;
    let axis = axis_attr(attrs, "axis", -1, indices.rank() + 1)?;
    let mut dims = indices.dims().to_vec();
    dims.insert(axis, depth);
    Ok(AbstractTensor::new(dims, attrs.dtype_or("dtype", DType::F32)?))
}

/// `[before, after]` per dim from a flat `paddings` attribute.
pub fn pad_pairs(attrs: &Attrs, rank: usize) -> Result<Vec<[usize; 2]>> {
    let flat = attrs.usizes("paddings")?;
    if flat.len() != 2 * rank {
        return Err(Error::msg(format!(
            "pad: expected {} padding values, got {}",
            2 * rank,
            flat.len()
        )));
    }
    Ok(flat.chunks(2).map(|c| [c[0], c[1]]).collect())
}

fn infer_pad(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let pairs = pad_pairs(attrs, x.rank())?;
    let dims: Vec<usize> = x
        .dims()
        .iter()
        .zip(&pairs)
        .map(|(&d, [b, a])| d + b + a)
        .collect();
    Ok(AbstractTensor::new(dims, x.dtype))
}

fn infer_select(inputs: &[AbstractTensor], _: &Attrs) -> Result<AbstractTensor> {
    let (cond, x, y) = (&inputs[0], &inputs[1], &inputs[2]);
    let dtype = same_dtype(x, y)?;
    let shape = Shape::broadcast_shape(&Shape::broadcast_shape(&cond.shape, &x.shape)?, &y.shape)?;
    Ok(AbstractTensor { shape, dtype })
}

fn infer_smooth_l1(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    if attrs.float_or("beta", 1.0)? <= 0.0 {
        return Err(Error::msg("smooth_l1_loss: beta must be positive"));
    }
    same_dtype(&inputs[0], &inputs[1])?;
    if inputs[0].shape != inputs[1].shape {
        return Err(Error::ShapeMismatch {
            expected: inputs[0].shape.clone(),
            got: inputs[1].shape.clone(),
        });
    }
    Ok(inputs[0].clone())
}

/// `(prediction, target, dout)`.
fn infer_smooth_l1_grad(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let out = infer_smooth_l1(&inputs[..2], attrs)?;
    infer_elementwise_grad(&[inputs[2].clone(), out], attrs)
}

fn infer_sum_to_shape(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let shape = Shape::new(attrs.usizes("shape")?);
    if Shape::broadcast_shape(&shape, &x.shape)? != x.shape {
        return Err(Error::ShapeMismatch {
            expected: x.shape.clone(),
            got: shape,
        });
    }
    Ok(AbstractTensor::new(shape, x.dtype))
}

fn infer_split(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let axis = axis_attr(attrs, "axis", 0, x.rank())?;
    let parts = positive_attr(attrs, "parts")?;
    let index = attrs.int("index")?;
    if index < 0 || index as usize >= parts {
        return Err(Error::msg(format!("split: index {index} out of range for {parts} parts")));
    }
    let mut dims = x.dims().to_vec();
    if dims[axis] % parts != 0 {
        return Err(Error::strategy(format!(
            "dim {axis} of size {} is not divisible into {parts} parts",
            dims[axis]
        )));
    }
    dims[axis] /= parts;
    Ok(AbstractTensor::new(dims, x.dtype))
}

fn infer_all_gather(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let axis = axis_attr(attrs, "axis", 0, x.rank())?;
    let group = positive_attr(attrs, "group_size")?;
    let mut dims = x.dims().to_vec();
    dims[axis] *= group;
    Ok(AbstractTensor::new(dims, x.dtype))
}

fn infer_reduce_scatter(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let split = Attrs::new()
        .with("axis", attrs.int_or("axis", 0)?)
        .with("parts", attrs.int("group_size")?)
        .with("index", 0i64);
    infer_split(&[x.clone()], &split)
}

fn infer_all_to_all(inputs: &[AbstractTensor], attrs: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    let split_axis = axis_attr(attrs, "split_axis", 0, x.rank())?;
    let concat_axis = axis_attr(attrs, "concat_axis", 0, x.rank())?;
    let group = positive_attr(attrs, "group_size")?;
    let mut dims = x.dims().to_vec();
    if dims[split_axis] % group != 0 {
        return Err(Error::strategy(format!(
            "all_to_all: dim {split_axis} of size {} is not divisible by group size {group}",
            dims[split_axis]
        )));
    }
    dims[split_axis] /= group;
    dims[concat_axis] *= group;
    Ok(AbstractTensor::new(dims, x.dtype))
}

fn infer_square_matrix(inputs: &[AbstractTensor], _: &Attrs) -> Result<AbstractTensor> {
    let x = &inputs[0];
    if x.rank() != 2 || x.dims()[0] != x.dims()[1] {
        return Err(Error::msg(format!("expected a square matrix, got shape {}", x.shape)));
    }
    if !x.dtype.is_float() {
        return Err(Error::msg(format!("expected a float matrix, got {}", x.dtype)));
    }
    Ok(x.clone())
}

/// Rows and columns a `block_diag` operand contributes.
pub fn block_dims(shape: &Shape) -> Result<(usize, usize)> {
    match shape.dims() {
        [] => Ok((1, 1)),
        [n] => Ok((1, *n)),
        [r, c] => Ok((*r, *c)),
        _ => Err(Error::msg(format!("block_diag: operand of rank {} is not a matrix", shape.rank()))),
    }
}

fn infer_block_diag(inputs: &[AbstractTensor], _: &Attrs) -> Result<AbstractTensor> {
    let (mut rows, mut cols) = (0, 0);
    for t in inputs {
        same_dtype(&inputs[0], t)?;
        let (r, c) = block_dims(&t.shape)?;
        rows += r;
        cols += c;
    }
    Ok(AbstractTensor::new((rows, cols), inputs[0].dtype))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(dims: &[usize]) -> AbstractTensor {
        AbstractTensor::new(dims, DType::F32)
    }

    #[test]
    fn test_matmul_transposes_and_promotion() {
        assert_eq!(matmul_output_dims(&[2, 3], &[3, 4], false, false).unwrap(), vec![2, 4]);
        assert_eq!(matmul_output_dims(&[3, 2], &[4, 3], true, true).unwrap(), vec![2, 4]);
        assert_eq!(matmul_output_dims(&[3], &[3, 4], false, false).unwrap(), vec![4]);
        assert_eq!(matmul_output_dims(&[2, 3], &[3], false, false).unwrap(), vec![2]);
        assert_eq!(matmul_output_dims(&[4, 2, 3], &[2, 3, 5], false, false).unwrap(), vec![4, 2, 5]);
        assert!(matmul_output_dims(&[3, 2, 3], &[2, 3, 5], false, false).is_err());
        assert!(matches!(
            matmul_output_dims(&[2, 3], &[4, 5], false, false),
            Err(Error::MatmulShapeMismatch { m: 2, k1: 3, k2: 4, n: 5 })
        ));
    }

    #[test]
    fn test_reduce_negative_axes() {
        let set = OpSet::builtin();
        let attrs = Attrs::new().with("axis", vec![-1i64]).with("keep_dims", true);
        let out = set.infer(prim::REDUCE_SUM, &[at(&[2, 3, 4])], &attrs).unwrap();
        assert_eq!(out.dims(), &[2, 3, 1]);
        let out = set.infer(prim::REDUCE_MEAN, &[at(&[2, 3])], &Attrs::new()).unwrap();
        assert_eq!(out.dims(), &[] as &[usize]);
    }

    #[test]
    fn test_gather_and_gather_nd() {
        let set = OpSet::builtin();
        let idx = AbstractTensor::new([4, 2], DType::I64);
        let out = set
            .infer(prim::GATHER, &[at(&[5, 6, 7]), idx.clone()], &Attrs::new().with("axis", 1i64))
            .unwrap();
        assert_eq!(out.dims(), &[5, 4, 2, 7]);
        let out = set.infer(prim::GATHER_ND, &[at(&[5, 6, 7]), idx], &Attrs::new()).unwrap();
        assert_eq!(out.dims(), &[4, 7]);
        assert!(set
            .infer(prim::GATHER, &[at(&[5]), at(&[2])], &Attrs::new())
            .is_err());
    }

    #[test]
    fn test_squeeze_non_unit_axis_fails() {
        let set = OpSet::builtin();
        let x = at(&[1, 3, 1]);
        assert_eq!(set.infer(prim::SQUEEZE, &[x.clone()], &Attrs::new()).unwrap().dims(), &[3]);
        let attrs = Attrs::new().with("axis", vec![1i64]);
        assert!(set.infer(prim::SQUEEZE, &[x], &attrs).is_err());
    }

    #[test]
    fn test_one_hot_and_concat() {
        let set = OpSet::builtin();
        let idx = AbstractTensor::new([3], DType::I64);
        let out = set
            .infer(prim::ONE_HOT, &[idx], &Attrs::new().with("depth", 5i64))
            .unwrap();
        assert_eq!(out, AbstractTensor::new([3, 5], DType::F32));
        let attrs = Attrs::new().with("axis", 1i64);
        let out = set.infer(prim::CONCAT, &[at(&[2, 3]), at(&[2, 4])], &attrs).unwrap();
        assert_eq!(out.dims(), &[2, 7]);
        assert!(set.infer(prim::CONCAT, &[at(&[2, 3]), at(&[3, 3])], &attrs).is_err());
    }

    #[test]
    fn test_reshape_infers_minus_one() {
        let s = resolve_reshape(&Shape::from((2, 6)), &[3, -1]).unwrap();
        assert_eq!(s.dims(), &[3, 4]);
        assert!(resolve_reshape(&Shape::from((2, 6)), &[5, -1]).is_err());
        assert!(resolve_reshape(&Shape::from((2, 6)), &[-1, -1]).is_err());
    }

    #[test]
    fn test_arity_is_checked() {
        let set = OpSet::builtin();
        assert!(set.infer(prim::ADD, &[at(&[2])], &Attrs::new()).is_err());
        assert!(set.infer("NoSuchOp", &[], &Attrs::new()).is_err());
    }

    #[test]
    fn test_collective_shapes() {
        let set = OpSet::builtin();
        let attrs = Attrs::new().with("axis", 0i64).with("group_size", 4i64);
        assert_eq!(set.infer(prim::ALL_GATHER, &[at(&[2, 3])], &attrs).unwrap().dims(), &[8, 3]);
        assert_eq!(set.infer(prim::REDUCE_SCATTER, &[at(&[8, 3])], &attrs).unwrap().dims(), &[2, 3]);
        assert!(set.infer(prim::REDUCE_SCATTER, &[at(&[6, 3])], &attrs).is_err());
        let a2a = Attrs::new()
            .with("split_axis", 1i64)
            .with("concat_axis", 0i64)
            .with("group_size", 2i64);
        assert_eq!(set.infer(prim::ALL_TO_ALL, &[at(&[2, 4])], &a2a).unwrap().dims(), &[4, 2]);
        assert!(set.get(prim::ALL_REDUCE).unwrap().is_collective());
    }
}
