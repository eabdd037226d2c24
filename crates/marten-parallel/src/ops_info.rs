// Operator sharding rules
//
// Every rule describes its operator as a set of "op dims" (the loop
// dimensions of the computation) and says which op dim each input and
// output dim runs along, much like an einsum:
//
//   MatMul  a[m, k] @ b[k, n] -> out[m, n]     op dims (m, n, k)
//   Add     x[b, c] + y[c]    -> out[b, c]     op dims (b, c), y.0 -> c
//   Sum     x[b, c] over c    -> out[b]        op dims (b, c)
//
// Splitting an op dim splits every tensor dim that runs along it, so one
// mesh-axis assignment per op dim yields all input and output layouts.
// Op dims that no output dim runs along are reduced by the operator; if
// one of them is split, every rank holds a partial result that the
// operator's reduction kind (sum for matmul, max for ReduceMax...) has to
// combine. Rules mark op dims that must stay whole (a softmax axis, the
// contracting dim of a fused matmul) as unsplittable.
//
// An assignment comes either from a user strategy (split counts per input
// dim, mapped onto free mesh axes left to right) or from the layouts the
// inputs already have.

use marten_core::{Error, Result};
use marten_ops::{opdef, prim, AbstractTensor, Attrs};

use crate::layout::{claim_axis, PartialOp, Strategy, TensorLayout};
use crate::mesh::DeviceMesh;

/// Everything a rule may look at.
#[derive(Debug, Clone, Copy)]
pub struct OpContext<'a> {
    pub prim: &'a str,
    pub attrs: &'a Attrs,
    pub inputs: &'a [AbstractTensor],
    pub output: &'a AbstractTensor,
    pub mesh: &'a DeviceMesh,
}

/// Required input layouts and the resulting output layout of one
/// application. A split reduced dim leaves `output.partial` set.
#[derive(Debug, Clone, PartialEq)]
pub struct OpLayouts {
    pub inputs: Vec<TensorLayout>,
    pub output: TensorLayout,
}

/// The op-dim description of one application.
#[derive(Debug, Clone, PartialEq)]
pub struct DimMapping {
    pub op_dims: usize,
    /// Per input, the op dim each tensor dim runs along; `None` dims stay whole.
    pub inputs: Vec<Vec<Option<usize>>>,
    pub output: Vec<Option<usize>>,
    pub unsplittable: Vec<usize>,
    /// How split reduced op dims combine; `None` forbids splitting them.
    pub reduction: Option<PartialOp>,
}

impl DimMapping {
    fn new(op_dims: usize) -> Self {
        Self {
            op_dims,
            inputs: Vec::new(),
            output: Vec::new(),
            unsplittable: Vec::new(),
            reduction: None,
        }
    }

    fn in_output(&self, d: usize) -> bool {
        self.output.contains(&Some(d))
    }

    /// Mesh axes (tensor-map numbering) per op dim from split counts.
    pub fn axes_from_strategy(&self, mesh: &DeviceMesh, strategy: &Strategy) -> Result<Vec<Option<i64>>> {
        if strategy.len() != self.inputs.len() {
            return Err(Error::strategy(format!(
                "strategy has {} entries for {} inputs",
                strategy.len(),
                self.inputs.len()
            )));
        }
        let mut splits: Vec<Option<usize>> = vec![None; self.op_dims];
        for (i, (dims, input)) in strategy.iter().zip(&self.inputs).enumerate() {
            if dims.len() != input.len() {
                return Err(Error::strategy(format!(
                    "strategy {dims:?} for input {i} does not match its rank {}",
                    input.len()
                )));
            }
            for (j, (&s, op_dim)) in dims.iter().zip(input).enumerate() {
                if s == 0 {
                    return Err(Error::strategy(format!("input {i} dim {j} has split 0")));
                }
                match op_dim {
                    Some(d) => match splits[*d] {
                        Some(prev) if prev != s => {
                            return Err(Error::strategy(format!(
                                "inconsistent splits {prev} and {s} for input {i} dim {j}"
                            )))
                        }
                        _ => splits[*d] = Some(s),
                    },
                    None if s != 1 => {
                        return Err(Error::strategy(format!("input {i} dim {j} cannot be split")))
                    }
                    None => {}
                }
            }
        }
        let mut used = vec![false; mesh.rank()];
        splits
            .into_iter()
            .map(|s| {
                let m = claim_axis(mesh, &mut used, s.unwrap_or(1))?;
                Ok((m != -1).then_some(m))
            })
            .collect()
    }

    /// Mesh axes per op dim read off the inputs' layouts. Unknown inputs
    /// place no constraint.
    pub fn axes_from_layouts(&self, inputs: &[Option<&TensorLayout>]) -> Result<Vec<Option<i64>>> {
        let mut axes: Vec<Option<i64>> = vec![None; self.op_dims];
        for (i, (layout, mapping)) in inputs.iter().zip(&self.inputs).enumerate() {
            let layout = match layout {
                Some(l) => l,
                None => continue,
            };
            for (j, (&m, op_dim)) in layout.tensor_map.iter().zip(mapping).enumerate() {
                if m == -1 {
                    continue;
                }
                match op_dim {
                    Some(d) => match axes[*d] {
                        Some(prev) if prev != m => {
                            return Err(Error::strategy(format!(
                                "inputs disagree on op dim {d}: mesh axes {prev} and {m}"
                            )))
                        }
                        _ => axes[*d] = Some(m),
                    },
                    None => {
                        return Err(Error::strategy(format!("input {i} dim {j} cannot stay split")))
                    }
                }
            }
        }
        Ok(axes)
    }

    /// Input and output layouts for a mesh-axis assignment.
    pub fn layouts(&self, ctx: &OpContext<'_>, axes: &[Option<i64>]) -> Result<OpLayouts> {
        let mut seen = Vec::new();
        for (d, axis) in axes.iter().enumerate() {
            let m = match axis {
                Some(m) => *m,
                None => continue,
            };
            if self.unsplittable.contains(&d) || (self.reduction.is_none() && !self.in_output(d)) {
                return Err(Error::strategy(format!("{}: op dim {d} cannot be split", ctx.prim)));
            }
            if seen.contains(&m) {
                return Err(Error::strategy(format!(
                    "{}: mesh axis {m} assigned to more than one op dim",
                    ctx.prim
                )));
            }
            seen.push(m);
        }
        let map_of = |dims: &[Option<usize>]| -> Vec<i64> {
            dims.iter()
                .map(|d| d.and_then(|d| axes[d]).unwrap_or(-1))
                .collect()
        };
        let inputs = self
            .inputs
            .iter()
            .zip(ctx.inputs)
            .map(|(dims, t)| TensorLayout::new(ctx.mesh, map_of(dims), t.dims().to_vec()))
            .collect::<Result<Vec<_>>>()?;
        let mut output = TensorLayout::new(ctx.mesh, map_of(&self.output), ctx.output.dims().to_vec())?;
        if let Some(op) = self.reduction {
            let reduced: Vec<i64> = axes
                .iter()
                .enumerate()
                .filter(|(d, _)| !self.in_output(*d))
                .filter_map(|(_, m)| *m)
                .collect();
            output = output.with_partial(op, reduced);
        }
        Ok(OpLayouts { inputs, output })
    }
}

/// Sharding rule of one primitive.
pub trait OperatorInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping>;

    /// Layouts for a user strategy.
    fn infer_layouts(&self, ctx: &OpContext<'_>, strategy: &Strategy) -> Result<OpLayouts> {
        let mapping = self.dim_mapping(ctx)?;
        let axes = mapping.axes_from_strategy(ctx.mesh, strategy)?;
        mapping.layouts(ctx, &axes)
    }

    /// Layouts that keep the inputs where they already are.
    fn follow_inputs(&self, ctx: &OpContext<'_>, inputs: &[Option<&TensorLayout>]) -> Result<OpLayouts> {
        let mapping = self.dim_mapping(ctx)?;
        let axes = mapping.axes_from_layouts(inputs)?;
        mapping.layouts(ctx, &axes)
    }

    /// Split the leading dim of the first input across mesh axis 0.
    fn data_parallel(&self, ctx: &OpContext<'_>) -> Result<OpLayouts> {
        let mapping = self.dim_mapping(ctx)?;
        let mut axes = vec![None; mapping.op_dims];
        if let Some(Some(d)) = mapping.inputs.first().and_then(|dims| dims.first()) {
            if ctx.mesh.axis_size(0) > 1 {
                axes[*d] = Some(ctx.mesh.map_for_axis(0));
            }
        }
        mapping.layouts(ctx, &axes)
    }

    fn replicated(&self, ctx: &OpContext<'_>) -> Result<OpLayouts> {
        let mapping = self.dim_mapping(ctx)?;
        mapping.layouts(ctx, &vec![None; mapping.op_dims])
    }
}

/// Elementwise with numpy broadcasting: op dims are the output dims and
/// inputs align from the right. Broadcast dims stay whole.
pub struct ElementwiseInfo;

impl OperatorInfo for ElementwiseInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let out = ctx.output.dims();
        let mut m = DimMapping::new(out.len());
        m.output = (0..out.len()).map(Some).collect();
        for t in ctx.inputs {
            let offset = out.len().saturating_sub(t.rank());
            m.inputs.push(
                t.dims()
                    .iter()
                    .enumerate()
                    .map(|(j, &size)| {
                        let d = j + offset;
                        (out.get(d) == Some(&size)).then_some(d)
                    })
                    .collect(),
            );
        }
        Ok(m)
    }
}

/// Softmax and LogSoftmax: elementwise, with the normalised axis whole.
pub struct SoftmaxInfo;

impl OperatorInfo for SoftmaxInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let mut m = ElementwiseInfo.dim_mapping(ctx)?;
        let axis = axis(ctx.attrs, "axis", -1, ctx.output.rank())?;
        m.unsplittable.push(axis);
        Ok(m)
    }
}

/// MatMul and MatMulBiasAdd. Op dims: output batch dims, m, n, k.
pub struct MatMulInfo;

impl OperatorInfo for MatMulInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let (a, b) = (&ctx.inputs[0], &ctx.inputs[1]);
        if a.rank() < 2 || b.rank() < 2 {
            return ReplicatedInfo.dim_mapping(ctx);
        }
        let ta = ctx.attrs.bool_or("transpose_a", false)?;
        let tb = ctx.attrs.bool_or("transpose_b", false)?;
        let out = ctx.output.dims();
        let nb = out.len() - 2;
        let (m_dim, n_dim, k_dim) = (nb, nb + 1, nb + 2);
        let mut mapping = DimMapping::new(nb + 3);
        mapping.output = (0..nb).map(Some).chain([Some(m_dim), Some(n_dim)]).collect();

        let batch = |t: &AbstractTensor| -> Vec<Option<usize>> {
            let lead = t.rank() - 2;
            (0..lead)
                .map(|j| {
                    let d = nb - lead + j;
                    (t.dims()[j] == out[d]).then_some(d)
                })
                .collect()
        };
        let mut a_map = batch(a);
        a_map.extend(if ta { [Some(k_dim), Some(m_dim)] } else { [Some(m_dim), Some(k_dim)] });
        let mut b_map = batch(b);
        b_map.extend(if tb { [Some(n_dim), Some(k_dim)] } else { [Some(k_dim), Some(n_dim)] });
        mapping.inputs = vec![a_map, b_map];
        if ctx.prim == prim::MATMUL_BIAS_ADD {
            mapping.inputs.push(vec![Some(n_dim)]);
        }
        if ctx.prim == prim::MATMUL_BIAS_ADD || ctx.attrs.contains("activation") {
            mapping.unsplittable.push(k_dim);
        } else {
            mapping.reduction = Some(PartialOp::Sum);
        }
        Ok(mapping)
    }
}

/// ReduceSum/Mean/Max/Min: reduced dims may be split and leave a partial
/// result of the matching kind.
pub struct ReduceInfo(pub PartialOp);

impl OperatorInfo for ReduceInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let x = &ctx.inputs[0];
        let axes = opdef::reduce_axes(ctx.attrs, x.rank())?;
        let axes: Vec<usize> = if axes.is_empty() { (0..x.rank()).collect() } else { axes };
        let keep = ctx.attrs.bool_or("keep_dims", false)?;
        let mut m = DimMapping::new(x.rank());
        m.inputs = vec![(0..x.rank()).map(Some).collect()];
        m.output = (0..x.rank())
            .filter_map(|d| match (axes.contains(&d), keep) {
                (false, _) => Some(Some(d)),
                (true, true) => Some(None),
                (true, false) => None,
            })
            .collect();
        m.reduction = Some(self.0);
        Ok(m)
    }
}

/// ArgMax/ArgMin: indices cannot be combined across ranks, so the reduced
/// axis stays whole.
pub struct ArgReduceInfo;

impl OperatorInfo for ArgReduceInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let x = &ctx.inputs[0];
        let axis = axis(ctx.attrs, "axis", -1, x.rank())?;
        let mut m = DimMapping::new(x.rank());
        m.inputs = vec![(0..x.rank()).map(Some).collect()];
        m.output = (0..x.rank()).filter(|&d| d != axis).map(Some).collect();
        Ok(m)
    }
}

pub struct TransposeInfo;

impl OperatorInfo for TransposeInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let x = &ctx.inputs[0];
        let perm = ctx.attrs.usizes("perm")?;
        if perm.len() != x.rank() {
            return Err(Error::RankMismatch {
                expected: x.rank(),
                got: perm.len(),
            });
        }
        let mut m = DimMapping::new(x.rank());
        m.inputs = vec![(0..x.rank()).map(Some).collect()];
        m.output = perm.into_iter().map(Some).collect();
        Ok(m)
    }
}

/// Reshape keeps a split only on the leading dim; a row-major split of the
/// first dim stays a split of the first dim when the output's leading dim
/// divides by the same count.
pub struct ReshapeInfo;

impl OperatorInfo for ReshapeInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let x = &ctx.inputs[0];
        if x.rank() == 0 || ctx.output.rank() == 0 {
            return ReplicatedInfo.dim_mapping(ctx);
        }
        let mut m = DimMapping::new(x.rank());
        m.inputs = vec![(0..x.rank()).map(Some).collect()];
        m.unsplittable = (1..x.rank()).collect();
        m.output = std::iter::once(Some(0))
            .chain(std::iter::repeat(None).take(ctx.output.rank() - 1))
            .collect();
        Ok(m)
    }
}

/// Squeeze and Unsqueeze only add or drop size-1 dims, which are never
/// split; the remaining dims keep their order.
pub struct SqueezeInfo;

impl OperatorInfo for SqueezeInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let x = &ctx.inputs[0];
        let out = ctx.output.dims();
        let mut m = DimMapping::new(x.rank());
        m.inputs = vec![(0..x.rank()).map(Some).collect()];
        let mut sources = (0..x.rank()).filter(|&d| x.dims()[d] != 1);
        m.output = out
            .iter()
            .map(|&size| if size == 1 { None } else { sources.next() })
            .collect();
        Ok(m)
    }
}

/// Gather(params, indices, axis). Splitting the gathered axis of params
/// leaves a partial sum: each rank looks up the rows it owns and
/// contributes zeros for the rest.
pub struct GatherInfo;

impl OperatorInfo for GatherInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let (params, indices) = (&ctx.inputs[0], &ctx.inputs[1]);
        let axis = axis(ctx.attrs, "axis", 0, params.rank())?;
        let out_rank = ctx.output.rank();
        let row = out_rank;
        let mut m = DimMapping::new(out_rank + 1);
        m.output = (0..out_rank).map(Some).collect();
        let q = indices.rank();
        let params_map = (0..params.rank())
            .map(|j| match j.cmp(&axis) {
                std::cmp::Ordering::Less => Some(j),
                std::cmp::Ordering::Equal => Some(row),
                std::cmp::Ordering::Greater => Some(j - 1 + q),
            })
            .collect();
        m.inputs = vec![params_map, (axis..axis + q).map(Some).collect()];
        m.reduction = Some(PartialOp::Sum);
        Ok(m)
    }
}

/// Concat: the concat axis stays whole, the other dims line up.
pub struct ConcatInfo;

impl OperatorInfo for ConcatInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let rank = ctx.output.rank();
        let axis = axis(ctx.attrs, "axis", 0, rank)?;
        let mut m = DimMapping::new(rank);
        m.output = (0..rank).map(Some).collect();
        m.inputs = ctx.inputs.iter().map(|_| (0..rank).map(Some).collect()).collect();
        m.unsplittable.push(axis);
        Ok(m)
    }
}

/// Operators without a sharding rule run on whole tensors.
pub struct ReplicatedInfo;

impl OperatorInfo for ReplicatedInfo {
    fn dim_mapping(&self, ctx: &OpContext<'_>) -> Result<DimMapping> {
        let mut m = DimMapping::new(0);
        m.inputs = ctx.inputs.iter().map(|t| vec![None; t.rank()]).collect();
        m.output = vec![None; ctx.output.rank()];
        Ok(m)
    }
}

/// The sharding rule for a primitive.
pub fn operator_info(name: &str) -> Box<dyn OperatorInfo> {
    match name {
        n if prim::BINARY.contains(&n) || prim::COMPARE.contains(&n) || prim::UNARY.contains(&n) => {
            Box::new(ElementwiseInfo)
        }
        prim::CAST
        | prim::BIAS_ADD
        | prim::SELECT
        | prim::SMOOTH_L1_LOSS
        | prim::GELU_GRAD
        | prim::SILU_GRAD
        | prim::SMOOTH_L1_LOSS_GRAD => Box::new(ElementwiseInfo),
        prim::SOFTMAX | prim::LOG_SOFTMAX => Box::new(SoftmaxInfo),
        prim::MATMUL | prim::MATMUL_BIAS_ADD => Box::new(MatMulInfo),
        prim::REDUCE_SUM => Box::new(ReduceInfo(PartialOp::Sum)),
        prim::REDUCE_MEAN => Box::new(ReduceInfo(PartialOp::Mean)),
        prim::REDUCE_MAX => Box::new(ReduceInfo(PartialOp::Max)),
        prim::REDUCE_MIN => Box::new(ReduceInfo(PartialOp::Min)),
        prim::ARGMAX | prim::ARGMIN => Box::new(ArgReduceInfo),
        prim::TRANSPOSE => Box::new(TransposeInfo),
        prim::RESHAPE => Box::new(ReshapeInfo),
        prim::SQUEEZE | prim::UNSQUEEZE => Box::new(SqueezeInfo),
        prim::GATHER => Box::new(GatherInfo),
        prim::CONCAT => Box::new(ConcatInfo),
        _ => Box::new(ReplicatedInfo),
    }
}

fn axis(attrs: &Attrs, key: &str, default: i64, rank: usize) -> Result<usize> {
    let axis = attrs.int_or(key, default)?;
    marten_core::shape::normalize_axis(axis as isize, rank.max(1))
}
