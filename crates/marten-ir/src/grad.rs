// Symbolic reverse-mode differentiation
//
// `grad` copies the forward graph, seeds `OnesLike(output)` as the output's
// cotangent and walks the forward nodes in reverse topological order. Each
// Apply node with a cotangent hands it to the bprop rule of its primitive,
// which appends backward nodes and returns one contribution per input.
// Contributions to the same node are summed with Add.
//
// The returned graph computes the forward pass plus the backward pass; its
// outputs are the gradients for each `wrt` node, in order. A node the
// output does not depend on gets `ZerosLike(node)`.
//
// Broadcasting binary ops reduce their contributions back to the operand
// shape with SumToShape. Non-differentiable primitives contribute nothing;
// a differentiable primitive without a rule is `NotDifferentiable`.

use std::collections::HashMap;

use marten_core::{DType, Error, Result};
use marten_ops::opdef::{pad_pairs, reduce_axes, slice_bounds};
use marten_ops::{prim, AbstractTensor, Attrs, OpSet};

use crate::builder::GraphBuilder;
use crate::graph::{Graph, NodeId, NodeKind};

/// Differentiate `output` with respect to each of `wrt`.
pub fn grad(graph: &Graph, output: NodeId, wrt: &[NodeId]) -> Result<Graph> {
    let ops = OpSet::builtin();
    let mut forward = graph.clone();
    forward.infer_shapes(&ops)?;
    let order = forward.topo_order()?;

    let mut ctx = GradContext {
        b: GraphBuilder::from_graph(forward),
        ops: &ops,
        grads: HashMap::new(),
    };
    let seed = ctx.b.ones_like(output);
    ctx.grads.insert(output, seed);

    for &id in order.iter().rev() {
        let Some(&dout) = ctx.grads.get(&id) else {
            continue;
        };
        let (prim_name, attrs, inputs) = match &ctx.b.graph().node(id)?.kind {
            NodeKind::Apply { prim, attrs, inputs } => (prim.clone(), attrs.clone(), inputs.clone()),
            _ => continue,
        };
        let def = ops.get(&prim_name)?;
        if !def.differentiable {
            continue;
        }
        let contributions = ctx.bprop(&prim_name, &attrs, &inputs, id, dout)?;
        for (input, contribution) in inputs.iter().zip(contributions) {
            if let Some(c) = contribution {
                ctx.accumulate(*input, c);
            }
        }
    }

    let outputs: Vec<NodeId> = wrt
        .iter()
        .map(|&w| match ctx.grads.get(&w) {
            Some(&g) => g,
            None => ctx.b.zeros_like(w),
        })
        .collect();
    let mut result = ctx.b.finish(&outputs);
    result.name = format!("grad_{}", graph.name);
    result.infer_shapes(&ops)?;
    tracing::debug!(graph = %graph.name, nodes = result.len(), "gradient graph built");
    Ok(result)
}

struct GradContext<'a> {
    b: GraphBuilder,
    ops: &'a OpSet,
    grads: HashMap<NodeId, NodeId>,
}

type Contributions = Vec<Option<NodeId>>;

/// The contribution of a single-input rule.
fn one(id: NodeId) -> Result<Contributions> {
    Ok(vec![Some(id)])
}

impl GradContext<'_> {
    fn accumulate(&mut self, node: NodeId, contribution: NodeId) {
        let total = match self.grads.get(&node) {
            Some(&existing) => self.b.add(existing, contribution),
            None => contribution,
        };
        self.grads.insert(node, total);
    }

    /// Shape and dtype of a node, inferring backward nodes on demand.
    fn abstract_of(&mut self, id: NodeId) -> Result<AbstractTensor> {
        if let Ok(a) = self.b.graph().abstract_of(id) {
            return Ok(a.clone());
        }
        let (prim_name, attrs, inputs) = match &self.b.graph().node(id)?.kind {
            NodeKind::Apply { prim, attrs, inputs } => (prim.clone(), attrs.clone(), inputs.clone()),
            _ => return Err(Error::msg(format!("node {id} has no inferred shape"))),
        };
        let args = inputs
            .iter()
            .map(|&i| self.abstract_of(i))
            .collect::<Result<Vec<_>>>()?;
        let out = self.ops.infer(&prim_name, &args, &attrs)?;
        self.b.graph_mut().node_mut(id)?.abstract_value = Some(out.clone());
        Ok(out)
    }

    fn dims(&mut self, id: NodeId) -> Result<Vec<usize>> {
        Ok(self.abstract_of(id)?.dims().to_vec())
    }

    fn dtype(&mut self, id: NodeId) -> Result<DType> {
        Ok(self.abstract_of(id)?.dtype)
    }

    fn scalar_like(&mut self, like: NodeId, v: f64) -> Result<NodeId> {
        let dtype = self.dtype(like)?;
        Ok(self.b.scalar(v, dtype))
    }

    /// `g` reduced to the shape of `x` when broadcasting widened it.
    fn unbroadcast(&mut self, g: NodeId, x: NodeId) -> Result<NodeId> {
        let target = self.dims(x)?;
        if self.dims(g)? == target {
            return Ok(g);
        }
        Ok(self.b.sum_to_shape(g, &target))
    }

    /// `mask ? dout : 0`.
    fn masked(&mut self, mask: NodeId, dout: NodeId) -> NodeId {
        let zeros = self.b.zeros_like(dout);
        self.b.select(mask, dout, zeros)
    }

    /// `mask ? 0 : dout`.
    fn masked_out(&mut self, mask: NodeId, dout: NodeId) -> NodeId {
        let zeros = self.b.zeros_like(dout);
        self.b.select(mask, zeros, dout)
    }

    /// Undo a reduction: reinsert reduced axes and broadcast to `x`'s shape.
    fn expand_reduced(&mut self, g: NodeId, x: NodeId, attrs: &Attrs) -> Result<NodeId> {
        let x_dims = self.dims(x)?;
        let mut axes = reduce_axes(attrs, x_dims.len())?;
        if axes.is_empty() {
            axes = (0..x_dims.len()).collect();
        }
        let kept: Vec<i64> = x_dims
            .iter()
            .enumerate()
            .map(|(d, &n)| if axes.contains(&d) { 1 } else { n as i64 })
            .collect();
        let reshaped = self.b.reshape(g, &kept);
        let target: Vec<i64> = x_dims.iter().map(|&d| d as i64).collect();
        Ok(self.b.broadcast_to(reshaped, &target))
    }

    fn bprop(
        &mut self,
        op: &str,
        attrs: &Attrs,
        inputs: &[NodeId],
        y: NodeId,
        dout: NodeId,
    ) -> Result<Contributions> {
        let x = inputs[0];
        match op {
            // Binary
            prim::ADD => {
                let (a, b) = (inputs[0], inputs[1]);
                Ok(vec![Some(self.unbroadcast(dout, a)?), Some(self.unbroadcast(dout, b)?)])
            }
            prim::SUB => {
                let (a, b) = (inputs[0], inputs[1]);
                let neg = self.b.neg(dout);
                Ok(vec![Some(self.unbroadcast(dout, a)?), Some(self.unbroadcast(neg, b)?)])
            }
            prim::MUL => {
                let (a, b) = (inputs[0], inputs[1]);
                let da = self.b.mul(dout, b);
                let db = self.b.mul(dout, a);
                Ok(vec![Some(self.unbroadcast(da, a)?), Some(self.unbroadcast(db, b)?)])
            }
            prim::DIV => {
                let (a, b) = (inputs[0], inputs[1]);
                let da = self.b.div(dout, b);
                let t = self.b.mul(dout, y);
                let t = self.b.div(t, b);
                let db = self.b.neg(t);
                Ok(vec![Some(self.unbroadcast(da, a)?), Some(self.unbroadcast(db, b)?)])
            }
            prim::MAXIMUM | prim::MINIMUM => {
                // Ties route the gradient to the left operand.
                let (a, b) = (inputs[0], inputs[1]);
                let loses = if op == prim::MAXIMUM {
                    self.b.less(a, b)
                } else {
                    self.b.greater(a, b)
                };
                let da = self.masked_out(loses, dout);
                let db = self.masked(loses, dout);
                Ok(vec![Some(self.unbroadcast(da, a)?), Some(self.unbroadcast(db, b)?)])
            }
            prim::POW => {
                let (a, b) = (inputs[0], inputs[1]);
                let one_c = self.scalar_like(b, 1.0)?;
                let bm1 = self.b.sub(b, one_c);
                let p = self.b.pow(a, bm1);
                let t = self.b.mul(dout, b);
                let da = self.b.mul(t, p);
                let zero = self.scalar_like(a, 0.0)?;
                let positive = self.b.greater(a, zero);
                let ones = self.b.ones_like(a);
                let safe = self.b.select(positive, a, ones);
                let ln = self.b.log(safe);
                let t = self.b.mul(dout, y);
                let db = self.b.mul(t, ln);
                Ok(vec![Some(self.unbroadcast(da, a)?), Some(self.unbroadcast(db, b)?)])
            }
            prim::BIAS_ADD => {
                let n = self.dims(inputs[1])?;
                let db = self.b.sum_to_shape(dout, &n);
                Ok(vec![Some(dout), Some(db)])
            }

            // Unary
            prim::NEG => one(self.b.neg(dout)),
            prim::IDENTITY => one(dout),
            prim::ABS => {
                let s = self.b.sign(x);
                one(self.b.mul(dout, s))
            }
            prim::EXP => one(self.b.mul(dout, y)),
            prim::LOG => one(self.b.div(dout, x)),
            prim::SQRT => {
                let two = self.scalar_like(y, 2.0)?;
                let t = self.b.mul(y, two);
                one(self.b.div(dout, t))
            }
            prim::SQUARE => {
                let two = self.scalar_like(x, 2.0)?;
                let t = self.b.mul(x, two);
                one(self.b.mul(dout, t))
            }
            prim::RECIPROCAL => {
                let yy = self.b.mul(y, y);
                let t = self.b.mul(dout, yy);
                one(self.b.neg(t))
            }
            prim::SIN => {
                let c = self.b.cos(x);
                one(self.b.mul(dout, c))
            }
            prim::COS => {
                let s = self.b.sin(x);
                let t = self.b.mul(dout, s);
                one(self.b.neg(t))
            }
            prim::SIGMOID => {
                let one_c = self.scalar_like(y, 1.0)?;
                let t = self.b.sub(one_c, y);
                let t = self.b.mul(y, t);
                one(self.b.mul(dout, t))
            }
            prim::TANH => {
                let one_c = self.scalar_like(y, 1.0)?;
                let yy = self.b.mul(y, y);
                let t = self.b.sub(one_c, yy);
                one(self.b.mul(dout, t))
            }
            prim::RELU => {
                let zero = self.scalar_like(x, 0.0)?;
                let mask = self.b.greater(x, zero);
                one(self.masked(mask, dout))
            }
            prim::RELU6 => {
                let zero = self.scalar_like(x, 0.0)?;
                let six = self.scalar_like(x, 6.0)?;
                let above = self.b.greater(x, zero);
                let below = self.b.less(x, six);
                let inner = self.masked(below, dout);
                one(self.masked(above, inner))
            }
            prim::LEAKY_RELU => {
                let alpha = attrs.float_or("alpha", 0.2)?;
                let zero = self.scalar_like(x, 0.0)?;
                let a = self.scalar_like(x, alpha)?;
                let mask = self.b.greater(x, zero);
                let scaled = self.b.mul(dout, a);
                one(self.b.select(mask, dout, scaled))
            }
            prim::HSWISH => {
                // 0 below -3, 1 above 3, (2x + 3) / 6 between.
                let lo = self.scalar_like(x, -3.0)?;
                let hi = self.scalar_like(x, 3.0)?;
                let two = self.scalar_like(x, 2.0)?;
                let three = self.scalar_like(x, 3.0)?;
                let sixth = self.scalar_like(x, 1.0 / 6.0)?;
                let t = self.b.mul(x, two);
                let t = self.b.add(t, three);
                let t = self.b.mul(t, sixth);
                let mid = self.b.mul(dout, t);
                let above = self.b.greater(x, hi);
                let upper = self.b.select(above, dout, mid);
                let below = self.b.less(x, lo);
                one(self.masked_out(below, upper))
            }
            prim::GELU => one(self.b.gelu_grad(dout, x)),
            prim::SILU => one(self.b.silu_grad(dout, x)),
            prim::CAST => {
                let dtype = self.dtype(x)?;
                one(self.b.cast(dout, dtype))
            }

            // Matrix products
            prim::MATMUL | prim::MATMUL_BIAS_ADD => {
                if attrs.contains("activation") {
                    return Err(Error::NotDifferentiable {
                        op: format!("{op} with fused activation"),
                    });
                }
                let (a, b) = (inputs[0], inputs[1]);
                if self.dims(a)?.len() < 2 || self.dims(b)?.len() < 2 {
                    return Err(Error::NotDifferentiable {
                        op: format!("{op} on vectors"),
                    });
                }
                let ta = attrs.bool_or("transpose_a", false)?;
                let tb = attrs.bool_or("transpose_b", false)?;
                let (da, db) = match (ta, tb) {
                    (false, false) => (self.b.matmul(dout, b, false, true), self.b.matmul(a, dout, true, false)),
                    (true, false) => (self.b.matmul(b, dout, false, true), self.b.matmul(a, dout, false, false)),
                    (false, true) => (self.b.matmul(dout, b, false, false), self.b.matmul(dout, a, true, false)),
                    (true, true) => (self.b.matmul(b, dout, true, true), self.b.matmul(dout, a, true, true)),
                };
                let mut out = vec![Some(self.unbroadcast(da, a)?), Some(self.unbroadcast(db, b)?)];
                if op == prim::MATMUL_BIAS_ADD {
                    let n = self.dims(inputs[2])?;
                    out.push(Some(self.b.sum_to_shape(dout, &n)));
                }
                Ok(out)
            }

            // Reductions
            prim::REDUCE_SUM => one(self.expand_reduced(dout, x, attrs)?),
            prim::REDUCE_MEAN => {
                let count = self.dims(x)?.iter().product::<usize>() / self.dims(y)?.iter().product::<usize>().max(1);
                let g = self.expand_reduced(dout, x, attrs)?;
                let scale = self.scalar_like(x, 1.0 / count as f64)?;
                one(self.b.mul(g, scale))
            }
            prim::REDUCE_MAX | prim::REDUCE_MIN => {
                // Every position equal to the extremum receives the gradient.
                let g = self.expand_reduced(dout, x, attrs)?;
                let ye = self.expand_reduced(y, x, attrs)?;
                let mask = self.b.equal(x, ye);
                one(self.masked(mask, g))
            }
            prim::SOFTMAX => {
                let axis = attrs.int_or("axis", -1)?;
                let dy = self.b.mul(dout, y);
                let s = self.b.reduce_sum(dy, &[axis], true);
                let centered = self.b.sub(dout, s);
                one(self.b.mul(y, centered))
            }
            prim::LOG_SOFTMAX => {
                let axis = attrs.int_or("axis", -1)?;
                let p = self.b.exp(y);
                let s = self.b.reduce_sum(dout, &[axis], true);
                let t = self.b.mul(p, s);
                one(self.b.sub(dout, t))
            }

            // Shape manipulation
            prim::RESHAPE | prim::SQUEEZE | prim::UNSQUEEZE => {
                let dims: Vec<i64> = self.dims(x)?.iter().map(|&d| d as i64).collect();
                one(self.b.reshape(dout, &dims))
            }
            prim::TRANSPOSE => {
                let perm = attrs.usizes("perm")?;
                let mut inverse = vec![0; perm.len()];
                for (i, &p) in perm.iter().enumerate() {
                    inverse[p] = i;
                }
                one(self.b.transpose(dout, &inverse))
            }
            prim::BROADCAST_TO => {
                let dims = self.dims(x)?;
                one(self.b.sum_to_shape(dout, &dims))
            }
            prim::CONCAT => {
                let rank = self.dims(x)?.len();
                let axis = marten_core::shape::normalize_axis(attrs.int_or("axis", 0)? as isize, rank)?;
                let mut offset = 0usize;
                let mut out = Vec::with_capacity(inputs.len());
                for &input in inputs {
                    let dims = self.dims(input)?;
                    let mut begin = vec![0i64; rank];
                    begin[axis] = offset as i64;
                    let size: Vec<i64> = dims.iter().map(|&d| d as i64).collect();
                    out.push(Some(self.b.slice(dout, &begin, &size)));
                    offset += dims[axis];
                }
                Ok(out)
            }
            prim::SLICE => {
                let x_dims = self.dims(x)?;
                let shape = marten_core::Shape::new(x_dims.clone());
                let bounds = slice_bounds(&shape, &attrs.ints("begin")?, &attrs.ints("size")?)?;
                let paddings: Vec<[usize; 2]> = bounds
                    .iter()
                    .zip(&x_dims)
                    .map(|(&(start, len), &d)| [start, d - start - len])
                    .collect();
                one(self.b.pad(dout, &paddings, 0.0))
            }
            prim::PAD => {
                let x_dims = self.dims(x)?;
                let pairs = pad_pairs(attrs, x_dims.len())?;
                let begin: Vec<i64> = pairs.iter().map(|p| p[0] as i64).collect();
                let size: Vec<i64> = x_dims.iter().map(|&d| d as i64).collect();
                one(self.b.slice(dout, &begin, &size))
            }
            prim::SPLIT => {
                let x_dims = self.dims(x)?;
                let axis = marten_core::shape::normalize_axis(attrs.int_or("axis", 0)? as isize, x_dims.len())?;
                let parts = attrs.int("parts")? as usize;
                let index = attrs.int("index")? as usize;
                let chunk = x_dims[axis] / parts;
                let mut paddings = vec![[0usize; 2]; x_dims.len()];
                paddings[axis] = [index * chunk, (parts - index - 1) * chunk];
                one(self.b.pad(dout, &paddings, 0.0))
            }
            prim::SELECT => {
                let cond = inputs[0];
                let (t, f) = (inputs[1], inputs[2]);
                let dt = self.masked(cond, dout);
                let df = self.masked_out(cond, dout);
                Ok(vec![None, Some(self.unbroadcast(dt, t)?), Some(self.unbroadcast(df, f)?)])
            }

            // Indexing
            prim::GATHER => {
                let (params, indices) = (inputs[0], inputs[1]);
                let p_dims = self.dims(params)?;
                let idx_rank = self.dims(indices)?.len();
                let axis = marten_core::shape::normalize_axis(attrs.int_or("axis", 0)? as isize, p_dims.len())?;
                let out_rank = self.dims(dout)?.len();
                let moved = if axis == 0 {
                    dout
                } else {
                    let mut perm: Vec<usize> = (axis..axis + idx_rank).collect();
                    perm.extend(0..axis);
                    perm.extend(axis + idx_rank..out_rank);
                    self.b.transpose(dout, &perm)
                };
                let summed = self.b.unsorted_segment_sum(moved, indices, p_dims[axis]);
                let dparams = if axis == 0 {
                    summed
                } else {
                    let mut perm: Vec<usize> = (1..=axis).collect();
                    perm.push(0);
                    perm.extend(axis + 1..p_dims.len());
                    self.b.transpose(summed, &perm)
                };
                Ok(vec![Some(dparams), None])
            }
            prim::UNSORTED_SEGMENT_SUM => {
                let ids = inputs[1];
                Ok(vec![Some(self.b.gather(dout, ids, 0)), None])
            }
            prim::SCATTER_ND => {
                let indices = inputs[0];
                Ok(vec![None, Some(self.b.gather_nd(dout, indices))])
            }
            prim::SMOOTH_L1_LOSS => {
                let beta = attrs.float_or("beta", 1.0)?;
                let (p, t) = (inputs[0], inputs[1]);
                let dp = self.b.smooth_l1_loss_grad(p, t, dout, beta);
                let dt = self.b.neg(dp);
                Ok(vec![Some(dp), Some(dt)])
            }
            other => Err(Error::NotDifferentiable { op: other.to_string() }),
        }
    }
}
