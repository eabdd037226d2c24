// Backprop — reverse-mode automatic differentiation over the eager tape
//
//   1. Every op records its inputs in `Tensor::op()`, forming a DAG.
//   2. backward() sorts that DAG depth-first (leaves first, root last).
//   3. grad(root) = 1, then each tensor in reverse order pushes its gradient
//      to its inputs through the chain rule.
//
// A tensor used several times receives the sum of every contribution.
// Gradients of broadcast operands are summed back to the operand's shape.
//
// Rules that need per-element index bookkeeping (gather, index_select,
// clamp) are computed host-side on f64 values and uploaded again. Gradient
// tensors are built from detached values so they never extend the tape.

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp, GELU_C};
use crate::error::{Error, Result};
use crate::op::{Op, TensorId};
use crate::tensor::Tensor;

/// Gradients keyed by tensor id.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Gradient of `tensor`, if any flowed to it.
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    pub fn get_by_id(&self, id: TensorId) -> Option<&Tensor<B>> {
        self.grads.get(&id)
    }

    /// Overwrite the gradient stored for `id`.
    pub fn insert(&mut self, id: TensorId, grad: Tensor<B>) {
        self.grads.insert(id, grad);
    }

    pub fn remove(&mut self, id: TensorId) -> Option<Tensor<B>> {
        self.grads.remove(&id)
    }

    /// Add `grad` to whatever is already stored for `id`.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        let grad = grad.detach();
        let merged = match self.grads.get(&id) {
            Some(existing) => existing.add(&grad)?.detach(),
            None => grad,
        };
        self.grads.insert(id, merged);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TensorId> {
        self.grads.keys()
    }
}

/// Leaves first, root last.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    fn visit<B: Backend>(t: &Tensor<B>, visited: &mut HashSet<TensorId>, order: &mut Vec<Tensor<B>>) {
        if !visited.insert(t.id()) {
            return;
        }
        for input in t.op().inputs() {
            visit(input, visited, order);
        }
        order.push(t.clone());
    }

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(root, &mut visited, &mut order);
    order
}

/// Gradients of the single-element `root` with respect to every tensor on
/// its tape.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(Error::NotAScalar {
            shape: root.shape().clone(),
        });
    }
    let topo = build_topo(root);

    let mut grads = GradStore::new();
    grads.insert(root.id(), Tensor::ones_like(root)?);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get_by_id(tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => {
                grads.accumulate(input.id(), grad_output)?;
            }

            Op::Binary { lhs, rhs, op } => {
                binary_grad(*op, &grad_output, tensor, lhs, rhs, &mut grads)?;
            }

            Op::Unary { input, op } => {
                unary_grad(*op, &grad_output, tensor, input, &mut grads)?;
            }

            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => {
                reduce_grad(*op, &grad_output, tensor, input, dims, *keep_dim, &mut grads)?;
            }

            Op::Matmul { lhs, rhs } => {
                let (lhs_d, rhs_d) = (lhs.detach(), rhs.detach());
                let grad_lhs = grad_output.matmul(&rhs_d.t()?)?.sum_to_shape(lhs.shape())?;
                let grad_rhs = lhs_d.t()?.matmul(&grad_output)?.sum_to_shape(rhs.shape())?;
                grads.accumulate(lhs.id(), grad_lhs)?;
                grads.accumulate(rhs.id(), grad_rhs)?;
            }

            Op::Reshape { input, src_shape } => {
                grads.accumulate(input.id(), grad_output.reshape(src_shape.clone())?)?;
            }

            Op::Permute { input, perm } => {
                let mut inverse = vec![0usize; perm.len()];
                for (i, &p) in perm.iter().enumerate() {
                    inverse[p] = i;
                }
                grads.accumulate(input.id(), grad_output.permute(&inverse)?)?;
            }

            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => {
                let mut padding = vec![[0usize; 2]; input.rank()];
                padding[*dim] = [*start, input.dims()[*dim] - start - len];
                grads.accumulate(input.id(), grad_output.pad(&padding, 0.0)?)?;
            }

            Op::Broadcast { input } => {
                grads.accumulate(input.id(), grad_output.sum_to_shape(input.shape())?)?;
            }

            Op::Affine { input, mul, .. } => {
                grads.accumulate(input.id(), grad_output.affine(*mul, 0.0)?)?;
            }

            Op::Cat { inputs, dim, sizes } => {
                let mut offset = 0usize;
                for (inp, &size) in inputs.iter().zip(sizes) {
                    grads.accumulate(inp.id(), grad_output.narrow(*dim, offset, size)?)?;
                    offset += size;
                }
            }

            Op::Powf { input, exponent } => {
                // d(x^n)/dx = n x^(n-1)
                let grad = input
                    .detach()
                    .powf(exponent - 1.0)?
                    .affine(*exponent, 0.0)?
                    .mul(&grad_output)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Clamp { input, min, max } => {
                // Gradient passes only strictly inside the bounds.
                let grad = host_zip(input, &grad_output, |x, g| {
                    if x > *min && x < *max {
                        g
                    } else {
                        0.0
                    }
                })?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => {
                let zeros = Tensor::zeros_like(&grad_output)?;
                let grad_true = Tensor::where_cond(mask, &grad_output, &zeros)?;
                let grad_false = Tensor::where_cond(mask, &zeros, &grad_output)?;
                grads.accumulate(on_true.id(), grad_true.sum_to_shape(on_true.shape())?)?;
                grads.accumulate(on_false.id(), grad_false.sum_to_shape(on_false.shape())?)?;
            }

            Op::Gather { input, index, dim } => {
                // Scatter-add each output gradient back to the gathered position.
                let grad_data = grad_output.to_f64_vec()?;
                let index_data = index.to_f64_vec()?;
                let input_strides = input.shape().stride_contiguous();
                let index_strides = index.shape().stride_contiguous();
                let mut out = vec![0.0f64; input.elem_count()];
                for (flat, (&g, &ix)) in grad_data.iter().zip(&index_data).enumerate() {
                    let mut rem = flat;
                    let mut pos = 0usize;
                    for (d, (&is, &ts)) in index_strides.iter().zip(&input_strides).enumerate() {
                        let coord = if d == *dim { ix as usize } else { rem / is };
                        rem %= is;
                        pos += coord * ts;
                    }
                    out[pos] += g;
                }
                let grad = Tensor::from_f64_slice(&out, input.shape().clone(), input.dtype(), input.device())?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::IndexSelect {
                input,
                indices,
                dim,
            } => {
                let grad_data = grad_output.to_f64_vec()?;
                let picks = indices.to_f64_vec()?;
                let dims = input.dims();
                let outer: usize = dims[..*dim].iter().product();
                let inner: usize = dims[dim + 1..].iter().product();
                let in_dim = dims[*dim];
                let mut out = vec![0.0f64; input.elem_count()];
                for o in 0..outer {
                    for (j, &p) in picks.iter().enumerate() {
                        let src = (o * picks.len() + j) * inner;
                        let dst = (o * in_dim + p as usize) * inner;
                        for i in 0..inner {
                            out[dst + i] += grad_data[src + i];
                        }
                    }
                }
                let grad = Tensor::from_f64_slice(&out, input.shape().clone(), input.dtype(), input.device())?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Pad { input, padding } => {
                let mut grad = grad_output.clone();
                for (d, &[before, _]) in padding.iter().enumerate() {
                    grad = grad.narrow(d, before, input.dims()[d])?;
                }
                grads.accumulate(input.id(), grad)?;
            }

            Op::ToDType { input, src_dtype } => {
                grads.accumulate(input.id(), grad_output.to_dtype(*src_dtype)?)?;
            }
        }
    }

    Ok(grads)
}

fn binary_grad<B: Backend>(
    op: BinaryOp,
    grad_output: &Tensor<B>,
    output: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let (a, b) = (lhs.detach(), rhs.detach());
    let (raw_lhs, raw_rhs) = match op {
        BinaryOp::Add => (grad_output.clone(), grad_output.clone()),
        BinaryOp::Sub => (grad_output.clone(), grad_output.neg()?),
        BinaryOp::Mul => (grad_output.mul(&b)?, grad_output.mul(&a)?),
        BinaryOp::Div => {
            // d(a/b)/db = -a / b²
            let db = grad_output.mul(&a)?.div(&b.square()?)?.neg()?;
            (grad_output.div(&b)?, db)
        }
        BinaryOp::Maximum | BinaryOp::Minimum => {
            // Ties route the gradient to the left operand.
            let mask = if op == BinaryOp::Maximum { a.ge(&b)? } else { a.le(&b)? };
            let zeros = Tensor::zeros_like(grad_output)?;
            (
                Tensor::where_cond(&mask, grad_output, &zeros)?,
                Tensor::where_cond(&mask, &zeros, grad_output)?,
            )
        }
        BinaryOp::Pow => {
            // d(a^b)/da = b a^(b-1); d(a^b)/db = a^b ln(a), zero where a <= 0.
            let out = output.detach();
            let one = Tensor::ones_like(&b)?;
            let da = grad_output.mul(&b)?.mul(&a.pow(&b.sub(&one)?)?)?;
            let positive = a.gt(&Tensor::zeros_like(&a)?)?;
            let safe_a = Tensor::where_cond(&positive, &a, &Tensor::ones_like(&a)?)?;
            let db = grad_output.mul(&out)?.mul(&safe_a.log()?)?;
            (da, db)
        }
    };
    grads.accumulate(lhs.id(), raw_lhs.sum_to_shape(lhs.shape())?)?;
    grads.accumulate(rhs.id(), raw_rhs.sum_to_shape(rhs.shape())?)?;
    Ok(())
}

/// `dy/dx` of a unary op at input `x` with output `y`.
pub fn unary_derivative(op: UnaryOp, x: f64, y: f64) -> f64 {
    match op {
        UnaryOp::Neg => -1.0,
        UnaryOp::Abs => UnaryOp::Sign.apply(x),
        UnaryOp::Exp => y,
        UnaryOp::Log => 1.0 / x,
        UnaryOp::Sqrt => 0.5 / y,
        UnaryOp::Relu => {
            if x > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        UnaryOp::Sigmoid => y * (1.0 - y),
        UnaryOp::Tanh => 1.0 - y * y,
        UnaryOp::Gelu => {
            let t = (GELU_C * (x + 0.044715 * x * x * x)).tanh();
            0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * GELU_C * (1.0 + 3.0 * 0.044715 * x * x)
        }
        UnaryOp::Silu => {
            let s = 1.0 / (1.0 + (-x).exp());
            s * (1.0 + x * (1.0 - s))
        }
        UnaryOp::Sin => x.cos(),
        UnaryOp::Cos => -x.sin(),
        UnaryOp::Square => 2.0 * x,
        UnaryOp::Recip => -y * y,
        UnaryOp::Floor | UnaryOp::Ceil | UnaryOp::Round | UnaryOp::Sign => 0.0,
    }
}

fn unary_grad<B: Backend>(
    op: UnaryOp,
    grad_output: &Tensor<B>,
    output: &Tensor<B>,
    input: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    if op.is_piecewise_constant() {
        return grads.accumulate(input.id(), Tensor::zeros_like(input)?);
    }
    let xs = input.to_f64_vec()?;
    let ys = output.to_f64_vec()?;
    let gs = grad_output.to_f64_vec()?;
    let data: Vec<f64> = xs
        .iter()
        .zip(&ys)
        .zip(&gs)
        .map(|((&x, &y), &g)| g * unary_derivative(op, x, y))
        .collect();
    let grad = Tensor::from_f64_slice(&data, input.shape().clone(), input.dtype(), input.device())?;
    grads.accumulate(input.id(), grad)
}

fn reduce_grad<B: Backend>(
    op: ReduceOp,
    grad_output: &Tensor<B>,
    output: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
    keep_dim: bool,
    grads: &mut GradStore<B>,
) -> Result<()> {
    // Re-insert reduced dims as size 1, then broadcast to the input shape.
    let kept = input.shape().reduced(dims, true);
    let expand = |t: &Tensor<B>| -> Result<Tensor<B>> {
        let t = if keep_dim { t.clone() } else { t.reshape(kept.clone())? };
        t.broadcast_as(input.shape().clone())
    };
    let grad = match op {
        ReduceOp::Sum => expand(grad_output)?,
        ReduceOp::Mean => {
            let count = input.elem_count() / output.elem_count().max(1);
            expand(grad_output)?.affine(1.0 / count as f64, 0.0)?
        }
        ReduceOp::Max | ReduceOp::Min => {
            // Every position equal to the extremum receives the gradient.
            let mask = input.detach().eq(&expand(&output.detach())?)?;
            let g = expand(grad_output)?;
            Tensor::where_cond(&mask, &g, &Tensor::zeros_like(&g)?)?
        }
        ReduceOp::ArgMax | ReduceOp::ArgMin => Tensor::zeros_like(input)?,
    };
    grads.accumulate(input.id(), grad)
}

/// `f(x, g)` element-wise on the host, shaped like `input`.
fn host_zip<B: Backend>(
    input: &Tensor<B>,
    grad: &Tensor<B>,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor<B>> {
    let xs = input.to_f64_vec()?;
    let gs = grad.to_f64_vec()?;
    let data: Vec<f64> = xs.iter().zip(&gs).map(|(&x, &g)| f(x, g)).collect();
    Tensor::from_f64_slice(&data, input.shape().clone(), input.dtype(), input.device())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_derivatives_match_differences() {
        let ops = [
            UnaryOp::Exp,
            UnaryOp::Log,
            UnaryOp::Sqrt,
            UnaryOp::Sigmoid,
            UnaryOp::Tanh,
            UnaryOp::Gelu,
            UnaryOp::Silu,
            UnaryOp::Sin,
            UnaryOp::Cos,
            UnaryOp::Square,
            UnaryOp::Recip,
        ];
        let h = 1e-6;
        for op in ops {
            for x in [0.3, 1.1, 2.5] {
                let numeric = (op.apply(x + h) - op.apply(x - h)) / (2.0 * h);
                let analytic = unary_derivative(op, x, op.apply(x));
                assert!((numeric - analytic).abs() < 1e-5, "{:?} at {}", op, x);
            }
        }
    }

    #[test]
    fn test_piecewise_constant_derivative_is_zero() {
        assert_eq!(unary_derivative(UnaryOp::Round, 1.3, 1.0), 0.0);
        assert_eq!(unary_derivative(UnaryOp::Relu, -1.0, 0.0), 0.0);
        assert_eq!(unary_derivative(UnaryOp::Abs, -2.0, 2.0), -1.0);
    }
}
