// Op — the eager autograd tape
//
// Every tensor produced by a differentiable operation records the operation
// and the input tensors it read. The inputs are Arc handles, so the tape keeps
// exactly the values backward needs alive and nothing else.
//
//   c = a.mul(&b)   →   c.op = Binary { lhs: a, rhs: b, op: Mul }
//
// Leaves (inputs, parameters, detached values) carry Op::None. Comparison and
// arg-reduction results also carry Op::None because they are not
// differentiable.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Process-unique tensor identity, used as the key of a `GradStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

/// The operation that produced a tensor.
#[derive(Clone)]
pub enum Op<B: Backend> {
    None,

    Binary {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
        op: BinaryOp,
    },

    Unary {
        input: Tensor<B>,
        op: UnaryOp,
    },

    Reduce {
        input: Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
        keep_dim: bool,
    },

    Matmul {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
    },

    /// Reshape, squeeze and unsqueeze.
    Reshape {
        input: Tensor<B>,
        src_shape: Shape,
    },

    /// Output dim `i` is input dim `perm[i]`; transpose is a two-element swap.
    Permute {
        input: Tensor<B>,
        perm: Vec<usize>,
    },

    Narrow {
        input: Tensor<B>,
        dim: usize,
        start: usize,
        len: usize,
    },

    /// Stride-0 view of `input` at a larger shape.
    Broadcast {
        input: Tensor<B>,
    },

    Affine {
        input: Tensor<B>,
        mul: f64,
        add: f64,
    },

    Contiguous {
        input: Tensor<B>,
    },

    Cat {
        inputs: Vec<Tensor<B>>,
        dim: usize,
        sizes: Vec<usize>,
    },

    Powf {
        input: Tensor<B>,
        exponent: f64,
    },

    Clamp {
        input: Tensor<B>,
        min: f64,
        max: f64,
    },

    WhereCond {
        mask: Tensor<B>,
        on_true: Tensor<B>,
        on_false: Tensor<B>,
    },

    Gather {
        input: Tensor<B>,
        index: Tensor<B>,
        dim: usize,
    },

    IndexSelect {
        input: Tensor<B>,
        indices: Tensor<B>,
        dim: usize,
    },

    /// Constant padding, one `[before, after]` pair per dim.
    Pad {
        input: Tensor<B>,
        padding: Vec<[usize; 2]>,
    },

    /// Dtype conversion between float types.
    ToDType {
        input: Tensor<B>,
        src_dtype: DType,
    },
}

impl<B: Backend> Op<B> {
    /// Tensors this op read.
    pub fn inputs(&self) -> Vec<&Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Permute { input, .. }
            | Op::Narrow { input, .. }
            | Op::Broadcast { input }
            | Op::Affine { input, .. }
            | Op::Contiguous { input }
            | Op::Powf { input, .. }
            | Op::Clamp { input, .. }
            | Op::Pad { input, .. }
            | Op::ToDType { input, .. } => vec![input],
            Op::Cat { inputs, .. } => inputs.iter().collect(),
            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => vec![mask, on_true, on_false],
            Op::Gather { input, index, .. } => vec![input, index],
            Op::IndexSelect { input, indices, .. } => vec![input, indices],
        }
    }

    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "none",
            Op::Binary { .. } => "binary",
            Op::Unary { .. } => "unary",
            Op::Reduce { .. } => "reduce",
            Op::Matmul { .. } => "matmul",
            Op::Reshape { .. } => "reshape",
            Op::Permute { .. } => "permute",
            Op::Narrow { .. } => "narrow",
            Op::Broadcast { .. } => "broadcast",
            Op::Affine { .. } => "affine",
            Op::Contiguous { .. } => "contiguous",
            Op::Cat { .. } => "cat",
            Op::Powf { .. } => "powf",
            Op::Clamp { .. } => "clamp",
            Op::WhereCond { .. } => "where_cond",
            Op::Gather { .. } => "gather",
            Op::IndexSelect { .. } => "index_select",
            Op::Pad { .. } => "pad",
            Op::ToDType { .. } => "to_dtype",
        }
    }
}

impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<TensorId> = self.inputs().iter().map(|t| t.id()).collect();
        match self {
            Op::Binary { op, .. } => write!(f, "Binary({:?}, {:?})", op, ids),
            Op::Unary { op, .. } => write!(f, "Unary({:?}, {:?})", op, ids),
            Op::Reduce { op, dims, .. } => write!(f, "Reduce({:?}, dims={:?}, {:?})", op, dims, ids),
            other => write!(f, "{}({:?})", other.name(), ids),
        }
    }
}
