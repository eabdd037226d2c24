// GraphBuilder — typed construction of graphs
//
// One helper per primitive, each returning the new node's id. The builder
// does no checking; `infer_shapes` reports malformed applications.
//
// USAGE:
//   let mut b = GraphBuilder::new("dense");
//   let x = b.parameter("x", &[2, 3], DType::F32);
//   let w = b.parameter("w", &[3, 4], DType::F32);
//   let y = b.matmul(x, w, false, false);
//   let out = b.relu(y);
//   let graph = b.finish(&[out]);

use marten_core::DType;
use marten_ops::{prim, AbstractTensor, Attrs};

use crate::graph::{BuiltinArg, Graph, HostTensor, NodeId};

macro_rules! unary_helpers {
    ($($fn_name:ident => $prim:expr),* $(,)?) => {
        $(
            pub fn $fn_name(&mut self, x: NodeId) -> NodeId {
                self.apply($prim, &[x], Attrs::new())
            }
        )*
    };
}

macro_rules! binary_helpers {
    ($($fn_name:ident => $prim:expr),* $(,)?) => {
        $(
            pub fn $fn_name(&mut self, a: NodeId, b: NodeId) -> NodeId {
                self.apply($prim, &[a, b], Attrs::new())
            }
        )*
    };
}

macro_rules! reduce_helpers {
    ($($fn_name:ident => $prim:expr),* $(,)?) => {
        $(
            /// An empty `axes` reduces every axis.
            pub fn $fn_name(&mut self, x: NodeId, axes: &[i64], keep_dims: bool) -> NodeId {
                let attrs = Attrs::new().with("axis", axes.to_vec()).with("keep_dims", keep_dims);
                self.apply($prim, &[x], attrs)
            }
        )*
    };
}

pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(name),
        }
    }

    /// Continue building on an existing graph.
    pub fn from_graph(graph: Graph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn finish(mut self, outputs: &[NodeId]) -> Graph {
        self.graph.set_outputs(outputs.to_vec());
        self.graph
    }

    /// The graph as built so far, outputs untouched.
    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn parameter(&mut self, name: &str, dims: &[usize], dtype: DType) -> NodeId {
        self.graph.add_parameter(name, AbstractTensor::new(dims, dtype))
    }

    pub fn constant(&mut self, value: HostTensor) -> NodeId {
        self.graph.add_constant(value)
    }

    pub fn scalar(&mut self, value: f64, dtype: DType) -> NodeId {
        self.graph.add_constant(HostTensor::scalar(value, dtype))
    }

    pub fn apply(&mut self, prim: &str, inputs: &[NodeId], attrs: Attrs) -> NodeId {
        self.graph.add_apply(prim, attrs, inputs)
    }

    pub fn builtin(&mut self, func: &str, args: Vec<BuiltinArg>) -> NodeId {
        self.graph.add_builtin(func, args)
    }

    binary_helpers! {
        add => prim::ADD,
        sub => prim::SUB,
        mul => prim::MUL,
        div => prim::DIV,
        maximum => prim::MAXIMUM,
        minimum => prim::MINIMUM,
        pow => prim::POW,
        equal => prim::EQUAL,
        greater => prim::GREATER,
        less => prim::LESS,
        bias_add => prim::BIAS_ADD,
        gather_nd => prim::GATHER_ND,
        gelu_grad => prim::GELU_GRAD,
        silu_grad => prim::SILU_GRAD,
    }

    unary_helpers! {
        neg => prim::NEG,
        abs => prim::ABS,
        exp => prim::EXP,
        log => prim::LOG,
        sqrt => prim::SQRT,
        relu => prim::RELU,
        relu6 => prim::RELU6,
        hswish => prim::HSWISH,
        sigmoid => prim::SIGMOID,
        tanh => prim::TANH,
        gelu => prim::GELU,
        silu => prim::SILU,
        sin => prim::SIN,
        cos => prim::COS,
        square => prim::SQUARE,
        floor => prim::FLOOR,
        ceil => prim::CEIL,
        round => prim::ROUND,
        sign => prim::SIGN,
        reciprocal => prim::RECIPROCAL,
        identity => prim::IDENTITY,
        zeros_like => prim::ZEROS_LIKE,
        ones_like => prim::ONES_LIKE,
    }

    reduce_helpers! {
        reduce_sum => prim::REDUCE_SUM,
        reduce_mean => prim::REDUCE_MEAN,
        reduce_max => prim::REDUCE_MAX,
        reduce_min => prim::REDUCE_MIN,
    }

    pub fn leaky_relu(&mut self, x: NodeId, alpha: f64) -> NodeId {
        self.apply(prim::LEAKY_RELU, &[x], Attrs::new().with("alpha", alpha))
    }

    pub fn cast(&mut self, x: NodeId, dtype: DType) -> NodeId {
        self.apply(prim::CAST, &[x], Attrs::new().with("dtype", dtype))
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId, transpose_a: bool, transpose_b: bool) -> NodeId {
        let attrs = Attrs::new()
            .with("transpose_a", transpose_a)
            .with("transpose_b", transpose_b);
        self.apply(prim::MATMUL, &[a, b], attrs)
    }

    pub fn argmax(&mut self, x: NodeId, axis: i64) -> NodeId {
        self.apply(prim::ARGMAX, &[x], Attrs::new().with("axis", axis))
    }

    pub fn argmin(&mut self, x: NodeId, axis: i64) -> NodeId {
        self.apply(prim::ARGMIN, &[x], Attrs::new().with("axis", axis))
    }

    pub fn softmax(&mut self, x: NodeId, axis: i64) -> NodeId {
        self.apply(prim::SOFTMAX, &[x], Attrs::new().with("axis", axis))
    }

    pub fn log_softmax(&mut self, x: NodeId, axis: i64) -> NodeId {
        self.apply(prim::LOG_SOFTMAX, &[x], Attrs::new().with("axis", axis))
    }

    /// One entry may be `-1`.
    pub fn reshape(&mut self, x: NodeId, shape: &[i64]) -> NodeId {
        self.apply(prim::RESHAPE, &[x], Attrs::new().with("shape", shape.to_vec()))
    }

    pub fn transpose(&mut self, x: NodeId, perm: &[usize]) -> NodeId {
        let perm: Vec<i64> = perm.iter().map(|&p| p as i64).collect();
        self.apply(prim::TRANSPOSE, &[x], Attrs::new().with("perm", perm))
    }

    /// An empty `axes` squeezes every size-1 dim.
    pub fn squeeze(&mut self, x: NodeId, axes: &[i64]) -> NodeId {
        self.apply(prim::SQUEEZE, &[x], Attrs::new().with("axis", axes.to_vec()))
    }

    pub fn unsqueeze(&mut self, x: NodeId, axis: i64) -> NodeId {
        self.apply(prim::UNSQUEEZE, &[x], Attrs::new().with("axis", axis))
    }

    pub fn broadcast_to(&mut self, x: NodeId, shape: &[i64]) -> NodeId {
        self.apply(prim::BROADCAST_TO, &[x], Attrs::new().with("shape", shape.to_vec()))
    }

    pub fn concat(&mut self, xs: &[NodeId], axis: i64) -> NodeId {
        self.apply(prim::CONCAT, xs, Attrs::new().with("axis", axis))
    }

    /// A size of `-1` runs to the end of the dim.
    pub fn slice(&mut self, x: NodeId, begin: &[i64], size: &[i64]) -> NodeId {
        let attrs = Attrs::new().with("begin", begin.to_vec()).with("size", size.to_vec());
        self.apply(prim::SLICE, &[x], attrs)
    }

    pub fn gather(&mut self, params: NodeId, indices: NodeId, axis: i64) -> NodeId {
        self.apply(prim::GATHER, &[params, indices], Attrs::new().with("axis", axis))
    }

    pub fn scatter_nd(&mut self, indices: NodeId, updates: NodeId, shape: &[i64]) -> NodeId {
        let attrs = Attrs::new().with("shape", shape.to_vec());
        self.apply(prim::SCATTER_ND, &[indices, updates], attrs)
    }

    pub fn unsorted_segment_sum(&mut self, data: NodeId, ids: NodeId, num_segments: usize) -> NodeId {
        let attrs = Attrs::new().with("num_segments", num_segments as i64);
        self.apply(prim::UNSORTED_SEGMENT_SUM, &[data, ids], attrs)
    }

    pub fn one_hot(&mut self, indices: NodeId, depth: usize, on: f64, off: f64, axis: i64) -> NodeId {
        let attrs = Attrs::new()
            .with("depth", depth as i64)
            .with("on_value", on)
            .with("off_value", off)
            .with("axis", axis);
        self.apply(prim::ONE_HOT, &[indices], attrs)
    }

    /// `paddings[d] = [before, after]`.
    pub fn pad(&mut self, x: NodeId, paddings: &[[usize; 2]], value: f64) -> NodeId {
        let flat: Vec<i64> = paddings.iter().flat_map(|p| [p[0] as i64, p[1] as i64]).collect();
        let attrs = Attrs::new().with("paddings", flat).with("value", value);
        self.apply(prim::PAD, &[x], attrs)
    }

    pub fn select(&mut self, cond: NodeId, on_true: NodeId, on_false: NodeId) -> NodeId {
        self.apply(prim::SELECT, &[cond, on_true, on_false], Attrs::new())
    }

    pub fn smooth_l1_loss(&mut self, prediction: NodeId, target: NodeId, beta: f64) -> NodeId {
        let attrs = Attrs::new().with("beta", beta);
        self.apply(prim::SMOOTH_L1_LOSS, &[prediction, target], attrs)
    }

    pub fn smooth_l1_loss_grad(&mut self, prediction: NodeId, target: NodeId, dout: NodeId, beta: f64) -> NodeId {
        let attrs = Attrs::new().with("beta", beta);
        self.apply(prim::SMOOTH_L1_LOSS_GRAD, &[prediction, target, dout], attrs)
    }

    pub fn sum_to_shape(&mut self, x: NodeId, shape: &[usize]) -> NodeId {
        let shape: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        self.apply(prim::SUM_TO_SHAPE, &[x], Attrs::new().with("shape", shape))
    }

    pub fn split(&mut self, x: NodeId, axis: i64, parts: usize, index: usize) -> NodeId {
        let attrs = Attrs::new()
            .with("axis", axis)
            .with("parts", parts as i64)
            .with("index", index as i64);
        self.apply(prim::SPLIT, &[x], attrs)
    }

    /// `op` is one of `sum`, `max`, `min`, `prod`.
    pub fn all_reduce(&mut self, x: NodeId, op: &str) -> NodeId {
        self.apply(prim::ALL_REDUCE, &[x], Attrs::new().with("op", op))
    }

    pub fn all_gather(&mut self, x: NodeId, axis: i64, group_size: usize) -> NodeId {
        let attrs = Attrs::new().with("axis", axis).with("group_size", group_size as i64);
        self.apply(prim::ALL_GATHER, &[x], attrs)
    }

    pub fn reduce_scatter(&mut self, x: NodeId, axis: i64, group_size: usize) -> NodeId {
        let attrs = Attrs::new().with("axis", axis).with("group_size", group_size as i64);
        self.apply(prim::REDUCE_SCATTER, &[x], attrs)
    }

    pub fn broadcast(&mut self, x: NodeId, root: usize) -> NodeId {
        self.apply(prim::BROADCAST, &[x], Attrs::new().with("root", root as i64))
    }

    pub fn all_to_all(&mut self, x: NodeId, split_axis: i64, concat_axis: i64, group_size: usize) -> NodeId {
        let attrs = Attrs::new()
            .with("split_axis", split_axis)
            .with("concat_axis", concat_axis)
            .with("group_size", group_size as i64);
        self.apply(prim::ALL_TO_ALL, &[x], attrs)
    }
}
