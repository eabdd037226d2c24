// Primitive names
//
// Every operator the graph IR, the autodiff rules and the kernel registry
// talk about is identified by one of these strings.

pub const ADD: &str = "Add";
pub const SUB: &str = "Sub";
pub const MUL: &str = "Mul";
pub const DIV: &str = "Div";
pub const MAXIMUM: &str = "Maximum";
pub const MINIMUM: &str = "Minimum";
pub const POW: &str = "Pow";

pub const EQUAL: &str = "Equal";
pub const GREATER: &str = "Greater";
pub const LESS: &str = "Less";

pub const NEG: &str = "Neg";
pub const ABS: &str = "Abs";
pub const EXP: &str = "Exp";
pub const LOG: &str = "Log";
pub const SQRT: &str = "Sqrt";
pub const RELU: &str = "Relu";
pub const RELU6: &str = "Relu6";
pub const HSWISH: &str = "HSwish";
pub const LEAKY_RELU: &str = "LeakyRelu";
pub const SIGMOID: &str = "Sigmoid";
pub const TANH: &str = "Tanh";
pub const GELU: &str = "Gelu";
pub const SILU: &str = "Silu";
pub const SIN: &str = "Sin";
pub const COS: &str = "Cos";
pub const SQUARE: &str = "Square";
pub const FLOOR: &str = "Floor";
pub const CEIL: &str = "Ceil";
pub const ROUND: &str = "Round";
pub const SIGN: &str = "Sign";
pub const RECIPROCAL: &str = "Reciprocal";
pub const IDENTITY: &str = "Identity";
pub const ZEROS_LIKE: &str = "ZerosLike";
pub const ONES_LIKE: &str = "OnesLike";
pub const CAST: &str = "Cast";

pub const GELU_GRAD: &str = "GeluGrad";
pub const SILU_GRAD: &str = "SiluGrad";
pub const SMOOTH_L1_LOSS_GRAD: &str = "SmoothL1LossGrad";

pub const MATMUL: &str = "MatMul";
pub const MATMUL_BIAS_ADD: &str = "MatMulBiasAdd";
pub const BIAS_ADD: &str = "BiasAdd";

pub const REDUCE_SUM: &str = "ReduceSum";
pub const REDUCE_MEAN: &str = "ReduceMean";
pub const REDUCE_MAX: &str = "ReduceMax";
pub const REDUCE_MIN: &str = "ReduceMin";
pub const ARGMAX: &str = "ArgMax";
pub const ARGMIN: &str = "ArgMin";
pub const SOFTMAX: &str = "Softmax";
pub const LOG_SOFTMAX: &str = "LogSoftmax";

pub const RESHAPE: &str = "Reshape";
pub const TRANSPOSE: &str = "Transpose";
pub const SQUEEZE: &str = "Squeeze";
pub const UNSQUEEZE: &str = "Unsqueeze";
pub const BROADCAST_TO: &str = "BroadcastTo";
pub const CONCAT: &str = "Concat";
pub const SLICE: &str = "Slice";
pub const GATHER: &str = "Gather";
pub const GATHER_ND: &str = "GatherNd";
pub const SCATTER_ND: &str = "ScatterNd";
pub const UNSORTED_SEGMENT_SUM: &str = "UnsortedSegmentSum";
pub const ONE_HOT: &str = "OneHot";
pub const PAD: &str = "Pad";
pub const SELECT: &str = "Select";
pub const SMOOTH_L1_LOSS: &str = "SmoothL1Loss";
pub const SUM_TO_SHAPE: &str = "SumToShape";
pub const SPLIT: &str = "Split";

pub const ALL_REDUCE: &str = "AllReduce";
pub const ALL_GATHER: &str = "AllGather";
pub const REDUCE_SCATTER: &str = "ReduceScatter";
pub const BROADCAST: &str = "Broadcast";
pub const ALL_TO_ALL: &str = "AllToAll";

pub const MATRIX_INVERSE: &str = "MatrixInverse";
pub const CHOLESKY: &str = "Cholesky";
pub const BLOCK_DIAG: &str = "BlockDiag";

// Host-only kernels with several outputs; they have no graph-level OpDef.
pub const LU: &str = "Lu";
pub const LU_FACTOR: &str = "LuFactor";
pub const LU_SOLVE: &str = "LuSolve";
pub const CHO_SOLVE: &str = "ChoSolve";
pub const EIGH: &str = "Eigh";

/// Elementwise binary primitives that broadcast.
pub const BINARY: [&str; 7] = [ADD, SUB, MUL, DIV, MAXIMUM, MINIMUM, POW];

/// Comparison primitives producing `u8` masks.
pub const COMPARE: [&str; 3] = [EQUAL, GREATER, LESS];

/// Shape-preserving unary primitives.
pub const UNARY: [&str; 24] = [
    NEG, ABS, EXP, LOG, SQRT, RELU, RELU6, HSWISH, LEAKY_RELU, SIGMOID, TANH, GELU, SILU, SIN,
    COS, SQUARE, FLOOR, CEIL, ROUND, SIGN, RECIPROCAL, IDENTITY, ZEROS_LIKE, ONES_LIKE,
];

pub const REDUCE: [&str; 4] = [REDUCE_SUM, REDUCE_MEAN, REDUCE_MAX, REDUCE_MIN];

/// Primitives that exchange data between ranks.
pub const COLLECTIVES: [&str; 5] = [ALL_REDUCE, ALL_GATHER, REDUCE_SCATTER, BROADCAST, ALL_TO_ALL];

pub fn is_collective(name: &str) -> bool {
    COLLECTIVES.contains(&name)
}
