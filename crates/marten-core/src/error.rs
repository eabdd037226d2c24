use crate::dtype::DType;
use crate::shape::Shape;

/// Every failure mode in Marten.
///
/// One enum is shared by all crates of the workspace so that errors from the
/// pass manager, the kernel dispatcher, the collectives and the data pipeline
/// propagate with `?` without conversion layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: isize, rank: usize },

    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    #[error("cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements")]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// No kernel could be selected for the operator, even after dtype promotion.
    #[error("unsupported op {op} for dtype {dtype} on target {target}")]
    UnsupportedOp {
        op: String,
        dtype: DType,
        target: String,
    },

    /// The memory pool could not satisfy an allocation.
    #[error("out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    /// A collective did not receive a peer's contribution in time.
    #[error("collective {op} timed out on rank {rank} after {timeout_ms} ms")]
    CollectiveTimeout {
        op: String,
        rank: usize,
        timeout_ms: u64,
    },

    /// Rows reaching a batch disagree on a column's shape or dtype.
    #[error("dataset schema mismatch in column '{column}': expected {expected}, got {got}")]
    SchemaMismatch {
        column: String,
        expected: String,
        got: String,
    },

    /// Autodiff reached an operator that has no derivative rule.
    #[error("operator {op} is not differentiable")]
    NotDifferentiable { op: String },

    /// A host-only construct survived graph compilation.
    #[error("untranslatable construct in graph mode: {construct}")]
    Untranslatable { construct: String },

    #[error("invalid parallel strategy: {0}")]
    InvalidStrategy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn strategy(s: impl Into<String>) -> Self {
        Error::InvalidStrategy(s.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted `Error::Msg`.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_values() {
        let e = Error::UnsupportedOp {
            op: "MatMul".into(),
            dtype: DType::U8,
            target: "cpu".into(),
        };
        assert_eq!(e.to_string(), "unsupported op MatMul for dtype u8 on target cpu");

        let e = Error::ShapeMismatch {
            expected: Shape::from((2, 3)),
            got: Shape::from(4),
        };
        assert_eq!(e.to_string(), "shape mismatch: expected [2, 3], got [4]");
    }

    #[test]
    fn test_bail() {
        fn fails(v: usize) -> Result<()> {
            if v > 1 {
                bail!("value {} too large", v);
            }
            Ok(())
        }
        assert!(fails(0).is_ok());
        assert_eq!(fails(3).unwrap_err().to_string(), "value 3 too large");
    }
}
