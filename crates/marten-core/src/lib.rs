//! # marten-core
//!
//! Tensor primitives, the backend abstraction and eager autograd for Marten.
//!
//! - [`Tensor`]: n-dimensional array with tape-based automatic differentiation
//! - [`Shape`] / [`Layout`]: dimensions, strides and views over shared storage
//! - [`DType`]: element types (F16, BF16, F32, F64, U8, U32, I64)
//! - [`Backend`]: the trait every compute device implements
//! - [`GradStore`]: gradients returned by `Tensor::backward()`
//! - [`Error`]: the error type shared by the whole workspace

pub mod backend;
pub mod backprop;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod op;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp};
pub use backprop::GradStore;
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use op::{Op, TensorId};
pub use shape::Shape;
pub use tensor::Tensor;
