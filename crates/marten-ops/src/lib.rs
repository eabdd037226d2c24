//! # marten-ops
//!
//! The primitive catalogue and its kernels.
//!
//! - [`OpSet`] / [`OpDef`]: arity, differentiability and shape/dtype inference
//!   for every primitive named in [`prim`]
//! - [`Attrs`]: the typed attribute map carried by each application
//! - [`KernelRegistry`]: kernels keyed by (op, target, dtype), with selection
//!   that widens the dtype and falls back to host kernels
//! - [`linalg`]: f64 dense linear algebra behind the host kernels

pub mod attrs;
mod kernels;
pub mod linalg;
pub mod opdef;
pub mod prim;
pub mod registry;

pub use attrs::{AttrValue, Attrs};
pub use opdef::{AbstractTensor, Arity, InferFn, OpDef, OpSet};
pub use registry::{key_dtype, KernelFn, KernelRegistry, KernelSelection, KernelTarget};
