//! # marten-ir
//!
//! The graph IR for Marten and everything that transforms it.
//!
//! - [`Graph`] / [`GraphBuilder`]: functional graphs of primitive applications
//! - [`passes`]: the [`Pass`] trait, [`PassManager`] and the standard rewrites
//! - [`grad`]: symbolic reverse-mode differentiation
//! - [`fallback`]: compile-time evaluation of host builtins
//! - [`Interpreter`]: evaluates a graph on real tensors through a kernel registry
//!
//! ```text
//! build → infer_shapes → grad → canonicalize → fuse → InsertCast → Interpreter::run
//! ```

pub mod builder;
pub mod fallback;
pub mod grad;
pub mod graph;
pub mod interp;
pub mod passes;

pub use builder::GraphBuilder;
pub use fallback::{call_builtin, resolve_builtins, FallbackPass, HostValue};
pub use grad::grad;
pub use graph::{infer_shapes, BuiltinArg, Graph, HostTensor, Node, NodeId, NodeKind};
pub use interp::Interpreter;
pub use passes::{canonicalize, fuse, Pass, PassManager, PassStats};
