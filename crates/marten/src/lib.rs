//! # Marten
//!
//! A deep learning framework core in Rust: graph compiler, autodiff,
//! parallel strategies and data pipelines.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use marten::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `marten-core` | Tensor, Shape, DType, Layout, Backend trait, eager autograd |
//! | `marten-cpu` | CPU backend with rayon kernels, dynamic memory pool |
//! | `marten-ops` | Operator definitions, kernel registry and dispatch |
//! | `marten-ir` | Graph IR, passes, symbolic autodiff, graph fallback, interpreter |
//! | `marten-parallel` | Device mesh, layouts, strategy propagation, redistribution, collectives |
//! | `marten-data` | Dataset pipelines, tree compilation, parallel map, DataLoader |
//! | `marten-optim` | Optimizer trait, SGD, Momentum, DimReduce |
//!
//! ## Modules
//!
//! - [`config`]: runtime configuration and [`config::Context`]
//! - [`logging`]: tracing subscriber setup
//! - [`profiler`]: timed events, memory snapshots, step-trace parsing
//! - [`checkpoint`]: save/load named tensors
//! - [`distributed`]: data-parallel gradient synchronisation

pub use marten_core::{
    backend::{Backend, BackendDevice, BackendStorage},
    op::TensorId,
    DType, Error, GradStore, Layout, Result, Shape, Tensor, WithDType,
};

pub use marten_cpu::{CpuBackend, CpuDevice, CpuTensor, DynamicMemPool, PoolStats};

/// Operator definitions and kernel dispatch.
pub mod ops {
    pub use marten_ops::*;
}

/// Graph IR, passes and the interpreter.
pub mod ir {
    pub use marten_ir::*;
}

/// Sharding strategies and collective communication.
pub mod parallel {
    pub use marten_parallel::*;
}

/// Dataset pipelines and loaders.
pub mod data {
    pub use marten_data::*;
}

/// Optimizers.
pub mod optim {
    pub use marten_optim::*;
}

/// Checkpoint: save and load named tensors.
pub mod checkpoint;

/// Runtime configuration.
pub mod config;

/// Data-parallel training helpers.
pub mod distributed;

/// Tracing subscriber setup.
pub mod logging;

/// Profiling: timed events, memory snapshots, step-trace parsing.
pub mod profiler;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::config::{Context, ExecutionMode, RuntimeConfig};
    pub use crate::data::{Column, DataLoader, Pipeline, Row, TreeAdapter};
    pub use crate::distributed::DataParallel;
    pub use crate::ir::{Graph, GraphBuilder, Interpreter, PassManager};
    pub use crate::optim::{DimReduce, DimReduceConfig, Momentum, Optimizer, Sgd};
    pub use crate::parallel::{Collective, DeviceMesh, LocalCommunicator, ParallelConfig, ReduceKind, TensorLayout};
    pub use crate::profiler::{format_bytes, ProfileReport, Profiler, ScopedTimer, StepTraceParser, Stopwatch};
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, GradStore, Shape, Tensor};
}
