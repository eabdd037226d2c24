//! # marten-parallel
//!
//! Automatic parallelism for Marten graphs.
//!
//! - [`DeviceMesh`] / [`TensorLayout`]: how ranks are arranged and how one
//!   tensor is split over them
//! - [`ops_info`]: per-primitive sharding rules ([`OperatorInfo`])
//! - [`propagate`]: a layout for every node from a few user strategies
//! - [`redistribute`]: the collectives that bridge layout mismatches
//! - [`comm`]: the [`Collective`] trait and the thread-local communicator
//! - [`exec`]: run a sharded graph with one thread per rank
//! - [`config`]: transformer parallel degrees and their strategies
//!
//! ```text
//! strategies → propagate → insert_redistribution → local_graph → execute_sharded
//! ```

pub mod comm;
pub mod config;
pub mod exec;
pub mod layout;
pub mod mesh;
pub mod ops_info;
pub mod propagate;
pub mod redistribute;

pub use comm::{Collective, CommGroup, LocalCommunicator, ReduceKind, WORLD_GROUP};
pub use config::{AttentionStrategies, FeedForwardStrategies, ParallelConfig};
pub use exec::{
    execute_sharded, execute_sharded_with_timeout, register_collectives, ShardedProgram,
    DEFAULT_COLLECTIVE_TIMEOUT,
};
pub use layout::{Partial, PartialOp, Strategy, TensorLayout};
pub use mesh::DeviceMesh;
pub use ops_info::{operator_info, DimMapping, OpContext, OpLayouts, OperatorInfo};
pub use propagate::{propagate, NodeStrategy, StrategyMap, StrategySource};
pub use redistribute::{insert_redistribution, plan_redistribution, LayoutTable, RedistOp};
