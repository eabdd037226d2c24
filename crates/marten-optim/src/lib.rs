//! # marten-optim
//!
//! Optimizers for Marten.
//!
//! - [`Optimizer`]: one update of a parameter list from a [`GradStore`]
//! - [`Sgd`], [`Momentum`]: first-order updates
//! - [`DimReduce`]: quasi-Newton steps in a PCA subspace of the parameters,
//!   with a backtracking line search, wrapped around any [`Optimizer`]
//!
//! [`GradStore`]: marten_core::GradStore

pub mod dim_reduce;
pub mod optimizer;

pub use dim_reduce::{DimReduce, DimReduceConfig, DimReduceStep};
pub use optimizer::{Momentum, Optimizer, Sgd};
