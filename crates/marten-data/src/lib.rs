//! # marten-data
//!
//! Dataset pipelines for Marten.
//!
//! - [`Dataset`] / [`RowSource`]: indexed samples and the rows read from them
//! - [`Pipeline`]: a tree of map, filter, shuffle, batch, repeat and friends
//! - [`TreeAdapter`]: the compiled tree, yielding rows epoch by epoch
//! - [`DataLoader`]: compiled pipeline rows collated into tensors
//!
//! Parallel maps keep the sequential row order for any worker count, so a
//! seeded pipeline always produces the same rows.

pub mod combinators;
pub mod dataset;
mod exec;
pub mod loader;
pub mod pipeline;
pub mod source;
pub mod transform;
pub mod tree_adapter;

pub use combinators::{train_test_split, ConcatDataset, MapDataset, SubsetDataset, VecDataset};
pub use dataset::{Column, Dataset, Row, Sample};
pub use loader::{Batch, DataLoader, EpochIter};
pub use pipeline::{Pipeline, PipelineNode, Predicate};
pub use source::{DatasetSource, GeneratorSource, RowSource};
pub use transform::{Normalize, OneHot, Reshape, Transform, TypeCast};
pub use tree_adapter::{TreeAdapter, DEFAULT_PREFETCH_SIZE};
