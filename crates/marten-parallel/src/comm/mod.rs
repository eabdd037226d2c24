// Collective communication
//
// A `Collective` is one rank's handle on a group of ranks. Every rank of a
// group must issue the same collectives in the same order; messages between
// two ranks are FIFO, so that order is what pairs a send with its receive.
//
//   all_reduce      every rank ends with the elementwise reduction
//   all_gather      every rank ends with all buffers concatenated by rank
//   reduce_scatter  rank r ends with chunk r of the reduction
//   broadcast       every rank ends with the root's buffer
//   all_to_all      rank r sends chunk j to rank j
//
// `LocalCommunicator` implements the trait for ranks that live on threads
// of one process.

mod local;

use std::fmt;
use std::str::FromStr;

use marten_core::{Error, Result};

pub use local::LocalCommunicator;

/// Name of the group that holds every rank.
pub const WORLD_GROUP: &str = "marten_world_group";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
    Prod,
}

impl ReduceKind {
    pub fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceKind::Sum => a + b,
            ReduceKind::Max => a.max(b),
            ReduceKind::Min => a.min(b),
            ReduceKind::Prod => a * b,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReduceKind::Sum => "sum",
            ReduceKind::Max => "max",
            ReduceKind::Min => "min",
            ReduceKind::Prod => "prod",
        }
    }
}

impl fmt::Display for ReduceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReduceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(ReduceKind::Sum),
            "max" => Ok(ReduceKind::Max),
            "min" => Ok(ReduceKind::Min),
            "prod" => Ok(ReduceKind::Prod),
            other => Err(Error::msg(format!("unknown reduce op '{other}'"))),
        }
    }
}

/// A named set of world ranks. Position in `ranks` is the rank inside the
/// group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommGroup {
    pub name: String,
    pub ranks: Vec<usize>,
}

impl CommGroup {
    pub fn new(name: impl Into<String>, ranks: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            ranks,
        }
    }

    pub fn world(size: usize) -> Self {
        Self::new(WORLD_GROUP, (0..size).collect())
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// The group rank of a world rank, if it is a member.
    pub fn group_rank(&self, world_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == world_rank)
    }
}

/// One rank's view of a communication group.
pub trait Collective: Send + Sync {
    /// Rank inside the group.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn group(&self) -> &CommGroup;

    fn all_reduce(&self, data: &mut [f64], op: ReduceKind) -> Result<()>;

    /// Buffers of every rank concatenated in rank order. All ranks must
    /// contribute buffers of the same length.
    fn all_gather(&self, data: &[f64]) -> Result<Vec<f64>>;

    /// Reduce, then keep this rank's equal chunk.
    fn reduce_scatter(&self, data: &[f64], op: ReduceKind) -> Result<Vec<f64>>;

    fn broadcast(&self, data: &mut Vec<f64>, root: usize) -> Result<()>;

    /// `chunks[j]` goes to rank j; the result's `[j]` came from rank j.
    fn all_to_all(&self, chunks: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>>;

    fn barrier(&self) -> Result<()>;
}
