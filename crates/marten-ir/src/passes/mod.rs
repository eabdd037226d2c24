// Passes — graph-to-graph rewrites and the manager that iterates them
//
// Each pass rewrites the graph in place and reports whether it changed
// anything. The PassManager runs its pipeline again and again until a full
// sweep changes nothing (a fixpoint) or `max_iterations` is reached.
//
// Passes keep abstract values current for the nodes they create or rewrite,
// so the pipeline never needs a separate inference sweep. Nodes without an
// abstract value are left alone by every shape-sensitive rewrite.
//
// PIPELINES:
//
//   canonicalize  — AlgebraicSimplify, ConstantFolding, CSE, DCE
//   fuse          — MatMulBiasAddFusion, ActivationFusion, DCE

mod cast;
mod cse;
mod dce;
mod fold;
mod fusion;
mod simplify;

pub use cast::InsertCast;
pub use cse::CommonSubexpressionElimination;
pub use dce::DeadCodeElimination;
pub use fold::ConstantFolding;
pub use fusion::{ActivationFusion, MatMulBiasAddFusion};
pub use simplify::AlgebraicSimplify;

use std::fmt;

use marten_core::Result;

use crate::graph::Graph;

/// A composable graph rewrite.
pub trait Pass {
    fn name(&self) -> &str;

    /// Returns `true` when the graph was modified.
    fn run(&self, graph: &mut Graph) -> Result<bool>;
}

/// How often one pass ran and how often it changed the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassStats {
    pub name: String,
    pub runs: usize,
    pub changes: usize,
}

impl fmt::Display for PassStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} runs, {} changes", self.name, self.runs, self.changes)
    }
}

/// Runs a pipeline of passes to a fixpoint.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    max_iterations: usize,
    stats: Vec<PassStats>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    pub const DEFAULT_MAX_ITERATIONS: usize = 10;

    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            stats: Vec::new(),
        }
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    pub fn with_pass(mut self, pass: impl Pass + 'static) -> Self {
        self.add(pass);
        self
    }

    pub fn add(&mut self, pass: impl Pass + 'static) {
        self.stats.push(PassStats {
            name: pass.name().to_string(),
            runs: 0,
            changes: 0,
        });
        self.passes.push(Box::new(pass));
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn stats(&self) -> &[PassStats] {
        &self.stats
    }

    /// Sweep the pipeline until nothing changes. Returns the number of
    /// sweeps that changed the graph.
    pub fn run(&mut self, graph: &mut Graph) -> Result<usize> {
        let mut changed_sweeps = 0;
        for iteration in 0..self.max_iterations {
            let mut changed = false;
            for (pass, stats) in self.passes.iter().zip(self.stats.iter_mut()) {
                let did = pass.run(graph)?;
                stats.runs += 1;
                if did {
                    stats.changes += 1;
                    tracing::debug!(pass = pass.name(), iteration, nodes = graph.len(), "pass changed graph");
                }
                changed |= did;
            }
            if !changed {
                return Ok(changed_sweeps);
            }
            changed_sweeps += 1;
        }
        tracing::warn!(
            graph = %graph.name,
            max_iterations = self.max_iterations,
            "pass pipeline did not reach a fixpoint"
        );
        Ok(changed_sweeps)
    }
}

/// The standard cleanup pipeline.
pub fn canonicalize(graph: &mut Graph) -> Result<()> {
    PassManager::new()
        .with_pass(AlgebraicSimplify)
        .with_pass(ConstantFolding::new())
        .with_pass(CommonSubexpressionElimination)
        .with_pass(DeadCodeElimination)
        .run(graph)?;
    Ok(())
}

/// Fuse matmul epilogues.
pub fn fuse(graph: &mut Graph) -> Result<()> {
    PassManager::new()
        .with_pass(MatMulBiasAddFusion)
        .with_pass(ActivationFusion)
        .with_pass(DeadCodeElimination)
        .run(graph)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountDown(Cell<usize>);

    impl Pass for CountDown {
        fn name(&self) -> &str {
            "count_down"
        }

        fn run(&self, _graph: &mut Graph) -> Result<bool> {
            let left = self.0.get();
            if left == 0 {
                return Ok(false);
            }
            self.0.set(left - 1);
            Ok(true)
        }
    }

    #[test]
    fn test_manager_stops_at_fixpoint() {
        let mut pm = PassManager::new().with_pass(CountDown(Cell::new(3)));
        let mut g = Graph::new("g");
        assert_eq!(pm.run(&mut g).unwrap(), 3);
        assert_eq!(pm.stats()[0].runs, 4);
        assert_eq!(pm.stats()[0].changes, 3);
    }

    #[test]
    fn test_manager_caps_iterations() {
        let mut pm = PassManager::new()
            .with_max_iterations(2)
            .with_pass(CountDown(Cell::new(100)));
        let mut g = Graph::new("g");
        assert_eq!(pm.run(&mut g).unwrap(), 2);
        assert_eq!(pm.stats()[0].runs, 2);
    }
}
