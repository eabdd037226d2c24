// Dead Code Elimination
//
// Marks everything reachable backwards from the outputs and removes the
// rest. Parameters always survive: they define the graph's signature.

use std::collections::HashSet;

use marten_core::Result;

use super::Pass;
use crate::graph::{Graph, NodeKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dead_code_elimination"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut live: HashSet<_> = HashSet::new();
        let mut stack: Vec<_> = graph.outputs().to_vec();
        while let Some(id) = stack.pop() {
            if !live.insert(id) {
                continue;
            }
            stack.extend(graph.node(id)?.kind.inputs());
        }

        let dead: Vec<_> = graph
            .nodes()
            .filter(|n| !live.contains(&n.id) && !matches!(n.kind, NodeKind::Parameter(_)))
            .map(|n| n.id)
            .collect();
        for &id in &dead {
            graph.remove_node(id);
        }
        if !dead.is_empty() {
            tracing::debug!(removed = dead.len(), "dead nodes removed");
        }
        Ok(!dead.is_empty())
    }
}
