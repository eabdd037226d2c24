// Common Subexpression Elimination
//
// Two Apply nodes with the same primitive, attributes and inputs compute
// the same value; the later one is redirected to the earlier. Constants are
// merged by value. Walking in topological order means inputs are already
// canonical when a node is keyed, so chains of duplicates collapse in one
// run. Parameters and Builtins are never merged.

use std::collections::HashMap;

use marten_core::Result;

use super::Pass;
use crate::graph::{Graph, NodeKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct CommonSubexpressionElimination;

impl Pass for CommonSubexpressionElimination {
    fn name(&self) -> &str {
        "common_subexpression_elimination"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut seen: HashMap<String, _> = HashMap::new();
        let mut changed = false;
        for id in graph.topo_order()? {
            let key = match &graph.node(id)?.kind {
                NodeKind::Apply { prim, attrs, inputs } => format!("{prim}|{attrs}|{inputs:?}"),
                NodeKind::Constant(t) => format!("const|{:?}", t.value_key()),
                _ => continue,
            };
            match seen.get(&key) {
                Some(&first) => {
                    graph.replace_all_uses(id, first);
                    graph.remove_node(id);
                    changed = true;
                }
                None => {
                    seen.insert(key, id);
                }
            }
        }
        Ok(changed)
    }
}
