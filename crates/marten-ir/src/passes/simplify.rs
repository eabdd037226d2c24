// Algebraic simplification
//
// Rewrites identities to their operand:
//
//   x + 0, 0 + x, x - 0, x * 1, 1 * x, x / 1   → x
//   Neg(Neg(x))                                 → x
//   Reshape(x) to x's own shape                 → x
//   Transpose(x) with the identity permutation  → x
//   Cast(x) to x's own dtype, Identity(x)       → x
//
// A rewrite only fires when the node's abstract value equals x's, so a
// broadcast such as `x[3] + zeros[2, 3]` is never collapsed to `x`.

use marten_core::Result;
use marten_ops::prim;

use super::Pass;
use crate::graph::{Graph, NodeId, NodeKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct AlgebraicSimplify;

fn is_const(graph: &Graph, id: NodeId, v: f64) -> bool {
    graph
        .get(id)
        .and_then(|n| n.kind.as_constant())
        .map_or(false, |t| t.is_all(v))
}

/// The operand a node reduces to, if it is an identity.
fn identity_operand(graph: &Graph, id: NodeId) -> Option<NodeId> {
    let node = graph.get(id)?;
    let NodeKind::Apply { prim, attrs, inputs } = &node.kind else {
        return None;
    };
    let candidate = match (prim.as_str(), inputs.as_slice()) {
        (prim::ADD, &[a, b]) => {
            if is_const(graph, b, 0.0) {
                a
            } else if is_const(graph, a, 0.0) {
                b
            } else {
                return None;
            }
        }
        (prim::MUL, &[a, b]) => {
            if is_const(graph, b, 1.0) {
                a
            } else if is_const(graph, a, 1.0) {
                b
            } else {
                return None;
            }
        }
        (prim::SUB, &[a, b]) if is_const(graph, b, 0.0) => a,
        (prim::DIV, &[a, b]) if is_const(graph, b, 1.0) => a,
        (prim::NEG, &[a]) => match &graph.get(a)?.kind {
            NodeKind::Apply { prim, inputs, .. } if prim == prim::NEG => inputs[0],
            _ => return None,
        },
        (prim::TRANSPOSE, &[a]) => {
            let perm = attrs.usizes("perm").ok()?;
            if perm.iter().enumerate().any(|(i, &p)| i != p) {
                return None;
            }
            a
        }
        (prim::RESHAPE | prim::CAST | prim::IDENTITY, &[a]) => a,
        _ => return None,
    };
    let out = node.abstract_value.as_ref()?;
    let operand = graph.get(candidate)?.abstract_value.as_ref()?;
    (out == operand).then_some(candidate)
}

impl Pass for AlgebraicSimplify {
    fn name(&self) -> &str {
        "algebraic_simplify"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for id in graph.topo_order()? {
            if let Some(operand) = identity_operand(graph, id) {
                if graph.replace_all_uses(id, operand) > 0 {
                    tracing::debug!(node = %id, operand = %operand, "identity removed");
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}
