// Epilogue fusion for matrix multiplication
//
//   Add(MatMul(a, b), bias)            → MatMulBiasAdd(a, b, bias)
//   Relu(MatMul(a, b))                 → MatMul(a, b) {activation="relu"}
//   Relu(MatMulBiasAdd(a, b, bias))    → MatMulBiasAdd(a, b, bias) {activation="relu"}
//
// Both rewrites require the matmul to have exactly one user; otherwise the
// unfused value is still needed elsewhere. The Add is rewritten in place,
// so its id (and any reference to it) survives the fusion.

use marten_core::Result;
use marten_ops::prim;

use super::Pass;
use crate::graph::{Graph, NodeId, NodeKind};

const FUSIBLE_ACTIVATIONS: [(&str, &str); 4] = [
    (prim::RELU, "relu"),
    (prim::RELU6, "relu6"),
    (prim::SIGMOID, "sigmoid"),
    (prim::TANH, "tanh"),
];

fn single_use(graph: &Graph, id: NodeId) -> bool {
    graph.use_counts().get(&id).copied() == Some(1)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MatMulBiasAddFusion;

impl MatMulBiasAddFusion {
    /// `(matmul, bias)` when `id` is a fusible Add.
    fn matches(graph: &Graph, id: NodeId) -> Option<(NodeId, NodeId)> {
        let node = graph.get(id)?;
        let NodeKind::Apply { prim, inputs, .. } = &node.kind else {
            return None;
        };
        if prim != prim::ADD {
            return None;
        }
        let (mm, bias) = if graph.get(inputs[0])?.kind.is_apply_of(prim::MATMUL) {
            (inputs[0], inputs[1])
        } else if graph.get(inputs[1])?.kind.is_apply_of(prim::MATMUL) {
            (inputs[1], inputs[0])
        } else {
            return None;
        };
        let mm_abs = graph.get(mm)?.abstract_value.as_ref()?;
        let bias_abs = graph.get(bias)?.abstract_value.as_ref()?;
        let out_abs = node.abstract_value.as_ref()?;
        let n = *mm_abs.dims().last()?;
        let ok = bias_abs.rank() == 1
            && bias_abs.dims()[0] == n
            && bias_abs.dtype == mm_abs.dtype
            && out_abs == mm_abs
            && mm_abs.rank() >= 2
            && single_use(graph, mm);
        ok.then_some((mm, bias))
    }
}

impl Pass for MatMulBiasAddFusion {
    fn name(&self) -> &str {
        "matmul_bias_add_fusion"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for id in graph.topo_order()? {
            let Some((mm, bias)) = Self::matches(graph, id) else {
                continue;
            };
            let (attrs, ab) = match &graph.node(mm)?.kind {
                NodeKind::Apply { attrs, inputs, .. } => (attrs.clone(), inputs.clone()),
                _ => continue,
            };
            graph.node_mut(id)?.kind = NodeKind::Apply {
                prim: prim::MATMUL_BIAS_ADD.to_string(),
                attrs,
                inputs: vec![ab[0], ab[1], bias],
            };
            graph.remove_node(mm);
            tracing::debug!(node = %id, "fused matmul + bias add");
            changed = true;
        }
        Ok(changed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ActivationFusion;

impl Pass for ActivationFusion {
    fn name(&self) -> &str {
        "activation_fusion"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for id in graph.topo_order()? {
            let (act, producer) = match &graph.node(id)?.kind {
                NodeKind::Apply { prim, inputs, .. } => {
                    match FUSIBLE_ACTIVATIONS.iter().find(|(p, _)| p == prim) {
                        Some(&(_, act)) => (act, inputs[0]),
                        None => continue,
                    }
                }
                _ => continue,
            };
            let fusible = match &graph.node(producer)?.kind {
                NodeKind::Apply { prim, attrs, .. } => {
                    (prim == prim::MATMUL || prim == prim::MATMUL_BIAS_ADD)
                        && !attrs.contains("activation")
                }
                _ => false,
            };
            if !fusible || !single_use(graph, producer) {
                continue;
            }
            if let NodeKind::Apply { attrs, .. } = &mut graph.node_mut(producer)?.kind {
                attrs.set("activation", act);
            }
            graph.replace_all_uses(id, producer);
            graph.remove_node(id);
            tracing::debug!(node = %producer, activation = act, "fused activation");
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use marten_core::DType;
    use marten_ops::OpSet;

    fn dense(shared: bool) -> (crate::graph::Graph, NodeId, NodeId) {
        let mut b = GraphBuilder::new("dense");
        let x = b.parameter("x", &[2, 3], DType::F32);
        let w = b.parameter("w", &[3, 4], DType::F32);
        let bias = b.parameter("b", &[4], DType::F32);
        let mm = b.matmul(x, w, false, false);
        let y = b.add(mm, bias);
        let out = b.relu(y);
        let outputs = if shared { vec![out, mm] } else { vec![out] };
        let mut graph = b.finish(&outputs);
        graph.infer_shapes(&OpSet::builtin()).unwrap();
        (graph, y, out)
    }

    #[test]
    fn test_fuses_bias_and_activation() {
        let (mut graph, y, _) = dense(false);
        assert!(MatMulBiasAddFusion.run(&mut graph).unwrap());
        assert!(ActivationFusion.run(&mut graph).unwrap());
        let node = graph.node(y).unwrap();
        assert!(node.kind.is_apply_of(prim::MATMUL_BIAS_ADD));
        assert_eq!(graph.outputs(), &[y]);
        match &node.kind {
            NodeKind::Apply { attrs, .. } => assert_eq!(attrs.str("activation").unwrap(), "relu"),
            _ => unreachable!(),
        }
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_shared_matmul_is_not_fused() {
        let (mut graph, y, _) = dense(true);
        assert!(!MatMulBiasAddFusion.run(&mut graph).unwrap());
        assert!(graph.node(y).unwrap().kind.is_apply_of(prim::ADD));
    }
}
