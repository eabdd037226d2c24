// InsertCast — make kernel-selection casts explicit in the graph
//
// For every Apply node the registry picks a kernel (see
// `KernelRegistry::select_kernel`). When that kernel is registered for a
// different dtype than the inputs carry, this pass inserts Cast nodes in
// front of the node and, for float inputs, a Cast back after it, so the
// graph states exactly what dispatch would do implicitly:
//
//   %2 = Exp(%1) : f16[4]
//
// becomes
//
//   %3 = Cast(%1) {dtype=f32} : f32[4]
//   %2 = Exp(%3) : f32[4]
//   %4 = Cast(%2) {dtype=f16} : f16[4]
//
// Integer inputs promoted to a float kernel keep the float result, which
// then flows into the users; abstract values are re-inferred as the walk
// proceeds. Nodes with no kernel at all are left for the interpreter to
// report.

use marten_core::{Backend, Result};
use marten_ops::{prim, Attrs, KernelRegistry, OpSet};

use super::Pass;
use crate::graph::{Graph, NodeId, NodeKind};

pub struct InsertCast<B: Backend> {
    registry: KernelRegistry<B>,
    ops: OpSet,
}

impl<B: Backend> InsertCast<B> {
    pub fn new(registry: KernelRegistry<B>) -> Self {
        Self {
            registry,
            ops: OpSet::builtin(),
        }
    }

    fn infer(&self, graph: &Graph, id: NodeId) -> Option<marten_ops::AbstractTensor> {
        let NodeKind::Apply { prim, attrs, inputs } = &graph.get(id)?.kind else {
            return None;
        };
        let args = inputs
            .iter()
            .map(|&i| graph.get(i).and_then(|n| n.abstract_value.clone()))
            .collect::<Option<Vec<_>>>()?;
        self.ops.infer(prim, &args, attrs).ok()
    }

    fn cast_node(&self, graph: &mut Graph, x: NodeId, dtype: marten_core::DType) -> Result<NodeId> {
        let id = graph.add_apply(prim::CAST, Attrs::new().with("dtype", dtype), &[x]);
        let shape = graph.abstract_of(x)?.shape.clone();
        graph.node_mut(id)?.abstract_value = Some(marten_ops::AbstractTensor::new(shape, dtype));
        Ok(id)
    }
}

impl<B: Backend> Pass for InsertCast<B> {
    fn name(&self) -> &str {
        "insert_cast"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for id in graph.topo_order()? {
            let (prim_name, inputs) = match &graph.node(id)?.kind {
                NodeKind::Apply { prim, inputs, .. } if prim != prim::CAST => (prim.clone(), inputs.clone()),
                _ => continue,
            };
            if let Some(refreshed) = self.infer(graph, id) {
                graph.node_mut(id)?.abstract_value = Some(refreshed);
            }
            let dtypes = match inputs
                .iter()
                .map(|&i| graph.abstract_of(i).map(|a| a.dtype))
                .collect::<Result<Vec<_>>>()
            {
                Ok(d) => d,
                Err(_) => continue,
            };
            let Ok(sel) = self.registry.select_kernel(&prim_name, &dtypes) else {
                continue;
            };
            if !sel.needs_cast {
                continue;
            }

            let mut new_inputs = inputs.clone();
            for (slot, dtype) in new_inputs.iter_mut().zip(&dtypes) {
                if *dtype == sel.input_dtype {
                    *slot = self.cast_node(graph, *slot, sel.kernel_dtype)?;
                }
            }
            if let NodeKind::Apply { inputs, .. } = &mut graph.node_mut(id)?.kind {
                *inputs = new_inputs;
            }
            let inferred = self.infer(graph, id);
            let out_dtype = inferred.as_ref().map(|a| a.dtype);
            graph.node_mut(id)?.abstract_value = inferred;

            if sel.input_dtype.is_float() && out_dtype == Some(sel.kernel_dtype) {
                let back = self.cast_node(graph, id, sel.input_dtype)?;
                graph.replace_all_uses(id, back);
            }
            tracing::debug!(
                node = %id,
                op = %prim_name,
                from = %sel.input_dtype,
                to = %sel.kernel_dtype,
                "cast inserted"
            );
            changed = true;
        }
        Ok(changed)
    }
}
