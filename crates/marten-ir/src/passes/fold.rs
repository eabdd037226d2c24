// Constant Folding
//
// An Apply node whose inputs are all Constants is evaluated on the CPU
// through the kernel registry and replaced, in place, by a Constant
// holding the result. Collectives are never folded: their value depends on
// the other ranks. A kernel failure leaves the node as it is; the
// interpreter will report the same failure at run time.

use marten_core::{DType, Result};
use marten_cpu::{CpuBackend, CpuDevice};
use marten_ops::{prim, KernelRegistry};

use super::Pass;
use crate::graph::{Graph, HostTensor, NodeKind};

pub struct ConstantFolding {
    registry: KernelRegistry<CpuBackend>,
}

impl Default for ConstantFolding {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantFolding {
    pub fn new() -> Self {
        Self {
            registry: KernelRegistry::with_defaults(),
        }
    }

    pub fn with_registry(registry: KernelRegistry<CpuBackend>) -> Self {
        Self { registry }
    }
}

impl Pass for ConstantFolding {
    fn name(&self) -> &str {
        "constant_folding"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for id in graph.topo_order()? {
            let (prim, attrs, inputs) = match &graph.node(id)?.kind {
                NodeKind::Apply { prim, attrs, inputs } => (prim.clone(), attrs.clone(), inputs.clone()),
                _ => continue,
            };
            if prim::is_collective(&prim) || inputs.is_empty() {
                continue;
            }
            let consts: Option<Vec<HostTensor>> = inputs
                .iter()
                .map(|&i| graph.get(i).and_then(|n| n.kind.as_constant()).cloned())
                .collect();
            let Some(consts) = consts else {
                continue;
            };
            let tensors = consts
                .iter()
                .map(|c| c.to_tensor::<CpuBackend>(&CpuDevice))
                .collect::<Result<Vec<_>>>()?;
            let value = match self.registry.dispatch_one(&prim, &tensors, &attrs) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(node = %id, prim = %prim, error = %e, "not folded");
                    continue;
                }
            };
            let mut folded = HostTensor::from_tensor(&value)?;
            // Kernels may compute in a wider dtype; keep the declared one.
            let node = graph.node_mut(id)?;
            if let Some(expected) = node.abstract_value.as_ref().map(|a| a.dtype) {
                folded.dtype = expected;
                folded.data = round_to(expected, folded.data);
            }
            node.abstract_value = Some(folded.abstract_value());
            node.kind = NodeKind::Constant(folded);
            changed = true;
        }
        Ok(changed)
    }
}

fn round_to(dtype: DType, data: Vec<f64>) -> Vec<f64> {
    if dtype.is_float() {
        data
    } else {
        data.into_iter().map(f64::trunc).collect()
    }
}
