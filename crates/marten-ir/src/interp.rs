// Interpreter — evaluate a graph on real tensors
//
// Nodes are evaluated in topological order. Parameters are bound by name
// from the caller's map and checked against their declared shape; Apply
// nodes go through the kernel registry (and therefore through heterogeneous
// kernel selection); Builtin nodes run on the host when runtime fallback is
// enabled and are `Untranslatable` otherwise.
//
// Every builtin result is also kept as a host value in a side table, so a
// bool or tuple keeps its type when it feeds another builtin. Results with
// no tensor form (strings, for example) may only feed other builtins.

use std::collections::HashMap;

use marten_core::{Backend, Error, Result, Tensor};
use marten_ops::KernelRegistry;

use crate::fallback::{call_builtin, HostValue};
use crate::graph::{BuiltinArg, Graph, HostTensor, NodeId, NodeKind};

pub struct Interpreter<B: Backend> {
    registry: KernelRegistry<B>,
    device: B::Device,
    runtime_fallback: bool,
}

impl<B: Backend> Interpreter<B> {
    pub fn new(registry: KernelRegistry<B>, device: B::Device) -> Self {
        Self {
            registry,
            device,
            runtime_fallback: false,
        }
    }

    /// Evaluate leftover Builtin nodes on the host instead of failing.
    pub fn with_runtime_fallback(mut self, enabled: bool) -> Self {
        self.runtime_fallback = enabled;
        self
    }

    pub fn registry(&self) -> &KernelRegistry<B> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut KernelRegistry<B> {
        &mut self.registry
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Evaluate the graph and return its outputs in order.
    pub fn run(&self, graph: &Graph, params: &HashMap<String, Tensor<B>>) -> Result<Vec<Tensor<B>>> {
        let values = self.run_all(graph, params)?;
        graph
            .outputs()
            .iter()
            .map(|o| {
                values.get(o).cloned().ok_or_else(|| {
                    Error::msg(format!("output {o} has no tensor value"))
                })
            })
            .collect()
    }

    /// Evaluate the graph and return the tensor value of every node.
    pub fn run_all(
        &self,
        graph: &Graph,
        params: &HashMap<String, Tensor<B>>,
    ) -> Result<HashMap<NodeId, Tensor<B>>> {
        let mut values: HashMap<NodeId, Tensor<B>> = HashMap::new();
        let mut host: HashMap<NodeId, HostValue> = HashMap::new();
        for id in graph.topo_order()? {
            let node = graph.node(id)?;
            let value = match &node.kind {
                NodeKind::Parameter(name) => {
                    let t = params
                        .get(name)
                        .ok_or_else(|| Error::msg(format!("no value bound for parameter '{name}'")))?;
                    if let Some(expected) = &node.abstract_value {
                        if t.shape() != &expected.shape {
                            return Err(Error::ShapeMismatch {
                                expected: expected.shape.clone(),
                                got: t.shape().clone(),
                            });
                        }
                        if t.dtype() != expected.dtype {
                            return Err(Error::DTypeMismatch {
                                expected: expected.dtype,
                                got: t.dtype(),
                            });
                        }
                    }
                    t.clone()
                }
                NodeKind::Constant(c) => c.to_tensor(&self.device)?,
                NodeKind::Apply { prim, attrs, inputs } => {
                    let args = inputs
                        .iter()
                        .map(|i| {
                            values
                                .get(i)
                                .cloned()
                                .ok_or_else(|| Error::msg(format!("{id} = {prim} reads {i}, which has no tensor value")))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    self.registry.dispatch_one(prim, &args, attrs)?
                }
                NodeKind::Builtin { func, args } => {
                    if !self.runtime_fallback {
                        return Err(Error::Untranslatable {
                            construct: format!("builtin '{func}' at {id}"),
                        });
                    }
                    let args = args
                        .iter()
                        .map(|a| self.host_arg(a, &values, &host))
                        .collect::<Result<Vec<_>>>()?;
                    let result = call_builtin(func, &args)?;
                    tracing::debug!(node = %id, func = %func, "builtin evaluated on host");
                    // Downstream builtins read the typed value, not the tensor form.
                    let tensor = result.to_host_tensor();
                    host.insert(id, result);
                    match tensor {
                        Some(t) => t.to_tensor(&self.device)?,
                        None => continue,
                    }
                }
            };
            values.insert(id, value);
        }
        Ok(values)
    }

    fn host_arg(
        &self,
        arg: &BuiltinArg,
        values: &HashMap<NodeId, Tensor<B>>,
        host: &HashMap<NodeId, HostValue>,
    ) -> Result<HostValue> {
        match arg {
            BuiltinArg::Value(v) => Ok(v.clone()),
            BuiltinArg::Node(id) => {
                if let Some(v) = host.get(id) {
                    return Ok(v.clone());
                }
                let t = values
                    .get(id)
                    .ok_or_else(|| Error::msg(format!("builtin argument {id} has no value")))?;
                Ok(HostValue::from_host_tensor(&HostTensor::from_tensor(t)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use marten_core::DType;
    use marten_cpu::{CpuBackend, CpuDevice};

    fn interp() -> Interpreter<CpuBackend> {
        Interpreter::new(KernelRegistry::with_defaults(), CpuDevice)
    }

    #[test]
    fn test_runs_dense_layer() {
        let mut b = GraphBuilder::new("dense");
        let x = b.parameter("x", &[1, 2], DType::F64);
        let w = b.parameter("w", &[2, 2], DType::F64);
        let y = b.matmul(x, w, false, false);
        let out = b.relu(y);
        let graph = b.finish(&[out]);

        let mut params = HashMap::new();
        params.insert(
            "x".to_string(),
            Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0], (1, 2), DType::F64, &CpuDevice).unwrap(),
        );
        params.insert(
            "w".to_string(),
            Tensor::<CpuBackend>::from_f64_slice(&[1.0, -1.0, 1.0, -1.0], (2, 2), DType::F64, &CpuDevice)
                .unwrap(),
        );
        let out = interp().run(&graph, &params).unwrap();
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![3.0, 0.0]);
    }

    #[test]
    fn test_missing_and_misshapen_parameters() {
        let mut b = GraphBuilder::new("g");
        let x = b.parameter("x", &[2], DType::F32);
        let out = b.exp(x);
        let graph = b.finish(&[out]);
        assert!(interp().run(&graph, &HashMap::new()).is_err());

        let mut params = HashMap::new();
        params.insert("x".to_string(), Tensor::<CpuBackend>::zeros(3, DType::F32, &CpuDevice).unwrap());
        let err = interp().run(&graph, &params).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_builtins_need_runtime_fallback() {
        let mut b = GraphBuilder::new("g");
        let s = b.builtin("str", vec![BuiltinArg::Value(HostValue::Int(42))]);
        let n = b.builtin("len", vec![BuiltinArg::Node(s)]);
        let graph = b.finish(&[n]);

        let err = interp().run(&graph, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Untranslatable { .. }));

        let out = interp().with_runtime_fallback(true).run(&graph, &HashMap::new()).unwrap();
        assert_eq!(out[0].to_scalar_f64().unwrap(), 2.0);
        assert_eq!(out[0].dtype(), DType::I64);
    }
}
