// Strategy propagation
//
// Assigns a layout to every node of a graph:
//
//   1. Nodes the user gave a strategy keep it. For a Parameter the strategy
//      has one entry, the parameter's own split counts.
//   2. A Parameter without one is stored the way its first consumer (in
//      topological order) wants to read it.
//   3. Every other application takes, in order of preference, the layout
//      its inputs already have, the data-parallel default (leading dim of
//      the first input split over mesh axis 0), or full replication. The
//      first candidate the operator's rule accepts wins.
//
// Mismatches between what a producer yields and what a consumer wants are
// not errors here; `insert_redistribution` bridges them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use marten_core::{Error, Result};
use marten_ir::{infer_shapes, Graph, NodeId, NodeKind};
use marten_ops::{AbstractTensor, OpSet};

use crate::layout::{Strategy, TensorLayout};
use crate::mesh::DeviceMesh;
use crate::ops_info::{operator_info, OpContext, OpLayouts, OperatorInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategySource {
    User,
    /// Taken from the inputs' layouts or, for a parameter, its consumer.
    Propagated,
    DataParallel,
    Replicated,
}

impl fmt::Display for StrategySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategySource::User => "user",
            StrategySource::Propagated => "propagated",
            StrategySource::DataParallel => "data_parallel",
            StrategySource::Replicated => "replicated",
        };
        f.write_str(s)
    }
}

/// The decision for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStrategy {
    pub strategy: Strategy,
    /// Layouts the node reads its inputs in; empty for parameters and
    /// constants.
    pub inputs: Vec<TensorLayout>,
    pub output: TensorLayout,
    pub source: StrategySource,
}

impl NodeStrategy {
    fn leaf(output: TensorLayout, source: StrategySource) -> Self {
        Self {
            strategy: vec![output.splits()],
            inputs: Vec::new(),
            output,
            source,
        }
    }

    fn apply(layouts: OpLayouts, source: StrategySource) -> Self {
        Self {
            strategy: layouts.inputs.iter().map(TensorLayout::splits).collect(),
            inputs: layouts.inputs,
            output: layouts.output,
            source,
        }
    }
}

pub type StrategyMap = BTreeMap<NodeId, NodeStrategy>;

fn abstract_of(graph: &Graph, id: NodeId) -> Result<AbstractTensor> {
    Ok(graph.abstract_of(id)?.clone())
}

/// Layouts an application would need under `strategy`.
fn user_layouts(graph: &Graph, id: NodeId, strategy: &Strategy, mesh: &DeviceMesh) -> Result<OpLayouts> {
    let node = graph.node(id)?;
    let (prim, attrs, inputs) = match &node.kind {
        NodeKind::Apply { prim, attrs, inputs } => (prim, attrs, inputs),
        _ => return Err(Error::msg(format!("{id} is not an application"))),
    };
    let input_values = inputs
        .iter()
        .map(|&i| abstract_of(graph, i))
        .collect::<Result<Vec<_>>>()?;
    let output = abstract_of(graph, id)?;
    let ctx = OpContext {
        prim,
        attrs,
        inputs: &input_values,
        output: &output,
        mesh,
    };
    operator_info(prim).infer_layouts(&ctx, strategy).map_err(|e| {
        Error::strategy(format!("strategy {strategy:?} for {id} = {prim}: {e}"))
    })
}

/// Default layout of an unconstrained parameter: leading dim over mesh
/// axis 0 when it divides, otherwise whole.
fn parameter_default(mesh: &DeviceMesh, dims: &[usize]) -> (TensorLayout, StrategySource) {
    let n = mesh.axis_size(0);
    if n > 1 && !dims.is_empty() && dims[0] % n == 0 {
        let mut map = vec![-1; dims.len()];
        map[0] = mesh.map_for_axis(0);
        if let Ok(layout) = TensorLayout::new(mesh, map, dims.to_vec()) {
            return (layout, StrategySource::DataParallel);
        }
    }
    (TensorLayout::replicated(mesh, dims.to_vec()), StrategySource::Replicated)
}

/// Assign a layout to every node of `graph`. `user` maps nodes to
/// strategies: per-input split counts for applications, a single entry for
/// parameters.
pub fn propagate(graph: &Graph, user: &HashMap<NodeId, Strategy>, mesh: &DeviceMesh) -> Result<StrategyMap> {
    let mut graph = graph.clone();
    infer_shapes(&mut graph, &OpSet::builtin())?;
    let order = graph.topo_order()?;
    let mut map = StrategyMap::new();
    let mut annotated: HashMap<NodeId, OpLayouts> = HashMap::new();

    for &id in &order {
        let node = graph.node(id)?;
        match &node.kind {
            NodeKind::Parameter(name) => {
                if let Some(strategy) = user.get(&id) {
                    if strategy.len() != 1 {
                        return Err(Error::strategy(format!(
                            "parameter '{name}' takes one split list, got {}",
                            strategy.len()
                        )));
                    }
                    let dims = abstract_of(&graph, id)?.dims().to_vec();
                    let layout = TensorLayout::from_splits(mesh, &strategy[0], dims)?;
                    map.insert(id, NodeStrategy::leaf(layout, StrategySource::User));
                }
            }
            NodeKind::Constant(c) => {
                let layout = TensorLayout::replicated(mesh, c.shape.dims().to_vec());
                map.insert(id, NodeStrategy::leaf(layout, StrategySource::Replicated));
            }
            NodeKind::Builtin { func, .. } => {
                return Err(Error::Untranslatable {
                    construct: format!("builtin '{func}' at {id} in a sharded graph"),
                });
            }
            NodeKind::Apply { .. } => {
                if let Some(strategy) = user.get(&id) {
                    annotated.insert(id, user_layouts(&graph, id, strategy, mesh)?);
                }
            }
        }
    }

    // Parameters read by an annotated application take its layout.
    for &id in &order {
        let (inputs, layouts) = match (&graph.node(id)?.kind, annotated.get(&id)) {
            (NodeKind::Apply { inputs, .. }, Some(l)) => (inputs, l),
            _ => continue,
        };
        for (&input, layout) in inputs.iter().zip(&layouts.inputs) {
            let is_param = matches!(graph.node(input)?.kind, NodeKind::Parameter(_));
            if is_param && !map.contains_key(&input) {
                map.insert(input, NodeStrategy::leaf(layout.clone(), StrategySource::Propagated));
            }
        }
    }

    for &id in &order {
        let node = graph.node(id)?;
        let (prim, attrs, inputs) = match &node.kind {
            NodeKind::Apply { prim, attrs, inputs } => (prim, attrs, inputs),
            _ => continue,
        };
        let decided = if let Some(layouts) = annotated.remove(&id) {
            NodeStrategy::apply(layouts, StrategySource::User)
        } else {
            let input_values = inputs
                .iter()
                .map(|&i| abstract_of(&graph, i))
                .collect::<Result<Vec<_>>>()?;
            let output = abstract_of(&graph, id)?;
            let ctx = OpContext {
                prim,
                attrs,
                inputs: &input_values,
                output: &output,
                mesh,
            };
            let known: Vec<Option<&TensorLayout>> =
                inputs.iter().map(|i| map.get(i).map(|s| &s.output)).collect();
            choose(&*operator_info(prim), &ctx, &known)?
        };
        tracing::debug!(node = %id, prim = %prim, source = %decided.source, output = %decided.output, "strategy assigned");
        for (&input, layout) in inputs.iter().zip(&decided.inputs) {
            if !map.contains_key(&input) && matches!(graph.node(input)?.kind, NodeKind::Parameter(_)) {
                map.insert(input, NodeStrategy::leaf(layout.clone(), StrategySource::Propagated));
            }
        }
        map.insert(id, decided);
    }

    // Parameters nothing reads.
    for &id in &order {
        if matches!(graph.node(id)?.kind, NodeKind::Parameter(_)) && !map.contains_key(&id) {
            let dims = abstract_of(&graph, id)?.dims().to_vec();
            let (layout, source) = parameter_default(mesh, &dims);
            map.insert(id, NodeStrategy::leaf(layout, source));
        }
    }
    Ok(map)
}

fn choose(info: &dyn OperatorInfo, ctx: &OpContext<'_>, known: &[Option<&TensorLayout>]) -> Result<NodeStrategy> {
    if known.iter().any(Option::is_some) {
        match info.follow_inputs(ctx, known) {
            Ok(l) => return Ok(NodeStrategy::apply(l, StrategySource::Propagated)),
            Err(e) => tracing::debug!(prim = %ctx.prim, error = %e, "input layouts rejected"),
        }
    }
    if let Ok(l) = info.data_parallel(ctx) {
        return Ok(NodeStrategy::apply(l, StrategySource::DataParallel));
    }
    Ok(NodeStrategy::apply(info.replicated(ctx)?, StrategySource::Replicated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::DType;
    use marten_ir::GraphBuilder;

    #[test]
    fn test_user_strategy_flows_to_parameters_and_users() {
        let mesh = DeviceMesh::new(vec![2, 2]).unwrap();
        let mut b = GraphBuilder::new("ffn");
        let x = b.parameter("x", &[4, 6], DType::F64);
        let w = b.parameter("w", &[6, 8], DType::F64);
        let h = b.matmul(x, w, false, false);
        let r = b.relu(h);
        let graph = b.finish(&[r]);

        let mut user = HashMap::new();
        user.insert(h, vec![vec![2, 1], vec![1, 2]]);
        let map = propagate(&graph, &user, &mesh).unwrap();

        assert_eq!(map[&h].source, StrategySource::User);
        assert_eq!(map[&x].output.tensor_map, vec![1, -1]);
        assert_eq!(map[&w].output.tensor_map, vec![-1, 0]);
        assert_eq!(map[&r].source, StrategySource::Propagated);
        assert_eq!(map[&r].output.tensor_map, vec![1, 0]);
        assert_eq!(map[&r].strategy, vec![vec![2, 2]]);
    }

    #[test]
    fn test_unannotated_graph_is_data_parallel() {
        let mesh = DeviceMesh::line(4).unwrap();
        let mut b = GraphBuilder::new("dp");
        let x = b.parameter("x", &[8, 3], DType::F64);
        let w = b.parameter("w", &[3, 2], DType::F64);
        let y = b.matmul(x, w, false, false);
        let s = b.softmax(y, -1);
        let graph = b.finish(&[s]);

        let map = propagate(&graph, &HashMap::new(), &mesh).unwrap();
        assert_eq!(map[&y].source, StrategySource::DataParallel);
        assert_eq!(map[&x].output.tensor_map, vec![0, -1]);
        assert!(map[&w].output.is_replicated());
        assert_eq!(map[&s].output.tensor_map, vec![0, -1]);
    }

    #[test]
    fn test_rejected_input_layout_falls_back() {
        let mesh = DeviceMesh::line(2).unwrap();
        let mut b = GraphBuilder::new("g");
        let x = b.parameter("x", &[4, 4], DType::F64);
        let e = b.exp(x);
        let s = b.softmax(e, -1);
        let graph = b.finish(&[s]);

        let mut user = HashMap::new();
        user.insert(e, vec![vec![1, 2]]);
        let map = propagate(&graph, &user, &mesh).unwrap();
        // the softmax axis cannot stay split, so the leading dim takes over
        assert_eq!(map[&s].source, StrategySource::DataParallel);
        assert_eq!(map[&s].inputs[0].tensor_map, vec![0, -1]);
    }

    #[test]
    fn test_bad_user_strategy_is_reported() {
        let mesh = DeviceMesh::line(2).unwrap();
        let mut b = GraphBuilder::new("g");
        let x = b.parameter("x", &[3, 4], DType::F64);
        let e = b.exp(x);
        let graph = b.finish(&[e]);
        let mut user = HashMap::new();
        user.insert(e, vec![vec![2, 1]]);
        let err = propagate(&graph, &user, &mesh).unwrap_err();
        assert!(matches!(err, Error::InvalidStrategy(_)));
    }
}
