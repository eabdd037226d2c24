// Redistribution — bridging layout mismatches with collectives
//
// A producer's output layout and the layout a consumer reads it in may
// differ. `plan_redistribution` turns the difference into a short list of
// steps:
//
//   1. a partial value is reduced first: ReduceScatter when the target is
//      split on the single partial axis, AllReduce otherwise;
//   2. every dim split on an axis the target does not split it on is freed,
//      by AllToAll when the target moves that axis to a dim that is whole
//      right now, by AllGather otherwise;
//   3. every target split still missing is cut out locally with Split.
//
// `insert_redistribution` applies the plans to a graph, one chain per
// (producer, target layout) pair, and records the layout of every node.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use marten_core::{Error, Result};
use marten_ir::{infer_shapes, Graph, NodeId, NodeKind};
use marten_ops::{prim, AbstractTensor, Attrs, OpSet};

use crate::layout::{PartialOp, TensorLayout};
use crate::propagate::StrategyMap;

/// Layout of every node of a sharded graph.
pub type LayoutTable = BTreeMap<NodeId, TensorLayout>;

/// One redistribution step. Mesh axes count from the left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedistOp {
    AllReduce { op: PartialOp, mesh_axes: Vec<usize> },
    ReduceScatter { dim: usize, mesh_axis: usize },
    AllGather { dim: usize, mesh_axis: usize },
    Split { dim: usize, mesh_axis: usize },
    AllToAll { split_dim: usize, concat_dim: usize, mesh_axis: usize },
}

impl fmt::Display for RedistOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedistOp::AllReduce { op, mesh_axes } => write!(f, "AllReduce({}, axes={mesh_axes:?})", op.as_str()),
            RedistOp::ReduceScatter { dim, mesh_axis } => write!(f, "ReduceScatter(dim={dim}, axis={mesh_axis})"),
            RedistOp::AllGather { dim, mesh_axis } => write!(f, "AllGather(dim={dim}, axis={mesh_axis})"),
            RedistOp::Split { dim, mesh_axis } => write!(f, "Split(dim={dim}, axis={mesh_axis})"),
            RedistOp::AllToAll {
                split_dim,
                concat_dim,
                mesh_axis,
            } => write!(f, "AllToAll(split={split_dim}, concat={concat_dim}, axis={mesh_axis})"),
        }
    }
}

fn mesh_axis(layout: &TensorLayout, map: i64) -> usize {
    layout.device_arrangement.len() - 1 - map as usize
}

fn map_value(layout: &TensorLayout, axis: usize) -> i64 {
    (layout.device_arrangement.len() - 1 - axis) as i64
}

impl RedistOp {
    /// The layout after this step runs on a value laid out as `layout`.
    pub fn apply(&self, layout: &TensorLayout) -> TensorLayout {
        let mut next = layout.without_partial();
        match *self {
            RedistOp::AllReduce { .. } => {}
            RedistOp::ReduceScatter { dim, mesh_axis } | RedistOp::Split { dim, mesh_axis } => {
                next.tensor_map[dim] = map_value(layout, mesh_axis);
            }
            RedistOp::AllGather { dim, .. } => next.tensor_map[dim] = -1,
            RedistOp::AllToAll {
                split_dim,
                concat_dim,
                mesh_axis,
            } => {
                next.tensor_map[concat_dim] = -1;
                next.tensor_map[split_dim] = map_value(layout, mesh_axis);
            }
        }
        next
    }

    fn node_parts(&self, layout: &TensorLayout) -> (&'static str, Attrs) {
        let group = |axis: usize| layout.device_arrangement[axis] as i64;
        match self {
            RedistOp::AllReduce { op, mesh_axes } => {
                let axes: Vec<i64> = mesh_axes.iter().map(|&a| a as i64).collect();
                (
                    prim::ALL_REDUCE,
                    Attrs::new().with("op", op.as_str()).with("mesh_axes", axes),
                )
            }
            RedistOp::ReduceScatter { dim, mesh_axis } => (
                prim::REDUCE_SCATTER,
                Attrs::new()
                    .with("axis", *dim as i64)
                    .with("group_size", group(*mesh_axis))
                    .with("mesh_axis", *mesh_axis as i64),
            ),
            RedistOp::AllGather { dim, mesh_axis } => (
                prim::ALL_GATHER,
                Attrs::new()
                    .with("axis", *dim as i64)
                    .with("group_size", group(*mesh_axis))
                    .with("mesh_axis", *mesh_axis as i64),
            ),
            // the per-rank Split kernel replaces `index` with the mesh coordinate
            RedistOp::Split { dim, mesh_axis } => (
                prim::SPLIT,
                Attrs::new()
                    .with("axis", *dim as i64)
                    .with("parts", group(*mesh_axis))
                    .with("index", 0i64)
                    .with("mesh_axis", *mesh_axis as i64),
            ),
            RedistOp::AllToAll {
                split_dim,
                concat_dim,
                mesh_axis,
            } => (
                prim::ALL_TO_ALL,
                Attrs::new()
                    .with("split_axis", *split_dim as i64)
                    .with("concat_axis", *concat_dim as i64)
                    .with("group_size", group(*mesh_axis))
                    .with("mesh_axis", *mesh_axis as i64),
            ),
        }
    }
}

/// Steps that take a value from layout `from` to layout `to`.
pub fn plan_redistribution(from: &TensorLayout, to: &TensorLayout) -> Result<Vec<RedistOp>> {
    if from.tensor_shape != to.tensor_shape || from.device_arrangement != to.device_arrangement {
        return Err(Error::strategy(format!("cannot redistribute {from} into {to}")));
    }
    if from == to {
        return Ok(Vec::new());
    }
    if to.is_partial() {
        return Err(Error::strategy(format!("cannot produce partial layout {to} from {from}")));
    }

    let mut plan = Vec::new();
    let mut cur = from.tensor_map.clone();

    if let Some(partial) = &from.partial {
        let scatter_dim = match partial.axes.as_slice() {
            [a] if partial.op == PartialOp::Sum => to.dim_of(*a).filter(|&d| cur[d] == -1),
            _ => None,
        };
        match scatter_dim {
            Some(dim) => {
                let a = partial.axes[0];
                plan.push(RedistOp::ReduceScatter {
                    dim,
                    mesh_axis: mesh_axis(from, a),
                });
                cur[dim] = a;
            }
            None => plan.push(RedistOp::AllReduce {
                op: partial.op,
                mesh_axes: partial.axes.iter().map(|&a| mesh_axis(from, a)).collect(),
            }),
        }
    }

    for d in 0..cur.len() {
        let m = cur[d];
        if m == -1 || m == to.tensor_map[d] {
            continue;
        }
        match to.dim_of(m).filter(|&e| cur[e] == -1) {
            Some(e) => {
                plan.push(RedistOp::AllToAll {
                    split_dim: e,
                    concat_dim: d,
                    mesh_axis: mesh_axis(from, m),
                });
                cur[e] = m;
            }
            None => plan.push(RedistOp::AllGather {
                dim: d,
                mesh_axis: mesh_axis(from, m),
            }),
        }
        cur[d] = -1;
    }

    for (d, &t) in to.tensor_map.iter().enumerate() {
        if t != -1 && cur[d] != t {
            plan.push(RedistOp::Split {
                dim: d,
                mesh_axis: mesh_axis(from, t),
            });
            cur[d] = t;
        }
    }
    Ok(plan)
}

struct Rewriter<'a> {
    graph: &'a mut Graph,
    layouts: LayoutTable,
    chains: HashMap<(NodeId, TensorLayout), NodeId>,
}

impl Rewriter<'_> {
    /// The node holding `source` laid out as `to`, building the chain once.
    fn redistributed(&mut self, source: NodeId, to: &TensorLayout) -> Result<NodeId> {
        let from = self
            .layouts
            .get(&source)
            .cloned()
            .ok_or_else(|| Error::msg(format!("{source} has no layout")))?;
        if &from == to {
            return Ok(source);
        }
        let key = (source, to.clone());
        if let Some(&id) = self.chains.get(&key) {
            return Ok(id);
        }
        let global: AbstractTensor = self.graph.abstract_of(source)?.clone();
        let plan = plan_redistribution(&from, to)?;
        let (mut cur, mut layout) = (source, from);
        for step in &plan {
            let (prim, attrs) = step.node_parts(&layout);
            let id = self.graph.add_apply(prim, attrs, &[cur]);
            self.graph.node_mut(id)?.abstract_value = Some(global.clone());
            layout = step.apply(&layout);
            self.layouts.insert(id, layout.clone());
            cur = id;
        }
        tracing::debug!(
            source = %source,
            to = %to,
            steps = %plan.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "redistribution inserted"
        );
        self.chains.insert(key, cur);
        Ok(cur)
    }
}

/// Rewrite `graph` so every application reads its inputs in the layouts
/// `strategies` chose, and every graph output ends up replicated.
///
/// New nodes carry the global abstract value of the value they move.
pub fn insert_redistribution(graph: &mut Graph, strategies: &StrategyMap) -> Result<LayoutTable> {
    infer_shapes(graph, &OpSet::builtin())?;
    let order = graph.topo_order()?;
    let mut layouts = LayoutTable::new();
    for &id in &order {
        let s = strategies
            .get(&id)
            .ok_or_else(|| Error::strategy(format!("{id} has no strategy")))?;
        layouts.insert(id, s.output.clone());
    }
    let mut rw = Rewriter {
        graph,
        layouts,
        chains: HashMap::new(),
    };

    for &id in &order {
        let inputs = match &rw.graph.node(id)?.kind {
            NodeKind::Apply { inputs, .. } => inputs.clone(),
            _ => continue,
        };
        let wanted = &strategies[&id].inputs;
        let mut rewired = Vec::with_capacity(inputs.len());
        for (&input, to) in inputs.iter().zip(wanted) {
            rewired.push(rw.redistributed(input, to)?);
        }
        let node = rw.graph.node_mut(id)?;
        if let NodeKind::Apply { prim: name, attrs, inputs } = &mut node.kind {
            *inputs = rewired;
            if name.as_str() == prim::GATHER {
                tag_sharded_gather(attrs, &wanted[0])?;
            }
        }
    }

    let mut outputs = Vec::new();
    for &o in &rw.graph.outputs().to_vec() {
        let layout = &rw.layouts[&o];
        let target = TensorLayout {
            tensor_map: vec![-1; layout.rank()],
            partial: None,
            ..layout.clone()
        };
        outputs.push(rw.redistributed(o, &target)?);
    }
    rw.graph.set_outputs(outputs);
    Ok(rw.layouts)
}

/// Mark a Gather whose table is split along the gathered axis; each rank
/// then looks up only the rows it holds.
fn tag_sharded_gather(attrs: &mut Attrs, params: &TensorLayout) -> Result<()> {
    let axis = marten_core::shape::normalize_axis(attrs.int_or("axis", 0)? as isize, params.rank().max(1))?;
    if let Some(&m) = params.tensor_map.get(axis) {
        if m != -1 {
            attrs.set("shard_mesh_axis", mesh_axis(params, m) as i64);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::DeviceMesh;

    fn layout(mesh: &DeviceMesh, map: &[i64], shape: &[usize]) -> TensorLayout {
        TensorLayout::new(mesh, map.to_vec(), shape.to_vec()).unwrap()
    }

    #[test]
    fn test_identical_layouts_need_nothing() {
        let mesh = DeviceMesh::new(vec![2, 2]).unwrap();
        let l = layout(&mesh, &[1, -1], &[4, 4]);
        assert!(plan_redistribution(&l, &l).unwrap().is_empty());
    }

    #[test]
    fn test_partial_sum_reduces_or_scatters() {
        let mesh = DeviceMesh::new(vec![2, 2]).unwrap();
        let partial = layout(&mesh, &[1, -1], &[4, 4]).with_partial(PartialOp::Sum, vec![0]);
        let whole = layout(&mesh, &[1, -1], &[4, 4]);
        assert_eq!(
            plan_redistribution(&partial, &whole).unwrap(),
            vec![RedistOp::AllReduce {
                op: PartialOp::Sum,
                mesh_axes: vec![1]
            }]
        );
        let scattered = layout(&mesh, &[1, 0], &[4, 4]);
        assert_eq!(
            plan_redistribution(&partial, &scattered).unwrap(),
            vec![RedistOp::ReduceScatter { dim: 1, mesh_axis: 1 }]
        );
        let mean = layout(&mesh, &[1, -1], &[4, 4]).with_partial(PartialOp::Mean, vec![0]);
        assert!(matches!(
            plan_redistribution(&mean, &scattered).unwrap()[..],
            [RedistOp::AllReduce { op: PartialOp::Mean, .. }, RedistOp::Split { dim: 1, mesh_axis: 1 }]
        ));
    }

    #[test]
    fn test_moving_an_axis_uses_all_to_all() {
        let mesh = DeviceMesh::line(2).unwrap();
        let rows = layout(&mesh, &[0, -1], &[4, 6]);
        let cols = layout(&mesh, &[-1, 0], &[4, 6]);
        let plan = plan_redistribution(&rows, &cols).unwrap();
        assert_eq!(
            plan,
            vec![RedistOp::AllToAll {
                split_dim: 1,
                concat_dim: 0,
                mesh_axis: 0
            }]
        );
        assert_eq!(plan[0].apply(&rows), cols);
    }

    #[test]
    fn test_free_then_move_axis() {
        let mesh = DeviceMesh::new(vec![2, 2]).unwrap();
        let from = layout(&mesh, &[1, 0], &[4, 4]);
        let to = layout(&mesh, &[0, -1], &[4, 4]);
        let plan = plan_redistribution(&from, &to).unwrap();
        assert_eq!(
            plan,
            vec![
                RedistOp::AllGather { dim: 0, mesh_axis: 0 },
                RedistOp::AllToAll {
                    split_dim: 0,
                    concat_dim: 1,
                    mesh_axis: 1
                },
            ]
        );
        let end = plan.iter().fold(from, |l, op| op.apply(&l));
        assert_eq!(end, to);
    }

    #[test]
    fn test_mismatched_shapes_are_rejected() {
        let mesh = DeviceMesh::line(2).unwrap();
        let a = layout(&mesh, &[-1], &[4]);
        let b = layout(&mesh, &[-1], &[6]);
        assert!(plan_redistribution(&a, &b).is_err());
        let partial = a.clone().with_partial(PartialOp::Sum, vec![0]);
        assert!(plan_redistribution(&a, &partial).is_err());
    }
}
