// Graph — the functional graph IR
//
// A Graph is a DAG of nodes keyed by NodeId. Ids are dense and handed out in
// increasing order, so a freshly built graph is already topologically
// ordered; rewrites may break that, which is why every consumer walks
// `topo_order()` instead of the id order.
//
//   %0 = Parameter(x) : f32[2, 3]
//   %1 = Parameter(w) : f32[4, 3]
//   %2 = MatMul(%0, %1) {transpose_a=false, transpose_b=true} : f32[2, 4]
//   return %2
//
// NODE KINDS:
//
//   Parameter — a named graph input, bound at run time
//   Constant  — a HostTensor baked into the graph
//   Apply     — a primitive applied to other nodes
//   Builtin   — a host builtin call (`len`, `max`, ...) awaiting fallback
//
// Abstract values (shape + dtype) are filled in by `infer_shapes`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use marten_core::{Backend, DType, Error, Result, Shape, Tensor};
use marten_ops::{AbstractTensor, Attrs, OpSet};

use crate::fallback::HostValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// A dense, backend-independent tensor value.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub data: Vec<f64>,
    pub shape: Shape,
    pub dtype: DType,
}

impl HostTensor {
    pub fn new(data: Vec<f64>, shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self { data, shape, dtype })
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self {
            data: vec![value],
            shape: Shape::scalar(),
            dtype,
        }
    }

    pub fn from_tensor<B: Backend>(t: &Tensor<B>) -> Result<Self> {
        Ok(Self {
            data: t.to_f64_vec()?,
            shape: t.shape().clone(),
            dtype: t.dtype(),
        })
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B>> {
        Tensor::from_f64_slice(&self.data, self.shape.clone(), self.dtype, device)
    }

    pub fn abstract_value(&self) -> AbstractTensor {
        AbstractTensor::new(self.shape.clone(), self.dtype)
    }

    pub fn is_scalar(&self) -> bool {
        self.data.len() == 1
    }

    /// Whether every element equals `v`.
    pub fn is_all(&self, v: f64) -> bool {
        !self.data.is_empty() && self.data.iter().all(|&x| x == v)
    }

    /// Bit-exact identity used to merge equal constants.
    pub(crate) fn value_key(&self) -> (DType, Vec<usize>, Vec<u64>) {
        (
            self.dtype,
            self.shape.dims().to_vec(),
            self.data.iter().map(|v| v.to_bits()).collect(),
        )
    }
}

impl fmt::Display for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 8;
        write!(f, "{}{} [", self.dtype, self.shape)?;
        for (i, v) in self.data.iter().take(SHOWN).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        if self.data.len() > SHOWN {
            write!(f, ", ...")?;
        }
        write!(f, "]")
    }
}

/// Argument of a builtin call: another node, or a literal host value.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinArg {
    Node(NodeId),
    Value(HostValue),
}

impl fmt::Display for BuiltinArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinArg::Node(id) => write!(f, "{id}"),
            BuiltinArg::Value(v) => write!(f, "{}", v.repr()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Parameter(String),
    Constant(HostTensor),
    Apply {
        prim: String,
        attrs: Attrs,
        inputs: Vec<NodeId>,
    },
    Builtin {
        func: String,
        args: Vec<BuiltinArg>,
    },
}

impl NodeKind {
    /// Nodes this node reads, in argument order.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Apply { inputs, .. } => inputs.clone(),
            NodeKind::Builtin { args, .. } => args
                .iter()
                .filter_map(|a| match a {
                    BuiltinArg::Node(id) => Some(*id),
                    BuiltinArg::Value(_) => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn prim(&self) -> Option<&str> {
        match self {
            NodeKind::Apply { prim, .. } => Some(prim),
            _ => None,
        }
    }

    pub fn is_apply_of(&self, name: &str) -> bool {
        self.prim() == Some(name)
    }

    pub fn as_constant(&self) -> Option<&HostTensor> {
        match self {
            NodeKind::Constant(t) => Some(t),
            _ => None,
        }
    }

    fn replace_input(&mut self, old: NodeId, new: NodeId) -> usize {
        let mut n = 0;
        match self {
            NodeKind::Apply { inputs, .. } => {
                for i in inputs.iter_mut().filter(|i| **i == old) {
                    *i = new;
                    n += 1;
                }
            }
            NodeKind::Builtin { args, .. } => {
                for a in args.iter_mut() {
                    if *a == BuiltinArg::Node(old) {
                        *a = BuiltinArg::Node(new);
                        n += 1;
                    }
                }
            }
            _ => {}
        }
        n
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub abstract_value: Option<AbstractTensor>,
    pub name: Option<String>,
}

/// A function graph with ordered parameters and outputs.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    nodes: BTreeMap<NodeId, Node>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    next_id: usize,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let abstract_value = kind.as_constant().map(HostTensor::abstract_value);
        self.nodes.insert(
            id,
            Node {
                id,
                kind,
                abstract_value,
                name: None,
            },
        );
        id
    }

    /// A graph input; its abstract value is fixed at declaration.
    pub fn add_parameter(&mut self, name: &str, value: AbstractTensor) -> NodeId {
        let id = self.add_node(NodeKind::Parameter(name.to_string()));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.abstract_value = Some(value);
            node.name = Some(name.to_string());
        }
        self.inputs.push(id);
        id
    }

    pub fn add_constant(&mut self, value: HostTensor) -> NodeId {
        self.add_node(NodeKind::Constant(value))
    }

    pub fn add_apply(&mut self, prim: &str, attrs: Attrs, inputs: &[NodeId]) -> NodeId {
        self.add_node(NodeKind::Apply {
            prim: prim.to_string(),
            attrs,
            inputs: inputs.to_vec(),
        })
    }

    pub fn add_builtin(&mut self, func: &str, args: Vec<BuiltinArg>) -> NodeId {
        self.add_node(NodeKind::Builtin {
            func: func.to_string(),
            args,
        })
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::msg(format!("graph '{}' has no node {id}", self.name)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        let name = &self.name;
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| Error::msg(format!("graph '{name}' has no node {id}")))
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn parameter(&self, name: &str) -> Option<NodeId> {
        self.inputs.iter().copied().find(|id| {
            matches!(self.nodes.get(id), Some(Node { kind: NodeKind::Parameter(n), .. }) if n == name)
        })
    }

    /// The inferred shape and dtype of a node.
    pub fn abstract_of(&self, id: NodeId) -> Result<&AbstractTensor> {
        self.node(id)?
            .abstract_value
            .as_ref()
            .ok_or_else(|| Error::msg(format!("node {id} has no inferred shape")))
    }

    /// Remove a node; parameters also leave the input list.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        self.inputs.retain(|&i| i != id);
        self.nodes.remove(&id)
    }

    /// Nodes reading `id`, in id order.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.kind.inputs().contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Number of reads of each node, graph outputs included.
    pub fn use_counts(&self) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for node in self.nodes.values() {
            for i in node.kind.inputs() {
                *counts.entry(i).or_insert(0) += 1;
            }
        }
        for &o in &self.outputs {
            *counts.entry(o).or_insert(0) += 1;
        }
        counts
    }

    /// Redirect every read of `old` (outputs included) to `new`. The node
    /// `new` itself keeps reading `old`, so `old` can be wrapped in place.
    pub fn replace_all_uses(&mut self, old: NodeId, new: NodeId) -> usize {
        let mut n = 0;
        for node in self.nodes.values_mut() {
            if node.id != new {
                n += node.kind.replace_input(old, new);
            }
        }
        for o in self.outputs.iter_mut().filter(|o| **o == old) {
            *o = new;
            n += 1;
        }
        n
    }

    /// Kahn's algorithm, always taking the smallest ready id.
    pub fn topo_order(&self) -> Result<Vec<NodeId>> {
        let mut pending: HashMap<NodeId, usize> = HashMap::new();
        let mut users: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in self.nodes.values() {
            let inputs = node.kind.inputs();
            pending.insert(node.id, inputs.len());
            for i in inputs {
                users.entry(i).or_default().push(node.id);
            }
        }
        let mut ready: BTreeSet<NodeId> = pending
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for u in users.get(&id).into_iter().flatten() {
                if let Some(n) = pending.get_mut(u) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*u);
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(Error::msg(format!("graph '{}' contains a cycle", self.name)));
        }
        Ok(order)
    }

    /// All inputs and outputs exist and the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            for i in node.kind.inputs() {
                if !self.nodes.contains_key(&i) {
                    return Err(Error::msg(format!(
                        "node {} reads missing node {i}",
                        node.id
                    )));
                }
            }
        }
        for &o in self.outputs.iter().chain(&self.inputs) {
            if !self.nodes.contains_key(&o) {
                return Err(Error::msg(format!("graph '{}' references missing node {o}", self.name)));
            }
        }
        self.topo_order().map(|_| ())
    }

    /// Fill in the abstract value of every Apply node.
    pub fn infer_shapes(&mut self, ops: &OpSet) -> Result<()> {
        infer_shapes(self, ops)
    }
}

/// Run each Apply node's inference rule in topological order.
///
/// Builtin nodes keep no abstract value, so an Apply reading one fails;
/// run the fallback pass first.
pub fn infer_shapes(graph: &mut Graph, ops: &OpSet) -> Result<()> {
    for id in graph.topo_order()? {
        let node = graph.node(id)?;
        let inferred = match &node.kind {
            NodeKind::Parameter(name) => {
                if node.abstract_value.is_none() {
                    return Err(Error::msg(format!("parameter '{name}' has no declared shape")));
                }
                continue;
            }
            NodeKind::Constant(t) => Some(t.abstract_value()),
            NodeKind::Builtin { .. } => None,
            NodeKind::Apply { prim, attrs, inputs } => {
                let args = inputs
                    .iter()
                    .map(|&i| graph.abstract_of(i).cloned())
                    .collect::<Result<Vec<_>>>()?;
                let out = ops
                    .infer(prim, &args, attrs)
                    .map_err(|e| Error::msg(format!("inferring {id} = {prim}: {e}")))?;
                Some(out)
            }
        };
        graph.node_mut(id)?.abstract_value = inferred;
    }
    Ok(())
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {}", self.name)?;
        let order = self.topo_order().unwrap_or_else(|_| self.node_ids());
        for id in order {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            write!(f, "{id} = ")?;
            match &node.kind {
                NodeKind::Parameter(name) => write!(f, "Parameter({name})")?,
                NodeKind::Constant(t) => write!(f, "Constant({t})")?,
                NodeKind::Apply { prim, attrs, inputs } => {
                    write!(f, "{prim}(")?;
                    for (i, input) in inputs.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{input}")?;
                    }
                    write!(f, ")")?;
                    if !attrs.is_empty() {
                        write!(f, " {attrs}")?;
                    }
                }
                NodeKind::Builtin { func, args } => {
                    write!(f, "Builtin {func}(")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    write!(f, ")")?;
                }
            }
            if let Some(abs) = &node.abstract_value {
                write!(f, " : {abs}")?;
            }
            writeln!(f)?;
        }
        write!(f, "return")?;
        for (i, o) in self.outputs.iter().enumerate() {
            write!(f, "{}{o}", if i == 0 { " " } else { ", " })?;
        }
        writeln!(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_ops::prim;

    fn f32_param(g: &mut Graph, name: &str, dims: &[usize]) -> NodeId {
        g.add_parameter(name, AbstractTensor::new(dims, DType::F32))
    }

    #[test]
    fn test_ids_are_dense() {
        let mut g = Graph::new("g");
        let a = f32_param(&mut g, "a", &[2]);
        let b = g.add_constant(HostTensor::scalar(1.0, DType::F32));
        let c = g.add_apply(prim::ADD, Attrs::new(), &[a, b]);
        assert_eq!((a, b, c), (NodeId(0), NodeId(1), NodeId(2)));
        assert_eq!(g.users(a), vec![c]);
    }

    #[test]
    fn test_topo_order_after_rewrite() {
        let mut g = Graph::new("g");
        let a = f32_param(&mut g, "a", &[2]);
        let n = g.add_apply(prim::NEG, Attrs::new(), &[a]);
        g.set_outputs(vec![n]);
        let e = g.add_apply(prim::EXP, Attrs::new(), &[a]);
        // Neg now reads the later Exp node.
        g.replace_all_uses(a, e);
        assert_eq!(g.topo_order().unwrap(), vec![a, e, n]);
        g.validate().unwrap();
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = Graph::new("g");
        let a = f32_param(&mut g, "a", &[2]);
        let x = g.add_apply(prim::NEG, Attrs::new(), &[a]);
        let y = g.add_apply(prim::NEG, Attrs::new(), &[x]);
        if let Ok(node) = g.node_mut(x) {
            node.kind = NodeKind::Apply {
                prim: prim::NEG.to_string(),
                attrs: Attrs::new(),
                inputs: vec![y],
            };
        }
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_infer_and_dump() {
        let mut g = Graph::new("dense");
        let x = f32_param(&mut g, "x", &[2, 3]);
        let w = f32_param(&mut g, "w", &[4, 3]);
        let attrs = Attrs::new().with("transpose_a", false).with("transpose_b", true);
        let y = g.add_apply(prim::MATMUL, attrs, &[x, w]);
        g.set_outputs(vec![y]);
        g.infer_shapes(&OpSet::builtin()).unwrap();
        let dump = g.to_string();
        assert!(dump.contains("%2 = MatMul(%0, %1) {transpose_a=false, transpose_b=true} : f32[2, 4]"));
        assert!(dump.ends_with("return %2\n"));
    }

    #[test]
    fn test_infer_reports_node() {
        let mut g = Graph::new("bad");
        let x = f32_param(&mut g, "x", &[2, 3]);
        let w = f32_param(&mut g, "w", &[2, 3]);
        g.add_apply(prim::MATMUL, Attrs::new(), &[x, w]);
        let err = g.infer_shapes(&OpSet::builtin()).unwrap_err();
        assert!(err.to_string().contains("MatMul"));
    }
}
