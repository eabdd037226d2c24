// Sharded execution on simulated ranks
//
// FLOW:
//   propagate → insert_redistribution → local_graph → one thread per rank
//
// Every rank runs the same local graph through the Interpreter with its own
// kernel registry. The registry carries collective kernels bound to the
// rank's communicator (one sub-group per mesh axis), and two overrides:
//
//   Split with a `mesh_axis` attr keeps the slice at the rank's coordinate
//   Gather with a `shard_mesh_axis` attr looks up only the rows the rank
//   holds, writing zeros elsewhere; an AllReduce(sum) follows it
//
// Values cross threads as HostTensor. Rank 0's outputs are returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use marten_core::{Backend, DType, Error, Result, Tensor};
use marten_cpu::{CpuBackend, CpuDevice};
use marten_ir::{infer_shapes, Graph, HostTensor, Interpreter, NodeId, NodeKind};
use marten_ops::{prim, AbstractTensor, Attrs, KernelFn, KernelRegistry, KernelTarget, OpSet};

use crate::comm::{Collective, LocalCommunicator, ReduceKind};
use crate::layout::{Strategy, TensorLayout};
use crate::mesh::DeviceMesh;
use crate::propagate::propagate;
use crate::redistribute::{insert_redistribution, LayoutTable};

pub const DEFAULT_COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(30);

const COLLECTIVE_DTYPES: &[DType] = &[DType::F32, DType::F64, DType::I64];

/// A graph rewritten for a mesh, with the layout of every node.
#[derive(Debug, Clone)]
pub struct ShardedProgram {
    pub graph: Graph,
    pub layouts: LayoutTable,
    pub mesh: DeviceMesh,
}

impl ShardedProgram {
    pub fn shard(graph: &Graph, strategies: &HashMap<NodeId, Strategy>, mesh: &DeviceMesh) -> Result<Self> {
        let decided = propagate(graph, strategies, mesh)?;
        let mut graph = graph.clone();
        let layouts = insert_redistribution(&mut graph, &decided)?;
        tracing::info!(
            graph = %graph.name,
            mesh = %mesh,
            nodes = graph.len(),
            "graph sharded"
        );
        Ok(Self {
            graph,
            layouts,
            mesh: mesh.clone(),
        })
    }

    /// The per-rank graph: parameters declared at their slice shapes,
    /// reshape targets rewritten to slice shapes, everything re-inferred.
    pub fn local_graph(&self) -> Result<Graph> {
        let mut local = self.graph.clone();
        for id in local.topo_order()? {
            let layout = self
                .layouts
                .get(&id)
                .ok_or_else(|| Error::msg(format!("{id} has no layout")))?;
            let slice = layout.slice_shape()?;
            let node = local.node_mut(id)?;
            match &mut node.kind {
                NodeKind::Parameter(_) => {
                    let dtype = node
                        .abstract_value
                        .as_ref()
                        .map(|a| a.dtype)
                        .ok_or_else(|| Error::msg(format!("parameter {id} has no declared shape")))?;
                    node.abstract_value = Some(AbstractTensor::new(slice, dtype));
                }
                NodeKind::Apply { prim: name, attrs, .. } => {
                    if name.as_str() == prim::RESHAPE {
                        let shape: Vec<i64> = slice.iter().map(|&d| d as i64).collect();
                        attrs.set("shape", shape);
                    }
                    node.abstract_value = None;
                }
                _ => {}
            }
        }
        infer_shapes(&mut local, &OpSet::builtin())?;
        for id in local.topo_order()? {
            let expected = self.layouts[&id].slice_shape()?;
            let got = local.abstract_of(id)?.dims();
            if got != expected.as_slice() {
                return Err(Error::strategy(format!(
                    "{id} holds a slice of {got:?} per rank, its layout {} needs {expected:?}",
                    self.layouts[&id]
                )));
            }
        }
        Ok(local)
    }

    /// Parameter name to its layout.
    fn parameter_layouts(&self) -> Result<Vec<(String, &TensorLayout)>> {
        let mut out = Vec::new();
        for node in self.graph.nodes() {
            if let NodeKind::Parameter(name) = &node.kind {
                let layout = self
                    .layouts
                    .get(&node.id)
                    .ok_or_else(|| Error::msg(format!("parameter '{name}' has no layout")))?;
                out.push((name.clone(), layout));
            }
        }
        Ok(out)
    }
}

fn host_data<B: Backend>(t: &Tensor<B>) -> Result<Vec<f64>> {
    t.to_f64_vec()
}

fn rebuild<B: Backend>(data: &[f64], dims: Vec<usize>, like: &Tensor<B>) -> Result<Tensor<B>> {
    Tensor::from_f64_slice(data, dims, like.dtype(), like.device())
}

fn single<'a, B: Backend>(inputs: &'a [Tensor<B>], op: &str) -> Result<&'a Tensor<B>> {
    match inputs {
        [x] => Ok(x),
        _ => Err(Error::msg(format!("{op} takes one input, got {}", inputs.len()))),
    }
}

fn usize_attr(attrs: &Attrs, key: &str) -> Result<usize> {
    let v = attrs.int(key)?;
    usize::try_from(v).map_err(|_| Error::msg(format!("attribute '{key}' must be non-negative, got {v}")))
}

fn axis_attr(attrs: &Attrs, key: &str, rank: usize) -> Result<usize> {
    marten_core::shape::normalize_axis(attrs.int_or(key, 0)? as isize, rank.max(1))
}

/// Communicators of one rank: the world plus one group per mesh axis.
struct RankComms {
    world: LocalCommunicator,
    axes: Vec<LocalCommunicator>,
    coord: Vec<usize>,
}

impl RankComms {
    fn new(mesh: &DeviceMesh, world: &LocalCommunicator) -> Result<Self> {
        let rank = world.rank();
        let coord = mesh.rank_to_coord(rank)?;
        let axes = (0..mesh.rank())
            .map(|a| {
                let ranks = mesh.group_along(rank, a)?;
                world.sub_group(&format!("mesh_axis_{a}"), &ranks)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            world: world.clone(),
            axes,
            coord,
        })
    }

    fn group(&self, attrs: &Attrs) -> Result<&LocalCommunicator> {
        if !attrs.contains("mesh_axis") {
            return Ok(&self.world);
        }
        let axis = usize_attr(attrs, "mesh_axis")?;
        self.axes
            .get(axis)
            .ok_or_else(|| Error::msg(format!("mesh axis {axis} out of range for {} axes", self.axes.len())))
    }

    fn all_reduce(&self, data: &mut [f64], attrs: &Attrs) -> Result<()> {
        let op = attrs.str_or("op", "sum".to_string())?;
        let (kind, mean) = match op.as_str() {
            "mean" => (ReduceKind::Sum, true),
            other => (other.parse::<ReduceKind>()?, false),
        };
        let groups: Vec<&LocalCommunicator> = if attrs.contains("mesh_axes") {
            attrs
                .usizes("mesh_axes")?
                .into_iter()
                .map(|a| {
                    self.axes
                        .get(a)
                        .ok_or_else(|| Error::msg(format!("mesh axis {a} out of range")))
                })
                .collect::<Result<_>>()?
        } else {
            vec![&self.world]
        };
        let mut members = 1;
        for g in groups {
            g.all_reduce(data, kind)?;
            members *= g.world_size();
        }
        if mean {
            data.iter_mut().for_each(|v| *v /= members as f64);
        }
        Ok(())
    }
}

fn register_all<B, F>(registry: &mut KernelRegistry<B>, op: &str, f: F)
where
    B: Backend,
    F: Fn(&[Tensor<B>], &Attrs) -> Result<Vec<Tensor<B>>> + Send + Sync + 'static,
{
    registry.register_fn(op, KernelTarget::Native, COLLECTIVE_DTYPES, f);
}

/// Bind collective kernels and the per-rank Split and Gather overrides to
/// `world`, the communicator of this rank.
pub fn register_collectives<B: Backend>(
    registry: &mut KernelRegistry<B>,
    mesh: &DeviceMesh,
    world: &LocalCommunicator,
) -> Result<()> {
    if world.world_size() != mesh.device_num() {
        return Err(Error::strategy(format!(
            "{mesh} needs {} ranks, the communicator has {}",
            mesh.device_num(),
            world.world_size()
        )));
    }
    let comms = Arc::new(RankComms::new(mesh, world)?);

    let c = Arc::clone(&comms);
    register_all(registry, prim::ALL_REDUCE, move |inputs: &[Tensor<B>], attrs: &Attrs| {
        let x = single(inputs, prim::ALL_REDUCE)?;
        let mut data = host_data(x)?;
        c.all_reduce(&mut data, attrs)?;
        Ok(vec![rebuild(&data, x.dims().to_vec(), x)?])
    });

    let c = Arc::clone(&comms);
    register_all(registry, prim::ALL_GATHER, move |inputs: &[Tensor<B>], attrs: &Attrs| {
        let x = single(inputs, prim::ALL_GATHER)?;
        let axis = axis_attr(attrs, "axis", x.rank())?;
        let gathered = c.group(attrs)?.all_gather(&host_data(x)?)?;
        let piece = x.elem_count();
        let parts = gathered
            .chunks(piece.max(1))
            .map(|chunk| rebuild(chunk, x.dims().to_vec(), x))
            .collect::<Result<Vec<_>>>()?;
        Ok(vec![Tensor::cat(&parts, axis)?])
    });

    let c = Arc::clone(&comms);
    register_all(registry, prim::REDUCE_SCATTER, move |inputs: &[Tensor<B>], attrs: &Attrs| {
        let x = single(inputs, prim::REDUCE_SCATTER)?;
        let axis = axis_attr(attrs, "axis", x.rank())?;
        let group = c.group(attrs)?;
        let n = group.world_size();
        if x.dims()[axis] % n != 0 {
            return Err(Error::strategy(format!(
                "reduce_scatter: dim {axis} of {:?} does not divide over {n} ranks",
                x.dims()
            )));
        }
        let size = x.dims()[axis] / n;
        let mut flat = Vec::with_capacity(x.elem_count());
        for j in 0..n {
            flat.extend(host_data(&x.narrow(axis, j * size, size)?)?);
        }
        let kind: ReduceKind = attrs.str_or("op", "sum".to_string())?.parse()?;
        let mine = group.reduce_scatter(&flat, kind)?;
        let mut dims = x.dims().to_vec();
        dims[axis] = size;
        Ok(vec![rebuild(&mine, dims, x)?])
    });

    let c = Arc::clone(&comms);
    register_all(registry, prim::BROADCAST, move |inputs: &[Tensor<B>], attrs: &Attrs| {
        let x = single(inputs, prim::BROADCAST)?;
        let root = usize_attr(attrs, "root")?;
        let mut data = host_data(x)?;
        c.group(attrs)?.broadcast(&mut data, root)?;
        Ok(vec![rebuild(&data, x.dims().to_vec(), x)?])
    });

    let c = Arc::clone(&comms);
    register_all(registry, prim::ALL_TO_ALL, move |inputs: &[Tensor<B>], attrs: &Attrs| {
        let x = single(inputs, prim::ALL_TO_ALL)?;
        let split_axis = axis_attr(attrs, "split_axis", x.rank())?;
        let concat_axis = axis_attr(attrs, "concat_axis", x.rank())?;
        let group = c.group(attrs)?;
        let n = group.world_size();
        if x.dims()[split_axis] % n != 0 {
            return Err(Error::strategy(format!(
                "all_to_all: dim {split_axis} of {:?} does not divide over {n} ranks",
                x.dims()
            )));
        }
        let size = x.dims()[split_axis] / n;
        let chunks = (0..n)
            .map(|j| host_data(&x.narrow(split_axis, j * size, size)?))
            .collect::<Result<Vec<_>>>()?;
        let mut piece_dims = x.dims().to_vec();
        piece_dims[split_axis] = size;
        let parts = group
            .all_to_all(chunks)?
            .iter()
            .map(|chunk| rebuild(chunk, piece_dims.clone(), x))
            .collect::<Result<Vec<_>>>()?;
        Ok(vec![Tensor::cat(&parts, concat_axis)?])
    });

    for &dtype in COLLECTIVE_DTYPES {
        let Some(base) = registry.get(prim::SPLIT, KernelTarget::Native, dtype).cloned() else {
            continue;
        };
        let c = Arc::clone(&comms);
        let kernel: KernelFn<B> = Arc::new(move |inputs: &[Tensor<B>], attrs: &Attrs| {
            if !attrs.contains("mesh_axis") {
                return base(inputs, attrs);
            }
            let axis = usize_attr(attrs, "mesh_axis")?;
            let index = *c
                .coord
                .get(axis)
                .ok_or_else(|| Error::msg(format!("mesh axis {axis} out of range")))?;
            let attrs = attrs.clone().with("index", index as i64);
            base(inputs, &attrs)
        });
        registry.register(prim::SPLIT, KernelTarget::Native, dtype, kernel);
    }

    for &dtype in COLLECTIVE_DTYPES {
        let Some(base) = registry.get(prim::GATHER, KernelTarget::Native, dtype).cloned() else {
            continue;
        };
        let c = Arc::clone(&comms);
        let kernel: KernelFn<B> = Arc::new(move |inputs: &[Tensor<B>], attrs: &Attrs| {
            if !attrs.contains("shard_mesh_axis") {
                return base(inputs, attrs);
            }
            let axis = usize_attr(attrs, "shard_mesh_axis")?;
            let coord = *c
                .coord
                .get(axis)
                .ok_or_else(|| Error::msg(format!("mesh axis {axis} out of range")))?;
            Ok(vec![masked_gather(inputs, attrs, coord)?])
        });
        registry.register(prim::GATHER, KernelTarget::Native, dtype, kernel);
    }
    tracing::debug!(rank = world.rank(), mesh = %mesh, "collective kernels registered");
    Ok(())
}

/// Gather from a table that holds rows `[coord * rows, (coord + 1) * rows)`
/// of the full table; indices outside that range produce zeros.
fn masked_gather<B: Backend>(inputs: &[Tensor<B>], attrs: &Attrs, coord: usize) -> Result<Tensor<B>> {
    let (params, indices) = match inputs {
        [p, i] => (p, i),
        _ => return Err(Error::msg(format!("Gather takes two inputs, got {}", inputs.len()))),
    };
    let axis = axis_attr(attrs, "axis", params.rank())?;
    let dims = params.dims();
    let rows = dims[axis];
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();
    let offset = coord * rows;
    let table = host_data(params)?;
    let index = host_data(indices)?;

    let mut data = Vec::with_capacity(outer * index.len() * inner);
    for o in 0..outer {
        for &v in &index {
            let row = v as i64 - offset as i64;
            if row >= 0 && (row as usize) < rows {
                let start = (o * rows + row as usize) * inner;
                data.extend_from_slice(&table[start..start + inner]);
            } else {
                data.resize(data.len() + inner, 0.0);
            }
        }
    }
    let mut out_dims = dims[..axis].to_vec();
    out_dims.extend_from_slice(indices.dims());
    out_dims.extend_from_slice(&dims[axis + 1..]);
    rebuild(&data, out_dims, params)
}

/// Cut the slice of `full` that the rank at `coord` holds under `layout`.
fn local_slice(
    full: &Tensor<CpuBackend>,
    layout: &TensorLayout,
    coord: &[usize],
) -> Result<Tensor<CpuBackend>> {
    let offsets = layout.slice_offsets(coord)?;
    let slice = layout.slice_shape()?;
    let mut t = full.clone();
    for (d, (&start, &len)) in offsets.iter().zip(&slice).enumerate() {
        if len != full.dims()[d] {
            t = t.narrow(d, start, len)?;
        }
    }
    t.contiguous()
}

fn run_rank(
    program: &ShardedProgram,
    local: &Graph,
    world: &LocalCommunicator,
    inputs: &HashMap<String, HostTensor>,
) -> Result<Vec<HostTensor>> {
    let rank = world.rank();
    let span = tracing::debug_span!("rank", rank);
    let _guard = span.enter();
    let coord = program.mesh.rank_to_coord(rank)?;

    let mut registry = KernelRegistry::<CpuBackend>::with_defaults();
    register_collectives(&mut registry, &program.mesh, world)?;

    let mut params = HashMap::new();
    for (name, layout) in program.parameter_layouts()? {
        let full = inputs
            .get(&name)
            .ok_or_else(|| Error::msg(format!("no value bound for parameter '{name}'")))?
            .to_tensor::<CpuBackend>(&CpuDevice)?;
        params.insert(name, local_slice(&full, layout, &coord)?);
    }
    let outputs = Interpreter::new(registry, CpuDevice).run(local, &params)?;
    outputs.iter().map(HostTensor::from_tensor).collect()
}

/// Run `graph` sharded over `mesh`, one thread per rank, and return the
/// replicated outputs.
pub fn execute_sharded(
    graph: &Graph,
    strategies: &HashMap<NodeId, Strategy>,
    mesh: &DeviceMesh,
    inputs: &HashMap<String, Tensor<CpuBackend>>,
) -> Result<Vec<Tensor<CpuBackend>>> {
    execute_sharded_with_timeout(graph, strategies, mesh, inputs, DEFAULT_COLLECTIVE_TIMEOUT)
}

pub fn execute_sharded_with_timeout(
    graph: &Graph,
    strategies: &HashMap<NodeId, Strategy>,
    mesh: &DeviceMesh,
    inputs: &HashMap<String, Tensor<CpuBackend>>,
    timeout: Duration,
) -> Result<Vec<Tensor<CpuBackend>>> {
    let program = ShardedProgram::shard(graph, strategies, mesh)?;
    let local = program.local_graph()?;
    let host: HashMap<String, HostTensor> = inputs
        .iter()
        .map(|(name, t)| -> Result<(String, HostTensor)> { Ok((name.clone(), HostTensor::from_tensor(t)?)) })
        .collect::<Result<_>>()?;
    let world = LocalCommunicator::create_world(mesh.device_num(), timeout)?;

    // the communicators outlive every rank thread, so a failing rank leaves
    // its peers waiting on a timeout rather than a closed channel
    let results: Vec<Result<Vec<HostTensor>>> = thread::scope(|s| {
        let handles: Vec<_> = world
            .iter()
            .map(|comm| {
                let (program, local, host) = (&program, &local, &host);
                s.spawn(move || run_rank(program, local, comm, host))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join()
                    .unwrap_or_else(|_| Err(Error::msg(format!("rank {rank} panicked"))))
            })
            .collect()
    });

    let mut first_timeout = None;
    let mut outputs = None;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(out) if rank == 0 => outputs = Some(out),
            Ok(_) => {}
            Err(e @ Error::CollectiveTimeout { .. }) => {
                tracing::warn!(rank, error = %e, "rank timed out");
                first_timeout.get_or_insert(e);
            }
            Err(e) => {
                tracing::error!(rank, error = %e, "rank failed");
                return Err(e);
            }
        }
    }
    if let Some(e) = first_timeout {
        return Err(e);
    }
    outputs
        .ok_or_else(|| Error::msg("rank 0 produced no outputs"))?
        .iter()
        .map(|t| t.to_tensor::<CpuBackend>(&CpuDevice))
        .collect()
}
