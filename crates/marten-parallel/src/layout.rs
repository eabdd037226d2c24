// TensorLayout — how one tensor is spread over a device mesh
//
// A layout is the device arrangement (the mesh shape), the tensor map and
// the global tensor shape. `tensor_map[i]` names the mesh axis that splits
// tensor dim i, counted from the right of the device arrangement; -1 means
// the dim is whole on every rank.
//
//   dev [2, 4], map [1, -1], shape [8, 6]
//     dim 0 is split 2 ways by mesh axis 0, dim 1 is whole;
//     every rank holds a [4, 6] slice, replicated across mesh axis 1.
//
// A layout may also be partial: every rank holds a full-shaped slice that
// still has to be reduced across the listed mesh axes (a matmul whose
// contracting dim is split produces one).

use std::fmt;

use marten_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::mesh::DeviceMesh;

/// Split counts per tensor dim, one entry per operator input.
pub type Strategy = Vec<Vec<usize>>;

/// How a partial value combines across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartialOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl PartialOp {
    /// The `op` attribute of the AllReduce that resolves it.
    pub fn as_str(self) -> &'static str {
        match self {
            PartialOp::Sum => "sum",
            PartialOp::Mean => "mean",
            PartialOp::Max => "max",
            PartialOp::Min => "min",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partial {
    pub op: PartialOp,
    /// Mesh axes in tensor-map numbering.
    pub axes: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorLayout {
    pub device_arrangement: Vec<usize>,
    pub tensor_map: Vec<i64>,
    pub tensor_shape: Vec<usize>,
    pub partial: Option<Partial>,
}

impl TensorLayout {
    pub fn new(mesh: &DeviceMesh, tensor_map: Vec<i64>, tensor_shape: Vec<usize>) -> Result<Self> {
        if tensor_map.len() != tensor_shape.len() {
            return Err(Error::strategy(format!(
                "tensor map {tensor_map:?} does not match shape {tensor_shape:?}"
            )));
        }
        let mut seen = Vec::new();
        for &m in tensor_map.iter().filter(|&&m| m != -1) {
            mesh.axis_for_map(m)?;
            if seen.contains(&m) {
                return Err(Error::strategy(format!(
                    "mesh axis {m} splits more than one dim in tensor map {tensor_map:?}"
                )));
            }
            seen.push(m);
        }
        let layout = Self {
            device_arrangement: mesh.shape().to_vec(),
            tensor_map,
            tensor_shape,
            partial: None,
        };
        layout.slice_shape()?;
        Ok(layout)
    }

    pub fn replicated(mesh: &DeviceMesh, tensor_shape: Vec<usize>) -> Self {
        Self {
            device_arrangement: mesh.shape().to_vec(),
            tensor_map: vec![-1; tensor_shape.len()],
            tensor_shape,
            partial: None,
        }
    }

    /// Layout of a lone tensor from its split counts: each split takes the
    /// first unused mesh axis of that size, scanning from the left.
    pub fn from_splits(mesh: &DeviceMesh, splits: &[usize], tensor_shape: Vec<usize>) -> Result<Self> {
        if splits.len() != tensor_shape.len() {
            return Err(Error::strategy(format!(
                "strategy {splits:?} has {} entries for a tensor of rank {}",
                splits.len(),
                tensor_shape.len()
            )));
        }
        let mut used = vec![false; mesh.rank()];
        let map = splits
            .iter()
            .map(|&s| claim_axis(mesh, &mut used, s))
            .collect::<Result<Vec<_>>>()?;
        Self::new(mesh, map, tensor_shape)
    }

    pub fn with_partial(mut self, op: PartialOp, mut axes: Vec<i64>) -> Self {
        axes.sort_unstable();
        self.partial = if axes.is_empty() { None } else { Some(Partial { op, axes }) };
        self
    }

    pub fn without_partial(&self) -> Self {
        Self {
            partial: None,
            ..self.clone()
        }
    }

    pub fn rank(&self) -> usize {
        self.tensor_shape.len()
    }

    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Whole and complete on every rank.
    pub fn is_replicated(&self) -> bool {
        self.partial.is_none() && self.tensor_map.iter().all(|&m| m == -1)
    }

    fn mesh_size(&self, map: i64) -> usize {
        let n = self.device_arrangement.len();
        self.device_arrangement[n - 1 - map as usize]
    }

    /// Split count of each tensor dim.
    pub fn splits(&self) -> Vec<usize> {
        self.tensor_map
            .iter()
            .map(|&m| if m == -1 { 1 } else { self.mesh_size(m) })
            .collect()
    }

    /// Shape of the slice one rank holds.
    pub fn slice_shape(&self) -> Result<Vec<usize>> {
        self.tensor_shape
            .iter()
            .zip(self.splits())
            .enumerate()
            .map(|(dim, (&size, split))| {
                if size % split != 0 {
                    Err(Error::strategy(format!(
                        "dim {dim} of size {size} is not divisible by its split {split}"
                    )))
                } else {
                    Ok(size / split)
                }
            })
            .collect()
    }

    /// Start of the slice held by the rank at `coord`, per tensor dim.
    pub fn slice_offsets(&self, coord: &[usize]) -> Result<Vec<usize>> {
        let slice = self.slice_shape()?;
        let n = self.device_arrangement.len();
        if coord.len() != n {
            return Err(Error::RankMismatch {
                expected: n,
                got: coord.len(),
            });
        }
        Ok(self
            .tensor_map
            .iter()
            .zip(slice)
            .map(|(&m, len)| if m == -1 { 0 } else { coord[n - 1 - m as usize] * len })
            .collect())
    }

    /// The tensor dim split by mesh axis `map`, if any.
    pub fn dim_of(&self, map: i64) -> Option<usize> {
        self.tensor_map.iter().position(|&m| m == map)
    }
}

/// Pick the first unused mesh axis of size `split` and return its map value;
/// a split of 1 claims nothing.
pub(crate) fn claim_axis(mesh: &DeviceMesh, used: &mut [bool], split: usize) -> Result<i64> {
    if split == 1 {
        return Ok(-1);
    }
    let axis = (0..mesh.rank())
        .find(|&a| !used[a] && mesh.axis_size(a) == split)
        .ok_or_else(|| {
            Error::strategy(format!(
                "no free axis of size {split} left in device mesh {:?}",
                mesh.shape()
            ))
        })?;
    used[axis] = true;
    Ok(mesh.map_for_axis(axis))
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{dev={:?}, map={:?}, shape={:?}",
            self.device_arrangement, self.tensor_map, self.tensor_shape
        )?;
        if let Some(p) = &self.partial {
            write!(f, ", partial={}{:?}", p.op.as_str(), p.axes)?;
        }
        write!(f, "}}")
    }
}
