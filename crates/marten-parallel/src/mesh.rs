// DeviceMesh — the logical arrangement of ranks
//
// Ranks are laid out row-major over the mesh shape, so the last mesh axis
// varies fastest:
//
//   shape [2, 2]     rank 0 = (0, 0)   rank 1 = (0, 1)
//                    rank 2 = (1, 0)   rank 3 = (1, 1)
//
// Tensor maps name mesh axes counted from the right: map value 0 is the
// last mesh axis, map value `rank - 1` the first. `axis_for_map` and
// `map_for_axis` convert between the two numberings.

use std::fmt;

use marten_core::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceMesh {
    shape: Vec<usize>,
}

impl DeviceMesh {
    pub fn new(shape: Vec<usize>) -> Result<Self> {
        if shape.is_empty() {
            return Err(Error::strategy("device mesh needs at least one axis"));
        }
        if let Some(i) = shape.iter().position(|&d| d == 0) {
            return Err(Error::strategy(format!("device mesh axis {i} has size 0")));
        }
        Ok(Self { shape })
    }

    /// A one-axis mesh of `n` ranks.
    pub fn line(n: usize) -> Result<Self> {
        Self::new(vec![n])
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of mesh axes.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn device_num(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn axis_size(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    /// Mesh axis (from the left) named by a tensor-map value.
    pub fn axis_for_map(&self, map: i64) -> Result<usize> {
        if map < 0 || map as usize >= self.rank() {
            return Err(Error::strategy(format!(
                "tensor map value {map} out of range for a mesh of rank {}",
                self.rank()
            )));
        }
        Ok(self.rank() - 1 - map as usize)
    }

    pub fn map_for_axis(&self, axis: usize) -> i64 {
        (self.rank() - 1 - axis) as i64
    }

    pub fn rank_to_coord(&self, rank: usize) -> Result<Vec<usize>> {
        if rank >= self.device_num() {
            return Err(Error::strategy(format!(
                "rank {rank} out of range for {} devices",
                self.device_num()
            )));
        }
        let mut coord = vec![0; self.rank()];
        let mut rest = rank;
        for (c, &d) in coord.iter_mut().zip(&self.shape).rev() {
            *c = rest % d;
            rest /= d;
        }
        Ok(coord)
    }

    pub fn coord_to_rank(&self, coord: &[usize]) -> Result<usize> {
        if coord.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: coord.len(),
            });
        }
        let mut rank = 0;
        for (i, (&c, &d)) in coord.iter().zip(&self.shape).enumerate() {
            if c >= d {
                return Err(Error::strategy(format!(
                    "coordinate {c} out of range for mesh axis {i} of size {d}"
                )));
            }
            rank = rank * d + c;
        }
        Ok(rank)
    }

    /// The ranks that differ from `rank` only along `axis`, ordered by their
    /// coordinate on that axis.
    pub fn group_along(&self, rank: usize, axis: usize) -> Result<Vec<usize>> {
        if axis >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim: axis as isize,
                rank: self.rank(),
            });
        }
        let mut coord = self.rank_to_coord(rank)?;
        (0..self.shape[axis])
            .map(|c| {
                coord[axis] = c;
                self.coord_to_rank(&coord)
            })
            .collect()
    }
}

impl fmt::Display for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mesh{:?}", self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coords_round_trip_row_major() {
        let mesh = DeviceMesh::new(vec![2, 3]).unwrap();
        assert_eq!(mesh.device_num(), 6);
        assert_eq!(mesh.rank_to_coord(4).unwrap(), vec![1, 1]);
        assert_eq!(mesh.coord_to_rank(&[1, 2]).unwrap(), 5);
        for r in 0..6 {
            assert_eq!(mesh.coord_to_rank(&mesh.rank_to_coord(r).unwrap()).unwrap(), r);
        }
        assert!(mesh.rank_to_coord(6).is_err());
        assert!(mesh.coord_to_rank(&[0, 3]).is_err());
    }

    #[test]
    fn test_groups_and_map_numbering() {
        let mesh = DeviceMesh::new(vec![2, 2]).unwrap();
        assert_eq!(mesh.group_along(1, 0).unwrap(), vec![1, 3]);
        assert_eq!(mesh.group_along(2, 1).unwrap(), vec![2, 3]);
        assert_eq!(mesh.axis_for_map(0).unwrap(), 1);
        assert_eq!(mesh.map_for_axis(0), 1);
        assert!(mesh.axis_for_map(2).is_err());
        assert!(DeviceMesh::new(vec![]).is_err());
        assert!(DeviceMesh::new(vec![2, 0]).is_err());
    }
}
