use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// Shape — dimension sizes of a tensor
//
// A rank-0 shape is a scalar and holds one element. Operators in the graph IR
// accept negative axes (-1 is the last dimension); `normalize_dim` turns them
// into positions before anything indexes into `dims()`.

/// N-dimensional shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Product of the dimensions; a scalar holds one element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides: `[2, 3, 4]` gives `[12, 4, 1]`.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        let mut acc = 1usize;
        for (i, &d) in self.0.iter().enumerate().rev() {
            strides[i] = acc;
            acc *= d;
        }
        strides
    }

    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d as isize,
            rank: self.rank(),
        })
    }

    /// Resolve a possibly negative axis against this shape's rank.
    pub fn normalize_dim(&self, dim: isize) -> Result<usize> {
        normalize_axis(dim, self.rank())
    }

    /// The shape left after reducing `dims` (all dims when empty).
    pub fn reduced(&self, dims: &[usize], keep_dim: bool) -> Shape {
        let all = dims.is_empty();
        let mut out = Vec::with_capacity(self.rank());
        for (i, &d) in self.0.iter().enumerate() {
            if all || dims.contains(&i) {
                if keep_dim {
                    out.push(1);
                }
            } else {
                out.push(d);
            }
        }
        Shape(out)
    }

    // Broadcasting

    /// NumPy-style broadcast of two shapes, aligned from the right.
    ///
    /// `[5, 3, 1]` with `[3, 4]` gives `[5, 3, 4]`; `[3]` with `[4]` fails.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let rank = l.len().max(r.len());
        let mut out = vec![0usize; rank];
        for i in 0..rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };
            out[rank - 1 - i] = match (ld, rd) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => {
                    return Err(Error::msg(format!(
                        "shapes {} and {} are not broadcast-compatible (dim {} from right: {} vs {})",
                        lhs, rhs, i, ld, rd
                    )))
                }
            };
        }
        Ok(Shape(out))
    }

    /// Strides that read this (contiguous) shape as if it had `target`'s shape.
    /// Broadcast dimensions get stride 0.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let own = self.stride_contiguous();
        let offset = target.rank() - self.rank();
        let mut strides = vec![0usize; target.rank()];
        for (i, &d) in self.0.iter().enumerate() {
            if d == target.dims()[i + offset] {
                strides[i + offset] = own[i];
            }
        }
        strides
    }

    /// The dims of `self` that must be summed to go from `target` back to `self`.
    ///
    /// Used to undo broadcasting in gradients: returns the leading dims that
    /// `self` lacks, plus every dim where `self` is 1 and `target` is not.
    pub fn broadcast_reduce_dims(&self, target: &Shape) -> Vec<usize> {
        let offset = target.rank().saturating_sub(self.rank());
        let mut dims: Vec<usize> = (0..offset).collect();
        for (i, &d) in self.0.iter().enumerate() {
            if d == 1 && target.dims()[i + offset] != 1 {
                dims.push(i + offset);
            }
        }
        dims
    }
}

/// Resolve `dim` in `[-rank, rank)` to a position.
pub fn normalize_axis(dim: isize, rank: usize) -> Result<usize> {
    let r = rank as isize;
    let d = if dim < 0 { dim + r } else { dim };
    // A scalar accepts axis 0 so that reductions over it are well defined.
    if d < 0 || d >= r.max(1) {
        return Err(Error::DimOutOfRange { dim, rank });
    }
    Ok(d as usize)
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert!(s.stride_contiguous().is_empty());
    }

    #[test]
    fn test_strides() {
        assert_eq!(Shape::from((2, 3, 4)).stride_contiguous(), vec![12, 4, 1]);
        assert_eq!(Shape::from([5]).stride_contiguous(), vec![1]);
    }

    #[test]
    fn test_zero_sized_dim() {
        assert_eq!(Shape::from((3, 0)).elem_count(), 0);
    }

    #[test]
    fn test_broadcast() {
        let a = Shape::from((5, 3, 1));
        let b = Shape::from((3, 4));
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap().dims(), &[5, 3, 4]);
        assert!(Shape::broadcast_shape(&Shape::from(3), &Shape::from(4)).is_err());
    }

    #[test]
    fn test_broadcast_strides_and_reduce_dims() {
        let bias = Shape::from((1, 4));
        let target = Shape::from((2, 3, 4));
        assert_eq!(bias.broadcast_strides(&target), vec![0, 0, 1]);
        assert_eq!(bias.broadcast_reduce_dims(&target), vec![0, 1]);
        assert!(target.broadcast_reduce_dims(&target).is_empty());
    }

    #[test]
    fn test_normalize_dim() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.normalize_dim(-1).unwrap(), 2);
        assert_eq!(s.normalize_dim(0).unwrap(), 0);
        assert!(s.normalize_dim(3).is_err());
        assert!(s.normalize_dim(-4).is_err());
    }

    #[test]
    fn test_reduced() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.reduced(&[1], false).dims(), &[2, 4]);
        assert_eq!(s.reduced(&[1], true).dims(), &[2, 1, 4]);
        assert!(s.reduced(&[], false).is_scalar());
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::from((3, 4)).to_string(), "[3, 4]");
    }
}
