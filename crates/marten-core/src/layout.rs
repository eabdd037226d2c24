use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — how a logical shape maps onto flat storage
//
// shape + strides + offset. Transpose, permute, narrow and broadcast only
// rewrite the layout; the storage is shared. Kernels that need dense input
// walk the layout with `strided_indices()` or call `to_contiguous` first.
//
//   [2, 3] contiguous        strides [3, 1]  offset 0
//   transpose(0, 1)          strides [1, 3]  shape [3, 2]
//   narrow(1, 1, 2)          strides [3, 1]  offset 1
//   broadcast_as([4, 2, 3])  strides [0, 3, 1]

/// Shape, strides and offset of a tensor view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    pub fn contiguous(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major with no offset.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim: dim as isize,
                rank: self.rank(),
            });
        }
        Ok(())
    }

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        self.check_dim(dim0)?;
        self.check_dim(dim1)?;
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Reorder dimensions: output dim `i` is input dim `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Layout> {
        if perm.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: perm.len(),
            });
        }
        let mut seen = vec![false; perm.len()];
        for &p in perm {
            self.check_dim(p)?;
            if std::mem::replace(&mut seen[p], true) {
                return Err(Error::msg(format!("permute: duplicate dim {} in {:?}", p, perm)));
            }
        }
        let dims = perm.iter().map(|&p| self.dims()[p]).collect();
        let strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// View `len` entries of `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        self.check_dim(dim)?;
        let dim_size = self.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut dims = self.dims().to_vec();
        dims[dim] = len;
        Ok(Layout::new(
            Shape::new(dims),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// View this layout as `target` by giving broadcast dimensions stride 0.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        if target.rank() < self.rank() {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: self.shape.clone(),
            });
        }
        let offset = target.rank() - self.rank();
        let mut strides = vec![0usize; target.rank()];
        for (i, &d) in self.dims().iter().enumerate() {
            let t = target.dims()[i + offset];
            if d == t {
                strides[i + offset] = self.strides[i];
            } else if d != 1 {
                return Err(Error::ShapeMismatch {
                    expected: target.clone(),
                    got: self.shape.clone(),
                });
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// `offset + Σ index[i] * stride[i]`.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(&self.strides)
            .fold(self.offset, |acc, (&i, &s)| acc + i * s)
    }

    /// Storage indices of every element, in logical row-major order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Yields the storage index of each logical element of a [`Layout`].
pub struct StridedIter {
    index: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    next: usize,
    remaining: usize,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            index: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            next: layout.offset(),
            remaining: layout.elem_count(),
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next;
        self.remaining -= 1;
        // Odometer increment, keeping the flat position in sync.
        for d in (0..self.dims.len()).rev() {
            self.index[d] += 1;
            self.next += self.strides[d];
            if self.index[d] < self.dims[d] {
                break;
            }
            self.next -= self.strides[d] * self.dims[d];
            self.index[d] = 0;
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous() {
        let layout = Layout::contiguous((2, 3));
        assert!(layout.is_contiguous());
        assert_eq!(layout.strided_indices().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_transpose_reads_column_major() {
        let t = Layout::contiguous((2, 3)).transpose(0, 1).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert!(!t.is_contiguous());
        assert_eq!(t.strided_indices().collect::<Vec<_>>(), vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_permute() {
        let p = Layout::contiguous((2, 3, 4)).permute(&[2, 0, 1]).unwrap();
        assert_eq!(p.dims(), &[4, 2, 3]);
        assert_eq!(p.strides(), &[1, 12, 4]);
        assert!(Layout::contiguous((2, 3)).permute(&[0, 0]).is_err());
    }

    #[test]
    fn test_narrow_offsets() {
        let n = Layout::contiguous((4, 6)).narrow(1, 2, 3).unwrap();
        assert_eq!(n.offset(), 2);
        assert_eq!(n.strided_indices().take(4).collect::<Vec<_>>(), vec![2, 3, 4, 8]);
        assert!(Layout::contiguous((4, 6)).narrow(1, 5, 3).is_err());
    }

    #[test]
    fn test_broadcast_as() {
        let b = Layout::contiguous((1, 3))
            .broadcast_as(&Shape::from((2, 2, 3)))
            .unwrap();
        assert_eq!(b.strides(), &[0, 0, 1]);
        assert_eq!(
            b.strided_indices().collect::<Vec<_>>(),
            vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2]
        );
        assert!(Layout::contiguous(3).broadcast_as(&Shape::from(4)).is_err());
    }

    #[test]
    fn test_scalar_and_empty() {
        assert_eq!(Layout::contiguous(()).strided_indices().collect::<Vec<_>>(), vec![0]);
        assert_eq!(Layout::contiguous((2, 0)).strided_indices().count(), 0);
    }
}
