// Host linear algebra — dense f64 routines behind the Host kernels
//
// All routines work on a row-major `Matrix` and follow the conventions of
// the usual scientific-computing libraries:
//
//   inv          Gauss-Jordan with partial pivoting
//   cholesky     A = L Lᵀ (lower) or A = Uᵀ U (upper)
//   lu           A = P L U, L unit lower triangular
//   lu_factor    packed L\U plus a row permutation with A[perm] = L U
//   eigh         cyclic Jacobi, ascending eigenvalues, eigenvectors as columns
//
// Singular or non positive-definite inputs are reported as errors, never as
// NaN-filled results.

use marten_core::{Error, Result};

/// Pivots smaller than this are treated as zero.
const SINGULAR_EPS: f64 = 1e-12;
const JACOBI_MAX_SWEEPS: usize = 100;

/// Dense row-major matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::msg(format!(
                "matrix {rows}x{cols} needs {} values, got {}",
                rows * cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m[(i, i)] = 1.0;
        }
        m
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    pub fn transpose(&self) -> Self {
        let mut t = Self::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                t[(j, i)] = self[(i, j)];
            }
        }
        t
    }

    pub fn matmul(&self, rhs: &Matrix) -> Result<Matrix> {
        if self.cols != rhs.rows {
            return Err(Error::MatmulShapeMismatch {
                m: self.rows,
                k1: self.cols,
                k2: rhs.rows,
                n: rhs.cols,
            });
        }
        let mut out = Self::zeros(self.rows, rhs.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self[(i, k)];
                for j in 0..rhs.cols {
                    out[(i, j)] += a * rhs[(k, j)];
                }
            }
        }
        Ok(out)
    }

    /// Largest absolute element-wise difference.
    pub fn max_abs_diff(&self, other: &Matrix) -> f64 {
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for j in 0..self.cols {
            self.data.swap(a * self.cols + j, b * self.cols + j);
        }
    }

    fn require_square(&self, what: &str) -> Result<()> {
        if !self.is_square() {
            return Err(Error::msg(format!(
                "{what}: expected a square matrix, got {}x{}",
                self.rows, self.cols
            )));
        }
        Ok(())
    }
}

impl std::ops::Index<(usize, usize)> for Matrix {
    type Output = f64;
    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        &self.data[i * self.cols + j]
    }
}

impl std::ops::IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        &mut self.data[i * self.cols + j]
    }
}

/// Row with the largest |value| in `col`, searching rows `from..`.
fn pivot_row(m: &Matrix, col: usize, from: usize) -> usize {
    let mut best = from;
    for r in from + 1..m.rows {
        if m[(r, col)].abs() > m[(best, col)].abs() {
            best = r;
        }
    }
    best
}

// Inverse

pub fn inv(a: &Matrix) -> Result<Matrix> {
    a.require_square("inv")?;
    let n = a.rows;
    let mut work = a.clone();
    let mut out = Matrix::identity(n);
    for col in 0..n {
        let p = pivot_row(&work, col, col);
        if work[(p, col)].abs() < SINGULAR_EPS {
            return Err(Error::msg("inv: matrix is singular"));
        }
        work.swap_rows(col, p);
        out.swap_rows(col, p);
        let pivot = work[(col, col)];
        for j in 0..n {
            work[(col, j)] /= pivot;
            out[(col, j)] /= pivot;
        }
        for r in 0..n {
            if r == col {
                continue;
            }
            let f = work[(r, col)];
            if f == 0.0 {
                continue;
            }
            for j in 0..n {
                work[(r, j)] -= f * work[(col, j)];
                out[(r, j)] -= f * out[(col, j)];
            }
        }
    }
    Ok(out)
}

// Cholesky

/// Cholesky factor; the opposite triangle is zero.
pub fn cholesky(a: &Matrix, lower: bool) -> Result<Matrix> {
    a.require_square("cholesky")?;
    let n = a.rows;
    let mut l = Matrix::zeros(n, n);
    for j in 0..n {
        let mut diag = a[(j, j)];
        for k in 0..j {
            diag -= l[(j, k)] * l[(j, k)];
        }
        if diag <= 0.0 {
            return Err(Error::msg("cholesky: matrix is not positive definite"));
        }
        let d = diag.sqrt();
        l[(j, j)] = d;
        for i in j + 1..n {
            let mut s = a[(i, j)];
            for k in 0..j {
                s -= l[(i, k)] * l[(j, k)];
            }
            l[(i, j)] = s / d;
        }
    }
    Ok(if lower { l } else { l.transpose() })
}

/// `(factor, lower)` as consumed by [`cho_solve`].
pub fn cho_factor(a: &Matrix, lower: bool) -> Result<(Matrix, bool)> {
    Ok((cholesky(a, lower)?, lower))
}

/// Solve `A x = b` given the Cholesky factor of `A`.
pub fn cho_solve(factor: &(Matrix, bool), b: &Matrix) -> Result<Matrix> {
    let (c, lower) = factor;
    let l = if *lower { c.clone() } else { c.transpose() };
    let y = forward_substitute(&l, b, false)?;
    back_substitute(&l.transpose(), &y)
}

/// Solve `L y = b` for lower-triangular `L`.
fn forward_substitute(l: &Matrix, b: &Matrix, unit_diag: bool) -> Result<Matrix> {
    if l.rows != b.rows {
        return Err(Error::msg(format!(
            "triangular solve: matrix has {} rows, rhs has {}",
            l.rows, b.rows
        )));
    }
    let n = l.rows;
    let mut y = b.clone();
    for c in 0..b.cols {
        for i in 0..n {
            let mut s = y[(i, c)];
            for k in 0..i {
                s -= l[(i, k)] * y[(k, c)];
            }
            y[(i, c)] = if unit_diag { s } else { s / l[(i, i)] };
        }
    }
    Ok(y)
}

/// Solve `U x = y` for upper-triangular `U`.
fn back_substitute(u: &Matrix, y: &Matrix) -> Result<Matrix> {
    let n = u.rows;
    let mut x = y.clone();
    for c in 0..y.cols {
        for i in (0..n).rev() {
            let mut s = x[(i, c)];
            for k in i + 1..n {
                s -= u[(i, k)] * x[(k, c)];
            }
            if u[(i, i)].abs() < SINGULAR_EPS {
                return Err(Error::msg("triangular solve: matrix is singular"));
            }
            x[(i, c)] = s / u[(i, i)];
        }
    }
    Ok(x)
}

// LU

/// Gaussian elimination with partial pivoting on an `m x n` matrix.
///
/// Returns the packed factors and the row order, so that
/// `a[perm[i]]` is row `i` of `L U`.
fn lu_decompose(a: &Matrix) -> (Matrix, Vec<usize>) {
    let mut lu = a.clone();
    let mut perm: Vec<usize> = (0..a.rows).collect();
    let steps = a.rows.min(a.cols);
    for k in 0..steps {
        let p = pivot_row(&lu, k, k);
        lu.swap_rows(k, p);
        perm.swap(k, p);
        let pivot = lu[(k, k)];
        if pivot == 0.0 {
            continue;
        }
        for i in k + 1..a.rows {
            let f = lu[(i, k)] / pivot;
            lu[(i, k)] = f;
            for j in k + 1..a.cols {
                lu[(i, j)] -= f * lu[(k, j)];
            }
        }
    }
    (lu, perm)
}

/// `A = P L U` with `P` a permutation matrix, `L` unit lower (`m x k`) and
/// `U` upper (`k x n`), `k = min(m, n)`.
pub fn lu(a: &Matrix) -> Result<(Matrix, Matrix, Matrix)> {
    let (m, n) = (a.rows, a.cols);
    let k = m.min(n);
    let (packed, perm) = lu_decompose(a);
    let mut p = Matrix::zeros(m, m);
    for (i, &row) in perm.iter().enumerate() {
        p[(row, i)] = 1.0;
    }
    let mut l = Matrix::zeros(m, k);
    let mut u = Matrix::zeros(k, n);
    for i in 0..m {
        for j in 0..k {
            l[(i, j)] = match i.cmp(&j) {
                std::cmp::Ordering::Greater => packed[(i, j)],
                std::cmp::Ordering::Equal => 1.0,
                std::cmp::Ordering::Less => 0.0,
            };
        }
    }
    for i in 0..k {
        for j in i..n {
            u[(i, j)] = packed[(i, j)];
        }
    }
    Ok((p, l, u))
}

/// Packed `L\U` (unit diagonal of `L` implied) and the row permutation.
pub fn lu_factor(a: &Matrix) -> Result<(Matrix, Vec<usize>)> {
    a.require_square("lu_factor")?;
    Ok(lu_decompose(a))
}

/// Solve `A x = b` from [`lu_factor`] output.
pub fn lu_solve(factor: &(Matrix, Vec<usize>), b: &Matrix) -> Result<Matrix> {
    let (lu, perm) = factor;
    if perm.len() != b.rows {
        return Err(Error::msg(format!(
            "lu_solve: factor has {} rows, rhs has {}",
            perm.len(),
            b.rows
        )));
    }
    let mut pb = Matrix::zeros(b.rows, b.cols);
    for (i, &row) in perm.iter().enumerate() {
        for c in 0..b.cols {
            pb[(i, c)] = b[(row, c)];
        }
    }
    let y = forward_substitute(lu, &pb, true)?;
    back_substitute(lu, &y)
}

// Symmetric eigendecomposition

/// Eigenvalues (ascending) and eigenvectors (columns) of a symmetric matrix.
///
/// Only the triangle selected by `lower` is read.
pub fn eigh(a: &Matrix, lower: bool) -> Result<(Vec<f64>, Matrix)> {
    a.require_square("eigh")?;
    let n = a.rows;
    let mut s = Matrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            let from_lower = if i >= j { a[(i, j)] } else { a[(j, i)] };
            let from_upper = if i <= j { a[(i, j)] } else { a[(j, i)] };
            s[(i, j)] = if lower { from_lower } else { from_upper };
        }
    }
    let mut v = Matrix::identity(n);
    let scale = s.data.iter().map(|x| x * x).sum::<f64>().sqrt().max(1.0);
    for _ in 0..JACOBI_MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| s[(i, j)] * s[(i, j)])
            .sum();
        if off.sqrt() <= 1e-14 * scale {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = s[(p, q)];
                if apq.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (s[(q, q)] - s[(p, p)]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let sn = t * c;
                for k in 0..n {
                    let skp = s[(k, p)];
                    let skq = s[(k, q)];
                    s[(k, p)] = c * skp - sn * skq;
                    s[(k, q)] = sn * skp + c * skq;
                }
                for k in 0..n {
                    let spk = s[(p, k)];
                    let sqk = s[(q, k)];
                    s[(p, k)] = c * spk - sn * sqk;
                    s[(q, k)] = sn * spk + c * sqk;
                }
                for k in 0..n {
                    let vkp = v[(k, p)];
                    let vkq = v[(k, q)];
                    v[(k, p)] = c * vkp - sn * vkq;
                    v[(k, q)] = sn * vkp + c * vkq;
                }
            }
        }
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| s[(i, i)].total_cmp(&s[(j, j)]));
    let values = order.iter().map(|&i| s[(i, i)]).collect();
    let mut vectors = Matrix::zeros(n, n);
    for (dst, &src) in order.iter().enumerate() {
        for k in 0..n {
            vectors[(k, dst)] = v[(k, src)];
        }
    }
    Ok((values, vectors))
}

// Block diagonal

pub fn block_diag(blocks: &[Matrix]) -> Matrix {
    let rows = blocks.iter().map(|b| b.rows).sum();
    let cols = blocks.iter().map(|b| b.cols).sum();
    let mut out = Matrix::zeros(rows, cols);
    let (mut r0, mut c0) = (0, 0);
    for b in blocks {
        for i in 0..b.rows {
            for j in 0..b.cols {
                out[(r0 + i, c0 + j)] = b[(i, j)];
            }
        }
        r0 += b.rows;
        c0 += b.cols;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spd(n: usize) -> Matrix {
        // B Bᵀ + n I
        let b = Matrix::new(
            n,
            n,
            (0..n * n).map(|i| ((i * 7 + 3) % 11) as f64 / 5.0 - 1.0).collect(),
        )
        .unwrap();
        let mut a = b.matmul(&b.transpose()).unwrap();
        for i in 0..n {
            a[(i, i)] += n as f64;
        }
        a
    }

    #[test]
    fn test_inv_roundtrip() {
        let a = Matrix::new(3, 3, vec![0.0, 2.0, 1.0, 1.0, 1.0, 0.0, 3.0, 0.0, 1.0]).unwrap();
        let ai = inv(&a).unwrap();
        assert!(a.matmul(&ai).unwrap().max_abs_diff(&Matrix::identity(3)) < 1e-12);
        let singular = Matrix::new(2, 2, vec![1.0, 2.0, 2.0, 4.0]).unwrap();
        assert!(inv(&singular).is_err());
    }

    #[test]
    fn test_cholesky_both_triangles() {
        let a = spd(4);
        let l = cholesky(&a, true).unwrap();
        assert!(l.matmul(&l.transpose()).unwrap().max_abs_diff(&a) < 1e-10);
        assert_eq!(l[(0, 3)], 0.0);
        let u = cholesky(&a, false).unwrap();
        assert!(u.transpose().matmul(&u).unwrap().max_abs_diff(&a) < 1e-10);
        let not_pd = Matrix::new(2, 2, vec![1.0, 2.0, 2.0, 1.0]).unwrap();
        assert!(cholesky(&not_pd, true).is_err());
    }

    #[test]
    fn test_cho_solve() {
        let a = spd(5);
        let b = Matrix::new(5, 1, vec![1.0; 5]).unwrap();
        for lower in [true, false] {
            let x = cho_solve(&cho_factor(&a, lower).unwrap(), &b).unwrap();
            assert!(a.matmul(&x).unwrap().max_abs_diff(&b) < 1e-10);
        }
    }

    #[test]
    fn test_lu_rectangular() {
        let a = Matrix::new(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let (p, l, u) = lu(&a).unwrap();
        assert_eq!((l.rows, l.cols, u.rows, u.cols), (3, 2, 2, 2));
        let rebuilt = p.matmul(&l).unwrap().matmul(&u).unwrap();
        assert!(rebuilt.max_abs_diff(&a) < 1e-12);
        // Partial pivoting picks the largest first-column entry.
        assert_eq!(p[(2, 0)], 1.0);
    }

    #[test]
    fn test_lu_factor_and_solve() {
        let a = Matrix::new(3, 3, vec![2.0, 1.0, 1.0, 4.0, -6.0, 0.0, -2.0, 7.0, 2.0]).unwrap();
        let (packed, perm) = lu_factor(&a).unwrap();
        let mut l = Matrix::identity(3);
        let mut u = Matrix::zeros(3, 3);
        for i in 0..3 {
            for j in 0..3 {
                if i > j {
                    l[(i, j)] = packed[(i, j)];
                } else {
                    u[(i, j)] = packed[(i, j)];
                }
            }
        }
        let lu_prod = l.matmul(&u).unwrap();
        for (i, &row) in perm.iter().enumerate() {
            for j in 0..3 {
                assert!((lu_prod[(i, j)] - a[(row, j)]).abs() < 1e-12);
            }
        }
        let b = Matrix::new(3, 1, vec![5.0, -2.0, 9.0]).unwrap();
        let x = lu_solve(&(packed, perm), &b).unwrap();
        assert!(a.matmul(&x).unwrap().max_abs_diff(&b) < 1e-12);
    }

    #[test]
    fn test_eigh_reconstructs() {
        let a = spd(5);
        for lower in [true, false] {
            let (w, v) = eigh(&a, lower).unwrap();
            assert!(w.windows(2).all(|p| p[0] <= p[1]));
            let mut d = Matrix::zeros(5, 5);
            for i in 0..5 {
                d[(i, i)] = w[i];
            }
            let lhs = a.matmul(&v).unwrap();
            let rhs = v.matmul(&d).unwrap();
            assert!(lhs.max_abs_diff(&rhs) < 1e-9);
        }
    }

    #[test]
    fn test_block_diag() {
        let a = Matrix::new(1, 2, vec![1.0, 2.0]).unwrap();
        let b = Matrix::new(2, 1, vec![3.0, 4.0]).unwrap();
        let out = block_diag(&[a, b]);
        assert_eq!((out.rows, out.cols), (3, 3));
        assert_eq!(out.data, vec![1.0, 2.0, 0.0, 0.0, 0.0, 3.0, 0.0, 0.0, 4.0]);
    }
}
