//! Dense linear algebra for the sorter.
//!
//! Provides a row-major `Matrix` of observations (rows = samples, columns =
//! variables) and the decompositions the feature and mixture stages rely on:
//!
//! - column means / standard deviations, centering and standardizing
//! - matrix multiply and transpose
//! - Cholesky factorization with forward substitution (Gaussian densities)
//! - Jacobi symmetric eigen-decomposition (covariance axes)
//! - one-sided Jacobi SVD (PCA without forming the covariance matrix)
//!
//! Only depends on `std`.
//!
//! ## Example
//!
//! ```rust
//! use spikesort_core::linalg::{svd, Matrix};
//!
//! let m = Matrix::from_data(3, 2, vec![3.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
//! let dec = svd(&m).unwrap();
//! assert!((dec.singular_values[0] - 3.0).abs() < 1e-10);
//! assert!((dec.singular_values[1] - 2.0).abs() < 1e-10);
//! ```

use serde::{Deserialize, Serialize};

/// Errors raised by the numerical kernel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinalgError {
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("column {column} has zero standard deviation")]
    ZeroVariance { column: usize },

    #[error("matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("iterative decomposition did not converge")]
    ConvergenceFailed,

    #[error("degenerate input: {0}")]
    Degenerate(String),
}

/// Row-major dense matrix of `f64` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Create a zero-initialized matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Create a matrix from existing data (row-major order).
    ///
    /// # Panics
    /// Panics if `data.len() != rows * cols`.
    pub fn from_data(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(
            data.len(),
            rows * cols,
            "data length {} != rows*cols {}",
            data.len(),
            rows * cols
        );
        Self { rows, cols, data }
    }

    /// Stack equal-length rows into a matrix.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self, LinalgError> {
        let cols = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(LinalgError::DimensionMismatch(format!(
                    "row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// Create an *n*-by-*n* identity matrix.
    pub fn identity(n: usize) -> Self {
        let mut m = Self::new(n, n);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, val: f64) {
        self.data[r * self.cols + c] = val;
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Borrow row `r`.
    #[inline]
    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [f64] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Iterate over rows.
    pub fn row_iter(&self) -> impl Iterator<Item = &[f64]> {
        // chunks(0) panics; a zero-width matrix has no data to yield anyway.
        self.data.chunks(self.cols.max(1)).take(self.rows)
    }

    /// Copy column `c` out.
    pub fn column(&self, c: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, c)).collect()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Return the transpose.
    pub fn transpose(&self) -> Self {
        let mut t = Self::new(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                t.set(c, r, self.get(r, c));
            }
        }
        t
    }

    /// Matrix multiplication `self * other`.
    pub fn multiply(&self, other: &Matrix) -> Result<Matrix, LinalgError> {
        if self.cols != other.rows {
            return Err(LinalgError::DimensionMismatch(format!(
                "{}x{} * {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        let mut out = Matrix::new(self.rows, other.cols);
        for i in 0..self.rows {
            let a_row = self.row(i);
            for (k, &a) in a_row.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let b_row = other.row(k);
                let out_row = out.row_mut(i);
                for (o, &b) in out_row.iter_mut().zip(b_row) {
                    *o += a * b;
                }
            }
        }
        Ok(out)
    }

    /// Keep only the first `ncols` columns.
    pub fn truncate_cols(&self, ncols: usize) -> Matrix {
        let ncols = ncols.min(self.cols);
        let mut out = Matrix::new(self.rows, ncols);
        for r in 0..self.rows {
            out.row_mut(r).copy_from_slice(&self.row(r)[..ncols]);
        }
        out
    }

    /// Multiply every element by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// Add `lambda` to every diagonal element.
    pub fn add_diagonal(&mut self, lambda: f64) {
        for i in 0..self.rows.min(self.cols) {
            let v = self.get(i, i);
            self.set(i, i, v + lambda);
        }
    }

    // -----------------------------------------------------------------------
    // Column statistics
    // -----------------------------------------------------------------------

    /// Mean of each column.
    pub fn column_means(&self) -> Vec<f64> {
        let mut means = vec![0.0; self.cols];
        if self.rows == 0 {
            return means;
        }
        for row in self.row_iter() {
            for (m, &v) in means.iter_mut().zip(row) {
                *m += v;
            }
        }
        let n = self.rows as f64;
        for m in means.iter_mut() {
            *m /= n;
        }
        means
    }

    /// Sample standard deviation of each column (divides by n-1, or n if n==1).
    pub fn column_std(&self, means: &[f64]) -> Vec<f64> {
        let mut acc = vec![0.0; self.cols];
        for row in self.row_iter() {
            for ((a, &v), &m) in acc.iter_mut().zip(row).zip(means) {
                let d = v - m;
                *a += d * d;
            }
        }
        let divisor = if self.rows > 1 { (self.rows - 1) as f64 } else { 1.0 };
        acc.into_iter().map(|s| (s / divisor).sqrt()).collect()
    }

    /// Subtract `means` from every row.
    pub fn center(&self, means: &[f64]) -> Result<Matrix, LinalgError> {
        self.check_width(means.len())?;
        let mut out = self.clone();
        for r in 0..out.rows {
            for (v, &m) in out.row_mut(r).iter_mut().zip(means) {
                *v -= m;
            }
        }
        Ok(out)
    }

    /// Center, then divide each column by its standard deviation.
    ///
    /// A constant column cannot be standardized and is reported as
    /// [`LinalgError::ZeroVariance`].
    pub fn standardize(&self, means: &[f64], stds: &[f64]) -> Result<Matrix, LinalgError> {
        self.check_width(stds.len())?;
        if let Some(column) = stds.iter().position(|&s| s == 0.0) {
            return Err(LinalgError::ZeroVariance { column });
        }
        let mut out = self.center(means)?;
        for r in 0..out.rows {
            for (v, &s) in out.row_mut(r).iter_mut().zip(stds) {
                *v /= s;
            }
        }
        Ok(out)
    }

    fn check_width(&self, len: usize) -> Result<(), LinalgError> {
        if len != self.cols {
            return Err(LinalgError::DimensionMismatch(format!(
                "expected {} column statistics, got {}",
                self.cols, len
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cholesky
    // -----------------------------------------------------------------------

    /// Cholesky factor `L` with `A = L L^T` (Cholesky-Banachiewicz).
    pub fn cholesky(&self) -> Result<Matrix, LinalgError> {
        if self.rows != self.cols {
            return Err(LinalgError::DimensionMismatch(format!(
                "cholesky requires a square matrix, got {}x{}",
                self.rows, self.cols
            )));
        }
        let n = self.rows;
        let mut l = Matrix::new(n, n);
        for i in 0..n {
            for j in 0..=i {
                let mut sum = self.get(i, j);
                for k in 0..j {
                    sum -= l.get(i, k) * l.get(j, k);
                }
                if i == j {
                    if !(sum > 0.0) || !sum.is_finite() {
                        return Err(LinalgError::NotPositiveDefinite);
                    }
                    l.set(i, j, sum.sqrt());
                } else {
                    l.set(i, j, sum / l.get(j, j));
                }
            }
        }
        Ok(l)
    }

    /// Solve `L y = b` for lower-triangular `self`.
    pub fn forward_substitute(&self, b: &[f64]) -> Vec<f64> {
        let n = self.rows;
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = b[i];
            for k in 0..i {
                sum -= self.get(i, k) * y[k];
            }
            y[i] = sum / self.get(i, i);
        }
        y
    }
}

// ---------------------------------------------------------------------------
// Jacobi symmetric eigenvalue decomposition
// ---------------------------------------------------------------------------

/// Result of a symmetric eigen-decomposition.
#[derive(Debug, Clone)]
pub struct EigenResult {
    /// Eigenvalues in descending order.
    pub eigenvalues: Vec<f64>,
    /// Column *j* is the eigenvector of `eigenvalues[j]`.
    pub eigenvectors: Matrix,
}

/// Eigen-decomposition of a real symmetric matrix using the classical
/// Jacobi method with largest off-diagonal pivoting.
pub fn symmetric_eigen(mat: &Matrix) -> Result<EigenResult, LinalgError> {
    let n = mat.rows();
    if n != mat.cols() {
        return Err(LinalgError::DimensionMismatch(
            "symmetric_eigen requires a square matrix".to_string(),
        ));
    }

    let mut a = mat.clone();
    let mut v = Matrix::identity(n);

    let scale = mat.as_slice().iter().fold(0.0_f64, |m, x| m.max(x.abs())).max(1e-300);
    let tol = 1e-14 * scale;
    let max_iter = 100 * n * n + 100;
    let mut converged = n < 2;

    for _ in 0..max_iter {
        let mut p = 0;
        let mut q = 1;
        let mut max_off = 0.0_f64;
        for i in 0..n {
            for j in (i + 1)..n {
                let val = a.get(i, j).abs();
                if val > max_off {
                    max_off = val;
                    p = i;
                    q = j;
                }
            }
        }

        if max_off <= tol {
            converged = true;
            break;
        }

        let app = a.get(p, p);
        let aqq = a.get(q, q);
        let apq = a.get(p, q);
        let theta = 0.5 * (2.0 * apq).atan2(app - aqq);
        let (s, c) = theta.sin_cos();

        // A' = G^T A G
        for i in 0..n {
            let aip = a.get(p, i);
            let aiq = a.get(q, i);
            a.set(p, i, c * aip + s * aiq);
            a.set(q, i, -s * aip + c * aiq);
        }
        for i in 0..n {
            let aip = a.get(i, p);
            let aiq = a.get(i, q);
            a.set(i, p, c * aip + s * aiq);
            a.set(i, q, -s * aip + c * aiq);
        }
        for i in 0..n {
            let vip = v.get(i, p);
            let viq = v.get(i, q);
            v.set(i, p, c * vip + s * viq);
            v.set(i, q, -s * vip + c * viq);
        }
    }

    if !converged {
        return Err(LinalgError::ConvergenceFailed);
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| a.get(y, y).total_cmp(&a.get(x, x)));

    let eigenvalues = order.iter().map(|&i| a.get(i, i)).collect();
    let mut eigenvectors = Matrix::new(n, n);
    for (dst, &src) in order.iter().enumerate() {
        for r in 0..n {
            eigenvectors.set(r, dst, v.get(r, src));
        }
    }
    Ok(EigenResult {
        eigenvalues,
        eigenvectors,
    })
}

// ---------------------------------------------------------------------------
// Singular value decomposition
// ---------------------------------------------------------------------------

/// Thin SVD `A = U diag(s) V^T`.
#[derive(Debug, Clone)]
pub struct Svd {
    /// Left singular vectors, m x r.
    pub u: Matrix,
    /// Singular values, descending and non-negative, length r = min(m, n).
    pub singular_values: Vec<f64>,
    /// Right singular vectors, n x r.
    pub v: Matrix,
}

impl Svd {
    /// Row scores on the first `k` axes: `U_k diag(s_k)`.
    pub fn scores(&self, k: usize) -> Matrix {
        let k = k.min(self.singular_values.len());
        let mut out = Matrix::new(self.u.rows(), k);
        for r in 0..self.u.rows() {
            for c in 0..k {
                out.set(r, c, self.u.get(r, c) * self.singular_values[c]);
            }
        }
        out
    }
}

const SVD_MAX_SWEEPS: usize = 75;

/// Singular value decomposition by one-sided (Hestenes) Jacobi rotations.
///
/// Columns of a working copy of `A` are orthogonalized pairwise; the
/// accumulated rotations form `V`, the final column norms are the singular
/// values and the normalized columns are `U`.
pub fn svd(mat: &Matrix) -> Result<Svd, LinalgError> {
    if mat.is_empty() {
        return Err(LinalgError::Degenerate(format!(
            "cannot decompose a {}x{} matrix",
            mat.rows(),
            mat.cols()
        )));
    }
    if mat.as_slice().iter().any(|v| !v.is_finite()) {
        return Err(LinalgError::Degenerate("matrix contains non-finite values".to_string()));
    }
    if mat.rows() < mat.cols() {
        let t = svd(&mat.transpose())?;
        return Ok(Svd {
            u: t.v,
            singular_values: t.singular_values,
            v: t.u,
        });
    }

    let m = mat.rows();
    let n = mat.cols();
    // Column-major working copies.
    let mut a: Vec<Vec<f64>> = (0..n).map(|c| mat.column(c)).collect();
    let mut v: Vec<Vec<f64>> = (0..n)
        .map(|c| {
            let mut col = vec![0.0; n];
            col[c] = 1.0;
            col
        })
        .collect();

    let eps = (m as f64 * f64::EPSILON).max(1e-15);
    let mut converged = false;
    for _ in 0..SVD_MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..n.saturating_sub(1) {
            for q in (p + 1)..n {
                let (alpha, beta, gamma) = column_products(&a[p], &a[q]);
                if alpha == 0.0 || beta == 0.0 {
                    continue;
                }
                if gamma.abs() <= eps * (alpha * beta).sqrt() {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                rotate_columns(&mut a, p, q, c, s);
                rotate_columns(&mut v, p, q, c, s);
            }
        }
        if !rotated {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(LinalgError::ConvergenceFailed);
    }

    let norms: Vec<f64> = a.iter().map(|col| col.iter().map(|x| x * x).sum::<f64>().sqrt()).collect();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| norms[y].total_cmp(&norms[x]));

    let mut u = Matrix::new(m, n);
    let mut vm = Matrix::new(n, n);
    let mut singular_values = Vec::with_capacity(n);
    for (dst, &src) in order.iter().enumerate() {
        let sigma = norms[src];
        singular_values.push(sigma);
        if sigma > 0.0 {
            for r in 0..m {
                u.set(r, dst, a[src][r] / sigma);
            }
        }
        for r in 0..n {
            vm.set(r, dst, v[src][r]);
        }
    }

    Ok(Svd {
        u,
        singular_values,
        v: vm,
    })
}

fn column_products(x: &[f64], y: &[f64]) -> (f64, f64, f64) {
    let mut alpha = 0.0;
    let mut beta = 0.0;
    let mut gamma = 0.0;
    for (&a, &b) in x.iter().zip(y) {
        alpha += a * a;
        beta += b * b;
        gamma += a * b;
    }
    (alpha, beta, gamma)
}

fn rotate_columns(cols: &mut [Vec<f64>], p: usize, q: usize, c: f64, s: f64) {
    let (left, right) = cols.split_at_mut(q);
    let cp = &mut left[p];
    let cq = &mut right[0];
    for (xp, xq) in cp.iter_mut().zip(cq.iter_mut()) {
        let a = *xp;
        let b = *xq;
        *xp = c * a - s * b;
        *xq = s * a + c * b;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
