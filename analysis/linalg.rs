// analysis/linalg.rs

//! Thin bridge between `ndarray` containers and `faer` dense factorizations.
//!
//! Everything numerically heavy in the power engine reduces to a handful of
//! symmetric positive-definite solves: marginal covariance blocks, the fixed-effects
//! information `X' V^-1 X`, and the REML information matrix of the covariance
//! parameters. This module owns those calls so the rest of the crate works purely
//! in `ndarray`.

use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Matrix must be square, found {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("Right-hand side has {found} rows but the factor has dimension {expected}")]
    DimensionMismatch { found: usize, expected: usize },
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl FaerStorage<'_> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy view of a standard-layout `ndarray` matrix as a faer `MatRef`.
/// Non-contiguous inputs are copied once.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()),
            ),
            Some(slice) if array.t().is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_column_major_slice(slice, array.nrows(), array.ncols()),
            ),
            _ => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub struct FaerColView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let storage = if let Some(slice) = array.as_slice() {
            FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, len, 1))
        } else {
            FaerStorage::Owned(Mat::from_fn(len, 1, |i, _| array[i]))
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

/// Symmetric eigendecomposition; eigenvalues are returned in ascending order.
pub trait FaerEigh {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), LinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), LinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(LinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

/// Smallest eigenvalue of a symmetric matrix. Used for semi-definiteness checks.
pub fn min_eigenvalue(matrix: &Array2<f64>) -> Result<f64, LinalgError> {
    if matrix.nrows() != matrix.ncols() {
        return Err(LinalgError::NotSquare {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
        });
    }
    if matrix.is_empty() {
        return Ok(0.0);
    }
    let (values, _) = matrix.eigh(Side::Lower)?;
    Ok(values.iter().copied().fold(f64::INFINITY, f64::min))
}

/// A lower Cholesky factor `L` with `A = L L'`.
pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
    dim: usize,
}

impl CholeskyFactor {
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Result<Array1<f64>, LinalgError> {
        if rhs.len() != self.dim {
            return Err(LinalgError::DimensionMismatch {
                found: rhs.len(),
                expected: self.dim,
            });
        }
        let rhs_view = FaerColView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Ok(Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)]))
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, LinalgError> {
        if rhs.nrows() != self.dim {
            return Err(LinalgError::DimensionMismatch {
                found: rhs.nrows(),
                expected: self.dim,
            });
        }
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Ok(mat_to_array(sol.as_ref()))
    }

    /// Dense inverse of the factored matrix.
    pub fn inverse(&self) -> Result<Array2<f64>, LinalgError> {
        let identity = Array2::<f64>::eye(self.dim);
        let mut inv = self.solve_mat(&identity)?;
        // Solves against the identity are symmetric only up to rounding.
        for i in 0..self.dim {
            for j in (i + 1)..self.dim {
                let avg = 0.5 * (inv[(i, j)] + inv[(j, i)]);
                inv[(i, j)] = avg;
                inv[(j, i)] = avg;
            }
        }
        Ok(inv)
    }

    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    /// `log|A| = 2 * sum(log(diag(L)))`
    pub fn log_det(&self) -> f64 {
        2.0 * self.diag().mapv(f64::ln).sum()
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, LinalgError> {
        if self.nrows() != self.ncols() {
            return Err(LinalgError::NotSquare {
                rows: self.nrows(),
                cols: self.ncols(),
            });
        }
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(LinalgError::Cholesky)?;
        Ok(CholeskyFactor {
            factor,
            dim: self.nrows(),
        })
    }
}

/// Inverse of a symmetric positive-definite matrix.
pub fn spd_inverse(matrix: &Array2<f64>) -> Result<Array2<f64>, LinalgError> {
    matrix.cholesky(Side::Lower)?.inverse()
}
