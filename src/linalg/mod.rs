//! Linear solvers for the damped normal equations.
//!
//! Every backend solves
//!
//! ```text
//! (JᵀJ + λ D) Δ = -Jᵀr
//! ```
//!
//! for one batch element, where `D` is selected by [`DampingScaling`]. Backward
//! differentiation reuses the same factorization for a general right-hand side through
//! [`LinearSolver::solve_system`].
//!
//! - [`DenseCholeskySolver`]: nalgebra `Cholesky` of the dense normal matrix
//! - [`SparseCholeskySolver`]: faer supernodal `Llt`, symbolic analysis cached per
//!   objective structure version
//! - [`DenseLuSolver`]: nalgebra `LU` with partial pivoting

pub mod cholesky;
pub mod dense;

pub use cholesky::SparseCholeskySolver;
pub use dense::{DenseCholeskySolver, DenseLuSolver};

use crate::linearization::{JacobianStorage, LinearizationKind, Linearization};
use nalgebra::{DMatrix, DVector};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    DenseCholesky,
    #[default]
    SparseCholesky,
    DenseLu,
}

impl LinearSolverType {
    /// Fresh solver of this type.
    pub fn create(self) -> Box<dyn LinearSolver> {
        match self {
            LinearSolverType::DenseCholesky => Box::new(DenseCholeskySolver::new()),
            LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
            LinearSolverType::DenseLu => Box::new(DenseLuSolver::new()),
        }
    }

    /// Jacobian storage this solver works on without conversion.
    pub fn linearization_kind(self) -> LinearizationKind {
        match self {
            LinearSolverType::SparseCholesky => LinearizationKind::Sparse,
            LinearSolverType::DenseCholesky | LinearSolverType::DenseLu => LinearizationKind::Dense,
        }
    }
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::DenseCholesky => write!(f, "Dense Cholesky"),
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::DenseLu => write!(f, "Dense LU"),
        }
    }
}

/// Damping matrix `D` of the augmented system.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum DampingScaling {
    /// `D = I`
    #[default]
    Identity,
    /// `D = diag(JᵀJ)` clamped to `[min_diagonal, max_diagonal]`
    Jacobi { min_diagonal: f64, max_diagonal: f64 },
}

impl DampingScaling {
    pub fn jacobi() -> Self {
        DampingScaling::Jacobi {
            min_diagonal: 1e-6,
            max_diagonal: 1e32,
        }
    }

    /// Diagonal of `D` given the diagonal of `JᵀJ`.
    pub fn diagonal(&self, hessian_diagonal: &DVector<f64>) -> DVector<f64> {
        match *self {
            DampingScaling::Identity => DVector::from_element(hessian_diagonal.len(), 1.0),
            DampingScaling::Jacobi {
                min_diagonal,
                max_diagonal,
            } => hessian_diagonal.map(|d| d.clamp(min_diagonal, max_diagonal)),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// The system matrix is singular, not positive definite, or produced non-finite values
    #[error("Singular system: {0}")]
    SingularSystem(String),

    /// Matrix factorization failed for a reason other than singularity
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Right-hand side or damping inconsistent with the system size
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// This logs both the LinAlgError and the underlying error from faer
    /// (`LltError`, `CreationError`, ...).
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// One element's system: its linearization and damping.
#[derive(Debug, Clone, Copy)]
pub struct DampedSystem<'a> {
    pub linearization: &'a Linearization,
    pub lambda: f64,
}

/// Backend solving the damped normal equations of one batch element at a time.
pub trait LinearSolver: Send {
    fn solver_type(&self) -> LinearSolverType;

    /// Solve `(JᵀJ + λ D) X = rhs` for a right-hand side with `ncols(J)` rows.
    fn solve_system(
        &mut self,
        linearization: &Linearization,
        lambda: f64,
        scaling: DampingScaling,
        rhs: &DMatrix<f64>,
    ) -> LinAlgResult<DMatrix<f64>>;

    /// Solve `(JᵀJ + λ D) Δ = -Jᵀr`.
    fn solve_step(
        &mut self,
        linearization: &Linearization,
        lambda: f64,
        scaling: DampingScaling,
    ) -> LinAlgResult<DVector<f64>> {
        let rhs = -linearization.gradient();
        let rhs = DMatrix::from_column_slice(rhs.len(), 1, rhs.as_slice());
        let solution = self.solve_system(linearization, lambda, scaling, &rhs)?;
        Ok(solution.column(0).into_owned())
    }

    /// Steps for several elements; one result per element, in order. A failing element
    /// does not affect the others.
    fn solve_batch(
        &mut self,
        systems: &[DampedSystem<'_>],
        scaling: DampingScaling,
    ) -> Vec<LinAlgResult<DVector<f64>>> {
        systems
            .iter()
            .map(|s| self.solve_step(s.linearization, s.lambda, scaling))
            .collect()
    }
}

/// Checks shared by all backends.
pub(crate) fn check_system(
    linearization: &Linearization,
    lambda: f64,
    rhs: &DMatrix<f64>,
) -> LinAlgResult<()> {
    if rhs.nrows() != linearization.ncols() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "right-hand side has {} rows, system has {} unknowns",
            rhs.nrows(),
            linearization.ncols()
        ))
        .log());
    }
    if !(lambda >= 0.0 && lambda.is_finite()) {
        return Err(LinAlgError::DimensionMismatch(format!(
            "damping must be finite and non-negative, got {lambda}"
        ))
        .log());
    }
    Ok(())
}

/// Dense `JᵀJ + λ D`.
pub(crate) fn dense_augmented_normal_matrix(
    linearization: &Linearization,
    lambda: f64,
    scaling: DampingScaling,
) -> DMatrix<f64> {
    let jacobian = match &linearization.jacobian {
        JacobianStorage::Dense(j) => std::borrow::Cow::Borrowed(j),
        JacobianStorage::Sparse(_) => std::borrow::Cow::Owned(linearization.jacobian_dense()),
    };
    let mut normal = jacobian.tr_mul(&jacobian);
    if lambda > 0.0 {
        let damping = scaling.diagonal(&normal.diagonal());
        for (i, d) in damping.iter().enumerate() {
            normal[(i, i)] += lambda * d;
        }
    }
    normal
}

pub(crate) fn check_solution(solution: &DMatrix<f64>, what: &str) -> LinAlgResult<()> {
    if !crate::utils::all_finite(solution.iter()) {
        return Err(LinAlgError::SingularSystem(format!("{what} produced non-finite values")).log());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_systems {
    use super::*;

    /// Overdetermined 4×3 system.
    pub(crate) fn well_conditioned(kind: LinearizationKind) -> Linearization {
        let jacobian = DMatrix::from_row_slice(
            4,
            3,
            &[2.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0, 1.5, 0.0, 0.5],
        );
        let residual = DVector::from_vec(vec![1.0, -2.0, 0.5, 1.2]);
        build(jacobian, residual, kind, 1)
    }

    /// The second unknown does not appear in any residual.
    pub(crate) fn singular(kind: LinearizationKind) -> Linearization {
        let jacobian = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 2.0, 0.0]);
        let residual = DVector::from_vec(vec![0.0, 1.0]);
        build(jacobian, residual, kind, 2)
    }

    pub(crate) fn build(
        jacobian: DMatrix<f64>,
        residual: DVector<f64>,
        kind: LinearizationKind,
        structure_version: u64,
    ) -> Linearization {
        let jacobian = match kind {
            LinearizationKind::Dense => JacobianStorage::Dense(jacobian),
            LinearizationKind::Sparse => match cholesky::dense_to_sparse(&jacobian) {
                Ok(sparse) => JacobianStorage::Sparse(sparse),
                Err(_) => JacobianStorage::Dense(jacobian),
            },
        };
        Linearization {
            residual,
            jacobian,
            structure_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_systems::*;
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-9;

    fn all_types() -> [LinearSolverType; 3] {
        [
            LinearSolverType::DenseCholesky,
            LinearSolverType::SparseCholesky,
            LinearSolverType::DenseLu,
        ]
    }

    #[test]
    fn test_backends_agree_on_step() -> TestResult {
        let reference = {
            let lin = well_conditioned(LinearizationKind::Dense);
            let j = lin.jacobian_dense();
            let h = j.tr_mul(&j) + DMatrix::identity(3, 3) * 0.3;
            h.lu().solve(&-lin.gradient()).ok_or("reference solve failed")?
        };
        for solver_type in all_types() {
            let lin = well_conditioned(solver_type.linearization_kind());
            let mut solver = solver_type.create();
            assert_eq!(solver.solver_type(), solver_type);
            let step = solver.solve_step(&lin, 0.3, DampingScaling::Identity)?;
            assert!((step - &reference).norm() < TOLERANCE, "{solver_type}");
        }
        Ok(())
    }

    #[test]
    fn test_solvers_accept_either_storage() -> TestResult {
        for solver_type in all_types() {
            let dense = well_conditioned(LinearizationKind::Dense);
            let sparse = well_conditioned(LinearizationKind::Sparse);
            let mut solver = solver_type.create();
            let a = solver.solve_step(&dense, 0.0, DampingScaling::Identity)?;
            let b = solver.solve_step(&sparse, 0.0, DampingScaling::Identity)?;
            assert!((a - b).norm() < TOLERANCE, "{solver_type}");
        }
        Ok(())
    }

    #[test]
    fn test_jacobi_scaling() -> TestResult {
        let lin = well_conditioned(LinearizationKind::Dense);
        let j = lin.jacobian_dense();
        let h = j.tr_mul(&j);
        let mut damped = h.clone();
        for i in 0..3 {
            damped[(i, i)] += 2.0 * h[(i, i)];
        }
        let expected = damped.lu().solve(&-lin.gradient()).ok_or("reference solve failed")?;
        for solver_type in all_types() {
            let lin = well_conditioned(solver_type.linearization_kind());
            let step = solver_type.create().solve_step(&lin, 2.0, DampingScaling::jacobi())?;
            assert!((step - &expected).norm() < TOLERANCE, "{solver_type}");
        }
        Ok(())
    }

    #[test]
    fn test_jacobi_diagonal_is_clamped() {
        let scaling = DampingScaling::Jacobi {
            min_diagonal: 0.5,
            max_diagonal: 10.0,
        };
        let d = scaling.diagonal(&DVector::from_vec(vec![0.0, 3.0, 100.0]));
        assert_eq!(d, DVector::from_vec(vec![0.5, 3.0, 10.0]));
    }

    #[test]
    fn test_singular_system_reported() {
        for solver_type in all_types() {
            let lin = singular(solver_type.linearization_kind());
            let result = solver_type.create().solve_step(&lin, 0.0, DampingScaling::Identity);
            assert!(
                matches!(result, Err(LinAlgError::SingularSystem(_))),
                "{solver_type}: {result:?}"
            );
        }
    }

    #[test]
    fn test_damping_regularizes_singular_system() -> TestResult {
        for solver_type in all_types() {
            let lin = singular(solver_type.linearization_kind());
            let step = solver_type.create().solve_step(&lin, 1.0, DampingScaling::Identity)?;
            assert!(step.iter().all(|v| v.is_finite()));
        }
        Ok(())
    }

    #[test]
    fn test_batch_failure_is_isolated() -> TestResult {
        for solver_type in all_types() {
            let kind = solver_type.linearization_kind();
            let good = well_conditioned(kind);
            let bad = singular(kind);
            let mut solver = solver_type.create();
            let results = solver.solve_batch(
                &[
                    DampedSystem { linearization: &good, lambda: 0.0 },
                    DampedSystem { linearization: &bad, lambda: 0.0 },
                    DampedSystem { linearization: &good, lambda: 0.0 },
                ],
                DampingScaling::Identity,
            );
            assert_eq!(results.len(), 3);
            assert!(results[1].is_err(), "{solver_type}");
            let first = results[0].as_ref().map_err(|e| e.to_string())?;
            let third = results[2].as_ref().map_err(|e| e.to_string())?;
            let alone = solver.solve_step(&good, 0.0, DampingScaling::Identity)?;
            assert!((first - &alone).norm() < TOLERANCE);
            assert!((third - &alone).norm() < TOLERANCE);
        }
        Ok(())
    }

    #[test]
    fn test_solve_system_matrix_rhs() -> TestResult {
        let lin = well_conditioned(LinearizationKind::Dense);
        let j = lin.jacobian_dense();
        let h = j.tr_mul(&j);
        let rhs = DMatrix::from_fn(3, 2, |i, k| (i as f64) - (k as f64) * 0.5);
        for solver_type in all_types() {
            let lin = well_conditioned(solver_type.linearization_kind());
            let x = solver_type
                .create()
                .solve_system(&lin, 0.0, DampingScaling::Identity, &rhs)?;
            assert!((&h * x - &rhs).norm() < 1e-8, "{solver_type}");
        }
        Ok(())
    }

    #[test]
    fn test_rhs_dimension_checked() {
        let lin = well_conditioned(LinearizationKind::Dense);
        let rhs = DMatrix::zeros(2, 1);
        for solver_type in all_types() {
            let result =
                solver_type
                    .create()
                    .solve_system(&lin, 0.0, DampingScaling::Identity, &rhs);
            assert!(matches!(result, Err(LinAlgError::DimensionMismatch(_))));
        }
    }
}
