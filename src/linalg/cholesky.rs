use faer::{
    Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::borrow::Cow;
use std::ops::Mul;
use tracing::debug;

use crate::linalg::{
    DampedSystem, DampingScaling, LinAlgError, LinAlgResult, LinearSolver, LinearSolverType,
    check_solution, check_system,
};
use crate::linearization::{JacobianStorage, Linearization, from_faer, to_faer};
use nalgebra::{DMatrix, DVector};

/// Identifies the sparsity pattern a symbolic factorization was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PatternKey {
    structure_version: u64,
    ncols: usize,
    nnz: usize,
}

/// Sparse Cholesky (LLᵀ) of the augmented normal matrix.
///
/// The symbolic analysis (elimination tree, fill-reducing ordering, supernodes) depends
/// only on the sparsity pattern of `JᵀJ + λD`, which is fixed for a given objective
/// structure: `D` is always stored on the full diagonal, even for `λ = 0`. It is therefore
/// computed once and reused until a linearization with a different structure version
/// arrives.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    symbolic_factorization: Option<(PatternKey, SymbolicLlt<usize>)>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver {
            symbolic_factorization: None,
        }
    }

    /// Structure version of the cached symbolic factorization.
    pub fn cached_version(&self) -> Option<u64> {
        self.symbolic_factorization
            .as_ref()
            .map(|(key, _)| key.structure_version)
    }

    fn symbolic_for(
        &mut self,
        structure_version: u64,
        hessian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<SymbolicLlt<usize>> {
        let key = PatternKey {
            structure_version,
            ncols: hessian.ncols(),
            nnz: hessian.compute_nnz(),
        };
        if let Some((cached_key, cached_sym)) = &self.symbolic_factorization
            && *cached_key == key
        {
            // SymbolicLlt is reference-counted, clone is O(1)
            return Ok(cached_sym.clone());
        }

        let new_sym = SymbolicLlt::try_new(hessian.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed("Symbolic Cholesky decomposition failed".to_string())
                .log_with_source(e)
        })?;
        debug!(
            "Symbolic Cholesky analysis for structure version {} ({} unknowns, {} non-zeros)",
            key.structure_version, key.ncols, key.nnz
        );
        self.symbolic_factorization = Some((key, new_sym.clone()));
        Ok(new_sym)
    }
}

/// Sparse copy of a dense matrix keeping every entry structurally, so the pattern only
/// depends on the shape.
pub(crate) fn dense_to_sparse(matrix: &DMatrix<f64>) -> LinAlgResult<SparseColMat<usize, f64>> {
    let mut triplets = Vec::with_capacity(matrix.nrows() * matrix.ncols());
    for col in 0..matrix.ncols() {
        for row in 0..matrix.nrows() {
            triplets.push(Triplet::new(row, col, matrix[(row, col)]));
        }
    }
    SparseColMat::try_new_from_triplets(matrix.nrows(), matrix.ncols(), &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to convert dense Jacobian".to_string())
            .log_with_source(e)
    })
}

/// Damped normal matrix and right-hand side of one batch element.
type PreparedSystem = (SparseColMat<usize, f64>, DMatrix<f64>);

fn sparse_jacobian(
    linearization: &Linearization,
) -> LinAlgResult<Cow<'_, SparseColMat<usize, f64>>> {
    match &linearization.jacobian {
        JacobianStorage::Sparse(j) => Ok(Cow::Borrowed(j)),
        JacobianStorage::Dense(j) => Ok(Cow::Owned(dense_to_sparse(j)?)),
    }
}

/// `JᵀJ + λ D` without densifying.
pub(crate) fn augmented_normal_matrix(
    linearization: &Linearization,
    lambda: f64,
    scaling: DampingScaling,
) -> LinAlgResult<SparseColMat<usize, f64>> {
    let jacobian = sparse_jacobian(linearization)?;
    let n = jacobian.ncols();

    let hessian = jacobian
        .as_ref()
        .transpose()
        .to_col_major()
        .map_err(|e| {
            LinAlgError::SparseMatrixCreation(
                "Failed to convert transposed Jacobian to column-major format".to_string(),
            )
            .log_with_source(e)
        })?
        .mul(jacobian.as_ref());

    let mut hessian_diagonal = DVector::zeros(n);
    for triplet in hessian.triplet_iter() {
        if triplet.row == triplet.col {
            hessian_diagonal[triplet.row] += *triplet.val;
        }
    }
    let damping = scaling.diagonal(&hessian_diagonal);

    let lambda_d_triplets: Vec<Triplet<usize, usize, f64>> = (0..n)
        .map(|i| Triplet::new(i, i, lambda * damping[i]))
        .collect();
    let lambda_d = SparseColMat::try_new_from_triplets(n, n, &lambda_d_triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create lambda*D matrix".to_string())
            .log_with_source(e)
    })?;

    Ok(&hessian + lambda_d)
}

fn numeric_solve(
    symbolic: SymbolicLlt<usize>,
    hessian: &SparseColMat<usize, f64>,
    rhs: &DMatrix<f64>,
) -> LinAlgResult<DMatrix<f64>> {
    let cholesky = Llt::try_new_with_symbolic(symbolic, hessian.as_ref(), Side::Lower).map_err(|e| {
        LinAlgError::SingularSystem("sparse normal matrix is not positive definite".to_string())
            .log_with_source(e)
    })?;
    let solution = from_faer(&cholesky.solve(to_faer(rhs)));
    check_solution(&solution, "sparse Cholesky solve")?;
    Ok(solution)
}

impl LinearSolver for SparseCholeskySolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::SparseCholesky
    }

    fn solve_system(
        &mut self,
        linearization: &Linearization,
        lambda: f64,
        scaling: DampingScaling,
        rhs: &DMatrix<f64>,
    ) -> LinAlgResult<DMatrix<f64>> {
        check_system(linearization, lambda, rhs)?;
        let hessian = augmented_normal_matrix(linearization, lambda, scaling)?;
        let symbolic = self.symbolic_for(linearization.structure_version, &hessian)?;
        numeric_solve(symbolic, &hessian, rhs)
    }

    /// Normal matrices and numeric factorizations run per element (in parallel with the
    /// `parallel` feature); the symbolic analysis is shared.
    fn solve_batch(
        &mut self,
        systems: &[DampedSystem<'_>],
        scaling: DampingScaling,
    ) -> Vec<LinAlgResult<DVector<f64>>> {
        let prepare = |system: &DampedSystem<'_>| -> LinAlgResult<PreparedSystem> {
            let gradient = system.linearization.gradient();
            let rhs = DMatrix::from_iterator(gradient.len(), 1, gradient.iter().map(|g| -g));
            check_system(system.linearization, system.lambda, &rhs)?;
            let hessian = augmented_normal_matrix(system.linearization, system.lambda, scaling)?;
            Ok((hessian, rhs))
        };

        #[cfg(feature = "parallel")]
        let prepared: Vec<_> = systems.par_iter().map(prepare).collect();

        #[cfg(not(feature = "parallel"))]
        let prepared: Vec<_> = systems.iter().map(prepare).collect();

        let with_symbolic: Vec<LinAlgResult<_>> = prepared
            .into_iter()
            .zip(systems)
            .map(|(prepared, system)| {
                let (hessian, rhs) = prepared?;
                let symbolic = self.symbolic_for(system.linearization.structure_version, &hessian)?;
                Ok((symbolic, hessian, rhs))
            })
            .collect();

        #[cfg(feature = "parallel")]
        let iter = with_symbolic.into_par_iter();

        #[cfg(not(feature = "parallel"))]
        let iter = with_symbolic.into_iter();

        iter.map(|item| {
            let (symbolic, hessian, rhs) = item?;
            let solution = numeric_solve(symbolic, &hessian, &rhs)?;
            Ok(solution.column(0).into_owned())
        })
        .collect()
    }
}
