//! Dense backends on nalgebra factorizations.
//!
//! Both solvers are stateless between calls, so their batch solve runs every element
//! independently (in parallel with the `parallel` feature).

use crate::linalg::{
    DampedSystem, DampingScaling, LinAlgError, LinAlgResult, LinearSolver, LinearSolverType,
    check_solution, check_system, dense_augmented_normal_matrix,
};
use crate::linearization::Linearization;
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

fn cholesky_solve(
    linearization: &Linearization,
    lambda: f64,
    scaling: DampingScaling,
    rhs: &DMatrix<f64>,
) -> LinAlgResult<DMatrix<f64>> {
    check_system(linearization, lambda, rhs)?;
    let normal = dense_augmented_normal_matrix(linearization, lambda, scaling);
    let cholesky = normal.cholesky().ok_or_else(|| {
        LinAlgError::SingularSystem(format!(
            "normal matrix ({n}x{n}, λ = {lambda:e}) is not positive definite",
            n = linearization.ncols()
        ))
        .log()
    })?;
    let solution = cholesky.solve(rhs);
    check_solution(&solution, "dense Cholesky solve")?;
    Ok(solution)
}

fn lu_solve(
    linearization: &Linearization,
    lambda: f64,
    scaling: DampingScaling,
    rhs: &DMatrix<f64>,
) -> LinAlgResult<DMatrix<f64>> {
    check_system(linearization, lambda, rhs)?;
    let normal = dense_augmented_normal_matrix(linearization, lambda, scaling);
    let solution = normal.lu().solve(rhs).ok_or_else(|| {
        LinAlgError::SingularSystem(format!(
            "LU factorization of the normal matrix ({n}x{n}, λ = {lambda:e}) has a zero pivot",
            n = linearization.ncols()
        ))
        .log()
    })?;
    check_solution(&solution, "dense LU solve")?;
    Ok(solution)
}

type DenseSolveFn =
    fn(&Linearization, f64, DampingScaling, &DMatrix<f64>) -> LinAlgResult<DMatrix<f64>>;

fn solve_batch_with(
    solve: DenseSolveFn,
    systems: &[DampedSystem<'_>],
    scaling: DampingScaling,
) -> Vec<LinAlgResult<DVector<f64>>> {
    #[cfg(feature = "parallel")]
    let iter = systems.par_iter();

    #[cfg(not(feature = "parallel"))]
    let iter = systems.iter();

    iter.map(|system| {
        let gradient = system.linearization.gradient();
        let rhs = DMatrix::from_iterator(gradient.len(), 1, gradient.iter().map(|g| -g));
        let solution = solve(system.linearization, system.lambda, scaling, &rhs)?;
        Ok(solution.column(0).into_owned())
    })
    .collect()
}

/// Cholesky factorization of the dense normal matrix.
#[derive(Debug, Clone, Default)]
pub struct DenseCholeskySolver;

impl DenseCholeskySolver {
    pub fn new() -> Self {
        DenseCholeskySolver
    }
}

impl LinearSolver for DenseCholeskySolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::DenseCholesky
    }

    fn solve_system(
        &mut self,
        linearization: &Linearization,
        lambda: f64,
        scaling: DampingScaling,
        rhs: &DMatrix<f64>,
    ) -> LinAlgResult<DMatrix<f64>> {
        cholesky_solve(linearization, lambda, scaling, rhs)
    }

    fn solve_batch(
        &mut self,
        systems: &[DampedSystem<'_>],
        scaling: DampingScaling,
    ) -> Vec<LinAlgResult<DVector<f64>>> {
        solve_batch_with(cholesky_solve, systems, scaling)
    }
}

/// LU factorization with partial pivoting of the dense normal matrix.
///
/// Slower than Cholesky but does not require positive definiteness, so it still solves
/// systems that are symmetric indefinite through round-off.
#[derive(Debug, Clone, Default)]
pub struct DenseLuSolver;

impl DenseLuSolver {
    pub fn new() -> Self {
        DenseLuSolver
    }
}

impl LinearSolver for DenseLuSolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::DenseLu
    }

    fn solve_system(
        &mut self,
        linearization: &Linearization,
        lambda: f64,
        scaling: DampingScaling,
        rhs: &DMatrix<f64>,
    ) -> LinAlgResult<DMatrix<f64>> {
        lu_solve(linearization, lambda, scaling, rhs)
    }

    fn solve_batch(
        &mut self,
        systems: &[DampedSystem<'_>],
        scaling: DampingScaling,
    ) -> Vec<LinAlgResult<DVector<f64>>> {
        solve_batch_with(lu_solve, systems, scaling)
    }
}
