//! The residual model interface.
//!
//! A [`CostFunction`] maps the values of its optimization variables (and fixed auxiliary
//! variables such as measurements) to a residual vector of fixed dimension. The optimizer
//! never looks inside; it only asks for residuals and Jacobians.
//!
//! # Jacobian layout
//!
//! The Jacobian returned by [`CostFunction::evaluate`] has `dimension()` rows and one
//! column block per optimization variable, in the order the variables were passed to
//! [`Objective::add`](crate::core::objective::Objective::add). Each block has
//! `tangent_dim` columns and is expressed with right perturbations `x ⊕ δ = x ∘ exp(δ)`,
//! whatever tangent convention the optimizer is configured with.
//!
//! # Example
//!
//! ```
//! use apex_diffopt::core::{CoreResult, cost_function::CostFunction};
//! use apex_diffopt::manifold::ManifoldElement;
//! use nalgebra::{DMatrix, DVector};
//!
//! /// r = x - target for a 2-vector x.
//! struct Target(DVector<f64>);
//!
//! impl CostFunction for Target {
//!     fn dimension(&self) -> usize {
//!         2
//!     }
//!
//!     fn evaluate(
//!         &self,
//!         optim: &[&ManifoldElement],
//!         _aux: &[&ManifoldElement],
//!         compute_jacobian: bool,
//!     ) -> CoreResult<(DVector<f64>, Option<DMatrix<f64>>)> {
//!         let residual = optim[0].to_vector() - &self.0;
//!         let jacobian = compute_jacobian.then(|| DMatrix::identity(2, 2));
//!         Ok((residual, jacobian))
//!     }
//! }
//! ```

use crate::core::{CoreError, CoreResult};
use crate::manifold::ManifoldElement;
use crate::utils::{DEFAULT_FD_STEP, numeric_jacobian};
use nalgebra::{DMatrix, DVector};

pub trait CostFunction: Send + Sync {
    /// Diagnostic name used in logs and error messages.
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Residual dimension.
    fn dimension(&self) -> usize;

    /// Expected tangent dimension of each optimization variable, when the cost has a
    /// fixed signature. Checked by the objective when the cost is registered.
    fn optim_tangent_dims(&self) -> Option<Vec<usize>> {
        None
    }

    /// Expected tangent dimension of each auxiliary variable.
    fn aux_tangent_dims(&self) -> Option<Vec<usize>> {
        None
    }

    /// Residual and, when `compute_jacobian` is set, its Jacobian with respect to the
    /// optimization variables.
    fn evaluate(
        &self,
        optim: &[&ManifoldElement],
        aux: &[&ManifoldElement],
        compute_jacobian: bool,
    ) -> CoreResult<(DVector<f64>, Option<DMatrix<f64>>)>;

    /// Analytic Jacobian of the residual with respect to the auxiliary variables.
    ///
    /// Returns `None` when the cost has no closed form; central differences are used then.
    fn aux_jacobian(
        &self,
        _optim: &[&ManifoldElement],
        _aux: &[&ManifoldElement],
    ) -> Option<CoreResult<DMatrix<f64>>> {
        None
    }
}

/// Residual and optimization Jacobian with the shape checks the optimizer relies on.
pub(crate) fn evaluate_checked(
    cost: &dyn CostFunction,
    optim: &[&ManifoldElement],
    aux: &[&ManifoldElement],
) -> CoreResult<(DVector<f64>, DMatrix<f64>)> {
    let (residual, jacobian) = cost.evaluate(optim, aux, true)?;
    let jacobian = jacobian.ok_or_else(|| {
        CoreError::ShapeMismatch(format!(
            "cost '{}' returned no Jacobian although one was requested",
            cost.name()
        ))
        .log()
    })?;
    let cols: usize = optim.iter().map(|v| v.tangent_dim()).sum();
    if residual.len() != cost.dimension() || jacobian.shape() != (cost.dimension(), cols) {
        return Err(CoreError::ShapeMismatch(format!(
            "cost '{}' returned residual of size {} and Jacobian {:?}, expected {} and {:?}",
            cost.name(),
            residual.len(),
            jacobian.shape(),
            cost.dimension(),
            (cost.dimension(), cols)
        ))
        .log());
    }
    Ok((residual, jacobian))
}

/// Residual only, with the size check.
pub(crate) fn evaluate_residual(
    cost: &dyn CostFunction,
    optim: &[&ManifoldElement],
    aux: &[&ManifoldElement],
) -> CoreResult<DVector<f64>> {
    let (residual, _) = cost.evaluate(optim, aux, false)?;
    if residual.len() != cost.dimension() {
        return Err(CoreError::ShapeMismatch(format!(
            "cost '{}' returned residual of size {}, expected {}",
            cost.name(),
            residual.len(),
            cost.dimension()
        ))
        .log());
    }
    Ok(residual)
}

/// Jacobian of the residual with respect to the auxiliary variables, analytic when the
/// cost provides one, otherwise by central differences on the auxiliary tangent spaces.
pub fn aux_jacobian(
    cost: &dyn CostFunction,
    optim: &[&ManifoldElement],
    aux: &[&ManifoldElement],
) -> CoreResult<DMatrix<f64>> {
    let cols: usize = aux.iter().map(|v| v.tangent_dim()).sum();
    let jacobian = match cost.aux_jacobian(optim, aux) {
        Some(result) => result?,
        None => numeric_jacobian(aux, DEFAULT_FD_STEP, |perturbed| {
            evaluate_residual(cost, optim, perturbed)
        })?,
    };
    if jacobian.shape() != (cost.dimension(), cols) {
        return Err(CoreError::ShapeMismatch(format!(
            "cost '{}' auxiliary Jacobian is {:?}, expected {:?}",
            cost.name(),
            jacobian.shape(),
            (cost.dimension(), cols)
        ))
        .log());
    }
    Ok(jacobian)
}
