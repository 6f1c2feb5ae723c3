//! Implicit differentiation at the optimized point.
//!
//! At a stationary point `φ(x, θ) = Jᵀr = 0`. Differentiating that condition with the
//! Gauss-Newton approximation `∂φ/∂x ≈ JᵀJ` gives `∂x/∂θ = -(JᵀJ)⁻¹ ∂φ/∂θ`, where
//! `∂φ/∂θ = Jᵀ R_θ + (∂J/∂θ)ᵀ r`. For an upstream gradient `g`
//!
//! ```text
//! v   = (JᵀJ)⁻¹ g
//! ∇θ  = -(∂φ/∂θ)ᵀ v
//! ```
//!
//! The result does not depend on how the optimizer got there, so the initial values get a
//! zero gradient.

use super::{BackwardContext, BackwardMode, BackwardStrategy, column, stationarity_input_derivative};
use crate::error::DiffOptResult;
use crate::optimizer::OptimizationStatus;
use nalgebra::DVector;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct ImplicitBackward;

impl BackwardStrategy for ImplicitBackward {
    fn mode(&self) -> BackwardMode {
        BackwardMode::Implicit
    }

    fn backward_element(
        &self,
        ctx: &mut BackwardContext<'_>,
        b: usize,
        upstream: &DVector<f64>,
    ) -> DiffOptResult<DVector<f64>> {
        if ctx.info.statuses.get(b) == Some(&OptimizationStatus::MaxIterations) {
            debug!("batch element {b} did not converge, implicit gradient is approximate");
        }

        let objective = &mut *ctx.objective;
        let aux_total = objective.aux_layout().total;
        let n = objective.optim_layout().total;
        let mut gradient = DVector::zeros(aux_total + n);
        if aux_total == 0 {
            return Ok(gradient);
        }

        let (linearizer, solver) = ctx.backend.parts_mut();
        let linearization = linearizer.linearize(objective, b)?;
        let v = solver.solve_system(&linearization, 0.0, ctx.damping_scaling, &column(upstream))?;
        let input_derivative = stationarity_input_derivative(linearizer, objective, b, None)?;
        let aux_gradient = -input_derivative.tr_mul(&v);
        gradient.rows_mut(0, aux_total).copy_from(&aux_gradient.column(0));
        Ok(gradient)
    }
}
