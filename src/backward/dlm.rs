//! Direct loss minimization.
//!
//! The objective is perturbed by the upstream gradient, `E(x, θ) + ε gᵀx`, and re-solved
//! from the optimum with a single Gauss-Newton step. The input gradient is the finite
//! difference of `∂E/∂θ = R_θᵀ r` between the perturbed and the original solution:
//!
//! ```text
//! Δ    = -(JᵀJ)⁻¹ (Jᵀr + ε g)
//! x_ε  = x* ⊕ Δ
//! ∇θ   = (R_θᵀ r |x_ε  -  R_θᵀ r |x*) / ε
//! ```
//!
//! Cheap and trajectory-free, but biased by `ε`. Initial values get a zero gradient.

use super::{
    BackwardContext, BackwardMode, BackwardStrategy, DEFAULT_DLM_EPSILON, column, input_gradient,
};
use crate::error::DiffOptResult;
use crate::manifold::ManifoldElement;
use crate::optimizer::retract_element;
use nalgebra::DVector;

#[derive(Debug, Clone, Copy)]
pub struct DlmBackward {
    epsilon: f64,
}

impl Default for DlmBackward {
    fn default() -> Self {
        Self::new(DEFAULT_DLM_EPSILON)
    }
}

impl DlmBackward {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn aux_gradient(
        &self,
        ctx: &mut BackwardContext<'_>,
        b: usize,
        upstream: &DVector<f64>,
        optimum: &[ManifoldElement],
    ) -> DiffOptResult<DVector<f64>> {
        let objective = &mut *ctx.objective;
        let layout = objective.optim_layout();
        let (linearizer, solver) = ctx.backend.parts_mut();

        let linearization = linearizer.linearize(objective, b)?;
        let gradient_at_optimum = input_gradient(linearizer, objective, b)?;

        let rhs = -(linearization.gradient() + upstream * self.epsilon);
        let step = solver.solve_system(&linearization, 0.0, ctx.damping_scaling, &column(&rhs))?;
        let step = step.column(0).into_owned();
        let perturbed = retract_element(optimum, &step, &layout, linearizer.convention())?;

        objective.set_optim_element(b, &perturbed);
        let gradient_at_perturbed = input_gradient(linearizer, objective, b)?;
        Ok((gradient_at_perturbed - gradient_at_optimum) / self.epsilon)
    }
}

impl BackwardStrategy for DlmBackward {
    fn mode(&self) -> BackwardMode {
        BackwardMode::Dlm {
            epsilon: self.epsilon,
        }
    }

    fn backward_element(
        &self,
        ctx: &mut BackwardContext<'_>,
        b: usize,
        upstream: &DVector<f64>,
    ) -> DiffOptResult<DVector<f64>> {
        let aux_total = ctx.objective.aux_layout().total;
        let n = ctx.objective.optim_layout().total;
        let mut gradient = DVector::zeros(aux_total + n);
        if aux_total == 0 {
            return Ok(gradient);
        }

        let optimum = ctx.objective.optim_element(b);
        let aux_gradient = self.aux_gradient(ctx, b, upstream, &optimum);
        ctx.objective.set_optim_element(b, &optimum);
        gradient.rows_mut(0, aux_total).copy_from(&aux_gradient?);
        Ok(gradient)
    }
}
