//! Differentiation through the recorded optimizer iterations.
//!
//! Every accepted step `x⁺ = x ⊕ Δ` solves `(JᵀJ + λD) Δ = -Jᵀr`, so it zeroes
//! `φ(x, θ, Δ) = Jᵀr + (JᵀJ + λD) Δ`. Differentiating that condition with the
//! Gauss-Newton approximation `∂φ/∂x ≈ JᵀJ` and constant damping `λ` carries the
//! sensitivity `S = ∂x/∂[θ | x₀]` forward from step to step:
//!
//! ```text
//! ∂Δ = -(JᵀJ + λD)⁻¹ (JᵀJ S + ∂φ/∂θ [I | 0])
//! S⁺ = T_x S + T_Δ ∂Δ            (per variable block)
//! ```
//!
//! `∂φ/∂θ` is taken by central differences, so it includes how `J` and `D` move with the
//! inputs. `T_x` and `T_Δ` are the Jacobians of the retraction. The returned input gradient
//! is `Sᵀ g` for the upstream gradient `g`.

use super::{
    BackwardContext, BackwardError, BackwardMode, BackwardStrategy, ReplayedStep,
    stationarity_input_derivative,
};
use crate::error::DiffOptResult;
use crate::linalg::DampingScaling;
use crate::manifold::ManifoldElement;
use crate::optimizer::TrajectoryStep;
use nalgebra::{DMatrix, DVector};

/// Unrolled differentiation, optionally restricted to the last `window` accepted steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnrollBackward {
    window: Option<usize>,
}

impl UnrollBackward {
    pub fn full() -> Self {
        Self { window: None }
    }

    /// Only the last `k` accepted steps carry sensitivity. Earlier steps are treated as
    /// constants, so the initial values receive a zero gradient unless the window covers the
    /// whole run.
    pub fn truncated(k: usize) -> Self {
        Self { window: Some(k) }
    }

    /// Replay `steps` for element `b` and return the final sensitivity `S`.
    fn sensitivity(
        &self,
        ctx: &mut BackwardContext<'_>,
        b: usize,
        steps: &[TrajectoryStep],
        scaling: DampingScaling,
    ) -> DiffOptResult<DMatrix<f64>> {
        let objective = &mut *ctx.objective;
        let aux_total = objective.aux_layout().total;
        let layout = objective.optim_layout();
        let n = layout.total;

        let start = self.window.map_or(0, |k| steps.len().saturating_sub(k));
        let mut sensitivity = DMatrix::zeros(n, aux_total + n);
        if start == 0 {
            sensitivity.view_mut((0, aux_total), (n, n)).fill_with_identity();
        }

        let (linearizer, solver) = ctx.backend.parts_mut();
        let convention = linearizer.convention();
        for step in &steps[start..] {
            objective.set_optim_element(b, &step.values);
            let linearization = linearizer.linearize(objective, b)?;
            let replayed = ReplayedStep {
                delta: &step.delta,
                lambda: step.lambda,
                scaling,
            };
            let input_derivative =
                stationarity_input_derivative(linearizer, objective, b, Some(&replayed))?;

            let mut rhs = linearization.tr_mul(&linearization.mul(&sensitivity));
            if aux_total > 0 {
                let mut aux_columns = rhs.columns_mut(0, aux_total);
                aux_columns += &input_derivative;
            }
            let step_sensitivity =
                solver.solve_system(&linearization, step.lambda, scaling, &(-rhs))?;

            let mut next = DMatrix::zeros(n, aux_total + n);
            for (k, value) in step.values.iter().enumerate() {
                let range = layout.range(k);
                let delta = step.delta.rows(range.start, range.len()).into_owned();
                let (transport_value, transport_delta) =
                    value.retract_jacobians(&delta, convention)?;
                let block = transport_value * sensitivity.rows(range.start, range.len())
                    + transport_delta * step_sensitivity.rows(range.start, range.len());
                next.rows_mut(range.start, range.len()).copy_from(&block);
            }
            sensitivity = next;
        }
        Ok(sensitivity)
    }
}

impl BackwardStrategy for UnrollBackward {
    fn mode(&self) -> BackwardMode {
        match self.window {
            Some(k) => BackwardMode::Truncated(k),
            None => BackwardMode::Unroll,
        }
    }

    fn backward_element(
        &self,
        ctx: &mut BackwardContext<'_>,
        b: usize,
        upstream: &DVector<f64>,
    ) -> DiffOptResult<DVector<f64>> {
        let info = ctx.info;
        let Some(trajectory) = info.trajectory.as_ref() else {
            return Err(BackwardError::MissingTrajectory(
                "the forward run did not record its iterations".to_string(),
            )
            .log()
            .into());
        };
        if trajectory.structure_version != ctx.objective.structure_version() {
            return Err(BackwardError::MissingTrajectory(format!(
                "trajectory was recorded for structure version {}, objective is at {}",
                trajectory.structure_version,
                ctx.objective.structure_version()
            ))
            .log()
            .into());
        }
        if trajectory.convention != ctx.backend.linearizer().convention() {
            return Err(BackwardError::MissingTrajectory(
                "trajectory was recorded with a different tangent convention".to_string(),
            )
            .log()
            .into());
        }
        let Some(steps) = trajectory.steps.get(b) else {
            return Err(BackwardError::ShapeMismatch(format!(
                "trajectory has no steps for batch element {b}"
            ))
            .log()
            .into());
        };

        let final_values: Vec<ManifoldElement> = ctx.objective.optim_element(b);
        let sensitivity = self.sensitivity(ctx, b, steps, trajectory.damping_scaling);
        ctx.objective.set_optim_element(b, &final_values);
        Ok(sensitivity?.tr_mul(upstream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backward::{Gradients, ImplicitBackward};
    use crate::optimizer::{GaussNewton, GaussNewtonConfig, Optimizer};
    use crate::testing::se2_loop;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-9;

    fn upstream(objective: &crate::core::objective::Objective) -> Gradients {
        let mut upstream = Gradients::new();
        let batch_size = objective.batch_size();
        upstream.insert(
            "x3".to_string(),
            vec![DVector::from_vec(vec![1.0, -0.5, 2.0]); batch_size],
        );
        upstream.insert(
            "x1".to_string(),
            vec![DVector::from_vec(vec![0.0, 1.0, 0.0]); batch_size],
        );
        upstream
    }

    #[test]
    fn test_unroll_matches_implicit_at_convergence() -> TestResult {
        let mut objective = se2_loop(2, 7, 0.2)?;
        let mut optimizer = GaussNewton::with_config(
            GaussNewtonConfig::new()
                .with_max_iterations(40)
                .with_track_trajectory(true),
        );
        let info = optimizer.optimize(&mut objective)?;
        let scaling = optimizer.config().damping_scaling;
        let upstream = upstream(&objective);
        let before = objective.optim_values();

        let mut ctx = BackwardContext::new(&mut objective, &info, optimizer.backend(), scaling);
        let unrolled = UnrollBackward::full().backward(&mut ctx, &upstream)?;
        let implicit = ImplicitBackward.backward(&mut ctx, &upstream)?;

        assert_eq!(objective.optim_values(), before);
        assert_eq!(unrolled["odom"].len(), 2);
        for (u, i) in unrolled["odom"].iter().zip(&implicit["odom"]) {
            assert!(i.norm() > 1e-3);
            assert!((u - i).norm() < 1e-3 * i.norm(), "unroll {u} vs implicit {i}");
        }
        Ok(())
    }

    #[test]
    fn test_wide_window_equals_full_unroll() -> TestResult {
        let mut objective = se2_loop(1, 2, 0.3)?;
        let mut optimizer =
            GaussNewton::with_config(GaussNewtonConfig::new().with_track_trajectory(true));
        let info = optimizer.optimize(&mut objective)?;
        let scaling = optimizer.config().damping_scaling;
        let upstream = upstream(&objective);

        let mut ctx = BackwardContext::new(&mut objective, &info, optimizer.backend(), scaling);
        let full = UnrollBackward::full().backward(&mut ctx, &upstream)?;
        let wide = UnrollBackward::truncated(1000).backward(&mut ctx, &upstream)?;
        let last = UnrollBackward::truncated(1).backward(&mut ctx, &upstream)?;
        for (name, gradients) in &full {
            for (g, w) in gradients.iter().zip(&wide[name]) {
                assert!((g - w).norm() < TOLERANCE, "{name}");
            }
        }
        // a single-step window keeps the initial values constant
        assert!(last["x0"][0].norm() < TOLERANCE);
        assert!(last["odom"][0].norm() > 0.0);
        Ok(())
    }

    #[test]
    fn test_initial_values_pass_through_without_steps() -> TestResult {
        let mut objective = se2_loop(1, 0, 0.0)?;
        let mut optimizer =
            GaussNewton::with_config(GaussNewtonConfig::new().with_track_trajectory(true));
        let info = optimizer.optimize(&mut objective)?;
        assert_eq!(info.iterations, vec![0]);
        let scaling = optimizer.config().damping_scaling;
        let upstream = upstream(&objective);

        let mut ctx = BackwardContext::new(&mut objective, &info, optimizer.backend(), scaling);
        let gradients = UnrollBackward::full().backward(&mut ctx, &upstream)?;
        assert_eq!(gradients["x3"][0], upstream["x3"][0]);
        assert_eq!(gradients["x0"][0], DVector::zeros(3));
        assert_eq!(gradients["odom"][0], DVector::zeros(3));
        Ok(())
    }

    #[test]
    fn test_missing_trajectory() -> TestResult {
        let mut objective = se2_loop(1, 0, 0.2)?;
        let mut optimizer = GaussNewton::new();
        let info = optimizer.optimize(&mut objective)?;
        let scaling = optimizer.config().damping_scaling;
        let upstream = upstream(&objective);

        let mut ctx = BackwardContext::new(&mut objective, &info, optimizer.backend(), scaling);
        let result = UnrollBackward::full().backward(&mut ctx, &upstream);
        assert!(matches!(
            result,
            Err(crate::error::DiffOptError::Backward(BackwardError::MissingTrajectory(_)))
        ));
        Ok(())
    }
}
