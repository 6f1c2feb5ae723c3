//! Differentiation of an optimizer run with respect to the objective's inputs.
//!
//! The inputs of an objective are its auxiliary variables (measurements and learned
//! weights, in tangent coordinates at their current value) and the initial values of its
//! optimization variables. Given the gradient of a downstream loss with respect to the
//! optimized values (`upstream`), a [`BackwardStrategy`] returns the gradient with respect
//! to every input, keyed by variable name:
//!
//! | mode | needs trajectory | initial-value gradients |
//! |------|------------------|-------------------------|
//! | [`BackwardMode::Unroll`] | yes | exact through every step |
//! | [`BackwardMode::Truncated`] | yes | zero unless the window covers every step |
//! | [`BackwardMode::Implicit`] | no | zero |
//! | [`BackwardMode::Dlm`] | no | zero |
//!
//! Per batch element the inputs are stacked as `[aux columns | initial-value columns]`,
//! with the auxiliary columns in [`Objective::aux_layout`] order and the initial-value
//! columns in the optimization ordering.
//!
//! Implicit and unrolled differentiation both need how the stationarity condition
//! `Jᵀr = 0` moves with the inputs. Besides `Jᵀ R_θ` that derivative carries
//! `(∂J/∂θ)ᵀ r`, which is as large as the first term for a learned weight and nonzero for
//! a measurement whenever the residual at the solution is. Cost functions only provide
//! first derivatives, so [`stationarity_input_derivative`] takes central differences of
//! the gradient over the auxiliary tangent coordinates.

pub mod dlm;
pub mod implicit;
pub mod unroll;

pub use dlm::DlmBackward;
pub use implicit::ImplicitBackward;
pub use unroll::UnrollBackward;

use crate::core::objective::{Objective, VariableRole};
use crate::error::DiffOptResult;
use crate::linalg::DampingScaling;
use crate::linearization::{Linearization, Linearizer};
use crate::manifold::ManifoldElement;
use crate::optimizer::{OptimizerInfo, SolverBackend};
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tracing::{debug, error};

/// Gradients keyed by variable name, one tangent vector per batch element.
pub type Gradients = HashMap<String, Vec<DVector<f64>>>;

/// Perturbation size of [`BackwardMode::Dlm`] when none is given.
pub const DEFAULT_DLM_EPSILON: f64 = 1e-2;

/// Central-difference step in auxiliary tangent coordinates.
const INPUT_DIFFERENCE_STEP: f64 = 1e-6;

/// Backward differentiation error types
#[derive(Debug, Clone, Error)]
pub enum BackwardError {
    /// Unrolled differentiation without a usable recorded trajectory
    #[error("Missing trajectory: {0}")]
    MissingTrajectory(String),

    /// Upstream gradient for a name that is not an optimization variable
    #[error("Unknown output variable: {0}")]
    UnknownOutput(String),

    /// Upstream gradient of the wrong batch size or tangent dimension
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
}

impl BackwardError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Which strategy differentiates the optimizer.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum BackwardMode {
    /// Differentiate every accepted iteration
    #[default]
    Unroll,
    /// Implicit function theorem at the final point
    Implicit,
    /// Unroll only the last `k` accepted iterations
    Truncated(usize),
    /// Direct loss minimization with perturbation `epsilon`
    Dlm { epsilon: f64 },
}

impl BackwardMode {
    pub fn dlm() -> Self {
        BackwardMode::Dlm {
            epsilon: DEFAULT_DLM_EPSILON,
        }
    }

    /// Whether the forward run has to record its trajectory for this mode.
    pub fn needs_trajectory(&self) -> bool {
        matches!(self, BackwardMode::Unroll | BackwardMode::Truncated(_))
    }

    pub fn strategy(&self) -> Box<dyn BackwardStrategy> {
        match *self {
            BackwardMode::Unroll => Box::new(UnrollBackward::full()),
            BackwardMode::Truncated(k) => Box::new(UnrollBackward::truncated(k)),
            BackwardMode::Implicit => Box::new(ImplicitBackward),
            BackwardMode::Dlm { epsilon } => Box::new(DlmBackward::new(epsilon)),
        }
    }
}

impl Display for BackwardMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BackwardMode::Unroll => write!(f, "unroll"),
            BackwardMode::Implicit => write!(f, "implicit"),
            BackwardMode::Truncated(k) => write!(f, "truncated({k})"),
            BackwardMode::Dlm { epsilon } => write!(f, "dlm(ε = {epsilon:e})"),
        }
    }
}

/// Everything a strategy needs: the objective at its optimized values, the run that
/// produced them and the optimizer's linearizer and solver.
pub struct BackwardContext<'a> {
    pub objective: &'a mut Objective,
    pub info: &'a OptimizerInfo,
    pub backend: &'a mut SolverBackend,
    pub damping_scaling: DampingScaling,
}

impl<'a> BackwardContext<'a> {
    pub fn new(
        objective: &'a mut Objective,
        info: &'a OptimizerInfo,
        backend: &'a mut SolverBackend,
        damping_scaling: DampingScaling,
    ) -> Self {
        Self {
            objective,
            info,
            backend,
            damping_scaling,
        }
    }
}

/// Backward pass of one strategy.
pub trait BackwardStrategy: Send + Sync {
    fn mode(&self) -> BackwardMode;

    /// Gradient of element `b` with respect to its stacked inputs, given the stacked
    /// upstream gradient of its optimization variables.
    fn backward_element(
        &self,
        ctx: &mut BackwardContext<'_>,
        b: usize,
        upstream: &DVector<f64>,
    ) -> DiffOptResult<DVector<f64>>;

    /// Gradients with respect to every input, keyed by variable name.
    fn backward(
        &self,
        ctx: &mut BackwardContext<'_>,
        upstream: &Gradients,
    ) -> DiffOptResult<Gradients> {
        let batch_size = ctx.objective.batch_size();
        if ctx.info.batch_size() != batch_size {
            return Err(BackwardError::ShapeMismatch(format!(
                "optimizer info has {} batch elements, objective has {batch_size}",
                ctx.info.batch_size()
            ))
            .log()
            .into());
        }
        let stacked = stack_upstream(ctx.objective, upstream)?;
        debug!("{} backward over {batch_size} batch elements", self.mode());

        let mut per_element = Vec::with_capacity(batch_size);
        for (b, upstream) in stacked.iter().enumerate() {
            per_element.push(self.backward_element(ctx, b, upstream)?);
        }
        Ok(scatter(ctx.objective, &per_element))
    }
}

/// Upstream gradients stacked per batch element in the optimization ordering; missing
/// outputs count as zero.
pub(crate) fn stack_upstream(
    objective: &Objective,
    upstream: &Gradients,
) -> Result<Vec<DVector<f64>>, BackwardError> {
    for name in upstream.keys() {
        if objective.role(name) != Some(VariableRole::Optimization) {
            return Err(BackwardError::UnknownOutput(name.clone()).log());
        }
    }

    let batch_size = objective.batch_size();
    let layout = objective.optim_layout();
    let mut stacked = vec![DVector::zeros(layout.total); batch_size];
    for (k, variable) in objective.optim_variables().enumerate() {
        let Some(gradients) = upstream.get(variable.name()) else {
            continue;
        };
        if gradients.len() != batch_size {
            return Err(BackwardError::ShapeMismatch(format!(
                "upstream gradient of '{}' has {} batch elements, expected {batch_size}",
                variable.name(),
                gradients.len()
            ))
            .log());
        }
        for (b, gradient) in gradients.iter().enumerate() {
            if gradient.len() != layout.dims[k] {
                return Err(BackwardError::ShapeMismatch(format!(
                    "upstream gradient of '{}' has dimension {}, expected {}",
                    variable.name(),
                    gradient.len(),
                    layout.dims[k]
                ))
                .log());
            }
            stacked[b].rows_mut(layout.offsets[k], layout.dims[k]).copy_from(gradient);
        }
    }
    Ok(stacked)
}

/// Split stacked per-element input gradients by variable. An auxiliary variable holding a
/// single broadcast value receives the sum over the batch.
pub(crate) fn scatter(objective: &Objective, per_element: &[DVector<f64>]) -> Gradients {
    let aux_layout = objective.aux_layout();
    let optim_layout = objective.optim_layout();
    let mut gradients = Gradients::new();

    for (k, variable) in objective.aux_variables().enumerate() {
        let (offset, dim) = (aux_layout.offsets[k], aux_layout.dims[k]);
        let rows = per_element.iter().map(|g| g.rows(offset, dim).into_owned());
        let values = if variable.batch_size() == 1 {
            vec![rows.fold(DVector::zeros(dim), |sum, g| sum + g)]
        } else {
            rows.collect()
        };
        gradients.insert(variable.name().to_string(), values);
    }

    for (k, variable) in objective.optim_variables().enumerate() {
        let (offset, dim) = (aux_layout.total + optim_layout.offsets[k], optim_layout.dims[k]);
        let values = per_element
            .iter()
            .map(|g| g.rows(offset, dim).into_owned())
            .collect();
        gradients.insert(variable.name().to_string(), values);
    }
    gradients
}

/// `R_θᵀ r` at the objective's current values of element `b`: the gradient of the
/// element's error with respect to the auxiliary inputs.
pub(crate) fn input_gradient(
    linearizer: &mut Linearizer,
    objective: &Objective,
    b: usize,
) -> DiffOptResult<DVector<f64>> {
    let linearization = linearizer.linearize(objective, b)?;
    let input_jacobian = linearizer.input_jacobian(objective, b)?;
    Ok(input_jacobian.tr_mul(&linearization.residual))
}

/// A recorded step `Δ` taken with damping `λ`. Replaying it, the stationarity condition of
/// the step is `Jᵀr + (JᵀJ + λD) Δ = 0`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReplayedStep<'a> {
    pub delta: &'a DVector<f64>,
    pub lambda: f64,
    pub scaling: DampingScaling,
}

/// `Jᵀr`, plus `(JᵀJ + λD) Δ` when replaying a step.
fn stationarity(linearization: &Linearization, step: Option<&ReplayedStep<'_>>) -> DVector<f64> {
    let mut value = linearization.gradient();
    if let Some(step) = step {
        let normal_delta = linearization.tr_mul(&linearization.mul(&column(step.delta)));
        value += normal_delta.column(0);
        if step.lambda > 0.0 {
            let damping = step.scaling.diagonal(&linearization.normal_diagonal());
            value += damping.component_mul(step.delta) * step.lambda;
        }
    }
    value
}

/// `∂φ/∂θ` of the stationarity function `φ` (see [`ReplayedStep`]) at the current values
/// of element `b`: one row per optimization column, one column per auxiliary tangent
/// coordinate. Auxiliary values are perturbed with the linearizer's convention, the same
/// coordinates `R_θ` uses, and restored before returning.
pub(crate) fn stationarity_input_derivative(
    linearizer: &mut Linearizer,
    objective: &mut Objective,
    b: usize,
    step: Option<&ReplayedStep<'_>>,
) -> DiffOptResult<DMatrix<f64>> {
    let aux_layout = objective.aux_layout();
    let n = objective.optim_layout().total;
    let mut derivative = DMatrix::zeros(n, aux_layout.total);

    for k in 0..aux_layout.dims.len() {
        let original = objective.aux_element(k, b)?.clone();
        let columns = perturbed_columns(linearizer, objective, b, k, &original, step);
        objective.set_aux_element(k, b, original);
        derivative
            .columns_mut(aux_layout.offsets[k], aux_layout.dims[k])
            .copy_from(&columns?);
    }
    Ok(derivative)
}

fn perturbed_columns(
    linearizer: &mut Linearizer,
    objective: &mut Objective,
    b: usize,
    k: usize,
    original: &ManifoldElement,
    step: Option<&ReplayedStep<'_>>,
) -> DiffOptResult<DMatrix<f64>> {
    let convention = linearizer.convention();
    let dim = original.tangent_dim();
    let mut columns = DMatrix::zeros(objective.optim_layout().total, dim);
    for i in 0..dim {
        let mut delta = DVector::zeros(dim);
        delta[i] = INPUT_DIFFERENCE_STEP;

        objective.set_aux_element(k, b, original.retract_with(&delta, convention)?);
        let forward = stationarity(&linearizer.linearize(objective, b)?, step);
        objective.set_aux_element(k, b, original.retract_with(&(-delta), convention)?);
        let backward = stationarity(&linearizer.linearize(objective, b)?, step);

        columns.set_column(i, &((forward - backward) / (2.0 * INPUT_DIFFERENCE_STEP)));
    }
    Ok(columns)
}

/// Single-column matrix holding `v`.
pub(crate) fn column(v: &DVector<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(v.len(), 1, v.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backward::{DlmBackward, ImplicitBackward, UnrollBackward};
    use crate::core::{cost_weight::CostWeight, variable::Variable};
    use crate::factors::DifferenceFactor;
    use crate::manifold::TangentConvention;
    use crate::optimizer::{GaussNewton, GaussNewtonConfig, Optimizer};
    use crate::testing::se2_loop;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-6;

    fn tight_config() -> GaussNewtonConfig {
        GaussNewtonConfig::new()
            .with_max_iterations(50)
            .with_abs_err_tolerance(0.0)
            .with_rel_err_tolerance(1e-15)
            .with_step_tolerance(1e-12)
    }

    /// Central difference of `gᵀx*` with respect to the auxiliary variable `name` of a
    /// single-element objective, solving again from the optimum at every perturbed input.
    /// The objective is left at its original values.
    fn resolved_input_gradient(
        objective: &mut Objective,
        name: &str,
        upstream: &Gradients,
        step: f64,
    ) -> Result<DVector<f64>, Box<dyn std::error::Error>> {
        let convention = TangentConvention::default();
        let stacked = stack_upstream(objective, upstream)?.remove(0);
        let optimum = objective.optim_value_map();
        let optimum_element = objective.optim_element(0);
        let original = objective.variable(name).ok_or("unknown input")?.value(0).clone();
        let dim = original.tangent_dim();
        let mut optimizer = GaussNewton::with_config(tight_config());

        let mut gradient = DVector::zeros(dim);
        for i in 0..dim {
            let mut solutions = Vec::with_capacity(2);
            for sign in [1.0, -1.0] {
                let mut delta = DVector::zeros(dim);
                delta[i] = sign * step;
                let mut values = optimum.clone();
                let perturbed = original.retract_with(&delta, convention)?;
                values.insert(name.to_string(), vec![perturbed]);
                objective.update(&values)?;
                optimizer.optimize(objective)?;
                solutions.push(objective.optim_element(0));
            }
            let mut difference = Vec::with_capacity(stacked.len());
            for ((x, plus), minus) in optimum_element.iter().zip(&solutions[0]).zip(&solutions[1]) {
                let change = x.local_with(plus, convention)? - x.local_with(minus, convention)?;
                difference.extend(change.iter());
            }
            gradient[i] = stacked.dot(&DVector::from_vec(difference)) / (2.0 * step);
        }

        let mut values = optimum;
        values.insert(name.to_string(), vec![original]);
        objective.update(&values)?;
        Ok(gradient)
    }

    /// Input gradients of `name` from implicit, full unroll and DLM on an objective
    /// already optimized by `optimizer` with trajectory tracking.
    fn strategy_gradients(
        objective: &mut Objective,
        optimizer: &mut GaussNewton,
        info: &OptimizerInfo,
        upstream: &Gradients,
        name: &str,
    ) -> Result<Vec<(BackwardMode, DVector<f64>)>, Box<dyn std::error::Error>> {
        let scaling = optimizer.config().damping_scaling;
        let mut ctx = BackwardContext::new(objective, info, optimizer.backend(), scaling);
        let strategies: [Box<dyn BackwardStrategy>; 3] = [
            Box::new(ImplicitBackward),
            Box::new(UnrollBackward::full()),
            Box::new(DlmBackward::new(1e-5)),
        ];
        let mut gradients = Vec::with_capacity(strategies.len());
        for strategy in &strategies {
            let gradient = strategy.backward(&mut ctx, upstream)?;
            gradients.push((strategy.mode(), gradient[name][0].clone()));
        }
        Ok(gradients)
    }

    #[test]
    fn test_mode_properties() {
        assert!(BackwardMode::Unroll.needs_trajectory());
        assert!(BackwardMode::Truncated(3).needs_trajectory());
        assert!(!BackwardMode::Implicit.needs_trajectory());
        assert!(!BackwardMode::dlm().needs_trajectory());
        assert_eq!(BackwardMode::default(), BackwardMode::Unroll);
        for mode in [
            BackwardMode::Unroll,
            BackwardMode::Truncated(2),
            BackwardMode::Implicit,
            BackwardMode::dlm(),
        ] {
            assert_eq!(mode.strategy().mode(), mode);
        }
        assert_eq!(BackwardMode::Truncated(4).to_string(), "truncated(4)");
    }

    #[test]
    fn test_upstream_validation() -> TestResult {
        let objective = se2_loop(2, 0, 0.1)?;

        let mut upstream = Gradients::new();
        upstream.insert("odom".to_string(), vec![DVector::zeros(3); 2]);
        assert!(matches!(
            stack_upstream(&objective, &upstream),
            Err(BackwardError::UnknownOutput(_))
        ));

        let mut upstream = Gradients::new();
        upstream.insert("x1".to_string(), vec![DVector::zeros(3)]);
        assert!(matches!(
            stack_upstream(&objective, &upstream),
            Err(BackwardError::ShapeMismatch(_))
        ));

        let mut upstream = Gradients::new();
        upstream.insert("x1".to_string(), vec![DVector::zeros(2); 2]);
        assert!(matches!(
            stack_upstream(&objective, &upstream),
            Err(BackwardError::ShapeMismatch(_))
        ));

        let mut upstream = Gradients::new();
        upstream.insert("x1".to_string(), vec![DVector::from_element(3, 1.0); 2]);
        let stacked = stack_upstream(&objective, &upstream)?;
        assert_eq!(stacked.len(), 2);
        assert_eq!(stacked[1].len(), 12);
        assert_eq!(stacked[1].rows(3, 3).sum(), 3.0);
        assert_eq!(stacked[1].sum(), 3.0);
        Ok(())
    }

    #[test]
    fn test_scatter_sums_broadcast_inputs() -> TestResult {
        let x = Variable::vector("x", &[&[1.0], &[2.0]])?;
        let t = Variable::single("t", ManifoldElement::vector(&[0.0]))?;
        let mut objective = Objective::new();
        objective.add(
            Box::new(DifferenceFactor::new(1)),
            &[&x],
            &[&t],
            CostWeight::identity(),
        )?;

        let per_element = vec![
            DVector::from_vec(vec![1.0, 10.0]),
            DVector::from_vec(vec![2.0, 20.0]),
        ];
        let gradients = scatter(&objective, &per_element);
        assert_eq!(gradients["t"], vec![DVector::from_element(1, 3.0)]);
        assert_eq!(
            gradients["x"],
            vec![DVector::from_element(1, 10.0), DVector::from_element(1, 20.0)]
        );
        Ok(())
    }

    #[test]
    fn test_learned_weight_gradient_matches_resolve() -> TestResult {
        // x* = c / (w² + 1) for ½(w(x - a))² + ½(x - c)² with a = 0, c = 1
        let x = Variable::vector("x", &[&[0.0]])?;
        let w = Variable::vector("w", &[&[2.0]])?;
        let mut objective = Objective::new();
        objective.add(
            Box::new(DifferenceFactor::with_target(ManifoldElement::vector(&[0.0]))),
            &[&x],
            &[],
            CostWeight::learned_scale(w)?,
        )?;
        objective.add(
            Box::new(DifferenceFactor::with_target(ManifoldElement::vector(&[1.0]))),
            &[&x],
            &[],
            CostWeight::identity(),
        )?;

        let mut optimizer = GaussNewton::with_config(tight_config().with_track_trajectory(true));
        let info = optimizer.optimize(&mut objective)?;
        assert!((objective.optim_element(0)[0].to_vector()[0] - 0.2).abs() < TOLERANCE);

        let mut upstream = Gradients::new();
        upstream.insert("x".to_string(), vec![DVector::from_element(1, 1.0)]);
        let gradients = strategy_gradients(&mut objective, &mut optimizer, &info, &upstream, "w")?;
        let resolved = resolved_input_gradient(&mut objective, "w", &upstream, 1e-5)?;

        // dx*/dw = -2wc / (w² + 1)²
        assert!((resolved[0] + 0.16).abs() < TOLERANCE, "re-solve {resolved}");
        for (mode, gradient) in &gradients {
            let tolerance = match mode {
                BackwardMode::Dlm { .. } => 1e-3,
                _ => TOLERANCE,
            };
            assert!((gradient[0] + 0.16).abs() < tolerance, "{mode}: {gradient}");
        }
        Ok(())
    }

    #[test]
    fn test_between_measurement_gradient_matches_resolve() -> TestResult {
        let mut objective = se2_loop(1, 0, 0.0)?;
        let exact = objective.variable("odom").ok_or("missing odom")?.value(0).clone();
        let biased = exact.retract(&DVector::from_vec(vec![0.1, -0.05, 0.08]))?;
        let mut values = HashMap::new();
        values.insert("odom".to_string(), vec![biased]);
        objective.update(&values)?;

        let mut optimizer = GaussNewton::with_config(tight_config().with_track_trajectory(true));
        let info = optimizer.optimize(&mut objective)?;
        let residual = crate::testing::stacked_residual(&objective, 0, &HashMap::new())?;
        assert!(residual.norm() > 1e-2, "the loop must disagree with the odometry");

        let mut upstream = Gradients::new();
        let toward_x3 = DVector::from_vec(vec![1.0, -0.5, 2.0]);
        let toward_x1 = DVector::from_vec(vec![0.0, 1.0, 0.0]);
        upstream.insert("x3".to_string(), vec![toward_x3]);
        upstream.insert("x1".to_string(), vec![toward_x1]);
        let gradients =
            strategy_gradients(&mut objective, &mut optimizer, &info, &upstream, "odom")?;
        let resolved = resolved_input_gradient(&mut objective, "odom", &upstream, 1e-4)?;

        // The Gauss-Newton Hessian leaves an error of the order of the residual.
        let tolerance = 4e-3 * resolved.norm();
        assert!(resolved.norm() > 0.1);
        for (mode, gradient) in &gradients {
            let error = (gradient - &resolved).norm();
            assert!(error < tolerance, "{mode}: {gradient} vs re-solve {resolved}");
        }
        Ok(())
    }
}
