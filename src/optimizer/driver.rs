//! Lockstep iteration shared by Gauss-Newton and Levenberg-Marquardt.

use super::{
    IterationStats, OptimizationStatus, OptimizerConfig, OptimizerError, OptimizerInfo,
    OptimizerType, SolverBackend, StepAttempt, Trajectory, TrajectoryStep,
};
use crate::core::{objective::Objective, ordering::ColumnLayout, variable::validate_values};
use crate::error::DiffOptResult;
use crate::linalg::DampedSystem;
use crate::linearization::Linearization;
use crate::manifold::{ManifoldElement, ManifoldResult, TangentConvention};
use nalgebra::DVector;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, info, warn};
use web_time::Instant;

/// Adaptive damping of Levenberg-Marquardt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DampingSchedule {
    pub initial: f64,
    pub min: f64,
    pub max: f64,
    pub increase: f64,
    pub decrease: f64,
    pub max_retries: usize,
}

/// How damping evolves and which steps are accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum StepPolicy {
    /// Constant regularization, every finite step accepted
    Fixed { lambda: f64 },
    /// Accept only non-increasing errors, adapt the damping
    Adaptive(DampingSchedule),
}

impl StepPolicy {
    fn initial_lambda(&self) -> f64 {
        match self {
            StepPolicy::Fixed { lambda } => *lambda,
            StepPolicy::Adaptive(schedule) => schedule.initial,
        }
    }

    fn accepts(&self, error_before: f64, candidate_error: f64) -> bool {
        match self {
            StepPolicy::Fixed { .. } => true,
            StepPolicy::Adaptive(_) => candidate_error <= error_before,
        }
    }

    /// Damping after an accepted step.
    fn relax(&self, lambda: f64) -> f64 {
        match self {
            StepPolicy::Fixed { .. } => lambda,
            StepPolicy::Adaptive(s) => (lambda / s.decrease).max(s.min),
        }
    }

    /// Damping for the retry after a rejected step, or why there is none.
    fn escalate(&self, lambda: f64, retries: usize) -> Result<f64, String> {
        match self {
            StepPolicy::Fixed { .. } => Err("no damping left to try".to_string()),
            StepPolicy::Adaptive(s) => {
                if lambda >= s.max {
                    Err(format!("damping reached its maximum {:.2e}", s.max))
                } else if retries >= s.max_retries {
                    Err(format!("{} damping retries exhausted", s.max_retries))
                } else {
                    Ok((lambda * s.increase).min(s.max))
                }
            }
        }
    }
}

/// Retract every variable of one batch element by its slice of `delta`.
pub(crate) fn retract_element(
    values: &[ManifoldElement],
    delta: &DVector<f64>,
    layout: &ColumnLayout,
    convention: TangentConvention,
) -> ManifoldResult<Vec<ManifoldElement>> {
    values
        .iter()
        .enumerate()
        .map(|(k, value)| {
            let range = layout.range(k);
            let step = delta.rows(range.start, range.len()).into_owned();
            value.retract_with(&step, convention)
        })
        .collect()
}

struct ElementState {
    status: Option<OptimizationStatus>,
    failure: Option<OptimizerError>,
    initial_error: f64,
    error: f64,
    best_error: f64,
    best_values: Vec<ManifoldElement>,
    lambda: f64,
    iterations: usize,
    history: Vec<f64>,
    attempts: Vec<StepAttempt>,
    steps: Vec<TrajectoryStep>,
}

impl ElementState {
    fn new(objective: &Objective, b: usize, lambda: f64) -> Self {
        let values = objective.optim_element(b);
        let (error, failure) = match objective.error(b) {
            Ok(e) if e.is_finite() => (e, None),
            Ok(e) => (e, Some(format!("initial error is {e}"))),
            Err(e) => (f64::INFINITY, Some(format!("initial error could not be evaluated: {e}"))),
        };
        let mut state = ElementState {
            status: None,
            failure: None,
            initial_error: error,
            error,
            best_error: error,
            best_values: values,
            lambda,
            iterations: 0,
            history: vec![error],
            attempts: Vec::new(),
            steps: Vec::new(),
        };
        if let Some(reason) = failure {
            warn!("batch element {b} failed: {reason}");
            state.status = Some(OptimizationStatus::Failed);
            state.failure = Some(OptimizerError::ConvergenceFailure(reason));
        }
        state
    }

    fn fail(&mut self, objective: &mut Objective, b: usize, reason: String) {
        warn!("batch element {b} failed: {reason}");
        objective.set_optim_element(b, &self.best_values);
        self.error = self.best_error;
        self.history.push(self.best_error);
        self.status = Some(OptimizationStatus::Failed);
        self.failure = Some(OptimizerError::ConvergenceFailure(reason));
    }
}

fn convergence_reason(
    config: &OptimizerConfig,
    error_before: f64,
    error: f64,
    step_norm: f64,
) -> Option<String> {
    if error < config.abs_err_tolerance {
        return Some(format!("error {error:.3e} below {:.1e}", config.abs_err_tolerance));
    }
    if error_before > 0.0 {
        let relative = (error_before - error).abs() / error_before;
        if relative < config.rel_err_tolerance {
            return Some(format!(
                "relative decrease {relative:.3e} below {:.1e}",
                config.rel_err_tolerance
            ));
        }
    }
    if step_norm < config.step_tolerance {
        return Some(format!(
            "step norm {step_norm:.3e} below {:.1e}",
            config.step_tolerance
        ));
    }
    None
}

/// Error of every listed element at the objective's current values; `None` when the
/// evaluation fails or is not finite.
fn evaluate_errors(objective: &Objective, elements: &[usize]) -> Vec<Option<f64>> {
    #[cfg(feature = "parallel")]
    let iter = elements.par_iter();

    #[cfg(not(feature = "parallel"))]
    let iter = elements.iter();

    iter.map(|&b| objective.error(b).ok().filter(|e| e.is_finite()))
        .collect()
}

/// Solve result of one pending element, prepared for the accept/reject decision.
struct Candidate {
    before: Vec<ManifoldElement>,
    delta: DVector<f64>,
}

pub(crate) fn run(
    optimizer: OptimizerType,
    config: &OptimizerConfig,
    policy: StepPolicy,
    backend: &mut SolverBackend,
    objective: &mut Objective,
) -> DiffOptResult<OptimizerInfo> {
    let start_time = Instant::now();

    config.validate()?;
    if objective.is_empty() || objective.ordering().is_empty() {
        return Err(OptimizerError::EmptyObjective.log().into());
    }
    for variable in objective.optim_variables() {
        validate_values(variable.name(), variable.values())?;
    }
    objective.expand_optim_variables()?;
    backend.sync(config);

    let batch_size = objective.batch_size();
    let layout = objective.optim_layout();
    let mut states: Vec<ElementState> = (0..batch_size)
        .map(|b| ElementState::new(objective, b, policy.initial_lambda()))
        .collect();
    for state in states.iter_mut().filter(|s| s.status.is_none()) {
        if state.error < config.abs_err_tolerance {
            state.status = Some(OptimizationStatus::Converged);
        }
    }

    let debug_enabled = tracing::enabled!(tracing::Level::DEBUG);
    if debug_enabled {
        config.print_configuration(optimizer);
        IterationStats::print_header();
    }

    let mut iteration_times = Vec::with_capacity(config.max_iterations);
    let mut previous_error: f64 =
        states.iter().filter(|s| s.status.is_none()).map(|s| s.error).sum();

    for iteration in 0..config.max_iterations {
        let active: Vec<usize> = (0..batch_size).filter(|&b| states[b].status.is_none()).collect();
        if active.is_empty() {
            break;
        }
        let iter_start = Instant::now();
        let mut stats = IterationStats {
            iteration,
            active: active.len(),
            error: 0.0,
            error_change: 0.0,
            max_step_norm: 0.0,
            mean_lambda: 0.0,
            accepted: 0,
            rejected: 0,
            failed: 0,
            iter_time_ms: 0.0,
            total_time_ms: 0.0,
        };
        let mut lambda_sum = 0.0;

        let (linearizer, solver) = backend.parts_mut();
        let mut pending: Vec<(usize, Linearization)> = Vec::with_capacity(active.len());
        for (&b, result) in active.iter().zip(linearizer.linearize_batch(objective, &active)) {
            states[b].iterations += 1;
            match result {
                Ok(linearization) => pending.push((b, linearization)),
                Err(e) => {
                    states[b].fail(objective, b, format!("linearization failed: {e}"));
                    stats.failed += 1;
                }
            }
        }

        let mut retries = vec![0usize; batch_size];
        while !pending.is_empty() {
            let solutions = {
                let systems: Vec<DampedSystem<'_>> = pending
                    .iter()
                    .map(|(b, linearization)| DampedSystem {
                        linearization,
                        lambda: states[*b].lambda,
                    })
                    .collect();
                solver.solve_batch(&systems, config.damping_scaling)
            };

            // Candidates are written into the objective so their errors can be evaluated
            // in one pass; rejected ones are rolled back below.
            let mut candidates: Vec<Result<Candidate, String>> = Vec::with_capacity(pending.len());
            for ((b, _), solution) in pending.iter().zip(solutions) {
                let candidate = solution
                    .map_err(|e| format!("linear solve failed: {e}"))
                    .and_then(|delta| {
                        let before = objective.optim_element(*b);
                        let values = retract_element(&before, &delta, &layout, config.convention)
                            .map_err(|e| format!("retraction failed: {e}"))?;
                        objective.set_optim_element(*b, &values);
                        Ok(Candidate { before, delta })
                    });
                candidates.push(candidate);
            }
            let evaluated: Vec<usize> = pending
                .iter()
                .zip(&candidates)
                .filter(|(_, c)| c.is_ok())
                .map(|((b, _), _)| *b)
                .collect();
            let mut candidate_errors = evaluate_errors(objective, &evaluated).into_iter();

            let mut next = Vec::new();
            for ((b, linearization), candidate) in pending.into_iter().zip(candidates) {
                let state = &mut states[b];
                let lambda = state.lambda;
                let error_before = state.error;
                let candidate_error = match &candidate {
                    Ok(_) => candidate_errors.next().flatten(),
                    Err(_) => None,
                };
                let mut attempt = StepAttempt {
                    iteration,
                    lambda,
                    error_before,
                    candidate_error,
                    accepted: false,
                };

                let cause = match (candidate, candidate_error) {
                    (Ok(candidate), Some(error)) if policy.accepts(error_before, error) => {
                        attempt.accepted = true;
                        state.attempts.push(attempt);
                        if error < state.best_error {
                            state.best_error = error;
                            state.best_values = objective.optim_element(b);
                        }
                        let step_norm = candidate.delta.norm();
                        if config.track_trajectory {
                            state.steps.push(TrajectoryStep {
                                values: candidate.before,
                                delta: candidate.delta,
                                lambda,
                            });
                        }
                        state.error = error;
                        state.history.push(error);
                        state.lambda = policy.relax(lambda);

                        stats.accepted += 1;
                        stats.max_step_norm = stats.max_step_norm.max(step_norm);
                        lambda_sum += lambda;

                        let converged = convergence_reason(config, error_before, error, step_norm);
                        if let Some(reason) = converged {
                            debug!("batch element {b} converged: {reason}");
                            state.status = Some(OptimizationStatus::Converged);
                        }
                        continue;
                    }
                    (Ok(candidate), error) => {
                        objective.set_optim_element(b, &candidate.before);
                        match error {
                            Some(error) => {
                                format!("error increased from {error_before:.6e} to {error:.6e}")
                            }
                            None => "candidate error is not finite".to_string(),
                        }
                    }
                    (Err(reason), _) => reason,
                };

                state.attempts.push(attempt);
                stats.rejected += 1;
                match policy.escalate(lambda, retries[b]) {
                    Ok(increased) => {
                        state.lambda = increased;
                        retries[b] += 1;
                        next.push((b, linearization));
                    }
                    Err(exhausted) => {
                        state.fail(objective, b, format!("{cause}; {exhausted}"));
                        stats.failed += 1;
                    }
                }
            }
            pending = next;
        }

        let elapsed = iter_start.elapsed();
        iteration_times.push(elapsed);
        if debug_enabled {
            stats.error = active.iter().map(|&b| states[b].error).sum();
            stats.error_change = previous_error - stats.error;
            stats.mean_lambda = if stats.accepted > 0 {
                lambda_sum / stats.accepted as f64
            } else {
                0.0
            };
            stats.iter_time_ms = elapsed.as_secs_f64() * 1000.0;
            stats.total_time_ms = start_time.elapsed().as_secs_f64() * 1000.0;
            stats.print_line();
            previous_error = states.iter().filter(|s| s.status.is_none()).map(|s| s.error).sum();
        }
    }

    for state in states.iter_mut().filter(|s| s.status.is_none()) {
        state.status = Some(OptimizationStatus::MaxIterations);
    }

    let trajectory = config.track_trajectory.then(|| Trajectory {
        structure_version: objective.structure_version(),
        convention: config.convention,
        damping_scaling: config.damping_scaling,
        steps: states.iter_mut().map(|s| std::mem::take(&mut s.steps)).collect(),
    });

    let mut result = OptimizerInfo {
        optimizer,
        statuses: Vec::with_capacity(batch_size),
        failures: Vec::with_capacity(batch_size),
        initial_error: Vec::with_capacity(batch_size),
        final_error: Vec::with_capacity(batch_size),
        best_error: Vec::with_capacity(batch_size),
        iterations: Vec::with_capacity(batch_size),
        error_history: Vec::with_capacity(batch_size),
        attempts: Vec::with_capacity(batch_size),
        iteration_times,
        total_time: start_time.elapsed(),
        trajectory,
    };
    for state in states {
        result.statuses.push(state.status.unwrap_or(OptimizationStatus::MaxIterations));
        result.failures.push(state.failure);
        result.initial_error.push(state.initial_error);
        result.final_error.push(state.error);
        result.best_error.push(state.best_error);
        result.iterations.push(state.iterations);
        result.error_history.push(state.history);
        result.attempts.push(state.attempts);
    }

    info!(
        "{}: {} after {} iterations, error {:.6e} -> {:.6e}, {} of {} elements failed, {:.2}ms",
        optimizer,
        result.status(),
        result.max_iterations_used(),
        result.initial_error.iter().filter(|e| e.is_finite()).sum::<f64>(),
        result.final_error.iter().filter(|e| e.is_finite()).sum::<f64>(),
        result.num_failed(),
        batch_size,
        result.total_time.as_secs_f64() * 1000.0
    );
    if debug_enabled {
        debug!("{}", result);
    }
    Ok(result)
}
