//! Batched nonlinear least squares solvers.
//!
//! Both algorithms share one driver: every batch element owns its damping, status and
//! error history, and all active elements advance in lockstep. An iteration linearizes the
//! active elements, solves their damped normal equations in one batch call, retracts the
//! candidate values and accepts or rejects each element on its own.
//!
//! - [`GaussNewton`]: fixed (default zero) regularization, every step accepted
//! - [`LevenbergMarquardt`]: adaptive damping, a step is accepted only if it does not
//!   increase the error
//!
//! A numerical failure of one element (singular system with no damping left to try,
//! non-finite linearization, exhausted damping retries) marks that element
//! [`OptimizationStatus::Failed`] and restores its best-known values; the others continue.

/// `with_*` builders of the shared [`OptimizerConfig`] for a config struct that keeps it in
/// a `base` field.
macro_rules! base_config_builders {
    ($config:ty) => {
        impl $config {
            pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
                self.base.max_iterations = max_iterations;
                self
            }

            pub fn with_abs_err_tolerance(mut self, tolerance: f64) -> Self {
                self.base.abs_err_tolerance = tolerance;
                self
            }

            pub fn with_rel_err_tolerance(mut self, tolerance: f64) -> Self {
                self.base.rel_err_tolerance = tolerance;
                self
            }

            pub fn with_step_tolerance(mut self, tolerance: f64) -> Self {
                self.base.step_tolerance = tolerance;
                self
            }

            pub fn with_linear_solver_type(
                mut self,
                linear_solver_type: $crate::linalg::LinearSolverType,
            ) -> Self {
                self.base.linear_solver_type = linear_solver_type;
                self
            }

            pub fn with_damping_scaling(mut self, scaling: $crate::linalg::DampingScaling) -> Self {
                self.base.damping_scaling = scaling;
                self
            }

            pub fn with_convention(
                mut self,
                convention: $crate::manifold::TangentConvention,
            ) -> Self {
                self.base.convention = convention;
                self
            }

            pub fn with_track_trajectory(mut self, track: bool) -> Self {
                self.base.track_trajectory = track;
                self
            }

            /// Replace every shared setting at once.
            pub fn with_base(mut self, base: $crate::optimizer::OptimizerConfig) -> Self {
                self.base = base;
                self
            }
        }
    };
}

mod driver;
pub mod gauss_newton;
pub mod levenberg_marquardt;

pub use gauss_newton::{GaussNewton, GaussNewtonConfig};
pub use levenberg_marquardt::{LevenbergMarquardt, LevenbergMarquardtConfig};

pub(crate) use driver::retract_element;

use crate::core::objective::Objective;
use crate::error::DiffOptResult;
use crate::linalg::{DampingScaling, LinearSolver, LinearSolverType};
use crate::linearization::Linearizer;
use crate::manifold::{ManifoldElement, TangentConvention};
use nalgebra::DVector;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Type of optimization algorithm
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerType {
    /// Levenberg-Marquardt algorithm (robust, adaptive damping)
    #[default]
    LevenbergMarquardt,
    /// Gauss-Newton algorithm (fast convergence, may be unstable)
    GaussNewton,
}

impl Display for OptimizerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            OptimizerType::GaussNewton => write!(f, "Gauss-Newton"),
        }
    }
}

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// A batch element could not make progress (singular system, non-finite values or
    /// exhausted damping). Reported per element in [`OptimizerInfo::failures`].
    #[error("Convergence failure: {0}")]
    ConvergenceFailure(String),

    /// Configuration values out of range
    #[error("Invalid optimizer configuration: {0}")]
    InvalidConfig(String),

    /// Objective has no cost functions or no optimization variables
    #[error("Objective has no cost functions or no optimization variables")]
    EmptyObjective,
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Terminal status of one batch element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// An error, relative decrease or step tolerance was reached
    Converged,
    /// The iteration budget ran out first
    MaxIterations,
    /// The element could not make progress; its best-known values were restored
    Failed,
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterations => write!(f, "Maximum iterations reached"),
            OptimizationStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Settings shared by every optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of (outer) iterations
    pub max_iterations: usize,
    /// Converged once the error falls below this value
    pub abs_err_tolerance: f64,
    /// Converged once `|e_prev - e| / e_prev` falls below this value
    pub rel_err_tolerance: f64,
    /// Converged once the accepted step norm falls below this value
    pub step_tolerance: f64,
    pub linear_solver_type: LinearSolverType,
    /// Damping matrix `D` in `(JᵀJ + λD)`
    pub damping_scaling: DampingScaling,
    pub convention: TangentConvention,
    /// Record the accepted steps needed by the unrolled backward modes
    pub track_trajectory: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            abs_err_tolerance: 1e-10,
            rel_err_tolerance: 1e-8,
            step_tolerance: 1e-10,
            linear_solver_type: LinearSolverType::default(),
            damping_scaling: DampingScaling::default(),
            convention: TangentConvention::default(),
            track_trajectory: false,
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_abs_err_tolerance(mut self, tolerance: f64) -> Self {
        self.abs_err_tolerance = tolerance;
        self
    }

    pub fn with_rel_err_tolerance(mut self, tolerance: f64) -> Self {
        self.rel_err_tolerance = tolerance;
        self
    }

    pub fn with_step_tolerance(mut self, tolerance: f64) -> Self {
        self.step_tolerance = tolerance;
        self
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_damping_scaling(mut self, scaling: DampingScaling) -> Self {
        self.damping_scaling = scaling;
        self
    }

    pub fn with_convention(mut self, convention: TangentConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn with_track_trajectory(mut self, track: bool) -> Self {
        self.track_trajectory = track;
        self
    }

    pub fn validate(&self) -> OptimizerResult<()> {
        let tolerances = [
            ("abs_err_tolerance", self.abs_err_tolerance),
            ("rel_err_tolerance", self.rel_err_tolerance),
            ("step_tolerance", self.step_tolerance),
        ];
        for (name, value) in tolerances {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(OptimizerError::InvalidConfig(format!(
                    "{name} must be finite and non-negative, got {value}"
                ))
                .log());
            }
        }
        if let DampingScaling::Jacobi {
            min_diagonal,
            max_diagonal,
        } = self.damping_scaling
            && !(min_diagonal > 0.0 && min_diagonal <= max_diagonal)
        {
            return Err(OptimizerError::InvalidConfig(format!(
                "Jacobi damping bounds must satisfy 0 < min <= max, got [{min_diagonal:e}, \
                 {max_diagonal:e}]"
            ))
            .log());
        }
        Ok(())
    }

    pub(crate) fn print_configuration(&self, optimizer: OptimizerType) {
        debug!(
            "Configuration:\n  \
             Solver:            {}\n  \
             Linear solver:     {}\n  \
             Damping scaling:   {:?}\n  \
             Convention:        {:?}\n  \
             Max iterations:    {}\n  \
             Abs err tolerance: {:.2e}\n  \
             Rel err tolerance: {:.2e}\n  \
             Step tolerance:    {:.2e}\n  \
             Trajectory:        {}",
            optimizer,
            self.linear_solver_type,
            self.damping_scaling,
            self.convention,
            self.max_iterations,
            self.abs_err_tolerance,
            self.rel_err_tolerance,
            self.step_tolerance,
            if self.track_trajectory {
                "recorded"
            } else {
                "off"
            }
        );
    }
}

/// One linear solve attempted for a batch element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepAttempt {
    /// Outer iteration (0-based)
    pub iteration: usize,
    /// Damping used for the solve
    pub lambda: f64,
    pub error_before: f64,
    /// Error at the candidate, `None` if the solve or the evaluation failed
    pub candidate_error: Option<f64>,
    pub accepted: bool,
}

/// An accepted step, enough to replay the linear system it came from.
#[derive(Debug, Clone)]
pub struct TrajectoryStep {
    /// Optimization values before the step, in column order
    pub values: Vec<ManifoldElement>,
    /// Full tangent step
    pub delta: DVector<f64>,
    pub lambda: f64,
}

/// Accepted steps of every batch element.
#[derive(Debug, Clone)]
pub struct Trajectory {
    /// Structure version of the objective the steps were taken on
    pub structure_version: u64,
    pub convention: TangentConvention,
    pub damping_scaling: DampingScaling,
    /// `steps[b]` in the order they were taken
    pub steps: Vec<Vec<TrajectoryStep>>,
}

/// Outcome of one optimizer run.
#[derive(Debug, Clone)]
pub struct OptimizerInfo {
    pub optimizer: OptimizerType,
    /// Per batch element
    pub statuses: Vec<OptimizationStatus>,
    /// Reason of each failed element
    pub failures: Vec<Option<OptimizerError>>,
    pub initial_error: Vec<f64>,
    /// Error at the returned values
    pub final_error: Vec<f64>,
    pub best_error: Vec<f64>,
    /// Outer iterations each element took part in
    pub iterations: Vec<usize>,
    /// Error after every iteration, starting with the initial error
    pub error_history: Vec<Vec<f64>>,
    /// Every linear solve, including rejected and retried ones
    pub attempts: Vec<Vec<StepAttempt>>,
    /// Wall-clock time of each outer iteration
    pub iteration_times: Vec<Duration>,
    pub total_time: Duration,
    pub trajectory: Option<Trajectory>,
}

impl OptimizerInfo {
    pub fn batch_size(&self) -> usize {
        self.statuses.len()
    }

    /// `Failed` if any element failed, else `MaxIterations` if any ran out of
    /// iterations, else `Converged`.
    pub fn status(&self) -> OptimizationStatus {
        if self.statuses.contains(&OptimizationStatus::Failed) {
            OptimizationStatus::Failed
        } else if self.statuses.contains(&OptimizationStatus::MaxIterations) {
            OptimizationStatus::MaxIterations
        } else {
            OptimizationStatus::Converged
        }
    }

    pub fn num_failed(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == OptimizationStatus::Failed)
            .count()
    }

    /// Largest iteration count over the batch.
    pub fn max_iterations_used(&self) -> usize {
        self.iterations.iter().copied().max().unwrap_or(0)
    }
}

impl Display for OptimizerInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sum = |v: &[f64]| v.iter().sum::<f64>();
        let initial = sum(&self.initial_error);
        let last = sum(&self.final_error);
        writeln!(f, "{} Final Result", self.optimizer)?;
        let failed = self.num_failed();
        writeln!(f, "{} ({failed} of {} elements failed)", self.status(), self.batch_size())?;
        writeln!(f)?;
        writeln!(f, "Error (summed over the batch):")?;
        writeln!(f, "  Initial:   {initial:.6e}")?;
        writeln!(f, "  Final:     {last:.6e}")?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            initial - last,
            100.0 * (initial - last) / initial.max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Max over batch: {}", self.max_iterations_used())?;
        let accepted: usize = self
            .attempts
            .iter()
            .map(|a| a.iter().filter(|s| s.accepted).count())
            .sum();
        let attempted: usize = self.attempts.iter().map(Vec::len).sum();
        writeln!(f, "  Accepted steps: {accepted} of {attempted}")?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        write!(f, "  Total time: {:.2}ms", self.total_time.as_secs_f64() * 1000.0)
    }
}

/// Per-iteration statistics aggregated over the active batch elements.
#[derive(Debug, Clone)]
pub struct IterationStats {
    pub iteration: usize,
    /// Elements still iterating at the start of the iteration
    pub active: usize,
    /// Error summed over the active elements after the iteration
    pub error: f64,
    pub error_change: f64,
    pub max_step_norm: f64,
    /// Mean damping over the accepted steps
    pub mean_lambda: f64,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub iter_time_ms: f64,
    pub total_time_ms: f64,
}

impl IterationStats {
    pub fn print_header() {
        debug!(
            "{:>4}  {:>6}  {:>13}  {:>13}  {:>11}  {:>11}  {:>5}  {:>5}  {:>5}  {:>11}  {:>13}",
            "iter",
            "active",
            "error",
            "error_change",
            "|step|",
            "lambda",
            "acc",
            "rej",
            "fail",
            "iter_time",
            "total_time"
        );
    }

    pub fn print_line(&self) {
        debug!(
            "{:>4}  {:>6}  {:>13.6e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  \
             {:>5}  {:>5}  {:>5}  {:>9.2}ms  {:>11.2}ms",
            self.iteration,
            self.active,
            self.error,
            self.error_change,
            self.max_step_norm,
            self.mean_lambda,
            self.accepted,
            self.rejected,
            self.failed,
            self.iter_time_ms,
            self.total_time_ms
        );
    }
}

/// Linearizer and linear solver an optimizer keeps across runs, so the block arena and the
/// symbolic factorization survive as long as the objective's structure does.
pub struct SolverBackend {
    linearizer: Linearizer,
    solver: Box<dyn LinearSolver>,
}

impl fmt::Debug for SolverBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolverBackend")
            .field("linearizer", &self.linearizer)
            .field("solver", &self.solver.solver_type())
            .finish()
    }
}

impl SolverBackend {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            linearizer: Linearizer::new(
                config.linear_solver_type.linearization_kind(),
                config.convention,
            ),
            solver: config.linear_solver_type.create(),
        }
    }

    /// Recreate whichever part no longer matches `config`.
    pub(crate) fn sync(&mut self, config: &OptimizerConfig) {
        let kind = config.linear_solver_type.linearization_kind();
        if self.linearizer.kind() != kind || self.linearizer.convention() != config.convention {
            self.linearizer = Linearizer::new(kind, config.convention);
        }
        if self.solver.solver_type() != config.linear_solver_type {
            self.solver = config.linear_solver_type.create();
        }
    }

    pub fn linearizer(&self) -> &Linearizer {
        &self.linearizer
    }

    pub fn parts_mut(&mut self) -> (&mut Linearizer, &mut dyn LinearSolver) {
        (&mut self.linearizer, self.solver.as_mut())
    }
}

/// Common interface of the batched optimizers.
pub trait Optimizer: Send {
    fn optimizer_type(&self) -> OptimizerType;

    fn config(&self) -> &OptimizerConfig;

    fn config_mut(&mut self) -> &mut OptimizerConfig;

    /// Optimize `objective` in place. Setup problems are returned as errors; numerical
    /// failures become per-element statuses in the returned info.
    fn optimize(&mut self, objective: &mut Objective) -> DiffOptResult<OptimizerInfo>;

    /// Linearizer and solver matching the current configuration.
    fn backend(&mut self) -> &mut SolverBackend;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(statuses: Vec<OptimizationStatus>) -> OptimizerInfo {
        let n = statuses.len();
        OptimizerInfo {
            optimizer: OptimizerType::GaussNewton,
            statuses,
            failures: vec![None; n],
            initial_error: vec![1.0; n],
            final_error: vec![0.0; n],
            best_error: vec![0.0; n],
            iterations: (0..n).collect(),
            error_history: vec![vec![1.0, 0.0]; n],
            attempts: vec![Vec::new(); n],
            iteration_times: Vec::new(),
            total_time: Duration::from_millis(3),
            trajectory: None,
        }
    }

    #[test]
    fn test_status_summary_precedence() {
        use OptimizationStatus::*;
        assert_eq!(info_with(vec![Converged, Converged]).status(), Converged);
        assert_eq!(info_with(vec![Converged, MaxIterations]).status(), MaxIterations);
        assert_eq!(info_with(vec![MaxIterations, Failed, Converged]).status(), Failed);
        assert_eq!(info_with(vec![MaxIterations, Failed]).num_failed(), 1);
        assert_eq!(info_with(vec![Converged; 4]).max_iterations_used(), 3);
    }

    #[test]
    fn test_config_validation() {
        assert!(OptimizerConfig::new().validate().is_ok());
        assert!(matches!(
            OptimizerConfig::new().with_rel_err_tolerance(-1.0).validate(),
            Err(OptimizerError::InvalidConfig(_))
        ));
        assert!(matches!(
            OptimizerConfig::new()
                .with_damping_scaling(DampingScaling::Jacobi {
                    min_diagonal: 1.0,
                    max_diagonal: 0.5
                })
                .validate(),
            Err(OptimizerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_backend_follows_config() {
        let config = OptimizerConfig::new();
        let mut backend = SolverBackend::new(&config);
        assert_eq!(backend.parts_mut().1.solver_type(), LinearSolverType::SparseCholesky);

        let config = config
            .with_linear_solver_type(LinearSolverType::DenseLu)
            .with_convention(TangentConvention::Left);
        backend.sync(&config);
        let (linearizer, solver) = backend.parts_mut();
        assert_eq!(solver.solver_type(), LinearSolverType::DenseLu);
        assert_eq!(linearizer.convention(), TangentConvention::Left);
        assert_eq!(
            linearizer.kind(),
            crate::linearization::LinearizationKind::Dense
        );
    }

    #[test]
    fn test_summary_display() {
        let text = info_with(vec![OptimizationStatus::Converged]).to_string();
        assert!(text.contains("Gauss-Newton Final Result"));
        assert!(text.contains("Converged"));
    }
}
