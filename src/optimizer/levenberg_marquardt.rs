//! Levenberg-Marquardt optimizer with per-element adaptive damping.
//!
//! Each batch element solves `(JᵀJ + λ_b D) Δ = -Jᵀr` with its own damping `λ_b`:
//!
//! - the candidate `x ⊕ Δ` is accepted only if the error does not increase, after which
//!   `λ_b ← max(λ_b / damping_decrease_factor, damping_min)`
//! - a rejected candidate is rolled back, `λ_b ← min(λ_b · damping_increase_factor,
//!   damping_max)` and the same linearization is solved again
//!
//! An element that is rejected while already at `damping_max`, or more than
//! `max_damping_retries` times within one iteration, is marked failed and keeps its
//! best-known values. A singular solve counts as a rejection, so damping is raised until
//! the system becomes solvable.

use super::driver::{self, DampingSchedule, StepPolicy};
use super::{
    Optimizer, OptimizerConfig, OptimizerError, OptimizerInfo, OptimizerType, SolverBackend,
};
use crate::core::objective::Objective;
use crate::error::DiffOptResult;

/// Configuration parameters for the Levenberg-Marquardt optimizer.
///
/// # Builder Pattern
///
/// ```
/// use apex_diffopt::linalg::DampingScaling;
/// use apex_diffopt::optimizer::LevenbergMarquardtConfig;
///
/// let config = LevenbergMarquardtConfig::new()
///     .with_max_iterations(100)
///     .with_damping(1e-3)
///     .with_damping_bounds(1e-12, 1e12)
///     .with_damping_scaling(DampingScaling::jacobi());
/// assert_eq!(config.damping, 1e-3);
/// ```
///
/// # Damping Parameter Behavior
///
/// - **Initial damping** (`damping`): starting value (default: 1e-4)
/// - **Damping bounds** (`damping_min`, `damping_max`): valid range (default: 1e-12 to 1e12)
/// - **Factors**: divided by `damping_decrease_factor` (default 3) after an accepted step,
///   multiplied by `damping_increase_factor` (default 10) after a rejected one
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtConfig {
    pub base: OptimizerConfig,
    /// Initial damping parameter
    pub damping: f64,
    /// Minimum damping parameter
    pub damping_min: f64,
    /// Maximum damping parameter
    pub damping_max: f64,
    /// Damping increase factor (when step rejected)
    pub damping_increase_factor: f64,
    /// Damping decrease factor (when step accepted)
    pub damping_decrease_factor: f64,
    /// Rejections tolerated within one iteration before the element fails
    pub max_damping_retries: usize,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            base: OptimizerConfig::default(),
            damping: 1e-4,
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 3.0,
            max_damping_retries: 10,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    pub fn with_damping_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.damping_increase_factor = increase;
        self.damping_decrease_factor = decrease;
        self
    }

    pub fn with_max_damping_retries(mut self, retries: usize) -> Self {
        self.max_damping_retries = retries;
        self
    }

    fn validate(&self) -> Result<(), OptimizerError> {
        let finite = [
            self.damping,
            self.damping_min,
            self.damping_max,
            self.damping_increase_factor,
            self.damping_decrease_factor,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(
                OptimizerError::InvalidConfig("damping settings must be finite".to_string()).log(),
            );
        }
        if !(0.0 <= self.damping_min
            && self.damping_min <= self.damping
            && self.damping <= self.damping_max)
        {
            return Err(OptimizerError::InvalidConfig(format!(
                "damping must satisfy 0 <= min <= damping <= max, got {:.2e} <= {:.2e} <= {:.2e}",
                self.damping_min, self.damping, self.damping_max
            ))
            .log());
        }
        // A zero damping could never be raised by the increase factor.
        if self.damping <= 0.0 {
            return Err(OptimizerError::InvalidConfig(format!(
                "initial damping must be positive, got {:.2e}",
                self.damping
            ))
            .log());
        }
        if self.damping_increase_factor <= 1.0 || self.damping_decrease_factor < 1.0 {
            return Err(OptimizerError::InvalidConfig(format!(
                "damping factors must be > 1 (increase) and >= 1 (decrease), got {} and {}",
                self.damping_increase_factor, self.damping_decrease_factor
            ))
            .log());
        }
        Ok(())
    }

    fn schedule(&self) -> DampingSchedule {
        DampingSchedule {
            initial: self.damping,
            min: self.damping_min,
            max: self.damping_max,
            increase: self.damping_increase_factor,
            decrease: self.damping_decrease_factor,
            max_retries: self.max_damping_retries,
        }
    }
}

base_config_builders!(LevenbergMarquardtConfig);

/// Levenberg-Marquardt solver for batched nonlinear least squares.
///
/// # Examples
///
/// ```no_run
/// use apex_diffopt::linalg::LinearSolverType;
/// use apex_diffopt::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig, Optimizer};
/// # use apex_diffopt::core::objective::Objective;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let mut objective = Objective::new();
/// let config = LevenbergMarquardtConfig::new()
///     .with_max_iterations(100)
///     .with_linear_solver_type(LinearSolverType::SparseCholesky);
/// let mut solver = LevenbergMarquardt::with_config(config);
/// let info = solver.optimize(&mut objective)?;
/// println!("{}", info.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    backend: SolverBackend,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        let backend = SolverBackend::new(&config.base);
        Self { config, backend }
    }

    pub fn levenberg_marquardt_config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }
}

impl Optimizer for LevenbergMarquardt {
    fn optimizer_type(&self) -> OptimizerType {
        OptimizerType::LevenbergMarquardt
    }

    fn config(&self) -> &OptimizerConfig {
        &self.config.base
    }

    fn config_mut(&mut self) -> &mut OptimizerConfig {
        &mut self.config.base
    }

    fn optimize(&mut self, objective: &mut Objective) -> DiffOptResult<OptimizerInfo> {
        self.config.validate()?;
        driver::run(
            OptimizerType::LevenbergMarquardt,
            &self.config.base,
            StepPolicy::Adaptive(self.config.schedule()),
            &mut self.backend,
            objective,
        )
    }

    fn backend(&mut self) -> &mut SolverBackend {
        self.backend.sync(&self.config.base);
        &mut self.backend
    }
}
