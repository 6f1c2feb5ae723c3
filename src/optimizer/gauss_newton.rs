//! Gauss-Newton optimizer.
//!
//! Solves `(JᵀJ + λ D) Δ = -Jᵀr` with a constant `λ` (zero unless a regularization is
//! configured) and takes every step. Fast on well-conditioned problems; an element whose
//! normal matrix is singular fails immediately since there is no damping to fall back on.

use super::driver::{self, StepPolicy};
use super::{
    Optimizer, OptimizerConfig, OptimizerError, OptimizerInfo, OptimizerType, SolverBackend,
};
use crate::core::objective::Objective;
use crate::error::DiffOptResult;

/// Configuration of the Gauss-Newton optimizer.
///
/// ```
/// use apex_diffopt::linalg::LinearSolverType;
/// use apex_diffopt::optimizer::GaussNewtonConfig;
///
/// let config = GaussNewtonConfig::new()
///     .with_max_iterations(20)
///     .with_linear_solver_type(LinearSolverType::DenseCholesky)
///     .with_regularization(1e-9);
/// assert_eq!(config.base.max_iterations, 20);
/// ```
#[derive(Debug, Clone, Default)]
pub struct GaussNewtonConfig {
    pub base: OptimizerConfig,
    /// Constant `λ` added to the normal equations
    pub regularization: f64,
}

impl GaussNewtonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_regularization(mut self, regularization: f64) -> Self {
        self.regularization = regularization;
        self
    }

    fn validate(&self) -> Result<(), OptimizerError> {
        if !(self.regularization >= 0.0 && self.regularization.is_finite()) {
            return Err(OptimizerError::InvalidConfig(format!(
                "regularization must be finite and non-negative, got {}",
                self.regularization
            ))
            .log());
        }
        Ok(())
    }
}

base_config_builders!(GaussNewtonConfig);

#[derive(Debug)]
pub struct GaussNewton {
    config: GaussNewtonConfig,
    backend: SolverBackend,
}

impl Default for GaussNewton {
    fn default() -> Self {
        Self::new()
    }
}

impl GaussNewton {
    pub fn new() -> Self {
        Self::with_config(GaussNewtonConfig::default())
    }

    pub fn with_config(config: GaussNewtonConfig) -> Self {
        let backend = SolverBackend::new(&config.base);
        Self { config, backend }
    }

    pub fn gauss_newton_config(&self) -> &GaussNewtonConfig {
        &self.config
    }
}

impl Optimizer for GaussNewton {
    fn optimizer_type(&self) -> OptimizerType {
        OptimizerType::GaussNewton
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
            OptimizerType::GaussNewton,
            &self.config.base,
            StepPolicy::Fixed {
                lambda: self.config.regularization,
            },
            &mut self.backend,
            objective,
        )
    }

    fn backend(&mut self) -> &mut SolverBackend {
        self.backend.sync(&self.config.base);
        &mut self.backend
    }
}
