//! # Apex DiffOpt
//!
//! Differentiable nonlinear least squares on manifolds. An [`Objective`] collects cost
//! functions over batched manifold variables; a batched Gauss-Newton or
//! Levenberg-Marquardt optimizer minimizes it; a backward strategy returns gradients of a
//! downstream loss with respect to the objective's inputs.
//!
//! ## Features
//!
//! - **Manifolds**: Vector, Point2, Point3, SO2, SO3, SE2, SE3 with right or left tangent
//!   convention
//! - **Objective graph**: named variables with batch broadcasting, robust losses, learned
//!   weights, cost removal and explicit column ordering
//! - **Linear solvers**: sparse Cholesky (cached symbolic factorization), dense Cholesky and
//!   dense LU
//! - **Optimizers**: Gauss-Newton and Levenberg-Marquardt with a per-batch-element failure
//!   policy
//! - **Backward modes**: unrolled, truncated, implicit and direct loss minimization
//! - **Embodied**: batched 2D signed distance fields
//!
//! ## Example
//!
//! ```
//! use apex_diffopt::{BetweenFactor, CostWeight, GaussNewton, Objective, Optimizer, Variable};
//! use apex_diffopt::manifold::{ManifoldElement, se2::SE2};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let a = Variable::single("a", SE2::from_xy_angle(0.0, 0.0, 0.0).into())?;
//! let b = Variable::single("b", SE2::from_xy_angle(0.5, 0.1, 0.2).into())?;
//! let measured: ManifoldElement = SE2::from_xy_angle(1.0, 0.0, 0.3).into();
//!
//! let mut objective = Objective::new();
//! objective.add(
//!     Box::new(apex_diffopt::DifferenceFactor::with_target(a.value(0).clone())),
//!     &[&a],
//!     &[],
//!     CostWeight::identity(),
//! )?;
//! objective.add(
//!     Box::new(BetweenFactor::new(measured)),
//!     &[&a, &b],
//!     &[],
//!     CostWeight::identity(),
//! )?;
//!
//! let info = GaussNewton::new().optimize(&mut objective)?;
//! assert!(info.final_error[0] < 1e-9);
//! # Ok(())
//! # }
//! ```

pub mod backward;
pub mod core;
pub mod embodied;
pub mod error;
pub mod factors;
pub mod layer;
pub mod linalg;
pub mod linearization;
#[cfg(feature = "logging")]
pub mod logger;
pub mod manifold;
pub mod optimizer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use backward::{BackwardMode, BackwardStrategy, Gradients};
pub use core::cost_weight::CostWeight;
pub use core::objective::Objective;
pub use core::variable::Variable;
pub use embodied::SignedDistanceField2D;
pub use error::{DiffOptError, DiffOptResult};
pub use factors::{BetweenFactor, DifferenceFactor, FiniteDiffCostFunction};
pub use layer::OptimizationLayer;
pub use linalg::{DampingScaling, LinearSolverType};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::{ManifoldElement, TangentConvention};
pub use optimizer::{
    GaussNewton, GaussNewtonConfig, LevenbergMarquardt, LevenbergMarquardtConfig,
    OptimizationStatus, Optimizer, OptimizerConfig, OptimizerInfo, OptimizerType,
};
