//! Generic cost functions.
//!
//! Application-specific residual models implement
//! [`CostFunction`](crate::core::cost_function::CostFunction) themselves; this module
//! provides the manifold-generic building blocks:
//!
//! - [`DifferenceFactor`]: `r = local(target, x)`, the manifold analogue of `x - target`
//! - [`BetweenFactor`]: `r = local(measured, x_i⁻¹ ∘ x_j)` for relative constraints
//! - [`FiniteDiffCostFunction`]: wraps a residual closure and differentiates it numerically
//!
//! The first two work for every [`ManifoldType`](crate::manifold::ManifoldType). Their
//! targets and measurements are either fixed at construction or read from an auxiliary
//! variable, in which case analytic auxiliary Jacobians are supplied for the backward
//! pass.

pub mod between_factor;
pub mod difference_factor;
pub mod finite_diff;

pub use between_factor::BetweenFactor;
pub use difference_factor::DifferenceFactor;
pub use finite_diff::FiniteDiffCostFunction;

use crate::core::{CoreError, CoreResult};
use crate::manifold::ManifoldElement;

/// Check the number of values a cost received.
pub(crate) fn expect_count(
    name: &str,
    role: &str,
    values: &[&ManifoldElement],
    expected: usize,
) -> CoreResult<()> {
    if values.len() != expected {
        return Err(CoreError::ShapeMismatch(format!(
            "{name} expects {expected} {role} variable(s), got {}",
            values.len()
        ))
        .log());
    }
    Ok(())
}
