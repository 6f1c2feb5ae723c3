//! Cost function differentiated by central differences.

use crate::core::{CoreResult, cost_function::CostFunction};
use crate::manifold::ManifoldElement;
use crate::utils::{DEFAULT_FD_STEP, numeric_jacobian};
use nalgebra::{DMatrix, DVector};

type ResidualFn =
    dyn Fn(&[&ManifoldElement], &[&ManifoldElement]) -> CoreResult<DVector<f64>> + Send + Sync;

/// Wraps a residual closure; the Jacobian is obtained by perturbing each optimization
/// variable along its tangent basis with `x ⊕ ±h·eₖ`.
///
/// Each Jacobian costs `2 · Σ tangent_dim` residual evaluations, so this is meant for
/// prototyping and for residuals without a convenient closed form.
///
/// # Example
///
/// ```
/// use apex_diffopt::core::cost_function::CostFunction;
/// use apex_diffopt::factors::FiniteDiffCostFunction;
/// use apex_diffopt::manifold::ManifoldElement;
/// use nalgebra::DVector;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // r = x² - 2
/// let cost = FiniteDiffCostFunction::new("sqrt2", 1, |optim, _aux| {
///     let x = optim[0].to_vector()[0];
///     Ok(DVector::from_element(1, x * x - 2.0))
/// });
/// let x = ManifoldElement::vector(&[3.0]);
/// let (_, jacobian) = cost.evaluate(&[&x], &[], true)?;
/// assert!((jacobian.map(|j| j[(0, 0)]).unwrap_or_default() - 6.0).abs() < 1e-6);
/// # Ok(())
/// # }
/// ```
pub struct FiniteDiffCostFunction {
    name: String,
    dim: usize,
    step: f64,
    residual: Box<ResidualFn>,
}

impl FiniteDiffCostFunction {
    pub fn new<F>(name: impl Into<String>, dim: usize, residual: F) -> Self
    where
        F: Fn(&[&ManifoldElement], &[&ManifoldElement]) -> CoreResult<DVector<f64>>
            + Send
            + Sync
            + 'static,
    {
        FiniteDiffCostFunction {
            name: name.into(),
            dim,
            step: DEFAULT_FD_STEP,
            residual: Box::new(residual),
        }
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }
}

impl std::fmt::Debug for FiniteDiffCostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiniteDiffCostFunction")
            .field("name", &self.name)
            .field("dim", &self.dim)
            .field("step", &self.step)
            .finish()
    }
}

impl CostFunction for FiniteDiffCostFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn evaluate(
        &self,
        optim: &[&ManifoldElement],
        aux: &[&ManifoldElement],
        compute_jacobian: bool,
    ) -> CoreResult<(DVector<f64>, Option<DMatrix<f64>>)> {
        let residual = (self.residual)(optim, aux)?;
        let jacobian = if compute_jacobian {
            Some(numeric_jacobian(optim, self.step, |perturbed| {
                (self.residual)(perturbed, aux)
            })?)
        } else {
            None
        };
        Ok((residual, jacobian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::BetweenFactor;
    use crate::manifold::se2::SE2;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-5;

    #[test]
    fn test_matches_analytic_between() -> TestResult {
        let measured: ManifoldElement = SE2::from_xy_angle(1.0, -0.2, 0.4).into();
        let analytic = BetweenFactor::new(measured.clone());
        let numeric = FiniteDiffCostFunction::new("between", 3, move |optim, _| {
            Ok(measured.between(&optim[0].between(optim[1])?)?.log())
        });

        let x0: ManifoldElement = SE2::from_xy_angle(0.2, 0.1, -0.3).into();
        let x1: ManifoldElement = SE2::from_xy_angle(1.4, -0.5, 0.2).into();
        let (r_a, j_a) = analytic.evaluate(&[&x0, &x1], &[], true)?;
        let (r_n, j_n) = numeric.evaluate(&[&x0, &x1], &[], true)?;
        assert!((r_a - r_n).norm() < 1e-12);
        assert!((j_a.ok_or("missing")? - j_n.ok_or("missing")?).norm() < TOLERANCE);
        assert_eq!(numeric.name(), "between");
        Ok(())
    }

    #[test]
    fn test_residual_errors_propagate() {
        let cost = FiniteDiffCostFunction::new("fails", 1, |_, _| {
            Err(crate::core::CoreError::NumericalError("boom".into()))
        });
        let x = ManifoldElement::vector(&[0.0]);
        assert!(cost.evaluate(&[&x], &[], true).is_err());
    }
}
