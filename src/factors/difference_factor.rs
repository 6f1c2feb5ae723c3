//! Difference between a variable and a target on the same manifold.

use super::expect_count;
use crate::core::{CoreResult, cost_function::CostFunction};
use crate::manifold::ManifoldElement;
use nalgebra::{DMatrix, DVector};

/// Unary cost pulling a variable towards a target.
///
/// # Mathematical Formulation
///
/// ```text
/// D = target⁻¹ ∘ x
/// r = log(D)                     (= x - target for vectors)
/// ∂r/∂x      =  Jr⁻¹(r)
/// ∂r/∂target = -Jr⁻¹(r) · Ad(D⁻¹)
/// ```
///
/// The target is either fixed at construction ([`with_target`](Self::with_target)) or the
/// first auxiliary variable ([`new`](Self::new)), which makes it a differentiable input.
///
/// # Example
///
/// ```
/// use apex_diffopt::core::cost_function::CostFunction;
/// use apex_diffopt::factors::DifferenceFactor;
/// use apex_diffopt::manifold::ManifoldElement;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let prior = DifferenceFactor::with_target(ManifoldElement::vector(&[1.0, 2.0]));
/// let x = ManifoldElement::vector(&[1.5, 2.3]);
/// let (residual, _) = prior.evaluate(&[&x], &[], false)?;
/// assert!((residual[0] - 0.5).abs() < 1e-10);
/// assert!((residual[1] - 0.3).abs() < 1e-10);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DifferenceFactor {
    dim: usize,
    target: Option<ManifoldElement>,
}

impl DifferenceFactor {
    /// Target read from the first auxiliary variable; `dim` is the tangent dimension.
    pub fn new(dim: usize) -> Self {
        DifferenceFactor { dim, target: None }
    }

    /// Fixed target.
    pub fn with_target(target: ManifoldElement) -> Self {
        DifferenceFactor {
            dim: target.tangent_dim(),
            target: Some(target),
        }
    }

    fn target<'a>(&'a self, aux: &[&'a ManifoldElement]) -> CoreResult<&'a ManifoldElement> {
        match &self.target {
            Some(target) => Ok(target),
            None => {
                expect_count(self.name(), "auxiliary", aux, 1)?;
                Ok(aux[0])
            }
        }
    }

    fn target_jacobian(
        &self,
        optim: &[&ManifoldElement],
        aux: &[&ManifoldElement],
    ) -> CoreResult<DMatrix<f64>> {
        expect_count(self.name(), "optimization", optim, 1)?;
        let difference = self.target(aux)?.between(optim[0])?;
        Ok(-(difference.log_jacobian() * difference.inverse().adjoint()))
    }
}

impl CostFunction for DifferenceFactor {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn optim_tangent_dims(&self) -> Option<Vec<usize>> {
        Some(vec![self.dim])
    }

    fn aux_tangent_dims(&self) -> Option<Vec<usize>> {
        Some(if self.target.is_some() { vec![] } else { vec![self.dim] })
    }

    fn evaluate(
        &self,
        optim: &[&ManifoldElement],
        aux: &[&ManifoldElement],
        compute_jacobian: bool,
    ) -> CoreResult<(DVector<f64>, Option<DMatrix<f64>>)> {
        expect_count(self.name(), "optimization", optim, 1)?;
        let difference = self.target(aux)?.between(optim[0])?;
        let jacobian = compute_jacobian.then(|| difference.log_jacobian());
        Ok((difference.log(), jacobian))
    }

    fn aux_jacobian(
        &self,
        optim: &[&ManifoldElement],
        aux: &[&ManifoldElement],
    ) -> Option<CoreResult<DMatrix<f64>>> {
        if self.target.is_some() {
            return Some(Ok(DMatrix::zeros(self.dim, 0)));
        }
        Some(self.target_jacobian(optim, aux))
    }
}
