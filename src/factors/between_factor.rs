//! Relative constraint between two variables of the same Lie group.

use super::expect_count;
use crate::core::{CoreResult, cost_function::CostFunction};
use crate::manifold::ManifoldElement;
use nalgebra::{DMatrix, DVector};

/// Between factor for relative pose (or rotation, or vector offset) constraints.
///
/// # Mathematical Formulation
///
/// Given two variables `x_i`, `x_j` and a measured relative transform `m`:
///
/// ```text
/// E = x_i⁻¹ ∘ x_j
/// D = m⁻¹ ∘ E
/// r = log(D)
/// ```
///
/// With right perturbations the Jacobians are
///
/// ```text
/// ∂r/∂x_i = -Jr⁻¹(r) · Ad(E⁻¹)
/// ∂r/∂x_j =  Jr⁻¹(r)
/// ∂r/∂m   = -Jr⁻¹(r) · Ad(D⁻¹)
/// ```
///
/// The residual has the tangent dimension of the group (SE3: 6, SE2: 3, SO3: 3, SO2: 1,
/// Rⁿ: n) and the Jacobian is `dof × 2·dof`.
///
/// # Example
///
/// ```
/// use apex_diffopt::core::cost_function::CostFunction;
/// use apex_diffopt::factors::BetweenFactor;
/// use apex_diffopt::manifold::{ManifoldElement, se2::SE2};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // Robot moved 1m forward and rotated 0.1 rad
/// let between = BetweenFactor::new(SE2::from_xy_angle(1.0, 0.0, 0.1).into());
///
/// let pose_i = ManifoldElement::from(SE2::from_xy_angle(0.0, 0.0, 0.0));
/// let pose_j = ManifoldElement::from(SE2::from_xy_angle(1.0, 0.0, 0.1));
/// let (residual, jacobian) = between.evaluate(&[&pose_i, &pose_j], &[], true)?;
/// assert!(residual.norm() < 1e-12);
/// assert_eq!(jacobian.map(|j| j.shape()), Some((3, 6)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BetweenFactor {
    dim: usize,
    measured: Option<ManifoldElement>,
}

impl BetweenFactor {
    /// Fixed measurement.
    pub fn new(measured: ManifoldElement) -> Self {
        BetweenFactor {
            dim: measured.tangent_dim(),
            measured: Some(measured),
        }
    }

    /// Measurement read from the first auxiliary variable; `dim` is the tangent dimension.
    pub fn with_measured_input(dim: usize) -> Self {
        BetweenFactor {
            dim,
            measured: None,
        }
    }

    pub fn measured(&self) -> Option<&ManifoldElement> {
        self.measured.as_ref()
    }

    fn measurement<'a>(&'a self, aux: &[&'a ManifoldElement]) -> CoreResult<&'a ManifoldElement> {
        match &self.measured {
            Some(m) => Ok(m),
            None => {
                expect_count(self.name(), "auxiliary", aux, 1)?;
                Ok(aux[0])
            }
        }
    }

    /// `(E, D)` for the current values.
    fn relative(
        &self,
        optim: &[&ManifoldElement],
        aux: &[&ManifoldElement],
    ) -> CoreResult<(ManifoldElement, ManifoldElement)> {
        expect_count(self.name(), "optimization", optim, 2)?;
        let relative = optim[0].between(optim[1])?;
        let difference = self.measurement(aux)?.between(&relative)?;
        Ok((relative, difference))
    }
}

impl CostFunction for BetweenFactor {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn optim_tangent_dims(&self) -> Option<Vec<usize>> {
        Some(vec![self.dim, self.dim])
    }

    fn aux_tangent_dims(&self) -> Option<Vec<usize>> {
        Some(if self.measured.is_some() {
            vec![]
        } else {
            vec![self.dim]
        })
    }

    fn evaluate(
        &self,
        optim: &[&ManifoldElement],
        aux: &[&ManifoldElement],
        compute_jacobian: bool,
    ) -> CoreResult<(DVector<f64>, Option<DMatrix<f64>>)> {
        let (relative, difference) = self.relative(optim, aux)?;
        let residual = difference.log();

        let jacobian = compute_jacobian.then(|| {
            let j_log = difference.log_jacobian();
            let j_i = -(&j_log * relative.inverse().adjoint());

            let mut jacobian = DMatrix::zeros(self.dim, 2 * self.dim);
            jacobian.columns_mut(0, self.dim).copy_from(&j_i);
            jacobian.columns_mut(self.dim, self.dim).copy_from(&j_log);
            jacobian
        });
        Ok((residual, jacobian))
    }

    fn aux_jacobian(
        &self,
        optim: &[&ManifoldElement],
        aux: &[&ManifoldElement],
    ) -> Option<CoreResult<DMatrix<f64>>> {
        if self.measured.is_some() {
            return Some(Ok(DMatrix::zeros(self.dim, 0)));
        }
        Some(
            self.relative(optim, aux)
                .map(|(_, d)| -(d.log_jacobian() * d.inverse().adjoint())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{ManifoldType, se2::SE2, se3::SE3};
    use crate::utils::{DEFAULT_FD_STEP, numeric_jacobian};
    use nalgebra::{UnitQuaternion, Vector3};
    use rand::{SeedableRng, rngs::StdRng};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-5;

    #[test]
    fn test_se2_between_zero_residual_at_measurement() -> TestResult {
        let factor = BetweenFactor::new(SE2::from_xy_angle(1.0, 0.5, 0.1).into());
        let x0 = ManifoldElement::from(SE2::from_xy_angle(0.0, 0.0, 0.0));
        let x1 = ManifoldElement::from(SE2::from_xy_angle(1.0, 0.5, 0.1));
        let (residual, jacobian) = factor.evaluate(&[&x0, &x1], &[], true)?;
        assert!(residual.norm() < 1e-10, "Residual norm: {}", residual.norm());
        let jacobian = jacobian.ok_or("missing Jacobian")?;
        assert_eq!(jacobian.shape(), (3, 6));
        assert!(jacobian.norm() > 1e-10);
        Ok(())
    }

    #[test]
    fn test_se3_between_jacobian_matches_finite_difference() -> TestResult {
        let measured = SE3::new(
            Vector3::new(1.0, 0.2, -0.3),
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.4),
        );
        let factor = BetweenFactor::new(measured.into());
        let x0 = ManifoldElement::from(SE3::new(
            Vector3::new(0.3, -0.1, 0.2),
            UnitQuaternion::from_euler_angles(0.3, 0.1, -0.5),
        ));
        let x1 = ManifoldElement::from(SE3::new(
            Vector3::new(1.1, 0.4, 0.0),
            UnitQuaternion::from_euler_angles(0.2, -0.3, 0.2),
        ));
        let (_, jacobian) = factor.evaluate(&[&x0, &x1], &[], true)?;
        let numeric = numeric_jacobian(&[&x0, &x1], DEFAULT_FD_STEP, |v| {
            Ok(factor.evaluate(v, &[], false)?.0)
        })?;
        assert!((jacobian.ok_or("missing Jacobian")? - numeric).norm() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_measured_input_jacobians_all_groups() -> TestResult {
        let mut rng = StdRng::seed_from_u64(11);
        for kind in [ManifoldType::SO2, ManifoldType::SO3, ManifoldType::SE2, ManifoldType::SE3] {
            let x0 = ManifoldElement::random(kind, 0, 0.7, &mut rng);
            let x1 = ManifoldElement::random(kind, 0, 0.7, &mut rng);
            let m = ManifoldElement::random(kind, 0, 0.7, &mut rng);
            let factor = BetweenFactor::with_measured_input(x0.tangent_dim());

            let (_, jacobian) = factor.evaluate(&[&x0, &x1], &[&m], true)?;
            let numeric = numeric_jacobian(&[&x0, &x1], DEFAULT_FD_STEP, |v| {
                Ok(factor.evaluate(v, &[&m], false)?.0)
            })?;
            assert!((jacobian.ok_or("missing Jacobian")? - numeric).norm() < TOLERANCE, "{kind}");

            let aux = factor.aux_jacobian(&[&x0, &x1], &[&m]).ok_or("missing aux")??;
            let numeric = numeric_jacobian(&[&m], DEFAULT_FD_STEP, |v| {
                Ok(factor.evaluate(&[&x0, &x1], v, false)?.0)
            })?;
            assert!((aux - numeric).norm() < TOLERANCE, "{kind}");
        }
        Ok(())
    }

    #[test]
    fn test_vector_between_is_offset() -> TestResult {
        let factor = BetweenFactor::new(ManifoldElement::vector(&[1.0, 1.0]));
        let a = ManifoldElement::vector(&[0.0, 0.0]);
        let b = ManifoldElement::vector(&[2.0, 0.5]);
        let (residual, _) = factor.evaluate(&[&a, &b], &[], false)?;
        assert!((residual - DVector::from_vec(vec![1.0, -0.5])).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_type_mismatch_is_error() {
        let factor = BetweenFactor::new(SE2::identity().into());
        let a = ManifoldElement::from(SE2::identity());
        let b = ManifoldElement::vector(&[0.0, 0.0, 0.0]);
        assert!(factor.evaluate(&[&a, &b], &[], false).is_err());
    }
}
