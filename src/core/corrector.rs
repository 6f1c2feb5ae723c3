//! Ceres-style corrector for robust losses.
//!
//! Given a weighted residual `r`, its Jacobian `J` and a loss ρ evaluated at `s = ||r||²`,
//! the corrector rescales both so that the Gauss-Newton model of `ρ(||r||²)` becomes an
//! ordinary least-squares model:
//!
//! ```text
//! α  = 1 - sqrt(1 + 2 s ρ''/ρ')          (0 when ρ'' ≤ 0 would make it imaginary)
//! r̃  = sqrt(ρ') / (1 - α) · r
//! J̃  = sqrt(ρ') · (I - α r rᵀ / s) · J
//! ```
//!
//! Reference: Triggs et al., "Bundle Adjustment: A Modern Synthesis", and the Ceres
//! `Corrector` class.

use crate::core::loss_functions::LossFunction;
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    pub fn new(loss_function: &dyn LossFunction, sq_norm: f64) -> Self {
        let [_, rho_1, rho_2] = loss_function.evaluate(sq_norm);
        let sqrt_rho1 = rho_1.max(0.0).sqrt();

        if sq_norm == 0.0 || rho_2 <= 0.0 || rho_1 <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        // The Hessian model stays positive semi-definite only while D ≥ 0.
        let d = (1.0 + 2.0 * sq_norm * rho_2 / rho_1).max(0.0);
        let alpha = 1.0 - d.sqrt();

        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    /// Apply the correction to a Jacobian whose rows match `residual`.
    ///
    /// `residual` must be the uncorrected residual.
    pub fn correct_jacobian(&self, residual: &DVector<f64>, jacobian: &mut DMatrix<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }
        let rt_j = residual.transpose() * &*jacobian;
        let r_rt_j = residual * rt_j;
        *jacobian -= r_rt_j * self.alpha_sq_norm;
        *jacobian *= self.sqrt_rho1;
    }

    pub fn correct_residuals(&self, residual: &mut DVector<f64>) {
        *residual *= self.residual_scaling;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::{CauchyLoss, HuberLoss, L2Loss};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_corrector_l2_is_identity() {
        let loss = L2Loss::new();
        let residual = DVector::from_vec(vec![3.0, -4.0]);
        let corrector = Corrector::new(&loss, residual.norm_squared());
        let mut r = residual.clone();
        let mut j = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let j_before = j.clone();
        corrector.correct_jacobian(&residual, &mut j);
        corrector.correct_residuals(&mut r);
        assert!((r - residual).norm() < 1e-12);
        assert!((j - j_before).norm() < 1e-12);
    }

    #[test]
    fn test_corrector_huber_inlier_untouched() -> TestResult {
        let loss = HuberLoss::new(1.0)?;
        let residual = DVector::from_vec(vec![0.1, 0.2, 0.1]);
        let corrector = Corrector::new(&loss, residual.norm_squared());
        let mut corrected = residual.clone();
        corrector.correct_residuals(&mut corrected);
        assert!((corrected - residual).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_corrector_cauchy_shrinks_outlier() -> TestResult {
        let loss = CauchyLoss::new(1.0)?;
        let residual = DVector::from_vec(vec![2.0, 3.0]);
        let corrector = Corrector::new(&loss, residual.norm_squared());
        let mut corrected = residual.clone();
        corrector.correct_residuals(&mut corrected);
        assert!(corrected.norm() < residual.norm());
        assert!(corrected.norm() > 0.0);
        Ok(())
    }

    #[test]
    fn test_corrected_gradient_matches_robust_gradient() -> TestResult {
        // ∇ ½ρ(||r||²) = ρ' Jᵀ r must equal J̃ᵀ r̃.
        let loss = HuberLoss::new(1.0)?;
        let residual = DVector::from_vec(vec![2.0, -1.0]);
        let jacobian = DMatrix::from_row_slice(2, 3, &[1.0, 0.5, 0.0, -0.3, 2.0, 1.0]);
        let s = residual.norm_squared();
        let [_, rho1, _] = loss.evaluate(s);

        let corrector = Corrector::new(&loss, s);
        let mut j = jacobian.clone();
        let mut r = residual.clone();
        corrector.correct_jacobian(&residual, &mut j);
        corrector.correct_residuals(&mut r);

        let expected = jacobian.transpose() * &residual * rho1;
        let actual = j.transpose() * r;
        assert!((expected - actual).norm() < 1e-10);
        Ok(())
    }
}
