//! Numerical helpers shared by cost functions, linearization and tests.

use crate::core::{CoreError, CoreResult};
use crate::manifold::ManifoldElement;
use nalgebra::{DMatrix, DVector};

/// Default central-difference step in tangent coordinates.
pub const DEFAULT_FD_STEP: f64 = 1e-6;

/// Central-difference Jacobian of `f` with respect to the tangent coordinates of `values`.
///
/// Each element is perturbed with a right retraction `x ⊕ ±h·eₖ`, so columns are in the
/// right-tangent convention and ordered like `values` (one block of `tangent_dim` columns
/// per element).
pub fn numeric_jacobian<F>(
    values: &[&ManifoldElement],
    step: f64,
    mut f: F,
) -> CoreResult<DMatrix<f64>>
where
    F: FnMut(&[&ManifoldElement]) -> CoreResult<DVector<f64>>,
{
    if step <= 0.0 || !step.is_finite() {
        return Err(CoreError::InvalidInput(format!(
            "finite difference step must be positive, got {step}"
        ))
        .log());
    }

    let mut perturbed: Vec<ManifoldElement> = values.iter().map(|v| (*v).clone()).collect();
    let mut columns: Vec<DVector<f64>> = Vec::new();

    for (i, value) in values.iter().enumerate() {
        let dim = value.tangent_dim();
        for k in 0..dim {
            let mut delta = DVector::zeros(dim);

            delta[k] = step;
            perturbed[i] = value.retract(&delta)?;
            let plus = f(&perturbed.iter().collect::<Vec<_>>())?;

            delta[k] = -step;
            perturbed[i] = value.retract(&delta)?;
            let minus = f(&perturbed.iter().collect::<Vec<_>>())?;

            if plus.len() != minus.len() {
                return Err(CoreError::ShapeMismatch(format!(
                    "residual changed size under perturbation ({} vs {})",
                    plus.len(),
                    minus.len()
                ))
                .log());
            }
            columns.push((plus - minus) / (2.0 * step));
        }
        perturbed[i] = (*value).clone();
    }

    let rows = match columns.first() {
        Some(column) => column.len(),
        None => f(values)?.len(),
    };
    if columns.iter().any(|c| c.len() != rows) {
        return Err(CoreError::ShapeMismatch("inconsistent residual sizes".into()).log());
    }

    let mut jacobian = DMatrix::zeros(rows, columns.len());
    for (j, column) in columns.iter().enumerate() {
        jacobian.set_column(j, column);
    }
    Ok(jacobian)
}

/// True when every entry is finite.
pub fn all_finite<'a, I>(values: I) -> bool
where
    I: IntoIterator<Item = &'a f64>,
{
    values.into_iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{ManifoldType, TangentConvention};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-6;

    #[test]
    fn test_numeric_jacobian_of_linear_map() -> TestResult {
        let x = ManifoldElement::vector(&[1.0, 2.0]);
        let jac = numeric_jacobian(&[&x], DEFAULT_FD_STEP, |v| {
            let d = v[0].to_vector();
            Ok(DVector::from_vec(vec![3.0 * d[0] - d[1], d[0] * 0.5, 2.0 * d[1]]))
        })?;
        let expected = DMatrix::from_row_slice(3, 2, &[3.0, -1.0, 0.5, 0.0, 0.0, 2.0]);
        assert!((jac - expected).norm() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_numeric_jacobian_of_local_is_right_jacobian_inverse() -> TestResult {
        let tangent = DVector::from_vec(vec![0.3, -0.2, 0.5]);
        let g = ManifoldElement::exp(ManifoldType::SE2, &tangent)?;
        let identity = g.identity_like();
        let jac = numeric_jacobian(&[&g], DEFAULT_FD_STEP, |v| {
            Ok(identity.local_with(v[0], TangentConvention::Right)?)
        })?;
        // d log(g ⊕ δ)/dδ = Jr⁻¹(log g), which is invertible and close to I for small g.
        assert_eq!(jac.shape(), (3, 3));
        assert!((jac.determinant() - 1.0).abs() < 0.1);
        Ok(())
    }

    #[test]
    fn test_invalid_step_rejected() {
        let x = ManifoldElement::vector(&[1.0]);
        assert!(numeric_jacobian(&[&x], 0.0, |v| Ok(v[0].to_vector())).is_err());
    }

    #[test]
    fn test_all_finite() {
        assert!(all_finite(&[1.0, 2.0]));
        assert!(!all_finite(&[1.0, f64::NAN]));
    }
}
