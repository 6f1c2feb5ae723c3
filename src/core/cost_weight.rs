//! Residual weights.
//!
//! A weight `W` is applied to a cost as `r_w = W r` and `J_w = W J`, so the objective
//! minimizes `Σ ||W r||²`. All supported weights are diagonal; a scalar weight is the
//! special case of a constant diagonal.
//!
//! Learned weights read their value from an auxiliary `Vector` variable registered in the
//! objective. Their values therefore change with [`Objective::update`] and they receive
//! gradients from the backward pass like any other auxiliary input.
//!
//! [`Objective::update`]: crate::core::objective::Objective::update

use crate::core::{CoreError, CoreResult, WeightId, variable::Variable};
use crate::manifold::{ManifoldElement, ManifoldType};
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone)]
pub enum WeightKind {
    Scale(f64),
    Diagonal(DVector<f64>),
    /// Scalar weight read from a 1-dimensional Vector variable
    LearnedScale(Variable),
    /// Diagonal weight read from a Vector variable of the cost's dimension
    LearnedDiagonal(Variable),
}

#[derive(Debug, Clone)]
pub struct CostWeight {
    id: WeightId,
    kind: WeightKind,
}

fn check_finite(values: &[f64]) -> CoreResult<()> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(CoreError::InvalidInput("cost weight must be finite".into()).log());
    }
    Ok(())
}

fn check_vector_variable(variable: &Variable, dim: Option<usize>) -> CoreResult<()> {
    if variable.manifold_type() != ManifoldType::Vector
        || dim.is_some_and(|d| variable.tangent_dim() != d)
    {
        return Err(CoreError::ShapeMismatch(format!(
            "learned weight '{}' must be a Vector variable{}, got {} of dimension {}",
            variable.name(),
            dim.map(|d| format!(" of dimension {d}")).unwrap_or_default(),
            variable.manifold_type(),
            variable.tangent_dim()
        ))
        .log());
    }
    Ok(())
}

impl CostWeight {
    fn with_kind(kind: WeightKind) -> Self {
        CostWeight {
            id: WeightId::next(),
            kind,
        }
    }

    /// Unit weight.
    pub fn identity() -> Self {
        Self::with_kind(WeightKind::Scale(1.0))
    }

    pub fn scale(scale: f64) -> CoreResult<Self> {
        check_finite(&[scale])?;
        Ok(Self::with_kind(WeightKind::Scale(scale)))
    }

    pub fn diagonal(diagonal: DVector<f64>) -> CoreResult<Self> {
        check_finite(diagonal.as_slice())?;
        Ok(Self::with_kind(WeightKind::Diagonal(diagonal)))
    }

    pub fn learned_scale(variable: Variable) -> CoreResult<Self> {
        check_vector_variable(&variable, Some(1))?;
        Ok(Self::with_kind(WeightKind::LearnedScale(variable)))
    }

    pub fn learned_diagonal(variable: Variable) -> CoreResult<Self> {
        check_vector_variable(&variable, None)?;
        Ok(Self::with_kind(WeightKind::LearnedDiagonal(variable)))
    }

    pub fn id(&self) -> WeightId {
        self.id
    }

    pub fn kind(&self) -> &WeightKind {
        &self.kind
    }

    /// The auxiliary variable a learned weight reads from.
    pub fn learned_variable(&self) -> Option<&Variable> {
        match &self.kind {
            WeightKind::LearnedScale(v) | WeightKind::LearnedDiagonal(v) => Some(v),
            _ => None,
        }
    }

    /// Check that the weight can be applied to a residual of dimension `dim`.
    pub fn check_dimension(&self, dim: usize) -> CoreResult<()> {
        let actual = match &self.kind {
            WeightKind::Diagonal(d) => d.len(),
            WeightKind::LearnedDiagonal(v) => v.tangent_dim(),
            WeightKind::Scale(_) | WeightKind::LearnedScale(_) => return Ok(()),
        };
        if actual != dim {
            return Err(CoreError::ShapeMismatch(format!(
                "diagonal weight of size {actual} for a residual of dimension {dim}"
            ))
            .log());
        }
        Ok(())
    }

    /// Diagonal of `W` for a residual of dimension `dim`.
    ///
    /// `learned` is the current value of the learned weight variable for this batch
    /// element; it is ignored by fixed weights.
    pub fn diagonal_values(
        &self,
        dim: usize,
        learned: Option<&ManifoldElement>,
    ) -> CoreResult<DVector<f64>> {
        let learned_vector = || {
            learned.map(ManifoldElement::to_vector).ok_or_else(|| {
                CoreError::InvalidInput(format!("no value supplied for learned weight {}", self.id))
                    .log()
            })
        };
        let diagonal = match &self.kind {
            WeightKind::Scale(s) => DVector::from_element(dim, *s),
            WeightKind::Diagonal(d) => d.clone(),
            WeightKind::LearnedScale(_) => DVector::from_element(dim, learned_vector()?[0]),
            WeightKind::LearnedDiagonal(_) => learned_vector()?,
        };
        if diagonal.len() != dim {
            return Err(CoreError::ShapeMismatch(format!(
                "weight {} has size {}, residual has dimension {dim}",
                self.id,
                diagonal.len()
            ))
            .log());
        }
        Ok(diagonal)
    }

    /// Jacobian of `W r` with respect to the learned weight variable, given the unweighted
    /// residual `r`. `None` for fixed weights.
    pub fn weighted_residual_derivative(&self, residual: &DVector<f64>) -> Option<DMatrix<f64>> {
        match &self.kind {
            WeightKind::LearnedScale(_) => Some(DMatrix::from_column_slice(
                residual.len(),
                1,
                residual.as_slice(),
            )),
            WeightKind::LearnedDiagonal(_) => Some(DMatrix::from_diagonal(residual)),
            _ => None,
        }
    }
}

/// Apply a diagonal weight in place: `r ← W r`, `J ← W J`.
pub fn apply_diagonal(
    diagonal: &DVector<f64>,
    residual: &mut DVector<f64>,
    jacobian: Option<&mut DMatrix<f64>>,
) {
    residual.component_mul_assign(diagonal);
    if let Some(jacobian) = jacobian {
        for (i, w) in diagonal.iter().enumerate() {
            jacobian.row_mut(i).scale_mut(*w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_weight_ids_unique() {
        let a = CostWeight::identity();
        let b = CostWeight::identity();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_apply_diagonal() -> TestResult {
        let w = CostWeight::diagonal(DVector::from_vec(vec![2.0, 0.5]))?;
        let d = w.diagonal_values(2, None)?;
        let mut r = DVector::from_vec(vec![1.0, 4.0]);
        let mut j = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 2.0, 2.0]);
        apply_diagonal(&d, &mut r, Some(&mut j));
        assert_eq!(r, DVector::from_vec(vec![2.0, 2.0]));
        assert_eq!(j, DMatrix::from_row_slice(2, 2, &[2.0, 2.0, 1.0, 1.0]));
        Ok(())
    }

    #[test]
    fn test_diagonal_dimension_checked() -> TestResult {
        let w = CostWeight::diagonal(DVector::from_vec(vec![1.0, 1.0]))?;
        assert!(w.check_dimension(3).is_err());
        assert!(w.check_dimension(2).is_ok());
        assert!(CostWeight::scale(f64::INFINITY).is_err());
        Ok(())
    }

    #[test]
    fn test_learned_scale_reads_variable_value() -> TestResult {
        let var = Variable::single("w", ManifoldElement::vector(&[3.0]))?;
        let w = CostWeight::learned_scale(var)?;
        let current = ManifoldElement::vector(&[5.0]);
        assert_eq!(w.diagonal_values(2, Some(&current))?, DVector::from_vec(vec![5.0, 5.0]));
        assert!(w.diagonal_values(2, None).is_err());

        let r = DVector::from_vec(vec![1.0, -2.0]);
        let dr = w.weighted_residual_derivative(&r).ok_or("missing derivative")?;
        assert_eq!(dr.shape(), (2, 1));
        Ok(())
    }

    #[test]
    fn test_learned_weight_must_be_vector() -> TestResult {
        let var = Variable::single("w", ManifoldElement::vector(&[1.0, 2.0]))?;
        assert!(CostWeight::learned_scale(var.clone()).is_err());
        assert!(CostWeight::learned_diagonal(var).is_ok());
        Ok(())
    }
}
