//! Named, batched manifold variables.
//!
//! A [`Variable`] holds one value per batch element (or a single value that broadcasts
//! over the batch). Its [`VariableId`] is assigned at construction and is what the
//! objective uses to tell variables apart; the name is only a lookup key, so two
//! variables may share a name as long as they never meet in the same objective.

use crate::core::{CoreError, CoreResult, VariableId};
use crate::manifold::{ManifoldElement, ManifoldType, TangentConvention, batch};
use nalgebra::DVector;

/// Tolerance for the manifold validity check applied to stored values.
pub const VALIDITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    id: VariableId,
    name: String,
    values: Vec<ManifoldElement>,
}

/// Check that `values` is non-empty, homogeneous and on the manifold.
pub(crate) fn validate_values(name: &str, values: &[ManifoldElement]) -> CoreResult<()> {
    let first = values.first().ok_or_else(|| {
        CoreError::ShapeMismatch(format!("variable '{name}' needs at least one value")).log()
    })?;
    for (b, value) in values.iter().enumerate() {
        if !value.same_space(first) {
            return Err(CoreError::ShapeMismatch(format!(
                "variable '{name}': element {b} is {} of tangent dimension {}, expected {} of \
                 tangent dimension {}",
                value.manifold_type(),
                value.tangent_dim(),
                first.manifold_type(),
                first.tangent_dim()
            ))
            .log());
        }
        if !value.is_valid(VALIDITY_TOLERANCE) {
            return Err(CoreError::ShapeMismatch(format!(
                "variable '{name}': element {b} violates the {} constraint",
                value.manifold_type()
            ))
            .log());
        }
    }
    Ok(())
}

impl Variable {
    /// Create a batched variable. All values must share one manifold type and dimension.
    pub fn new(name: impl Into<String>, values: Vec<ManifoldElement>) -> CoreResult<Self> {
        let name = name.into();
        validate_values(&name, &values)?;
        Ok(Variable {
            id: VariableId::next(),
            name,
            values,
        })
    }

    /// Create a variable with a single value that broadcasts over any batch.
    pub fn single(name: impl Into<String>, value: ManifoldElement) -> CoreResult<Self> {
        Variable::new(name, vec![value])
    }

    /// Vector variable from raw entries, one row per batch element.
    pub fn vector(name: impl Into<String>, rows: &[&[f64]]) -> CoreResult<Self> {
        Variable::new(
            name,
            rows.iter().map(|row| ManifoldElement::vector(row)).collect(),
        )
    }

    pub fn id(&self) -> VariableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[ManifoldElement] {
        &self.values
    }

    /// Value used for batch element `b` (broadcast when the variable holds one value).
    pub fn value(&self, b: usize) -> &ManifoldElement {
        batch::at(&self.values, b)
    }

    pub fn batch_size(&self) -> usize {
        self.values.len()
    }

    pub fn manifold_type(&self) -> ManifoldType {
        self.values[0].manifold_type()
    }

    pub fn tangent_dim(&self) -> usize {
        self.values[0].tangent_dim()
    }

    /// Replace the stored values after validating them against the current shape.
    pub fn set_values(&mut self, values: Vec<ManifoldElement>) -> CoreResult<()> {
        self.check_compatible(&values)?;
        self.values = values;
        Ok(())
    }

    /// Validate `values` as a replacement for the current values without storing them.
    pub fn check_compatible(&self, values: &[ManifoldElement]) -> CoreResult<()> {
        validate_values(&self.name, values)?;
        if !values[0].same_space(&self.values[0]) {
            return Err(CoreError::ShapeMismatch(format!(
                "variable '{}' is {} of tangent dimension {}, got {} of tangent dimension {}",
                self.name,
                self.manifold_type(),
                self.tangent_dim(),
                values[0].manifold_type(),
                values[0].tangent_dim()
            ))
            .log());
        }
        Ok(())
    }

    pub(crate) fn set_values_unchecked(&mut self, values: Vec<ManifoldElement>) {
        self.values = values;
    }

    /// Overwrite the value used by batch element `b` in place. A broadcast variable has
    /// its single shared value replaced.
    pub(crate) fn set_value(&mut self, b: usize, value: ManifoldElement) {
        let index = if self.values.len() == 1 { 0 } else { b };
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    /// Broadcast a single value to `batch_size` copies.
    pub(crate) fn expand(&mut self, batch_size: usize) -> CoreResult<()> {
        self.values = batch::expand(&self.values, batch_size).map_err(|e| {
            CoreError::ShapeMismatch(format!("variable '{}': {e}", self.name)).log()
        })?;
        Ok(())
    }

    /// Retract every batch element by its tangent step.
    pub fn retract(
        &self,
        deltas: &[DVector<f64>],
        convention: TangentConvention,
    ) -> CoreResult<Vec<ManifoldElement>> {
        Ok(batch::retract(&self.values, deltas, convention)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{se2::SE2, so2::SO2};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_variable_ids_differ_for_equal_names() -> TestResult {
        let a = Variable::single("x", ManifoldElement::vector(&[1.0]))?;
        let b = Variable::single("x", ManifoldElement::vector(&[1.0]))?;
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), b.name());
        Ok(())
    }

    #[test]
    fn test_variable_rejects_mixed_types() {
        let values = vec![
            ManifoldElement::SE2(SE2::identity()),
            ManifoldElement::SO2(SO2::identity()),
        ];
        assert!(matches!(
            Variable::new("pose", values),
            Err(CoreError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_variable_rejects_mixed_vector_dims() {
        let values = vec![ManifoldElement::vector(&[1.0]), ManifoldElement::vector(&[1.0, 2.0])];
        assert!(Variable::new("v", values).is_err());
        assert!(Variable::new("empty", vec![]).is_err());
    }

    #[test]
    fn test_variable_broadcast_value() -> TestResult {
        let v = Variable::single("v", ManifoldElement::vector(&[2.0, 3.0]))?;
        assert_eq!(v.value(7), v.value(0));
        assert_eq!(v.batch_size(), 1);
        Ok(())
    }

    #[test]
    fn test_set_values_checks_shape() -> TestResult {
        let mut v = Variable::vector("v", &[&[1.0, 2.0]])?;
        assert!(v.set_values(vec![ManifoldElement::vector(&[1.0])]).is_err());
        v.set_values(vec![
            ManifoldElement::vector(&[0.0, 0.0]),
            ManifoldElement::vector(&[1.0, 1.0]),
        ])?;
        assert_eq!(v.batch_size(), 2);
        Ok(())
    }

    #[test]
    fn test_set_value_writes_one_element() -> TestResult {
        let mut v = Variable::vector("v", &[&[1.0], &[2.0], &[3.0]])?;
        v.set_value(1, ManifoldElement::vector(&[-2.0]));
        assert_eq!(v.value(0), &ManifoldElement::vector(&[1.0]));
        assert_eq!(v.value(1), &ManifoldElement::vector(&[-2.0]));
        assert_eq!(v.value(2), &ManifoldElement::vector(&[3.0]));

        let mut shared = Variable::single("s", ManifoldElement::vector(&[0.0]))?;
        shared.set_value(5, ManifoldElement::vector(&[4.0]));
        assert_eq!(shared.batch_size(), 1);
        assert_eq!(shared.value(0), &ManifoldElement::vector(&[4.0]));
        Ok(())
    }

    #[test]
    fn test_expand_broadcasts() -> TestResult {
        let mut v = Variable::single("x", ManifoldElement::SE2(SE2::from_xy_angle(1.0, 2.0, 0.3)))?;
        v.expand(4)?;
        assert_eq!(v.batch_size(), 4);
        assert!(v.value(3).is_approx(v.value(0), 1e-12));
        Ok(())
    }
}
