//! A cost function registered in an objective.
//!
//! The block owns the cost, its weight and optional robust loss, and refers to its
//! variables by [`VariableId`]. The objective resolves those ids to values for a batch
//! element and calls into the block; the block then produces the weighted (and, with a
//! loss, Ceres-corrected) residual and Jacobian:
//!
//! ```text
//! r_w = W r                      J_w = W J
//! r̃  = corrector(r_w)           J̃  = corrector(r_w) · J_w
//! ```

use crate::core::{
    CoreError, CoreResult, CostId, VariableId,
    corrector::Corrector,
    cost_function::{self, CostFunction},
    cost_weight::{self, CostWeight},
    loss_functions::LossFunction,
};
use crate::manifold::ManifoldElement;
use crate::utils::all_finite;
use nalgebra::{DMatrix, DVector};

/// Values of a block's variables for one batch element.
pub struct BlockValues<'a> {
    pub optim: Vec<&'a ManifoldElement>,
    pub aux: Vec<&'a ManifoldElement>,
    /// Current value of the learned weight variable, if any
    pub weight: Option<&'a ManifoldElement>,
}

/// Residual and Jacobian of one block, weighted and corrected, right-tangent convention.
#[derive(Debug, Clone)]
pub struct BlockLinearization {
    pub residual: DVector<f64>,
    pub jacobian: DMatrix<f64>,
}

/// Derivatives of a block's corrected residual with respect to its inputs.
#[derive(Debug, Clone)]
pub struct BlockInputJacobian {
    /// Columns follow the block's auxiliary variables
    pub aux: DMatrix<f64>,
    /// Columns follow the learned weight variable
    pub weight: Option<DMatrix<f64>>,
}

pub struct ResidualBlock {
    pub id: CostId,
    pub name: String,
    pub optim_keys: Vec<VariableId>,
    pub aux_keys: Vec<VariableId>,
    pub cost: Box<dyn CostFunction>,
    pub weight: CostWeight,
    pub loss: Option<Box<dyn LossFunction>>,
}

impl std::fmt::Debug for ResidualBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidualBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("optim_keys", &self.optim_keys)
            .field("aux_keys", &self.aux_keys)
            .field("weight", &self.weight.id())
            .field("robust", &self.loss.is_some())
            .finish()
    }
}

impl ResidualBlock {
    pub fn new(
        optim_keys: Vec<VariableId>,
        aux_keys: Vec<VariableId>,
        cost: Box<dyn CostFunction>,
        weight: CostWeight,
        loss: Option<Box<dyn LossFunction>>,
    ) -> Self {
        ResidualBlock {
            id: CostId::next(),
            name: cost.name().to_string(),
            optim_keys,
            aux_keys,
            cost,
            weight,
            loss,
        }
    }

    pub fn dimension(&self) -> usize {
        self.cost.dimension()
    }

    fn check_finite(&self, what: &str, values: &[f64]) -> CoreResult<()> {
        if !all_finite(values) {
            return Err(CoreError::NumericalError(format!(
                "cost '{}' ({}) produced a non-finite {what}",
                self.name, self.id
            ))
            .log());
        }
        Ok(())
    }

    /// `W r` without robust correction.
    pub fn weighted_residual(&self, values: &BlockValues<'_>) -> CoreResult<DVector<f64>> {
        let mut residual =
            cost_function::evaluate_residual(&*self.cost, &values.optim, &values.aux)?;
        let diagonal = self.weight.diagonal_values(residual.len(), values.weight)?;
        cost_weight::apply_diagonal(&diagonal, &mut residual, None);
        self.check_finite("residual", residual.as_slice())?;
        Ok(residual)
    }

    /// Contribution to the objective error: `ρ(||W r||²)`, or `||W r||²` without a loss.
    pub fn error(&self, values: &BlockValues<'_>) -> CoreResult<f64> {
        let s = self.weighted_residual(values)?.norm_squared();
        Ok(match &self.loss {
            Some(loss) => loss.evaluate(s)[0],
            None => s,
        })
    }

    fn corrector(&self, weighted_residual: &DVector<f64>) -> Option<Corrector> {
        self.loss
            .as_ref()
            .map(|loss| Corrector::new(loss.as_ref(), weighted_residual.norm_squared()))
    }

    /// Weighted, corrected residual and Jacobian.
    pub fn linearize(&self, values: &BlockValues<'_>) -> CoreResult<BlockLinearization> {
        let (mut residual, mut jacobian) =
            cost_function::evaluate_checked(&*self.cost, &values.optim, &values.aux)?;
        let diagonal = self.weight.diagonal_values(residual.len(), values.weight)?;
        cost_weight::apply_diagonal(&diagonal, &mut residual, Some(&mut jacobian));

        if let Some(corrector) = self.corrector(&residual) {
            corrector.correct_jacobian(&residual, &mut jacobian);
            corrector.correct_residuals(&mut residual);
        }

        self.check_finite("residual", residual.as_slice())?;
        self.check_finite("Jacobian", jacobian.as_slice())?;
        Ok(BlockLinearization { residual, jacobian })
    }

    /// Jacobians of the corrected residual with respect to the auxiliary variables and the
    /// learned weight. The robust correction is held fixed at the current point.
    pub fn input_jacobian(&self, values: &BlockValues<'_>) -> CoreResult<BlockInputJacobian> {
        let raw = cost_function::evaluate_residual(&*self.cost, &values.optim, &values.aux)?;
        let diagonal = self.weight.diagonal_values(raw.len(), values.weight)?;

        let mut aux = if values.aux.is_empty() {
            DMatrix::zeros(raw.len(), 0)
        } else {
            cost_function::aux_jacobian(&*self.cost, &values.optim, &values.aux)?
        };
        let mut weighted = raw.clone();
        cost_weight::apply_diagonal(&diagonal, &mut weighted, Some(&mut aux));
        let mut weight = self.weight.weighted_residual_derivative(&raw);

        if let Some(corrector) = self.corrector(&weighted) {
            corrector.correct_jacobian(&weighted, &mut aux);
            if let Some(w) = weight.as_mut() {
                corrector.correct_jacobian(&weighted, w);
            }
        }

        self.check_finite("auxiliary Jacobian", aux.as_slice())?;
        if let Some(w) = &weight {
            self.check_finite("weight Jacobian", w.as_slice())?;
        }
        Ok(BlockInputJacobian { aux, weight })
    }
}
