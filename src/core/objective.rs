//! The objective: a graph of residual blocks over named, batched variables.
//!
//! ```text
//! Variables:   x0 ──── x1 ──── x2        (optimization, ordered)
//!               │       │       │
//! Costs:       c0      c1      c2        (insertion ordered)
//!               │               │
//! Auxiliary:   z0              w2        (measurements, learned weights)
//! ```
//!
//! The objective minimizes `Σ_b Σ_i ρ_i(||W_i r_i(x_b)||²)` independently for every batch
//! element `b`. Variables are deduplicated by [`VariableId`], not by name: registering a
//! second, different variable under an existing name is rejected, as is using one
//! variable both as optimization and auxiliary input.
//!
//! Every structural change (add, erase, set_ordering) draws a new `structure_version`.
//! Versions are unique across all objectives, so caches keyed by them (sparse layouts,
//! symbolic factorizations) can never confuse two objectives.
//!
//! # Example
//!
//! ```
//! use apex_diffopt::core::{cost_weight::CostWeight, objective::Objective, variable::Variable};
//! use apex_diffopt::factors::DifferenceFactor;
//! use apex_diffopt::manifold::ManifoldElement;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let x = Variable::single("x", ManifoldElement::vector(&[0.0, 0.0]))?;
//! let target = Variable::single("target", ManifoldElement::vector(&[1.0, 2.0]))?;
//!
//! let mut objective = Objective::new();
//! objective.add(
//!     Box::new(DifferenceFactor::new(2)),
//!     &[&x],
//!     &[&target],
//!     CostWeight::identity(),
//! )?;
//! assert!((objective.error(0)? - 5.0).abs() < 1e-12);
//! # Ok(())
//! # }
//! ```

use crate::core::{
    CoreError, CoreResult, CostId, VariableId,
    cost_function::CostFunction,
    cost_weight::CostWeight,
    loss_functions::LossFunction,
    ordering::{ColumnLayout, VariableOrdering},
    residual_block::{BlockValues, ResidualBlock},
    variable::Variable,
};
use crate::manifold::{ManifoldElement, batch};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static NEXT_STRUCTURE_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_structure_version() -> u64 {
    NEXT_STRUCTURE_VERSION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableRole {
    Optimization,
    Auxiliary,
}

impl std::fmt::Display for VariableRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariableRole::Optimization => write!(f, "optimization"),
            VariableRole::Auxiliary => write!(f, "auxiliary"),
        }
    }
}

#[derive(Debug)]
pub struct Objective {
    blocks: Vec<ResidualBlock>,
    variables: HashMap<VariableId, Variable>,
    names: HashMap<String, VariableId>,
    roles: HashMap<VariableId, VariableRole>,
    ordering: VariableOrdering,
    aux_order: Vec<VariableId>,
    structure_version: u64,
}

impl Default for Objective {
    fn default() -> Self {
        Self::new()
    }
}

/// Candidate registration collected during validation of [`Objective::add`].
struct Registration<'a> {
    variable: &'a Variable,
    role: VariableRole,
}

impl Objective {
    pub fn new() -> Self {
        Objective {
            blocks: Vec::new(),
            variables: HashMap::new(),
            names: HashMap::new(),
            roles: HashMap::new(),
            ordering: VariableOrdering::new(),
            aux_order: Vec::new(),
            structure_version: next_structure_version(),
        }
    }

    /// Register a cost over `optim` (optimized) and `aux` (held fixed) variables.
    ///
    /// Variables already registered (same identity) are shared; their stored values are
    /// kept. Nothing is modified when validation fails.
    pub fn add(
        &mut self,
        cost: Box<dyn CostFunction>,
        optim: &[&Variable],
        aux: &[&Variable],
        weight: CostWeight,
    ) -> CoreResult<CostId> {
        self.add_block(cost, optim, aux, weight, None)
    }

    /// Like [`add`](Self::add), with a robust loss applied to the weighted residual.
    pub fn add_robust(
        &mut self,
        cost: Box<dyn CostFunction>,
        optim: &[&Variable],
        aux: &[&Variable],
        weight: CostWeight,
        loss: Box<dyn LossFunction>,
    ) -> CoreResult<CostId> {
        self.add_block(cost, optim, aux, weight, Some(loss))
    }

    fn add_block(
        &mut self,
        cost: Box<dyn CostFunction>,
        optim: &[&Variable],
        aux: &[&Variable],
        weight: CostWeight,
        loss: Option<Box<dyn LossFunction>>,
    ) -> CoreResult<CostId> {
        check_signature(&*cost, "optimization", optim, cost.optim_tangent_dims())?;
        check_signature(&*cost, "auxiliary", aux, cost.aux_tangent_dims())?;
        weight.check_dimension(cost.dimension())?;

        let mut registrations: Vec<Registration<'_>> = Vec::new();
        let weight_variable = weight.learned_variable().cloned();
        let candidates = optim
            .iter()
            .map(|v| (*v, VariableRole::Optimization))
            .chain(aux.iter().map(|v| (*v, VariableRole::Auxiliary)))
            .chain(weight_variable.iter().map(|v| (v, VariableRole::Auxiliary)));
        for (variable, role) in candidates {
            self.check_registration(variable, role, &registrations)?;
            registrations.push(Registration { variable, role });
        }

        // Batch size after the new variables are in.
        let batch_size = registrations
            .iter()
            .map(|r| r.variable.batch_size())
            .chain(self.variables.values().map(Variable::batch_size))
            .max()
            .unwrap_or(1);
        for variable in registrations
            .iter()
            .map(|r| r.variable)
            .chain(self.variables.values())
        {
            if variable.batch_size() != 1 && variable.batch_size() != batch_size {
                return Err(CoreError::ShapeMismatch(format!(
                    "variable '{}' has batch size {}, objective batch size would be {}",
                    variable.name(),
                    variable.batch_size(),
                    batch_size
                ))
                .log());
            }
        }

        for Registration { variable, role } in registrations {
            if self.variables.contains_key(&variable.id()) {
                continue;
            }
            self.variables.insert(variable.id(), variable.clone());
            self.names.insert(variable.name().to_string(), variable.id());
            self.roles.insert(variable.id(), role);
            match role {
                VariableRole::Optimization => self.ordering.push(variable.id()),
                VariableRole::Auxiliary => self.aux_order.push(variable.id()),
            }
        }

        let block = ResidualBlock::new(
            optim.iter().map(|v| v.id()).collect(),
            aux.iter().map(|v| v.id()).collect(),
            cost,
            weight,
            loss,
        );
        let id = block.id;
        debug!(
            "Added cost '{}' ({}) over {} optimization and {} auxiliary variables",
            block.name,
            id,
            block.optim_keys.len(),
            block.aux_keys.len()
        );
        self.blocks.push(block);
        self.structure_version = next_structure_version();
        Ok(id)
    }

    fn check_registration(
        &self,
        variable: &Variable,
        role: VariableRole,
        pending: &[Registration<'_>],
    ) -> CoreResult<()> {
        let registered = self
            .names
            .get(variable.name())
            .map(|id| (*id, self.roles[id]))
            .or_else(|| {
                pending
                    .iter()
                    .find(|r| r.variable.name() == variable.name())
                    .map(|r| (r.variable.id(), r.role))
            });
        let Some((existing_id, existing_role)) = registered else {
            return Ok(());
        };
        if existing_id != variable.id() {
            return Err(CoreError::DuplicateName(format!(
                "'{}' already names a different variable",
                variable.name()
            ))
            .log());
        }
        if existing_role != role {
            return Err(CoreError::DuplicateName(format!(
                "'{}' is already registered as {} variable, cannot use it as {} variable",
                variable.name(),
                existing_role,
                role
            ))
            .log());
        }
        Ok(())
    }

    /// Remove a cost. Variables no longer referenced by any cost are dropped.
    pub fn erase(&mut self, id: CostId) -> CoreResult<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| CoreError::UnknownCost(id).log())?;
        let block = self.blocks.remove(index);

        let keys = block
            .optim_keys
            .iter()
            .chain(block.aux_keys.iter())
            .chain(block.weight.learned_variable().map(Variable::id).iter())
            .copied()
            .collect::<Vec<_>>();
        for key in keys {
            if !self.is_referenced(key)
                && let Some(variable) = self.variables.remove(&key)
            {
                self.names.remove(variable.name());
                self.roles.remove(&key);
                self.ordering.remove(key);
                self.aux_order.retain(|v| *v != key);
            }
        }

        debug!("Erased cost '{}' ({})", block.name, id);
        self.structure_version = next_structure_version();
        Ok(())
    }

    fn is_referenced(&self, id: VariableId) -> bool {
        self.blocks.iter().any(|b| {
            b.optim_keys.contains(&id)
                || b.aux_keys.contains(&id)
                || b.weight.learned_variable().is_some_and(|v| v.id() == id)
        })
    }

    /// Assign new batched values to named variables.
    ///
    /// All entries are validated before anything is written.
    pub fn update(&mut self, values: &HashMap<String, Vec<ManifoldElement>>) -> CoreResult<()> {
        let mut resolved = Vec::with_capacity(values.len());
        for (name, new_values) in values {
            let id = *self
                .names
                .get(name)
                .ok_or_else(|| CoreError::UnknownVariable(name.clone()).log())?;
            self.variables[&id].check_compatible(new_values)?;
            resolved.push((id, new_values));
        }

        let batch_size_of = |id: &VariableId| {
            resolved
                .iter()
                .find(|(r, _)| r == id)
                .map(|(_, v)| v.len())
                .unwrap_or_else(|| self.variables[id].batch_size())
        };
        let batch_size = self.variables.keys().map(batch_size_of).max().unwrap_or(1);
        for id in self.variables.keys() {
            let size = batch_size_of(id);
            if size != 1 && size != batch_size {
                return Err(CoreError::ShapeMismatch(format!(
                    "variable '{}' would have batch size {size}, objective batch size {batch_size}",
                    self.variables[id].name()
                ))
                .log());
            }
        }

        for (id, new_values) in resolved {
            if let Some(variable) = self.variables.get_mut(&id) {
                variable.set_values_unchecked(new_values.clone());
            }
        }
        Ok(())
    }

    /// Install an explicit column order for the optimization variables.
    pub fn set_ordering(&mut self, names: &[&str]) -> CoreResult<()> {
        let mut requested = Vec::with_capacity(names.len());
        for name in names {
            match self.names.get(*name) {
                Some(id) if self.roles[id] == VariableRole::Optimization => requested.push(*id),
                Some(_) => {
                    return Err(CoreError::InvalidOrdering(format!(
                        "'{name}' is not an optimization variable"
                    ))
                    .log());
                }
                None => {
                    return Err(CoreError::InvalidOrdering(format!(
                        "unknown variable '{name}'"
                    ))
                    .log());
                }
            }
        }
        self.ordering = VariableOrdering::permutation_of(self.ordering.ids(), requested)?;
        self.structure_version = next_structure_version();
        Ok(())
    }

    pub fn ordering(&self) -> &VariableOrdering {
        &self.ordering
    }

    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    /// Largest batch size over all variables (1 for an empty objective).
    pub fn batch_size(&self) -> usize {
        self.variables
            .values()
            .map(Variable::batch_size)
            .max()
            .unwrap_or(1)
    }

    pub fn num_costs(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total residual dimension.
    pub fn dimension(&self) -> usize {
        self.blocks.iter().map(ResidualBlock::dimension).sum()
    }

    /// Residual blocks in insertion order.
    pub fn blocks(&self) -> impl Iterator<Item = &ResidualBlock> {
        self.blocks.iter()
    }

    pub fn cost(&self, id: CostId) -> Option<&ResidualBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.names.get(name).and_then(|id| self.variables.get(id))
    }

    pub fn variable_by_id(&self, id: VariableId) -> Option<&Variable> {
        self.variables.get(&id)
    }

    pub fn role(&self, name: &str) -> Option<VariableRole> {
        self.names.get(name).map(|id| self.roles[id])
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Optimization variables in column order.
    pub fn optim_variables(&self) -> impl Iterator<Item = &Variable> {
        self.ordering.ids().iter().map(|id| &self.variables[id])
    }

    /// Auxiliary variables in registration order.
    pub fn aux_variables(&self) -> impl Iterator<Item = &Variable> {
        self.aux_order.iter().map(|id| &self.variables[id])
    }

    pub fn aux_ids(&self) -> &[VariableId] {
        &self.aux_order
    }

    pub fn optim_layout(&self) -> ColumnLayout {
        ColumnLayout::from_dims(self.optim_variables().map(Variable::tangent_dim).collect())
    }

    pub fn aux_layout(&self) -> ColumnLayout {
        ColumnLayout::from_dims(self.aux_variables().map(Variable::tangent_dim).collect())
    }

    /// Starting row of every block in the stacked residual.
    pub fn row_offsets(&self) -> Vec<usize> {
        let mut offset = 0;
        self.blocks
            .iter()
            .map(|b| {
                let start = offset;
                offset += b.dimension();
                start
            })
            .collect()
    }

    /// Values of a block's variables for batch element `b`.
    pub fn block_values(&self, block: &ResidualBlock, b: usize) -> CoreResult<BlockValues<'_>> {
        let lookup = |id: &VariableId| {
            self.variables
                .get(id)
                .map(|v| v.value(b))
                .ok_or_else(|| CoreError::UnknownVariable(id.to_string()).log())
        };
        Ok(BlockValues {
            optim: block.optim_keys.iter().map(lookup).collect::<CoreResult<_>>()?,
            aux: block.aux_keys.iter().map(lookup).collect::<CoreResult<_>>()?,
            weight: block
                .weight
                .learned_variable()
                .map(|v| lookup(&v.id()))
                .transpose()?,
        })
    }

    /// Total error `Σ ρ(||W r||²)` of batch element `b`.
    pub fn error(&self, b: usize) -> CoreResult<f64> {
        self.blocks
            .iter()
            .map(|block| block.error(&self.block_values(block, b)?))
            .sum()
    }

    /// Total error of every batch element.
    pub fn error_batch(&self) -> CoreResult<Vec<f64>> {
        let batch_size = self.batch_size();

        #[cfg(feature = "parallel")]
        let iter = (0..batch_size).into_par_iter();

        #[cfg(not(feature = "parallel"))]
        let iter = 0..batch_size;

        iter.map(|b| self.error(b)).collect()
    }

    /// Repeat broadcast optimization variables so each batch element owns its value.
    pub(crate) fn expand_optim_variables(&mut self) -> CoreResult<()> {
        let batch_size = self.batch_size();
        for id in self.ordering.ids() {
            if let Some(variable) = self.variables.get_mut(id) {
                variable.expand(batch_size)?;
            }
        }
        Ok(())
    }

    /// Values of the optimization variables in column order.
    pub fn optim_values(&self) -> Vec<Vec<ManifoldElement>> {
        self.optim_variables().map(|v| v.values().to_vec()).collect()
    }

    /// Replace the values of one batch element of every optimization variable.
    pub(crate) fn set_optim_element(&mut self, b: usize, values: &[ManifoldElement]) {
        for (id, value) in self.ordering.ids().iter().zip(values) {
            if let Some(variable) = self.variables.get_mut(id) {
                variable.set_value(b, value.clone());
            }
        }
    }

    /// Value of auxiliary variable `k` (in [`aux_layout`](Self::aux_layout) order) used by
    /// batch element `b`.
    pub(crate) fn aux_element(&self, k: usize, b: usize) -> CoreResult<&ManifoldElement> {
        self.aux_order
            .get(k)
            .and_then(|id| self.variables.get(id))
            .map(|v| v.value(b))
            .ok_or_else(|| CoreError::UnknownVariable(format!("auxiliary variable #{k}")).log())
    }

    /// Overwrite the value of auxiliary variable `k` used by batch element `b`.
    pub(crate) fn set_aux_element(&mut self, k: usize, b: usize, value: ManifoldElement) {
        if let Some(variable) = self.aux_order.get(k).and_then(|id| self.variables.get_mut(id)) {
            variable.set_value(b, value);
        }
    }

    /// Optimization values of batch element `b`, in column order.
    pub fn optim_element(&self, b: usize) -> Vec<ManifoldElement> {
        self.optim_variables()
            .map(|v| batch::at(v.values(), b).clone())
            .collect()
    }

    /// Named values of all optimization variables.
    pub fn optim_value_map(&self) -> HashMap<String, Vec<ManifoldElement>> {
        self.optim_variables()
            .map(|v| (v.name().to_string(), v.values().to_vec()))
            .collect()
    }
}

fn check_signature(
    cost: &dyn CostFunction,
    role: &str,
    variables: &[&Variable],
    expected: Option<Vec<usize>>,
) -> CoreResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual: Vec<usize> = variables.iter().map(|v| v.tangent_dim()).collect();
    if actual != expected {
        return Err(CoreError::ShapeMismatch(format!(
            "cost '{}' expects {role} variables of tangent dimensions {expected:?}, got {actual:?}",
            cost.name()
        ))
        .log());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{BetweenFactor, DifferenceFactor};
    use crate::manifold::se2::SE2;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-10;

    fn pose(name: &str, x: f64, y: f64, theta: f64) -> CoreResult<Variable> {
        Variable::single(name, ManifoldElement::SE2(SE2::from_xy_angle(x, y, theta)))
    }

    fn prior_on(variable: &Variable) -> Box<dyn CostFunction> {
        Box::new(DifferenceFactor::with_target(variable.value(0).identity_like()))
    }

    fn names(objective: &Objective) -> Vec<String> {
        objective
            .optim_variables()
            .map(|v| v.name().to_string())
            .collect()
    }

    #[test]
    fn test_add_and_error() -> TestResult {
        let x = Variable::single("x", ManifoldElement::vector(&[1.0, 1.0]))?;
        let t = Variable::single("t", ManifoldElement::vector(&[0.0, 3.0]))?;
        let mut objective = Objective::new();
        objective.add(
            Box::new(DifferenceFactor::new(2)),
            &[&x],
            &[&t],
            CostWeight::scale(2.0)?,
        )?;
        // ||2 · (1, -2)||² = 20
        assert!((objective.error(0)? - 20.0).abs() < TOLERANCE);
        assert_eq!(objective.dimension(), 2);
        assert_eq!(objective.role("t"), Some(VariableRole::Auxiliary));
        Ok(())
    }

    #[test]
    fn test_duplicate_name_rejected() -> TestResult {
        let x = Variable::single("x", ManifoldElement::vector(&[1.0]))?;
        let other = Variable::single("x", ManifoldElement::vector(&[2.0]))?;
        let mut objective = Objective::new();
        objective.add(prior_on(&x), &[&x], &[], CostWeight::identity())?;
        let version = objective.structure_version();
        let result = objective.add(prior_on(&other), &[&other], &[], CostWeight::identity());
        assert!(matches!(result, Err(CoreError::DuplicateName(_))));
        assert_eq!(objective.num_costs(), 1);
        assert_eq!(objective.structure_version(), version);
        Ok(())
    }

    #[test]
    fn test_role_conflict_rejected() -> TestResult {
        let x = Variable::single("x", ManifoldElement::vector(&[1.0]))?;
        let y = Variable::single("y", ManifoldElement::vector(&[1.0]))?;
        let mut objective = Objective::new();
        objective.add(
            Box::new(DifferenceFactor::new(1)),
            &[&x],
            &[&y],
            CostWeight::identity(),
        )?;
        let result = objective.add(
            Box::new(DifferenceFactor::new(1)),
            &[&y],
            &[&x],
            CostWeight::identity(),
        );
        assert!(matches!(result, Err(CoreError::DuplicateName(_))));
        Ok(())
    }

    #[test]
    fn test_signature_and_batch_checked() -> TestResult {
        let x = pose("x", 0.0, 0.0, 0.0)?;
        let mut objective = Objective::new();
        let result = objective.add(prior_on(&x), &[&x], &[], CostWeight::identity());
        assert!(matches!(result, Err(CoreError::ShapeMismatch(_))));

        let a = Variable::vector("a", &[&[0.0], &[1.0], &[2.0]])?;
        let b = Variable::vector("b", &[&[0.0], &[1.0]])?;
        objective.add(prior_on(&a), &[&a], &[], CostWeight::identity())?;
        let result = objective.add(prior_on(&b), &[&b], &[], CostWeight::identity());
        assert!(matches!(result, Err(CoreError::ShapeMismatch(_))));
        assert_eq!(objective.batch_size(), 3);
        Ok(())
    }

    #[test]
    fn test_erase_drops_unreferenced_and_readd_restores_ordering() -> TestResult {
        let x0 = pose("x0", 0.0, 0.0, 0.0)?;
        let x1 = pose("x1", 1.0, 0.0, 0.0)?;
        let x2 = pose("x2", 2.0, 0.0, 0.0)?;
        let mut objective = Objective::new();
        objective.add(
            Box::new(BetweenFactor::new(SE2::from_xy_angle(1.0, 0.0, 0.0).into())),
            &[&x0, &x1],
            &[],
            CostWeight::identity(),
        )?;
        let c2 = objective.add(
            Box::new(BetweenFactor::new(SE2::from_xy_angle(1.0, 0.0, 0.0).into())),
            &[&x1, &x2],
            &[],
            CostWeight::identity(),
        )?;
        assert_eq!(names(&objective), vec!["x0", "x1", "x2"]);

        let before = objective.structure_version();
        objective.erase(c2)?;
        assert_ne!(objective.structure_version(), before);
        assert_eq!(names(&objective), vec!["x0", "x1"]);
        assert!(!objective.has_variable("x2"));
        assert!(matches!(objective.erase(c2), Err(CoreError::UnknownCost(_))));

        objective.add(
            Box::new(BetweenFactor::new(SE2::from_xy_angle(1.0, 0.0, 0.0).into())),
            &[&x1, &x2],
            &[],
            CostWeight::identity(),
        )?;
        assert_eq!(names(&objective), vec!["x0", "x1", "x2"]);
        assert_eq!(objective.optim_layout().total, 9);
        Ok(())
    }

    #[test]
    fn test_update_is_all_or_nothing() -> TestResult {
        let x = Variable::single("x", ManifoldElement::vector(&[1.0]))?;
        let t = Variable::single("t", ManifoldElement::vector(&[0.0]))?;
        let mut objective = Objective::new();
        objective.add(
            Box::new(DifferenceFactor::new(1)),
            &[&x],
            &[&t],
            CostWeight::identity(),
        )?;

        let mut values = HashMap::new();
        values.insert("x".to_string(), vec![ManifoldElement::vector(&[5.0])]);
        values.insert("t".to_string(), vec![ManifoldElement::vector(&[1.0, 2.0])]);
        assert!(matches!(objective.update(&values), Err(CoreError::ShapeMismatch(_))));
        let x_now = objective.variable("x").ok_or("missing x")?;
        assert_eq!(x_now.value(0), &ManifoldElement::vector(&[1.0]));

        let mut unknown = HashMap::new();
        unknown.insert("nope".to_string(), vec![ManifoldElement::vector(&[1.0])]);
        assert!(matches!(objective.update(&unknown), Err(CoreError::UnknownVariable(_))));

        let mut batched = HashMap::new();
        batched.insert(
            "t".to_string(),
            vec![ManifoldElement::vector(&[1.0]), ManifoldElement::vector(&[3.0])],
        );
        objective.update(&batched)?;
        assert_eq!(objective.batch_size(), 2);
        let errors = objective.error_batch()?;
        assert!((errors[0] - 0.0).abs() < TOLERANCE);
        assert!((errors[1] - 4.0).abs() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_set_ordering() -> TestResult {
        let a = Variable::single("a", ManifoldElement::vector(&[1.0]))?;
        let b = pose("b", 0.0, 0.0, 0.0)?;
        let mut objective = Objective::new();
        objective.add(prior_on(&a), &[&a], &[], CostWeight::identity())?;
        objective.add(prior_on(&b), &[&b], &[], CostWeight::identity())?;
        objective.set_ordering(&["b", "a"])?;
        assert_eq!(names(&objective), vec!["b", "a"]);
        assert_eq!(objective.optim_layout().offsets, vec![0, 3]);
        assert!(matches!(
            objective.set_ordering(&["a"]),
            Err(CoreError::InvalidOrdering(_))
        ));
        assert!(objective.set_ordering(&["a", "zzz"]).is_err());
        Ok(())
    }

    #[test]
    fn test_learned_weight_registered_as_aux() -> TestResult {
        let x = Variable::single("x", ManifoldElement::vector(&[2.0]))?;
        let w = Variable::single("w", ManifoldElement::vector(&[3.0]))?;
        let mut objective = Objective::new();
        let id = objective.add(prior_on(&x), &[&x], &[], CostWeight::learned_scale(w)?)?;
        assert_eq!(objective.role("w"), Some(VariableRole::Auxiliary));
        assert!((objective.error(0)? - 36.0).abs() < TOLERANCE);

        let mut values = HashMap::new();
        values.insert("w".to_string(), vec![ManifoldElement::vector(&[1.0])]);
        objective.update(&values)?;
        assert!((objective.error(0)? - 4.0).abs() < TOLERANCE);

        objective.erase(id)?;
        assert!(!objective.has_variable("w"));
        assert!(objective.is_empty());
        Ok(())
    }

    #[test]
    fn test_element_writes_touch_one_batch_element() -> TestResult {
        let x = Variable::vector("x", &[&[1.0], &[2.0]])?;
        let t = Variable::vector("t", &[&[0.0], &[5.0]])?;
        let mut objective = Objective::new();
        objective.add(
            Box::new(DifferenceFactor::new(1)),
            &[&x],
            &[&t],
            CostWeight::identity(),
        )?;

        objective.set_optim_element(1, &[ManifoldElement::vector(&[-4.0])]);
        assert_eq!(objective.optim_element(0), vec![ManifoldElement::vector(&[1.0])]);
        assert_eq!(objective.optim_element(1), vec![ManifoldElement::vector(&[-4.0])]);

        objective.set_aux_element(0, 0, ManifoldElement::vector(&[3.0]));
        assert_eq!(objective.aux_element(0, 0)?, &ManifoldElement::vector(&[3.0]));
        assert_eq!(objective.aux_element(0, 1)?, &ManifoldElement::vector(&[5.0]));
        assert!((objective.error(0)? - 4.0).abs() < TOLERANCE);
        assert!(objective.aux_element(1, 0).is_err());
        Ok(())
    }
}
