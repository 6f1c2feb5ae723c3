//! Column layout of the optimization variables.

use crate::core::{CoreError, CoreResult, VariableId};
use std::collections::HashSet;

/// Order in which optimization variables occupy the columns of the Jacobian.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableOrdering {
    ids: Vec<VariableId>,
}

impl VariableOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an ordering from `requested`, which must be a permutation of `current`.
    pub fn permutation_of(current: &[VariableId], requested: Vec<VariableId>) -> CoreResult<Self> {
        let unique: HashSet<&VariableId> = requested.iter().collect();
        if unique.len() != requested.len() {
            return Err(
                CoreError::InvalidOrdering("ordering lists a variable twice".into()).log(),
            );
        }
        if requested.len() != current.len() || current.iter().any(|id| !unique.contains(id)) {
            return Err(CoreError::InvalidOrdering(format!(
                "ordering has {} variables but must be a permutation of the {} optimization \
                 variables",
                requested.len(),
                current.len()
            ))
            .log());
        }
        Ok(VariableOrdering { ids: requested })
    }

    pub fn ids(&self) -> &[VariableId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn position(&self, id: VariableId) -> Option<usize> {
        self.ids.iter().position(|v| *v == id)
    }

    pub fn contains(&self, id: VariableId) -> bool {
        self.ids.contains(&id)
    }

    pub(crate) fn push(&mut self, id: VariableId) {
        if !self.contains(id) {
            self.ids.push(id);
        }
    }

    pub(crate) fn remove(&mut self, id: VariableId) {
        self.ids.retain(|v| *v != id);
    }
}

/// Column offsets derived from an ordering and the variables' tangent dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    pub offsets: Vec<usize>,
    pub dims: Vec<usize>,
    pub total: usize,
}

impl ColumnLayout {
    pub fn from_dims(dims: Vec<usize>) -> Self {
        let mut offsets = Vec::with_capacity(dims.len());
        let mut total = 0;
        for dim in &dims {
            offsets.push(total);
            total += dim;
        }
        ColumnLayout {
            offsets,
            dims,
            total,
        }
    }

    /// Column range of the `index`-th variable.
    pub fn range(&self, index: usize) -> std::ops::Range<usize> {
        self.offsets[index]..self.offsets[index] + self.dims[index]
    }
}
