//! Residual and weighted Jacobian of an objective at its current values.
//!
//! For one batch element the linearization stacks the (weighted, robustly corrected)
//! residuals of all blocks in insertion order and places each block's per-variable
//! Jacobian at the column offset of that variable in the objective's ordering:
//!
//! ```text
//!              x0      x1      x2
//!          ┌───────┬───────┬───────┐
//!   c0 ──▶ │ J00   │ J01   │       │
//!   c1 ──▶ │       │ J11   │ J12   │
//!   c2 ──▶ │ J20   │       │       │
//!          └───────┴───────┴───────┘
//! ```
//!
//! The placement is described by a [`BlockArena`] keyed by (cost index, variable index).
//! The arena depends only on the objective's structure, so a [`Linearizer`] caches it
//! until the objective's `structure_version` changes. The [`dense`] backend writes into a
//! `DMatrix`; the [`sparse`] backend fills a faer `SparseColMat` through the arena's
//! precomputed symbolic pattern.
//!
//! Jacobians are always produced by cost functions in the right-tangent convention. With
//! [`TangentConvention::Left`] each block is converted with `J · Ad(x⁻¹)`.

pub mod dense;
pub mod sparse;

pub use sparse::BlockArena;

use crate::core::{CoreError, CoreResult, objective::Objective};
use crate::manifold::TangentConvention;
use faer::Mat;
use faer::sparse::SparseColMat;
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::ops::Mul;
use std::sync::Arc;

/// Storage backend of the Jacobian.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearizationKind {
    Dense,
    #[default]
    Sparse,
}

impl std::fmt::Display for LinearizationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinearizationKind::Dense => write!(f, "dense"),
            LinearizationKind::Sparse => write!(f, "sparse"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum JacobianStorage {
    Dense(DMatrix<f64>),
    Sparse(SparseColMat<usize, f64>),
}

/// Linearization of one batch element.
#[derive(Debug, Clone)]
pub struct Linearization {
    pub residual: DVector<f64>,
    pub jacobian: JacobianStorage,
    /// Structure version of the objective this was computed from
    pub structure_version: u64,
}

pub(crate) fn to_faer(m: &DMatrix<f64>) -> Mat<f64> {
    Mat::from_fn(m.nrows(), m.ncols(), |i, j| m[(i, j)])
}

pub(crate) fn from_faer(m: &Mat<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| m[(i, j)])
}

impl Linearization {
    pub fn nrows(&self) -> usize {
        self.residual.len()
    }

    pub fn ncols(&self) -> usize {
        match &self.jacobian {
            JacobianStorage::Dense(j) => j.ncols(),
            JacobianStorage::Sparse(j) => j.ncols(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.jacobian, JacobianStorage::Sparse(_))
    }

    /// `J · m`
    pub fn mul(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        match &self.jacobian {
            JacobianStorage::Dense(j) => j * m,
            JacobianStorage::Sparse(j) => from_faer(&j.as_ref().mul(&to_faer(m))),
        }
    }

    /// `Jᵀ · m`
    pub fn tr_mul(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        match &self.jacobian {
            JacobianStorage::Dense(j) => j.tr_mul(m),
            JacobianStorage::Sparse(j) => from_faer(&j.as_ref().transpose().mul(&to_faer(m))),
        }
    }

    /// Gradient `Jᵀ r`.
    pub fn gradient(&self) -> DVector<f64> {
        match &self.jacobian {
            JacobianStorage::Dense(j) => j.tr_mul(&self.residual),
            JacobianStorage::Sparse(_) => {
                let r = DMatrix::from_column_slice(self.nrows(), 1, self.residual.as_slice());
                self.tr_mul(&r).column(0).into_owned()
            }
        }
    }

    /// Diagonal of `JᵀJ`.
    pub fn normal_diagonal(&self) -> DVector<f64> {
        match &self.jacobian {
            JacobianStorage::Dense(j) => {
                DVector::from_iterator(j.ncols(), j.column_iter().map(|c| c.norm_squared()))
            }
            JacobianStorage::Sparse(j) => {
                let mut diagonal = DVector::zeros(j.ncols());
                for triplet in j.triplet_iter() {
                    let value = *triplet.val;
                    diagonal[triplet.col] += value * value;
                }
                diagonal
            }
        }
    }

    /// Dense copy of the Jacobian.
    pub fn jacobian_dense(&self) -> DMatrix<f64> {
        match &self.jacobian {
            JacobianStorage::Dense(j) => j.clone(),
            JacobianStorage::Sparse(j) => {
                let mut dense = DMatrix::zeros(j.nrows(), j.ncols());
                for triplet in j.triplet_iter() {
                    dense[(triplet.row, triplet.col)] += *triplet.val;
                }
                dense
            }
        }
    }

    /// `½ ||r||²` of the (corrected) residual.
    pub fn half_squared_norm(&self) -> f64 {
        0.5 * self.residual.norm_squared()
    }
}

/// Linearizes objectives, caching the block arena across calls.
#[derive(Debug, Clone, Default)]
pub struct Linearizer {
    kind: LinearizationKind,
    convention: TangentConvention,
    arena: Option<Arc<BlockArena>>,
}

impl Linearizer {
    pub fn new(kind: LinearizationKind, convention: TangentConvention) -> Self {
        Linearizer {
            kind,
            convention,
            arena: None,
        }
    }

    pub fn kind(&self) -> LinearizationKind {
        self.kind
    }

    pub fn convention(&self) -> TangentConvention {
        self.convention
    }

    /// Arena for the objective's current structure, rebuilt when the structure changed.
    pub fn arena(&mut self, objective: &Objective) -> CoreResult<Arc<BlockArena>> {
        if let Some(arena) = &self.arena
            && arena.structure_version == objective.structure_version()
        {
            return Ok(Arc::clone(arena));
        }
        let arena = Arc::new(BlockArena::build(objective)?);
        self.arena = Some(Arc::clone(&arena));
        Ok(arena)
    }

    /// Linearize batch element `b`.
    pub fn linearize(&mut self, objective: &Objective, b: usize) -> CoreResult<Linearization> {
        let arena = self.arena(objective)?;
        linearize_with(&arena, self.kind, self.convention, objective, b)
    }

    /// Linearize several batch elements, one result per element.
    pub fn linearize_batch(
        &mut self,
        objective: &Objective,
        elements: &[usize],
    ) -> Vec<CoreResult<Linearization>> {
        let arena = match self.arena(objective) {
            Ok(arena) => arena,
            Err(e) => return elements.iter().map(|_| Err(e.clone())).collect(),
        };
        let (kind, convention) = (self.kind, self.convention);

        #[cfg(feature = "parallel")]
        let iter = elements.par_iter();

        #[cfg(not(feature = "parallel"))]
        let iter = elements.iter();

        iter.map(|&b| linearize_with(&arena, kind, convention, objective, b))
            .collect()
    }

    /// Weighted residual Jacobian with respect to the objective's auxiliary variables
    /// (`R_θ`), same rows as the linearization, columns in the auxiliary layout.
    pub fn input_jacobian(&mut self, objective: &Objective, b: usize) -> CoreResult<DMatrix<f64>> {
        let arena = self.arena(objective)?;
        dense::assemble_input_jacobian(&arena, self.convention, objective, b)
    }
}

fn linearize_with(
    arena: &BlockArena,
    kind: LinearizationKind,
    convention: TangentConvention,
    objective: &Objective,
    b: usize,
) -> CoreResult<Linearization> {
    if b >= objective.batch_size() {
        return Err(CoreError::InvalidInput(format!(
            "batch element {b} out of range for batch size {}",
            objective.batch_size()
        ))
        .log());
    }
    let (residual, jacobian) = match kind {
        LinearizationKind::Dense => {
            let (r, j) = dense::assemble(arena, convention, objective, b)?;
            (r, JacobianStorage::Dense(j))
        }
        LinearizationKind::Sparse => {
            let (r, j) = sparse::assemble(arena, convention, objective, b)?;
            (r, JacobianStorage::Sparse(j))
        }
    };
    Ok(Linearization {
        residual,
        jacobian,
        structure_version: arena.structure_version,
    })
}

/// Evaluate every block of batch element `b` and convert its Jacobian columns to the
/// requested convention. Blocks come back in insertion order.
pub(crate) fn evaluate_blocks(
    objective: &Objective,
    convention: TangentConvention,
    b: usize,
) -> CoreResult<Vec<crate::core::residual_block::BlockLinearization>> {
    objective
        .blocks()
        .map(|block| {
            let values = objective.block_values(block, b)?;
            let mut lin = block.linearize(&values)?;
            if convention == TangentConvention::Left {
                let mut col = 0;
                for value in &values.optim {
                    let dim = value.tangent_dim();
                    let converted = lin.jacobian.columns(col, dim) * value.inverse().adjoint();
                    lin.jacobian.columns_mut(col, dim).copy_from(&converted);
                    col += dim;
                }
            }
            Ok(lin)
        })
        .collect()
}
