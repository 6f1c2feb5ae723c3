//! Block arena and sparse Jacobian assembly.

use super::evaluate_blocks;
use crate::core::{CoreError, CoreResult, objective::Objective};
use crate::manifold::TangentConvention;
use faer::sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat};
use nalgebra::DVector;

/// Placement of one (cost, variable) Jacobian block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Index of the cost in insertion order
    pub block: usize,
    /// Index of the variable in the ordering (or in the auxiliary order)
    pub variable: usize,
    pub row_offset: usize,
    pub col_offset: usize,
    /// First column of this variable inside the cost's own Jacobian
    pub local_col: usize,
    pub rows: usize,
    pub cols: usize,
}

/// Structure-only description of an objective's linearization.
///
/// Built once per `structure_version`. Holds the row offset of every cost, the
/// (cost, variable) blocks of the optimization Jacobian and of the auxiliary input
/// Jacobian, and the faer symbolic pattern of the optimization Jacobian together with
/// the argsort that maps block-ordered values into it.
pub struct BlockArena {
    pub structure_version: u64,
    pub nrows: usize,
    pub ncols: usize,
    pub aux_ncols: usize,
    pub block_rows: Vec<usize>,
    pub entries: Vec<BlockEntry>,
    pub aux_entries: Vec<BlockEntry>,
    /// Learned weight columns, `local_col` is unused
    pub weight_entries: Vec<BlockEntry>,
    pattern: SymbolicSparseColMat<usize>,
    order: Argsort<usize>,
}

impl std::fmt::Debug for BlockArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockArena")
            .field("structure_version", &self.structure_version)
            .field("nrows", &self.nrows)
            .field("ncols", &self.ncols)
            .field("aux_ncols", &self.aux_ncols)
            .field("blocks", &self.entries.len())
            .field("nnz", &self.nnz())
            .finish()
    }
}

impl BlockArena {
    pub fn build(objective: &Objective) -> CoreResult<Self> {
        let ordering = objective.ordering();
        let layout = objective.optim_layout();
        let aux_layout = objective.aux_layout();
        let aux_ids = objective.aux_ids();
        let block_rows = objective.row_offsets();

        let mut entries = Vec::new();
        let mut aux_entries = Vec::new();
        let mut weight_entries = Vec::new();

        for (block_index, (block, &row_offset)) in objective.blocks().zip(&block_rows).enumerate() {
            let rows = block.dimension();

            let mut local_col = 0;
            for key in &block.optim_keys {
                let variable = ordering.position(*key).ok_or_else(|| {
                    CoreError::SymbolicStructure(format!(
                        "cost '{}' refers to {key}, which is not in the ordering",
                        block.name
                    ))
                    .log()
                })?;
                let cols = layout.dims[variable];
                entries.push(BlockEntry {
                    block: block_index,
                    variable,
                    row_offset,
                    col_offset: layout.offsets[variable],
                    local_col,
                    rows,
                    cols,
                });
                local_col += cols;
            }

            let aux_position = |key: &crate::core::VariableId| {
                aux_ids.iter().position(|id| id == key).ok_or_else(|| {
                    CoreError::SymbolicStructure(format!(
                        "cost '{}' refers to unregistered auxiliary variable {key}",
                        block.name
                    ))
                    .log()
                })
            };

            let mut local_col = 0;
            for key in &block.aux_keys {
                let variable = aux_position(key)?;
                let cols = aux_layout.dims[variable];
                aux_entries.push(BlockEntry {
                    block: block_index,
                    variable,
                    row_offset,
                    col_offset: aux_layout.offsets[variable],
                    local_col,
                    rows,
                    cols,
                });
                local_col += cols;
            }

            if let Some(weight) = block.weight.learned_variable() {
                let variable = aux_position(&weight.id())?;
                weight_entries.push(BlockEntry {
                    block: block_index,
                    variable,
                    row_offset,
                    col_offset: aux_layout.offsets[variable],
                    local_col: 0,
                    rows,
                    cols: aux_layout.dims[variable],
                });
            }
        }

        let nrows = objective.dimension();
        let ncols = layout.total;
        let mut indices = Vec::<Pair<usize, usize>>::with_capacity(
            entries.iter().map(|e| e.rows * e.cols).sum(),
        );
        for entry in &entries {
            for row in 0..entry.rows {
                for col in 0..entry.cols {
                    indices.push(Pair::new(entry.row_offset + row, entry.col_offset + col));
                }
            }
        }
        let (pattern, order) = SymbolicSparseColMat::try_new_from_indices(nrows, ncols, &indices)
            .map_err(|e| {
                CoreError::SymbolicStructure(
                    "Failed to build symbolic sparse matrix structure".to_string(),
                )
                .log_with_source(e)
            })?;

        Ok(BlockArena {
            structure_version: objective.structure_version(),
            nrows,
            ncols,
            aux_ncols: aux_layout.total,
            block_rows,
            entries,
            aux_entries,
            weight_entries,
            pattern,
            order,
        })
    }

    /// Structural non-zeros of the optimization Jacobian.
    pub fn nnz(&self) -> usize {
        self.pattern.compute_nnz()
    }
}

/// Residual and sparse Jacobian of batch element `b`.
pub(crate) fn assemble(
    arena: &BlockArena,
    convention: TangentConvention,
    objective: &Objective,
    b: usize,
) -> CoreResult<(DVector<f64>, SparseColMat<usize, f64>)> {
    let blocks = evaluate_blocks(objective, convention, b)?;

    let mut residual = DVector::zeros(arena.nrows);
    for (lin, &row) in blocks.iter().zip(&arena.block_rows) {
        residual.rows_mut(row, lin.residual.len()).copy_from(&lin.residual);
    }

    // Values must follow the exact order the indices were pushed in.
    let mut values = Vec::with_capacity(arena.entries.iter().map(|e| e.rows * e.cols).sum());
    for entry in &arena.entries {
        let jacobian = &blocks[entry.block].jacobian;
        for row in 0..entry.rows {
            for col in 0..entry.cols {
                values.push(jacobian[(row, entry.local_col + col)]);
            }
        }
    }

    let jacobian =
        SparseColMat::new_from_argsort(arena.pattern.clone(), &arena.order, values.as_slice())
            .map_err(|e| {
                CoreError::SymbolicStructure(
                    "Failed to create sparse Jacobian from argsort".to_string(),
                )
                .log_with_source(e)
            })?;
    Ok((residual, jacobian))
}
