//! Dense Jacobian assembly and the auxiliary input Jacobian.

use super::{BlockArena, evaluate_blocks};
use crate::core::{CoreResult, objective::Objective};
use crate::manifold::TangentConvention;
use nalgebra::{DMatrix, DVector};

/// Residual and dense Jacobian of batch element `b`.
pub(crate) fn assemble(
    arena: &BlockArena,
    convention: TangentConvention,
    objective: &Objective,
    b: usize,
) -> CoreResult<(DVector<f64>, DMatrix<f64>)> {
    let blocks = evaluate_blocks(objective, convention, b)?;

    let mut residual = DVector::zeros(arena.nrows);
    for (lin, &row) in blocks.iter().zip(&arena.block_rows) {
        residual.rows_mut(row, lin.residual.len()).copy_from(&lin.residual);
    }

    let mut jacobian = DMatrix::zeros(arena.nrows, arena.ncols);
    for entry in &arena.entries {
        let block = blocks[entry.block]
            .jacobian
            .view((0, entry.local_col), (entry.rows, entry.cols));
        let mut target = jacobian.view_mut(
            (entry.row_offset, entry.col_offset),
            (entry.rows, entry.cols),
        );
        target += block;
    }
    Ok((residual, jacobian))
}

/// `R_θ`: derivative of the stacked corrected residual with respect to the tangent
/// coordinates of every auxiliary variable (measurements and learned weights).
///
/// A variable used by several costs accumulates the contributions of all of them.
pub(crate) fn assemble_input_jacobian(
    arena: &BlockArena,
    convention: TangentConvention,
    objective: &Objective,
    b: usize,
) -> CoreResult<DMatrix<f64>> {
    let mut jacobian = DMatrix::zeros(arena.nrows, arena.aux_ncols);
    if arena.aux_ncols == 0 {
        return Ok(jacobian);
    }

    for (block_index, block) in objective.blocks().enumerate() {
        let row = arena.block_rows[block_index];
        let values = objective.block_values(block, b)?;
        let input = block.input_jacobian(&values)?;

        let aux_entries = arena.aux_entries.iter().filter(|e| e.block == block_index);
        for (entry, value) in aux_entries.zip(&values.aux) {
            let mut block_jacobian = input
                .aux
                .view((0, entry.local_col), (entry.rows, entry.cols))
                .into_owned();
            if convention == TangentConvention::Left {
                block_jacobian *= value.inverse().adjoint();
            }
            let mut target = jacobian.view_mut((row, entry.col_offset), (entry.rows, entry.cols));
            target += block_jacobian;
        }

        if let (Some(weight_jacobian), Some(entry)) = (
            &input.weight,
            arena.weight_entries.iter().find(|e| e.block == block_index),
        ) {
            let mut target = jacobian.view_mut((row, entry.col_offset), (entry.rows, entry.cols));
            target += weight_jacobian;
        }
    }
    Ok(jacobian)
}
