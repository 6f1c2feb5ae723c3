//! Shared fixtures for unit tests.

use crate::core::{
    CoreResult, VariableId, cost_weight::CostWeight, objective::Objective,
    residual_block::BlockValues, variable::Variable,
};
use crate::factors::{BetweenFactor, DifferenceFactor};
use crate::manifold::{ManifoldElement, ManifoldType, TangentConvention, se2::SE2};
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::collections::HashMap;

/// Batched SE2 chain `x0 - x1 - x2` with a weighted prior on `x0`, a between cost whose
/// measurement is the auxiliary variable `odom`, and a fixed between cost.
pub(crate) fn se2_chain(batch_size: usize, seed: u64) -> CoreResult<Objective> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut random_batch = |scale: f64| -> Vec<ManifoldElement> {
        (0..batch_size)
            .map(|_| ManifoldElement::random(ManifoldType::SE2, 0, scale, &mut rng))
            .collect()
    };
    let x0 = Variable::new("x0", random_batch(0.5))?;
    let x1 = Variable::new("x1", random_batch(0.5))?;
    let x2 = Variable::new("x2", random_batch(0.5))?;
    let odom = Variable::new("odom", random_batch(0.3))?;

    let mut objective = Objective::new();
    objective.add(
        Box::new(DifferenceFactor::with_target(SE2::identity().into())),
        &[&x0],
        &[],
        CostWeight::scale(10.0)?,
    )?;
    objective.add(
        Box::new(BetweenFactor::with_measured_input(3)),
        &[&x0, &x1],
        &[&odom],
        CostWeight::identity(),
    )?;
    objective.add(
        Box::new(BetweenFactor::new(SE2::from_xy_angle(1.0, 0.0, 0.2).into())),
        &[&x1, &x2],
        &[],
        CostWeight::diagonal(DVector::from_vec(vec![1.0, 2.0, 0.5]))?,
    )?;
    Ok(objective)
}

/// Four SE2 poses with exact odometry and a loop closure, initialized `noise` (per tangent
/// coordinate) away from the solution. The first odometry measurement is the auxiliary
/// variable `odom`, one copy per batch element.
pub(crate) fn se2_loop(batch_size: usize, seed: u64, noise: f64) -> CoreResult<Objective> {
    let mut rng = StdRng::seed_from_u64(seed);
    let truth: Vec<ManifoldElement> = (0..4)
        .map(|k| {
            let k = k as f64;
            SE2::from_xy_angle(k, 0.3 * k * k, 0.4 * k).into()
        })
        .collect();

    let mut poses = Vec::with_capacity(truth.len());
    for (k, pose) in truth.iter().enumerate() {
        let values = (0..batch_size)
            .map(|_| {
                let delta = DVector::from_fn(3, |_, _| rng.random_range(-noise..=noise));
                pose.retract(&delta)
            })
            .collect::<Result<Vec<_>, _>>()?;
        poses.push(Variable::new(format!("x{k}"), values)?);
    }
    let odom = Variable::new("odom", vec![truth[0].between(&truth[1])?; batch_size])?;

    let mut objective = Objective::new();
    objective.add(
        Box::new(DifferenceFactor::with_target(truth[0].clone())),
        &[&poses[0]],
        &[],
        CostWeight::scale(10.0)?,
    )?;
    objective.add(
        Box::new(BetweenFactor::with_measured_input(3)),
        &[&poses[0], &poses[1]],
        &[&odom],
        CostWeight::identity(),
    )?;
    for (i, j) in [(1, 2), (2, 3)] {
        objective.add(
            Box::new(BetweenFactor::new(truth[i].between(&truth[j])?)),
            &[&poses[i], &poses[j]],
            &[],
            CostWeight::identity(),
        )?;
    }
    objective.add(
        Box::new(BetweenFactor::new(truth[0].between(&truth[3])?)),
        &[&poses[0], &poses[3]],
        &[],
        CostWeight::diagonal(DVector::from_vec(vec![2.0, 2.0, 4.0]))?,
    )?;
    Ok(objective)
}

/// Stacked weighted (and corrected) residual of batch element `b`, with some variables
/// replaced by `overrides`.
pub(crate) fn stacked_residual(
    objective: &Objective,
    b: usize,
    overrides: &HashMap<VariableId, ManifoldElement>,
) -> CoreResult<DVector<f64>> {
    let mut residual = DVector::zeros(objective.dimension());
    let offsets = objective.row_offsets();
    for (block, row) in objective.blocks().zip(offsets) {
        let lookup = |id: &VariableId| -> CoreResult<&ManifoldElement> {
            match overrides.get(id) {
                Some(value) => Ok(value),
                None => objective
                    .variable_by_id(*id)
                    .map(|v| v.value(b))
                    .ok_or_else(|| crate::core::CoreError::UnknownVariable(id.to_string())),
            }
        };
        let values = BlockValues {
            optim: block.optim_keys.iter().map(lookup).collect::<CoreResult<_>>()?,
            aux: block.aux_keys.iter().map(lookup).collect::<CoreResult<_>>()?,
            weight: block
                .weight
                .learned_variable()
                .map(|v| lookup(&v.id()))
                .transpose()?,
        };
        let lin = block.linearize(&values)?;
        residual.rows_mut(row, lin.residual.len()).copy_from(&lin.residual);
    }
    Ok(residual)
}

/// Central differences of the stacked residual with respect to `ids`, perturbing each
/// variable with `convention`'s retraction. Columns follow `ids`.
pub(crate) fn numeric_residual_jacobian(
    objective: &Objective,
    b: usize,
    ids: &[VariableId],
    convention: TangentConvention,
) -> CoreResult<DMatrix<f64>> {
    let step = crate::utils::DEFAULT_FD_STEP;
    let mut columns = Vec::new();
    for id in ids {
        let value = objective
            .variable_by_id(*id)
            .map(|v| v.value(b).clone())
            .ok_or_else(|| crate::core::CoreError::UnknownVariable(id.to_string()))?;
        for k in 0..value.tangent_dim() {
            let mut delta = DVector::zeros(value.tangent_dim());
            let mut overrides = HashMap::new();

            delta[k] = step;
            overrides.insert(*id, value.retract_with(&delta, convention)?);
            let plus = stacked_residual(objective, b, &overrides)?;

            delta[k] = -step;
            overrides.insert(*id, value.retract_with(&delta, convention)?);
            let minus = stacked_residual(objective, b, &overrides)?;

            columns.push((plus - minus) / (2.0 * step));
        }
    }
    let mut jacobian = DMatrix::zeros(objective.dimension(), columns.len());
    for (j, column) in columns.iter().enumerate() {
        jacobian.set_column(j, column);
    }
    Ok(jacobian)
}
