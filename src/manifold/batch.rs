//! Batched manifold operations.
//!
//! A batch is a slice of elements indexed by the leading batch dimension. Binary
//! operations broadcast a batch of length 1 against a batch of length B; any other
//! combination of lengths fails with [`ManifoldError::BatchMismatch`].

use crate::manifold::{ManifoldElement, ManifoldError, ManifoldResult, TangentConvention};
use nalgebra::DVector;

/// Common length of two batches after broadcasting.
pub fn broadcast_len(left: usize, right: usize) -> ManifoldResult<usize> {
    match (left, right) {
        (l, r) if l == r => Ok(l),
        (1, r) => Ok(r),
        (l, 1) => Ok(l),
        (l, r) => Err(ManifoldError::BatchMismatch { left: l, right: r }),
    }
}

/// Element `b` of a batch that may be broadcast.
pub fn at<T>(batch: &[T], b: usize) -> &T {
    if batch.len() == 1 { &batch[0] } else { &batch[b] }
}

/// Repeat a length-1 batch `batch_size` times; other batches are returned as they are.
pub fn expand(
    values: &[ManifoldElement],
    batch_size: usize,
) -> ManifoldResult<Vec<ManifoldElement>> {
    let n = broadcast_len(values.len(), batch_size)?;
    Ok((0..n).map(|b| at(values, b).clone()).collect())
}

pub fn compose(
    left: &[ManifoldElement],
    right: &[ManifoldElement],
) -> ManifoldResult<Vec<ManifoldElement>> {
    let n = broadcast_len(left.len(), right.len())?;
    (0..n).map(|b| at(left, b).compose(at(right, b))).collect()
}

pub fn inverse(values: &[ManifoldElement]) -> Vec<ManifoldElement> {
    values.iter().map(ManifoldElement::inverse).collect()
}

pub fn retract(
    values: &[ManifoldElement],
    deltas: &[DVector<f64>],
    convention: TangentConvention,
) -> ManifoldResult<Vec<ManifoldElement>> {
    let n = broadcast_len(values.len(), deltas.len())?;
    (0..n)
        .map(|b| at(values, b).retract_with(at(deltas, b), convention))
        .collect()
}

pub fn local(
    from: &[ManifoldElement],
    to: &[ManifoldElement],
    convention: TangentConvention,
) -> ManifoldResult<Vec<DVector<f64>>> {
    let n = broadcast_len(from.len(), to.len())?;
    (0..n)
        .map(|b| at(from, b).local_with(at(to, b), convention))
        .collect()
}
