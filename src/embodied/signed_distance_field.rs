//! Batched 2D signed distance fields on a regular grid.
//!
//! Grid cell `(row, col)` sits at `origin + cell_size · (col, row)`: columns run along `x`,
//! rows along `y`. Distances between grid points are bilinearly interpolated; points
//! outside the grid have distance and Jacobian zero.

use crate::core::{CoreError, CoreResult};
use nalgebra::{DMatrix, DVector, Matrix2xX, Vector2};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Stand-in for an infinite squared distance in the distance transform.
const FAR: f64 = 1e20;

/// One signed distance field per batch element.
#[derive(Debug, Clone)]
pub struct SignedDistanceField2D {
    origin: Vec<Vector2<f64>>,
    cell_size: Vec<f64>,
    sdf_data: Vec<DMatrix<f64>>,
}

/// Common batch size of inputs holding either one value or one per element.
fn batch_size_of(sizes: &[(&str, usize)]) -> CoreResult<usize> {
    let batch_size = sizes.iter().map(|(_, n)| *n).max().unwrap_or(0);
    if batch_size == 0 {
        return Err(CoreError::InvalidInput(
            "signed distance field needs at least one element".into(),
        )
        .log());
    }
    for (what, n) in sizes {
        if *n != 1 && *n != batch_size {
            return Err(CoreError::ShapeMismatch(format!(
                "{what} has batch size {n}, expected 1 or {batch_size}"
            ))
            .log());
        }
    }
    Ok(batch_size)
}

fn broadcast<T: Clone>(values: &[T], batch_size: usize) -> Vec<T> {
    if values.len() == batch_size {
        values.to_vec()
    } else {
        vec![values[0].clone(); batch_size]
    }
}

impl SignedDistanceField2D {
    /// Field from precomputed signed distances. `origin`, `cell_size` and `sdf_data` each
    /// hold one entry or one per batch element; every grid must have the same shape.
    pub fn new(
        origin: &[Vector2<f64>],
        cell_size: &[f64],
        sdf_data: &[DMatrix<f64>],
    ) -> CoreResult<Self> {
        let batch_size = batch_size_of(&[
            ("origin", origin.len()),
            ("cell size", cell_size.len()),
            ("sdf data", sdf_data.len()),
        ])?;
        let shape = sdf_data[0].shape();
        if shape.0 == 0 || shape.1 == 0 {
            return Err(CoreError::InvalidInput("sdf grid is empty".into()).log());
        }
        if let Some(other) = sdf_data.iter().find(|d| d.shape() != shape) {
            return Err(CoreError::ShapeMismatch(format!(
                "sdf grids of shape {:?} and {:?} in one batch",
                shape,
                other.shape()
            ))
            .log());
        }
        if cell_size.iter().chain(sdf_data.iter().flat_map(|d| d.iter())).any(|v| !v.is_finite())
            || origin.iter().any(|o| !o.iter().all(|v| v.is_finite()))
        {
            return Err(CoreError::NumericalError(
                "signed distance field input is not finite".into(),
            )
            .log());
        }

        Ok(Self {
            origin: broadcast(origin, batch_size),
            cell_size: broadcast(cell_size, batch_size),
            sdf_data: broadcast(sdf_data, batch_size),
        })
    }

    /// Field of an occupancy grid (nonzero = occupied): positive distance to the nearest
    /// occupied cell in free space, negative distance to the nearest free cell inside
    /// obstacles. A grid without obstacles gets the constant `2 · cell_size · max(rows,
    /// cols)`, a fully occupied one its negative.
    pub fn from_occupancy_map(
        origin: &[Vector2<f64>],
        cell_size: &[f64],
        occupancy: &[DMatrix<f64>],
    ) -> CoreResult<Self> {
        let batch_size = batch_size_of(&[
            ("origin", origin.len()),
            ("cell size", cell_size.len()),
            ("occupancy map", occupancy.len()),
        ])?;
        let cell_size_b = broadcast(cell_size, batch_size);
        let occupancy_b = broadcast(occupancy, batch_size);
        let sdf_data: Vec<DMatrix<f64>> = occupancy_b
            .iter()
            .zip(&cell_size_b)
            .map(|(map, &cell)| occupancy_to_sdf(map, cell))
            .collect();
        Self::new(origin, &cell_size_b, &sdf_data)
    }

    pub fn batch_size(&self) -> usize {
        self.sdf_data.len()
    }

    pub fn sdf_data(&self) -> &[DMatrix<f64>] {
        &self.sdf_data
    }

    pub fn origin(&self) -> &[Vector2<f64>] {
        &self.origin
    }

    pub fn cell_size(&self) -> &[f64] {
        &self.cell_size
    }

    fn check_points(&self, points: &[Matrix2xX<f64>]) -> CoreResult<usize> {
        batch_size_of(&[("sdf", self.batch_size()), ("points", points.len())])
    }

    fn element_index(&self, b: usize) -> usize {
        b.min(self.batch_size() - 1)
    }

    /// Fractional grid coordinates `(rows, cols)` of every point and whether it falls
    /// outside the grid.
    pub fn convert_points_to_cell(
        &self,
        points: &[Matrix2xX<f64>],
    ) -> CoreResult<(Vec<DVector<f64>>, Vec<DVector<f64>>, Vec<Vec<bool>>)> {
        let batch_size = self.check_points(points)?;
        let mut rows = Vec::with_capacity(batch_size);
        let mut cols = Vec::with_capacity(batch_size);
        let mut out_of_bounds = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let cells = self.cells(b, &points[b.min(points.len() - 1)]);
            rows.push(DVector::from_iterator(cells.len(), cells.iter().map(|c| c.0)));
            cols.push(DVector::from_iterator(cells.len(), cells.iter().map(|c| c.1)));
            out_of_bounds.push(cells.iter().map(|c| c.2).collect());
        }
        Ok((rows, cols, out_of_bounds))
    }

    fn cells(&self, b: usize, points: &Matrix2xX<f64>) -> Vec<(f64, f64, bool)> {
        let e = self.element_index(b);
        let (origin, cell) = (self.origin[e], self.cell_size[e]);
        let (nrows, ncols) = self.sdf_data[e].shape();
        points
            .column_iter()
            .map(|p| {
                let col = (p[0] - origin.x) / cell;
                let row = (p[1] - origin.y) / cell;
                let outside = !(row >= 0.0
                    && row <= (nrows - 1) as f64
                    && col >= 0.0
                    && col <= (ncols - 1) as f64);
                (row, col, outside)
            })
            .collect()
    }

    /// Interpolated distance of every point and its Jacobian with respect to `(x, y)`
    /// (one row per point).
    pub fn signed_distance(
        &self,
        points: &[Matrix2xX<f64>],
    ) -> CoreResult<(Vec<DVector<f64>>, Vec<DMatrix<f64>>)> {
        let batch_size = self.check_points(points)?;
        let evaluate = |b: usize| {
            let e = self.element_index(b);
            let cells = self.cells(b, &points[b.min(points.len() - 1)]);
            let mut distance = DVector::zeros(cells.len());
            let mut jacobian = DMatrix::zeros(cells.len(), 2);
            for (i, &(row, col, outside)) in cells.iter().enumerate() {
                if outside {
                    continue;
                }
                let (d, d_row, d_col) = interpolate(&self.sdf_data[e], row, col);
                distance[i] = d;
                jacobian[(i, 0)] = d_col / self.cell_size[e];
                jacobian[(i, 1)] = d_row / self.cell_size[e];
            }
            (distance, jacobian)
        };

        #[cfg(feature = "parallel")]
        let iter = (0..batch_size).into_par_iter();

        #[cfg(not(feature = "parallel"))]
        let iter = 0..batch_size;

        Ok(iter.map(evaluate).unzip())
    }
}

/// Bilinear interpolation at an in-bounds fractional cell with derivatives along rows and
/// columns.
fn interpolate(data: &DMatrix<f64>, row: f64, col: f64) -> (f64, f64, f64) {
    let (nrows, ncols) = data.shape();
    let low_row = (row.floor() as usize).min(nrows.saturating_sub(2));
    let low_col = (col.floor() as usize).min(ncols.saturating_sub(2));
    let high_row = (low_row + 1).min(nrows - 1);
    let high_col = (low_col + 1).min(ncols - 1);
    let (fr, fc) = (row - low_row as f64, col - low_col as f64);

    let ll = data[(low_row, low_col)];
    let lh = data[(low_row, high_col)];
    let hl = data[(high_row, low_col)];
    let hh = data[(high_row, high_col)];

    let value = (1.0 - fr) * (1.0 - fc) * ll
        + (1.0 - fr) * fc * lh
        + fr * (1.0 - fc) * hl
        + fr * fc * hh;
    let d_row = (1.0 - fc) * (hl - ll) + fc * (hh - lh);
    let d_col = (1.0 - fr) * (lh - ll) + fr * (hh - hl);
    (value, d_row, d_col)
}

fn occupancy_to_sdf(occupancy: &DMatrix<f64>, cell_size: f64) -> DMatrix<f64> {
    let (nrows, ncols) = occupancy.shape();
    let occupied = occupancy.map(|v| v != 0.0);
    let num_occupied = occupied.iter().filter(|&&o| o).count();
    let limit = 2.0 * cell_size * nrows.max(ncols) as f64;
    if num_occupied == 0 {
        return DMatrix::from_element(nrows, ncols, limit);
    }
    if num_occupied == nrows * ncols {
        return DMatrix::from_element(nrows, ncols, -limit);
    }

    let to_occupied = distance_transform(&occupied);
    let to_free = distance_transform(&occupied.map(|o| !o));
    (to_occupied - to_free) * cell_size
}

/// Exact Euclidean distance from every cell to the nearest `feature` cell
/// (Felzenszwalb-Huttenlocher, separable over columns then rows).
pub fn distance_transform(feature: &DMatrix<bool>) -> DMatrix<f64> {
    let (nrows, ncols) = feature.shape();
    let mut squared = feature.map(|f| if f { 0.0 } else { FAR });

    let n = nrows.max(ncols);
    let mut buffer = vec![0.0; n];
    let mut output = vec![0.0; n];
    let mut parabolas = vec![0usize; n];
    let mut bounds = vec![0.0; n + 1];

    for c in 0..ncols {
        for (value, source) in buffer[..nrows].iter_mut().zip(squared.column(c).iter()) {
            *value = *source;
        }
        lower_envelope(
            &buffer[..nrows],
            &mut output[..nrows],
            &mut parabolas,
            &mut bounds,
        );
        squared.column_mut(c).copy_from_slice(&output[..nrows]);
    }
    for r in 0..nrows {
        for (c, value) in buffer[..ncols].iter_mut().enumerate() {
            *value = squared[(r, c)];
        }
        lower_envelope(
            &buffer[..ncols],
            &mut output[..ncols],
            &mut parabolas,
            &mut bounds,
        );
        for (c, value) in output[..ncols].iter().enumerate() {
            squared[(r, c)] = *value;
        }
    }
    squared.map(|d| if d >= FAR { f64::INFINITY } else { d.sqrt() })
}

/// 1D squared distance transform `d(p) = min_q (p - q)² + f(q)`.
fn lower_envelope(f: &[f64], d: &mut [f64], v: &mut [usize], z: &mut [f64]) {
    let n = f.len();
    if n == 0 {
        return;
    }
    let intersection = |q: usize, p: usize| {
        let (qf, pf) = (q as f64, p as f64);
        ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2.0 * qf - 2.0 * pf)
    };

    let mut k = 0;
    v[0] = 0;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;
    for q in 1..n {
        let mut s = intersection(q, v[k]);
        while k > 0 && s <= z[k] {
            k -= 1;
            s = intersection(q, v[k]);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }

    k = 0;
    for (q, out) in d.iter_mut().enumerate() {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let offset = q as f64 - v[k] as f64;
        *out = offset * offset + f[v[k]];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-6;

    fn reference_field() -> CoreResult<SignedDistanceField2D> {
        let data = DMatrix::from_row_slice(
            5,
            5,
            &[
                1.7321, 1.4142, 1.4142, 1.4142, 1.7321, //
                1.4142, 1.0, 1.0, 1.0, 1.4142, //
                1.4142, 1.0, 1.0, 1.0, 1.4142, //
                1.4142, 1.0, 1.0, 1.0, 1.4142, //
                1.7321, 1.4142, 1.4142, 1.4142, 1.7321,
            ],
        );
        SignedDistanceField2D::new(&[Vector2::new(-0.2, -0.2)], &[0.1], &[data])
    }

    #[test]
    fn test_points_to_cells() -> TestResult {
        let sdf = reference_field()?;
        let points = Matrix2xX::from_columns(&[Vector2::new(0.0, 0.0), Vector2::new(0.18, -0.17)]);
        let (rows, cols, out_of_bounds) = sdf.convert_points_to_cell(&[points])?;
        assert!((rows[0][0] - 2.0).abs() < TOLERANCE);
        assert!((rows[0][1] - 0.3).abs() < TOLERANCE);
        assert!((cols[0][0] - 2.0).abs() < TOLERANCE);
        assert!((cols[0][1] - 3.8).abs() < TOLERANCE);
        assert_eq!(out_of_bounds[0], vec![false, false]);
        Ok(())
    }

    #[test]
    fn test_interpolated_distance() -> TestResult {
        let sdf = reference_field()?;
        let points = Matrix2xX::from_columns(&[
            Vector2::new(0.0, 0.0),
            Vector2::new(0.18, -0.17),
            Vector2::new(0.5, 0.0),
        ]);
        let (distance, jacobian) = sdf.signed_distance(&[points])?;
        assert!((distance[0][0] - 1.0).abs() < TOLERANCE);
        assert!((distance[0][1] - 1.567372).abs() < TOLERANCE);
        assert_eq!(distance[0][2], 0.0);
        assert_eq!(jacobian[0].row(2).norm(), 0.0);
        Ok(())
    }

    #[test]
    fn test_from_occupancy_map() -> TestResult {
        let map = DMatrix::from_row_slice(
            5,
            5,
            &[
                0.0, 1.0, 1.0, 1.0, 1.0, //
                0.0, 0.0, 1.0, 1.0, 1.0, //
                0.0, 1.0, 1.0, 1.0, 1.0, //
                0.0, 1.0, 1.0, 1.0, 0.0, //
                0.0, 1.0, 1.0, 0.0, 0.0,
            ],
        );
        let empty = DMatrix::zeros(5, 5);
        let sdf = SignedDistanceField2D::from_occupancy_map(
            &[Vector2::new(-0.2, -0.2)],
            &[0.1],
            &[map, empty],
        )?;
        assert_eq!(sdf.batch_size(), 2);

        let (s2, s5) = (2f64.sqrt(), 5f64.sqrt());
        let expected = DMatrix::from_row_slice(
            5,
            5,
            &[
                1.0, -1.0, -s2, -s5, -3.0, //
                s2, 1.0, -1.0, -2.0, -2.0, //
                1.0, -1.0, -s2, -s2, -1.0, //
                1.0, -1.0, -s2, -1.0, 1.0, //
                1.0, -1.0, -1.0, 1.0, s2,
            ],
        ) * 0.1;
        assert!((&sdf.sdf_data()[0] - expected).amax() < 1e-12);
        assert!(sdf.sdf_data()[1].iter().all(|&d| (d - 1.0).abs() < 1e-12));
        Ok(())
    }

    #[test]
    fn test_distance_transform_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(3);
        let feature = DMatrix::from_fn(7, 11, |_, _| rng.random_bool(0.15));
        let transform = distance_transform(&feature);
        for r in 0..7 {
            for c in 0..11 {
                let brute = (0..7)
                    .flat_map(|i| (0..11).map(move |j| (i, j)))
                    .filter(|&(i, j)| feature[(i, j)])
                    .map(|(i, j)| (i as f64 - r as f64).hypot(j as f64 - c as f64))
                    .fold(f64::INFINITY, f64::min);
                assert!((transform[(r, c)] - brute).abs() < 1e-12 || brute.is_infinite());
            }
        }
    }

    #[test]
    fn test_jacobian_matches_finite_differences() -> TestResult {
        let mut rng = StdRng::seed_from_u64(17);
        let h = 1e-7;
        for batch_size in [1, 10, 100] {
            let origin: Vec<_> = (0..batch_size)
                .map(|_| Vector2::new(rng.random_range(-1.0..0.0), rng.random_range(-1.0..0.0)))
                .collect();
            let cell_size: Vec<f64> = (0..batch_size).map(|_| rng.random_range(0.1..0.5)).collect();
            let data: Vec<_> = (0..batch_size)
                .map(|_| DMatrix::from_fn(10, 10, |_, _| rng.random_range(-1.0..1.0)))
                .collect();
            let sdf = SignedDistanceField2D::new(&origin, &cell_size, &data)?;
            let points: Vec<_> = (0..batch_size)
                .map(|_| Matrix2xX::from_fn(10, |_, _| rng.random_range(-1.0..1.5)))
                .collect();

            let (_, jacobian) = sdf.signed_distance(&points)?;
            for axis in 0..2 {
                let shifted = |sign: f64| -> Vec<Matrix2xX<f64>> {
                    points
                        .iter()
                        .map(|p| {
                            let mut p = p.clone();
                            p.row_mut(axis).add_scalar_mut(sign * h);
                            p
                        })
                        .collect()
                };
                let (plus, _) = sdf.signed_distance(&shifted(1.0))?;
                let (minus, _) = sdf.signed_distance(&shifted(-1.0))?;
                for b in 0..batch_size {
                    let numeric = (&plus[b] - &minus[b]) / (2.0 * h);
                    let analytic = jacobian[b].column(axis);
                    assert!((numeric - analytic).amax() < 1e-5, "batch {batch_size}, element {b}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_inconsistent_batch_is_rejected() {
        let data = vec![DMatrix::zeros(3, 3); 2];
        let origin = vec![Vector2::zeros(); 3];
        assert!(matches!(
            SignedDistanceField2D::new(&origin, &[0.1], &data),
            Err(CoreError::ShapeMismatch(_))
        ));
        let mixed = vec![DMatrix::zeros(3, 3), DMatrix::zeros(4, 3)];
        assert!(matches!(
            SignedDistanceField2D::new(&[Vector2::zeros()], &[0.1], &mixed),
            Err(CoreError::ShapeMismatch(_))
        ));
    }
}
