//! Type-erased manifold values.
//!
//! Variables of different manifold types live side by side in one objective, so the
//! graph stores them as [`ManifoldElement`]: a closed enum that dispatches statically to
//! the concrete [`LieGroup`] implementations. Tangent vectors cross this boundary as
//! `DVector<f64>` and Jacobians as `DMatrix<f64>`.

use crate::manifold::{
    DynMatrix, LieGroup, ManifoldError, ManifoldResult, ManifoldType, Tangent,
    TangentConvention,
    point::{Point2, Point2Tangent, Point3, Point3Tangent},
    rn::{Rn, RnTangent},
    se2::{SE2, SE2Tangent},
    se3::{SE3, SE3Tangent},
    so2::{SO2, SO2Tangent},
    so3::{SO3, SO3Tangent},
};
use nalgebra::{DMatrix, DVector, Quaternion, UnitComplex, UnitQuaternion, Vector2, Vector3};
use rand::Rng;
use std::fmt;

/// Tolerance used when validating unit-norm parameters handed in by callers.
const UNIT_NORM_TOLERANCE: f64 = 1e-6;

/// A single value on one of the supported manifolds.
#[derive(Clone, Debug, PartialEq)]
pub enum ManifoldElement {
    Vector(Rn),
    Point2(Point2),
    Point3(Point3),
    SO2(SO2),
    SO3(SO3),
    SE2(SE2),
    SE3(SE3),
}

/// Apply the same generic expression to whichever group `$element` holds.
macro_rules! dispatch {
    ($element:expr, $g:ident => $body:expr) => {
        match $element {
            ManifoldElement::Vector($g) => $body,
            ManifoldElement::Point2($g) => $body,
            ManifoldElement::Point3($g) => $body,
            ManifoldElement::SO2($g) => $body,
            ManifoldElement::SO3($g) => $body,
            ManifoldElement::SE2($g) => $body,
            ManifoldElement::SE3($g) => $body,
        }
    };
}

/// Same as [`dispatch!`] but rewraps a group-valued result in its variant.
macro_rules! dispatch_map {
    ($element:expr, $g:ident => $body:expr) => {
        match $element {
            ManifoldElement::Vector($g) => ManifoldElement::Vector($body),
            ManifoldElement::Point2($g) => ManifoldElement::Point2($body),
            ManifoldElement::Point3($g) => ManifoldElement::Point3($body),
            ManifoldElement::SO2($g) => ManifoldElement::SO2($body),
            ManifoldElement::SO3($g) => ManifoldElement::SO3($body),
            ManifoldElement::SE2($g) => ManifoldElement::SE2($body),
            ManifoldElement::SE3($g) => ManifoldElement::SE3($body),
        }
    };
}

/// Pairwise dispatch; elements of different groups produce a `TypeMismatch`.
macro_rules! dispatch_pair {
    ($lhs:expr, $rhs:expr, $a:ident, $b:ident => $body:expr) => {
        match ($lhs, $rhs) {
            (ManifoldElement::Vector($a), ManifoldElement::Vector($b)) => {
                if $a.dim() != $b.dim() {
                    return Err(ManifoldError::DimensionMismatch {
                        expected: $a.dim(),
                        actual: $b.dim(),
                    });
                }
                Ok(ManifoldElement::Vector($body))
            }
            (ManifoldElement::Point2($a), ManifoldElement::Point2($b)) => {
                Ok(ManifoldElement::Point2($body))
            }
            (ManifoldElement::Point3($a), ManifoldElement::Point3($b)) => {
                Ok(ManifoldElement::Point3($body))
            }
            (ManifoldElement::SO2($a), ManifoldElement::SO2($b)) => Ok(ManifoldElement::SO2($body)),
            (ManifoldElement::SO3($a), ManifoldElement::SO3($b)) => Ok(ManifoldElement::SO3($body)),
            (ManifoldElement::SE2($a), ManifoldElement::SE2($b)) => Ok(ManifoldElement::SE2($body)),
            (ManifoldElement::SE3($a), ManifoldElement::SE3($b)) => Ok(ManifoldElement::SE3($body)),
            (lhs, rhs) => Err(ManifoldError::TypeMismatch {
                expected: lhs.manifold_type(),
                actual: rhs.manifold_type(),
            }),
        }
    };
}

fn retract_group<G: LieGroup>(
    g: &G,
    delta: &DVector<f64>,
    convention: TangentConvention,
) -> G {
    g.retract(&G::TangentVector::from_dvector(delta), convention)
}

fn retract_jacobians_group<G: LieGroup>(
    delta: &DVector<f64>,
    convention: TangentConvention,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let tangent = G::TangentVector::from_dvector(delta);
    let exp_delta = tangent.exp(None);
    match convention {
        TangentConvention::Right => (
            exp_delta.inverse(None).adjoint().to_dmatrix(),
            tangent.right_jacobian().to_dmatrix(),
        ),
        TangentConvention::Left => (
            exp_delta.adjoint().to_dmatrix(),
            tangent.left_jacobian().to_dmatrix(),
        ),
    }
}

impl ManifoldElement {
    pub fn manifold_type(&self) -> ManifoldType {
        match self {
            ManifoldElement::Vector(_) => ManifoldType::Vector,
            ManifoldElement::Point2(_) => ManifoldType::Point2,
            ManifoldElement::Point3(_) => ManifoldType::Point3,
            ManifoldElement::SO2(_) => ManifoldType::SO2,
            ManifoldElement::SO3(_) => ManifoldType::SO3,
            ManifoldElement::SE2(_) => ManifoldType::SE2,
            ManifoldElement::SE3(_) => ManifoldType::SE3,
        }
    }

    /// Dimension of the tangent space (1 for SO2, 3 for SO3, k for a k-vector, ...).
    pub fn tangent_dim(&self) -> usize {
        dispatch!(self, g => g.tangent_dim())
    }

    /// True when both elements belong to the same group with the same tangent dimension.
    pub fn same_space(&self, other: &Self) -> bool {
        self.manifold_type() == other.manifold_type() && self.tangent_dim() == other.tangent_dim()
    }

    /// Identity of the group `self` belongs to.
    pub fn identity_like(&self) -> Self {
        match self {
            ManifoldElement::Vector(v) => ManifoldElement::Vector(Rn::zeros(v.dim())),
            ManifoldElement::Point2(_) => ManifoldElement::Point2(Point2::origin()),
            ManifoldElement::Point3(_) => ManifoldElement::Point3(Point3::origin()),
            ManifoldElement::SO2(_) => ManifoldElement::SO2(SO2::identity()),
            ManifoldElement::SO3(_) => ManifoldElement::SO3(SO3::identity()),
            ManifoldElement::SE2(_) => ManifoldElement::SE2(SE2::identity()),
            ManifoldElement::SE3(_) => ManifoldElement::SE3(SE3::identity()),
        }
    }

    pub fn compose(&self, other: &Self) -> ManifoldResult<Self> {
        dispatch_pair!(self, other, a, b => a.compose(b, None, None))
    }

    /// `self⁻¹ ∘ other`
    pub fn between(&self, other: &Self) -> ManifoldResult<Self> {
        dispatch_pair!(self, other, a, b => a.between(b, None, None))
    }

    pub fn inverse(&self) -> Self {
        dispatch_map!(self, g => g.inverse(None))
    }

    /// Logarithmic map to tangent coordinates.
    pub fn log(&self) -> DVector<f64> {
        dispatch!(self, g => g.log(None).to_dvector())
    }

    /// Jacobian of `log(self ∘ exp(δ))` at `δ = 0`, which is `Jr⁻¹(log self)`.
    pub fn log_jacobian(&self) -> DMatrix<f64> {
        dispatch!(self, g => g.log(None).right_jacobian_inv().to_dmatrix())
    }

    /// Exponential map of `tangent` into the group `kind`.
    ///
    /// For `ManifoldType::Vector` the dimension is taken from `tangent`.
    pub fn exp(kind: ManifoldType, tangent: &DVector<f64>) -> ManifoldResult<Self> {
        let expected = match kind {
            ManifoldType::Vector => tangent.len(),
            ManifoldType::SO2 => SO2Tangent::DIM,
            ManifoldType::Point2 => Point2Tangent::DIM,
            ManifoldType::Point3 => Point3Tangent::DIM,
            ManifoldType::SO3 => SO3Tangent::DIM,
            ManifoldType::SE2 => SE2Tangent::DIM,
            ManifoldType::SE3 => SE3Tangent::DIM,
        };
        if tangent.len() != expected {
            return Err(ManifoldError::InvalidTangentDimension {
                expected,
                actual: tangent.len(),
            });
        }
        Ok(match kind {
            ManifoldType::Vector => {
                ManifoldElement::Vector(RnTangent::from_dvector(tangent).exp(None))
            }
            ManifoldType::Point2 => {
                ManifoldElement::Point2(Point2Tangent::from_dvector(tangent).exp(None))
            }
            ManifoldType::Point3 => {
                ManifoldElement::Point3(Point3Tangent::from_dvector(tangent).exp(None))
            }
            ManifoldType::SO2 => ManifoldElement::SO2(SO2Tangent::from_dvector(tangent).exp(None)),
            ManifoldType::SO3 => ManifoldElement::SO3(SO3Tangent::from_dvector(tangent).exp(None)),
            ManifoldType::SE2 => ManifoldElement::SE2(SE2Tangent::from_dvector(tangent).exp(None)),
            ManifoldType::SE3 => ManifoldElement::SE3(SE3Tangent::from_dvector(tangent).exp(None)),
        })
    }

    /// Adjoint matrix as a dense `tangent_dim × tangent_dim` matrix.
    pub fn adjoint(&self) -> DMatrix<f64> {
        dispatch!(self, g => g.adjoint().to_dmatrix())
    }

    fn check_tangent(&self, delta: &DVector<f64>) -> ManifoldResult<()> {
        let expected = self.tangent_dim();
        if delta.len() != expected {
            return Err(ManifoldError::InvalidTangentDimension {
                expected,
                actual: delta.len(),
            });
        }
        if delta.iter().any(|x| !x.is_finite()) {
            return Err(ManifoldError::InvalidNumber);
        }
        Ok(())
    }

    /// `self ∘ exp(delta)`
    pub fn retract(&self, delta: &DVector<f64>) -> ManifoldResult<Self> {
        self.retract_with(delta, TangentConvention::Right)
    }

    pub fn retract_with(
        &self,
        delta: &DVector<f64>,
        convention: TangentConvention,
    ) -> ManifoldResult<Self> {
        self.check_tangent(delta)?;
        Ok(dispatch_map!(self, g => retract_group(g, delta, convention)))
    }

    /// `log(self⁻¹ ∘ other)`
    pub fn local(&self, other: &Self) -> ManifoldResult<DVector<f64>> {
        self.local_with(other, TangentConvention::Right)
    }

    pub fn local_with(
        &self,
        other: &Self,
        convention: TangentConvention,
    ) -> ManifoldResult<DVector<f64>> {
        if !self.same_space(other) {
            return Err(ManifoldError::TypeMismatch {
                expected: self.manifold_type(),
                actual: other.manifold_type(),
            });
        }
        let step = match (self, other) {
            (ManifoldElement::Vector(a), ManifoldElement::Vector(b)) => {
                a.local(b, convention).to_dvector()
            }
            (ManifoldElement::Point2(a), ManifoldElement::Point2(b)) => {
                a.local(b, convention).to_dvector()
            }
            (ManifoldElement::Point3(a), ManifoldElement::Point3(b)) => {
                a.local(b, convention).to_dvector()
            }
            (ManifoldElement::SO2(a), ManifoldElement::SO2(b)) => {
                a.local(b, convention).to_dvector()
            }
            (ManifoldElement::SO3(a), ManifoldElement::SO3(b)) => {
                a.local(b, convention).to_dvector()
            }
            (ManifoldElement::SE2(a), ManifoldElement::SE2(b)) => {
                a.local(b, convention).to_dvector()
            }
            (ManifoldElement::SE3(a), ManifoldElement::SE3(b)) => {
                a.local(b, convention).to_dvector()
            }
            _ => {
                return Err(ManifoldError::TypeMismatch {
                    expected: self.manifold_type(),
                    actual: other.manifold_type(),
                });
            }
        };
        Ok(step)
    }

    /// Jacobians of `retract_with(self, delta, convention)` with respect to `self` and
    /// `delta`, both expressed in `convention`'s tangent coordinates.
    pub fn retract_jacobians(
        &self,
        delta: &DVector<f64>,
        convention: TangentConvention,
    ) -> ManifoldResult<(DMatrix<f64>, DMatrix<f64>)> {
        self.check_tangent(delta)?;
        Ok(match self {
            ManifoldElement::Vector(_) => retract_jacobians_group::<Rn>(delta, convention),
            ManifoldElement::Point2(_) => retract_jacobians_group::<Point2>(delta, convention),
            ManifoldElement::Point3(_) => retract_jacobians_group::<Point3>(delta, convention),
            ManifoldElement::SO2(_) => retract_jacobians_group::<SO2>(delta, convention),
            ManifoldElement::SO3(_) => retract_jacobians_group::<SO3>(delta, convention),
            ManifoldElement::SE2(_) => retract_jacobians_group::<SE2>(delta, convention),
            ManifoldElement::SE3(_) => retract_jacobians_group::<SE3>(delta, convention),
        })
    }

    /// Check the group constraint (unit quaternion, unit complex, finite entries).
    pub fn is_valid(&self, tolerance: f64) -> bool {
        dispatch!(self, g => g.is_valid(tolerance))
    }

    pub fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        match self.local(other) {
            Ok(step) => step.norm() < tolerance,
            Err(_) => false,
        }
    }

    /// Parameter vector of the element.
    ///
    /// | Type    | Layout                          |
    /// |---------|---------------------------------|
    /// | Vector  | `[v₀, …, vₖ₋₁]`                 |
    /// | Point2  | `[x, y]`                        |
    /// | Point3  | `[x, y, z]`                     |
    /// | SO2     | `[cos θ, sin θ]`                |
    /// | SO3     | `[w, x, y, z]`                  |
    /// | SE2     | `[x, y, cos θ, sin θ]`          |
    /// | SE3     | `[tx, ty, tz, w, x, y, z]`      |
    pub fn to_vector(&self) -> DVector<f64> {
        match self {
            ManifoldElement::Vector(v) => v.data().clone(),
            ManifoldElement::Point2(p) => DVector::from_vec(vec![p.x(), p.y()]),
            ManifoldElement::Point3(p) => DVector::from_vec(vec![p.x(), p.y(), p.z()]),
            ManifoldElement::SO2(r) => {
                let c = r.complex();
                DVector::from_vec(vec![c.re, c.im])
            }
            ManifoldElement::SO3(r) => DVector::from_row_slice(&r.coeffs()),
            ManifoldElement::SE2(g) => {
                let c = g.rotation_so2().complex();
                DVector::from_vec(vec![g.x(), g.y(), c.re, c.im])
            }
            ManifoldElement::SE3(g) => {
                let t = g.translation();
                let [w, x, y, z] = g.rotation_so3().coeffs();
                DVector::from_vec(vec![t.x, t.y, t.z, w, x, y, z])
            }
        }
    }

    /// Inverse of [`ManifoldElement::to_vector`]. Rotation parts must already be of unit
    /// norm; nothing is silently normalized.
    pub fn from_vector(kind: ManifoldType, data: &DVector<f64>) -> ManifoldResult<Self> {
        let expected = match kind {
            ManifoldType::Vector => data.len(),
            ManifoldType::Point2 | ManifoldType::SO2 => 2,
            ManifoldType::Point3 => 3,
            ManifoldType::SO3 | ManifoldType::SE2 => 4,
            ManifoldType::SE3 => 7,
        };
        if data.len() != expected {
            return Err(ManifoldError::DimensionMismatch {
                expected,
                actual: data.len(),
            });
        }
        if data.iter().any(|x| !x.is_finite()) {
            return Err(ManifoldError::InvalidNumber);
        }
        let unit_complex = |re: f64, im: f64| -> ManifoldResult<UnitComplex<f64>> {
            if ((re * re + im * im).sqrt() - 1.0).abs() > UNIT_NORM_TOLERANCE {
                return Err(ManifoldError::InvalidElement(format!(
                    "complex number ({re}, {im}) is not of unit norm"
                )));
            }
            Ok(UnitComplex::from_cos_sin_unchecked(re, im))
        };
        let unit_quaternion = |q: Quaternion<f64>| -> ManifoldResult<UnitQuaternion<f64>> {
            if (q.norm() - 1.0).abs() > UNIT_NORM_TOLERANCE {
                let (w, x, y, z) = (q.w, q.i, q.j, q.k);
                return Err(ManifoldError::InvalidElement(format!(
                    "quaternion [{w}, {x}, {y}, {z}] is not of unit norm"
                )));
            }
            Ok(UnitQuaternion::new_unchecked(q))
        };
        Ok(match kind {
            ManifoldType::Vector => ManifoldElement::Vector(Rn::new(data.clone())),
            ManifoldType::Point2 => ManifoldElement::Point2(Point2::new(data[0], data[1])),
            ManifoldType::Point3 => ManifoldElement::Point3(Point3::new(data[0], data[1], data[2])),
            ManifoldType::SO2 => ManifoldElement::SO2(SO2::new(unit_complex(data[0], data[1])?)),
            ManifoldType::SO3 => {
                let q = Quaternion::new(data[0], data[1], data[2], data[3]);
                ManifoldElement::SO3(SO3::new(unit_quaternion(q)?))
            }
            ManifoldType::SE2 => ManifoldElement::SE2(SE2::new(
                Vector2::new(data[0], data[1]),
                unit_complex(data[2], data[3])?,
            )),
            ManifoldType::SE3 => ManifoldElement::SE3(SE3::new(
                Vector3::new(data[0], data[1], data[2]),
                unit_quaternion(Quaternion::new(data[3], data[4], data[5], data[6]))?,
            )),
        })
    }

    /// Random element: translations and vector entries in `[-scale, scale]`, rotation
    /// angles uniform in `[-π, π)`.
    pub fn random<R: Rng>(kind: ManifoldType, dim: usize, scale: f64, rng: &mut R) -> Self {
        let uniform = |n: usize, rng: &mut R| {
            DVector::from_fn(n, |_, _| rng.random_range(-scale..=scale))
        };
        match kind {
            ManifoldType::Vector => ManifoldElement::Vector(Rn::new(uniform(dim, rng))),
            ManifoldType::Point2 => {
                let v = uniform(2, rng);
                ManifoldElement::Point2(Point2::new(v[0], v[1]))
            }
            ManifoldType::Point3 => {
                let v = uniform(3, rng);
                ManifoldElement::Point3(Point3::new(v[0], v[1], v[2]))
            }
            ManifoldType::SO2 => {
                let angle = rng.random_range(-std::f64::consts::PI..std::f64::consts::PI);
                ManifoldElement::SO2(SO2::from_angle(angle))
            }
            ManifoldType::SO3 => {
                let axis = Vector3::new(
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                );
                let angle = rng.random_range(-std::f64::consts::PI..std::f64::consts::PI);
                let axis = if axis.norm() > 1e-6 { axis } else { Vector3::z() };
                ManifoldElement::SO3(SO3::from_axis_angle(&axis, angle))
            }
            ManifoldType::SE2 => {
                let t = uniform(2, rng);
                let angle = rng.random_range(-std::f64::consts::PI..std::f64::consts::PI);
                ManifoldElement::SE2(SE2::from_xy_angle(t[0], t[1], angle))
            }
            ManifoldType::SE3 => {
                let t = uniform(3, rng);
                let rotation = match ManifoldElement::random(ManifoldType::SO3, 3, scale, rng) {
                    ManifoldElement::SO3(r) => r,
                    _ => SO3::identity(),
                };
                let translation = Vector3::new(t[0], t[1], t[2]);
                ManifoldElement::SE3(SE3::from_translation_so3(translation, rotation))
            }
        }
    }

    pub fn as_vector(&self) -> Option<&Rn> {
        match self {
            ManifoldElement::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_point2(&self) -> Option<&Point2> {
        match self {
            ManifoldElement::Point2(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_point3(&self) -> Option<&Point3> {
        match self {
            ManifoldElement::Point3(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_so2(&self) -> Option<&SO2> {
        match self {
            ManifoldElement::SO2(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_so3(&self) -> Option<&SO3> {
        match self {
            ManifoldElement::SO3(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_se2(&self) -> Option<&SE2> {
        match self {
            ManifoldElement::SE2(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_se3(&self) -> Option<&SE3> {
        match self {
            ManifoldElement::SE3(g) => Some(g),
            _ => None,
        }
    }

    /// Convenience constructor for a Vector element.
    pub fn vector(values: &[f64]) -> Self {
        ManifoldElement::Vector(Rn::from_slice(values))
    }

    /// SE2 element from translation and rotation given as `(cos θ, sin θ)`.
    pub fn se2_from_cos_sin(x: f64, y: f64, cos: f64, sin: f64) -> ManifoldResult<Self> {
        ManifoldElement::from_vector(ManifoldType::SE2, &DVector::from_vec(vec![x, y, cos, sin]))
    }

    /// SO3 element from a scaled rotation axis.
    pub fn so3_from_scaled_axis(axis_angle: Vector3<f64>) -> Self {
        ManifoldElement::SO3(SO3Tangent::new(axis_angle).exp(None))
    }
}

impl fmt::Display for ManifoldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, g => write!(f, "{g}"))
    }
}

impl From<Rn> for ManifoldElement {
    fn from(v: Rn) -> Self {
        ManifoldElement::Vector(v)
    }
}

impl From<Point2> for ManifoldElement {
    fn from(p: Point2) -> Self {
        ManifoldElement::Point2(p)
    }
}

impl From<Point3> for ManifoldElement {
    fn from(p: Point3) -> Self {
        ManifoldElement::Point3(p)
    }
}

impl From<SO2> for ManifoldElement {
    fn from(r: SO2) -> Self {
        ManifoldElement::SO2(r)
    }
}

impl From<SO3> for ManifoldElement {
    fn from(r: SO3) -> Self {
        ManifoldElement::SO3(r)
    }
}

impl From<SE2> for ManifoldElement {
    fn from(g: SE2) -> Self {
        ManifoldElement::SE2(g)
    }
}

impl From<SE3> for ManifoldElement {
    fn from(g: SE3) -> Self {
        ManifoldElement::SE3(g)
    }
}
