//! SE(2) - Special Euclidean Group in 2D
//!
//! Rigid motions of the plane: a rotation (unit complex) and a translation. Tangent
//! vectors are ordered `[ρx, ρy, θ]`, translation first.
//!
//! With `a = sin θ / θ`, `b = (1 - cos θ) / θ`, `c = (θ - sin θ) / θ²` and
//! `d = (1 - cos θ) / θ²`:
//!
//! ```text
//! exp([ρ, θ]) = ( V(θ) ρ, θ ),   V(θ) = [a -b; b a]
//!
//!         [ a   b   c ρx - d ρy ]           [ a  -b   c ρx + d ρy ]
//! Jr  =   [-b   a   d ρx + c ρy ]    Jl  =  [ b   a  -d ρx + c ρy ]
//!         [ 0   0   1           ]           [ 0   0   1           ]
//! ```

use crate::manifold::{LieGroup, SMALL_ANGLE_SQ, Tangent, so2::SO2};
use nalgebra::{DVector, Isometry2, Matrix2, Matrix3, UnitComplex, Vector2};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// SE(2) group element: rotation followed by translation.
#[derive(Clone, Debug, PartialEq)]
pub struct SE2 {
    translation: Vector2<f64>,
    rotation: UnitComplex<f64>,
}

impl Display for SE2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SE2(translation: [{:.4}, {:.4}], rotation: {:.4})",
            self.translation.x,
            self.translation.y,
            self.rotation.angle()
        )
    }
}

impl SE2 {
    pub fn identity() -> Self {
        SE2 {
            translation: Vector2::zeros(),
            rotation: UnitComplex::identity(),
        }
    }

    pub fn new(translation: Vector2<f64>, rotation: UnitComplex<f64>) -> Self {
        SE2 {
            translation,
            rotation,
        }
    }

    pub fn from_xy_angle(x: f64, y: f64, theta: f64) -> Self {
        SE2::new(Vector2::new(x, y), UnitComplex::new(theta))
    }

    pub fn from_translation_so2(translation: Vector2<f64>, rotation: SO2) -> Self {
        SE2::new(translation, rotation.complex())
    }

    pub fn translation(&self) -> Vector2<f64> {
        self.translation
    }

    pub fn rotation_so2(&self) -> SO2 {
        SO2::new(self.rotation)
    }

    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn isometry(&self) -> Isometry2<f64> {
        Isometry2::from_parts(self.translation.into(), self.rotation)
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Transform a point from the body frame into the world frame.
    pub fn transform_point(&self, p: &Vector2<f64>) -> Vector2<f64> {
        self.rotation * p + self.translation
    }
}

impl LieGroup for SE2 {
    type TangentVector = SE2Tangent;
    type JacobianMatrix = Matrix3<f64>;

    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        let rot_inv = self.rotation.inverse();
        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }
        SE2::new(-(rot_inv * self.translation), rot_inv)
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        if let Some(jac_self) = jacobian_self {
            *jac_self = other.inverse(None).adjoint();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = Matrix3::identity();
        }
        SE2::new(
            self.rotation * other.translation + self.translation,
            self.rotation * other.rotation,
        )
    }

    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> SE2Tangent {
        let theta = self.angle();
        let (e, _) = inverse_coeffs(theta);
        let half = 0.5 * theta;
        let t = self.translation;

        // ρ = V(θ)⁻¹ t
        let result = SE2Tangent::new(e * t.x + half * t.y, -half * t.x + e * t.y, theta);

        if let Some(jac) = jacobian {
            *jac = result.right_jacobian_inv();
        }

        result
    }

    fn adjoint(&self) -> Self::JacobianMatrix {
        let mut adjoint_matrix = Matrix3::identity();
        adjoint_matrix
            .fixed_view_mut::<2, 2>(0, 0)
            .copy_from(&self.rotation_matrix());
        adjoint_matrix[(0, 2)] = self.y();
        adjoint_matrix[(1, 2)] = -self.x();
        adjoint_matrix
    }

    fn jacobian_identity(&self) -> Self::JacobianMatrix {
        Matrix3::identity()
    }

    fn normalize(&mut self) {
        self.rotation.renormalize();
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        let c = self.rotation.complex();
        self.translation.iter().all(|x| x.is_finite())
            && c.re.is_finite()
            && c.im.is_finite()
            && (c.norm_sqr() - 1.0).abs() < tolerance
    }
}

/// SE(2) tangent space element `[ρx, ρy, θ]`.
#[derive(Clone, Debug, PartialEq)]
pub struct SE2Tangent {
    data: nalgebra::Vector3<f64>,
}

impl SE2Tangent {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        SE2Tangent {
            data: nalgebra::Vector3::new(x, y, theta),
        }
    }

    pub fn x(&self) -> f64 {
        self.data[0]
    }

    pub fn y(&self) -> f64 {
        self.data[1]
    }

    pub fn angle(&self) -> f64 {
        self.data[2]
    }

    pub fn translation(&self) -> Vector2<f64> {
        Vector2::new(self.data[0], self.data[1])
    }
}

/// `(a, b, c, d)` as defined in the module docs.
fn forward_coeffs(theta: f64) -> (f64, f64, f64, f64) {
    let theta_sq = theta * theta;
    if theta_sq < SMALL_ANGLE_SQ {
        let theta_4 = theta_sq * theta_sq;
        (
            1.0 - theta_sq / 6.0 + theta_4 / 120.0,
            theta * (0.5 - theta_sq / 24.0 + theta_4 / 720.0),
            theta * (1.0 / 6.0 - theta_sq / 120.0 + theta_4 / 5040.0),
            0.5 - theta_sq / 24.0 + theta_4 / 720.0,
        )
    } else {
        let (sin, cos) = theta.sin_cos();
        (
            sin / theta,
            (1.0 - cos) / theta,
            (theta - sin) / theta_sq,
            (1.0 - cos) / theta_sq,
        )
    }
}

/// `(e, f)` with `e = (θ/2) cot(θ/2)` and `f = (1 - e) / θ`.
fn inverse_coeffs(theta: f64) -> (f64, f64) {
    let theta_sq = theta * theta;
    if theta_sq < SMALL_ANGLE_SQ {
        (
            1.0 - theta_sq / 12.0 - theta_sq * theta_sq / 720.0,
            theta * (1.0 / 12.0 + theta_sq / 720.0),
        )
    } else {
        let half = 0.5 * theta;
        let e = half * half.cos() / half.sin();
        (e, (1.0 - e) / theta)
    }
}

impl Tangent<SE2> for SE2Tangent {
    const DIM: usize = 3;

    fn exp(&self, jacobian: Option<&mut Matrix3<f64>>) -> SE2 {
        let theta = self.angle();
        let (a, b, _, _) = forward_coeffs(theta);
        let translation = Vector2::new(a * self.x() - b * self.y(), b * self.x() + a * self.y());

        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }

        SE2::new(translation, UnitComplex::new(theta))
    }

    fn right_jacobian(&self) -> Matrix3<f64> {
        let (a, b, c, d) = forward_coeffs(self.angle());
        let (x, y) = (self.x(), self.y());
        Matrix3::new(
            a,
            b,
            c * x - d * y,
            -b,
            a,
            d * x + c * y,
            0.0,
            0.0,
            1.0,
        )
    }

    fn left_jacobian(&self) -> Matrix3<f64> {
        let (a, b, c, d) = forward_coeffs(self.angle());
        let (x, y) = (self.x(), self.y());
        Matrix3::new(
            a,
            -b,
            c * x + d * y,
            b,
            a,
            -d * x + c * y,
            0.0,
            0.0,
            1.0,
        )
    }

    fn right_jacobian_inv(&self) -> Matrix3<f64> {
        let theta = self.angle();
        let (e, f) = inverse_coeffs(theta);
        let (x, y) = (self.x(), self.y());
        Matrix3::new(
            e,
            -0.5 * theta,
            f * x + 0.5 * y,
            0.5 * theta,
            e,
            -0.5 * x + f * y,
            0.0,
            0.0,
            1.0,
        )
    }

    fn left_jacobian_inv(&self) -> Matrix3<f64> {
        let theta = self.angle();
        let (e, f) = inverse_coeffs(theta);
        let (x, y) = (self.x(), self.y());
        Matrix3::new(
            e,
            0.5 * theta,
            f * x - 0.5 * y,
            -0.5 * theta,
            e,
            0.5 * x + f * y,
            0.0,
            0.0,
            1.0,
        )
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.data.norm() < tolerance
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.data.as_slice())
    }

    fn from_dvector(data: &DVector<f64>) -> Self {
        SE2Tangent::new(data[0], data[1], data[2])
    }
}
