//! SO(3) - Special Orthogonal Group in 3D
//!
//! Rotations of space, stored as a unit quaternion. Tangent vectors are axis-angle
//! vectors θ ∈ R³ with rotation angle ‖θ‖.
//!
//! Closed-form Jacobians (Solà et al., "A micro Lie theory for state estimation in
//! robotics"):
//!
//! ```text
//! Jl(θ)   = I + (1 - cos‖θ‖)/‖θ‖² [θ]× + (‖θ‖ - sin‖θ‖)/‖θ‖³ [θ]×²
//! Jl⁻¹(θ) = I - ½[θ]× + (1/‖θ‖² - (1 + cos‖θ‖)/(2‖θ‖ sin‖θ‖)) [θ]×²
//! Jr(θ)   = Jl(-θ) = Jl(θ)ᵀ
//! ```

use crate::manifold::{LieGroup, SMALL_ANGLE_SQ, Tangent, skew};
use nalgebra::{DVector, Matrix3, Quaternion, Unit, UnitQuaternion, Vector3};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// SO(3) group element representing rotations in 3D.
#[derive(Clone, Debug, PartialEq)]
pub struct SO3 {
    quaternion: UnitQuaternion<f64>,
}

impl Display for SO3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let q = self.quaternion.quaternion();
        write!(
            f,
            "SO3(quaternion: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            q.w, q.i, q.j, q.k
        )
    }
}

impl SO3 {
    pub fn identity() -> Self {
        SO3 {
            quaternion: UnitQuaternion::identity(),
        }
    }

    pub fn new(quaternion: UnitQuaternion<f64>) -> Self {
        SO3 { quaternion }
    }

    /// Build from quaternion coefficients, normalizing them.
    pub fn from_quaternion_coeffs(w: f64, x: f64, y: f64, z: f64) -> Self {
        SO3::new(UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)))
    }

    pub fn from_euler_angles(roll: f64, pitch: f64, yaw: f64) -> Self {
        SO3::new(UnitQuaternion::from_euler_angles(roll, pitch, yaw))
    }

    pub fn from_axis_angle(axis: &Vector3<f64>, angle: f64) -> Self {
        SO3::new(UnitQuaternion::from_axis_angle(
            &Unit::new_normalize(*axis),
            angle,
        ))
    }

    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.quaternion
    }

    /// Coefficients in `[w, x, y, z]` order.
    pub fn coeffs(&self) -> [f64; 4] {
        let q = self.quaternion.quaternion();
        [q.w, q.i, q.j, q.k]
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.quaternion.to_rotation_matrix().into_inner()
    }

    pub fn rotate(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.quaternion * v
    }
}

impl LieGroup for SO3 {
    type TangentVector = SO3Tangent;
    type JacobianMatrix = Matrix3<f64>;

    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }
        SO3::new(self.quaternion.inverse())
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        if let Some(jac) = jacobian_self {
            *jac = other.rotation_matrix().transpose();
        }
        if let Some(jac) = jacobian_other {
            *jac = Matrix3::identity();
        }
        SO3::new(self.quaternion * other.quaternion)
    }

    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> SO3Tangent {
        let q = self.quaternion.quaternion();
        let sin_sq = q.i * q.i + q.j * q.j + q.k * q.k;

        let log_coeff = if sin_sq > f64::EPSILON {
            let sin_half = sin_sq.sqrt();
            let cos_half = q.w;
            // Keep the angle in [-π, π] for the double cover.
            let two_angle = 2.0
                * if cos_half < 0.0 {
                    f64::atan2(-sin_half, -cos_half)
                } else {
                    f64::atan2(sin_half, cos_half)
                };
            two_angle / sin_half
        } else {
            2.0 / q.w * (1.0 - sin_sq / (3.0 * q.w * q.w))
        };

        let tangent = SO3Tangent::new(Vector3::new(
            q.i * log_coeff,
            q.j * log_coeff,
            q.k * log_coeff,
        ));

        if let Some(jac) = jacobian {
            *jac = tangent.right_jacobian_inv();
        }

        tangent
    }

    fn adjoint(&self) -> Self::JacobianMatrix {
        self.rotation_matrix()
    }

    fn jacobian_identity(&self) -> Self::JacobianMatrix {
        Matrix3::identity()
    }

    fn normalize(&mut self) {
        self.quaternion.renormalize();
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        let q = self.quaternion.quaternion();
        q.coords.iter().all(|x| x.is_finite()) && (q.norm() - 1.0).abs() < tolerance
    }
}

/// SO(3) tangent space element (axis-angle vector).
#[derive(Clone, Debug, PartialEq)]
pub struct SO3Tangent {
    data: Vector3<f64>,
}

impl SO3Tangent {
    pub fn new(axis_angle: Vector3<f64>) -> Self {
        SO3Tangent { data: axis_angle }
    }

    pub fn from_components(x: f64, y: f64, z: f64) -> Self {
        SO3Tangent::new(Vector3::new(x, y, z))
    }

    pub fn axis_angle(&self) -> Vector3<f64> {
        self.data
    }

    pub fn angle(&self) -> f64 {
        self.data.norm()
    }
}

/// Coefficients `(a, b)` of `Jl(θ) = I + a [θ]× + b [θ]×²`.
pub(crate) fn left_jacobian_coeffs(theta_sq: f64) -> (f64, f64) {
    if theta_sq < SMALL_ANGLE_SQ {
        (
            0.5 - theta_sq / 24.0 + theta_sq * theta_sq / 720.0,
            1.0 / 6.0 - theta_sq / 120.0 + theta_sq * theta_sq / 5040.0,
        )
    } else {
        let theta = theta_sq.sqrt();
        (
            (1.0 - theta.cos()) / theta_sq,
            (theta - theta.sin()) / (theta_sq * theta),
        )
    }
}

/// Coefficient `c` of `Jl⁻¹(θ) = I - ½[θ]× + c [θ]×²`.
pub(crate) fn left_jacobian_inv_coeff(theta_sq: f64) -> f64 {
    if theta_sq < SMALL_ANGLE_SQ {
        1.0 / 12.0 + theta_sq / 720.0 + theta_sq * theta_sq / 30240.0
    } else {
        let theta = theta_sq.sqrt();
        1.0 / theta_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin())
    }
}

/// Left Jacobian of SO(3) at `theta`.
pub(crate) fn so3_left_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
    let (a, b) = left_jacobian_coeffs(theta.norm_squared());
    let w = skew(theta);
    Matrix3::identity() + a * w + b * w * w
}

/// Inverse left Jacobian of SO(3) at `theta`.
pub(crate) fn so3_left_jacobian_inv(theta: &Vector3<f64>) -> Matrix3<f64> {
    let c = left_jacobian_inv_coeff(theta.norm_squared());
    let w = skew(theta);
    Matrix3::identity() - 0.5 * w + c * w * w
}

impl Tangent<SO3> for SO3Tangent {
    const DIM: usize = 3;

    fn exp(&self, jacobian: Option<&mut Matrix3<f64>>) -> SO3 {
        let theta_sq = self.data.norm_squared();
        // q = [cos(θ/2), sin(θ/2)/θ · θ]
        let (w, k) = if theta_sq < SMALL_ANGLE_SQ {
            (
                1.0 - theta_sq / 8.0 + theta_sq * theta_sq / 384.0,
                0.5 - theta_sq / 48.0 + theta_sq * theta_sq / 3840.0,
            )
        } else {
            let theta = theta_sq.sqrt();
            let half = 0.5 * theta;
            (half.cos(), half.sin() / theta)
        };

        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }

        SO3::new(UnitQuaternion::new_normalize(Quaternion::new(
            w,
            k * self.data.x,
            k * self.data.y,
            k * self.data.z,
        )))
    }

    fn right_jacobian(&self) -> Matrix3<f64> {
        so3_left_jacobian(&self.data).transpose()
    }

    fn left_jacobian(&self) -> Matrix3<f64> {
        so3_left_jacobian(&self.data)
    }

    fn right_jacobian_inv(&self) -> Matrix3<f64> {
        so3_left_jacobian_inv(&self.data).transpose()
    }

    fn left_jacobian_inv(&self) -> Matrix3<f64> {
        so3_left_jacobian_inv(&self.data)
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.data.norm() < tolerance
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.data.as_slice())
    }

    fn from_dvector(data: &DVector<f64>) -> Self {
        SO3Tangent::from_components(data[0], data[1], data[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::TangentConvention;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    const TOLERANCE: f64 = 1e-9;

    fn sample_rotations() -> Vec<SO3> {
        vec![
            SO3::identity(),
            SO3::from_euler_angles(0.1, -0.2, 0.3),
            SO3::from_axis_angle(&Vector3::new(1.0, 1.0, 0.0), 2.5),
            SO3::from_axis_angle(&Vector3::new(0.0, 0.0, 1.0), 1e-4),
        ]
    }

    #[test]
    fn test_so3_exp_log_consistency() {
        for theta in [
            Vector3::new(0.1, 0.2, 0.3),
            Vector3::new(1e-7, -2e-7, 0.0),
            Vector3::new(0.0, 3.0, 0.0),
            Vector3::new(0.002, 0.001, -0.003),
        ] {
            let r = SO3Tangent::new(theta).exp(None);
            assert_relative_eq!(r.log(None).axis_angle(), theta, epsilon = TOLERANCE);
        }
    }

    #[test]
    fn test_so3_log_of_half_turn_is_pi() {
        let r = SO3::from_axis_angle(&Vector3::new(0.0, 1.0, 0.0), PI);
        assert!((r.log(None).angle() - PI).abs() < TOLERANCE);
    }

    #[test]
    fn test_so3_inverse_law() {
        for r in sample_rotations() {
            let e = r.compose(&r.inverse(None), None, None);
            assert!(e.is_approx(&SO3::identity(), TOLERANCE));
        }
    }

    #[test]
    fn test_so3_jacobian_inverses() {
        for theta in [
            Vector3::new(0.4, -0.1, 0.7),
            Vector3::new(1e-3, 2e-3, 0.0),
            Vector3::new(0.0, 0.0, 3.0),
        ] {
            let t = SO3Tangent::new(theta);
            assert_relative_eq!(
                t.left_jacobian() * t.left_jacobian_inv(),
                Matrix3::identity(),
                epsilon = 1e-9
            );
            assert_relative_eq!(
                t.right_jacobian() * t.right_jacobian_inv(),
                Matrix3::identity(),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_so3_right_jacobian_matches_finite_difference() {
        // exp(θ + δ) ≈ exp(θ) ∘ exp(Jr δ)
        let theta = Vector3::new(0.3, -0.5, 0.8);
        let t = SO3Tangent::new(theta);
        let base = t.exp(None);
        let jr = t.right_jacobian();
        let h = 1e-6;
        for i in 0..3 {
            let mut step = Vector3::zeros();
            step[i] = h;
            let perturbed = SO3Tangent::new(theta + step).exp(None);
            let column = perturbed.right_minus(&base, None, None).axis_angle() / h;
            assert_relative_eq!(column, jr.column(i).into_owned(), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_so3_right_minus_jacobians_match_finite_difference() {
        let a = SO3::from_euler_angles(0.3, 0.2, -0.4);
        let b = SO3::from_euler_angles(-0.1, 0.5, 0.2);
        let mut j_a = Matrix3::zeros();
        let mut j_b = Matrix3::zeros();
        let d = a.right_minus(&b, Some(&mut j_a), Some(&mut j_b));
        let h = 1e-6;
        for i in 0..3 {
            let mut step = Vector3::zeros();
            step[i] = h;
            let dt = SO3Tangent::new(step);
            let da = a
                .right_plus(&dt, None, None)
                .right_minus(&b, None, None)
                .axis_angle();
            let db = a
                .right_minus(&b.right_plus(&dt, None, None), None, None)
                .axis_angle();
            assert_relative_eq!(
                (da - d.axis_angle()) / h,
                j_a.column(i).into_owned(),
                epsilon = 1e-5
            );
            assert_relative_eq!(
                (db - d.axis_angle()) / h,
                j_b.column(i).into_owned(),
                epsilon = 1e-5
            );
        }
    }

    #[test]
    fn test_so3_adjoint_moves_perturbation_side() {
        let r = SO3::from_euler_angles(0.2, -0.7, 1.1);
        let phi = SO3Tangent::from_components(0.05, 0.02, -0.03);
        let lhs = r.compose(&phi.exp(None), None, None);
        let rhs = SO3Tangent::new(r.adjoint() * phi.axis_angle())
            .exp(None)
            .compose(&r, None, None);
        assert!(lhs.is_approx(&rhs, TOLERANCE));
    }

    #[test]
    fn test_so3_left_convention_round_trip() {
        let a = SO3::from_euler_angles(0.5, 0.1, -0.2);
        let b = SO3::from_euler_angles(-0.3, 0.4, 0.9);
        let d = a.local(&b, TangentConvention::Left);
        assert!(a.retract(&d, TangentConvention::Left).is_approx(&b, TOLERANCE));
    }

    #[test]
    fn test_so3_rotate() {
        let r = SO3::from_axis_angle(&Vector3::new(0.0, 0.0, 1.0), PI / 2.0);
        assert_relative_eq!(
            r.rotate(&Vector3::new(1.0, 0.0, 0.0)),
            Vector3::new(0.0, 1.0, 0.0),
            epsilon = TOLERANCE
        );
    }
}
