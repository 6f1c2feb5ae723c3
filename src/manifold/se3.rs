//! SE(3) - Special Euclidean Group in 3D
//!
//! Rigid motions of space, stored as an [`SO3`] rotation and a translation.
//! Tangent vectors are `[ρ(3), θ(3)]`, translation first.
//!
//! The left Jacobian is block upper-triangular,
//!
//! ```text
//! Jl([ρ, θ]) = [ Jl(θ)  Q(ρ, θ) ]
//!              [   0     Jl(θ)  ]
//! ```
//!
//! and the right Jacobian follows from `Jr(ξ) = Jl(-ξ)`.

use crate::manifold::{
    LieGroup, SMALL_ANGLE_SQ, Tangent, skew,
    so3::{SO3, SO3Tangent, left_jacobian_coeffs, so3_left_jacobian, so3_left_jacobian_inv},
};
use nalgebra::{
    DVector, Isometry3, Matrix3, Matrix6, Translation3, UnitQuaternion, Vector3, Vector6,
};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// SE(3) group element representing rigid body transformations in 3D.
#[derive(Clone, Debug, PartialEq)]
pub struct SE3 {
    rotation: SO3,
    translation: Vector3<f64>,
}

impl Display for SE3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let t = self.translation;
        let [w, x, y, z] = self.rotation.coeffs();
        write!(
            f,
            "SE3(translation: [{:.4}, {:.4}, {:.4}], \
             rotation: [w: {w:.4}, x: {x:.4}, y: {y:.4}, z: {z:.4}])",
            t.x, t.y, t.z
        )
    }
}

impl SE3 {
    pub fn identity() -> Self {
        SE3 {
            rotation: SO3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        SE3 {
            rotation: SO3::new(rotation),
            translation,
        }
    }

    pub fn from_translation_so3(translation: Vector3<f64>, rotation: SO3) -> Self {
        SE3 {
            rotation,
            translation,
        }
    }

    pub fn from_translation_euler(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        SE3::from_translation_so3(
            Vector3::new(x, y, z),
            SO3::from_euler_angles(roll, pitch, yaw),
        )
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    pub fn rotation_so3(&self) -> SO3 {
        self.rotation.clone()
    }

    pub fn rotation_quaternion(&self) -> UnitQuaternion<f64> {
        self.rotation.quaternion()
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            self.rotation.quaternion(),
        )
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.rotate(p) + self.translation
    }
}

impl LieGroup for SE3 {
    type TangentVector = SE3Tangent;
    type JacobianMatrix = Matrix6<f64>;

    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        let rot_inv = self.rotation.inverse(None);
        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }
        let translation = -rot_inv.rotate(&self.translation);
        SE3::from_translation_so3(translation, rot_inv)
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
            *jac_other = Matrix6::identity();
        }
        SE3::from_translation_so3(
            self.rotation.rotate(&other.translation) + self.translation,
            self.rotation.compose(&other.rotation, None, None),
        )
    }

    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> SE3Tangent {
        let theta = self.rotation.log(None).axis_angle();
        let rho = so3_left_jacobian_inv(&theta) * self.translation;
        let result = SE3Tangent::new(rho, theta);

        if let Some(jac) = jacobian {
            *jac = result.right_jacobian_inv();
        }

        result
    }

    /// `Ad = [R  [t]×R; 0  R]`
    fn adjoint(&self) -> Self::JacobianMatrix {
        let r = self.rotation.rotation_matrix();
        let mut adjoint_matrix = Matrix6::zeros();
        adjoint_matrix.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        adjoint_matrix.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
        adjoint_matrix
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(skew(&self.translation) * r));
        adjoint_matrix
    }

    fn jacobian_identity(&self) -> Self::JacobianMatrix {
        Matrix6::identity()
    }

    fn normalize(&mut self) {
        self.rotation.normalize();
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        self.translation.iter().all(|x| x.is_finite()) && self.rotation.is_valid(tolerance)
    }
}

/// SE(3) tangent space element `[ρ, θ]`.
#[derive(Clone, Debug, PartialEq)]
pub struct SE3Tangent {
    data: Vector6<f64>,
}

impl SE3Tangent {
    pub fn new(rho: Vector3<f64>, theta: Vector3<f64>) -> Self {
        SE3Tangent {
            data: Vector6::new(rho.x, rho.y, rho.z, theta.x, theta.y, theta.z),
        }
    }

    pub fn rho(&self) -> Vector3<f64> {
        self.data.fixed_rows::<3>(0).into_owned()
    }

    pub fn theta(&self) -> Vector3<f64> {
        self.data.fixed_rows::<3>(3).into_owned()
    }

    pub fn coeffs(&self) -> Vector6<f64> {
        self.data
    }
}

/// Off-diagonal block of the SE(3) left Jacobian.
pub(crate) fn q_block(rho: &Vector3<f64>, theta: &Vector3<f64>) -> Matrix3<f64> {
    let theta_sq = theta.norm_squared();
    let (_, c1) = left_jacobian_coeffs(theta_sq);
    let (c2, c3) = if theta_sq < SMALL_ANGLE_SQ {
        let theta_4 = theta_sq * theta_sq;
        (
            1.0 / 24.0 - theta_sq / 720.0 + theta_4 / 40320.0,
            1.0 / 120.0 - theta_sq / 2520.0 + theta_4 / 120960.0,
        )
    } else {
        let angle = theta_sq.sqrt();
        let (sin, cos) = angle.sin_cos();
        (
            (theta_sq + 2.0 * cos - 2.0) / (2.0 * theta_sq * theta_sq),
            (2.0 * angle - 3.0 * sin + angle * cos) / (2.0 * theta_sq * theta_sq * angle),
        )
    };

    let p = skew(rho);
    let w = skew(theta);
    let wp = w * p;
    let pw = p * w;
    let wpw = wp * w;
    let ww = w * w;

    0.5 * p
        + c1 * (wp + pw + wpw)
        + c2 * (ww * p + pw * w - 3.0 * wpw)
        + c3 * (wpw * w + w * wpw)
}

fn left_jacobian_of(rho: &Vector3<f64>, theta: &Vector3<f64>) -> Matrix6<f64> {
    let jl = so3_left_jacobian(theta);
    let mut jac = Matrix6::zeros();
    jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&jl);
    jac.fixed_view_mut::<3, 3>(3, 3).copy_from(&jl);
    jac.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&q_block(rho, theta));
    jac
}

fn left_jacobian_inv_of(rho: &Vector3<f64>, theta: &Vector3<f64>) -> Matrix6<f64> {
    let jl_inv = so3_left_jacobian_inv(theta);
    let q = q_block(rho, theta);
    let mut jac = Matrix6::zeros();
    jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&jl_inv);
    jac.fixed_view_mut::<3, 3>(3, 3).copy_from(&jl_inv);
    jac.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(-jl_inv * q * jl_inv));
    jac
}

impl Tangent<SE3> for SE3Tangent {
    const DIM: usize = 6;

    fn exp(&self, jacobian: Option<&mut Matrix6<f64>>) -> SE3 {
        let theta = self.theta();
        let rotation = SO3Tangent::new(theta).exp(None);
        let translation = so3_left_jacobian(&theta) * self.rho();

        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }

        SE3::from_translation_so3(translation, rotation)
    }

    fn right_jacobian(&self) -> Matrix6<f64> {
        left_jacobian_of(&(-self.rho()), &(-self.theta()))
    }

    fn left_jacobian(&self) -> Matrix6<f64> {
        left_jacobian_of(&self.rho(), &self.theta())
    }

    fn right_jacobian_inv(&self) -> Matrix6<f64> {
        left_jacobian_inv_of(&(-self.rho()), &(-self.theta()))
    }

    fn left_jacobian_inv(&self) -> Matrix6<f64> {
        left_jacobian_inv_of(&self.rho(), &self.theta())
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.data.norm() < tolerance
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.data.as_slice())
    }

    fn from_dvector(data: &DVector<f64>) -> Self {
        SE3Tangent {
            data: Vector6::from_fn(|i, _| data[i]),
        }
    }
}
