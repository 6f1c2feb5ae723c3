//! SO(2) - Special Orthogonal Group in 2D
//!
//! Rotations of the plane, stored as a unit complex number. The tangent space is a
//! single angle in radians. SO(2) is abelian, so every Jacobian and the adjoint are 1.

use crate::manifold::{LieGroup, Tangent};
use nalgebra::{DVector, Matrix1, Matrix2, UnitComplex, Vector2};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// SO(2) group element representing rotations in 2D.
#[derive(Clone, Debug, PartialEq)]
pub struct SO2 {
    complex: UnitComplex<f64>,
}

impl Display for SO2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SO2(angle: {:.4})", self.complex.angle())
    }
}

impl SO2 {
    pub fn identity() -> Self {
        SO2 {
            complex: UnitComplex::identity(),
        }
    }

    pub fn new(complex: UnitComplex<f64>) -> Self {
        SO2 { complex }
    }

    pub fn from_angle(angle: f64) -> Self {
        SO2::new(UnitComplex::new(angle))
    }

    pub fn complex(&self) -> UnitComplex<f64> {
        self.complex
    }

    /// Rotation angle in (-π, π].
    pub fn angle(&self) -> f64 {
        self.complex.angle()
    }

    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        self.complex.to_rotation_matrix().into_inner()
    }

    /// Rotate a planar vector.
    pub fn rotate(&self, v: &Vector2<f64>) -> Vector2<f64> {
        self.complex * v
    }
}

impl LieGroup for SO2 {
    type TangentVector = SO2Tangent;
    type JacobianMatrix = Matrix1<f64>;

    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        if let Some(jac) = jacobian {
            *jac = -Matrix1::identity();
        }
        SO2::new(self.complex.inverse())
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        if let Some(jac) = jacobian_self {
            *jac = Matrix1::identity();
        }
        if let Some(jac) = jacobian_other {
            *jac = Matrix1::identity();
        }
        SO2::new(self.complex * other.complex)
    }

    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> SO2Tangent {
        if let Some(jac) = jacobian {
            *jac = Matrix1::identity();
        }
        SO2Tangent::new(self.complex.angle())
    }

    fn adjoint(&self) -> Self::JacobianMatrix {
        Matrix1::identity()
    }

    fn jacobian_identity(&self) -> Self::JacobianMatrix {
        Matrix1::identity()
    }

    fn normalize(&mut self) {
        self.complex.renormalize();
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        let c = self.complex.complex();
        c.re.is_finite() && c.im.is_finite() && (c.norm_sqr() - 1.0).abs() < tolerance
    }
}

/// SO(2) tangent space element: a rotation angle.
#[derive(Clone, Debug, PartialEq)]
pub struct SO2Tangent {
    data: f64,
}

impl SO2Tangent {
    pub fn new(angle: f64) -> Self {
        SO2Tangent { data: angle }
    }

    pub fn angle(&self) -> f64 {
        self.data
    }
}

impl Tangent<SO2> for SO2Tangent {
    const DIM: usize = 1;

    fn exp(&self, jacobian: Option<&mut Matrix1<f64>>) -> SO2 {
        if let Some(jac) = jacobian {
            *jac = Matrix1::identity();
        }
        SO2::from_angle(self.data)
    }

    fn right_jacobian(&self) -> Matrix1<f64> {
        Matrix1::identity()
    }

    fn left_jacobian(&self) -> Matrix1<f64> {
        Matrix1::identity()
    }

    fn right_jacobian_inv(&self) -> Matrix1<f64> {
        Matrix1::identity()
    }

    fn left_jacobian_inv(&self) -> Matrix1<f64> {
        Matrix1::identity()
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.data.abs() < tolerance
    }

    fn to_dvector(&self) -> DVector<f64> {
        DVector::from_element(1, self.data)
    }

    fn from_dvector(data: &DVector<f64>) -> Self {
        SO2Tangent::new(data[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::TangentConvention;
    use std::f64::consts::PI;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_so2_inverse_law() {
        let r = SO2::from_angle(0.7);
        assert!(
            r.compose(&r.inverse(None), None, None)
                .is_approx(&SO2::identity(), TOLERANCE)
        );
    }

    #[test]
    fn test_so2_log_wraps_angle() {
        let r = SO2::from_angle(PI / 2.0).compose(&SO2::from_angle(PI), None, None);
        assert!((r.log(None).angle() + PI / 2.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_so2_between() {
        let a = SO2::from_angle(0.3);
        let b = SO2::from_angle(-0.9);
        let d = a.between(&b, None, None);
        assert!((d.angle() + 1.2).abs() < TOLERANCE);
    }

    #[test]
    fn test_so2_local_retract_both_conventions() {
        let a = SO2::from_angle(2.9);
        let b = SO2::from_angle(-3.0);
        for convention in [TangentConvention::Right, TangentConvention::Left] {
            let d = a.local(&b, convention);
            assert!(d.angle().abs() < PI);
            assert!(a.retract(&d, convention).is_approx(&b, TOLERANCE));
        }
    }

    #[test]
    fn test_so2_rotate() {
        let r = SO2::from_angle(PI / 2.0);
        let v = r.rotate(&Vector2::new(1.0, 0.0));
        assert!((v - Vector2::new(0.0, 1.0)).norm() < TOLERANCE);
    }

    #[test]
    fn test_so2_is_valid() {
        assert!(SO2::from_angle(1.0).is_valid(1e-9));
    }
}
