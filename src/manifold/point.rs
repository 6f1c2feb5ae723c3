//! Point2 / Point3 - translation groups in the plane and in space
//!
//! Points compose by addition like [`Rn`](crate::manifold::rn::Rn), but their
//! dimension is fixed at compile time so their Jacobians are stack matrices.

use crate::manifold::{LieGroup, Tangent};
use nalgebra::{DVector, Matrix2, Matrix3, Vector2, Vector3};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

macro_rules! translation_group {
    ($point:ident, $tangent:ident, $vector:ident, $matrix:ident, $dim:expr, $label:expr) => {
        #[derive(Clone, Debug, PartialEq)]
        pub struct $point {
            coords: $vector<f64>,
        }

        #[derive(Clone, Debug, PartialEq)]
        pub struct $tangent {
            data: $vector<f64>,
        }

        impl $point {
            pub fn from_coords(coords: $vector<f64>) -> Self {
                $point { coords }
            }

            pub fn origin() -> Self {
                $point::from_coords($vector::zeros())
            }

            pub fn coords(&self) -> &$vector<f64> {
                &self.coords
            }
        }

        impl Display for $point {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", $label)?;
                for (i, val) in self.coords.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{val:.4}")?;
                }
                write!(f, ")")
            }
        }

        impl $tangent {
            pub fn new(data: $vector<f64>) -> Self {
                $tangent { data }
            }

            pub fn data(&self) -> &$vector<f64> {
                &self.data
            }
        }

        impl LieGroup for $point {
            type TangentVector = $tangent;
            type JacobianMatrix = $matrix<f64>;

            fn inverse(&self, jacobian: Option<&mut $matrix<f64>>) -> Self {
                if let Some(jac) = jacobian {
                    *jac = -$matrix::identity();
                }
                $point::from_coords(-self.coords)
            }

            fn compose(
                &self,
                other: &Self,
                jacobian_self: Option<&mut $matrix<f64>>,
                jacobian_other: Option<&mut $matrix<f64>>,
            ) -> Self {
                if let Some(jac) = jacobian_self {
                    *jac = $matrix::identity();
                }
                if let Some(jac) = jacobian_other {
                    *jac = $matrix::identity();
                }
                $point::from_coords(self.coords + other.coords)
            }

            fn log(&self, jacobian: Option<&mut $matrix<f64>>) -> $tangent {
                if let Some(jac) = jacobian {
                    *jac = $matrix::identity();
                }
                $tangent::new(self.coords)
            }

            fn adjoint(&self) -> $matrix<f64> {
                $matrix::identity()
            }

            fn jacobian_identity(&self) -> $matrix<f64> {
                $matrix::identity()
            }

            fn normalize(&mut self) {}

            fn is_valid(&self, _tolerance: f64) -> bool {
                self.coords.iter().all(|x| x.is_finite())
            }
        }

        impl Tangent<$point> for $tangent {
            const DIM: usize = $dim;

            fn exp(&self, jacobian: Option<&mut $matrix<f64>>) -> $point {
                if let Some(jac) = jacobian {
                    *jac = $matrix::identity();
                }
                $point::from_coords(self.data)
            }

            fn right_jacobian(&self) -> $matrix<f64> {
                $matrix::identity()
            }

            fn left_jacobian(&self) -> $matrix<f64> {
                $matrix::identity()
            }

            fn right_jacobian_inv(&self) -> $matrix<f64> {
                $matrix::identity()
            }

            fn left_jacobian_inv(&self) -> $matrix<f64> {
                $matrix::identity()
            }

            fn is_zero(&self, tolerance: f64) -> bool {
                self.data.norm() < tolerance
            }

            fn to_dvector(&self) -> DVector<f64> {
                DVector::from_column_slice(self.data.as_slice())
            }

            fn from_dvector(data: &DVector<f64>) -> Self {
                $tangent::new($vector::from_fn(|i, _| data[i]))
            }
        }
    };
}

translation_group!(Point2, Point2Tangent, Vector2, Matrix2, 2, "Point2");
translation_group!(Point3, Point3Tangent, Vector3, Matrix3, 3, "Point3");

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Point2::from_coords(Vector2::new(x, y))
    }

    pub fn x(&self) -> f64 {
        self.coords.x
    }

    pub fn y(&self) -> f64 {
        self.coords.y
    }
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Point3::from_coords(Vector3::new(x, y, z))
    }

    pub fn x(&self) -> f64 {
        self.coords.x
    }

    pub fn y(&self) -> f64 {
        self.coords.y
    }

    pub fn z(&self) -> f64 {
        self.coords.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::TangentConvention;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_point2_between() {
        let a = Point2::new(1.0, 2.0);
        let b = Point2::new(4.0, -1.0);
        let d = a.between(&b, None, None);
        assert!(d.is_approx(&Point2::new(3.0, -3.0), TOLERANCE));
    }

    #[test]
    fn test_point3_retract_local() {
        let a = Point3::new(1.0, 2.0, 3.0);
        let b = Point3::new(-0.5, 0.25, 9.0);
        let d = a.local(&b, TangentConvention::Right);
        assert!((d.data() - Vector3::new(-1.5, -1.75, 6.0)).norm() < TOLERANCE);
        assert!(a.retract(&d, TangentConvention::Left).is_approx(&b, TOLERANCE));
    }

    #[test]
    fn test_point_tangent_dvector_conversion() {
        let t = Point3Tangent::new(Vector3::new(0.1, 0.2, 0.3));
        let v = t.to_dvector();
        assert_eq!(v.len(), 3);
        assert_eq!(Point3Tangent::from_dvector(&v), t);
    }

    #[test]
    fn test_point_display() {
        assert_eq!(Point2::new(1.0, -2.0).to_string(), "Point2(1.0000, -2.0000)");
    }
}
