//! Rn - n-dimensional Euclidean space
//!
//! Vector addition is the group operation, so every Jacobian is the identity and the
//! tangent space coincides with the space itself. Elements are backed by
//! `DVector<f64>` because the dimension is only known at runtime.

use crate::manifold::{LieGroup, Tangent};
use nalgebra::{DMatrix, DVector};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// Element of Rⁿ.
#[derive(Clone, Debug, PartialEq)]
pub struct Rn {
    data: DVector<f64>,
}

impl Display for Rn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Rn(dim: {}, data: [", self.data.len())?;
        for (i, val) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{val:.4}")?;
        }
        write!(f, "])")
    }
}

impl From<DVector<f64>> for Rn {
    fn from(data: DVector<f64>) -> Self {
        Rn::new(data)
    }
}

impl From<Rn> for DVector<f64> {
    fn from(rn: Rn) -> Self {
        rn.data
    }
}

/// Tangent vector of Rⁿ.
#[derive(Clone, Debug, PartialEq)]
pub struct RnTangent {
    data: DVector<f64>,
}

impl Rn {
    pub fn new(data: DVector<f64>) -> Self {
        Rn { data }
    }

    /// Origin of Rⁿ.
    pub fn zeros(dim: usize) -> Self {
        Rn::new(DVector::zeros(dim))
    }

    pub fn from_slice(slice: &[f64]) -> Self {
        Rn::new(DVector::from_row_slice(slice))
    }

    pub fn data(&self) -> &DVector<f64> {
        &self.data
    }

    pub fn dim(&self) -> usize {
        self.data.len()
    }
}

impl LieGroup for Rn {
    type TangentVector = RnTangent;
    type JacobianMatrix = DMatrix<f64>;

    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        if let Some(jac) = jacobian {
            *jac = -self.jacobian_identity();
        }
        Rn::new(-&self.data)
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        debug_assert_eq!(self.data.len(), other.data.len());
        if let Some(jac_self) = jacobian_self {
            *jac_self = self.jacobian_identity();
        }
        if let Some(jac_other) = jacobian_other {
            *jac_other = self.jacobian_identity();
        }
        Rn::new(&self.data + &other.data)
    }

    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector {
        if let Some(jac) = jacobian {
            *jac = self.jacobian_identity();
        }
        RnTangent::new(self.data.clone())
    }

    fn adjoint(&self) -> Self::JacobianMatrix {
        self.jacobian_identity()
    }

    fn jacobian_identity(&self) -> Self::JacobianMatrix {
        DMatrix::identity(self.data.len(), self.data.len())
    }

    fn normalize(&mut self) {}

    fn is_valid(&self, _tolerance: f64) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        self.data.len() == other.data.len() && (&self.data - &other.data).norm() < tolerance
    }

    fn tangent_dim(&self) -> usize {
        self.data.len()
    }
}

impl RnTangent {
    pub fn new(data: DVector<f64>) -> Self {
        RnTangent { data }
    }

    pub fn data(&self) -> &DVector<f64> {
        &self.data
    }

    fn identity(&self) -> DMatrix<f64> {
        DMatrix::identity(self.data.len(), self.data.len())
    }
}

impl Tangent<Rn> for RnTangent {
    const DIM: usize = 0;

    fn exp(&self, jacobian: Option<&mut DMatrix<f64>>) -> Rn {
        if let Some(jac) = jacobian {
            *jac = self.identity();
        }
        Rn::new(self.data.clone())
    }

    fn right_jacobian(&self) -> DMatrix<f64> {
        self.identity()
    }

    fn left_jacobian(&self) -> DMatrix<f64> {
        self.identity()
    }

    fn right_jacobian_inv(&self) -> DMatrix<f64> {
        self.identity()
    }

    fn left_jacobian_inv(&self) -> DMatrix<f64> {
        self.identity()
    }

    fn is_zero(&self, tolerance: f64) -> bool {
        self.data.norm() < tolerance
    }

    fn to_dvector(&self) -> DVector<f64> {
        self.data.clone()
    }

    fn from_dvector(data: &DVector<f64>) -> Self {
        RnTangent::new(data.clone())
    }
}
