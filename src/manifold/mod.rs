//! Manifold representations for optimization on non-Euclidean spaces.
//!
//! Every optimization variable lives on one of a closed set of Lie groups:
//! - **Vector** (Rⁿ): Euclidean vectors of arbitrary dimension
//! - **Point2 / Point3**: 2D and 3D points (translation groups)
//! - **SO(2) / SO(3)**: rotations in 2D and 3D
//! - **SE(2) / SE(3)**: rigid body transformations in 2D and 3D
//!
//! Lie group M,° | size   | dim | X ∈ M                   | Constraint      | T_X M        | Exp(T)             | Comp. | Action
//! ------------- | ------ | --- | ----------------------- | --------------- | ------------ | ------------------ | ----- | ------
//! n-D vector    | Rⁿ,+   | n   | v ∈ Rⁿ                  | -               | v ∈ Rⁿ       | v = exp(v)         | v₁+v₂ | v + x
//! Rotation      | SO(2),.| 1   | z ∈ C                   | z*z = 1         | θ ∈ R        | z = exp(iθ)        | z₁z₂  | zx
//! Rigid motion  | SE(2),.| 3   | M = [R t; 0 1]          | RᵀR = I         | [ρ, θ] ∈ R³  | Exp([ρ, θ])        | M₁M₂  | Rx+t
//! Rotation      | SO(3),.| 3   | q ∈ H                   | q*q = 1         | θ ∈ R³       | q = exp(uθ/2)      | q₁q₂  | qxq*
//! Rigid motion  | SE(3),.| 6   | M = [R t; 0 1]          | RᵀR = I         | [ρ, θ] ∈ R⁶  | Exp([ρ, θ])        | M₁M₂  | Rx+t
//!
//! The design follows the [manif](https://github.com/artivis/manif) conventions:
//! Jacobians are taken with respect to right (local) perturbations, and every
//! group operation optionally writes its Jacobians into caller-provided matrices.
//!
//! Which side a tangent step is applied on is a property of the call, never of the
//! process: [`TangentConvention`] is passed to [`LieGroup::retract`] and
//! [`LieGroup::local`] (and carried by the optimizer configuration).

use nalgebra::{DMatrix, DVector, Dim, Matrix, RawStorage};
use std::ops::{Mul, Neg};
use std::{
    error, fmt,
    fmt::{Display, Formatter},
};

pub mod batch;
pub mod element;
pub mod point;
pub mod rn;
pub mod se2;
pub mod se3;
pub mod so2;
pub mod so3;

pub use element::ManifoldElement;

/// Squared-angle threshold below which closed-form expressions switch to their
/// Taylor expansions.
pub(crate) const SMALL_ANGLE_SQ: f64 = 1e-4;

/// Errors that can occur during manifold operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifoldError {
    /// Invalid tangent vector dimension
    InvalidTangentDimension { expected: usize, actual: usize },
    /// Two elements of different groups were combined
    TypeMismatch {
        expected: ManifoldType,
        actual: ManifoldType,
    },
    /// Invalid manifold element
    InvalidElement(String),
    /// Dimension validation failed during conversion
    DimensionMismatch { expected: usize, actual: usize },
    /// NaN or Inf detected in manifold element
    InvalidNumber,
    /// Batched operands whose lengths are neither equal nor broadcastable
    BatchMismatch { left: usize, right: usize },
}

/// The closed set of manifold kinds a variable can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifoldType {
    Vector,
    Point2,
    Point3,
    SO2,
    SO3,
    SE2,
    SE3,
}

impl Display for ManifoldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManifoldType::Vector => "Vector",
            ManifoldType::Point2 => "Point2",
            ManifoldType::Point3 => "Point3",
            ManifoldType::SO2 => "SO2",
            ManifoldType::SO3 => "SO3",
            ManifoldType::SE2 => "SE2",
            ManifoldType::SE3 => "SE3",
        };
        write!(f, "{name}")
    }
}

/// Side on which tangent perturbations are applied.
///
/// - `Right`: `retract(a, d) = a ∘ exp(d)`, `local(a, b) = log(a⁻¹ ∘ b)`
/// - `Left`: `retract(a, d) = exp(d) ∘ a`, `local(a, b) = log(b ∘ a⁻¹)`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TangentConvention {
    #[default]
    Right,
    Left,
}

impl Display for ManifoldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ManifoldError::InvalidTangentDimension { expected, actual } => {
                write!(
                    f,
                    "Invalid tangent dimension: expected {expected}, got {actual}"
                )
            }
            ManifoldError::TypeMismatch { expected, actual } => {
                write!(f, "Manifold type mismatch: expected {expected}, got {actual}")
            }
            ManifoldError::InvalidElement(msg) => {
                write!(f, "Invalid manifold element: {msg}")
            }
            ManifoldError::DimensionMismatch { expected, actual } => {
                write!(f, "Dimension mismatch: expected {expected}, got {actual}")
            }
            ManifoldError::InvalidNumber => {
                write!(f, "Invalid number: NaN or Inf detected")
            }
            ManifoldError::BatchMismatch { left, right } => {
                write!(f, "Batch sizes {left} and {right} cannot be broadcast")
            }
        }
    }
}

impl error::Error for ManifoldError {}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Conversion of fixed-size Jacobians into dynamically sized matrices.
///
/// The linearization stage stitches per-variable blocks into one matrix, so every
/// `JacobianMatrix` must be able to hand over its entries as a `DMatrix`.
pub trait DynMatrix {
    fn to_dmatrix(&self) -> DMatrix<f64>;
}

impl<R: Dim, C: Dim, S: RawStorage<f64, R, C>> DynMatrix for Matrix<f64, R, C, S> {
    fn to_dmatrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.nrows(), self.ncols(), |i, j| self[(i, j)])
    }
}

/// Core trait for Lie group operations.
///
/// Associated types define the mathematical structure:
/// - `TangentVector`: the tangent space vector type (e.g. `SE3Tangent`)
/// - `JacobianMatrix`: square matrix acting on the tangent space (e.g. `Matrix6<f64>`)
pub trait LieGroup: Clone + PartialEq + fmt::Debug + Send + Sync {
    /// The tangent space vector type
    type TangentVector: Tangent<Self>;

    /// The Jacobian matrix type
    type JacobianMatrix: Clone
        + PartialEq
        + fmt::Debug
        + Neg<Output = Self::JacobianMatrix>
        + Mul<Output = Self::JacobianMatrix>
        + DynMatrix;

    /// Compute the inverse of this manifold element.
    ///
    /// # Arguments
    /// * `jacobian` - Optional mutable reference to store the Jacobian ∂(g⁻¹)/∂g = -Ad(g)
    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self;

    /// Compose this element with another (group multiplication).
    ///
    /// # Arguments
    /// * `other` - The right operand for composition
    /// * `jacobian_self` - Optional Jacobian ∂(g₁ ∘ g₂)/∂g₁ = Ad(g₂⁻¹)
    /// * `jacobian_other` - Optional Jacobian ∂(g₁ ∘ g₂)/∂g₂ = I
    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self;

    /// Logarithmic map from manifold to tangent space.
    ///
    /// # Arguments
    /// * `jacobian` - Optional Jacobian ∂log(g)^∨/∂g = Jr⁻¹(log(g))
    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector;

    /// Adjoint matrix Ad(g), mapping right perturbations to left ones:
    /// `g ∘ exp(φ) = exp(Ad(g) φ) ∘ g`.
    fn adjoint(&self) -> Self::JacobianMatrix;

    /// Identity matrix on this element's tangent space.
    fn jacobian_identity(&self) -> Self::JacobianMatrix;

    /// Project the element back onto the manifold (re-normalize rotations).
    fn normalize(&mut self);

    /// Check if the element is approximately on the manifold.
    fn is_valid(&self, tolerance: f64) -> bool;

    /// Check if the element is approximately equal to another element.
    fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        self.right_minus(other, None, None).is_zero(tolerance)
    }

    /// Right plus operation: g ⊞ φ = g ∘ exp(φ^∧).
    ///
    /// # Notes
    /// J_g = Ad(exp(φ))⁻¹, J_φ = Jr(φ)
    fn right_plus(
        &self,
        tangent: &Self::TangentVector,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_tangent: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        let exp_tangent = tangent.exp(None);

        if let Some(jac_tangent) = jacobian_tangent {
            *jac_tangent = tangent.right_jacobian();
        }

        self.compose(&exp_tangent, jacobian_self, None)
    }

    /// Right minus operation: g₁ ⊟ g₂ = log(g₂⁻¹ ∘ g₁)^∨.
    ///
    /// # Notes
    /// J_g₁ = Jr⁻¹(τ), J_g₂ = -Jl⁻¹(τ)
    fn right_minus(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self::TangentVector {
        let result = other.inverse(None).compose(self, None, None).log(None);

        if let Some(jac_self) = jacobian_self {
            *jac_self = result.right_jacobian_inv();
        }

        if let Some(jac_other) = jacobian_other {
            *jac_other = -result.left_jacobian_inv();
        }

        result
    }

    /// Left plus operation: φ ⊞ g = exp(φ^∧) ∘ g.
    ///
    /// # Notes
    /// J_φ = Ad(g⁻¹) Jr(φ), J_g = I
    fn left_plus(
        &self,
        tangent: &Self::TangentVector,
        jacobian_tangent: Option<&mut Self::JacobianMatrix>,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        let result = tangent.exp(None).compose(self, None, None);

        if let Some(jac_self) = jacobian_self {
            *jac_self = self.jacobian_identity();
        }

        if let Some(jac_tangent) = jacobian_tangent {
            *jac_tangent = self.inverse(None).adjoint() * tangent.right_jacobian();
        }

        result
    }

    /// Left minus operation: g₁ ⊟ g₂ = log(g₁ ∘ g₂⁻¹)^∨.
    ///
    /// # Notes
    /// J_g₁ = Jr⁻¹(τ) Ad(g₂), J_g₂ = -Jr⁻¹(τ) Ad(g₂)
    fn left_minus(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self::TangentVector {
        let result = self.compose(&other.inverse(None), None, None).log(None);

        if jacobian_self.is_some() || jacobian_other.is_some() {
            let jac = result.right_jacobian_inv() * other.adjoint();
            if let Some(jac_other) = jacobian_other {
                *jac_other = -jac.clone();
            }
            if let Some(jac_self) = jacobian_self {
                *jac_self = jac;
            }
        }

        result
    }

    /// Compute g₁⁻¹ ∘ g₂ (relative transformation).
    ///
    /// # Notes
    /// J_g₁ = -Ad(g₂⁻¹ ∘ g₁), J_g₂ = I
    fn between(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        let result = self.inverse(None).compose(other, None, None);

        if let Some(jac_self) = jacobian_self {
            *jac_self = -result.inverse(None).adjoint();
        }

        if let Some(jac_other) = jacobian_other {
            *jac_other = other.jacobian_identity();
        }

        result
    }

    /// Apply a tangent step on the side selected by `convention`.
    fn retract(&self, tangent: &Self::TangentVector, convention: TangentConvention) -> Self {
        match convention {
            TangentConvention::Right => self.right_plus(tangent, None, None),
            TangentConvention::Left => self.left_plus(tangent, None, None),
        }
    }

    /// Tangent step that takes `self` to `other`; inverse of [`LieGroup::retract`].
    fn local(&self, other: &Self, convention: TangentConvention) -> Self::TangentVector {
        match convention {
            TangentConvention::Right => other.right_minus(self, None, None),
            TangentConvention::Left => other.left_minus(self, None, None),
        }
    }

    /// Dimension of the tangent space for this element.
    ///
    /// Fixed-size groups return `Self::TangentVector::DIM`; Rⁿ overrides this with its
    /// runtime dimension.
    fn tangent_dim(&self) -> usize {
        Self::TangentVector::DIM
    }
}

/// Trait for tangent-space (Lie algebra) vectors of a Lie group.
pub trait Tangent<Group: LieGroup>: Clone + PartialEq + fmt::Debug {
    /// Dimension of the tangent space (0 for dynamically sized spaces)
    const DIM: usize;

    /// Exponential map to Lie group: exp(φ^∧).
    ///
    /// # Arguments
    /// * `jacobian` - Optional Jacobian ∂exp(φ^∧)/∂φ = Jr(φ)
    fn exp(&self, jacobian: Option<&mut Group::JacobianMatrix>) -> Group;

    /// Right Jacobian Jr: exp(φ + δφ) ≈ exp(φ) ∘ exp(Jr δφ)
    fn right_jacobian(&self) -> Group::JacobianMatrix;

    /// Left Jacobian Jl: exp(φ + δφ) ≈ exp(Jl δφ) ∘ exp(φ)
    fn left_jacobian(&self) -> Group::JacobianMatrix;

    /// Inverse of right Jacobian Jr⁻¹.
    fn right_jacobian_inv(&self) -> Group::JacobianMatrix;

    /// Inverse of left Jacobian Jl⁻¹.
    fn left_jacobian_inv(&self) -> Group::JacobianMatrix;

    /// Check if the tangent vector is approximately zero.
    fn is_zero(&self, tolerance: f64) -> bool;

    /// Coordinates of the tangent vector.
    fn to_dvector(&self) -> DVector<f64>;

    /// Build a tangent vector from coordinates.
    ///
    /// Callers check the dimension first; see [`ManifoldElement`].
    fn from_dvector(data: &DVector<f64>) -> Self;
}

/// Skew-symmetric matrix of a 3-vector.
pub(crate) fn skew(v: &nalgebra::Vector3<f64>) -> nalgebra::Matrix3<f64> {
    nalgebra::Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}
