//! Error types for the apex-diffopt library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! # Error Hierarchy
//!
//! - **`DiffOptError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`CoreError`, `OptimizerError`, `BackwardError`, ...) are wrapped
//!   inside `DiffOptError`
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! DiffOptError::Core(
//!     CoreError::Manifold(ManifoldError::InvalidTangentDimension { expected: 3, actual: 2 })
//! )
//! ```
//!
//! Numerical failures of single batch elements during optimization are not errors: they
//! are reported per element in [`OptimizerInfo`](crate::optimizer::OptimizerInfo).

use crate::{
    backward::BackwardError, core::CoreError, linalg::LinAlgError, manifold::ManifoldError,
    optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the apex-diffopt library
pub type DiffOptResult<T> = Result<T, DiffOptError>;

/// Main error type for the apex-diffopt library
///
/// # Error Chain Access
///
/// ```rust,ignore
/// if let Err(e) = optimizer.optimize(&mut objective) {
///     warn!("Error: {}", e);
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum DiffOptError {
    /// Objective construction and evaluation errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimization setup errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Manifold operation errors
    #[error(transparent)]
    Manifold(#[from] ManifoldError),

    /// Backward differentiation errors
    #[error(transparent)]
    Backward(#[from] BackwardError),
}

impl DiffOptError {
    /// Full error chain, one cause per line.
    ///
    /// ```rust,ignore
    /// match layer.backward(&upstream) {
    ///     Ok(gradients) => { /* ... */ }
    ///     Err(e) => warn!("Error chain: {}", e.chain()),
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line error chain with arrow separators.
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}
