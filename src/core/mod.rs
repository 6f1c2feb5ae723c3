//! Objective graph: variables, cost functions, weights and their bookkeeping.
//!
//! - [`variable`]: named, batched manifold values with a process-unique identity
//! - [`cost_function`]: the trait external residual models implement
//! - [`cost_weight`]: fixed and learned residual weights
//! - [`residual_block`]: a cost function registered in an objective
//! - [`ordering`]: column layout of the optimization variables
//! - [`objective`]: the graph itself
//! - [`loss_functions`], [`corrector`]: robust losses

pub mod corrector;
pub mod cost_function;
pub mod cost_weight;
pub mod loss_functions;
pub mod objective;
pub mod ordering;
pub mod residual_block;
pub mod variable;

use crate::manifold::ManifoldError;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::error;

/// Core module error types for objective construction and evaluation.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A different variable with the same name is already registered, or a variable is
    /// used both as optimization and auxiliary variable
    #[error("Duplicate variable name: {0}")]
    DuplicateName(String),

    /// Batch size, tangent dimension or manifold type inconsistent with what was declared
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// No variable with this name is registered
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// No residual block with this id is registered
    #[error("Unknown cost function: {0}")]
    UnknownCost(CostId),

    /// An explicit ordering that is not a permutation of the optimization variables
    #[error("Invalid variable ordering: {0}")]
    InvalidOrdering(String),

    /// Non-finite residual or Jacobian
    #[error("Numerical error: {0}")]
    NumericalError(String),

    /// Sparse Jacobian pattern could not be built or filled
    #[error("Symbolic structure error: {0}")]
    SymbolicStructure(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Manifold operation failed
    #[error(transparent)]
    Manifold(#[from] ManifoldError),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// objective
    ///     .variable(name)
    ///     .ok_or_else(|| CoreError::UnknownVariable(name.to_string()).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying error that caused it
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;

static NEXT_VARIABLE_ID: AtomicUsize = AtomicUsize::new(0);
static NEXT_COST_ID: AtomicUsize = AtomicUsize::new(0);
static NEXT_WEIGHT_ID: AtomicUsize = AtomicUsize::new(0);

macro_rules! unique_id {
    ($name:ident, $counter:ident, $prefix:expr) => {
        /// Process-unique identity, never reused.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            pub(crate) fn next() -> Self {
                $name($counter.fetch_add(1, Ordering::Relaxed))
            }

            pub fn value(&self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

unique_id!(VariableId, NEXT_VARIABLE_ID, "var#");
unique_id!(CostId, NEXT_COST_ID, "cost#");
unique_id!(WeightId, NEXT_WEIGHT_ID, "weight#");
