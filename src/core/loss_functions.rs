//! Robust loss functions for outlier rejection.
//!
//! With a robust loss ρ, a cost contributes `ρ(s)` with `s = ||W r||²` to the objective
//! instead of `s`. Each loss returns `[ρ(s), ρ'(s), ρ''(s)]`; the
//! [`Corrector`](crate::core::corrector::Corrector) turns these into a rescaled residual
//! and Jacobian so that the normal equations stay those of a least-squares problem.
//!
//! | Loss          | ρ(s)                         | Robustness |
//! |---------------|------------------------------|------------|
//! | [`L2Loss`]    | s                            | none       |
//! | [`HuberLoss`] | s, or 2δ√s - δ² beyond δ²    | moderate   |
//! | [`CauchyLoss`]| δ² ln(1 + s/δ²)             | strong     |
//! | [`WelschLoss`]| c² (1 - exp(-s/c²))          | redescending |

use crate::core::{CoreError, CoreResult};

/// Robust loss `ρ(s)` of a squared residual norm `s ≥ 0`.
///
/// Implementations satisfy `ρ(0) = 0` and `ρ'(0) = 1` so that small residuals behave like
/// ordinary least squares.
pub trait LossFunction: Send + Sync {
    /// Returns `[ρ(s), ρ'(s), ρ''(s)]`.
    fn evaluate(&self, s: f64) -> [f64; 3];
}

fn check_scale(scale: f64) -> CoreResult<()> {
    if scale <= 0.0 || !scale.is_finite() {
        return Err(
            CoreError::InvalidInput(format!("loss scale must be positive, got {scale}")).log(),
        );
    }
    Ok(())
}

/// Plain squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Loss;

impl L2Loss {
    pub fn new() -> Self {
        L2Loss
    }
}

impl LossFunction for L2Loss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        [s, 1.0, 0.0]
    }
}

/// Quadratic below `δ²`, linear in `||r||` above it.
#[derive(Debug, Clone)]
pub struct HuberLoss {
    scale: f64,
    scale2: f64,
}

impl HuberLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale(scale)?;
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }
}

impl LossFunction for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Cauchy (Lorentzian) loss: `ρ(s) = δ² ln(1 + s/δ²)`.
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    scale2: f64,
    c: f64,
}

impl CauchyLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale(scale)?;
        let scale2 = scale * scale;
        Ok(CauchyLoss {
            scale2,
            c: 1.0 / scale2,
        })
    }
}

impl LossFunction for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let inv = 1.0 / sum;
        [self.scale2 * sum.ln(), inv.max(f64::MIN), -self.c * (inv * inv)]
    }
}

/// Welsch loss: weights decay exponentially, so gross outliers are ignored.
#[derive(Debug, Clone)]
pub struct WelschLoss {
    scale2: f64,
    inv_scale2: f64,
}

impl WelschLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        check_scale(scale)?;
        let scale2 = scale * scale;
        Ok(WelschLoss {
            scale2,
            inv_scale2: 1.0 / scale2,
        })
    }
}

impl LossFunction for WelschLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let exp_term = (-s * self.inv_scale2).exp();
        [
            self.scale2 * (1.0 - exp_term),
            exp_term,
            -self.inv_scale2 * exp_term,
        ]
    }
}
