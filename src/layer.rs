//! Optimization as a differentiable function.
//!
//! An [`OptimizationLayer`] owns an objective and an optimizer. `forward` assigns new input
//! values, optimizes and returns the optimized values; `backward` maps the gradient of a
//! downstream loss with respect to those values to gradients with respect to the inputs.
//!
//! ```
//! use apex_diffopt::backward::{BackwardMode, Gradients};
//! use apex_diffopt::core::{cost_weight::CostWeight, objective::Objective, variable::Variable};
//! use apex_diffopt::factors::DifferenceFactor;
//! use apex_diffopt::layer::OptimizationLayer;
//! use apex_diffopt::manifold::ManifoldElement;
//! use apex_diffopt::optimizer::GaussNewton;
//! use nalgebra::DVector;
//! use std::collections::HashMap;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let x = Variable::vector("x", &[&[0.0]])?;
//! let target = Variable::vector("target", &[&[0.0]])?;
//! let mut objective = Objective::new();
//! objective.add(
//!     Box::new(DifferenceFactor::new(1)),
//!     &[&x],
//!     &[&target],
//!     CostWeight::identity(),
//! )?;
//!
//! let mut layer =
//!     OptimizationLayer::new(objective, Box::new(GaussNewton::new()), BackwardMode::Implicit);
//! let inputs = HashMap::from([("target".to_string(), vec![ManifoldElement::vector(&[2.0])])]);
//! let (solution, _info) = layer.forward(&inputs)?;
//! assert!((solution["x"][0].to_vector()[0] - 2.0).abs() < 1e-9);
//!
//! let upstream = Gradients::from([("x".to_string(), vec![DVector::from_element(1, 1.0)])]);
//! let gradients = layer.backward(&upstream)?;
//! assert!((gradients["target"][0][0] - 1.0).abs() < 1e-9);
//! # Ok(())
//! # }
//! ```

use crate::backward::{BackwardContext, BackwardError, BackwardMode, Gradients};
use crate::core::objective::Objective;
use crate::error::DiffOptResult;
use crate::manifold::ManifoldElement;
use crate::optimizer::{Optimizer, OptimizerInfo};
use std::collections::HashMap;
use tracing::debug;

pub struct OptimizationLayer {
    objective: Objective,
    optimizer: Box<dyn Optimizer>,
    backward_mode: BackwardMode,
    last_info: Option<OptimizerInfo>,
}

impl OptimizationLayer {
    /// Trajectory recording is switched on in the optimizer when `backward_mode` needs it.
    pub fn new(
        objective: Objective,
        optimizer: Box<dyn Optimizer>,
        backward_mode: BackwardMode,
    ) -> Self {
        let mut layer = Self {
            objective,
            optimizer,
            backward_mode,
            last_info: None,
        };
        layer.set_backward_mode(backward_mode);
        layer
    }

    pub fn set_backward_mode(&mut self, backward_mode: BackwardMode) {
        self.backward_mode = backward_mode;
        if backward_mode.needs_trajectory() {
            self.optimizer.config_mut().track_trajectory = true;
        }
    }

    pub fn backward_mode(&self) -> BackwardMode {
        self.backward_mode
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    /// Structural edits invalidate the last forward run.
    pub fn objective_mut(&mut self) -> &mut Objective {
        &mut self.objective
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn last_info(&self) -> Option<&OptimizerInfo> {
        self.last_info.as_ref()
    }

    /// Assign `inputs` (auxiliary values and initial values of optimization variables),
    /// optimize and return the optimized values of every optimization variable.
    ///
    /// Optimization variables not named in `inputs` start from their current value, which
    /// after a previous call is the previous solution.
    pub fn forward(
        &mut self,
        inputs: &HashMap<String, Vec<ManifoldElement>>,
    ) -> DiffOptResult<(HashMap<String, Vec<ManifoldElement>>, OptimizerInfo)> {
        self.last_info = None;
        self.objective.update(inputs)?;
        let info = self.optimizer.optimize(&mut self.objective)?;
        debug!(
            "layer forward finished with status {} ({} backward)",
            info.status(),
            self.backward_mode
        );
        self.last_info = Some(info.clone());
        Ok((self.objective.optim_value_map(), info))
    }

    /// Gradients of a downstream loss with respect to every input of the last
    /// [`forward`](Self::forward) call.
    pub fn backward(&mut self, upstream: &Gradients) -> DiffOptResult<Gradients> {
        let Some(info) = self.last_info.as_ref() else {
            return Err(BackwardError::MissingTrajectory(
                "backward called before forward".to_string(),
            )
            .log()
            .into());
        };
        let damping_scaling = self.optimizer.config().damping_scaling;
        let strategy = self.backward_mode.strategy();
        let mut ctx = BackwardContext::new(
            &mut self.objective,
            info,
            self.optimizer.backend(),
            damping_scaling,
        );
        strategy.backward(&mut ctx, upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiffOptError;
    use crate::optimizer::{LevenbergMarquardt, LevenbergMarquardtConfig, OptimizationStatus};
    use crate::testing::se2_loop;
    use nalgebra::DVector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn layer(mode: BackwardMode) -> Result<OptimizationLayer, Box<dyn std::error::Error>> {
        let optimizer = LevenbergMarquardt::with_config(
            LevenbergMarquardtConfig::new().with_max_iterations(60),
        );
        Ok(OptimizationLayer::new(se2_loop(3, 21, 0.2)?, Box::new(optimizer), mode))
    }

    #[test]
    fn test_trajectory_follows_mode() -> TestResult {
        let unroll = layer(BackwardMode::Unroll)?;
        assert!(unroll.optimizer().config().track_trajectory);
        let implicit = layer(BackwardMode::Implicit)?;
        assert!(!implicit.optimizer().config().track_trajectory);
        Ok(())
    }

    #[test]
    fn test_backward_before_forward() -> TestResult {
        let mut layer = layer(BackwardMode::Implicit)?;
        let result = layer.backward(&Gradients::new());
        assert!(matches!(
            result,
            Err(DiffOptError::Backward(BackwardError::MissingTrajectory(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_forward_then_backward() -> TestResult {
        let mut layer = layer(BackwardMode::Unroll)?;
        let (solution, info) = layer.forward(&HashMap::new())?;
        assert_eq!(info.status(), OptimizationStatus::Converged);
        assert_eq!(solution.len(), 4);
        assert!(solution.values().all(|values| values.len() == 3));

        let upstream = Gradients::from([(
            "x2".to_string(),
            vec![DVector::from_vec(vec![1.0, 0.0, 0.5]); 3],
        )]);
        let unrolled = layer.backward(&upstream)?;
        layer.set_backward_mode(BackwardMode::Implicit);
        let implicit = layer.backward(&upstream)?;
        for (u, i) in unrolled["odom"].iter().zip(&implicit["odom"]) {
            assert!((u - i).norm() < 1e-3 * i.norm().max(1e-9));
        }

        let unknown = Gradients::from([("nope".to_string(), vec![DVector::zeros(3); 3])]);
        assert!(matches!(
            layer.backward(&unknown),
            Err(DiffOptError::Backward(BackwardError::UnknownOutput(_)))
        ));
        Ok(())
    }
}
