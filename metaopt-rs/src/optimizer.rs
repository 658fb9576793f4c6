//! SGD with Nesterov momentum and L2 weight decay.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, VarMap};

use crate::config::TrainingSettings;
use crate::error::{MetaOptError, Result};

/// Hyperparameters of [`NesterovSgd`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    /// Learning rate
    pub lr: f64,
    /// Momentum factor (0 disables the velocity buffer)
    pub momentum: f64,
    /// L2 penalty added to the gradient
    pub weight_decay: f64,
    /// Use Nesterov look-ahead
    pub nesterov: bool,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 5e-4,
            nesterov: true,
        }
    }
}

impl From<&TrainingSettings> for ParamsSgd {
    fn from(settings: &TrainingSettings) -> Self {
        Self {
            lr: settings.lr,
            momentum: settings.momentum,
            weight_decay: settings.weight_decay,
            nesterov: settings.nesterov,
        }
    }
}

struct VarState {
    var: Var,
    velocity: Option<Tensor>,
}

/// Stochastic gradient descent over a fixed set of variables.
///
/// Follows the usual formulation: `g = grad + wd * p`, `v = m * v + g`,
/// and the applied update is `g + m * v` with Nesterov or `v` without.
/// Variables that received no gradient in a step are left untouched.
pub struct NesterovSgd {
    vars: Vec<VarState>,
    params: ParamsSgd,
}

impl NesterovSgd {
    /// Build an optimizer over every float variable in the given var maps.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn from_varmaps(varmaps: &[&VarMap], params: ParamsSgd) -> Result<Self> {
        let vars: Vec<Var> = varmaps.iter().flat_map(|vm| vm.all_vars()).collect();
        Self::new(vars, params)
            .map_err(|e| MetaOptError::Training(format!("Failed to create SGD: {e}")))
    }

    /// Number of optimized scalar parameters.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.vars.iter().map(|s| s.var.elem_count()).sum()
    }
}

impl Optimizer for NesterovSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| VarState {
                var,
                velocity: None,
            })
            .collect();
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
            nesterov,
        } = self.params;

        for state in &mut self.vars {
            let Some(grad) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            let param = state.var.as_tensor().detach();

            let mut g = grad.detach();
            if weight_decay != 0.0 {
                g = (g + (&param * weight_decay)?)?;
            }

            let update = if momentum == 0.0 {
                g
            } else {
                let velocity = match &state.velocity {
                    Some(v) => ((v * momentum)? + &g)?,
                    None => g.clone(),
                };
                let update = if nesterov {
                    (&g + (&velocity * momentum)?)?
                } else {
                    velocity.clone()
                };
                state.velocity = Some(velocity);
                update
            };

            state.var.set(&(param - (update * lr)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}
