//! Optimizers for segmentation training
//!
//! An optimizer tracks exactly the trainable subset of a [`ParameterSet`].
//! Whenever trainable flags change the optimizer must be rebound, and the
//! trainer checks [`Optimizer::is_bound_to`] before every epoch.

pub mod adam;

pub use adam::{Adam, AdamConfig};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::error::Result;
use crate::model::ParameterSet;

/// A parameter tracked by an optimizer
#[derive(Debug, Clone)]
pub struct TrackedParam {
    /// Serialized parameter key (`<group>.<name>`)
    pub key: String,
    /// Variable updated in place
    pub var: Var,
}

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Track the currently trainable parameters of `params`
    ///
    /// State kept for parameters that stay tracked survives, state of
    /// parameters that are no longer trainable is dropped.
    fn rebind(&mut self, params: &ParameterSet);

    /// Parameters currently tracked
    fn tracked(&self) -> &[TrackedParam];

    /// Whether the tracked set equals the trainable set of `params`
    fn is_bound_to(&self, params: &ParameterSet) -> bool {
        let tracked: BTreeSet<&str> = self.tracked().iter().map(|p| p.key.as_str()).collect();
        let trainable = params.trainable_keys();
        tracked.len() == trainable.len() && trainable.iter().all(|k| tracked.contains(k.as_str()))
    }

    /// Apply one update from gradients keyed by parameter key
    ///
    /// Tracked parameters without a gradient are left unchanged.
    fn apply(&mut self, gradients: &HashMap<String, Tensor>) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of applied steps
    fn step_count(&self) -> usize;

    /// Snapshot of the optimizer state for checkpointing
    fn state(&self) -> OptimizerState;

    /// Restore state previously produced by [`Optimizer::state`]
    fn load_state(&mut self, state: OptimizerState) -> Result<()>;
}

/// Gradients of `tracked` parameters, multiplied by `factor`
pub fn collect_gradients(
    tracked: &[TrackedParam],
    grads: &GradStore,
    factor: f64,
) -> Result<HashMap<String, Tensor>> {
    let mut gradients = HashMap::with_capacity(tracked.len());
    for param in tracked {
        if let Some(grad) = grads.get(param.var.as_tensor()) {
            let grad = if factor == 1.0 {
                grad.clone()
            } else {
                (grad * factor)?
            };
            gradients.insert(param.key.clone(), grad);
        }
    }
    Ok(gradients)
}

/// Serializable optimizer state
#[derive(Debug, Clone)]
pub struct OptimizerState {
    /// Applied step count
    pub step: usize,
    /// Learning rate at snapshot time
    pub learning_rate: f64,
    /// First moment estimates by parameter key
    pub first_moments: BTreeMap<String, Tensor>,
    /// Second moment estimates by parameter key
    pub second_moments: BTreeMap<String, Tensor>,
    /// Updates applied to each parameter with moment state
    pub param_steps: BTreeMap<String, usize>,
}

impl OptimizerState {
    /// Number of parameters with moment state
    pub fn num_tracked(&self) -> usize {
        self.first_moments.len()
    }
}
