//! Dynamic loss scaling
//!
//! The loss is multiplied by a scale factor before the backward pass so that
//! small gradients survive reduced precision. Before the optimizer runs, the
//! gradients are unscaled and checked: a non-finite gradient skips the step
//! and backs the scale off, while a run of clean steps grows it again.

use candle_core::backprop::GradStore;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::optimizers::{collect_gradients, Optimizer};
use crate::error::{Error, Result};

/// Loss scaling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// Enable loss scaling
    pub enabled: bool,
    /// Initial scale factor
    pub init_scale: f64,
    /// Factor applied after `growth_interval` clean steps
    pub growth_factor: f64,
    /// Factor applied after a step with non-finite gradients
    pub backoff_factor: f64,
    /// Clean steps required before growing the scale
    pub growth_interval: usize,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

impl ScalerConfig {
    /// Validate scaling factors
    pub fn validate(&self) -> Result<()> {
        if !self.init_scale.is_finite() || self.init_scale <= 0.0 {
            return Err(Error::config("Initial loss scale must be positive"));
        }
        if self.growth_factor <= 1.0 {
            return Err(Error::config("Scale growth factor must be greater than 1"));
        }
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            return Err(Error::config("Scale backoff factor must be in (0, 1)"));
        }
        if self.growth_interval == 0 {
            return Err(Error::config("Scale growth interval must be greater than 0"));
        }
        Ok(())
    }
}

/// Result of a scaler-mediated optimizer step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Gradients were finite and the optimizer updated the parameters
    Applied,
    /// Non-finite gradients were found and the update was skipped
    Skipped,
}

/// Loss scaler deciding per step whether the optimizer update is applied
#[derive(Debug, Clone)]
pub struct GradScaler {
    config: ScalerConfig,
    scale: f64,
    growth_tracker: usize,
    found_inf: Option<bool>,
    skipped_steps: usize,
}

impl GradScaler {
    /// Create a new scaler
    pub fn new(config: ScalerConfig) -> Self {
        let scale = if config.enabled { config.init_scale } else { 1.0 };
        Self {
            config,
            scale,
            growth_tracker: 0,
            found_inf: None,
            skipped_steps: 0,
        }
    }

    /// Current scale factor
    pub fn scale_factor(&self) -> f64 {
        self.scale
    }

    /// Number of optimizer steps skipped so far
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    /// Multiply the loss by the current scale factor
    pub fn scale(&self, loss: &Tensor) -> Result<Tensor> {
        if self.config.enabled {
            Ok((loss * self.scale)?)
        } else {
            Ok(loss.clone())
        }
    }

    /// Unscale the gradients of the parameters `optimizer` tracks and step
    ///
    /// The step is skipped when any unscaled gradient holds a NaN or an
    /// infinity. [`GradScaler::update`] must be called before the next step.
    pub fn step<O: Optimizer + ?Sized>(
        &mut self,
        optimizer: &mut O,
        grads: &GradStore,
    ) -> Result<StepOutcome> {
        let gradients = collect_gradients(optimizer.tracked(), grads, 1.0 / self.scale)?;

        let mut found_inf = false;
        if self.config.enabled {
            for grad in gradients.values() {
                if !is_finite(grad)? {
                    found_inf = true;
                    break;
                }
            }
        }
        self.found_inf = Some(found_inf);

        if found_inf {
            self.skipped_steps += 1;
            debug!("Skipping optimizer step: non-finite gradients at scale {}", self.scale);
            return Ok(StepOutcome::Skipped);
        }

        optimizer.apply(&gradients)?;
        Ok(StepOutcome::Applied)
    }

    /// Adjust the scale factor from the outcome of the last step
    pub fn update(&mut self) {
        let Some(found_inf) = self.found_inf.take() else {
            return;
        };
        if !self.config.enabled {
            return;
        }

        if found_inf {
            self.scale *= self.config.backoff_factor;
            self.growth_tracker = 0;
            debug!("Loss scale decreased to {:.1}", self.scale);
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.config.growth_interval {
                self.scale *= self.config.growth_factor;
                self.growth_tracker = 0;
                debug!("Loss scale increased to {:.1}", self.scale);
            }
        }
    }
}

/// Whether every element of `t` is finite
fn is_finite(t: &Tensor) -> Result<bool> {
    // x - x is zero for every finite x, so only NaN or inf reach the sum
    let total = (t - t)?
        .sum_all()?
        .to_dtype(candle_core::DType::F64)?
        .to_scalar::<f64>()?;
    Ok(total.is_finite())
}
