//! Adam optimizer implementation
//!
//! Classic Adam with bias correction and optional L2 weight decay folded into
//! the gradient. Moment estimates and step counts are keyed by parameter key,
//! so they can be carried across a rebind and written into checkpoints. A
//! parameter that becomes trainable late starts its own bias correction at
//! step one.

use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Optimizer, OptimizerState, TrackedParam};
use crate::error::{Error, Result};
use crate::model::ParameterSet;

/// Adam hyperparameters (the learning rate lives in `RunConfig`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    /// Beta1 parameter (momentum)
    pub beta1: f64,
    /// Beta2 parameter (RMSprop)
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub epsilon: f64,
    /// L2 weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl AdamConfig {
    /// Validate hyperparameters
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(Error::config("Adam betas must be in [0.0, 1.0)"));
        }
        if self.epsilon <= 0.0 {
            return Err(Error::config("Adam epsilon must be positive"));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }
        Ok(())
    }
}

/// Adam optimizer
pub struct Adam {
    config: AdamConfig,
    learning_rate: f64,
    step_count: usize,
    tracked: Vec<TrackedParam>,
    /// First moment estimates (momentum)
    momentum: HashMap<String, Tensor>,
    /// Second moment estimates (RMSprop)
    variance: HashMap<String, Tensor>,
    /// Updates applied to each parameter, used for bias correction
    steps: HashMap<String, usize>,
}

impl Adam {
    /// Create an optimizer bound to the trainable parameters of `params`
    pub fn new(params: &ParameterSet, learning_rate: f64, config: AdamConfig) -> Result<Self> {
        config.validate()?;
        let mut optimizer = Self {
            config,
            learning_rate,
            step_count: 0,
            tracked: Vec::new(),
            momentum: HashMap::new(),
            variance: HashMap::new(),
            steps: HashMap::new(),
        };
        optimizer.rebind(params);
        Ok(optimizer)
    }

    fn update_parameter(&mut self, param: &TrackedParam, grad: &Tensor) -> Result<()> {
        let value = param.var.as_tensor().detach();
        let grad = if self.config.weight_decay > 0.0 {
            (grad + (&value * self.config.weight_decay)?)?
        } else {
            grad.clone()
        };

        let (beta1, beta2) = (self.config.beta1, self.config.beta2);

        // m_t = b1 * m + (1 - b1) * g ; v_t = b2 * v + (1 - b2) * g^2
        let momentum = match self.momentum.get(&param.key) {
            Some(m) => ((m * beta1)? + (&grad * (1.0 - beta1))?)?,
            None => (&grad * (1.0 - beta1))?,
        };
        let variance = match self.variance.get(&param.key) {
            Some(v) => ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?,
            None => (grad.sqr()? * (1.0 - beta2))?,
        };

        let t = self.steps.get(&param.key).copied().unwrap_or(0) + 1;
        let bias_correction1 = 1.0 - beta1.powi(t as i32);
        let bias_correction2 = 1.0 - beta2.powi(t as i32);

        let m_hat = (&momentum / bias_correction1)?;
        let v_hat = (&variance / bias_correction2)?;
        let denominator = (v_hat.sqrt()? + self.config.epsilon)?;
        let update = ((m_hat / denominator)? * self.learning_rate)?;

        param.var.set(&(value - update)?)?;

        self.momentum.insert(param.key.clone(), momentum);
        self.variance.insert(param.key.clone(), variance);
        self.steps.insert(param.key.clone(), t);
        Ok(())
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn rebind(&mut self, params: &ParameterSet) {
        self.tracked = params
            .trainable()
            .map(|p| TrackedParam {
                key: p.key(),
                var: p.var.clone(),
            })
            .collect();

        let before = self.momentum.len();
        let keys: Vec<&String> = self.tracked.iter().map(|p| &p.key).collect();
        self.momentum.retain(|k, _| keys.contains(&k));
        self.variance.retain(|k, _| keys.contains(&k));
        self.steps.retain(|k, _| keys.contains(&k));

        debug!(
            "Adam bound to {} parameters ({} moment entries dropped)",
            self.tracked.len(),
            before - self.momentum.len()
        );
    }

    fn tracked(&self) -> &[TrackedParam] {
        &self.tracked
    }

    fn apply(&mut self, gradients: &HashMap<String, Tensor>) -> Result<()> {
        self.step_count += 1;

        let tracked = self.tracked.clone();
        for param in &tracked {
            if let Some(grad) = gradients.get(&param.key) {
                self.update_parameter(param, grad)?;
            }
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step_count,
            learning_rate: self.learning_rate,
            first_moments: self
                .momentum
                .iter()
                .map(|(k, t)| (k.clone(), t.clone()))
                .collect::<BTreeMap<_, _>>(),
            second_moments: self
                .variance
                .iter()
                .map(|(k, t)| (k.clone(), t.clone()))
                .collect::<BTreeMap<_, _>>(),
            param_steps: self
                .steps
                .iter()
                .map(|(k, &t)| (k.clone(), t))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        if state.first_moments.len() != state.second_moments.len()
            || state.first_moments.len() != state.param_steps.len()
            || state.first_moments.keys().any(|k| {
                !state.second_moments.contains_key(k) || !state.param_steps.contains_key(k)
            })
        {
            return Err(Error::format(
                "optimizer state has unpaired moment estimates",
            ));
        }

        let mut momentum = HashMap::with_capacity(state.first_moments.len());
        let mut variance = HashMap::with_capacity(state.second_moments.len());

        for (key, m) in &state.first_moments {
            let param = self
                .tracked
                .iter()
                .find(|p| &p.key == key)
                .ok_or_else(|| {
                    Error::format(format!("optimizer state refers to untracked parameter '{key}'"))
                })?;
            let v = &state.second_moments[key];

            if m.dims() != param.var.dims() || v.dims() != param.var.dims() {
                return Err(Error::format(format!(
                    "optimizer state for '{}' has shape {:?}, expected {:?}",
                    key,
                    m.dims(),
                    param.var.dims()
                )));
            }

            let device = param.var.device();
            let dtype = param.var.dtype();
            momentum.insert(key.clone(), m.to_device(device)?.to_dtype(dtype)?);
            variance.insert(key.clone(), v.to_device(device)?.to_dtype(dtype)?);
        }

        self.step_count = state.step;
        self.learning_rate = state.learning_rate;
        self.momentum = momentum;
        self.variance = variance;
        self.steps = state.param_steps.into_iter().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParamGroup;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder, VarMap};
    use std::collections::BTreeSet;

    fn params() -> ParameterSet {
        let device = Device::Cpu;
        let encoder = VarMap::new();
        let head = VarMap::new();
        VarBuilder::from_varmap(&encoder, DType::F32, &device)
            .get_with_hints(2, "weight", Init::Const(1.0))
            .unwrap();
        VarBuilder::from_varmap(&head, DType::F32, &device)
            .get_with_hints(2, "weight", Init::Const(1.0))
            .unwrap();
        ParameterSet::from_varmaps(vec![
            (ParamGroup::Encoder, encoder),
            (ParamGroup::FinalLayer, head),
        ])
        .unwrap()
    }

    fn grads(keys: &[&str], value: f32) -> HashMap<String, Tensor> {
        keys.iter()
            .map(|k| {
                (
                    k.to_string(),
                    Tensor::full(value, 2, &Device::Cpu).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let params = params();
        let mut adam = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();
        assert_eq!(adam.name(), "adam");

        adam.apply(&grads(&["encoder.weight", "final_layer.weight"], 0.5))
            .unwrap();

        // The bias-corrected first step is lr * sign(g)
        let weight = params.state()["encoder.weight"].to_vec1::<f32>().unwrap();
        assert_relative_eq!(weight[0], 0.9, epsilon = 1e-5);
        assert_eq!(adam.step_count(), 1);
    }

    #[test]
    fn test_rebind_tracks_trainable_and_drops_frozen_state() {
        let mut params = params();
        let mut adam = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();
        adam.apply(&grads(&["encoder.weight", "final_layer.weight"], 0.5))
            .unwrap();
        assert_eq!(adam.state().num_tracked(), 2);

        params.set_trainable_groups(&BTreeSet::from([ParamGroup::FinalLayer]));
        assert!(!adam.is_bound_to(&params));

        adam.rebind(&params);
        assert!(adam.is_bound_to(&params));
        let state = adam.state();
        assert_eq!(
            state.first_moments.keys().collect::<Vec<_>>(),
            vec!["final_layer.weight"]
        );
    }

    #[test]
    fn test_frozen_parameters_not_updated() {
        let mut params = params();
        params.set_trainable_groups(&BTreeSet::from([ParamGroup::FinalLayer]));
        let mut adam = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();

        adam.apply(&grads(&["encoder.weight", "final_layer.weight"], 0.5))
            .unwrap();

        let state = params.state();
        assert_eq!(state["encoder.weight"].to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
        assert!(state["final_layer.weight"].to_vec1::<f32>().unwrap()[0] < 1.0);
    }

    #[test]
    fn test_state_round_trip() {
        let params = params();
        let mut adam = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();
        adam.apply(&grads(&["encoder.weight"], 0.5)).unwrap();
        let state = adam.state();

        let mut restored = Adam::new(&params, 0.5, AdamConfig::default()).unwrap();
        restored.load_state(state.clone()).unwrap();
        assert_eq!(restored.step_count(), 1);
        assert_eq!(restored.learning_rate(), 0.1);
        assert_eq!(restored.state().param_steps, state.param_steps);
        assert_eq!(
            restored.state().first_moments["encoder.weight"]
                .to_vec1::<f32>()
                .unwrap(),
            state.first_moments["encoder.weight"].to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_load_state_rejects_untracked_keys() {
        let mut params = params();
        let adam_all = {
            let mut adam = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();
            adam.apply(&grads(&["encoder.weight"], 0.5)).unwrap();
            adam.state()
        };

        params.set_trainable_groups(&BTreeSet::from([ParamGroup::FinalLayer]));
        let mut frozen = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();
        assert!(matches!(frozen.load_state(adam_all), Err(Error::Format(_))));
    }

    #[test]
    fn test_unfrozen_parameter_starts_its_own_bias_correction() {
        let mut params = params();
        params.set_trainable_groups(&BTreeSet::from([ParamGroup::FinalLayer]));
        let mut adam = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();
        for _ in 0..5000 {
            adam.apply(&grads(&["final_layer.weight"], 0.5)).unwrap();
        }

        params.set_all_trainable();
        adam.rebind(&params);
        adam.apply(&grads(&["encoder.weight"], 0.5)).unwrap();

        // First update of the encoder moves it by lr, as on a fresh optimizer
        let weight = params.state()["encoder.weight"].to_vec1::<f32>().unwrap();
        assert_relative_eq!(weight[0], 0.9, epsilon = 1e-4);
        let state = adam.state();
        assert_eq!(state.param_steps["encoder.weight"], 1);
        assert_eq!(state.param_steps["final_layer.weight"], 5000);
        assert_eq!(adam.step_count(), 5001);
    }

    #[test]
    fn test_refrozen_parameter_restarts_step_count() {
        let mut params = params();
        let mut adam = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();
        adam.apply(&grads(&["encoder.weight", "final_layer.weight"], 0.5))
            .unwrap();

        params.set_trainable_groups(&BTreeSet::from([ParamGroup::FinalLayer]));
        adam.rebind(&params);
        assert!(!adam.state().param_steps.contains_key("encoder.weight"));

        params.set_all_trainable();
        adam.rebind(&params);
        adam.apply(&grads(&["encoder.weight"], 0.5)).unwrap();
        assert_eq!(adam.state().param_steps["encoder.weight"], 1);
    }

    #[test]
    fn test_load_state_rejects_missing_step_counts() {
        let params = params();
        let mut adam = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();
        adam.apply(&grads(&["encoder.weight"], 0.5)).unwrap();
        let mut state = adam.state();
        state.param_steps.clear();

        let mut restored = Adam::new(&params, 0.1, AdamConfig::default()).unwrap();
        assert!(matches!(restored.load_state(state), Err(Error::Format(_))));
    }

    #[test]
    fn test_invalid_betas() {
        let config = AdamConfig {
            beta1: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
