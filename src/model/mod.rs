//! Segmentation model capability
//!
//! The trainer only sees a model through [`SegmentationModel`]: a forward pass,
//! a tagged [`ParameterSet`] and a training/evaluation mode flag. Parameters
//! carry their [`ParamGroup`] from construction time, so freezing is a set
//! operation over groups instead of a match on parameter names.

pub mod unet;

pub use unet::{UNet, UNetConfig};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Structural role of a parameter inside the encoder-decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    /// Contracting path
    Encoder,
    /// Deepest double convolution
    Bottleneck,
    /// Expanding path
    Decoder,
    /// Final 1x1 classification convolution
    FinalLayer,
}

impl ParamGroup {
    /// All groups in construction order
    pub const ALL: [ParamGroup; 4] = [
        ParamGroup::Encoder,
        ParamGroup::Bottleneck,
        ParamGroup::Decoder,
        ParamGroup::FinalLayer,
    ];

    /// Stable tag used in serialized state keys
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamGroup::Encoder => "encoder",
            ParamGroup::Bottleneck => "bottleneck",
            ParamGroup::Decoder => "decoder",
            ParamGroup::FinalLayer => "final_layer",
        }
    }
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the model runs with training-only behaviour (dropout) enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelMode {
    Training,
    Evaluation,
}

/// A single learnable tensor and its trainable flag
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Name unique within its group
    pub name: String,
    /// Group assigned at construction
    pub group: ParamGroup,
    /// Underlying variable
    pub var: Var,
    /// Whether the optimizer may update this parameter
    pub trainable: bool,
}

impl Parameter {
    /// Key under which the parameter is serialized
    pub fn key(&self) -> String {
        format!("{}.{}", self.group.as_str(), self.name)
    }

    /// Number of scalar elements
    pub fn elem_count(&self) -> usize {
        self.var.elem_count()
    }
}

/// Ordered collection of every model parameter
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    params: Vec<Parameter>,
}

impl ParameterSet {
    /// Collect the variables of one `VarMap` per group
    ///
    /// Every parameter starts out trainable.
    pub fn from_varmaps(groups: Vec<(ParamGroup, VarMap)>) -> Result<Self> {
        let mut params = Vec::new();

        for (group, var_map) in groups {
            let data = var_map
                .data()
                .lock()
                .map_err(|_| Error::internal("variable map lock poisoned"))?;

            let mut named: Vec<(&String, &Var)> = data.iter().collect();
            named.sort_by(|a, b| a.0.cmp(b.0));

            for (name, var) in named {
                params.push(Parameter {
                    name: name.clone(),
                    group,
                    var: var.clone(),
                    trainable: true,
                });
            }
        }

        Ok(Self { params })
    }

    /// Iterate over all parameters
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Iterate over parameters currently flagged trainable
    pub fn trainable(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter().filter(|p| p.trainable)
    }

    /// Serialized keys of the trainable parameters
    pub fn trainable_keys(&self) -> BTreeSet<String> {
        self.trainable().map(Parameter::key).collect()
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the set holds no parameters
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Mark every parameter trainable
    pub fn set_all_trainable(&mut self) {
        for param in &mut self.params {
            param.trainable = true;
        }
    }

    /// Mark exactly the parameters of `groups` trainable and freeze the rest
    pub fn set_trainable_groups(&mut self, groups: &BTreeSet<ParamGroup>) {
        for param in &mut self.params {
            param.trainable = groups.contains(&param.group);
        }
    }

    /// Total scalar element count
    pub fn num_elements(&self) -> usize {
        self.params.iter().map(Parameter::elem_count).sum()
    }

    /// Scalar element count of trainable parameters
    pub fn num_trainable_elements(&self) -> usize {
        self.trainable().map(Parameter::elem_count).sum()
    }

    /// (total, trainable) element counts per group
    pub fn group_summary(&self) -> BTreeMap<ParamGroup, (usize, usize)> {
        let mut summary = BTreeMap::new();
        for param in &self.params {
            let entry = summary.entry(param.group).or_insert((0, 0));
            entry.0 += param.elem_count();
            if param.trainable {
                entry.1 += param.elem_count();
            }
        }
        summary
    }

    /// Snapshot of every parameter tensor keyed by `<group>.<name>`
    pub fn state(&self) -> BTreeMap<String, Tensor> {
        self.params
            .iter()
            .map(|p| (p.key(), p.var.as_tensor().clone()))
            .collect()
    }

    /// Overwrite every parameter from a state map
    ///
    /// All keys and shapes are checked before any parameter is written, so a
    /// rejected state leaves the model untouched.
    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        if state.len() != self.params.len() {
            return Err(Error::format(format!(
                "model state has {} tensors, expected {}",
                state.len(),
                self.params.len()
            )));
        }

        let mut updates = Vec::with_capacity(self.params.len());
        for param in &self.params {
            let key = param.key();
            let tensor = state
                .get(&key)
                .ok_or_else(|| Error::format(format!("model state is missing '{key}'")))?;

            if tensor.dims() != param.var.dims() {
                return Err(Error::format(format!(
                    "model state '{}' has shape {:?}, expected {:?}",
                    key,
                    tensor.dims(),
                    param.var.dims()
                )));
            }

            let tensor = tensor
                .to_device(param.var.device())?
                .to_dtype(param.var.dtype())?;
            updates.push((param, tensor));
        }

        for (param, tensor) in updates {
            param.var.set(&tensor)?;
        }

        debug!("Loaded {} parameter tensors", self.params.len());
        Ok(())
    }
}

/// A pixel-segmentation model driven by the trainer
pub trait SegmentationModel {
    /// Map `(batch, channels, H, W)` images to `(batch, classes, H, W)` logits
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Number of output classes
    fn num_classes(&self) -> usize;

    /// Learnable parameters
    fn parameters(&self) -> &ParameterSet;

    /// Learnable parameters, for changing trainable flags or loading state
    fn parameters_mut(&mut self) -> &mut ParameterSet;

    /// Current mode
    fn mode(&self) -> ModelMode;

    /// Switch mode
    fn set_mode(&mut self, mode: ModelMode);
}

/// Scoped evaluation mode
///
/// Puts the model into [`ModelMode::Evaluation`] on creation and back into
/// [`ModelMode::Training`] when dropped, whichever way the scope is left.
pub struct EvalGuard<'a, M: SegmentationModel + ?Sized> {
    model: &'a mut M,
}

impl<'a, M: SegmentationModel + ?Sized> EvalGuard<'a, M> {
    /// Enter evaluation mode
    pub fn new(model: &'a mut M) -> Self {
        model.set_mode(ModelMode::Evaluation);
        Self { model }
    }
}

impl<M: SegmentationModel + ?Sized> Deref for EvalGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: SegmentationModel + ?Sized> DerefMut for EvalGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: SegmentationModel + ?Sized> Drop for EvalGuard<'_, M> {
    fn drop(&mut self) {
        self.model.set_mode(ModelMode::Training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn two_group_set() -> ParameterSet {
        let device = Device::Cpu;
        let encoder = VarMap::new();
        let head = VarMap::new();
        VarBuilder::from_varmap(&encoder, DType::F32, &device)
            .get_with_hints((2, 3), "weight", Init::Const(1.0))
            .unwrap();
        VarBuilder::from_varmap(&head, DType::F32, &device)
            .get_with_hints(4, "bias", Init::Const(0.5))
            .unwrap();
        ParameterSet::from_varmaps(vec![
            (ParamGroup::Encoder, encoder),
            (ParamGroup::FinalLayer, head),
        ])
        .unwrap()
    }

    #[test]
    fn test_parameters_tagged_by_group() {
        let params = two_group_set();
        assert_eq!(params.len(), 2);
        let keys: Vec<String> = params.iter().map(Parameter::key).collect();
        assert_eq!(keys, vec!["encoder.weight", "final_layer.bias"]);
        assert_eq!(params.num_elements(), 10);
        assert_eq!(params.num_trainable_elements(), 10);
    }

    #[test]
    fn test_set_trainable_groups() {
        let mut params = two_group_set();
        params.set_trainable_groups(&BTreeSet::from([ParamGroup::FinalLayer]));
        assert_eq!(params.trainable_keys(), BTreeSet::from(["final_layer.bias".to_string()]));
        assert_eq!(params.group_summary()[&ParamGroup::Encoder], (6, 0));

        params.set_all_trainable();
        assert_eq!(params.trainable().count(), 2);
    }

    #[test]
    fn test_load_state_rejects_bad_shape_without_writing() {
        let mut params = two_group_set();
        let mut state: HashMap<String, Tensor> = params.state().into_iter().collect();
        state.insert(
            "encoder.weight".to_string(),
            Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        state.insert(
            "final_layer.bias".to_string(),
            Tensor::zeros(5, DType::F32, &Device::Cpu).unwrap(),
        );

        assert!(matches!(params.load_state(&state), Err(Error::Format(_))));
        let weight = params.state()["encoder.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(weight, vec![vec![1.0; 3]; 2]);
    }
}
