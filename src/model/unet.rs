//! U-Net encoder-decoder for semantic segmentation
//!
//! Each structural group (encoder, bottleneck, decoder, final layer) is
//! initialised from its own `VarMap`, which is what gives every parameter its
//! [`ParamGroup`] tag.

use candle_core::{DType, Device, Tensor};
use candle_nn::{
    conv2d, conv_transpose2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    Module, VarBuilder, VarMap,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ModelMode, ParamGroup, ParameterSet, SegmentationModel};
use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Architecture hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UNetConfig {
    /// Input image channels
    pub in_channels: usize,
    /// Output classes (logit channels)
    pub num_classes: usize,
    /// Channel width of each encoder stage
    pub features: Vec<usize>,
    /// Dropout applied after each decoder stage in training mode
    pub dropout: f32,
}

impl UNetConfig {
    /// Derive the architecture from the run parameters
    pub fn from_run_config(config: &RunConfig) -> Self {
        Self {
            in_channels: config.in_channels,
            num_classes: config.num_classes,
            features: config.features.clone(),
            dropout: config.dropout as f32,
        }
    }
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            num_classes: 81,
            features: vec![64, 128, 256, 512],
            dropout: 0.0,
        }
    }
}

/// Two 3x3 same-padding convolutions, each followed by ReLU
#[derive(Debug, Clone)]
struct DoubleConv {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl DoubleConv {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(out_channels, out_channels, 3, cfg, vb.pp("conv2"))?;
        Ok(Self { conv1, conv2 })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?;
        Ok(self.conv2.forward(&xs)?.relu()?)
    }
}

/// One expanding stage: 2x upsampling, skip concatenation, double conv
#[derive(Debug, Clone)]
struct UpBlock {
    up: ConvTranspose2d,
    conv: DoubleConv,
}

/// U-Net segmentation model
#[derive(Debug)]
pub struct UNet {
    downs: Vec<DoubleConv>,
    bottleneck: DoubleConv,
    ups: Vec<UpBlock>,
    final_conv: Conv2d,
    config: UNetConfig,
    mode: ModelMode,
    parameters: ParameterSet,
}

impl UNet {
    /// Build a freshly initialised model on `device`
    pub fn new(config: UNetConfig, device: &Device) -> Result<Self> {
        if config.features.is_empty() {
            return Err(Error::config("U-Net needs at least one encoder stage"));
        }

        let encoder_map = VarMap::new();
        let bottleneck_map = VarMap::new();
        let decoder_map = VarMap::new();
        let final_map = VarMap::new();

        let encoder_vb = VarBuilder::from_varmap(&encoder_map, DType::F32, device);
        let mut downs = Vec::with_capacity(config.features.len());
        let mut in_channels = config.in_channels;
        for (i, &width) in config.features.iter().enumerate() {
            downs.push(DoubleConv::new(in_channels, width, encoder_vb.pp(format!("down{i}")))?);
            in_channels = width;
        }

        let deepest = in_channels;
        let bottleneck = DoubleConv::new(
            deepest,
            deepest * 2,
            VarBuilder::from_varmap(&bottleneck_map, DType::F32, device),
        )?;

        let decoder_vb = VarBuilder::from_varmap(&decoder_map, DType::F32, device);
        let up_cfg = ConvTranspose2dConfig {
            stride: 2,
            ..Default::default()
        };
        let mut ups = Vec::with_capacity(config.features.len());
        let mut up_channels = deepest * 2;
        for (i, &width) in config.features.iter().rev().enumerate() {
            let vb = decoder_vb.pp(format!("up{i}"));
            let up = conv_transpose2d(up_channels, width, 2, up_cfg, vb.pp("upsample"))?;
            // skip connection doubles the channels going into the double conv
            let conv = DoubleConv::new(width * 2, width, vb)?;
            ups.push(UpBlock { up, conv });
            up_channels = width;
        }

        let final_conv = conv2d(
            config.features[0],
            config.num_classes,
            1,
            Conv2dConfig::default(),
            VarBuilder::from_varmap(&final_map, DType::F32, device).pp("final_conv"),
        )?;

        let parameters = ParameterSet::from_varmaps(vec![
            (ParamGroup::Encoder, encoder_map),
            (ParamGroup::Bottleneck, bottleneck_map),
            (ParamGroup::Decoder, decoder_map),
            (ParamGroup::FinalLayer, final_map),
        ])?;

        debug!(
            "Built U-Net with {} stages and {} parameter tensors",
            config.features.len(),
            parameters.len()
        );

        Ok(Self {
            downs,
            bottleneck,
            ups,
            final_conv,
            config,
            mode: ModelMode::Training,
            parameters,
        })
    }
}

impl SegmentationModel for UNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut skips = Vec::with_capacity(self.downs.len());
        let mut xs = xs.clone();

        for down in &self.downs {
            xs = down.forward(&xs)?;
            skips.push(xs.clone());
            xs = xs.max_pool2d(2)?;
        }

        xs = self.bottleneck.forward(&xs)?;

        for (block, skip) in self.ups.iter().zip(skips.iter().rev()) {
            xs = block.up.forward(&xs)?;
            xs = Tensor::cat(&[skip, &xs], 1)?;
            xs = block.conv.forward(&xs)?;
            if self.mode == ModelMode::Training && self.config.dropout > 0.0 {
                xs = candle_nn::ops::dropout(&xs, self.config.dropout)?;
            }
        }

        Ok(self.final_conv.forward(&xs)?)
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }
}
