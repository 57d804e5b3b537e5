//! Run configuration for U-Net training
//!
//! `RunConfig` is the single explicit value that carries every run parameter
//! (image size, class count, device selection, ...). It is built once at
//! startup, validated, and handed to each component at construction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::checkpoints::has_checkpoint_extension;
use crate::training::optimizers::AdamConfig;
use crate::training::scaler::ScalerConfig;

/// Environment variable prefix for layered configuration
pub const ENV_PREFIX: &str = "UNET_TRAIN";

/// Main configuration for a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Side length of the square input images
    pub image_size: usize,
    /// Number of segmentation classes, background included
    pub num_classes: usize,
    /// Number of input image channels
    pub in_channels: usize,
    /// Channel widths of the encoder stages
    pub features: Vec<usize>,
    /// Decoder dropout probability (active only in training mode)
    pub dropout: f64,
    /// Samples per batch
    pub batch_size: usize,
    /// Number of training epochs
    pub num_epochs: usize,
    /// Optimizer learning rate
    pub learning_rate: f64,
    /// Checkpoint to resume or fine-tune from
    pub checkpoint_path: Option<PathBuf>,
    /// Train only the final layer after loading `checkpoint_path`
    pub freeze: bool,
    /// Worker threads used by the sample source
    pub num_workers: usize,
    /// Request pinned host memory for batches
    pub pin_memory: bool,
    /// Suppress checkpoint writes
    pub debug: bool,
    /// Directory receiving checkpoints and exported metrics
    pub checkpoint_dir: PathBuf,
    /// How the per-epoch validation pass samples the validation set
    pub validation_mode: ValidationMode,
    /// Seed for sample shuffling
    pub seed: u64,
    /// Compute device
    pub device: DeviceType,
    /// Loss scaling settings
    pub scaler: ScalerConfig,
    /// Adam hyperparameters
    pub adam: AdamConfig,
}

/// Per-epoch validation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Only the first (fixed) batch of the validation set
    FirstBatch,
    /// The whole validation set
    Full,
}

/// Compute device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceType {
    /// Host CPU
    Cpu,
    /// CUDA device by ordinal
    Cuda(usize),
    /// Metal device by ordinal
    Metal(usize),
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            image_size: 256,
            num_classes: 80 + 1,
            in_channels: 3,
            features: vec![64, 128, 256, 512],
            dropout: 0.0,
            batch_size: 100,
            num_epochs: 80,
            learning_rate: 5e-4,
            checkpoint_path: None,
            freeze: false,
            num_workers: 4,
            pin_memory: false,
            debug: false,
            checkpoint_dir: default_checkpoint_dir(),
            validation_mode: ValidationMode::FirstBatch,
            seed: 42,
            device: DeviceType::Cpu,
            scaler: ScalerConfig::default(),
            adam: AdamConfig::default(),
        }
    }
}

/// `checkpoints/<MMDDYYYY>` for the current local date
pub fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints").join(chrono::Local::now().format("%m%d%Y").to_string())
}

impl RunConfig {
    /// Load configuration from defaults, an optional file and the environment
    ///
    /// Later layers override earlier ones. Environment keys use the
    /// `UNET_TRAIN_` prefix with `__` separating nested fields, e.g.
    /// `UNET_TRAIN_NUM_EPOCHS=10` or `UNET_TRAIN_SCALER__ENABLED=false`.
    /// The result is not validated; call [`RunConfig::validate`] once all
    /// overrides are applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&RunConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::not_found(format!(
                    "configuration file {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::load(Some(path.as_ref()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the parameter combination
    ///
    /// Runs before any model, optimizer or directory work for the run.
    pub fn validate(&self) -> Result<()> {
        if self.freeze && self.checkpoint_path.is_none() {
            return Err(Error::config(
                "Must specify a checkpoint file (.safetensors) for freeze",
            ));
        }

        if let Some(path) = &self.checkpoint_path {
            if !has_checkpoint_extension(path) {
                return Err(Error::format(format!(
                    "Checkpoint {} not valid checkpoint file type (expected: .safetensors)",
                    path.display()
                )));
            }
        }

        if self.image_size == 0 {
            return Err(Error::config("Image size must be greater than 0"));
        }

        if self.num_classes < 2 {
            return Err(Error::config(
                "Number of classes must be at least 2 (background + one class)",
            ));
        }

        if self.in_channels == 0 {
            return Err(Error::config("Input channels must be greater than 0"));
        }

        if self.features.is_empty() || self.features.contains(&0) {
            return Err(Error::config("Feature widths must be non-empty and positive"));
        }

        let downsampling = 1usize << self.features.len();
        if self.image_size % downsampling != 0 {
            return Err(Error::config(format!(
                "Image size {} must be divisible by {} for {} encoder stages",
                self.image_size,
                downsampling,
                self.features.len()
            )));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config("Dropout must be in [0.0, 1.0)"));
        }

        if self.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }

        if self.num_epochs == 0 {
            return Err(Error::config("Number of epochs must be greater than 0"));
        }

        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::config("Learning rate must be positive"));
        }

        self.scaler.validate()?;
        self.adam.validate()?;

        Ok(())
    }

    /// Create the candle device this run computes on
    pub fn device(&self) -> Result<Device> {
        self.device.to_device()
    }
}

impl DeviceType {
    /// Instantiate the device
    pub fn to_device(self) -> Result<Device> {
        let device = match self {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceType::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            DeviceType::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| Error::config(format!("Invalid device ordinal in '{s}'")))?;
                (kind.to_string(), ordinal)
            }
            None => (s.clone(), 0),
        };

        match kind.as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "cuda" | "gpu" => Ok(DeviceType::Cuda(ordinal)),
            "metal" => Ok(DeviceType::Metal(ordinal)),
            _ => Err(Error::config(format!("Unknown device '{s}'"))),
        }
    }
}

impl TryFrom<String> for DeviceType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceType> for String {
    fn from(value: DeviceType) -> Self {
        value.to_string()
    }
}
