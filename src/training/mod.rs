//! Training infrastructure for U-Net segmentation
//!
//! # Main Components
//!
//! - **Data**: sample sources and the batching loader
//! - **Loss**: one-hot cross-entropy and class predictions
//! - **Scaler**: dynamic loss scaling with step skipping
//! - **Optimizers**: Adam bound to the trainable parameter set
//! - **Checkpoints**: epoch snapshots and the freeze policy
//! - **Metrics**: phase-scoped series, accumulators and exporters
//! - **Trainer**: the epoch loop tying everything together
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use unet_train::training::{DataLoader, DataLoaderConfig, TensorDataset, UNetTrainer};
//! use unet_train::RunConfig;
//!
//! let config = RunConfig::from_file("run.toml")?;
//! let device = config.device()?;
//! let train = DataLoader::new(
//!     Arc::new(TensorDataset::from_safetensors("train.safetensors")?),
//!     DataLoaderConfig { batch_size: config.batch_size, ..Default::default() },
//!     device.clone(),
//! )?;
//! let val = DataLoader::new(
//!     Arc::new(TensorDataset::from_safetensors("val.safetensors")?),
//!     DataLoaderConfig { batch_size: config.batch_size, shuffle: false, ..Default::default() },
//!     device,
//! )?;
//!
//! let mut trainer = UNetTrainer::from_config(config, Box::new(train), Box::new(val))?;
//! let report = trainer.run()?;
//! ```

pub mod checkpoints;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod scaler;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Trainer re-exports
pub use trainer::{
    BestLossTracker, EpochSummary, RunReport, StopHandle, TrainingEvent, TrainingState,
    TrainingStatus, UNetTrainer, ValidationSummary,
};

// Component re-exports
pub use checkpoints::{Checkpoint, CheckpointStore, CHECKPOINT_EXTENSION};
pub use data::{Batch, DataLoader, DataLoaderConfig, Dataset, Sample, SampleSource, TensorDataset};
pub use metrics::{LongFormRow, MetricName, MetricSeries, MetricsEngine, Phase};
pub use optimizers::{Adam, AdamConfig, Optimizer, OptimizerState};
pub use scaler::{GradScaler, ScalerConfig, StepOutcome};
