//! unet-train - Training orchestration for U-Net semantic segmentation
//!
//! This crate drives supervised training of a pixel-segmentation model on
//! candle: the epoch/batch loop, loss scaling, phase-scoped metrics,
//! best-loss checkpointing and final-layer fine-tuning from a checkpoint.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod model;
pub mod training;

// Re-exports
pub use crate::config::{DeviceType, RunConfig, ValidationMode};
pub use crate::error::{Error, Result};
pub use crate::model::{
    EvalGuard, ModelMode, ParamGroup, Parameter, ParameterSet, SegmentationModel, UNet,
    UNetConfig,
};
pub use crate::training::{RunReport, UNetTrainer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
