//! In-memory segmentation dataset

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use super::{Dataset, Sample};
use crate::error::{Error, Result};

/// Tensor key holding `(N, channels, H, W)` images in a safetensors file
pub const IMAGES_KEY: &str = "images";

/// Tensor key holding `(N, H, W)` masks in a safetensors file
pub const MASKS_KEY: &str = "masks";

/// Dataset backed by tensors held in host memory
#[derive(Debug, Clone, Default)]
pub struct TensorDataset {
    samples: Vec<Sample>,
}

impl TensorDataset {
    /// Wrap already split samples
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Split stacked image and mask tensors into samples
    pub fn from_tensors(images: &Tensor, masks: &Tensor) -> Result<Self> {
        let (n, _, h, w) = images.dims4()?;
        let (mask_n, mask_h, mask_w) = masks.dims3()?;

        if n != mask_n {
            return Err(Error::invalid_input(format!(
                "{n} images but {mask_n} masks"
            )));
        }
        if (h, w) != (mask_h, mask_w) {
            return Err(Error::invalid_input(format!(
                "images are {h}x{w} but masks are {mask_h}x{mask_w}"
            )));
        }

        let images = images.to_dtype(DType::F32)?;
        let masks = masks.to_dtype(DType::U32)?;

        let samples = (0..n)
            .map(|i| {
                Ok(Sample {
                    image: images.get(i)?,
                    mask: masks.get(i)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { samples })
    }

    /// Load an `images` / `masks` tensor pair from a safetensors file
    pub fn from_safetensors(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::not_found(format!("dataset {}", path.display())));
        }

        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let images = tensors.get(IMAGES_KEY).ok_or_else(|| {
            Error::invalid_input(format!("{} has no '{IMAGES_KEY}' tensor", path.display()))
        })?;
        let masks = tensors.get(MASKS_KEY).ok_or_else(|| {
            Error::invalid_input(format!("{} has no '{MASKS_KEY}' tensor", path.display()))
        })?;

        let dataset = Self::from_tensors(images, masks)?;
        info!("Loaded {} samples from {}", dataset.len(), path.display());
        Ok(dataset)
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            Error::invalid_input(format!(
                "sample index {} out of range for {} samples",
                index,
                self.samples.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_tensors_splits_samples() {
        let device = Device::Cpu;
        let images = Tensor::ones((3, 3, 4, 4), DType::F32, &device).unwrap();
        let masks = Tensor::zeros((3, 4, 4), DType::U8, &device).unwrap();
        let dataset = TensorDataset::from_tensors(&images, &masks).unwrap();

        assert_eq!(dataset.len(), 3);
        let sample = dataset.get(2).unwrap();
        assert_eq!(sample.image.dims(), &[3, 4, 4]);
        assert_eq!(sample.mask.dtype(), DType::U32);
        assert!(dataset.get(3).is_err());
    }

    #[test]
    fn test_from_tensors_rejects_count_mismatch() {
        let device = Device::Cpu;
        let images = Tensor::ones((3, 3, 4, 4), DType::F32, &device).unwrap();
        let masks = Tensor::zeros((2, 4, 4), DType::U8, &device).unwrap();
        assert!(TensorDataset::from_tensors(&images, &masks).is_err());
    }

    #[test]
    fn test_safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.safetensors");
        let device = Device::Cpu;

        let tensors = HashMap::from([
            (
                IMAGES_KEY.to_string(),
                Tensor::ones((2, 3, 4, 4), DType::F32, &device).unwrap(),
            ),
            (
                MASKS_KEY.to_string(),
                Tensor::ones((2, 4, 4), DType::U8, &device).unwrap(),
            ),
        ]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let dataset = TensorDataset::from_safetensors(&path).unwrap();
        assert_eq!(dataset.len(), 2);
        let mask = dataset.get(0).unwrap().mask.to_vec2::<u32>().unwrap();
        assert_eq!(mask, vec![vec![1u32; 4]; 4]);
    }

    #[test]
    fn test_missing_dataset_file() {
        let result = TensorDataset::from_safetensors("/nonexistent/data.safetensors");
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
