//! Sample sources for segmentation training
//!
//! A [`SampleSource`] yields `(input, label)` batches to the trainer and hides
//! how samples are fetched: the provided [`DataLoader`] assembles each batch
//! on a bounded worker pool and the trainer simply blocks on the next batch.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

pub mod datasets;
pub mod loaders;

pub use datasets::TensorDataset;
pub use loaders::{DataLoader, DataLoaderConfig};

/// Common trait for all segmentation datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a sample by index
    fn get(&self, index: usize) -> Result<Sample>;
}

/// One image and its per-pixel class mask
#[derive(Debug, Clone)]
pub struct Sample {
    /// `(channels, H, W)` float image
    pub image: Tensor,
    /// `(H, W)` class indices, 0 being background
    pub mask: Tensor,
}

/// A collated batch of samples
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, channels, H, W)` float images
    pub inputs: Tensor,
    /// `(batch, H, W)` u32 class indices
    pub labels: Tensor,
}

impl Batch {
    /// Stack samples into a batch on `device`
    pub fn collate(samples: &[Sample], device: &Device) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| Error::invalid_input("cannot collate an empty batch"))?;

        for (i, sample) in samples.iter().enumerate() {
            if sample.image.dims() != first.image.dims() || sample.mask.dims() != first.mask.dims()
            {
                return Err(Error::invalid_input(format!(
                    "sample {} has image {:?} / mask {:?}, batch started with {:?} / {:?}",
                    i,
                    sample.image.dims(),
                    sample.mask.dims(),
                    first.image.dims(),
                    first.mask.dims()
                )));
            }
        }

        let images: Vec<&Tensor> = samples.iter().map(|s| &s.image).collect();
        let masks: Vec<&Tensor> = samples.iter().map(|s| &s.mask).collect();

        let inputs = Tensor::stack(&images, 0)?
            .to_dtype(DType::F32)?
            .to_device(device)?;
        let labels = Tensor::stack(&masks, 0)?
            .to_dtype(DType::U32)?
            .to_device(device)?;

        Ok(Self { inputs, labels })
    }

    /// Number of samples in the batch
    pub fn size(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }
}

/// Iterator over the batches of one pass
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// Provider of training or validation batches
pub trait SampleSource {
    /// Number of batches in one pass
    fn num_batches(&self) -> usize;

    /// The first batch of an unshuffled pass
    fn first_batch(&self) -> Result<Batch>;

    /// Start a new pass over the source
    fn batches(&mut self) -> Result<BatchIter<'_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(h: usize, w: usize) -> Sample {
        let device = Device::Cpu;
        Sample {
            image: Tensor::zeros((3, h, w), DType::F32, &device).unwrap(),
            mask: Tensor::zeros((h, w), DType::U8, &device).unwrap(),
        }
    }

    #[test]
    fn test_collate_stacks_and_converts_labels() {
        let batch = Batch::collate(&[sample(4, 4), sample(4, 4)], &Device::Cpu).unwrap();
        assert_eq!(batch.inputs.dims(), &[2, 3, 4, 4]);
        assert_eq!(batch.labels.dims(), &[2, 4, 4]);
        assert_eq!(batch.labels.dtype(), DType::U32);
        assert_eq!(batch.size(), 2);
    }

    #[test]
    fn test_collate_rejects_mixed_sizes() {
        let result = Batch::collate(&[sample(4, 4), sample(8, 8)], &Device::Cpu);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(Batch::collate(&[], &Device::Cpu).is_err());
    }
}
