//! Batching data loader with a bounded worker pool

use std::sync::Arc;

use candle_core::Device;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Batch, BatchIter, Dataset, Sample, SampleSource};
use crate::error::{Error, Result};

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to reshuffle the sample order on every pass
    pub shuffle: bool,
    /// Number of worker threads fetching samples (0 loads on the caller)
    pub num_workers: usize,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Shuffle seed
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            num_workers: 4,
            drop_last: false,
            seed: 42,
        }
    }
}

/// Data loader yielding collated batches on a target device
pub struct DataLoader<D: Dataset> {
    /// Dataset reference
    dataset: Arc<D>,
    /// DataLoader configuration
    config: DataLoaderConfig,
    /// Worker pool, absent when loading on the caller thread
    pool: Option<ThreadPool>,
    /// Shuffle generator
    rng: StdRng,
    /// Device receiving the batches
    device: Device,
}

impl<D: Dataset> DataLoader<D> {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<D>, config: DataLoaderConfig, device: Device) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }

        let pool = if config.num_workers > 0 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(config.num_workers)
                .thread_name(|i| format!("sample-worker-{i}"))
                .build()
                .map_err(|e| Error::internal(format!("failed to start worker pool: {e}")))?;
            Some(pool)
        } else {
            None
        };

        info!(
            "Creating DataLoader with batch_size={}, num_workers={}, shuffle={}",
            config.batch_size, config.num_workers, config.shuffle
        );

        Ok(Self {
            dataset,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            pool,
            device,
        })
    }

    /// Split indices into batch-sized chunks
    fn create_batches(&self, indices: Vec<usize>) -> Vec<Vec<usize>> {
        let mut batches = Vec::new();

        for chunk in indices.chunks(self.config.batch_size) {
            if self.config.drop_last && chunk.len() < self.config.batch_size {
                break;
            }
            batches.push(chunk.to_vec());
        }

        debug!("Created {} batches", batches.len());
        batches
    }

    /// Fetch and collate the samples at `indices`
    fn fetch_batch(&self, indices: &[usize]) -> Result<Batch> {
        let samples: Vec<Sample> = match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&i| self.dataset.get(i))
                    .collect::<Result<Vec<_>>>()
            })?,
            None => indices
                .iter()
                .map(|&i| self.dataset.get(i))
                .collect::<Result<Vec<_>>>()?,
        };

        Batch::collate(&samples, &self.device)
    }
}

impl<D: Dataset> SampleSource for DataLoader<D> {
    fn num_batches(&self) -> usize {
        let dataset_size = self.dataset.len();
        if self.config.drop_last {
            dataset_size / self.config.batch_size
        } else {
            dataset_size.div_ceil(self.config.batch_size)
        }
    }

    fn first_batch(&self) -> Result<Batch> {
        let end = self.config.batch_size.min(self.dataset.len());
        if end == 0 {
            return Err(Error::invalid_input("sample source is empty"));
        }
        let indices: Vec<usize> = (0..end).collect();
        self.fetch_batch(&indices)
    }

    fn batches(&mut self) -> Result<BatchIter<'_>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            indices.shuffle(&mut self.rng);
        }

        let batches = self.create_batches(indices);
        let this: &Self = self;
        Ok(Box::new(
            batches.into_iter().map(move |chunk| this.fetch_batch(&chunk)),
        ))
    }
}
