//! Checkpoint store
//!
//! A checkpoint is one safetensors file holding the model parameters and the
//! optimizer state of an epoch:
//!
//! - `model.<group>.<name>`: parameter tensors
//! - `optim.m.<group>.<name>` / `optim.v.<group>.<name>`: Adam moments
//! - `optim.t.<group>.<name>` (i64): updates applied to that parameter
//! - `optim.step` (i64), `optim.lr` (f64), `meta.epoch` (i64)
//!
//! Checkpoints are written once and never modified; a better epoch gets a new
//! file instead of replacing the previous one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, instrument};

use super::optimizers::{Optimizer, OptimizerState};
use crate::error::{Error, Result};
use crate::model::{ParamGroup, ParameterSet};

/// File extension every checkpoint path must carry
pub const CHECKPOINT_EXTENSION: &str = "safetensors";

const MODEL_PREFIX: &str = "model.";
const FIRST_MOMENT_PREFIX: &str = "optim.m.";
const SECOND_MOMENT_PREFIX: &str = "optim.v.";
const PARAM_STEP_PREFIX: &str = "optim.t.";
const STEP_KEY: &str = "optim.step";
const LR_KEY: &str = "optim.lr";
const EPOCH_KEY: &str = "meta.epoch";

/// Whether `path` ends in the checkpoint extension
pub fn has_checkpoint_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(CHECKPOINT_EXTENSION))
}

/// Snapshot of model and optimizer state at the end of an epoch
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Epoch the snapshot was taken after
    pub epoch: usize,
    /// Parameter tensors keyed by `<group>.<name>`
    pub model: HashMap<String, Tensor>,
    /// Optimizer state
    pub optimizer: OptimizerState,
}

impl Checkpoint {
    /// Capture the current model parameters and optimizer state
    pub fn capture<O: Optimizer + ?Sized>(
        epoch: usize,
        params: &ParameterSet,
        optimizer: &O,
    ) -> Self {
        Self {
            epoch,
            model: params.state().into_iter().collect(),
            optimizer: optimizer.state(),
        }
    }

    /// Write the model and optimizer state back
    ///
    /// The optimizer must still track every parameter that has moment state
    /// in the checkpoint, so this runs before any freeze policy.
    pub fn restore<O: Optimizer + ?Sized>(
        self,
        params: &mut ParameterSet,
        optimizer: &mut O,
    ) -> Result<()> {
        params.load_state(&self.model)?;
        optimizer.load_state(self.optimizer)?;
        Ok(())
    }

    fn into_tensors(self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::with_capacity(self.model.len() + 3);

        for (key, tensor) in self.model {
            tensors.insert(format!("{MODEL_PREFIX}{key}"), tensor);
        }
        for (key, tensor) in self.optimizer.first_moments {
            tensors.insert(format!("{FIRST_MOMENT_PREFIX}{key}"), tensor);
        }
        for (key, tensor) in self.optimizer.second_moments {
            tensors.insert(format!("{SECOND_MOMENT_PREFIX}{key}"), tensor);
        }

        let cpu = Device::Cpu;
        for (key, step) in self.optimizer.param_steps {
            tensors.insert(
                format!("{PARAM_STEP_PREFIX}{key}"),
                Tensor::new(step as i64, &cpu)?,
            );
        }
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(self.optimizer.step as i64, &cpu)?,
        );
        tensors.insert(
            LR_KEY.to_string(),
            Tensor::new(self.optimizer.learning_rate, &cpu)?,
        );
        tensors.insert(EPOCH_KEY.to_string(), Tensor::new(self.epoch as i64, &cpu)?);

        Ok(tensors)
    }

    fn from_tensors(tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut model = HashMap::new();
        let mut first_moments = BTreeMap::new();
        let mut second_moments = BTreeMap::new();
        let mut param_steps = BTreeMap::new();
        let mut step = None;
        let mut learning_rate = None;
        let mut epoch = None;

        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
                model.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(FIRST_MOMENT_PREFIX) {
                first_moments.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(SECOND_MOMENT_PREFIX) {
                second_moments.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(PARAM_STEP_PREFIX) {
                let t = scalar_i64(&tensor, &key)?;
                if t < 0 {
                    return Err(Error::format(format!("checkpoint entry '{key}' is negative")));
                }
                param_steps.insert(name.to_string(), t as usize);
            } else if key == STEP_KEY {
                step = Some(scalar_i64(&tensor, STEP_KEY)?);
            } else if key == LR_KEY {
                learning_rate = Some(scalar_f64(&tensor, LR_KEY)?);
            } else if key == EPOCH_KEY {
                epoch = Some(scalar_i64(&tensor, EPOCH_KEY)?);
            } else {
                return Err(Error::format(format!("unexpected checkpoint entry '{key}'")));
            }
        }

        let missing = |key: &str| Error::format(format!("checkpoint is missing '{key}'"));
        let step = step.ok_or_else(|| missing(STEP_KEY))?;
        let learning_rate = learning_rate.ok_or_else(|| missing(LR_KEY))?;
        let epoch = epoch.ok_or_else(|| missing(EPOCH_KEY))?;

        if step < 0 || epoch < 0 {
            return Err(Error::format("checkpoint counters must be non-negative"));
        }
        if model.is_empty() {
            return Err(Error::format("checkpoint holds no model parameters"));
        }

        Ok(Self {
            epoch: epoch as usize,
            model,
            optimizer: OptimizerState {
                step: step as usize,
                learning_rate,
                first_moments,
                second_moments,
                param_steps,
            },
        })
    }
}

fn scalar_i64(tensor: &Tensor, key: &str) -> Result<i64> {
    tensor
        .to_dtype(DType::I64)
        .and_then(|t| t.to_scalar::<i64>())
        .map_err(|e| Error::format(format!("checkpoint entry '{key}' is not a scalar: {e}")))
}

fn scalar_f64(tensor: &Tensor, key: &str) -> Result<f64> {
    tensor
        .to_dtype(DType::F64)
        .and_then(|t| t.to_scalar::<f64>())
        .map_err(|e| Error::format(format!("checkpoint entry '{key}' is not a scalar: {e}")))
}

/// Persists and restores checkpoints inside one directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the checkpoints
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the checkpoint directory if needed
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        debug!("Checkpoint directory ready: {}", self.dir.display());
        Ok(())
    }

    /// File name used for the checkpoint of `epoch`
    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.dir
            .join(format!("unet-epoch{epoch}.{CHECKPOINT_EXTENSION}"))
    }

    /// Save `checkpoint` under its epoch file name
    pub fn save_epoch(&self, checkpoint: Checkpoint) -> Result<PathBuf> {
        let path = self.checkpoint_path(checkpoint.epoch);
        Self::save(checkpoint, &path)?;
        Ok(path)
    }

    /// Serialize `checkpoint` to `path`, overwriting any existing file
    ///
    /// The parent directory must already exist.
    #[instrument(skip(checkpoint), fields(epoch = checkpoint.epoch))]
    pub fn save(checkpoint: Checkpoint, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if !parent.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("checkpoint directory {} does not exist", parent.display()),
            )));
        }

        let tensors = checkpoint.into_tensors()?;
        candle_core::safetensors::save(&tensors, path)?;
        info!("==> Saving checkpoint: {}", path.display());
        Ok(())
    }

    /// Read a checkpoint back
    ///
    /// The extension is checked before the file is touched.
    #[instrument]
    pub fn load(path: &Path) -> Result<Checkpoint> {
        if !has_checkpoint_extension(path) {
            return Err(Error::format(format!(
                "{} not valid checkpoint file type (expected: .{CHECKPOINT_EXTENSION})",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(Error::not_found(format!("checkpoint {}", path.display())));
        }

        let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
            Error::format(format!("cannot deserialize {}: {e}", path.display()))
        })?;
        let checkpoint = Checkpoint::from_tensors(tensors)?;

        info!(
            "==> Loading checkpoint: {} (epoch {})",
            path.display(),
            checkpoint.epoch
        );
        Ok(checkpoint)
    }

    /// Mark the trainable parameters for a fine-tuning run
    ///
    /// With `freeze` only the final layer stays trainable, otherwise every
    /// parameter is. Any optimizer must be rebound afterwards.
    pub fn apply_freeze_policy(params: &mut ParameterSet, freeze: bool) {
        if freeze {
            params.set_trainable_groups(&BTreeSet::from([ParamGroup::FinalLayer]));
        } else {
            params.set_all_trainable();
        }

        info!(
            "Freeze policy applied (freeze={}): {} of {} parameter elements trainable",
            freeze,
            params.num_trainable_elements(),
            params.num_elements()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("unet-epoch3.safetensors", true)]
    #[test_case("UNET.SAFETENSORS", true)]
    #[test_case("weights.pth.tar", false)]
    #[test_case("safetensors", false)]
    fn test_checkpoint_extension(path: &str, expected: bool) {
        assert_eq!(has_checkpoint_extension(Path::new(path)), expected);
    }

    #[test]
    fn test_checkpoint_path_is_epoch_unique() {
        let store = CheckpointStore::new("runs/x");
        assert_eq!(
            store.checkpoint_path(7),
            PathBuf::from("runs/x/unet-epoch7.safetensors")
        );
        assert_ne!(store.checkpoint_path(1), store.checkpoint_path(2));
    }

    #[test]
    fn test_wrong_extension_fails_before_reading() {
        // The file does not exist, so a NotFound here would mean IO happened first
        let result = CheckpointStore::load(Path::new("/nonexistent/model.pth.tar"));
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let result = CheckpointStore::load(Path::new("/nonexistent/model.safetensors"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_garbage_file_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.safetensors");
        fs::write(&path, b"not a checkpoint").unwrap();
        assert!(matches!(CheckpointStore::load(&path), Err(Error::Format(_))));
    }
}
