//! Training orchestrator for U-Net segmentation
//!
//! The trainer owns the model, optimizer, scaler and metrics engine for the
//! whole run and drives a synchronous epoch loop:
//!
//! ```text
//! Initialized -> Training -> ValidatingBatch | ValidatingFull
//!             -> Checkpointing (new best loss only) -> Training -> ...
//!             -> FinalValidation -> Done
//! ```
//!
//! The only cooperative stopping point is the boundary between epochs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::Device;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::{RunConfig, ValidationMode};
use crate::error::{Error, Result};
use crate::model::{EvalGuard, ModelMode, SegmentationModel, UNet, UNetConfig};
use crate::training::checkpoints::{Checkpoint, CheckpointStore};
use crate::training::data::{Batch, SampleSource};
use crate::training::loss::{argmax_classes, cross_entropy, loss_value, one_hot, pixel_accuracy};
use crate::training::metrics::{MetricName, MetricsEngine, Phase};
use crate::training::optimizers::{Adam, Optimizer};
use crate::training::scaler::{GradScaler, StepOutcome};

/// File name of the exported long-form metrics table
pub const METRICS_CSV: &str = "metrics.csv";

/// File name of the exported training curves chart
pub const CURVES_SVG: &str = "training_curves.svg";

/// File name of the serialized run report
pub const RUN_REPORT_JSON: &str = "run_report.json";

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingStatus {
    Initialized,
    Training,
    ValidatingBatch,
    ValidatingFull,
    Checkpointing,
    FinalValidation,
    Done,
}

/// Training state tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch
    pub epoch: usize,
    /// Training batches processed so far; the step index of every metric
    pub global_step: usize,
    /// Current orchestrator state
    pub status: TrainingStatus,
    /// Run start time
    pub start_time: DateTime<Utc>,
}

impl TrainingState {
    fn new() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            status: TrainingStatus::Initialized,
            start_time: Utc::now(),
        }
    }
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    StatusChanged { status: TrainingStatus },
    StepSkipped { step: usize },
    EpochCompleted { summary: EpochSummary },
    CheckpointSaved { epoch: usize, path: PathBuf },
    StopRequested { epoch: usize },
}

/// Best validation loss seen in the run
#[derive(Debug, Clone, Copy)]
pub struct BestLossTracker {
    best: f64,
}

impl Default for BestLossTracker {
    fn default() -> Self {
        Self { best: f64::INFINITY }
    }
}

impl BestLossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `loss`; true when it is strictly below every earlier loss
    pub fn observe(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            true
        } else {
            false
        }
    }

    /// Best loss so far, if any finite loss was observed
    pub fn best(&self) -> Option<f64> {
        self.best.is_finite().then_some(self.best)
    }
}

/// Cooperative stop request checked between epochs
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the trainer to stop after the current epoch
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a validation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    /// Mean batch loss
    pub loss: f64,
    /// Mean batch pixel accuracy, background included
    pub accuracy: f64,
    /// Batches evaluated
    pub batches: usize,
    /// Validation accumulators at the end of the pass
    pub metrics: BTreeMap<MetricName, f64>,
}

/// Per-epoch record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Mean training loss of the epoch
    pub train_loss: f64,
    /// Mean training pixel accuracy of the epoch
    pub train_accuracy: f64,
    /// Optimizer steps skipped by the scaler during the epoch
    pub skipped_steps: usize,
    pub validation: ValidationSummary,
    /// Checkpoint written after this epoch
    pub checkpoint: Option<PathBuf>,
}

/// Outcome of a complete run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub epochs_completed: usize,
    pub epochs: Vec<EpochSummary>,
    /// Checkpoints written, in order
    pub checkpoints: Vec<PathBuf>,
    pub best_loss: Option<f64>,
    /// Full validation pass after the last epoch
    pub final_validation: ValidationSummary,
    pub global_steps: usize,
    pub skipped_steps: usize,
    /// Whether a stop request ended the epoch loop
    pub stopped_early: bool,
    pub metrics_csv: Option<PathBuf>,
    pub curves_svg: Option<PathBuf>,
    pub duration: Duration,
}

impl RunReport {
    /// Write the report as pretty-printed JSON
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!("Run report written to {}", path.display());
        Ok(())
    }
}

/// Loss and accuracy of one processed batch
struct BatchOutcome {
    loss: f64,
    accuracy: f64,
}

/// Training orchestrator
pub struct UNetTrainer<M: SegmentationModel> {
    config: RunConfig,
    model: M,
    optimizer: Adam,
    scaler: GradScaler,
    metrics: MetricsEngine,
    store: CheckpointStore,
    best_loss: BestLossTracker,
    train_source: Box<dyn SampleSource>,
    val_source: Box<dyn SampleSource>,
    device: Device,
    state: TrainingState,
    stop: StopHandle,
    event_tx: Option<mpsc::Sender<TrainingEvent>>,
}

impl UNetTrainer<UNet> {
    /// Validate `config`, build a fresh U-Net and the trainer around it
    pub fn from_config(
        config: RunConfig,
        train_source: Box<dyn SampleSource>,
        val_source: Box<dyn SampleSource>,
    ) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        let model = UNet::new(UNetConfig::from_run_config(&config), &device)?;
        Self::new(config, model, train_source, val_source, device)
    }
}

impl<M: SegmentationModel> UNetTrainer<M> {
    /// Create a new trainer instance
    ///
    /// When a checkpoint is configured it is loaded, the freeze policy is
    /// applied and the optimizer is rebound, in that order, before the
    /// trainer is returned. The configured learning rate replaces the one
    /// stored in the checkpoint.
    #[instrument(skip_all)]
    pub fn new(
        config: RunConfig,
        mut model: M,
        train_source: Box<dyn SampleSource>,
        val_source: Box<dyn SampleSource>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;

        let mut optimizer = Adam::new(model.parameters(), config.learning_rate, config.adam.clone())?;
        let scaler = GradScaler::new(config.scaler.clone());

        let store = CheckpointStore::new(&config.checkpoint_dir);
        store.ensure_dir()?;

        if let Some(path) = &config.checkpoint_path {
            let checkpoint = CheckpointStore::load(path)?;
            checkpoint.restore(model.parameters_mut(), &mut optimizer)?;
            CheckpointStore::apply_freeze_policy(model.parameters_mut(), config.freeze);
            optimizer.rebind(model.parameters());

            // The configured rate wins over the one stored with the optimizer
            if optimizer.learning_rate() != config.learning_rate {
                info!(
                    "Overriding checkpoint learning rate {} with {}",
                    optimizer.learning_rate(),
                    config.learning_rate
                );
            }
            optimizer.set_learning_rate(config.learning_rate);
        }

        if config.pin_memory {
            info!("pin_memory requested; batches are staged directly on {:?}", device);
        }

        let params = model.parameters();
        info!(
            "Model parameters: {} total, {} trainable",
            params.num_elements(),
            params.num_trainable_elements()
        );
        for (group, (total, trainable)) in params.group_summary() {
            debug!("  {}: {} elements ({} trainable)", group, total, trainable);
        }

        Ok(Self {
            config,
            model,
            optimizer,
            scaler,
            metrics: MetricsEngine::new(),
            store,
            best_loss: BestLossTracker::new(),
            train_source,
            val_source,
            device,
            state: TrainingState::new(),
            stop: StopHandle::default(),
            event_tx: None,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::Sender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Handle for requesting a stop between epochs
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn metrics(&self) -> &MetricsEngine {
        &self.metrics
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss.best()
    }

    /// Directory receiving checkpoints and exports
    pub fn checkpoint_dir(&self) -> &Path {
        self.store.dir()
    }

    /// Switch between final-layer fine-tuning and full training
    ///
    /// Applies the freeze policy and rebinds the optimizer in one step.
    pub fn set_freeze(&mut self, freeze: bool) {
        CheckpointStore::apply_freeze_policy(self.model.parameters_mut(), freeze);
        self.optimizer.rebind(self.model.parameters());
    }

    /// Run every epoch, the final validation and the metrics export
    #[instrument(skip(self), fields(epochs = self.config.num_epochs))]
    pub fn run(&mut self) -> Result<RunReport> {
        let started = Instant::now();
        let num_epochs = self.config.num_epochs;
        info!("Starting training for {} epochs on {:?}", num_epochs, self.device);

        let mut epochs = Vec::with_capacity(num_epochs);
        let mut checkpoints = Vec::new();
        let mut stopped_early = false;

        for epoch in 0..num_epochs {
            if self.stop.is_stop_requested() {
                info!("Stop requested, ending training before epoch {}", epoch + 1);
                self.send_event(TrainingEvent::StopRequested { epoch });
                stopped_early = true;
                break;
            }
            self.state.epoch = epoch;
            self.ensure_optimizer_binding()?;

            let skipped_before = self.scaler.skipped_steps();
            let (train_loss, train_accuracy) = self.train_epoch(epoch)?;

            let validation = match self.config.validation_mode {
                ValidationMode::FirstBatch => {
                    self.set_status(TrainingStatus::ValidatingBatch);
                    self.validate_first_batch()?
                }
                ValidationMode::Full => {
                    self.set_status(TrainingStatus::ValidatingFull);
                    self.validate_full()?
                }
            };
            info!(
                "Epoch {}/{} validation - Loss: {:.4}, Acc: {:.2}%",
                epoch + 1,
                num_epochs,
                validation.loss,
                validation.accuracy * 100.0
            );

            let checkpoint = self.checkpoint_if_best(epoch, validation.loss)?;
            checkpoints.extend(checkpoint.clone());

            let summary = EpochSummary {
                epoch,
                train_loss,
                train_accuracy,
                skipped_steps: self.scaler.skipped_steps() - skipped_before,
                validation,
                checkpoint,
            };
            self.send_event(TrainingEvent::EpochCompleted {
                summary: summary.clone(),
            });
            epochs.push(summary);
        }

        self.set_status(TrainingStatus::FinalValidation);
        let final_validation = self.validate_full()?;
        info!(
            "Final validation over {} batches - Loss: {:.4}, Acc: {:.2}%",
            final_validation.batches,
            final_validation.loss,
            final_validation.accuracy * 100.0
        );

        let (metrics_csv, curves_svg) = self.export_metrics()?;
        self.set_status(TrainingStatus::Done);

        Ok(RunReport {
            epochs_completed: epochs.len(),
            epochs,
            checkpoints,
            best_loss: self.best_loss.best(),
            final_validation,
            global_steps: self.state.global_step,
            skipped_steps: self.scaler.skipped_steps(),
            stopped_early,
            metrics_csv,
            curves_svg,
            duration: started.elapsed(),
        })
    }

    /// One pass over the training source; returns mean loss and accuracy
    fn train_epoch(&mut self, epoch: usize) -> Result<(f64, f64)> {
        self.set_status(TrainingStatus::Training);
        self.model.set_mode(ModelMode::Training);
        self.metrics.set_phase(Phase::Training);
        self.metrics.reset_phase_cycle(Phase::Training);

        let progress = progress_bar(self.train_source.num_batches());
        let num_epochs = self.config.num_epochs;
        let mut loss_sum = 0.0;
        let mut accuracy_sum = 0.0;
        let mut batches = 0usize;

        for batch in self.train_source.batches()? {
            let batch = batch?;
            let step = self.state.global_step;

            let outcome = train_step(
                &self.model,
                &mut self.optimizer,
                &mut self.scaler,
                &batch,
                &self.device,
            )?;

            if outcome.skipped {
                if let Some(tx) = &self.event_tx {
                    let _ = tx.send(TrainingEvent::StepSkipped { step });
                }
            }

            if outcome.loss.is_finite() {
                self.metrics
                    .update(step, outcome.loss, &outcome.predictions, &outcome.labels)?;
                loss_sum += outcome.loss;
                accuracy_sum += outcome.accuracy;
                batches += 1;
            } else {
                warn!("Non-finite training loss at step {}, batch left out of metrics", step);
            }

            self.state.global_step += 1;
            progress.inc(1);
            progress.set_message(format!(
                "Epoch: {}/{} - Loss: {:.2}, Acc: {:.2}%",
                epoch + 1,
                num_epochs,
                outcome.loss,
                outcome.accuracy * 100.0
            ));
        }
        progress.finish_and_clear();

        if batches == 0 {
            return Ok((f64::NAN, 0.0));
        }
        Ok((loss_sum / batches as f64, accuracy_sum / batches as f64))
    }

    /// Validate on the first batch of the validation source
    ///
    /// The model is in evaluation mode only for the duration of the pass.
    pub fn validate_first_batch(&mut self) -> Result<ValidationSummary> {
        let batch = self.val_source.first_batch()?;
        let step = self.state.global_step;

        self.metrics.set_phase(Phase::Validation);
        self.metrics.reset_phase_cycle(Phase::Validation);

        let result = {
            let model = EvalGuard::new(&mut self.model);
            evaluate_batch(&*model, &mut self.metrics, step, &batch, &self.device)
        };
        self.metrics.set_phase(Phase::Training);
        let outcome = result?;

        Ok(ValidationSummary {
            loss: outcome.loss,
            accuracy: outcome.accuracy,
            batches: 1,
            metrics: self.validation_metrics(),
        })
    }

    /// Validate on the whole validation source
    pub fn validate_full(&mut self) -> Result<ValidationSummary> {
        let step = self.state.global_step;
        self.metrics.set_phase(Phase::Validation);
        self.metrics.reset_phase_cycle(Phase::Validation);

        let progress = progress_bar(self.val_source.num_batches());
        let result = {
            let model = EvalGuard::new(&mut self.model);
            validation_sweep(
                &*model,
                self.val_source.as_mut(),
                &mut self.metrics,
                step,
                &self.device,
                &progress,
            )
        };
        progress.finish_and_clear();
        self.metrics.set_phase(Phase::Training);

        let (loss_sum, accuracy_sum, batches) = result?;
        if batches == 0 {
            return Err(Error::invalid_input("validation source yielded no batches"));
        }

        Ok(ValidationSummary {
            loss: loss_sum / batches as f64,
            accuracy: accuracy_sum / batches as f64,
            batches,
            metrics: self.validation_metrics(),
        })
    }

    fn validation_metrics(&self) -> BTreeMap<MetricName, f64> {
        self.metrics
            .compute()
            .remove(&Phase::Validation)
            .unwrap_or_default()
    }

    /// Save a checkpoint when `loss` improves on the best loss so far
    fn checkpoint_if_best(&mut self, epoch: usize, loss: f64) -> Result<Option<PathBuf>> {
        if !self.best_loss.observe(loss) {
            debug!("Validation loss {:.4} did not improve, no checkpoint", loss);
            return Ok(None);
        }
        info!("New best validation loss {:.4} at epoch {}", loss, epoch + 1);

        if self.config.debug {
            debug!("Debug mode, checkpoint write suppressed");
            return Ok(None);
        }

        self.set_status(TrainingStatus::Checkpointing);
        let checkpoint = Checkpoint::capture(epoch, self.model.parameters(), &self.optimizer);
        let path = self.store.save_epoch(checkpoint)?;
        self.send_event(TrainingEvent::CheckpointSaved {
            epoch,
            path: path.clone(),
        });
        Ok(Some(path))
    }

    fn ensure_optimizer_binding(&self) -> Result<()> {
        if self.optimizer.is_bound_to(self.model.parameters()) {
            Ok(())
        } else {
            Err(Error::internal(
                "optimizer is not bound to the trainable parameter set",
            ))
        }
    }

    /// Write the metrics table and chart into the checkpoint directory
    fn export_metrics(&self) -> Result<(Option<PathBuf>, Option<PathBuf>)> {
        let csv_path = self.store.dir().join(METRICS_CSV);
        self.metrics.export_csv(&csv_path)?;

        let svg_path = self.store.dir().join(CURVES_SVG);
        let svg_path = match self.metrics.plot(&svg_path) {
            Ok(()) => Some(svg_path),
            Err(e) => {
                warn!("Could not render training curves: {}", e);
                None
            }
        };

        Ok((Some(csv_path), svg_path))
    }

    fn set_status(&mut self, status: TrainingStatus) {
        if self.state.status != status {
            debug!("Trainer state {:?} -> {:?}", self.state.status, status);
            self.state.status = status;
            self.send_event(TrainingEvent::StatusChanged { status });
        }
    }

    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            // A dropped receiver only means nobody is listening
            let _ = tx.send(event);
        }
    }
}

/// Result of one training step
struct TrainStepOutcome {
    loss: f64,
    accuracy: f64,
    skipped: bool,
    predictions: candle_core::Tensor,
    labels: candle_core::Tensor,
}

/// Forward, scaled backward and optimizer step on one batch
fn train_step<M: SegmentationModel>(
    model: &M,
    optimizer: &mut Adam,
    scaler: &mut GradScaler,
    batch: &Batch,
    device: &Device,
) -> Result<TrainStepOutcome> {
    let inputs = batch.inputs.to_device(device)?;
    let labels = batch.labels.to_device(device)?;

    let logits = model.forward(&inputs)?;
    let targets = one_hot(&labels, model.num_classes())?;
    let loss = cross_entropy(&logits, &targets)?;

    let grads = scaler.scale(&loss)?.backward()?;
    let skipped = scaler.step(optimizer, &grads)? == StepOutcome::Skipped;
    scaler.update();

    let predictions = argmax_classes(&logits)?;
    let accuracy = pixel_accuracy(&predictions, &labels)?;

    Ok(TrainStepOutcome {
        loss: loss_value(&loss)?,
        accuracy,
        skipped,
        predictions,
        labels,
    })
}

/// Loss, predictions and metrics of one validation batch
fn evaluate_batch<M: SegmentationModel + ?Sized>(
    model: &M,
    metrics: &mut MetricsEngine,
    step: usize,
    batch: &Batch,
    device: &Device,
) -> Result<BatchOutcome> {
    let inputs = batch.inputs.to_device(device)?;
    let labels = batch.labels.to_device(device)?;

    let logits = model.forward(&inputs)?.detach();
    let targets = one_hot(&labels, model.num_classes())?;
    let loss = loss_value(&cross_entropy(&logits, &targets)?)?;
    let predictions = argmax_classes(&logits)?;

    metrics.update(step, loss, &predictions, &labels)?;
    let accuracy = pixel_accuracy(&predictions, &labels)?;

    Ok(BatchOutcome { loss, accuracy })
}

/// Evaluate every batch of `source`; returns loss sum, accuracy sum and batch count
fn validation_sweep<M: SegmentationModel + ?Sized>(
    model: &M,
    source: &mut dyn SampleSource,
    metrics: &mut MetricsEngine,
    step: usize,
    device: &Device,
    progress: &ProgressBar,
) -> Result<(f64, f64, usize)> {
    let mut loss_sum = 0.0;
    let mut accuracy_sum = 0.0;
    let mut batches = 0usize;

    for batch in source.batches()? {
        let outcome = evaluate_batch(model, metrics, step, &batch?, device)?;
        loss_sum += outcome.loss;
        accuracy_sum += outcome.accuracy;
        batches += 1;

        progress.inc(1);
        progress.set_message(format!(
            "Validation - Loss: {:.2}, Acc: {:.2}%",
            outcome.loss,
            outcome.accuracy * 100.0
        ));
    }

    Ok((loss_sum, accuracy_sum, batches))
}

fn progress_bar(len: usize) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▇▆▅▄▃▂▁  ");
    bar.set_style(style);
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_loss_tracker_sequence() {
        let mut tracker = BestLossTracker::new();
        assert_eq!(tracker.best(), None);

        let saved: Vec<usize> = [5.0, 3.0, 4.0, 2.0]
            .iter()
            .enumerate()
            .filter(|(_, &loss)| tracker.observe(loss))
            .map(|(epoch, _)| epoch)
            .collect();
        assert_eq!(saved, vec![0, 1, 3]);
        assert_eq!(tracker.best(), Some(2.0));
    }

    #[test]
    fn test_equal_or_nan_loss_is_not_an_improvement() {
        let mut tracker = BestLossTracker::new();
        assert!(tracker.observe(1.0));
        assert!(!tracker.observe(1.0));
        assert!(!tracker.observe(f64::NAN));
    }

    #[test]
    fn test_run_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RUN_REPORT_JSON);
        let report = RunReport {
            epochs_completed: 0,
            epochs: Vec::new(),
            checkpoints: Vec::new(),
            best_loss: None,
            final_validation: ValidationSummary {
                loss: 0.5,
                accuracy: 0.75,
                batches: 1,
                metrics: BTreeMap::from([(MetricName::Dice, 0.25)]),
            },
            global_steps: 0,
            skipped_steps: 0,
            stopped_early: true,
            metrics_csv: None,
            curves_svg: None,
            duration: Duration::from_millis(10),
        };
        report.save_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["stopped_early"], true);
        assert_eq!(value["final_validation"]["metrics"]["Dice Score"], 0.25);
    }

    #[test]
    fn test_stop_handle_is_shared() {
        let handle = StopHandle::default();
        let clone = handle.clone();
        clone.request_stop();
        assert!(handle.is_stop_requested());
    }
}
