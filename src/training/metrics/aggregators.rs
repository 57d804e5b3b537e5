//! Running metric accumulators
//!
//! Overlap metrics are composed from confusion counts summed over the whole
//! cycle (micro-averaging), not averaged over per-batch values. Class 0 is
//! background and never counts as a hit.

use candle_core::{DType, Tensor};

use super::MetricName;
use crate::error::{Error, Result};

/// Foreground confusion counts of a set of predictions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionCounts {
    /// Foreground pixels predicted correctly
    pub true_positives: u64,
    /// Pixels predicted as a wrong foreground class
    pub false_positives: u64,
    /// Foreground pixels predicted as anything else
    pub false_negatives: u64,
    /// Foreground pixels in the targets
    pub foreground: u64,
}

impl ConfusionCounts {
    /// Count predictions against targets of identical shape
    pub fn from_tensors(predictions: &Tensor, targets: &Tensor) -> Result<Self> {
        if predictions.dims() != targets.dims() {
            return Err(Error::shape_mismatch(targets.dims(), predictions.dims()));
        }

        let predictions = predictions.to_dtype(DType::U32)?;
        let targets = targets.to_dtype(DType::U32)?;

        let target_fg = targets.ne(0u32)?;
        let predicted_fg = predictions.ne(0u32)?;
        let hits = predictions.eq(&targets)?.mul(&target_fg)?;

        let true_positives = count(&hits)?;
        let foreground = count(&target_fg)?;
        let predicted = count(&predicted_fg)?;

        Ok(Self {
            true_positives,
            // a correct foreground prediction is the only non-zero prediction that is not an FP
            false_positives: predicted - true_positives,
            false_negatives: foreground - true_positives,
            foreground,
        })
    }

    /// Add another batch's counts
    pub fn add(&mut self, other: &ConfusionCounts) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.false_negatives += other.false_negatives;
        self.foreground += other.foreground;
    }

    /// TP / foreground
    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives, self.foreground)
    }

    /// 2TP / (2TP + FP + FN)
    pub fn dice(&self) -> f64 {
        let tp2 = 2 * self.true_positives;
        ratio(tp2, tp2 + self.false_positives + self.false_negatives)
    }

    /// TP / (TP + FP + FN)
    pub fn jaccard(&self) -> f64 {
        ratio(
            self.true_positives,
            self.true_positives + self.false_positives + self.false_negatives,
        )
    }
}

fn count(mask: &Tensor) -> Result<u64> {
    Ok(mask.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()? as u64)
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Everything an accumulator may consume from one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub loss: f64,
    pub counts: ConfusionCounts,
}

/// Stateful running statistic of one metric within one phase
pub trait MetricAccumulator: Send {
    /// Metric this accumulator produces
    fn name(&self) -> MetricName;

    /// Fold in one batch and return the value recorded for this step
    fn observe(&mut self, stats: &BatchStats) -> f64;

    /// Statistic accumulated since the last reset
    fn compute(&self) -> f64;

    /// Start a new cycle
    fn reset(&mut self);
}

/// Mean loss of the cycle; the recorded step value is the raw batch loss
#[derive(Debug, Clone, Default)]
pub struct LossAccumulator {
    sum: f64,
    count: usize,
}

impl MetricAccumulator for LossAccumulator {
    fn name(&self) -> MetricName {
        MetricName::Loss
    }

    fn observe(&mut self, stats: &BatchStats) -> f64 {
        self.sum += stats.loss;
        self.count += 1;
        stats.loss
    }

    fn compute(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

macro_rules! confusion_accumulator {
    ($(#[$doc:meta])* $name:ident, $metric:expr, $stat:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            counts: ConfusionCounts,
        }

        impl MetricAccumulator for $name {
            fn name(&self) -> MetricName {
                $metric
            }

            fn observe(&mut self, stats: &BatchStats) -> f64 {
                self.counts.add(&stats.counts);
                self.compute()
            }

            fn compute(&self) -> f64 {
                self.counts.$stat()
            }

            fn reset(&mut self) {
                self.counts = ConfusionCounts::default();
            }
        }
    };
}

confusion_accumulator!(
    /// Micro-averaged foreground pixel accuracy
    AccuracyAccumulator,
    MetricName::Accuracy,
    accuracy
);
confusion_accumulator!(
    /// Micro-averaged Dice score
    DiceAccumulator,
    MetricName::Dice,
    dice
);
confusion_accumulator!(
    /// Micro-averaged Jaccard index
    JaccardAccumulator,
    MetricName::Jaccard,
    jaccard
);

/// One fresh accumulator per metric
pub fn default_accumulators() -> Vec<Box<dyn MetricAccumulator>> {
    vec![
        Box::new(LossAccumulator::default()),
        Box::new(AccuracyAccumulator::default()),
        Box::new(DiceAccumulator::default()),
        Box::new(JaccardAccumulator::default()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn counts(predictions: &[u32], targets: &[u32]) -> ConfusionCounts {
        let device = Device::Cpu;
        let p = Tensor::new(predictions, &device).unwrap();
        let t = Tensor::new(targets, &device).unwrap();
        ConfusionCounts::from_tensors(&p, &t).unwrap()
    }

    #[test]
    fn test_background_is_ignored() {
        let c = counts(&[0, 0, 0, 0], &[0, 0, 0, 0]);
        assert_eq!(c, ConfusionCounts::default());
        assert_eq!(c.accuracy(), 0.0);
        assert_eq!(c.dice(), 0.0);
    }

    #[test]
    fn test_counts() {
        // hit, miss to background, wrong class, spurious foreground
        let c = counts(&[1, 0, 2, 3, 0], &[1, 2, 1, 0, 0]);
        assert_eq!(c.true_positives, 1);
        assert_eq!(c.false_positives, 2);
        assert_eq!(c.false_negatives, 2);
        assert_eq!(c.foreground, 3);

        assert_relative_eq!(c.accuracy(), 1.0 / 3.0);
        assert_relative_eq!(c.dice(), 2.0 / 6.0);
        assert_relative_eq!(c.jaccard(), 1.0 / 5.0);
    }

    #[test]
    fn test_shape_mismatch() {
        let device = Device::Cpu;
        let p = Tensor::zeros((2, 2), DType::U32, &device).unwrap();
        let t = Tensor::zeros((2, 3), DType::U32, &device).unwrap();
        assert!(matches!(
            ConfusionCounts::from_tensors(&p, &t),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_micro_average_is_not_mean_of_batches() {
        let mut acc = AccuracyAccumulator::default();
        let first = BatchStats {
            loss: 0.0,
            counts: counts(&[1, 1, 1, 1], &[1, 1, 1, 1]),
        };
        let second = BatchStats {
            loss: 0.0,
            counts: counts(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], &[1; 12]),
        };
        assert_eq!(acc.observe(&first), 1.0);
        assert_relative_eq!(acc.observe(&second), 4.0 / 16.0);

        acc.reset();
        assert_eq!(acc.compute(), 0.0);
    }

    #[test]
    fn test_loss_accumulator_records_raw_loss() {
        let mut acc = LossAccumulator::default();
        let stats = |loss| BatchStats {
            loss,
            counts: ConfusionCounts::default(),
        };
        assert_eq!(acc.observe(&stats(2.0)), 2.0);
        assert_eq!(acc.observe(&stats(4.0)), 4.0);
        assert_eq!(acc.compute(), 3.0);
    }
}
