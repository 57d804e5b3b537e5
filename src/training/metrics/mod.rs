//! Phase-scoped metrics for segmentation training
//!
//! Every observation belongs to a [`Phase`] and a [`MetricName`]. Each pair
//! owns an append-only [`MetricSeries`] used for export and charting, and a
//! [`MetricAccumulator`] whose running statistic is reset at the start of a
//! training epoch or validation sweep. Nothing recorded under one phase is
//! visible to the other.

pub mod aggregators;
pub mod exporters;
pub mod tracker;

pub use aggregators::{
    AccuracyAccumulator, BatchStats, ConfusionCounts, DiceAccumulator, JaccardAccumulator,
    LossAccumulator, MetricAccumulator,
};
pub use exporters::{CsvExporter, MetricsExporter, SvgChartExporter};
pub use tracker::MetricsEngine;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Training or validation partition of the metric state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Training,
    Validation,
}

impl Phase {
    /// Both phases in table order
    pub const ALL: [Phase; 2] = [Phase::Training, Phase::Validation];

    /// Label used in exported tables
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Training => "Training",
            Phase::Validation => "Validation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Closed set of tracked metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetricName {
    Loss,
    Accuracy,
    #[serde(rename = "Dice Score")]
    Dice,
    #[serde(rename = "Jaccard Index")]
    Jaccard,
}

impl MetricName {
    /// Every metric in table order
    pub const ALL: [MetricName; 4] = [
        MetricName::Loss,
        MetricName::Accuracy,
        MetricName::Dice,
        MetricName::Jaccard,
    ];

    /// Label used in exported tables
    pub fn label(&self) -> &'static str {
        match self {
            MetricName::Loss => "Loss",
            MetricName::Accuracy => "Accuracy",
            MetricName::Dice => "Dice Score",
            MetricName::Jaccard => "Jaccard Index",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered `(step, value)` observations of one phase and metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    points: Vec<(usize, f64)>,
}

impl MetricSeries {
    /// Append an observation
    ///
    /// Steps may repeat or skip ahead but never go backwards.
    pub fn push(&mut self, step: usize, value: f64) -> Result<()> {
        self.check_step(step)?;
        self.points.push((step, value));
        Ok(())
    }

    /// Fail if `step` would go backwards
    pub fn check_step(&self, step: usize) -> Result<()> {
        match self.last_step() {
            Some(last) if step < last => Err(Error::invalid_input(format!(
                "step {step} precedes last recorded step {last}"
            ))),
            _ => Ok(()),
        }
    }

    /// Step of the most recent observation
    pub fn last_step(&self) -> Option<usize> {
        self.points.last().map(|&(step, _)| step)
    }

    /// Most recent value
    pub fn last_value(&self) -> Option<f64> {
        self.points.last().map(|&(_, value)| value)
    }

    /// All observations in insertion order
    pub fn points(&self) -> &[(usize, f64)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One row of the long-form metrics table
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LongFormRow {
    #[serde(rename = "Batch")]
    pub step: usize,
    #[serde(rename = "Stage")]
    pub phase: Phase,
    #[serde(rename = "Metric")]
    pub metric: MetricName,
    #[serde(rename = "Value")]
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(Phase::Validation.to_string(), "Validation");
        assert_eq!(MetricName::Dice.to_string(), "Dice Score");
        assert_eq!(MetricName::Jaccard.label(), "Jaccard Index");
    }

    #[test]
    fn test_series_steps_never_go_backwards() {
        let mut series = MetricSeries::default();
        series.push(0, 1.0).unwrap();
        series.push(0, 0.9).unwrap();
        series.push(5, 0.8).unwrap();
        assert!(series.push(4, 0.7).is_err());
        assert_eq!(series.len(), 3);
        assert_eq!(series.last_value(), Some(0.8));
    }
}
