//! Metrics engine coordinating per-phase series and accumulators

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::Tensor;
use tracing::{debug, info};

use super::aggregators::{default_accumulators, BatchStats, ConfusionCounts, MetricAccumulator};
use super::exporters::{CsvExporter, MetricsExporter, SvgChartExporter};
use super::{LongFormRow, MetricName, MetricSeries, Phase};
use crate::error::{Error, Result};

/// Series and accumulators owned by one phase
struct PhaseState {
    accumulators: BTreeMap<MetricName, Box<dyn MetricAccumulator>>,
    series: BTreeMap<MetricName, MetricSeries>,
}

impl PhaseState {
    fn new() -> Self {
        let accumulators = default_accumulators()
            .into_iter()
            .map(|acc| (acc.name(), acc))
            .collect();
        let series = MetricName::ALL
            .iter()
            .map(|&metric| (metric, MetricSeries::default()))
            .collect();
        Self {
            accumulators,
            series,
        }
    }
}

/// Phase-scoped metrics engine
pub struct MetricsEngine {
    active: Phase,
    phases: BTreeMap<Phase, PhaseState>,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsEngine {
    /// Engine with every metric registered for both phases, Training active
    pub fn new() -> Self {
        Self {
            active: Phase::Training,
            phases: Phase::ALL
                .iter()
                .map(|&phase| (phase, PhaseState::new()))
                .collect(),
        }
    }

    /// Phase receiving subsequent updates
    pub fn phase(&self) -> Phase {
        self.active
    }

    /// Switch the active phase; accumulators are left untouched
    pub fn set_phase(&mut self, phase: Phase) {
        self.active = phase;
    }

    /// Reset the accumulators of `phase` at an epoch or sweep boundary
    ///
    /// Recorded series are kept.
    pub fn reset_phase_cycle(&mut self, phase: Phase) {
        if let Some(state) = self.phases.get_mut(&phase) {
            for acc in state.accumulators.values_mut() {
                acc.reset();
            }
        }
        debug!("Reset {} metric cycle", phase);
    }

    /// Record one batch under the active phase
    ///
    /// `predictions` and `targets` hold one class index per pixel and must
    /// have the same shape. Every check runs before any state changes, so a
    /// rejected batch leaves earlier observations intact. Returns the value
    /// appended to each series.
    pub fn update(
        &mut self,
        step: usize,
        loss: f64,
        predictions: &Tensor,
        targets: &Tensor,
    ) -> Result<BTreeMap<MetricName, f64>> {
        let counts = ConfusionCounts::from_tensors(predictions, targets)?;
        if !loss.is_finite() {
            return Err(Error::invalid_input(format!("non-finite loss {loss}")));
        }

        let state = self
            .phases
            .get_mut(&self.active)
            .ok_or_else(|| Error::internal(format!("no metric state for {}", self.active)))?;
        for series in state.series.values() {
            series.check_step(step)?;
        }

        let stats = BatchStats { loss, counts };
        let mut recorded = BTreeMap::new();
        for (&metric, acc) in state.accumulators.iter_mut() {
            let value = acc.observe(&stats);
            state.series.entry(metric).or_default().push(step, value)?;
            recorded.insert(metric, value);
        }

        Ok(recorded)
    }

    /// Current cycle statistic of every metric, per phase
    pub fn compute(&self) -> BTreeMap<Phase, BTreeMap<MetricName, f64>> {
        self.phases
            .iter()
            .map(|(&phase, state)| {
                let values = state
                    .accumulators
                    .iter()
                    .map(|(&metric, acc)| (metric, acc.compute()))
                    .collect();
                (phase, values)
            })
            .collect()
    }

    /// Current cycle statistic of one metric
    pub fn value(&self, phase: Phase, metric: MetricName) -> f64 {
        self.phases
            .get(&phase)
            .and_then(|state| state.accumulators.get(&metric))
            .map_or(0.0, |acc| acc.compute())
    }

    /// Mean loss of the current cycle of `phase`
    pub fn mean_loss(&self, phase: Phase) -> f64 {
        self.value(phase, MetricName::Loss)
    }

    /// Recorded series of one phase and metric
    pub fn series(&self, phase: Phase, metric: MetricName) -> Option<&MetricSeries> {
        self.phases.get(&phase)?.series.get(&metric)
    }

    /// Number of recorded observations across both phases
    pub fn num_observations(&self) -> usize {
        self.phases
            .values()
            .flat_map(|state| state.series.values())
            .map(MetricSeries::len)
            .sum()
    }

    /// Flatten every series into `(step, phase, metric, value)` rows
    ///
    /// Rows are grouped by phase, then metric, then insertion order.
    pub fn to_long_form_table(&self) -> Vec<LongFormRow> {
        let mut rows = Vec::with_capacity(self.num_observations());
        for (&phase, state) in &self.phases {
            for (&metric, series) in &state.series {
                rows.extend(series.points().iter().map(|&(step, value)| LongFormRow {
                    step,
                    phase,
                    metric,
                    value,
                }));
            }
        }
        rows
    }

    /// Write the long-form table as CSV
    pub fn export_csv(&self, path: &Path) -> Result<()> {
        self.export_with(&CsvExporter, path)
    }

    /// Render the curves of every series as an SVG line chart
    pub fn plot(&self, path: &Path) -> Result<()> {
        self.export_with(&SvgChartExporter::default(), path)
    }

    fn export_with(&self, exporter: &dyn MetricsExporter, path: &Path) -> Result<()> {
        let rows = self.to_long_form_table();
        exporter.export(&rows, path)?;
        info!(
            "Exported {} metric rows with {} to {}",
            rows.len(),
            exporter.name(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn batch(values: &[u32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_update_records_every_metric() {
        let mut engine = MetricsEngine::new();
        let recorded = engine
            .update(0, 0.5, &batch(&[1, 2, 0]), &batch(&[1, 1, 0]))
            .unwrap();

        assert_eq!(recorded.len(), MetricName::ALL.len());
        assert_eq!(recorded[&MetricName::Loss], 0.5);
        assert_eq!(recorded[&MetricName::Accuracy], 0.5);
        assert_eq!(engine.num_observations(), 4);
        assert!(engine.series(Phase::Validation, MetricName::Loss).unwrap().is_empty());
    }

    #[test]
    fn test_rejected_batch_leaves_state_untouched() {
        let mut engine = MetricsEngine::new();
        engine.update(3, 1.0, &batch(&[1, 1]), &batch(&[1, 1])).unwrap();
        let before = engine.compute();

        let mismatch = engine.update(4, 1.0, &batch(&[1, 1, 1]), &batch(&[1, 1]));
        assert!(matches!(mismatch, Err(Error::ShapeMismatch { .. })));
        assert!(engine.update(2, 1.0, &batch(&[1]), &batch(&[1])).is_err());
        assert!(engine.update(5, f64::NAN, &batch(&[1]), &batch(&[1])).is_err());

        assert_eq!(engine.compute(), before);
        assert_eq!(engine.num_observations(), 4);
    }

    #[test]
    fn test_reset_phase_cycle_keeps_series() {
        let mut engine = MetricsEngine::new();
        engine.update(0, 2.0, &batch(&[1]), &batch(&[1])).unwrap();
        engine.reset_phase_cycle(Phase::Training);

        assert_eq!(engine.mean_loss(Phase::Training), 0.0);
        assert_eq!(engine.value(Phase::Training, MetricName::Dice), 0.0);
        assert_eq!(engine.num_observations(), 4);
    }
}
