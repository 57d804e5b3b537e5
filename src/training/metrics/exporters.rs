//! Metrics exporters for tabular files and charts
//!
//! Exporters are pure consumers of the long-form table.

use std::collections::BTreeMap;
use std::path::Path;

use plotters::prelude::*;

use super::{LongFormRow, MetricName, Phase};
use crate::error::{Error, Result};

/// Trait for metrics exporters
pub trait MetricsExporter {
    /// Exporter name
    fn name(&self) -> &str;

    /// Write `rows` to `path`
    fn export(&self, rows: &[LongFormRow], path: &Path) -> Result<()>;
}

/// CSV file with `Batch,Stage,Metric,Value` columns
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvExporter;

impl MetricsExporter for CsvExporter {
    fn name(&self) -> &str {
        "csv_exporter"
    }

    fn export(&self, rows: &[LongFormRow], path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        if rows.is_empty() {
            writer.write_record(["Batch", "Stage", "Metric", "Value"])?;
        }
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// SVG line chart: one colour per metric, solid training and dashed validation
#[derive(Debug, Clone)]
pub struct SvgChartExporter {
    /// Image size in pixels
    pub size: (u32, u32),
    /// Chart title
    pub caption: String,
}

impl Default for SvgChartExporter {
    fn default() -> Self {
        Self {
            size: (1200, 800),
            caption: "Training curves".to_string(),
        }
    }
}

fn metric_color(metric: MetricName) -> RGBColor {
    match metric {
        MetricName::Loss => RED,
        MetricName::Accuracy => BLUE,
        MetricName::Dice => GREEN,
        MetricName::Jaccard => MAGENTA,
    }
}

fn plot_error<E: std::fmt::Display>(e: E) -> Error {
    Error::plot(e.to_string())
}

impl MetricsExporter for SvgChartExporter {
    fn name(&self) -> &str {
        "svg_chart_exporter"
    }

    fn export(&self, rows: &[LongFormRow], path: &Path) -> Result<()> {
        let mut curves: BTreeMap<(Phase, MetricName), Vec<(f64, f64)>> = BTreeMap::new();
        for row in rows {
            curves
                .entry((row.phase, row.metric))
                .or_default()
                .push((row.step as f64, row.value));
        }

        let max_step = rows.iter().map(|r| r.step).max().unwrap_or(0).max(1) as f64;
        let (mut low, mut high) = rows
            .iter()
            .map(|r| r.value)
            .filter(|v| v.is_finite())
            .fold((0.0f64, 1.0f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let pad = (high - low) * 0.05;
        low -= pad;
        high += pad;

        let root = SVGBackend::new(path, self.size).into_drawing_area();
        root.fill(&WHITE).map_err(plot_error)?;

        let mut chart = ChartBuilder::on(&root)
            .caption(&self.caption, ("sans-serif", 28))
            .margin(20)
            .x_label_area_size(40)
            .y_label_area_size(60)
            .build_cartesian_2d(0f64..max_step, low..high)
            .map_err(plot_error)?;

        chart
            .configure_mesh()
            .x_desc("Batch")
            .y_desc("Value")
            .draw()
            .map_err(plot_error)?;

        for ((phase, metric), points) in curves {
            let color = metric_color(metric);
            let style = color.stroke_width(2);
            let label = format!("{} {}", phase, metric);

            let series = match phase {
                Phase::Training => chart
                    .draw_series(LineSeries::new(points, style))
                    .map_err(plot_error)?,
                Phase::Validation => chart
                    .draw_series(DashedLineSeries::new(points, 8u32, 6u32, style))
                    .map_err(plot_error)?,
            };
            series
                .label(label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(plot_error)?;

        root.present().map_err(plot_error)?;
        Ok(())
    }
}
