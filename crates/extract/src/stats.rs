//! Per-band zonal statistics
//!
//! All accumulation is done in `f64` whatever the source pixel type. Pixels
//! are visited in row-major order, so results are bit-identical whichever
//! work unit produced the block.

use ndarray::{ArrayView2, ArrayView3, Axis, Zip};
use serde::Serialize;

use crate::config::Statistic;

/// Streaming mean/variance/min/max accumulator (Welford's algorithm).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Population variance
    pub fn variance(&self) -> Option<f64> {
        (self.count > 0).then(|| self.m2 / self.count as f64)
    }

    /// Population standard deviation
    pub fn std(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

/// Statistics of one band over one feature's valid pixels.
///
/// Every value is `None` when no pixel was valid; `count` is then 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandStatistics {
    pub label: String,
    pub count: u64,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Requested ranks (median = 50) and their values
    pub percentiles: Vec<(f64, Option<f64>)>,
    /// Valid pixel values in row-major order, when raw output is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<f64>>,
}

impl BandStatistics {
    /// All-null statistics for a band
    pub fn empty(label: impl Into<String>, statistics: &[Statistic]) -> Self {
        Self {
            label: label.into(),
            count: 0,
            mean: None,
            std: None,
            min: None,
            max: None,
            percentiles: statistics
                .iter()
                .filter_map(Statistic::rank)
                .map(|p| (p, None))
                .collect(),
            raw: None,
        }
    }

    /// Value of a statistic; `Count` is never null
    pub fn value(&self, stat: &Statistic) -> Option<f64> {
        match stat {
            Statistic::Mean => self.mean,
            Statistic::Std => self.std,
            Statistic::Min => self.min,
            Statistic::Max => self.max,
            Statistic::Count => Some(self.count as f64),
            Statistic::Median | Statistic::Percentile(_) => {
                let rank = stat.rank()?;
                self.percentiles
                    .iter()
                    .find(|(p, _)| *p == rank)
                    .and_then(|(_, v)| *v)
            }
        }
    }
}

/// Aggregate every band of `data` (bands, rows, cols) over the pixels where
/// `valid` is true.
///
/// `labels` names the bands in order. Percentiles are only computed when
/// requested; raw values are kept when `return_raw` is set.
pub fn aggregate(
    data: ArrayView3<'_, f64>,
    valid: ArrayView2<'_, bool>,
    labels: &[String],
    statistics: &[Statistic],
    return_raw: bool,
) -> Vec<BandStatistics> {
    let ranks: Vec<f64> = statistics.iter().filter_map(Statistic::rank).collect();
    let keep_values = return_raw || !ranks.is_empty();

    data.axis_iter(Axis(0))
        .zip(labels)
        .map(|(band, label)| {
            let mut running = RunningStats::new();
            let mut values = Vec::new();

            Zip::from(&band).and(&valid).for_each(|&v, &ok| {
                if ok {
                    running.push(v);
                    if keep_values {
                        values.push(v);
                    }
                }
            });

            let percentiles = if ranks.is_empty() {
                Vec::new()
            } else {
                let mut sorted = values.clone();
                sorted.sort_by(f64::total_cmp);
                ranks.iter().map(|&p| (p, percentile(&sorted, p))).collect()
            };

            BandStatistics {
                label: label.clone(),
                count: running.count(),
                mean: running.mean(),
                std: running.std(),
                min: running.min(),
                max: running.max(),
                percentiles,
                raw: return_raw.then_some(values),
            }
        })
        .collect()
}

/// Percentile of sorted values, linear interpolation between closest ranks.
///
/// `p` is in `[0, 100]`; an empty slice yields `None`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
