//! Throughput statistics over per-file transfer samples.

use serde::{Deserialize, Serialize};

/// Summary statistics of a throughput sample set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputEstimate {
    /// Arithmetic mean.
    pub mean: f64,
    /// Median; the mean of the two middle samples for even-sized sets.
    pub median: f64,
    /// Population standard deviation (divides by `n`).
    pub stdev: f64,
    /// Number of samples the estimate was computed from.
    pub samples: usize,
}

/// Estimate throughput from samples. Non-finite samples are ignored; `None`
/// when nothing remains.
pub fn estimate(samples: &[f64]) -> Option<ThroughputEstimate> {
    let mut values: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    let mid = values.len() / 2;
    let median = if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    };

    Some(ThroughputEstimate {
        mean,
        median,
        stdev: variance.sqrt(),
        samples: values.len(),
    })
}
