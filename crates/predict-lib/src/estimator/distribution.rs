//! Streaming distribution estimator
//!
//! Mean and variance use Welford's online algorithm. Quantiles come from a
//! decaying exponential histogram, clamped to the observed value range.

use super::histogram::{DecayingHistogram, HistogramCheckpoint, HistogramOptions};
use crate::error::PredictionError;
use crate::models::{ResourceName, Sample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Labelled quantile, e.g. "p99.9" -> 0.999
#[derive(Debug, Clone, PartialEq)]
pub struct Quantile {
    label: String,
    value: f64,
}

impl Quantile {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl FromStr for Quantile {
    type Err = PredictionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PredictionError::InvalidSpec(format!("invalid quantile label {s:?}"));
        let percent: f64 = s
            .strip_prefix('p')
            .ok_or_else(invalid)?
            .parse()
            .map_err(|_| invalid())?;
        if !(percent > 0.0 && percent <= 100.0) {
            return Err(invalid());
        }
        Ok(Self {
            label: s.to_string(),
            value: percent / 100.0,
        })
    }
}

impl fmt::Display for Quantile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Per-cycle weight multiplier for a half-life expressed in cycles
pub fn decay_factor(half_life_cycles: f64) -> f64 {
    if half_life_cycles.is_finite() && half_life_cycles > 0.0 {
        0.5_f64.powf(1.0 / half_life_cycles)
    } else {
        1.0
    }
}

/// Exportable estimator state. Loading it back reproduces the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionState {
    pub mean: f64,
    pub std_dev: f64,
    pub variance_sum: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub quantiles: BTreeMap<String, f64>,
    pub first_sample_start: Option<DateTime<Utc>>,
    pub last_sample_start: Option<DateTime<Utc>>,
    pub total_samples_count: u64,
    pub histogram: HistogramCheckpoint,
}

/// Distribution estimator for one (entry, resource) pair
#[derive(Debug, Clone)]
pub struct DistributionEstimator {
    quantiles: Vec<Quantile>,
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    first_sample_start: Option<DateTime<Utc>>,
    last_sample_start: Option<DateTime<Utc>>,
    histogram: DecayingHistogram,
}

impl DistributionEstimator {
    pub fn new(resource: ResourceName, quantiles: Vec<Quantile>) -> Self {
        Self::with_options(HistogramOptions::for_resource(resource), quantiles)
    }

    pub fn with_options(options: HistogramOptions, quantiles: Vec<Quantile>) -> Self {
        Self {
            quantiles,
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: 0.0,
            max: 0.0,
            first_sample_start: None,
            last_sample_start: None,
            histogram: DecayingHistogram::new(options),
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn set_quantiles(&mut self, quantiles: Vec<Quantile>) {
        self.quantiles = quantiles;
    }

    /// Fold one sample into the distribution. Order of ingestion does not
    /// affect the first/last sample timestamps.
    pub fn ingest(&mut self, sample: &Sample) {
        if !sample.value.is_finite() {
            return;
        }
        let value = sample.value;

        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);

        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        self.first_sample_start = Some(match self.first_sample_start {
            Some(t) => t.min(sample.timestamp),
            None => sample.timestamp,
        });
        self.last_sample_start = Some(match self.last_sample_start {
            Some(t) => t.max(sample.timestamp),
            None => sample.timestamp,
        });

        self.histogram.add_sample(value, 1.0);
    }

    /// Age the histogram weights; mean and count are lifetime figures
    pub fn decay(&mut self, factor: f64) {
        self.histogram.decay(factor);
    }

    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0).sqrt()
        }
    }

    /// Quantile from the histogram, kept inside the observed range. Once
    /// decay has emptied the histogram the mean stands in.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.histogram
            .quantile(q)
            .unwrap_or(self.mean)
            .clamp(self.min, self.max)
    }

    pub fn snapshot(&self) -> DistributionState {
        DistributionState {
            mean: self.mean,
            std_dev: self.std_dev(),
            variance_sum: self.m2,
            min_value: self.min,
            max_value: self.max,
            quantiles: self
                .quantiles
                .iter()
                .map(|q| (q.label.clone(), self.quantile(q.value)))
                .collect(),
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.count,
            histogram: self.histogram.checkpoint(),
        }
    }

    /// Replace internal state with a previously exported snapshot.
    /// Quantile labels stay as configured on this estimator.
    pub fn load_state(&mut self, state: &DistributionState) {
        self.count = state.total_samples_count;
        self.mean = state.mean;
        self.m2 = state.variance_sum;
        self.min = state.min_value;
        self.max = state.max_value;
        self.first_sample_start = state.first_sample_start;
        self.last_sample_start = state.last_sample_start;
        self.histogram = DecayingHistogram::from_checkpoint(&state.histogram);
    }
}
