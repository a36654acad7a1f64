//! Decaying exponential histogram

use crate::models::ResourceName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Growth ratio between consecutive bucket widths
pub const DEFAULT_BUCKET_RATIO: f64 = 1.05;

/// Buckets whose weight decays below this are dropped
pub const MIN_BUCKET_WEIGHT: f64 = 1e-4;

/// Bucket layout: bucket `i` starts at `first * (ratio^i - 1) / (ratio - 1)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramOptions {
    pub first_bucket_size: f64,
    pub ratio: f64,
    pub max_value: f64,
}

impl HistogramOptions {
    /// Layout tuned to the magnitude of each resource's values
    pub fn for_resource(resource: ResourceName) -> Self {
        let (first_bucket_size, max_value) = match resource {
            // cores
            ResourceName::Cpu => (0.01, 1000.0),
            // bytes
            ResourceName::Memory => (1e7, 1e12),
            _ => (1.0, 1e12),
        };
        Self {
            first_bucket_size,
            ratio: DEFAULT_BUCKET_RATIO,
            max_value,
        }
    }

    fn raw_index(&self, value: f64) -> f64 {
        ((value * (self.ratio - 1.0) / self.first_bucket_size) + 1.0).ln() / self.ratio.ln()
    }

    pub fn num_buckets(&self) -> usize {
        self.raw_index(self.max_value).ceil() as usize + 1
    }

    pub fn bucket_start(&self, index: usize) -> f64 {
        self.first_bucket_size * (self.ratio.powi(index as i32) - 1.0) / (self.ratio - 1.0)
    }

    pub fn find_bucket(&self, value: f64) -> usize {
        if value <= 0.0 {
            return 0;
        }
        let index = self.raw_index(value).floor() as usize;
        index.min(self.num_buckets() - 1)
    }
}

/// Serialized bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketWeight {
    pub index: usize,
    pub lower_bound: f64,
    pub weight: f64,
}

/// Serialized histogram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramCheckpoint {
    pub options: HistogramOptions,
    pub total_weight: f64,
    pub buckets: Vec<BucketWeight>,
}

/// Sparse histogram of weighted samples. Weights shrink on every `decay`.
#[derive(Debug, Clone)]
pub struct DecayingHistogram {
    options: HistogramOptions,
    weights: BTreeMap<usize, f64>,
    total_weight: f64,
}

impl DecayingHistogram {
    pub fn new(options: HistogramOptions) -> Self {
        Self {
            options,
            weights: BTreeMap::new(),
            total_weight: 0.0,
        }
    }

    pub fn options(&self) -> &HistogramOptions {
        &self.options
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn add_sample(&mut self, value: f64, weight: f64) {
        if weight <= 0.0 || !value.is_finite() {
            return;
        }
        let index = self.options.find_bucket(value);
        *self.weights.entry(index).or_insert(0.0) += weight;
        self.total_weight += weight;
    }

    /// Multiply every weight by `factor` and drop negligible buckets
    pub fn decay(&mut self, factor: f64) {
        if factor >= 1.0 {
            return;
        }
        for weight in self.weights.values_mut() {
            *weight *= factor;
        }
        self.weights.retain(|_, w| *w >= MIN_BUCKET_WEIGHT);
        self.total_weight = self.weights.values().sum();
    }

    /// Interpolated value below which `q` of the weight lies
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.total_weight <= 0.0 {
            return None;
        }
        let target = q.clamp(0.0, 1.0) * self.total_weight;
        let mut cumulative = 0.0;
        let mut last = 0;
        for (&index, &weight) in &self.weights {
            last = index;
            if cumulative + weight >= target {
                let fraction = if weight > 0.0 {
                    (target - cumulative) / weight
                } else {
                    0.0
                };
                let start = self.options.bucket_start(index);
                let end = self.options.bucket_start(index + 1);
                return Some(start + fraction * (end - start));
            }
            cumulative += weight;
        }
        Some(self.options.bucket_start(last + 1))
    }

    pub fn checkpoint(&self) -> HistogramCheckpoint {
        HistogramCheckpoint {
            options: self.options,
            total_weight: self.total_weight,
            buckets: self
                .weights
                .iter()
                .map(|(&index, &weight)| BucketWeight {
                    index,
                    lower_bound: self.options.bucket_start(index),
                    weight,
                })
                .collect(),
        }
    }

    pub fn from_checkpoint(checkpoint: &HistogramCheckpoint) -> Self {
        Self {
            options: checkpoint.options,
            weights: checkpoint
                .buckets
                .iter()
                .map(|b| (b.index, b.weight))
                .collect(),
            total_weight: checkpoint.total_weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_layout_is_monotonic() {
        let options = HistogramOptions::for_resource(ResourceName::Cpu);
        assert_eq!(options.bucket_start(0), 0.0);
        assert!((options.bucket_start(1) - 0.01).abs() < 1e-12);
        for i in 0..options.num_buckets() {
            assert!(options.bucket_start(i + 1) > options.bucket_start(i));
        }
        assert_eq!(options.find_bucket(0.005), 0);
        assert_eq!(options.find_bucket(1e9), options.num_buckets() - 1);
    }

    #[test]
    fn test_value_falls_inside_its_bucket() {
        let options = HistogramOptions::for_resource(ResourceName::Memory);
        for value in [5e6, 1.5e8, 3.2e9, 7.7e10] {
            let index = options.find_bucket(value);
            assert!(options.bucket_start(index) <= value * (1.0 + 1e-9));
            assert!(options.bucket_start(index + 1) > value * (1.0 - 1e-9));
        }
    }

    #[test]
    fn test_quantile_of_empty_histogram() {
        let histogram = DecayingHistogram::new(HistogramOptions::for_resource(ResourceName::Cpu));
        assert!(histogram.is_empty());
        assert_eq!(histogram.quantile(0.5), None);
    }

    #[test]
    fn test_quantiles_are_ordered() {
        let mut histogram =
            DecayingHistogram::new(HistogramOptions::for_resource(ResourceName::Cpu));
        for i in 1..=100 {
            histogram.add_sample(i as f64 * 0.01, 1.0);
        }
        let p50 = histogram.quantile(0.5).unwrap();
        let p90 = histogram.quantile(0.9).unwrap();
        let p99 = histogram.quantile(0.99).unwrap();
        assert!(p50 <= p90 && p90 <= p99);
        assert!((p50 - 0.5).abs() < 0.05);
        assert!((p90 - 0.9).abs() < 0.07);
    }

    #[test]
    fn test_decay_drops_negligible_buckets() {
        let mut histogram =
            DecayingHistogram::new(HistogramOptions::for_resource(ResourceName::Cpu));
        histogram.add_sample(0.5, 1.0);
        histogram.decay(0.5);
        assert!((histogram.total_weight() - 0.5).abs() < 1e-12);
        histogram.decay(1e-5);
        assert!(histogram.is_empty());
        assert_eq!(histogram.total_weight(), 0.0);
    }

    #[test]
    fn test_checkpoint_restores_weights() {
        let mut histogram =
            DecayingHistogram::new(HistogramOptions::for_resource(ResourceName::DiskRead));
        histogram.add_sample(12.0, 1.0);
        histogram.add_sample(4096.0, 2.0);
        histogram.decay(0.9);

        let restored = DecayingHistogram::from_checkpoint(&histogram.checkpoint());
        assert_eq!(restored.total_weight(), histogram.total_weight());
        assert_eq!(restored.quantile(0.7), histogram.quantile(0.7));
        assert_eq!(restored.checkpoint(), histogram.checkpoint());
    }
}
