//! Usage distribution estimation
//!
//! - `histogram`: decaying exponential-bucket histogram
//! - `distribution`: streaming mean/variance/quantile estimator with
//!   exportable state

mod distribution;
mod histogram;

pub use distribution::{decay_factor, DistributionEstimator, DistributionState, Quantile};
pub use histogram::{
    BucketWeight, DecayingHistogram, HistogramCheckpoint, HistogramOptions, DEFAULT_BUCKET_RATIO,
    MIN_BUCKET_WEIGHT,
};
