//! Observability infrastructure for the prediction engine
//!
//! Provides:
//! - Prometheus metrics (cycle latency, registered profiles, ingestion and error counters)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for profiling cycle latency (in seconds)
const CYCLE_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    cycle_latency_seconds: Histogram,
    profiles_registered: IntGauge,
    samples_ingested: IntCounter,
    profile_cycle_errors: IntCounter,
    usage_parse_errors: IntCounter,
    cache_refresh_errors: IntCounterVec,
    checkpoint_errors: IntCounter,
    status_writes: IntCounterVec,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "resource_predictor_cycle_latency_seconds",
                "Time spent running one profiling cycle for a profile",
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            profiles_registered: register_int_gauge!(
                "resource_predictor_profiles_registered",
                "Number of profiles currently registered"
            )
            .expect("Failed to register profiles_registered"),

            samples_ingested: register_int_counter!(
                "resource_predictor_samples_ingested_total",
                "Total number of usage samples folded into estimators"
            )
            .expect("Failed to register samples_ingested"),

            profile_cycle_errors: register_int_counter!(
                "resource_predictor_profile_cycle_errors_total",
                "Total number of failed profiling cycles"
            )
            .expect("Failed to register profile_cycle_errors"),

            usage_parse_errors: register_int_counter!(
                "resource_predictor_usage_parse_errors_total",
                "Total number of raw usage values that failed to parse"
            )
            .expect("Failed to register usage_parse_errors"),

            cache_refresh_errors: register_int_counter_vec!(
                "resource_predictor_cache_refresh_errors_total",
                "Total number of failed backend cache refreshes",
                &["cache"]
            )
            .expect("Failed to register cache_refresh_errors"),

            checkpoint_errors: register_int_counter!(
                "resource_predictor_checkpoint_errors_total",
                "Total number of checkpoint save or load failures"
            )
            .expect("Failed to register checkpoint_errors"),

            status_writes: register_int_counter_vec!(
                "resource_predictor_status_writes_total",
                "Status publication attempts by outcome",
                &["outcome"]
            )
            .expect("Failed to register status_writes"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying collectors.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn set_profiles_registered(&self, count: usize) {
        self.inner().profiles_registered.set(count as i64);
    }

    pub fn add_samples_ingested(&self, count: usize) {
        self.inner().samples_ingested.inc_by(count as u64);
    }

    pub fn inc_profile_cycle_errors(&self) {
        self.inner().profile_cycle_errors.inc();
    }

    pub fn inc_usage_parse_errors(&self) {
        self.inner().usage_parse_errors.inc();
    }

    pub fn inc_cache_refresh_errors(&self, cache: &str) {
        self.inner()
            .cache_refresh_errors
            .with_label_values(&[cache])
            .inc();
    }

    pub fn inc_checkpoint_errors(&self) {
        self.inner().checkpoint_errors.inc();
    }

    pub fn inc_status_writes(&self, outcome: &str) {
        self.inner().status_writes.with_label_values(&[outcome]).inc();
    }
}

/// Structured logger for engine lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "predictor_started",
            component = %self.component,
            version = %version,
            "Resource predictor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "predictor_shutdown",
            component = %self.component,
            reason = %reason,
            "Resource predictor shutting down"
        );
    }

    pub fn log_manager_started(&self) {
        info!(
            event = "manager_started",
            component = %self.component,
            "Dependencies synced, accepting profile registrations"
        );
    }

    /// `created` is false when an existing profiler received a new spec
    pub fn log_profile_registered(&self, key: &str, created: bool, restored: bool) {
        info!(
            event = "profile_registered",
            component = %self.component,
            profile = %key,
            created = created,
            restored = restored,
            "Profile registered"
        );
    }

    pub fn log_profile_unregistered(&self, key: &str) {
        info!(
            event = "profile_unregistered",
            component = %self.component,
            profile = %key,
            "Profile unregistered"
        );
    }

    pub fn log_cycle_complete(
        &self,
        profiles: usize,
        succeeded: usize,
        skipped: usize,
        failed: usize,
        elapsed_ms: u128,
    ) {
        if failed > 0 {
            warn!(
                event = "profiling_cycle",
                component = %self.component,
                profiles = profiles,
                succeeded = succeeded,
                skipped = skipped,
                failed = failed,
                elapsed_ms = elapsed_ms,
                "Profiling cycle finished with failures"
            );
        } else {
            info!(
                event = "profiling_cycle",
                component = %self.component,
                profiles = profiles,
                succeeded = succeeded,
                skipped = skipped,
                elapsed_ms = elapsed_ms,
                "Profiling cycle finished"
            );
        }
    }

    pub fn log_status_published(&self, owner: &str, containers: usize, success: bool) {
        if success {
            info!(
                event = "status_published",
                component = %self.component,
                owner = %owner,
                containers = containers,
                "Published prediction status"
            );
        } else {
            warn!(
                event = "status_publish_failed",
                component = %self.component,
                owner = %owner,
                containers = containers,
                "Failed to publish prediction status, will retry next interval"
            );
        }
    }

    pub fn log_checkpoints_collected(&self, removed: usize, remaining: usize) {
        info!(
            event = "checkpoint_gc",
            component = %self.component,
            removed = removed,
            remaining = remaining,
            "Removed orphaned checkpoints"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics_creation() {
        let metrics = EngineMetrics::new();
        metrics.observe_cycle_latency(0.01);
        metrics.set_profiles_registered(3);
        metrics.add_samples_ingested(12);
        metrics.inc_profile_cycle_errors();
        metrics.inc_usage_parse_errors();
        metrics.inc_cache_refresh_errors("metrics-api");
        metrics.inc_checkpoint_errors();
        metrics.inc_status_writes("written");

        // clones share the global collectors
        let other = metrics.clone();
        other.set_profiles_registered(4);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("prediction-manager");
        assert_eq!(logger.component, "prediction-manager");
    }
}
