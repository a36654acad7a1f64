//! Per-profile estimation
//!
//! A [`Profiler`] owns the estimators of one profile. Each cycle it resolves
//! the target's pods, pulls the latest usage from the metrics repository,
//! folds it into per-entry estimators, checkpoints the state and publishes a
//! fresh result. Cycles of one profiler never overlap.

use crate::checkpoint::{CheckpointStore, ProfileCheckpoint};
use crate::error::PredictionError;
use crate::estimator::{decay_factor, DistributionEstimator, DistributionState, Quantile};
use crate::metrics::MetricsRepository;
use crate::models::{
    ContainerResourceResult, HierarchyLevel, PodIdentity, PredictionProfileSpec, ProfileKey,
    ProfileResult, ResourceDistribution, ResourceName, Sample, TargetRef,
};
use crate::observability::EngineMetrics;
use crate::resolver::WorkloadResolver;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Entry name of the pod-level aggregate
pub const POD_ENTRY: &str = "pod";

/// Default half-life of sample weights (one day at 5 minute cycles)
pub const DEFAULT_HALF_LIFE_CYCLES: f64 = 288.0;

/// Configuration shared by all profilers
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// How long an entry survives without observed pods (default: 10 minutes)
    pub container_grace_period: Duration,
    /// Half-life used when a distribution model names none
    pub default_half_life_cycles: f64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            container_grace_period: Duration::from_secs(600),
            default_half_life_cycles: DEFAULT_HALF_LIFE_CYCLES,
        }
    }
}

/// Dependencies every profiler needs
#[derive(Clone)]
pub struct ProfilerContext {
    pub resolver: Arc<WorkloadResolver>,
    pub repository: Arc<MetricsRepository>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

/// Outcome of one profiling cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub pods: usize,
    pub entries: usize,
    pub samples_ingested: usize,
    /// Per-query failures that did not abort the cycle
    pub failures: Vec<String>,
    /// Set when the cycle did not run
    pub skipped: Option<String>,
}

impl CycleReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: Some(reason.into()),
            ..Default::default()
        }
    }
}

struct EntryModel {
    estimators: BTreeMap<ResourceName, DistributionEstimator>,
    last_seen: DateTime<Utc>,
    /// last ingested timestamp per (pod, resource), for de-duplication
    ingested: HashMap<(PodIdentity, ResourceName), DateTime<Utc>>,
}

impl EntryModel {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            estimators: BTreeMap::new(),
            last_seen: now,
            ingested: HashMap::new(),
        }
    }

    /// Returns false when the sample was already ingested
    fn ingest(
        &mut self,
        pod: PodIdentity,
        resource: ResourceName,
        sample: &Sample,
        quantiles: &[Quantile],
    ) -> bool {
        let key = (pod, resource);
        if self.ingested.get(&key) == Some(&sample.timestamp) {
            return false;
        }
        self.ingested.insert(key, sample.timestamp);
        self.estimators
            .entry(resource)
            .or_insert_with(|| DistributionEstimator::new(resource, quantiles.to_vec()))
            .ingest(sample);
        true
    }

    fn result(&self) -> ContainerResourceResult {
        ContainerResourceResult {
            resources: self
                .estimators
                .iter()
                .map(|(resource, estimator)| {
                    (*resource, ResourceDistribution::from(&estimator.snapshot()))
                })
                .collect(),
        }
    }

    fn states(&self) -> BTreeMap<ResourceName, DistributionState> {
        self.estimators
            .iter()
            .map(|(resource, estimator)| (*resource, estimator.snapshot()))
            .collect()
    }
}

#[derive(Default)]
struct ProfilerState {
    entries: BTreeMap<String, EntryModel>,
}

impl ProfilerState {
    fn result(&self) -> ProfileResult {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.result()))
            .collect()
    }
}

pub struct Profiler {
    key: ProfileKey,
    spec: RwLock<Arc<PredictionProfileSpec>>,
    state: Mutex<ProfilerState>,
    result: RwLock<ProfileResult>,
    context: ProfilerContext,
    config: ProfilerConfig,
    metrics: EngineMetrics,
}

impl Profiler {
    pub fn new(
        key: ProfileKey,
        spec: PredictionProfileSpec,
        context: ProfilerContext,
        config: ProfilerConfig,
    ) -> Self {
        Self {
            key,
            spec: RwLock::new(Arc::new(spec)),
            state: Mutex::new(ProfilerState::default()),
            result: RwLock::new(ProfileResult::new()),
            context,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn key(&self) -> &ProfileKey {
        &self.key
    }

    pub async fn spec(&self) -> Arc<PredictionProfileSpec> {
        self.spec.read().await.clone()
    }

    /// Latest published result
    pub async fn result(&self) -> ProfileResult {
        self.result.read().await.clone()
    }

    /// Load estimator state from the checkpoint store. A missing or
    /// unreadable checkpoint leaves the profiler empty. Returns whether
    /// state was restored.
    pub async fn restore(&self) -> bool {
        let checkpoint = match self.context.checkpoints.load(&self.key).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return false,
            Err(e) => {
                warn!(profile = %self.key, error = %e, "Failed to load checkpoint, starting empty");
                self.metrics.inc_checkpoint_errors();
                return false;
            }
        };

        let spec = self.spec().await;
        let quantiles = quantiles_for(&spec);
        let requested = spec.requested_resources();
        let now = Utc::now();

        let mut state = self.state.lock().await;
        for (name, resources) in checkpoint.entries {
            let entry = state
                .entries
                .entry(name)
                .or_insert_with(|| EntryModel::new(now));
            for (resource, saved) in resources {
                if !requested.contains(&resource) {
                    continue;
                }
                let mut estimator = DistributionEstimator::new(resource, quantiles.clone());
                estimator.load_state(&saved);
                entry.estimators.insert(resource, estimator);
            }
        }
        *self.result.write().await = state.result();
        debug!(profile = %self.key, entries = state.entries.len(), "Restored checkpoint");
        true
    }

    /// Swap in a new spec. Estimators of resources the new spec no longer
    /// requests are dropped; quantile labels follow the new spec.
    pub async fn update(&self, spec: PredictionProfileSpec) {
        let quantiles = quantiles_for(&spec);
        let requested = spec.requested_resources();
        *self.spec.write().await = Arc::new(spec);

        let mut state = self.state.lock().await;
        for entry in state.entries.values_mut() {
            entry.estimators.retain(|resource, _| requested.contains(resource));
            entry.ingested.retain(|(_, resource), _| requested.contains(resource));
            for estimator in entry.estimators.values_mut() {
                estimator.set_quantiles(quantiles.clone());
            }
        }
        *self.result.write().await = state.result();
    }

    /// Run one profiling cycle. Returns a skipped report when a cycle is
    /// already running or the target workload is gone.
    pub async fn profile(&self) -> Result<CycleReport, PredictionError> {
        let Ok(mut state) = self.state.try_lock() else {
            return Ok(CycleReport::skipped("previous cycle still running"));
        };
        let spec = self.spec().await;

        let pods = match self.context.resolver.resolve_pods(&self.key.target).await {
            Ok(pods) => pods,
            Err(e) if e.is_not_found() => {
                debug!(profile = %self.key, error = %e, "Target not found, skipping cycle");
                return Ok(CycleReport::skipped(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let mut containers: BTreeSet<String> = pods
            .iter()
            .flat_map(|p| p.containers.iter().cloned())
            .collect();
        if let TargetRef::Workload(workload) = &self.key.target {
            match self.context.resolver.resolve_pod_template(workload).await {
                Ok(template) => containers.extend(template.containers),
                Err(e) => debug!(profile = %self.key, error = %e, "No pod template"),
            }
        }
        let pod_ids: Vec<PodIdentity> = pods.iter().map(|p| p.id.clone()).collect();

        let now = Utc::now();
        let quantiles = quantiles_for(&spec);
        let factor = decay_factor(half_life_for(&spec, &self.config));
        for entry in state.entries.values_mut() {
            for estimator in entry.estimators.values_mut() {
                estimator.decay(factor);
            }
        }

        let mut report = CycleReport {
            pods: pods.len(),
            ..Default::default()
        };

        match self.key.hierarchy {
            HierarchyLevel::Container => {
                for container in &containers {
                    let entry = state
                        .entries
                        .entry(container.clone())
                        .or_insert_with(|| EntryModel::new(now));
                    entry.last_seen = now;
                    for source in &spec.metrics {
                        let descriptor = source.descriptor();
                        for resource in source.resources() {
                            match self
                                .context
                                .repository
                                .get_usage(&descriptor, *resource, container, &pod_ids)
                                .await
                            {
                                Ok(samples) => {
                                    for (pod, sample) in samples {
                                        if entry.ingest(pod, *resource, &sample, &quantiles) {
                                            report.samples_ingested += 1;
                                        }
                                    }
                                }
                                Err(e) => report
                                    .failures
                                    .push(format!("{descriptor} {container}/{resource}: {e}")),
                            }
                        }
                    }
                }
            }
            HierarchyLevel::Pod => {
                let entry = state
                    .entries
                    .entry(POD_ENTRY.to_string())
                    .or_insert_with(|| EntryModel::new(now));
                if !pods.is_empty() {
                    entry.last_seen = now;
                }
                for source in &spec.metrics {
                    let descriptor = source.descriptor();
                    for resource in source.resources() {
                        let mut by_container: HashMap<&str, HashMap<PodIdentity, Sample>> =
                            HashMap::new();
                        for container in &containers {
                            match self
                                .context
                                .repository
                                .get_usage(&descriptor, *resource, container, &pod_ids)
                                .await
                            {
                                Ok(samples) => {
                                    by_container.insert(container.as_str(), samples);
                                }
                                Err(e) => report
                                    .failures
                                    .push(format!("{descriptor} {container}/{resource}: {e}")),
                            }
                        }
                        for pod in &pods {
                            let observed: Vec<&Sample> = pod
                                .containers
                                .iter()
                                .filter_map(|c| {
                                    by_container.get(c.as_str()).and_then(|s| s.get(&pod.id))
                                })
                                .collect();
                            if observed.is_empty() {
                                continue;
                            }
                            // a partial sum would understate the pod
                            if observed.len() < pod.containers.len() {
                                report.failures.push(format!(
                                    "{descriptor} {}/{resource}: usage for {} of {} containers",
                                    pod.id,
                                    observed.len(),
                                    pod.containers.len()
                                ));
                                continue;
                            }
                            let total = Sample::new(
                                observed.iter().map(|s| s.timestamp).max().unwrap_or(now),
                                observed.iter().map(|s| s.value).sum(),
                            );
                            if entry.ingest(pod.id.clone(), *resource, &total, &quantiles) {
                                report.samples_ingested += 1;
                            }
                        }
                    }
                }
            }
        }

        let live: HashSet<&PodIdentity> = pod_ids.iter().collect();
        for entry in state.entries.values_mut() {
            entry.ingested.retain(|(pod, _), _| live.contains(pod));
        }

        let grace = chrono::Duration::from_std(self.config.container_grace_period)
            .unwrap_or_else(|_| chrono::Duration::zero());
        state.entries.retain(|name, entry| {
            let keep = now - entry.last_seen <= grace;
            if !keep {
                debug!(profile = %self.key, entry = %name, "Evicting entry past grace period");
            }
            keep
        });
        report.entries = state.entries.len();

        let checkpoint = ProfileCheckpoint {
            key: self.key.clone(),
            saved_at: now,
            entries: state
                .entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.states()))
                .collect(),
        };
        if let Err(e) = self.context.checkpoints.save(&checkpoint).await {
            warn!(profile = %self.key, error = %e, "Failed to save checkpoint");
            self.metrics.inc_checkpoint_errors();
            report.failures.push(e.to_string());
        }

        *self.result.write().await = state.result();
        self.metrics.add_samples_ingested(report.samples_ingested);

        debug!(
            profile = %self.key,
            pods = report.pods,
            entries = report.entries,
            samples = report.samples_ingested,
            failures = report.failures.len(),
            "Profiling cycle complete"
        );
        Ok(report)
    }
}

fn quantiles_for(spec: &PredictionProfileSpec) -> Vec<Quantile> {
    spec.distribution()
        .map(|model| model.parsed_quantiles())
        .unwrap_or_else(|| crate::models::DistributionModel::default().parsed_quantiles())
        .unwrap_or_default()
}

fn half_life_for(spec: &PredictionProfileSpec, config: &ProfilerConfig) -> f64 {
    spec.distribution()
        .and_then(|model| model.decay_half_life_cycles)
        .unwrap_or(config.default_half_life_cycles)
}
