//! Prediction manager
//!
//! Public facade of the engine: callers register profiles, read their
//! latest results and unregister them. A background loop runs every
//! registered profiler once per interval with bounded parallelism and
//! garbage-collects checkpoints of profiles that are gone.

mod registry;

pub use registry::ProfileRegistry;

use crate::checkpoint::CheckpointStore;
use crate::error::PredictionError;
use crate::metrics::MetricsRepository;
use crate::models::{OwnerRef, PredictionProfileSpec, ProfileKey, ProfileResult, TargetRef};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::profiler::{Profiler, ProfilerConfig, ProfilerContext};
use crate::resolver::WorkloadResolver;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the prediction manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Profiling interval (default: 60 seconds)
    pub profile_interval: Duration,
    /// Maximum profilers running at once (default: 8)
    pub max_concurrent_profiles: usize,
    /// Orphaned checkpoints older than this are deleted (default: 1 hour)
    pub checkpoint_grace_period: Duration,
    /// Checkpoint garbage collection interval (default: 10 minutes)
    pub gc_interval: Duration,
    pub profiler: ProfilerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            profile_interval: Duration::from_secs(60),
            max_concurrent_profiles: 8,
            checkpoint_grace_period: Duration::from_secs(60 * 60),
            gc_interval: Duration::from_secs(10 * 60),
            profiler: ProfilerConfig::default(),
        }
    }
}

/// Registered profile with its latest result, as handed to publishers
#[derive(Debug, Clone, Serialize)]
pub struct ProfileStatus {
    pub key: ProfileKey,
    pub owner: Option<OwnerRef>,
    pub result: ProfileResult,
}

/// Counters of one scheduling round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub profiles: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct PredictionManager {
    config: ManagerConfig,
    context: ProfilerContext,
    registry: ProfileRegistry,
    results: DashMap<ProfileKey, ProfileResult>,
    started: AtomicBool,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl PredictionManager {
    pub fn new(
        config: ManagerConfig,
        resolver: Arc<WorkloadResolver>,
        repository: Arc<MetricsRepository>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            context: ProfilerContext {
                resolver,
                repository,
                checkpoints,
            },
            registry: ProfileRegistry::new(),
            results: DashMap::new(),
            started: AtomicBool::new(false),
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("prediction-manager"),
        }
    }

    /// True once the resolver and at least one usage backend have synced
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Flip to started when dependencies are ready. Returns the started flag.
    pub async fn try_start(&self) -> bool {
        if self.started() {
            return true;
        }
        if self.context.resolver.is_synced().await && self.context.repository.is_synced().await {
            if !self.started.swap(true, Ordering::AcqRel) {
                self.logger.log_manager_started();
            }
            return true;
        }
        false
    }

    /// Register a profile or, if the key is already registered, replace the
    /// spec of the existing profiler. New profilers are seeded from their
    /// checkpoint.
    pub async fn register(
        &self,
        key: ProfileKey,
        spec: PredictionProfileSpec,
    ) -> Result<(), PredictionError> {
        if !self.started() {
            return Err(PredictionError::NotStarted);
        }
        spec.validate()?;
        if !key.matches_spec(&spec) {
            return Err(PredictionError::InvalidSpec(format!(
                "spec sources or estimators do not match profile {key}"
            )));
        }
        if let TargetRef::Workload(workload) = &key.target {
            if !self.context.resolver.supports_kind(&workload.kind) {
                return Err(PredictionError::UnsupportedTargetKind(workload.kind.clone()));
            }
        }

        if let Some(existing) = self.registry.get(&key) {
            existing.update(spec).await;
            self.results.insert(key.clone(), existing.result().await);
            self.logger.log_profile_registered(&key.to_string(), false, false);
            return Ok(());
        }

        // built outside the registry lock: restoring touches the store
        let profiler = Arc::new(Profiler::new(
            key.clone(),
            spec.clone(),
            self.context.clone(),
            self.config.profiler.clone(),
        ));
        let restored = profiler.restore().await;

        match self.registry.insert_if_absent(key.clone(), Arc::clone(&profiler)) {
            Ok(()) => {
                self.results.insert(key.clone(), profiler.result().await);
                self.metrics.set_profiles_registered(self.registry.len());
                self.logger.log_profile_registered(&key.to_string(), true, restored);
            }
            Err(existing) => {
                // lost a race with a concurrent registration of the same key
                existing.update(spec).await;
                self.results.insert(key.clone(), existing.result().await);
                self.logger.log_profile_registered(&key.to_string(), false, false);
            }
        }
        Ok(())
    }

    /// Remove a profile. Its checkpoint is kept until garbage collection.
    pub async fn unregister(&self, key: &ProfileKey) -> Result<(), PredictionError> {
        if self.registry.remove(key).is_none() {
            return Err(PredictionError::NotRegistered(key.to_string()));
        }
        self.results.remove(key);
        self.metrics.set_profiles_registered(self.registry.len());
        self.logger.log_profile_unregistered(&key.to_string());
        Ok(())
    }

    /// Latest result of a registered profile, empty until its first cycle
    pub fn get_result(&self, key: &ProfileKey) -> Result<ProfileResult, PredictionError> {
        if !self.started() {
            return Err(PredictionError::NotStarted);
        }
        if !self.registry.contains(key) {
            return Err(PredictionError::NotRegistered(key.to_string()));
        }
        Ok(self
            .results
            .get(key)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    pub fn is_registered(&self, key: &ProfileKey) -> bool {
        self.registry.contains(key)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn keys(&self) -> Vec<ProfileKey> {
        let mut keys: Vec<_> = self.registry.snapshot().into_iter().map(|(k, _)| k).collect();
        keys.sort();
        keys
    }

    /// Registered profiles with owners and latest results, sorted by key
    pub async fn snapshot(&self) -> Vec<ProfileStatus> {
        let mut statuses = Vec::new();
        for (key, profiler) in self.registry.snapshot() {
            let owner = profiler.spec().await.owner.clone();
            let result = self
                .results
                .get(&key)
                .map(|r| r.value().clone())
                .unwrap_or_default();
            statuses.push(ProfileStatus { key, owner, result });
        }
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    /// Run every registered profiler once, at most
    /// `max_concurrent_profiles` at a time
    pub async fn run_cycle(&self) -> CycleSummary {
        let profilers = self.registry.snapshot();
        let mut summary = CycleSummary {
            profiles: profilers.len(),
            ..Default::default()
        };
        if profilers.is_empty() {
            return summary;
        }

        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_profiles.max(1)));
        let mut tasks = JoinSet::new();
        for (key, profiler) in profilers {
            let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                break;
            };
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let start = Instant::now();
                let outcome = profiler.profile().await;
                metrics.observe_cycle_latency(start.elapsed().as_secs_f64());
                (key, profiler, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, profiler, Ok(report))) => {
                    if let Some(reason) = &report.skipped {
                        debug!(profile = %key, reason = %reason, "Profile cycle skipped");
                        summary.skipped += 1;
                    } else {
                        summary.succeeded += 1;
                    }
                    self.store_result(&key, &profiler).await;
                }
                Ok((key, _, Err(e))) => {
                    warn!(profile = %key, error = %e, "Profile cycle failed");
                    self.metrics.inc_profile_cycle_errors();
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Profile task aborted");
                    self.metrics.inc_profile_cycle_errors();
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Publish a finished cycle's result unless the profile was
    /// unregistered or replaced meanwhile
    async fn store_result(&self, key: &ProfileKey, profiler: &Arc<Profiler>) {
        if !self.registry.is_current(key, profiler) {
            return;
        }
        self.results.insert(key.clone(), profiler.result().await);
        if !self.registry.is_current(key, profiler) {
            self.results.remove(key);
        }
    }

    /// Delete checkpoints of unregistered profiles older than the grace
    /// period. Returns the number removed.
    pub async fn collect_garbage(&self) -> usize {
        let infos = match self.context.checkpoints.list().await {
            Ok(infos) => infos,
            Err(e) => {
                warn!(error = %e, "Failed to list checkpoints");
                return 0;
            }
        };
        let grace = chrono::Duration::from_std(self.config.checkpoint_grace_period)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - grace;

        let total = infos.len();
        let mut removed = 0;
        for info in infos {
            if self.registry.contains(&info.key) || info.saved_at > cutoff {
                continue;
            }
            match self.context.checkpoints.delete(&info.key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(profile = %info.key, error = %e, "Failed to delete checkpoint"),
            }
        }
        if removed > 0 {
            self.logger.log_checkpoints_collected(removed, total - removed);
        }
        removed
    }

    /// Scheduling loop. Cycles start once dependencies are synced.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.profile_interval.as_secs(),
            max_concurrent = self.config.max_concurrent_profiles,
            "Starting prediction manager loop"
        );

        let mut ticker = interval(self.config.profile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gc_ticker = interval(self.config.gc_interval);
        gc_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.try_start().await {
                        debug!("Waiting for workload resolver and metrics backends to sync");
                        continue;
                    }
                    let start = Instant::now();
                    let summary = self.run_cycle().await;
                    if summary.profiles > 0 {
                        self.logger.log_cycle_complete(
                            summary.profiles,
                            summary.succeeded,
                            summary.skipped,
                            summary.failed,
                            start.elapsed().as_millis(),
                        );
                    }
                }
                _ = gc_ticker.tick() => {
                    if self.started() {
                        self.collect_garbage().await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down prediction manager loop");
                    break;
                }
            }
        }
    }

    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown.subscribe()))
    }
}

#[cfg(test)]
mod tests;
