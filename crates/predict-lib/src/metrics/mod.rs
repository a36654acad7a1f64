//! Metrics repository
//!
//! Caches per-pod, per-container usage from every configured backend and
//! answers point queries from those caches. Each backend is refreshed on a
//! fixed interval; a failed refresh keeps the previous snapshot.
//!
//! - `metrics_api`: cluster metrics API (`metrics.k8s.io`) backend
//! - `prometheus`: Prometheus-compatible instant-query backend
//! - `quantity`: raw quantity parsing

mod metrics_api;
mod prometheus;
mod quantity;

pub use metrics_api::MetricsApiSource;
pub use prometheus::{PrometheusSourceConfig, PrometheusUsageSource};
pub use quantity::{check_value, parse_usage};

use crate::cache::{CacheStatus, SnapshotCache};
use crate::error::PredictionError;
use crate::models::{PodIdentity, ResourceName, Sample, SourceDescriptor};
use crate::observability::EngineMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Usage value as delivered by a backend
#[derive(Debug, Clone, PartialEq)]
pub enum RawUsage {
    /// Quantity string, e.g. "250m"
    Text(String),
    Value(f64),
}

/// Usage of one pod at one observation time
#[derive(Debug, Clone, PartialEq)]
pub struct PodUsage {
    pub timestamp: DateTime<Utc>,
    /// container name -> resource -> raw usage
    pub containers: HashMap<String, HashMap<ResourceName, RawUsage>>,
}

impl PodUsage {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            containers: HashMap::new(),
        }
    }

    pub fn with_usage(
        mut self,
        container: impl Into<String>,
        resource: ResourceName,
        usage: RawUsage,
    ) -> Self {
        self.insert(container, resource, usage);
        self
    }

    pub fn insert(&mut self, container: impl Into<String>, resource: ResourceName, usage: RawUsage) {
        self.containers
            .entry(container.into())
            .or_default()
            .insert(resource, usage);
    }
}

/// Full view of one backend at refresh time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    pub pods: HashMap<PodIdentity, PodUsage>,
}

/// A usage backend
#[async_trait]
pub trait UsageSource: Send + Sync {
    fn descriptor(&self) -> SourceDescriptor;

    /// Fetch a complete snapshot of current usage
    async fn fetch(&self) -> anyhow::Result<UsageSnapshot>;
}

/// Fixed in-memory source, useful for tests and dry runs
pub struct StaticUsageSource {
    descriptor: SourceDescriptor,
    snapshot: std::sync::RwLock<Option<UsageSnapshot>>,
}

impl StaticUsageSource {
    pub fn new(descriptor: SourceDescriptor, snapshot: UsageSnapshot) -> Self {
        Self {
            descriptor,
            snapshot: std::sync::RwLock::new(Some(snapshot)),
        }
    }

    /// Replace the served snapshot; `None` makes every fetch fail
    pub fn set(&self, snapshot: Option<UsageSnapshot>) {
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = snapshot;
        }
    }
}

#[async_trait]
impl UsageSource for StaticUsageSource {
    fn descriptor(&self) -> SourceDescriptor {
        self.descriptor.clone()
    }

    async fn fetch(&self) -> anyhow::Result<UsageSnapshot> {
        let guard = self
            .snapshot
            .read()
            .map_err(|_| anyhow::anyhow!("static source lock poisoned"))?;
        guard
            .clone()
            .ok_or_else(|| anyhow::anyhow!("{} unavailable", self.descriptor))
    }
}

/// Configuration for the metrics repository
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Cache refresh interval (default: 2 minutes)
    pub refresh_interval: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(120),
        }
    }
}

struct SourceSlot {
    source: Arc<dyn UsageSource>,
    cache: SnapshotCache<UsageSnapshot>,
}

/// Cached, multi-backend usage repository
pub struct MetricsRepository {
    slots: HashMap<SourceDescriptor, SourceSlot>,
    config: RepositoryConfig,
    metrics: EngineMetrics,
}

impl MetricsRepository {
    pub fn new(config: RepositoryConfig, sources: Vec<Arc<dyn UsageSource>>) -> Self {
        let slots = sources
            .into_iter()
            .map(|source| {
                (
                    source.descriptor(),
                    SourceSlot {
                        source,
                        cache: SnapshotCache::new(),
                    },
                )
            })
            .collect();
        Self {
            slots,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        let mut descriptors: Vec<_> = self.slots.keys().cloned().collect();
        descriptors.sort();
        descriptors
    }

    /// Refresh one backend. On failure the previous snapshot stays served.
    pub async fn refresh(&self, descriptor: &SourceDescriptor) -> Result<(), PredictionError> {
        let slot = self.slot(descriptor)?;
        match slot.source.fetch().await {
            Ok(snapshot) => {
                debug!(source = %descriptor, pods = snapshot.pods.len(), "Refreshed usage cache");
                slot.cache.replace(snapshot).await;
                Ok(())
            }
            Err(e) => {
                warn!(source = %descriptor, error = %e, "Usage refresh failed, keeping last snapshot");
                self.metrics.inc_cache_refresh_errors(&descriptor.to_string());
                slot.cache.record_failure(&e).await;
                Err(PredictionError::BackendUnavailable(format!("{descriptor}: {e}")))
            }
        }
    }

    pub async fn refresh_all(&self) {
        for descriptor in self.slots.keys() {
            // failures are recorded in the slot status
            let _ = self.refresh(descriptor).await;
        }
    }

    /// Periodic refresh loop; the first refresh happens immediately
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.refresh_interval.as_secs(),
            sources = self.slots.len(),
            "Starting metrics repository refresh loop"
        );

        let mut ticker = interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_all().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down metrics repository refresh loop");
                    break;
                }
            }
        }
    }

    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown.subscribe()))
    }

    /// True once any backend has completed a refresh
    pub async fn is_synced(&self) -> bool {
        for slot in self.slots.values() {
            if slot.cache.is_synced().await {
                return true;
            }
        }
        false
    }

    pub async fn status(&self) -> Vec<(SourceDescriptor, CacheStatus)> {
        let mut statuses = Vec::with_capacity(self.slots.len());
        for (descriptor, slot) in &self.slots {
            statuses.push((descriptor.clone(), slot.cache.status().await));
        }
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// Latest usage of `container` in each of `pods`, from the cache of the
    /// given backend. Pods without data are omitted; malformed values are
    /// logged and dropped.
    pub async fn get_usage(
        &self,
        descriptor: &SourceDescriptor,
        resource: ResourceName,
        container: &str,
        pods: &[PodIdentity],
    ) -> Result<HashMap<PodIdentity, Sample>, PredictionError> {
        let slot = self.slot(descriptor)?;
        let snapshot = slot.cache.get().await.ok_or_else(|| {
            PredictionError::BackendUnavailable(format!("{descriptor} has not synced yet"))
        })?;

        let mut samples = HashMap::new();
        for pod in pods {
            let Some(usage) = snapshot.pods.get(pod) else {
                continue;
            };
            let Some(raw) = usage
                .containers
                .get(container)
                .and_then(|resources| resources.get(&resource))
            else {
                continue;
            };
            let parsed = match raw {
                RawUsage::Text(text) => parse_usage(text, resource),
                RawUsage::Value(value) => check_value(*value, resource),
            };
            match parsed {
                Ok(value) => {
                    samples.insert(pod.clone(), Sample::new(usage.timestamp, value));
                }
                Err(e) => {
                    warn!(
                        source = %descriptor,
                        pod = %pod,
                        container = %container,
                        resource = %resource,
                        error = %e,
                        "Dropping malformed usage value"
                    );
                    self.metrics.inc_usage_parse_errors();
                }
            }
        }
        Ok(samples)
    }

    fn slot(&self, descriptor: &SourceDescriptor) -> Result<&SourceSlot, PredictionError> {
        self.slots.get(descriptor).ok_or_else(|| {
            PredictionError::BackendUnavailable(format!("no source configured for {descriptor}"))
        })
    }
}
