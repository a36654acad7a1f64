//! Workload resolver
//!
//! Maintains a periodically refreshed view of workload controllers and pods
//! and turns a [`TargetRef`] into the set of live pods it covers.

mod kube_source;
mod selector;

pub use kube_source::KubeClusterSource;
pub use selector::{LabelSelector, SelectorOperator, SelectorRequirement};

use crate::cache::{CacheStatus, SnapshotCache};
use crate::error::PredictionError;
use crate::models::{ApiKind, PodInfo, PodTemplate, TargetRef, WorkloadRef};
use crate::observability::EngineMetrics;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Controller kinds resolved without extra configuration
pub const BUILTIN_KINDS: &[&str] = &["Deployment", "DaemonSet", "ReplicaSet", "StatefulSet"];

/// Cache key of a workload controller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<&WorkloadRef> for WorkloadKey {
    fn from(w: &WorkloadRef) -> Self {
        Self::new(&w.kind, &w.namespace, &w.name)
    }
}

/// Selector and pod template of a workload controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadInfo {
    pub selector: Option<LabelSelector>,
    pub template: PodTemplate,
}

/// Point-in-time view of controllers and pods
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub workloads: HashMap<WorkloadKey, WorkloadInfo>,
    pub pods: Vec<PodInfo>,
}

/// Provider of cluster snapshots
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<ClusterSnapshot>;
}

/// Fixed in-memory cluster view, useful for tests and dry runs
pub struct StaticClusterSource {
    snapshot: std::sync::RwLock<Option<ClusterSnapshot>>,
}

impl StaticClusterSource {
    pub fn new(snapshot: ClusterSnapshot) -> Self {
        Self {
            snapshot: std::sync::RwLock::new(Some(snapshot)),
        }
    }

    /// Replace the served snapshot; `None` makes every refresh fail
    pub fn set(&self, snapshot: Option<ClusterSnapshot>) {
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = snapshot;
        }
    }
}

#[async_trait]
impl ClusterSource for StaticClusterSource {
    async fn snapshot(&self) -> anyhow::Result<ClusterSnapshot> {
        let guard = self
            .snapshot
            .read()
            .map_err(|_| anyhow::anyhow!("static cluster lock poisoned"))?;
        guard
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cluster view unavailable"))
    }
}

/// Configuration for the workload resolver
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Cluster view refresh interval (default: 60 seconds)
    pub refresh_interval: Duration,
    /// Additional controller kinds resolved through the dynamic API
    pub extended_kinds: Vec<ApiKind>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            extended_kinds: Vec::new(),
        }
    }
}

pub struct WorkloadResolver {
    source: Arc<dyn ClusterSource>,
    cache: SnapshotCache<ClusterSnapshot>,
    supported_kinds: HashSet<String>,
    config: ResolverConfig,
    metrics: EngineMetrics,
}

impl WorkloadResolver {
    pub fn new(config: ResolverConfig, source: Arc<dyn ClusterSource>) -> Self {
        let supported_kinds = BUILTIN_KINDS
            .iter()
            .map(|k| k.to_string())
            .chain(config.extended_kinds.iter().map(|k| k.kind.clone()))
            .collect();
        Self {
            source,
            cache: SnapshotCache::new(),
            supported_kinds,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn supports_kind(&self, kind: &str) -> bool {
        self.supported_kinds.contains(kind)
    }

    pub async fn refresh(&self) -> Result<(), PredictionError> {
        match self.source.snapshot().await {
            Ok(snapshot) => {
                debug!(
                    workloads = snapshot.workloads.len(),
                    pods = snapshot.pods.len(),
                    "Refreshed cluster view"
                );
                self.cache.replace(snapshot).await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Cluster view refresh failed, keeping last snapshot");
                self.metrics.inc_cache_refresh_errors("workload-resolver");
                self.cache.record_failure(&e).await;
                Err(PredictionError::BackendUnavailable(format!("cluster view: {e}")))
            }
        }
    }

    /// Periodic refresh loop; the first refresh happens immediately
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.refresh_interval.as_secs(),
            kinds = self.supported_kinds.len(),
            "Starting workload resolver refresh loop"
        );

        let mut ticker = interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // failures are recorded in the cache status
                    let _ = self.refresh().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down workload resolver refresh loop");
                    break;
                }
            }
        }
    }

    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown.subscribe()))
    }

    pub async fn is_synced(&self) -> bool {
        self.cache.is_synced().await
    }

    pub async fn status(&self) -> CacheStatus {
        self.cache.status().await
    }

    async fn snapshot(&self) -> Result<Arc<ClusterSnapshot>, PredictionError> {
        self.cache.get().await.ok_or_else(|| {
            PredictionError::BackendUnavailable("cluster view has not synced yet".to_string())
        })
    }

    fn workload<'a>(
        &self,
        snapshot: &'a ClusterSnapshot,
        workload: &WorkloadRef,
    ) -> Result<&'a WorkloadInfo, PredictionError> {
        if !self.supports_kind(&workload.kind) {
            return Err(PredictionError::UnsupportedTargetKind(workload.kind.clone()));
        }
        snapshot
            .workloads
            .get(&WorkloadKey::from(workload))
            .ok_or_else(|| PredictionError::NotFound {
                kind: workload.kind.clone(),
                namespace: workload.namespace.clone(),
                name: workload.name.clone(),
            })
    }

    /// Live pods covered by the target, sorted by identity.
    /// Pods in a terminal phase are excluded.
    pub async fn resolve_pods(&self, target: &TargetRef) -> Result<Vec<PodInfo>, PredictionError> {
        let snapshot = self.snapshot().await?;
        let (namespace, selector) = match target {
            TargetRef::Workload(workload) => {
                let info = self.workload(&snapshot, workload)?;
                match &info.selector {
                    Some(selector) => (workload.namespace.as_str(), selector),
                    // a controller without a selector owns nothing
                    None => return Ok(Vec::new()),
                }
            }
            TargetRef::PodSelector {
                namespace,
                selector,
            } => (namespace.as_str(), selector),
        };

        let mut pods: Vec<PodInfo> = snapshot
            .pods
            .iter()
            .filter(|p| p.id.namespace == namespace && p.is_active() && selector.matches(&p.labels))
            .cloned()
            .collect();
        pods.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pods)
    }

    /// Declared pod template of a workload
    pub async fn resolve_pod_template(
        &self,
        workload: &WorkloadRef,
    ) -> Result<PodTemplate, PredictionError> {
        let snapshot = self.snapshot().await?;
        Ok(self.workload(&snapshot, workload)?.template.clone())
    }
}
