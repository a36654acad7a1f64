//! Status publisher
//!
//! Periodically renders the manager's latest results and writes them to
//! the status subresource of each profile's owning custom resource.

use crate::manager::PredictionManager;
use crate::models::{
    ApiKind, OwnerRef, ProfileKey, ProfileResult, ResourceDistribution, ResourceName,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Destination of rendered status bodies
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write_status(&self, owner: &OwnerRef, status: &Value) -> Result<()>;
}

/// Writes status with a merge patch on the owner's status subresource
pub struct KubeStatusWriter {
    client: Client,
    resource: ApiResource,
}

impl KubeStatusWriter {
    pub fn new(client: Client, kind: &ApiKind) -> Self {
        Self {
            client,
            resource: kind.api_resource(),
        }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write_status(&self, owner: &OwnerRef, status: &Value) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &owner.namespace, &self.resource);
        let patch = json!({ "status": status });
        api.patch_status(&owner.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| {
                format!(
                    "Failed to patch status of {} {}/{}",
                    self.resource.kind, owner.namespace, owner.name
                )
            })?;
        Ok(())
    }
}

/// Configuration for the status publisher
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Publish interval (default: 5 minutes)
    pub interval: Duration,
    /// Maximum status writes in flight (default: 5)
    pub max_concurrent_writes: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_concurrent_writes: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub written: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct StatusPublisher {
    manager: Arc<PredictionManager>,
    writer: Arc<dyn StatusWriter>,
    config: PublisherConfig,
    /// Last body successfully written per profile
    written: DashMap<ProfileKey, Value>,
    last_summary: RwLock<Option<PublishSummary>>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl StatusPublisher {
    pub fn new(
        config: PublisherConfig,
        manager: Arc<PredictionManager>,
        writer: Arc<dyn StatusWriter>,
    ) -> Self {
        Self {
            manager,
            writer,
            config,
            written: DashMap::new(),
            last_summary: RwLock::new(None),
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("status-publisher"),
        }
    }

    /// Render every registered profile that has an owner and write the
    /// bodies that changed since the last successful write
    pub async fn publish_once(&self) -> PublishSummary {
        let mut summary = PublishSummary::default();
        if !self.manager.started() {
            return summary;
        }

        let statuses = self.manager.snapshot().await;
        let live: HashSet<&ProfileKey> = statuses.iter().map(|s| &s.key).collect();
        self.written.retain(|key, _| live.contains(key));

        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_writes.max(1)));
        let mut tasks = JoinSet::new();
        for status in &statuses {
            let Some(owner) = status.owner.clone() else {
                continue;
            };
            let body = render_status(&status.result);
            if self.written.get(&status.key).map_or(false, |w| *w == body) {
                summary.unchanged += 1;
                continue;
            }

            let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                break;
            };
            let writer = Arc::clone(&self.writer);
            let key = status.key.clone();
            let containers = status.result.len();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = writer.write_status(&owner, &body).await;
                (key, owner, containers, body, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, owner, containers, body, Ok(()))) => {
                    let owner = format!("{}/{}", owner.namespace, owner.name);
                    self.logger.log_status_published(&owner, containers, true);
                    self.metrics.inc_status_writes("success");
                    // a profile unregistered mid-write must not be cached
                    if self.manager.is_registered(&key) {
                        self.written.insert(key, body);
                    }
                    summary.written += 1;
                }
                Ok((key, owner, containers, _, Err(e))) => {
                    let owner = format!("{}/{}", owner.namespace, owner.name);
                    warn!(profile = %key, error = %e, "Status write failed");
                    self.logger.log_status_published(&owner, containers, false);
                    self.metrics.inc_status_writes("failure");
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Status write task aborted");
                    self.metrics.inc_status_writes("failure");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting status publisher loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.publish_once().await;
                    *self.last_summary.write().await = Some(summary.clone());
                    debug!(
                        written = summary.written,
                        unchanged = summary.unchanged,
                        failed = summary.failed,
                        "Status publish round complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down status publisher");
                    break;
                }
            }
        }
    }

    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown.subscribe()))
    }

    /// Outcome of the most recent scheduled round
    pub async fn last_summary(&self) -> Option<PublishSummary> {
        self.last_summary.read().await.clone()
    }
}

/// Status body for one profile: containers sorted by name, quantities in
/// Kubernetes notation
pub fn render_status(result: &ProfileResult) -> Value {
    // BTreeMap iteration keeps container and resource order stable
    let containers: Vec<Value> = result
        .iter()
        .map(|(name, container)| {
            let resources: Map<String, Value> = container
                .resources
                .iter()
                .map(|(resource, dist)| {
                    (resource.to_string(), render_distribution(*resource, dist))
                })
                .collect();
            json!({
                "containerName": name,
                "resources": resources,
            })
        })
        .collect();
    json!({ "containers": containers })
}

fn render_distribution(resource: ResourceName, dist: &ResourceDistribution) -> Value {
    let quantiles: Map<String, Value> = dist
        .quantiles
        .iter()
        .map(|(label, value)| (label.clone(), Value::String(format_quantity(resource, *value))))
        .collect();
    let mut body = json!({
        "mean": format_quantity(resource, dist.mean),
        "stddev": format_quantity(resource, dist.std_dev),
        "quantiles": quantiles,
        "totalSamplesCount": dist.total_samples_count,
    });
    if let Some(first) = dist.first_sample_start {
        body["firstSampleStart"] = Value::String(first.to_rfc3339());
    }
    if let Some(last) = dist.last_sample_start {
        body["lastSampleStart"] = Value::String(last.to_rfc3339());
    }
    body
}

/// CPU as millicores, memory as whole bytes, anything else as a plain number
pub fn format_quantity(resource: ResourceName, value: f64) -> String {
    match resource {
        ResourceName::Cpu => format!("{}m", (value * 1000.0).round() as i64),
        ResourceName::Memory => format!("{}", value.round() as i64),
        _ => {
            let rounded = (value * 1000.0).round() / 1000.0;
            if rounded.fract() == 0.0 {
                format!("{}", rounded as i64)
            } else {
                format!("{rounded}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::models::{ContainerResourceResult, HierarchyLevel, PredictionProfileSpec, TargetRef};
    use crate::resolver::LabelSelector;
    use crate::testing::{ts, usage, web_cluster, web_key, Fixture};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingWriter {
        writes: Mutex<Vec<(OwnerRef, Value)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl StatusWriter for RecordingWriter {
        async fn write_status(&self, owner: &OwnerRef, status: &Value) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("apiserver unavailable");
            }
            self.writes.lock().await.push((owner.clone(), status.clone()));
            Ok(())
        }
    }

    fn owner() -> OwnerRef {
        OwnerRef {
            namespace: "default".to_string(),
            name: "web-recommendation".to_string(),
        }
    }

    async fn setup() -> (Fixture, Arc<PredictionManager>, ProfileKey) {
        let fixture = Fixture::new(
            web_cluster(&[("web-1", &["app", "sidecar"])], &["app", "sidecar"]),
            usage(
                ts(0),
                &[
                    ("web-1", "app", ResourceName::Cpu, "200m"),
                    ("web-1", "sidecar", ResourceName::Cpu, "50m"),
                ],
            ),
        )
        .await;
        let manager = Arc::new(PredictionManager::new(
            ManagerConfig::default(),
            fixture.resolver.clone(),
            fixture.repository.clone(),
            fixture.checkpoints.clone(),
        ));
        assert!(manager.try_start().await);

        let spec = PredictionProfileSpec::for_workload(Some(owner()), &[]);
        let key = web_key(&spec, HierarchyLevel::Container);
        manager.register(key.clone(), spec).await.unwrap();
        manager.run_cycle().await;
        (fixture, manager, key)
    }

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(ResourceName::Cpu, 0.2), "200m");
        assert_eq!(format_quantity(ResourceName::Cpu, 1.5), "1500m");
        assert_eq!(format_quantity(ResourceName::Memory, 536870912.4), "536870912");
        assert_eq!(format_quantity(ResourceName::StorageRead, 42.0), "42");
        assert_eq!(format_quantity(ResourceName::StorageRead, 0.125), "0.125");
    }

    #[test]
    fn test_render_status_sorts_containers() {
        let mut result = BTreeMap::new();
        for name in ["zeta", "alpha"] {
            result.insert(name.to_string(), ContainerResourceResult::default());
        }
        let body = render_status(&result);
        let names: Vec<_> = body["containers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["containerName"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_publish_writes_then_skips_unchanged() {
        let (_fixture, manager, _) = setup().await;
        let writer = Arc::new(RecordingWriter::default());
        let publisher = StatusPublisher::new(PublisherConfig::default(), manager, writer.clone());

        let first = publisher.publish_once().await;
        assert_eq!(first.written, 1);

        let writes = writer.writes.lock().await.clone();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, owner());
        let app = &writes[0].1["containers"][0];
        assert_eq!(app["containerName"], "app");
        assert_eq!(app["resources"]["cpu"]["mean"], "200m");
        assert_eq!(app["resources"]["cpu"]["quantiles"]["p90"], "200m");

        let second = publisher.publish_once().await;
        assert_eq!(second.written, 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(writer.writes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried() {
        let (_fixture, manager, _) = setup().await;
        let writer = Arc::new(RecordingWriter::default());
        writer.fail.store(true, Ordering::SeqCst);
        let publisher = StatusPublisher::new(PublisherConfig::default(), manager, writer.clone());

        assert_eq!(publisher.publish_once().await.failed, 1);

        writer.fail.store(false, Ordering::SeqCst);
        assert_eq!(publisher.publish_once().await.written, 1);
    }

    #[tokio::test]
    async fn test_unregistered_profile_is_forgotten() {
        let (_fixture, manager, key) = setup().await;
        let writer = Arc::new(RecordingWriter::default());
        let publisher =
            StatusPublisher::new(PublisherConfig::default(), manager.clone(), writer.clone());
        publisher.publish_once().await;
        assert_eq!(publisher.written.len(), 1);

        manager.unregister(&key).await.unwrap();
        let summary = publisher.publish_once().await;
        assert_eq!(summary, PublishSummary::default());
        assert!(publisher.written.is_empty());
    }

    #[tokio::test]
    async fn test_profiles_without_owner_are_not_published() {
        let (_fixture, manager, _) = setup().await;
        let spec = PredictionProfileSpec::for_pod_selector(None);
        let key = ProfileKey::new(
            TargetRef::PodSelector {
                namespace: "default".to_string(),
                selector: LabelSelector::from_labels([("app", "web")]),
            },
            HierarchyLevel::Pod,
            &spec,
        );
        manager.register(key, spec).await.unwrap();
        manager.run_cycle().await;

        let writer = Arc::new(RecordingWriter::default());
        let publisher = StatusPublisher::new(PublisherConfig::default(), manager, writer.clone());
        let summary = publisher.publish_once().await;
        assert_eq!(summary.written, 1);
        let writes = writer.writes.lock().await;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, owner());
    }
}
