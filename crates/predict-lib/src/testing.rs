//! Shared fixtures for unit tests

use crate::checkpoint::MemoryCheckpointStore;
use crate::metrics::{
    MetricsRepository, PodUsage, RawUsage, RepositoryConfig, StaticUsageSource, UsageSnapshot,
    UsageSource,
};
use crate::models::{
    HierarchyLevel, PodIdentity, PodInfo, PodTemplate, PredictionProfileSpec, ProfileKey,
    ResourceName, SourceDescriptor, TargetRef, WorkloadRef,
};
use crate::profiler::ProfilerContext;
use crate::resolver::{
    ClusterSnapshot, LabelSelector, ResolverConfig, StaticClusterSource, WorkloadInfo,
    WorkloadKey, WorkloadResolver,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Deployment `default/web` selecting `app=web`, with the given running
/// pods and their container names. The template declares `template_containers`.
pub fn web_cluster(pods: &[(&str, &[&str])], template_containers: &[&str]) -> ClusterSnapshot {
    let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
    let mut workloads = HashMap::new();
    workloads.insert(
        WorkloadKey::new("Deployment", "default", "web"),
        WorkloadInfo {
            selector: Some(LabelSelector::from_labels([("app", "web")])),
            template: PodTemplate {
                labels: labels.clone(),
                containers: template_containers.iter().map(|c| c.to_string()).collect(),
            },
        },
    );
    ClusterSnapshot {
        workloads,
        pods: pods
            .iter()
            .map(|(name, containers)| PodInfo {
                id: PodIdentity::new("default", *name),
                labels: labels.clone(),
                containers: containers.iter().map(|c| c.to_string()).collect(),
                phase: Some("Running".to_string()),
            })
            .collect(),
    }
}

/// Usage snapshot from `(pod, container, resource, quantity)` rows, all
/// observed at `at`
pub fn usage(at: DateTime<Utc>, rows: &[(&str, &str, ResourceName, &str)]) -> UsageSnapshot {
    let mut snapshot = UsageSnapshot::default();
    for (pod, container, resource, quantity) in rows {
        snapshot
            .pods
            .entry(PodIdentity::new("default", *pod))
            .or_insert_with(|| PodUsage::new(at))
            .insert(*container, *resource, RawUsage::Text(quantity.to_string()));
    }
    snapshot
}

pub fn web_target() -> TargetRef {
    TargetRef::Workload(WorkloadRef::new("Deployment", "default", "web"))
}

pub fn web_key(spec: &PredictionProfileSpec, hierarchy: HierarchyLevel) -> ProfileKey {
    ProfileKey::new(web_target(), hierarchy, spec)
}

/// Resolver, repository and checkpoint store over static sources
pub struct Fixture {
    pub cluster: Arc<StaticClusterSource>,
    pub usage: Arc<StaticUsageSource>,
    pub resolver: Arc<WorkloadResolver>,
    pub repository: Arc<MetricsRepository>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
}

impl Fixture {
    /// Both caches are refreshed once before returning
    pub async fn new(cluster: ClusterSnapshot, usage: UsageSnapshot) -> Self {
        let cluster = Arc::new(StaticClusterSource::new(cluster));
        let usage = Arc::new(StaticUsageSource::new(SourceDescriptor::MetricsApi, usage));
        let resolver = Arc::new(WorkloadResolver::new(
            ResolverConfig::default(),
            cluster.clone(),
        ));
        let repository = Arc::new(MetricsRepository::new(
            RepositoryConfig::default(),
            vec![usage.clone() as Arc<dyn UsageSource>],
        ));
        resolver.refresh().await.unwrap();
        repository.refresh_all().await;
        Self {
            cluster,
            usage,
            resolver,
            repository,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    pub fn context(&self) -> ProfilerContext {
        ProfilerContext {
            resolver: self.resolver.clone(),
            repository: self.repository.clone(),
            checkpoints: self.checkpoints.clone(),
        }
    }

    pub async fn set_usage(&self, snapshot: UsageSnapshot) {
        self.usage.set(Some(snapshot));
        self.repository.refresh_all().await;
    }

    pub async fn set_cluster(&self, snapshot: ClusterSnapshot) {
        self.cluster.set(Some(snapshot));
        self.resolver.refresh().await.unwrap();
    }
}
