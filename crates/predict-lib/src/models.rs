//! Core data models for the prediction engine

use crate::error::PredictionError;
use crate::estimator::{DistributionState, Quantile};
use crate::resolver::LabelSelector;
use chrono::{DateTime, Utc};
use kube::core::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Quantile labels reported when a distribution model names none
pub const DEFAULT_QUANTILES: &[&str] = &["p50", "p90", "p99"];

/// Resource kinds the engine can profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceName {
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "fsread")]
    StorageRead,
    #[serde(rename = "fswrite")]
    StorageWrite,
    #[serde(rename = "memory_bandwidth")]
    MemoryBandwidth,
    #[serde(rename = "disk_read")]
    DiskRead,
    #[serde(rename = "disk_write")]
    DiskWrite,
}

impl ResourceName {
    pub const ALL: [ResourceName; 7] = [
        ResourceName::Cpu,
        ResourceName::Memory,
        ResourceName::StorageRead,
        ResourceName::StorageWrite,
        ResourceName::MemoryBandwidth,
        ResourceName::DiskRead,
        ResourceName::DiskWrite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceName::Cpu => "cpu",
            ResourceName::Memory => "memory",
            ResourceName::StorageRead => "fsread",
            ResourceName::StorageWrite => "fswrite",
            ResourceName::MemoryBandwidth => "memory_bandwidth",
            ResourceName::DiskRead => "disk_read",
            ResourceName::DiskWrite => "disk_write",
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceName {
    type Err = PredictionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceName::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| PredictionError::InvalidSpec(format!("unknown resource name {s:?}")))
    }
}

/// A single timestamped usage observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Namespaced pod name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
}

impl PodIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pod as seen by the workload resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub id: PodIdentity,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub phase: Option<String>,
}

impl PodInfo {
    /// Pods in a terminal phase no longer produce usage
    pub fn is_active(&self) -> bool {
        !matches!(self.phase.as_deref(), Some("Succeeded") | Some("Failed"))
    }
}

/// Declared pod template of a workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub containers: Vec<String>,
}

/// Reference to a workload controller
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl WorkloadRef {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
            api_version: None,
        }
    }
}

/// What a profile observes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TargetRef {
    Workload(WorkloadRef),
    #[serde(rename_all = "camelCase")]
    PodSelector {
        namespace: String,
        selector: LabelSelector,
    },
}

impl TargetRef {
    pub fn namespace(&self) -> &str {
        match self {
            TargetRef::Workload(w) => &w.namespace,
            TargetRef::PodSelector { namespace, .. } => namespace,
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Workload(w) => write!(f, "{}/{}/{}", w.kind, w.namespace, w.name),
            TargetRef::PodSelector { namespace, selector } => {
                write!(f, "selector/{namespace}/{selector}")
            }
        }
    }
}

/// Granularity of the produced distributions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HierarchyLevel {
    /// One aggregate entry per pod, keyed by [`crate::profiler::POD_ENTRY`]
    Pod,
    /// One entry per container name
    #[default]
    Container,
}

/// Estimator kinds a profile can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EstimatorKind {
    Distribution,
}

/// Identity of a usage backend, without its resource list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum SourceDescriptor {
    MetricsApi,
    Prometheus { name: String },
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::MetricsApi => f.write_str("metrics-api"),
            SourceDescriptor::Prometheus { name } => write!(f, "prometheus/{name}"),
        }
    }
}

/// Resources read from the cluster metrics API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricServerSource {
    pub resources: Vec<ResourceName>,
}

/// Resources read from a named Prometheus-compatible backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusSource {
    pub name: String,
    pub resources: Vec<ResourceName>,
}

/// A usage source selection: one tag, one payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum MetricSource {
    MetricsApi(MetricServerSource),
    Prometheus(PrometheusSource),
}

impl MetricSource {
    pub fn descriptor(&self) -> SourceDescriptor {
        match self {
            MetricSource::MetricsApi(_) => SourceDescriptor::MetricsApi,
            MetricSource::Prometheus(p) => SourceDescriptor::Prometheus {
                name: p.name.clone(),
            },
        }
    }

    pub fn resources(&self) -> &[ResourceName] {
        match self {
            MetricSource::MetricsApi(m) => &m.resources,
            MetricSource::Prometheus(p) => &p.resources,
        }
    }
}

/// Source tags accepted in the loose wire form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricSourceType {
    MetricsApi,
    Prometheus,
}

/// One named backend with the resources read from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusMetric {
    pub source: String,
    pub resources: Vec<ResourceName>,
}

/// Loose wire form of a metric selection: a tag plus optional payloads.
/// Converted into [`MetricSource`] values, rejecting mismatched payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMetricSpec {
    pub source: MetricSourceType,
    #[serde(default)]
    pub metric_server: Option<MetricServerSource>,
    #[serde(default)]
    pub prometheus: Option<Vec<PrometheusMetric>>,
}

impl TryFrom<RawMetricSpec> for Vec<MetricSource> {
    type Error = PredictionError;

    fn try_from(raw: RawMetricSpec) -> Result<Self, Self::Error> {
        match (raw.source, raw.metric_server, raw.prometheus) {
            (MetricSourceType::MetricsApi, Some(server), None) => {
                Ok(vec![MetricSource::MetricsApi(server)])
            }
            (MetricSourceType::Prometheus, None, Some(metrics)) => {
                if metrics.is_empty() {
                    return Err(PredictionError::InvalidSpec(
                        "prometheus source lists no backends".to_string(),
                    ));
                }
                Ok(metrics
                    .into_iter()
                    .map(|m| {
                        MetricSource::Prometheus(PrometheusSource {
                            name: m.source,
                            resources: m.resources,
                        })
                    })
                    .collect())
            }
            (MetricSourceType::MetricsApi, None, _) => Err(PredictionError::InvalidSpec(
                "metricsApi source without metricServer payload".to_string(),
            )),
            (MetricSourceType::Prometheus, _, None) => Err(PredictionError::InvalidSpec(
                "prometheus source without prometheus payload".to_string(),
            )),
            (tag, _, _) => Err(PredictionError::InvalidSpec(format!(
                "{tag:?} source carries a payload for another source"
            ))),
        }
    }
}

/// Distribution estimator parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionModel {
    /// Quantile labels such as "p50" or "p99.9"; empty means the defaults
    #[serde(default)]
    pub quantiles: Vec<String>,
    /// Half-life of sample weights, in profiling cycles
    #[serde(default)]
    pub decay_half_life_cycles: Option<f64>,
}

impl DistributionModel {
    pub fn parsed_quantiles(&self) -> Result<Vec<Quantile>, PredictionError> {
        if self.quantiles.is_empty() {
            return DEFAULT_QUANTILES.iter().map(|q| q.parse()).collect();
        }
        self.quantiles.iter().map(|q| q.parse()).collect()
    }
}

/// Requested estimator with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EstimatorSpec {
    Distribution(DistributionModel),
}

impl EstimatorSpec {
    pub fn kind(&self) -> EstimatorKind {
        match self {
            EstimatorSpec::Distribution(_) => EstimatorKind::Distribution,
        }
    }
}

/// Object whose status receives the published results
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerRef {
    pub namespace: String,
    pub name: String,
}

/// Group/version/kind/plural of a cluster API type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl ApiKind {
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

/// Full description of what a profile should estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionProfileSpec {
    #[serde(default)]
    pub owner: Option<OwnerRef>,
    pub metrics: Vec<MetricSource>,
    pub estimators: Vec<EstimatorSpec>,
}

impl PredictionProfileSpec {
    /// Build and validate a spec
    pub fn new(
        owner: Option<OwnerRef>,
        metrics: Vec<MetricSource>,
        estimators: Vec<EstimatorSpec>,
    ) -> Result<Self, PredictionError> {
        let spec = Self {
            owner,
            metrics,
            estimators,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Default spec for a workload target: metrics API for cpu/memory plus
    /// every given Prometheus backend, single distribution estimator
    pub fn for_workload(owner: Option<OwnerRef>, backends: &[PrometheusSource]) -> Self {
        let mut metrics = vec![MetricSource::MetricsApi(MetricServerSource {
            resources: vec![ResourceName::Cpu, ResourceName::Memory],
        })];
        metrics.extend(backends.iter().cloned().map(MetricSource::Prometheus));
        Self {
            owner,
            metrics,
            estimators: vec![EstimatorSpec::Distribution(DistributionModel::default())],
        }
    }

    /// Default spec for a label selector target: metrics API only
    pub fn for_pod_selector(owner: Option<OwnerRef>) -> Self {
        Self::for_workload(owner, &[])
    }

    pub fn validate(&self) -> Result<(), PredictionError> {
        if self.metrics.is_empty() {
            return Err(PredictionError::InvalidSpec("no metric sources".to_string()));
        }
        if self.estimators.is_empty() {
            return Err(PredictionError::InvalidSpec("no estimators".to_string()));
        }
        let mut seen = BTreeSet::new();
        for source in &self.metrics {
            if source.resources().is_empty() {
                return Err(PredictionError::InvalidSpec(format!(
                    "source {} lists no resources",
                    source.descriptor()
                )));
            }
            if let MetricSource::MetricsApi(api) = source {
                if let Some(resource) = api
                    .resources
                    .iter()
                    .find(|r| !matches!(r, ResourceName::Cpu | ResourceName::Memory))
                {
                    return Err(PredictionError::InvalidSpec(format!(
                        "metrics API does not serve {resource}"
                    )));
                }
            }
            if !seen.insert(source.descriptor()) {
                return Err(PredictionError::InvalidSpec(format!(
                    "source {} listed twice",
                    source.descriptor()
                )));
            }
        }
        for estimator in &self.estimators {
            match estimator {
                EstimatorSpec::Distribution(model) => {
                    model.parsed_quantiles()?;
                    if let Some(half_life) = model.decay_half_life_cycles {
                        if !(half_life.is_finite() && half_life > 0.0) {
                            return Err(PredictionError::InvalidSpec(format!(
                                "decay half-life must be positive, got {half_life}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Sorted, deduplicated source descriptors
    pub fn source_descriptors(&self) -> Vec<SourceDescriptor> {
        let set: BTreeSet<_> = self.metrics.iter().map(MetricSource::descriptor).collect();
        set.into_iter().collect()
    }

    /// Sorted, deduplicated estimator kinds
    pub fn estimator_kinds(&self) -> Vec<EstimatorKind> {
        let set: BTreeSet<_> = self.estimators.iter().map(EstimatorSpec::kind).collect();
        set.into_iter().collect()
    }

    /// Union of resources across all sources
    pub fn requested_resources(&self) -> BTreeSet<ResourceName> {
        self.metrics
            .iter()
            .flat_map(|m| m.resources().iter().copied())
            .collect()
    }

    pub fn distribution(&self) -> Option<&DistributionModel> {
        self.estimators.iter().find_map(|e| match e {
            EstimatorSpec::Distribution(model) => Some(model),
        })
    }
}

/// Identity of a profile: target, sources, estimators and hierarchy level.
/// Two registrations with equal keys share one profiler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileKey {
    pub target: TargetRef,
    pub sources: Vec<SourceDescriptor>,
    pub estimators: Vec<EstimatorKind>,
    pub hierarchy: HierarchyLevel,
}

impl ProfileKey {
    /// Derive the key for a target observed with the given spec
    pub fn new(target: TargetRef, hierarchy: HierarchyLevel, spec: &PredictionProfileSpec) -> Self {
        Self {
            target,
            sources: spec.source_descriptors(),
            estimators: spec.estimator_kinds(),
            hierarchy,
        }
    }

    /// Checks that a spec's sources and estimators agree with this key
    pub fn matches_spec(&self, spec: &PredictionProfileSpec) -> bool {
        self.sources == spec.source_descriptors() && self.estimators == spec.estimator_kinds()
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:?}", self.target, self.hierarchy)?;
        for source in &self.sources {
            write!(f, " {source}")?;
        }
        f.write_str("]")
    }
}

/// Summary statistics of one resource distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDistribution {
    pub mean: f64,
    pub std_dev: f64,
    pub quantiles: BTreeMap<String, f64>,
    pub first_sample_start: Option<DateTime<Utc>>,
    pub last_sample_start: Option<DateTime<Utc>>,
    pub total_samples_count: u64,
}

impl From<&DistributionState> for ResourceDistribution {
    fn from(state: &DistributionState) -> Self {
        Self {
            mean: state.mean,
            std_dev: state.std_dev,
            quantiles: state.quantiles.clone(),
            first_sample_start: state.first_sample_start,
            last_sample_start: state.last_sample_start,
            total_samples_count: state.total_samples_count,
        }
    }
}

/// Per-resource distributions of one container (or the pod aggregate)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResourceResult {
    pub resources: BTreeMap<ResourceName, ResourceDistribution>,
}

/// Results keyed by container name
pub type ProfileResult = BTreeMap<String, ContainerResourceResult>;
