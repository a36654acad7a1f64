//! Predictor configuration

use anyhow::{Context, Result};
use predict_lib::checkpoint::FileCheckpointConfig;
use predict_lib::manager::ManagerConfig;
use predict_lib::metrics::{PrometheusSourceConfig, RepositoryConfig};
use predict_lib::profiler::{ProfilerConfig, DEFAULT_HALF_LIFE_CYCLES};
use predict_lib::resolver::ResolverConfig;
use predict_lib::status::PublisherConfig;
use predict_lib::{
    ApiKind, HierarchyLevel, OwnerRef, PredictionProfileSpec, ProfileKey, PrometheusSource,
    TargetRef,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "PREDICTOR_CONFIG_FILE";

/// Predictor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Profiling interval in seconds
    #[serde(default = "default_profile_interval")]
    pub profile_interval_secs: u64,

    #[serde(default = "default_max_concurrent_profiles")]
    pub max_concurrent_profiles: usize,

    /// Usage cache refresh interval in seconds
    #[serde(default = "default_metrics_refresh")]
    pub metrics_refresh_secs: u64,

    /// Cluster view refresh interval in seconds
    #[serde(default = "default_resolver_refresh")]
    pub resolver_refresh_secs: u64,

    /// Status publish interval in seconds
    #[serde(default = "default_status_update")]
    pub status_update_secs: u64,

    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Age after which checkpoints of unregistered profiles are deleted
    #[serde(default = "default_checkpoint_grace")]
    pub checkpoint_grace_secs: u64,

    /// How long a container entry outlives its last observed pod
    #[serde(default = "default_container_grace")]
    pub container_grace_secs: u64,

    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Half-life in profiling cycles for models that name none
    #[serde(default = "default_half_life")]
    pub decay_half_life_cycles: f64,

    /// Collect usage from metrics.k8s.io
    #[serde(default = "default_true")]
    pub metrics_api_enabled: bool,

    /// Named Prometheus-compatible backends
    #[serde(default)]
    pub prometheus: Vec<PrometheusSourceConfig>,

    /// Controller kinds beyond the built-in workload kinds
    #[serde(default)]
    pub extended_kinds: Vec<ApiKind>,

    /// Custom resource receiving published results
    #[serde(default = "default_status_target")]
    pub status_target: ApiKind,

    /// Profiles registered at startup
    #[serde(default)]
    pub profiles: Vec<StaticProfile>,
}

/// A profile registered from configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StaticProfile {
    pub target: TargetRef,
    #[serde(default)]
    pub hierarchy: HierarchyLevel,
    #[serde(default)]
    pub owner: Option<OwnerRef>,
    /// Defaults to the standard spec for the target type
    #[serde(default)]
    pub spec: Option<PredictionProfileSpec>,
}

impl StaticProfile {
    pub fn resolve(&self, backends: &[PrometheusSource]) -> (ProfileKey, PredictionProfileSpec) {
        let mut spec = match (&self.spec, &self.target) {
            (Some(spec), _) => spec.clone(),
            (None, TargetRef::Workload(_)) => {
                PredictionProfileSpec::for_workload(None, backends)
            }
            (None, TargetRef::PodSelector { .. }) => PredictionProfileSpec::for_pod_selector(None),
        };
        if spec.owner.is_none() {
            spec.owner = self.owner.clone();
        }
        let key = ProfileKey::new(self.target.clone(), self.hierarchy, &spec);
        (key, spec)
    }
}

fn default_api_port() -> u16 {
    8080
}

fn default_profile_interval() -> u64 {
    60
}

fn default_max_concurrent_profiles() -> usize {
    8
}

fn default_metrics_refresh() -> u64 {
    120
}

fn default_resolver_refresh() -> u64 {
    60
}

fn default_status_update() -> u64 {
    300
}

fn default_checkpoint_dir() -> PathBuf {
    FileCheckpointConfig::default().directory
}

fn default_checkpoint_grace() -> u64 {
    60 * 60
}

fn default_container_grace() -> u64 {
    10 * 60
}

fn default_gc_interval() -> u64 {
    10 * 60
}

fn default_half_life() -> f64 {
    DEFAULT_HALF_LIFE_CYCLES
}

fn default_true() -> bool {
    true
}

fn default_status_target() -> ApiKind {
    ApiKind {
        group: "analysis.koordinator.sh".to_string(),
        version: "v1alpha1".to_string(),
        kind: "Recommendation".to_string(),
        plural: "recommendations".to_string(),
    }
}

impl PredictorConfig {
    /// Load configuration from the optional file and `PREDICTOR__*` environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PREDICTOR")
                .separator("__")
                .try_parsing(true),
        );
        Self::from_builder(builder)
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Backends as referenced by default workload specs
    pub fn prometheus_sources(&self) -> Vec<PrometheusSource> {
        self.prometheus.iter().map(PrometheusSourceConfig::source).collect()
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            profile_interval: Duration::from_secs(self.profile_interval_secs),
            max_concurrent_profiles: self.max_concurrent_profiles,
            checkpoint_grace_period: Duration::from_secs(self.checkpoint_grace_secs),
            gc_interval: Duration::from_secs(self.gc_interval_secs),
            profiler: ProfilerConfig {
                container_grace_period: Duration::from_secs(self.container_grace_secs),
                default_half_life_cycles: self.decay_half_life_cycles,
            },
        }
    }

    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig {
            refresh_interval: Duration::from_secs(self.metrics_refresh_secs),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            refresh_interval: Duration::from_secs(self.resolver_refresh_secs),
            extended_kinds: self.extended_kinds.clone(),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            interval: Duration::from_secs(self.status_update_secs),
            ..Default::default()
        }
    }

    pub fn checkpoint_config(&self) -> FileCheckpointConfig {
        FileCheckpointConfig {
            directory: self.checkpoint_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};
    use predict_lib::{ResourceName, SourceDescriptor};

    fn parse(json: &str) -> PredictorConfig {
        PredictorConfig::from_builder(
            config::Config::builder().add_source(File::from_str(json, FileFormat::Json)),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse("{}");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.profile_interval_secs, 60);
        assert!(config.metrics_api_enabled);
        assert!(config.prometheus.is_empty());
        assert_eq!(config.status_target.kind, "Recommendation");

        let manager = config.manager_config();
        assert_eq!(manager.checkpoint_grace_period, Duration::from_secs(3600));
        assert_eq!(manager.profiler.container_grace_period, Duration::from_secs(600));
    }

    #[test]
    fn test_backends_and_static_profiles() {
        let config = parse(
            r#"{
                "prometheus": [
                    {"name": "vms-kube", "endpoint": "http://vm:8428"}
                ],
                "profiles": [
                    {
                        "target": {"type": "workload", "kind": "Deployment", "namespace": "shop", "name": "cart"},
                        "owner": {"namespace": "shop", "name": "cart-recommendation"}
                    }
                ]
            }"#,
        );

        let sources = config.prometheus_sources();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].resources.contains(&ResourceName::StorageRead));

        let (key, spec) = config.profiles[0].resolve(&sources);
        assert_eq!(key.hierarchy, HierarchyLevel::Container);
        assert_eq!(
            spec.source_descriptors(),
            vec![
                SourceDescriptor::MetricsApi,
                SourceDescriptor::Prometheus {
                    name: "vms-kube".to_string()
                }
            ]
        );
        assert_eq!(spec.owner.as_ref().map(|o| o.name.as_str()), Some("cart-recommendation"));
        assert!(key.matches_spec(&spec));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let result = PredictorConfig::from_builder(
            config::Config::builder()
                .add_source(File::from_str(r#"{"api_port": "not-a-port"}"#, FileFormat::Json)),
        );
        assert!(result.is_err());
    }
}
