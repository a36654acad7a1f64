//! Prometheus-compatible backend
//!
//! Runs one instant query per resource against `/api/v1/query` and keys the
//! resulting vector by the `namespace`, `pod` and `container` labels.

use super::{PodUsage, RawUsage, UsageSnapshot, UsageSource};
use crate::models::{PodIdentity, PrometheusSource, ResourceName, SourceDescriptor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Configuration of one named backend
#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusSourceConfig {
    /// Backend name referenced by profile specs, e.g. "vms-kube"
    pub name: String,
    /// Base URL of the query API
    pub endpoint: String,
    /// PromQL per resource; empty means the built-in container queries
    #[serde(default)]
    pub queries: BTreeMap<ResourceName, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl PrometheusSourceConfig {
    pub fn effective_queries(&self) -> BTreeMap<ResourceName, String> {
        if !self.queries.is_empty() {
            return self.queries.clone();
        }
        BTreeMap::from([
            (
                ResourceName::Cpu,
                r#"sum by (namespace, pod, container) (rate(container_cpu_usage_seconds_total{container!=""}[5m]))"#.to_string(),
            ),
            (
                ResourceName::Memory,
                r#"sum by (namespace, pod, container) (container_memory_working_set_bytes{container!=""})"#.to_string(),
            ),
            (
                ResourceName::StorageRead,
                r#"sum by (namespace, pod, container) (rate(container_fs_reads_bytes_total{container!=""}[5m]))"#.to_string(),
            ),
            (
                ResourceName::StorageWrite,
                r#"sum by (namespace, pod, container) (rate(container_fs_writes_bytes_total{container!=""}[5m]))"#.to_string(),
            ),
        ])
    }

    /// Metric source payload advertising the resources this backend serves
    pub fn source(&self) -> PrometheusSource {
        PrometheusSource {
            name: self.name.clone(),
            resources: self.effective_queries().into_keys().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<VectorSeries>,
}

#[derive(Debug, Deserialize)]
struct VectorSeries {
    #[serde(default)]
    metric: HashMap<String, String>,
    /// `[unix_seconds, "value"]`
    value: (f64, String),
}

/// Usage source backed by a Prometheus query API
pub struct PrometheusUsageSource {
    name: String,
    client: Client,
    query_url: Url,
    queries: BTreeMap<ResourceName, String>,
}

impl PrometheusUsageSource {
    pub fn new(config: &PrometheusSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let mut base_url = Url::parse(&config.endpoint).context("Invalid Prometheus URL")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let query_url = base_url.join("api/v1/query").context("Invalid query path")?;

        Ok(Self {
            name: config.name.clone(),
            client,
            query_url,
            queries: config.effective_queries(),
        })
    }

    async fn query(&self, promql: &str) -> Result<Vec<VectorSeries>> {
        let response = self
            .client
            .get(self.query_url.clone())
            .query(&[("query", promql)])
            .send()
            .await
            .context("Failed to send query")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Prometheus error ({}): {}", status, body);
        }

        let body: QueryResponse = response.json().await.context("Failed to parse response")?;
        if body.status != "success" {
            anyhow::bail!(
                "Prometheus query failed: {}",
                body.error.unwrap_or_else(|| body.status.clone())
            );
        }
        let data = body.data.context("Prometheus response has no data")?;
        if data.result_type != "vector" {
            anyhow::bail!("Unexpected result type {:?}", data.result_type);
        }
        Ok(data.result)
    }
}

#[async_trait]
impl UsageSource for PrometheusUsageSource {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::Prometheus {
            name: self.name.clone(),
        }
    }

    async fn fetch(&self) -> Result<UsageSnapshot> {
        let mut snapshot = UsageSnapshot::default();
        for (resource, promql) in &self.queries {
            let series = self
                .query(promql)
                .await
                .with_context(|| format!("{} query for {resource}", self.name))?;
            merge_series(&mut snapshot, *resource, series);
        }
        debug!(source = %self.name, pods = snapshot.pods.len(), "Fetched Prometheus usage");
        Ok(snapshot)
    }
}

fn merge_series(snapshot: &mut UsageSnapshot, resource: ResourceName, series: Vec<VectorSeries>) {
    for s in series {
        let (Some(namespace), Some(pod), Some(container)) = (
            s.metric.get("namespace"),
            s.metric.get("pod"),
            s.metric.get("container"),
        ) else {
            continue;
        };
        let timestamp = Utc
            .timestamp_millis_opt((s.value.0 * 1000.0) as i64)
            .single()
            .unwrap_or_else(Utc::now);
        let usage = snapshot
            .pods
            .entry(PodIdentity::new(namespace.as_str(), pod.as_str()))
            .or_insert_with(|| PodUsage::new(timestamp));
        usage.timestamp = usage.timestamp.max(timestamp);
        // sample values are plain floats; anything else goes through the
        // quantity parser and is rejected there
        let raw = match s.value.1.parse::<f64>() {
            Ok(value) => RawUsage::Value(value),
            Err(_) => RawUsage::Text(s.value.1),
        };
        usage.insert(container.as_str(), resource, raw);
    }
}
