//! Cluster metrics API backend (`metrics.k8s.io/v1beta1` PodMetrics)

use super::{PodUsage, RawUsage, UsageSnapshot, UsageSource};
use crate::models::{PodIdentity, ResourceName, SourceDescriptor};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::Value;
use tracing::debug;

const GROUP: &str = "metrics.k8s.io";
const VERSION: &str = "v1beta1";
const KIND: &str = "PodMetrics";
const PLURAL: &str = "pods";

/// Reads pod usage from the resource metrics API
pub struct MetricsApiSource {
    client: Client,
    resource: ApiResource,
}

impl MetricsApiSource {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk(GROUP, VERSION, KIND);
        Self {
            client,
            resource: ApiResource::from_gvk_with_plural(&gvk, PLURAL),
        }
    }
}

#[async_trait]
impl UsageSource for MetricsApiSource {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::MetricsApi
    }

    async fn fetch(&self) -> anyhow::Result<UsageSnapshot> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.resource);
        let list = api
            .list(&ListParams::default())
            .await
            .context("Failed to list pod metrics")?;

        let mut snapshot = UsageSnapshot::default();
        for object in &list.items {
            let (Some(namespace), Some(name)) =
                (object.metadata.namespace.as_deref(), object.metadata.name.as_deref())
            else {
                continue;
            };
            snapshot
                .pods
                .insert(PodIdentity::new(namespace, name), pod_usage(&object.data));
        }
        debug!(pods = snapshot.pods.len(), "Listed pod metrics");
        Ok(snapshot)
    }
}

/// Convert the body of one PodMetrics object. Quantities stay unparsed so
/// that a malformed value only drops that value.
fn pod_usage(data: &Value) -> PodUsage {
    let timestamp = data
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let mut usage = PodUsage::new(timestamp);
    let containers = data
        .get("containers")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for container in containers {
        let Some(name) = container.get("name").and_then(Value::as_str) else {
            continue;
        };
        let Some(resources) = container.get("usage").and_then(Value::as_object) else {
            continue;
        };
        for (key, quantity) in resources {
            let Ok(resource) = key.parse::<ResourceName>() else {
                continue;
            };
            if let Some(text) = quantity.as_str() {
                usage.insert(name, resource, RawUsage::Text(text.to_string()));
            }
        }
    }
    usage
}
