//! Cluster snapshots from the Kubernetes API

use super::{
    ClusterSnapshot, ClusterSource, LabelSelector, SelectorOperator, SelectorRequirement,
    WorkloadInfo, WorkloadKey,
};
use crate::models::{ApiKind, PodIdentity, PodInfo, PodTemplate};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector as K8sLabelSelector, ObjectMeta,
};
use kube::api::{Api, ListParams};
use kube::core::DynamicObject;
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Lists controllers and pods across all namespaces
pub struct KubeClusterSource {
    client: Client,
    extended_kinds: Vec<ApiKind>,
}

impl KubeClusterSource {
    pub fn new(client: Client, extended_kinds: Vec<ApiKind>) -> Self {
        Self {
            client,
            extended_kinds,
        }
    }

    async fn list_extended(
        &self,
        kind: &ApiKind,
        snapshot: &mut ClusterSnapshot,
    ) -> anyhow::Result<()> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &kind.api_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list {}", kind.kind))?;

        for object in list.items {
            let spec = object.data.get("spec");
            let selector = spec
                .and_then(|s| s.get("selector"))
                .and_then(|s| serde_json::from_value::<K8sLabelSelector>(s.clone()).ok());
            let template = spec
                .and_then(|s| s.get("template"))
                .and_then(|t| serde_json::from_value::<PodTemplateSpec>(t.clone()).ok());
            if let Some((key, info)) =
                workload_entry(&kind.kind, &object.metadata, selector.as_ref(), template.as_ref())
            {
                snapshot.workloads.insert(key, info);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterSource for KubeClusterSource {
    async fn snapshot(&self) -> anyhow::Result<ClusterSnapshot> {
        let params = ListParams::default();
        let mut snapshot = ClusterSnapshot::default();

        let deployments = Api::<Deployment>::all(self.client.clone())
            .list(&params)
            .await
            .context("Failed to list deployments")?;
        for d in &deployments.items {
            let spec = d.spec.as_ref();
            insert(
                &mut snapshot,
                workload_entry(
                    "Deployment",
                    &d.metadata,
                    spec.map(|s| &s.selector),
                    spec.map(|s| &s.template),
                ),
            );
        }

        let daemonsets = Api::<DaemonSet>::all(self.client.clone())
            .list(&params)
            .await
            .context("Failed to list daemonsets")?;
        for d in &daemonsets.items {
            let spec = d.spec.as_ref();
            insert(
                &mut snapshot,
                workload_entry(
                    "DaemonSet",
                    &d.metadata,
                    spec.map(|s| &s.selector),
                    spec.map(|s| &s.template),
                ),
            );
        }

        let replicasets = Api::<ReplicaSet>::all(self.client.clone())
            .list(&params)
            .await
            .context("Failed to list replicasets")?;
        for r in &replicasets.items {
            let spec = r.spec.as_ref();
            insert(
                &mut snapshot,
                workload_entry(
                    "ReplicaSet",
                    &r.metadata,
                    spec.map(|s| &s.selector),
                    spec.and_then(|s| s.template.as_ref()),
                ),
            );
        }

        let statefulsets = Api::<StatefulSet>::all(self.client.clone())
            .list(&params)
            .await
            .context("Failed to list statefulsets")?;
        for s in &statefulsets.items {
            let spec = s.spec.as_ref();
            insert(
                &mut snapshot,
                workload_entry(
                    "StatefulSet",
                    &s.metadata,
                    spec.map(|s| &s.selector),
                    spec.map(|s| &s.template),
                ),
            );
        }

        for kind in &self.extended_kinds {
            // an unavailable extension kind must not hide the built-in ones
            if let Err(e) = self.list_extended(kind, &mut snapshot).await {
                warn!(kind = %kind.kind, error = %e, "Skipping extended workload kind");
            }
        }

        let pods = Api::<Pod>::all(self.client.clone())
            .list(&params)
            .await
            .context("Failed to list pods")?;
        snapshot.pods = pods.items.iter().filter_map(pod_info).collect();

        debug!(
            workloads = snapshot.workloads.len(),
            pods = snapshot.pods.len(),
            "Listed cluster state"
        );
        Ok(snapshot)
    }
}

fn insert(snapshot: &mut ClusterSnapshot, entry: Option<(WorkloadKey, WorkloadInfo)>) {
    if let Some((key, info)) = entry {
        snapshot.workloads.insert(key, info);
    }
}

fn workload_entry(
    kind: &str,
    meta: &ObjectMeta,
    selector: Option<&K8sLabelSelector>,
    template: Option<&PodTemplateSpec>,
) -> Option<(WorkloadKey, WorkloadInfo)> {
    let name = meta.name.as_deref()?;
    let namespace = meta.namespace.as_deref()?;
    Some((
        WorkloadKey::new(kind, namespace, name),
        WorkloadInfo {
            selector: selector.map(LabelSelector::from),
            template: template.map(pod_template).unwrap_or_default(),
        },
    ))
}

fn pod_template(template: &PodTemplateSpec) -> PodTemplate {
    PodTemplate {
        labels: template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default(),
        containers: template
            .spec
            .as_ref()
            .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default(),
    }
}

fn pod_info(pod: &Pod) -> Option<PodInfo> {
    let name = pod.metadata.name.as_deref()?;
    let namespace = pod.metadata.namespace.as_deref()?;
    Some(PodInfo {
        id: PodIdentity::new(namespace, name),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        containers: pod
            .spec
            .as_ref()
            .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default(),
        phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
    })
}

impl From<&K8sLabelSelector> for LabelSelector {
    fn from(selector: &K8sLabelSelector) -> Self {
        let match_labels: BTreeMap<String, String> =
            selector.match_labels.clone().unwrap_or_default();
        let match_expressions = selector
            .match_expressions
            .iter()
            .flatten()
            .filter_map(|r| {
                let operator = match r.operator.as_str() {
                    "In" => SelectorOperator::In,
                    "NotIn" => SelectorOperator::NotIn,
                    "Exists" => SelectorOperator::Exists,
                    "DoesNotExist" => SelectorOperator::DoesNotExist,
                    other => {
                        warn!(operator = %other, key = %r.key, "Ignoring unknown selector operator");
                        return None;
                    }
                };
                Some(SelectorRequirement {
                    key: r.key.clone(),
                    operator,
                    values: r.values.clone().unwrap_or_default(),
                })
            })
            .collect();
        Self {
            match_labels,
            match_expressions,
        }
    }
}
