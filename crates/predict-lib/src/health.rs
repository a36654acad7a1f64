//! Health check infrastructure for the prediction service
//!
//! Tracks component health for liveness probes and readiness (the
//! prediction manager has started) for readiness probes.

use crate::cache::CacheStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Serving stale data or partially failing
    Degraded,
    /// Component has failed
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }

    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Health of a set of backend caches. Any synced cache keeps the
    /// component operational; failures on top of that degrade it.
    pub fn from_caches(statuses: &[CacheStatus]) -> Self {
        let synced = statuses.iter().filter(|s| s.synced).count();
        let failing = statuses.iter().find_map(|s| {
            (s.consecutive_failures > 0)
                .then(|| s.last_error.clone())
                .flatten()
        });

        match (synced, failing) {
            (_, None) if synced == statuses.len() => Self::healthy(),
            (0, Some(error)) => Self::unhealthy(error),
            (_, Some(error)) => Self::degraded(error),
            (_, None) => Self::degraded("waiting for first sync"),
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const METRICS_REPOSITORY: &str = "metrics_repository";
    pub const WORKLOAD_RESOLVER: &str = "workload_resolver";
    pub const PREDICTION_MANAGER: &str = "prediction_manager";
    pub const CHECKPOINT_STORE: &str = "checkpoint_store";
    pub const STATUS_PUBLISHER: &str = "status_publisher";

    pub const ALL: [&str; 5] = [
        METRICS_REPOSITORY,
        WORKLOAD_RESOLVER,
        PREDICTION_MANAGER,
        CHECKPOINT_STORE,
        STATUS_PUBLISHER,
    ];
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Readiness follows the prediction manager's started flag
    pub async fn set_ready(&self, ready: bool) {
        let mut r = self.ready.write().await;
        *r = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        if !ready {
            ReadinessResponse {
                ready: false,
                reason: Some("Prediction manager not started".to_string()),
            }
        } else if health.status == ComponentStatus::Unhealthy {
            ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(synced: bool, error: Option<&str>) -> CacheStatus {
        CacheStatus {
            synced,
            last_refresh: None,
            last_error: error.map(str::to_string),
            consecutive_failures: u32::from(error.is_some()),
        }
    }

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_health_registry_registers_all_components() {
        let registry = HealthRegistry::new();
        for name in components::ALL {
            registry.register(name).await;
        }

        let health = registry.health().await;
        assert_eq!(health.components.len(), 5);
        assert_eq!(
            health.components[components::WORKLOAD_RESOLVER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_health_registry_degraded_status() {
        let registry = HealthRegistry::new();
        registry.register(components::METRICS_REPOSITORY).await;
        registry.register(components::PREDICTION_MANAGER).await;

        registry
            .set_degraded(components::METRICS_REPOSITORY, "prometheus/vms-kube unreachable")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_health_registry_unhealthy_status() {
        let registry = HealthRegistry::new();
        registry.register(components::CHECKPOINT_STORE).await;
        registry
            .set_unhealthy(components::CHECKPOINT_STORE, "read-only file system")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_requires_started_manager() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Prediction manager not started")
        );

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_when_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::WORKLOAD_RESOLVER).await;
        registry.set_ready(true).await;
        registry
            .set_unhealthy(components::WORKLOAD_RESOLVER, "forbidden")
            .await;

        assert!(!registry.readiness().await.ready);
    }

    #[test]
    fn test_health_from_caches() {
        assert_eq!(
            ComponentHealth::from_caches(&[cache(true, None), cache(true, None)]).status,
            ComponentStatus::Healthy
        );
        assert_eq!(
            ComponentHealth::from_caches(&[cache(true, None), cache(true, Some("timeout"))]).status,
            ComponentStatus::Degraded
        );
        assert_eq!(
            ComponentHealth::from_caches(&[cache(false, None)]).status,
            ComponentStatus::Degraded
        );

        let failed = ComponentHealth::from_caches(&[cache(false, Some("connection refused"))]);
        assert_eq!(failed.status, ComponentStatus::Unhealthy);
        assert_eq!(failed.message.as_deref(), Some("connection refused"));
    }
}
