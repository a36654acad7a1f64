//! Resource usage prediction engine
//!
//! This crate provides the core functionality for:
//! - Usage collection from the metrics API and Prometheus backends
//! - Resolving workloads and label selectors to their pods
//! - Per-container decaying distribution estimation
//! - Checkpointing estimator state across restarts
//! - Publishing results to custom resource status
//! - Health checks and observability

pub mod cache;
pub mod checkpoint;
pub mod error;
pub mod estimator;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod profiler;
pub mod resolver;
pub mod status;

#[cfg(test)]
mod testing;

pub use error::PredictionError;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use manager::{ManagerConfig, PredictionManager, ProfileStatus};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
