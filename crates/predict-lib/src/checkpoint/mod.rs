//! Estimator checkpoints
//!
//! A checkpoint holds the exported estimator state of every entry of one
//! profile so that a restarted engine resumes where it stopped.

mod file;
mod memory;

pub use file::{FileCheckpointConfig, FileCheckpointStore};
pub use memory::MemoryCheckpointStore;

use crate::error::PredictionError;
use crate::estimator::DistributionState;
use crate::models::{ProfileKey, ResourceName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Saved state of one profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCheckpoint {
    pub key: ProfileKey,
    pub saved_at: DateTime<Utc>,
    /// entry name (container or pod aggregate) -> resource -> state
    pub entries: BTreeMap<String, BTreeMap<ResourceName, DistributionState>>,
}

/// Listing entry used by checkpoint garbage collection
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub key: ProfileKey,
    pub saved_at: DateTime<Utc>,
}

/// Durable checkpoint storage
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the stored checkpoint of `checkpoint.key`
    async fn save(&self, checkpoint: &ProfileCheckpoint) -> Result<(), PredictionError>;

    async fn load(&self, key: &ProfileKey) -> Result<Option<ProfileCheckpoint>, PredictionError>;

    /// Returns whether a checkpoint existed
    async fn delete(&self, key: &ProfileKey) -> Result<bool, PredictionError>;

    async fn list(&self) -> Result<Vec<CheckpointInfo>, PredictionError>;
}
