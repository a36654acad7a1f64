//! In-process checkpoint store

use super::{CheckpointInfo, CheckpointStore, ProfileCheckpoint};
use crate::error::PredictionError;
use crate::models::ProfileKey;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keeps checkpoints in memory. State does not survive the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<ProfileKey, ProfileCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &ProfileCheckpoint) -> Result<(), PredictionError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, key: &ProfileKey) -> Result<Option<ProfileCheckpoint>, PredictionError> {
        Ok(self.checkpoints.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &ProfileKey) -> Result<bool, PredictionError> {
        Ok(self.checkpoints.write().await.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<CheckpointInfo>, PredictionError> {
        Ok(self
            .checkpoints
            .read()
            .await
            .values()
            .map(|c| CheckpointInfo {
                key: c.key.clone(),
                saved_at: c.saved_at,
            })
            .collect())
    }
}
