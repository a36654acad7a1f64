//! Directory-backed checkpoint store
//!
//! One JSON file per profile, named by the SHA-256 of the serialized key.
//! Writes go to a temp file that is synced and renamed over the target, so a
//! crash never leaves a partial checkpoint. Writes to the same key are
//! serialized; different keys proceed in parallel.

use super::{CheckpointInfo, CheckpointStore, ProfileCheckpoint};
use crate::error::PredictionError;
use crate::models::ProfileKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const EXTENSION: &str = "json";

/// Configuration for the file checkpoint store
#[derive(Debug, Clone)]
pub struct FileCheckpointConfig {
    /// Directory holding checkpoint files (created on demand)
    pub directory: PathBuf,
}

impl Default for FileCheckpointConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/resource-predictor/checkpoints"),
        }
    }
}

pub struct FileCheckpointStore {
    config: FileCheckpointConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    pub fn new(config: FileCheckpointConfig) -> Self {
        Self {
            config,
            locks: DashMap::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    fn file_stem(key: &ProfileKey) -> Result<String, PredictionError> {
        let encoded = serde_json::to_vec(key)
            .map_err(|e| PredictionError::Checkpoint(format!("failed to encode key: {e}")))?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }

    fn path_for(&self, stem: &str) -> PathBuf {
        self.config.directory.join(format!("{stem}.{EXTENSION}"))
    }

    fn lock_for(&self, stem: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(stem.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &ProfileCheckpoint) -> Result<(), PredictionError> {
        let stem = Self::file_stem(&checkpoint.key)?;
        let path = self.path_for(&stem);
        let data = serde_json::to_vec(checkpoint)
            .map_err(|e| PredictionError::Checkpoint(format!("failed to encode checkpoint: {e}")))?;

        let lock = self.lock_for(&stem);
        let _guard = lock.lock().await;
        run_blocking(move || write_atomic(&path, &data)).await?;
        debug!(profile = %checkpoint.key, file = %stem, "Saved checkpoint");
        Ok(())
    }

    async fn load(&self, key: &ProfileKey) -> Result<Option<ProfileCheckpoint>, PredictionError> {
        let stem = Self::file_stem(key)?;
        let path = self.path_for(&stem);

        let lock = self.lock_for(&stem);
        let _guard = lock.lock().await;
        let Some(checkpoint) = run_blocking(move || read_checkpoint(&path)).await? else {
            return Ok(None);
        };
        if checkpoint.key != *key {
            warn!(profile = %key, file = %stem, "Checkpoint key mismatch, ignoring file");
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    async fn delete(&self, key: &ProfileKey) -> Result<bool, PredictionError> {
        let stem = Self::file_stem(key)?;
        let path = self.path_for(&stem);

        let lock = self.lock_for(&stem);
        let _guard = lock.lock().await;
        let existed = run_blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {path:?}")),
        })
        .await?;
        // drop the entry only when no other caller holds the lock
        self.locks
            .remove_if(&stem, |_, held| Arc::strong_count(held) == 2);
        Ok(existed)
    }

    async fn list(&self) -> Result<Vec<CheckpointInfo>, PredictionError> {
        let directory = self.config.directory.clone();
        run_blocking(move || list_checkpoints(&directory)).await
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, PredictionError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| PredictionError::Checkpoint(format!("checkpoint task failed: {e}")))?
        .map_err(|e| PredictionError::Checkpoint(format!("{e:#}")))
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {parent:?}"))?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp file {temp_path:?}"))?;
    file.write_all(data).context("Failed to write checkpoint")?;
    file.sync_all().context("Failed to sync checkpoint file")?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {temp_path:?} to {path:?}"))?;
    Ok(())
}

fn read_checkpoint(path: &Path) -> Result<Option<ProfileCheckpoint>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {path:?}")),
    };
    let checkpoint = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to decode checkpoint {path:?}"))?;
    Ok(Some(checkpoint))
}

fn list_checkpoints(directory: &Path) -> Result<Vec<CheckpointInfo>> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {directory:?}")),
    };

    let mut infos = Vec::new();
    for entry in entries {
        let path = entry.context("Failed to read directory entry")?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        match read_checkpoint(&path) {
            Ok(Some(checkpoint)) => infos.push(CheckpointInfo {
                key: checkpoint.key,
                saved_at: checkpoint.saved_at,
            }),
            Ok(None) => {}
            Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable checkpoint"),
        }
    }
    Ok(infos)
}
