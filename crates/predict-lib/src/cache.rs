//! Last-known-good snapshot cache shared by the metrics repository and the
//! workload resolver.
//!
//! Readers clone the `Arc` and release the lock immediately; a refresh swaps
//! the whole snapshot. A failed refresh leaves the previous snapshot served.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Refresh bookkeeping of one cache
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub synced: bool,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct SnapshotCache<T> {
    snapshot: RwLock<Option<Arc<T>>>,
    status: RwLock<CacheStatus>,
}

impl<T> Default for SnapshotCache<T> {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(None),
            status: RwLock::new(CacheStatus::default()),
        }
    }
}

impl<T> SnapshotCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot, `None` until the first successful refresh
    pub async fn get(&self) -> Option<Arc<T>> {
        self.snapshot.read().await.clone()
    }

    pub async fn replace(&self, snapshot: T) {
        *self.snapshot.write().await = Some(Arc::new(snapshot));
        let mut status = self.status.write().await;
        status.synced = true;
        status.last_refresh = Some(Utc::now());
        status.last_error = None;
        status.consecutive_failures = 0;
    }

    pub async fn record_failure(&self, error: impl ToString) {
        let mut status = self.status.write().await;
        status.last_error = Some(error.to_string());
        status.consecutive_failures += 1;
    }

    pub async fn is_synced(&self) -> bool {
        self.status.read().await.synced
    }

    pub async fn status(&self) -> CacheStatus {
        self.status.read().await.clone()
    }
}
