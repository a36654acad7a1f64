//! Registry of live profilers

use crate::models::ProfileKey;
use crate::profiler::Profiler;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Concurrent map of profile key -> profiler. At most one profiler per key.
#[derive(Default)]
pub struct ProfileRegistry {
    profilers: DashMap<ProfileKey, Arc<Profiler>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the key is taken; returns the existing profiler if so
    pub fn insert_if_absent(
        &self,
        key: ProfileKey,
        profiler: Arc<Profiler>,
    ) -> Result<(), Arc<Profiler>> {
        match self.profilers.entry(key) {
            Entry::Occupied(existing) => Err(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                debug!(profile = %slot.key(), "Registering profiler");
                slot.insert(profiler);
                Ok(())
            }
        }
    }

    pub fn remove(&self, key: &ProfileKey) -> Option<Arc<Profiler>> {
        debug!(profile = %key, "Removing profiler");
        self.profilers.remove(key).map(|(_, p)| p)
    }

    pub fn get(&self, key: &ProfileKey) -> Option<Arc<Profiler>> {
        self.profilers.get(key).map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, key: &ProfileKey) -> bool {
        self.profilers.contains_key(key)
    }

    /// True when `profiler` is the instance currently registered under `key`
    pub fn is_current(&self, key: &ProfileKey, profiler: &Arc<Profiler>) -> bool {
        self.profilers
            .get(key)
            .map_or(false, |r| Arc::ptr_eq(r.value(), profiler))
    }

    /// Point-in-time copy of all entries
    pub fn snapshot(&self) -> Vec<(ProfileKey, Arc<Profiler>)> {
        self.profilers
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.profilers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profilers.is_empty()
    }
}
