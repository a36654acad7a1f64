//! Typed errors surfaced by the prediction engine's public contract

use thiserror::Error;

/// Errors returned by the prediction engine
#[derive(Debug, Error)]
pub enum PredictionError {
    /// Operation attempted before dependent subsystems finished initialization.
    /// Callers should retry later.
    #[error("prediction manager is not started")]
    NotStarted,

    /// Lookup or removal of a profile that is not in the registry
    #[error("profile is not registered: {0}")]
    NotRegistered(String),

    /// Target references a controller kind the resolver does not know
    #[error("unsupported target kind: {0}")]
    UnsupportedTargetKind(String),

    /// Target workload no longer exists in the cluster view
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    /// Malformed raw usage value
    #[error("failed to parse usage value {value:?}: {reason}")]
    Parse { value: String, reason: String },

    /// Backend cache has never been populated or no source is configured
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Checkpoint persistence failure
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Profile spec failed validation
    #[error("invalid profile spec: {0}")]
    InvalidSpec(String),
}

impl PredictionError {
    pub(crate) fn parse(value: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors the profiler treats as "skip this cycle"
    pub fn is_not_found(&self) -> bool {
        matches!(self, PredictionError::NotFound { .. })
    }
}
