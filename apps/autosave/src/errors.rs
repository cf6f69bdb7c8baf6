use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// A single key whose commit failed during `Scheduler::flush`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommitFailure {
    pub key: String,
    pub message: String,
}

/// Crate-level error type.
///
/// Validation problems are never reported through this type; they are returned
/// as `FieldErrors` data so the UI can render them inline.
#[derive(Debug, Error)]
pub enum AutosaveError {
    #[error("Document store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Step has not been hydrated yet")]
    NotInitialized,

    #[error("Step was already hydrated")]
    AlreadyInitialized,

    #[error("Persist failed: {0}")]
    Persist(String),

    #[error("Flush failed for {} key(s): {}", .failures.len(), describe_failures(.failures))]
    FlushFailed { failures: Vec<CommitFailure> },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AutosaveError {
    /// Keys that failed to commit, if this is a flush failure.
    pub fn failed_keys(&self) -> Vec<&str> {
        match self {
            AutosaveError::FlushFailed { failures } => {
                failures.iter().map(|f| f.key.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn describe_failures(failures: &[CommitFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.key, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}
