//! Document store: the remote persistence collaborator.
//!
//! The autosave engine only needs two operations: read the current snapshot
//! once per step mount, and apply a single-field partial patch. Each call is
//! atomic on its own; nothing is transactional across calls.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::cv::CvSnapshot;

pub use http::HttpDocumentStore;
pub use memory::InMemoryDocumentStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("CV {0} not found")]
    NotFound(Uuid),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current snapshot of the CV.
    async fn fetch(&self, cv_id: Uuid) -> Result<CvSnapshot, StoreError>;

    /// Sets `field` to `value` (last write wins) and returns the new snapshot.
    /// Patching a field with its current value is allowed.
    async fn patch(&self, cv_id: Uuid, field: &str, value: Value)
        -> Result<CvSnapshot, StoreError>;
}
