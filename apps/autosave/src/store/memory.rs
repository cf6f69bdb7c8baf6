use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::models::cv::CvSnapshot;
use crate::store::{DocumentStore, StoreError};

/// Process-local document store for local runs and tests.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: Mutex<HashMap<Uuid, CvSnapshot>>,
    patches: AtomicU64,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty CV and returns its id.
    pub fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.insert(CvSnapshot::empty(id));
        id
    }

    pub fn insert(&self, snapshot: CvSnapshot) {
        self.documents.lock().insert(snapshot.id, snapshot);
    }

    pub fn get(&self, cv_id: Uuid) -> Option<CvSnapshot> {
        self.documents.lock().get(&cv_id).cloned()
    }

    /// Number of successful `patch` calls served.
    pub fn patch_count(&self) -> u64 {
        self.patches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn fetch(&self, cv_id: Uuid) -> Result<CvSnapshot, StoreError> {
        self.get(cv_id).ok_or(StoreError::NotFound(cv_id))
    }

    async fn patch(
        &self,
        cv_id: Uuid,
        field: &str,
        value: Value,
    ) -> Result<CvSnapshot, StoreError> {
        let mut documents = self.documents.lock();
        let document = documents
            .get_mut(&cv_id)
            .ok_or(StoreError::NotFound(cv_id))?;
        document.sections.insert(field.to_string(), value);
        document.updated_at = Some(Utc::now());
        self.patches.fetch_add(1, Ordering::SeqCst);
        debug!(cv_id = %cv_id, field, "Patched in-memory CV");
        Ok(document.clone())
    }
}
