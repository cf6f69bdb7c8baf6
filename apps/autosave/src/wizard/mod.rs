//! Wizard step session: one mounted wizard step editing one CV.
//!
//! # Lifecycle
//! 1. `WizardStep::new` builds the step's schedulers (one for single fields, one
//!    for whole sections) over a persist function that patches the document
//!    store and folds the returned snapshot back into the step.
//! 2. `hydrate` loads the snapshot exactly once. Until then `set_field` is a
//!    no-op, so nothing autosaves while the form is being filled from the store.
//! 3. The host edits fields and sections; edits autosave after their quiet period.
//! 4. `advance` validates every gate and, only if all pass, flushes. A flush
//!    error means "stay on this page": the data may not have been saved.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::autosave::{Scheduler, SchedulerConfig};
use crate::config::Config;
use crate::errors::{AutosaveError, CommitFailure};
use crate::models::cv::CvSnapshot;
use crate::sections::{SectionItem, SectionList, Validator};
use crate::store::DocumentStore;

/// Anything that must be valid before the wizard may leave the step.
pub trait StepGate {
    fn validate_all(&mut self) -> bool;
}

impl<T: SectionItem> StepGate for SectionList<T> {
    fn validate_all(&mut self) -> bool {
        SectionList::validate_all(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Everything validated and every pending edit was committed.
    Advance,
    /// At least one gate failed validation; nothing was flushed.
    Invalid,
}

pub struct WizardStep {
    cv_id: Uuid,
    store: Arc<dyn DocumentStore>,
    fields: Scheduler<Value>,
    sections: Scheduler<Value>,
    snapshot: Arc<Mutex<Option<CvSnapshot>>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl WizardStep {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cv_id: Uuid,
        field_config: SchedulerConfig,
        section_config: SchedulerConfig,
    ) -> Self {
        let snapshot = Arc::new(Mutex::new(None));
        let last_error = Arc::new(Mutex::new(None));

        let fields = Scheduler::new(
            field_config,
            persist_fn(cv_id, Arc::clone(&store), &snapshot, &last_error),
        );
        let sections = Scheduler::new(
            section_config,
            persist_fn(cv_id, Arc::clone(&store), &snapshot, &last_error),
        );

        Self {
            cv_id,
            store,
            fields,
            sections,
            snapshot,
            last_error,
        }
    }

    pub fn from_config(store: Arc<dyn DocumentStore>, cv_id: Uuid, config: &Config) -> Self {
        Self::new(
            store,
            cv_id,
            SchedulerConfig::field(config),
            SchedulerConfig::section(config),
        )
    }

    pub fn cv_id(&self) -> Uuid {
        self.cv_id
    }

    /// Loads the CV snapshot. May only succeed once per step.
    pub async fn hydrate(&self) -> Result<CvSnapshot, AutosaveError> {
        if self.is_hydrated() {
            return Err(AutosaveError::AlreadyInitialized);
        }
        let snapshot = self.store.fetch(self.cv_id).await?;

        let mut slot = self.snapshot.lock();
        if slot.is_some() {
            return Err(AutosaveError::AlreadyInitialized);
        }
        *slot = Some(snapshot.clone());
        info!(cv_id = %self.cv_id, sections = snapshot.sections.len(), "Wizard step hydrated");
        Ok(snapshot)
    }

    pub fn is_hydrated(&self) -> bool {
        self.snapshot.lock().is_some()
    }

    /// Last snapshot acknowledged by the store (not including pending edits).
    pub fn snapshot(&self) -> Option<CvSnapshot> {
        self.snapshot.lock().clone()
    }

    /// Schedules an autosave for a single form field. Returns false, and
    /// schedules nothing, before hydration.
    pub fn set_field(&self, key: &str, value: Value) -> bool {
        if !self.is_hydrated() {
            debug!(cv_id = %self.cv_id, key, "Field edit before hydration ignored");
            return false;
        }
        self.fields.schedule(key, value);
        true
    }

    /// Builds a hydrated section controller over the step's section scheduler.
    pub fn section<T, F, V>(
        &self,
        key: &str,
        factory: F,
        validator: V,
    ) -> Result<SectionList<T>, AutosaveError>
    where
        T: SectionItem,
        F: Fn() -> T + Send + Sync + 'static,
        V: Validator<T> + 'static,
    {
        let items = {
            let snapshot = self.snapshot.lock();
            let snapshot = snapshot.as_ref().ok_or(AutosaveError::NotInitialized)?;
            snapshot.section::<T>(key)?
        };
        let mut list = SectionList::new(key, self.sections.clone(), factory, validator);
        list.set_items(items);
        Ok(list)
    }

    /// Validates every gate (all of them, so every error is shown) and, if
    /// all pass, commits every pending edit.
    ///
    /// `Err` means at least one commit failed and the host must not navigate.
    pub async fn advance(
        &self,
        gates: &mut [&mut dyn StepGate],
    ) -> Result<StepOutcome, AutosaveError> {
        let mut valid = true;
        for gate in gates.iter_mut() {
            valid &= gate.validate_all();
        }
        if !valid {
            info!(cv_id = %self.cv_id, "Step has validation errors; staying");
            return Ok(StepOutcome::Invalid);
        }

        let field_result = self.fields.flush().await;
        let section_result = self.sections.flush().await;

        let mut failures: Vec<CommitFailure> = Vec::new();
        for result in [field_result, section_result] {
            match result {
                Ok(()) => {}
                Err(AutosaveError::FlushFailed { failures: failed }) => failures.extend(failed),
                Err(other) => return Err(other),
            }
        }
        if !failures.is_empty() {
            error!(cv_id = %self.cv_id, failed = failures.len(), "Step flush failed; staying");
            return Err(AutosaveError::FlushFailed { failures });
        }

        info!(cv_id = %self.cv_id, "Step saved");
        Ok(StepOutcome::Advance)
    }

    /// Discards every pending edit (leaving without saving). Returns how
    /// many edits were dropped.
    pub fn abandon(&self) -> usize {
        let dropped = self.fields.cancel_all() + self.sections.cancel_all();
        if dropped > 0 {
            info!(cv_id = %self.cv_id, dropped, "Abandoned unsaved edits");
        }
        dropped
    }

    pub fn is_saving(&self) -> bool {
        self.fields.is_in_flight() || self.sections.is_in_flight()
    }

    pub fn has_pending(&self) -> bool {
        self.fields.pending_count() + self.sections.pending_count() > 0
    }

    /// Error from the most recent failed commit, cleared by the next success.
    pub fn last_persist_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Resolves once both schedulers have nothing pending or in flight.
    pub async fn wait_idle(&self) {
        self.fields.wait_idle().await;
        self.sections.wait_idle().await;
    }
}

type SharedSnapshot = Arc<Mutex<Option<CvSnapshot>>>;
type SharedError = Arc<Mutex<Option<String>>>;
type PersistFuture = Pin<Box<dyn Future<Output = Result<(), AutosaveError>> + Send>>;

/// Persist function shared by both schedulers: patch, then fold the store's
/// answer back into the step.
fn persist_fn(
    cv_id: Uuid,
    store: Arc<dyn DocumentStore>,
    snapshot: &SharedSnapshot,
    last_error: &SharedError,
) -> impl Fn(String, Value) -> PersistFuture + Send + Sync + 'static {
    let snapshot = Arc::clone(snapshot);
    let last_error = Arc::clone(last_error);
    move |key: String, value: Value| -> PersistFuture {
        let store = Arc::clone(&store);
        let snapshot = Arc::clone(&snapshot);
        let last_error = Arc::clone(&last_error);
        Box::pin(async move {
            match store.patch(cv_id, &key, value).await {
                Ok(updated) => {
                    if !fold_snapshot(&mut snapshot.lock(), updated) {
                        debug!(cv_id = %cv_id, key = %key, "Older store answer ignored");
                    }
                    *last_error.lock() = None;
                    Ok(())
                }
                Err(e) => {
                    error!(cv_id = %cv_id, key = %key, error = %e, "Failed to save CV");
                    *last_error.lock() = Some(format!("{key}: {e}"));
                    Err(AutosaveError::Store(e))
                }
            }
        })
    }
}

/// Replaces the held snapshot unless `updated` is older than it. Field and
/// section commits run concurrently, so answers can arrive out of order.
fn fold_snapshot(slot: &mut Option<CvSnapshot>, updated: CvSnapshot) -> bool {
    let newer = match slot.as_ref() {
        Some(current) => updated.updated_at >= current.updated_at,
        None => true,
    };
    if newer {
        *slot = Some(updated);
    }
    newer
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::models::cv::{ExperienceItem, FIELD_SUMMARY, SECTION_EXPERIENCE};
    use crate::sections::validation::validate_experience;
    use crate::store::{InMemoryDocumentStore, StoreError};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn step_over(store: Arc<dyn DocumentStore>, cv_id: Uuid) -> WizardStep {
        WizardStep::new(
            store,
            cv_id,
            SchedulerConfig::with_delay(ms(500)),
            SchedulerConfig::with_delay(ms(1000)),
        )
    }

    /// Store whose patches fail for one field name.
    struct FlakyStore {
        inner: InMemoryDocumentStore,
        broken_field: &'static str,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn fetch(&self, cv_id: Uuid) -> Result<CvSnapshot, StoreError> {
            self.inner.fetch(cv_id).await
        }

        async fn patch(
            &self,
            cv_id: Uuid,
            field: &str,
            value: Value,
        ) -> Result<CvSnapshot, StoreError> {
            if field == self.broken_field {
                return Err(StoreError::Api {
                    status: 503,
                    message: "maintenance".to_string(),
                });
            }
            self.inner.patch(cv_id, field, value).await
        }
    }

    /// Store that answers every patch with a fixed, stale snapshot.
    struct StaleStore {
        answer: CvSnapshot,
    }

    #[async_trait]
    impl DocumentStore for StaleStore {
        async fn fetch(&self, _cv_id: Uuid) -> Result<CvSnapshot, StoreError> {
            Ok(self.answer.clone())
        }

        async fn patch(
            &self,
            _cv_id: Uuid,
            _field: &str,
            _value: Value,
        ) -> Result<CvSnapshot, StoreError> {
            Ok(self.answer.clone())
        }
    }

    fn stamped(cv_id: Uuid, summary: &str, minutes: i64) -> CvSnapshot {
        let mut snapshot = CvSnapshot::empty(cv_id);
        snapshot
            .sections
            .insert(FIELD_SUMMARY.to_string(), json!(summary));
        snapshot.updated_at = Utc.timestamp_opt(minutes * 60, 0).single();
        snapshot
    }

    #[test]
    fn test_fold_snapshot_keeps_newest() {
        let cv_id = Uuid::new_v4();
        let mut slot = None;
        assert!(fold_snapshot(&mut slot, stamped(cv_id, "first", 1)));
        assert!(fold_snapshot(&mut slot, stamped(cv_id, "second", 2)));
        assert!(!fold_snapshot(&mut slot, stamped(cv_id, "late", 1)));
        assert_eq!(
            slot.unwrap().field(FIELD_SUMMARY),
            Some(&json!("second"))
        );
    }

    #[tokio::test]
    async fn test_late_store_answer_does_not_rewind_snapshot() {
        let cv_id = Uuid::new_v4();
        let snapshot: SharedSnapshot = Arc::new(Mutex::new(Some(stamped(cv_id, "newer", 5))));
        let last_error: SharedError = Arc::new(Mutex::new(None));
        let store = Arc::new(StaleStore {
            answer: stamped(cv_id, "older", 3),
        });
        let persist = persist_fn(cv_id, store, &snapshot, &last_error);

        persist(FIELD_SUMMARY.to_string(), json!("older")).await.unwrap();

        let held = snapshot.lock().clone().unwrap();
        assert_eq!(held.field(FIELD_SUMMARY), Some(&json!("newer")));
        assert!(last_error.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_field_edits_ignored_until_hydrated() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cv_id = store.create();
        let step = step_over(store.clone(), cv_id);

        assert!(!step.set_field(FIELD_SUMMARY, json!("draft")));
        assert!(!step.has_pending());

        step.hydrate().await.unwrap();
        assert!(step.set_field(FIELD_SUMMARY, json!("final")));
        tokio::time::sleep(ms(600)).await;
        step.wait_idle().await;

        assert_eq!(store.patch_count(), 1);
        let saved = step.snapshot().unwrap();
        assert_eq!(saved.field(FIELD_SUMMARY), Some(&json!("final")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrate_only_once() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cv_id = store.create();
        let step = step_over(store, cv_id);
        step.hydrate().await.unwrap();
        assert!(matches!(
            step.hydrate().await,
            Err(AutosaveError::AlreadyInitialized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_section_requires_hydration() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cv_id = store.create();
        let step = step_over(store, cv_id);
        let result = step.section(SECTION_EXPERIENCE, ExperienceItem::blank, validate_experience);
        assert!(matches!(result, Err(AutosaveError::NotInitialized)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advance_blocked_by_invalid_section() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cv_id = store.create();
        let step = step_over(store.clone(), cv_id);
        step.hydrate().await.unwrap();

        let mut experience = step
            .section(SECTION_EXPERIENCE, ExperienceItem::blank, validate_experience)
            .unwrap();
        let id = experience.add_item();
        assert!(step.has_pending());

        let outcome = step.advance(&mut [&mut experience]).await.unwrap();
        assert_eq!(outcome, StepOutcome::Invalid);
        assert!(experience.errors_for(&id).is_some());
        assert!(step.has_pending(), "invalid step does not flush");
        assert_eq!(store.patch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advance_flushes_fields_and_sections() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cv_id = store.create();
        let step = step_over(store.clone(), cv_id);
        step.hydrate().await.unwrap();

        let mut experience = step
            .section(SECTION_EXPERIENCE, ExperienceItem::blank, validate_experience)
            .unwrap();
        let id = experience.add_item();
        experience
            .update_item(
                &id,
                &json!({
                    "title": "Engineer",
                    "company": "Acme",
                    "start_date": "2020-01",
                    "current": true,
                }),
            )
            .unwrap();
        step.set_field(FIELD_SUMMARY, json!("Ships things"));

        let outcome = step.advance(&mut [&mut experience]).await.unwrap();
        assert_eq!(outcome, StepOutcome::Advance);
        assert!(!step.has_pending());
        assert_eq!(store.patch_count(), 2);

        let saved = store.get(cv_id).unwrap();
        let items: Vec<ExperienceItem> = saved.section(SECTION_EXPERIENCE).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].company, "Acme");
        assert_eq!(saved.field(FIELD_SUMMARY), Some(&json!("Ships things")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_blocks_navigation() {
        let inner = InMemoryDocumentStore::new();
        let cv_id = inner.create();
        let store = Arc::new(FlakyStore {
            inner,
            broken_field: FIELD_SUMMARY,
        });
        let step = step_over(store, cv_id);
        step.hydrate().await.unwrap();

        step.set_field(FIELD_SUMMARY, json!("lost?"));
        step.set_field("headline", json!("Engineer"));
        let err = step.advance(&mut []).await.unwrap_err();
        assert_eq!(err.failed_keys(), vec![FIELD_SUMMARY]);
        assert!(step.last_persist_error().unwrap().contains("maintenance"));
        assert!(!step.is_saving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_failure_is_recorded_not_raised() {
        let inner = InMemoryDocumentStore::new();
        let cv_id = inner.create();
        let store = Arc::new(FlakyStore {
            inner,
            broken_field: FIELD_SUMMARY,
        });
        let step = step_over(store, cv_id);
        step.hydrate().await.unwrap();

        step.set_field(FIELD_SUMMARY, json!("x"));
        tokio::time::sleep(ms(600)).await;
        step.wait_idle().await;
        assert!(!step.is_saving());
        assert!(step.last_persist_error().is_some());

        step.set_field("headline", json!("y"));
        tokio::time::sleep(ms(600)).await;
        step.wait_idle().await;
        assert!(step.last_persist_error().is_none(), "success clears the error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_drops_pending_edits() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let cv_id = store.create();
        let step = step_over(store.clone(), cv_id);
        step.hydrate().await.unwrap();

        step.set_field(FIELD_SUMMARY, json!("never mind"));
        assert_eq!(step.abandon(), 1);
        tokio::time::sleep(ms(2000)).await;
        assert_eq!(store.patch_count(), 0);
    }
}
