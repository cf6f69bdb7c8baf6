//! Section List Controller: an ordered, identity-stable list of section items
//! with per-item validation, persisted through the autosave scheduler.
//!
//! Every content change re-sends the whole section as one JSON array under the
//! section key. A serialized copy of the last scheduled snapshot suppresses
//! redundant schedules, and nothing is scheduled before hydration.
//!
//! Stale ids and out-of-range indices are silent no-ops: they come from UI
//! callbacks racing a re-render, not from real errors.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::autosave::Scheduler;
use crate::errors::AutosaveError;
use crate::sections::validation::{FieldErrors, Validator};
use crate::sections::SectionItem;

const ID_FIELD: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Waiting for the initial snapshot; mutations are not persisted.
    Uninitialized,
    Ready,
}

/// Position-animation hint for the renderer: the two items that traded places.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemMove {
    pub from_index: usize,
    pub to_index: usize,
    /// Item that was at `from_index` and is now at `to_index`.
    pub moved_id: String,
    /// Item that was at `to_index` and is now at `from_index`.
    pub displaced_id: String,
}

pub struct SectionList<T: SectionItem> {
    section_key: String,
    items: Vec<T>,
    errors: BTreeMap<String, FieldErrors>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    validator: Box<dyn Validator<T>>,
    scheduler: Scheduler<Value>,
    state: ControllerState,
    last_scheduled: Option<String>,
}

impl<T: SectionItem> SectionList<T> {
    pub fn new<F, V>(
        section_key: impl Into<String>,
        scheduler: Scheduler<Value>,
        factory: F,
        validator: V,
    ) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        V: Validator<T> + 'static,
    {
        Self {
            section_key: section_key.into(),
            items: Vec::new(),
            errors: BTreeMap::new(),
            factory: Box::new(factory),
            validator: Box::new(validator),
            scheduler,
            state: ControllerState::Uninitialized,
            last_scheduled: None,
        }
    }

    // ── Views ──────────────────────────────────────────────────────────────

    pub fn section_key(&self) -> &str {
        &self.section_key
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn errors(&self) -> &BTreeMap<String, FieldErrors> {
        &self.errors
    }

    pub fn errors_for(&self, id: &str) -> Option<&FieldErrors> {
        self.errors.get(id)
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ControllerState::Ready
    }

    /// True while any commit on the underlying scheduler is in flight.
    pub fn is_saving(&self) -> bool {
        self.scheduler.is_in_flight()
    }

    // ── Mutations ──────────────────────────────────────────────────────────

    /// Replaces the whole list with a freshly loaded snapshot. Does not
    /// validate and does not schedule; this is the only way to become `Ready`.
    pub fn set_items(&mut self, items: Vec<T>) {
        self.items = items;
        self.errors.clear();
        self.last_scheduled = match serde_json::to_value(&self.items) {
            Ok(snapshot) => Some(snapshot.to_string()),
            Err(e) => {
                warn!(section = %self.section_key, error = %e, "Could not serialize hydrated section");
                None
            }
        };
        self.state = ControllerState::Ready;
        debug!(section = %self.section_key, items = self.items.len(), "Section hydrated");
    }

    /// Appends a blank item from the factory and returns its id.
    pub fn add_item(&mut self) -> String {
        let item = (self.factory)();
        let id = item.id().to_string();
        self.items.push(item);
        self.schedule_snapshot();
        id
    }

    /// Shallow-merges `patch` (a JSON object) into the item with `id`.
    ///
    /// Returns `Ok(false)` when no such item exists. An `"id"` key in the patch
    /// is ignored. If the item currently has recorded errors it is re-validated
    /// and its entry updated or cleared; otherwise no validation runs.
    pub fn update_item(&mut self, id: &str, patch: &Value) -> Result<bool, AutosaveError> {
        let Value::Object(patch) = patch else {
            return Err(AutosaveError::InvalidPatch(
                "patch must be a JSON object".to_string(),
            ));
        };
        let Some(index) = self.position(id) else {
            debug!(section = %self.section_key, id, "Update for unknown item ignored");
            return Ok(false);
        };

        let updated = merge_patch(&self.items[index], patch)?;
        self.items[index] = updated;

        if self.errors.contains_key(id) {
            let errors = self.validator.validate(&self.items[index]);
            if errors.is_empty() {
                self.errors.remove(id);
            } else {
                self.errors.insert(id.to_string(), errors);
            }
        }

        self.schedule_snapshot();
        Ok(true)
    }

    /// Removes the item and its error entry. Returns whether it existed.
    pub fn remove_item(&mut self, id: &str) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        self.items.remove(index);
        self.errors.remove(id);
        self.schedule_snapshot();
        true
    }

    /// Swaps the items at `from` and `to`. Moving index 0 to 2 exchanges items
    /// 0 and 2; items in between stay put. Out-of-range indices are ignored.
    pub fn move_item(&mut self, from: usize, to: usize) -> Option<ItemMove> {
        if from == to || from >= self.items.len() || to >= self.items.len() {
            return None;
        }
        self.items.swap(from, to);
        let hint = ItemMove {
            from_index: from,
            to_index: to,
            moved_id: self.items[to].id().to_string(),
            displaced_id: self.items[from].id().to_string(),
        };
        self.schedule_snapshot();
        Some(hint)
    }

    /// Validates every item and replaces the error map with the failures.
    /// Returns true when the whole section is valid.
    pub fn validate_all(&mut self) -> bool {
        self.errors = self
            .items
            .iter()
            .filter_map(|item| {
                let errors = self.validator.validate(item);
                (!errors.is_empty()).then(|| (item.id().to_string(), errors))
            })
            .collect();
        if !self.errors.is_empty() {
            debug!(
                section = %self.section_key,
                invalid = self.errors.len(),
                "Section failed validation"
            );
        }
        self.errors.is_empty()
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    fn schedule_snapshot(&mut self) {
        if self.state == ControllerState::Uninitialized {
            debug!(section = %self.section_key, "Section not hydrated; autosave skipped");
            return;
        }
        let snapshot = match serde_json::to_value(&self.items) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(section = %self.section_key, error = %e, "Could not serialize section");
                return;
            }
        };
        let serialized = snapshot.to_string();
        if self.last_scheduled.as_deref() == Some(serialized.as_str()) {
            return;
        }
        self.last_scheduled = Some(serialized);
        self.scheduler.schedule(self.section_key.clone(), snapshot);
    }
}

fn merge_patch<T: SectionItem>(item: &T, patch: &Map<String, Value>) -> Result<T, AutosaveError> {
    let mut merged = serde_json::to_value(item)?;
    let Value::Object(fields) = &mut merged else {
        return Err(AutosaveError::InvalidPatch(
            "section items must serialize to JSON objects".to_string(),
        ));
    };
    for (field, value) in patch {
        if field != ID_FIELD {
            fields.insert(field.clone(), value.clone());
        }
    }
    let updated: T = serde_json::from_value(merged)
        .map_err(|e| AutosaveError::InvalidPatch(e.to_string()))?;
    if updated.id() != item.id() {
        return Err(AutosaveError::InvalidPatch(format!(
            "patch would change the id of item {}",
            item.id()
        )));
    }
    Ok(updated)
}
