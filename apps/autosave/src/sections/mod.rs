// Repeatable CV sections: ordered, identity-stable item lists with per-item
// validation, persisted as whole snapshots through the autosave scheduler.

pub mod controller;
pub mod validation;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

pub use controller::{ControllerState, ItemMove, SectionList};
pub use validation::{FieldErrors, Validator};

/// An element of a repeatable section. `id` never changes once assigned.
pub trait SectionItem: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;
}

/// Fresh item id: creation time in milliseconds plus a random suffix.
pub fn new_item_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}
