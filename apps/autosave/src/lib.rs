//! Autosave engine for the CV builder wizard.
//!
//! - `autosave`: keyed debounce scheduler with flush, cancel and in-flight accounting.
//! - `sections`: ordered section lists with per-item validation, persisted as
//!   whole snapshots through the scheduler.
//! - `store`: the remote CV document store (HTTP client + in-memory store).
//! - `wizard`: one wizard step wiring the above to a single CV.

pub mod autosave;
pub mod config;
pub mod errors;
pub mod models;
pub mod sections;
pub mod store;
pub mod telemetry;
pub mod wizard;

pub use autosave::{Persist, Scheduler, SchedulerConfig, SchedulerStats};
pub use config::Config;
pub use errors::{AutosaveError, CommitFailure};
pub use models::cv::CvSnapshot;
pub use sections::{FieldErrors, ItemMove, SectionItem, SectionList, Validator};
pub use store::{DocumentStore, HttpDocumentStore, InMemoryDocumentStore, StoreError};
pub use wizard::{StepGate, StepOutcome, WizardStep};
