// Keyed autosave: per-key debounce, forced flush and in-flight accounting.
// Every wizard step owns one scheduler; section controllers and single form
// fields share it through distinct keys.

pub mod persist;
pub mod scheduler;

pub use persist::Persist;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
