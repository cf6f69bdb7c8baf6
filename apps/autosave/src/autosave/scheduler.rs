//! Keyed Debounce Scheduler: coalesces rapid edits per key and commits only the
//! trailing value once the key has been quiet for `SchedulerConfig::delay`.
//!
//! # Model
//! - At most one pending edit per key. Re-scheduling a key replaces its value and
//!   restarts its timer (debounce, not throttle).
//! - Each pending edit carries a generation number. A timer only commits if its
//!   generation is still the one in the map, so a timer that woke up just as it
//!   was superseded or cancelled does nothing.
//! - The in-flight counter is raised under the pending-map lock, before the edit
//!   leaves the map, so `wait_idle` never observes a gap between "pending" and
//!   "committing".
//! - `flush` stops every timer, then takes one key at a time. Each commit runs
//!   on its own task, so dropping the flush future never abandons a dispatched
//!   commit, and keys it had not reached yet get their timers back.
//!
//! Timer tasks hold the scheduler state alive: dropping every `Scheduler` handle
//! does not discard pending edits. Use `cancel_all` to abandon them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::autosave::persist::Persist;
use crate::config::Config;
use crate::errors::{AutosaveError, CommitFailure};

const DEFAULT_DELAY: Duration = Duration::from_millis(500);

// ────────────────────────────────────────────────────────────────────────────
// Configuration & counters
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Quiet period a key must observe before its latest value is committed.
    pub delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY,
        }
    }
}

impl SchedulerConfig {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay for single form fields.
    pub fn field(config: &Config) -> Self {
        Self::with_delay(config.field_delay)
    }

    /// Delay for whole repeatable sections.
    pub fn section(config: &Config) -> Self {
        Self::with_delay(config.section_delay)
    }
}

/// Lifetime counters for one scheduler instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// `schedule` calls accepted.
    pub scheduled: u64,
    /// Commits whose persist call succeeded.
    pub committed: u64,
    /// Commits whose persist call returned an error.
    pub failed: u64,
    /// Pending edits replaced by a newer edit for the same key.
    pub superseded: u64,
    /// Pending edits discarded through `cancel` / `cancel_all`.
    pub cancelled: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct PendingEdit<V> {
    value: V,
    scheduled_at: Instant,
    generation: u64,
    /// `None` while a flush holds the edit.
    timer: Option<JoinHandle<()>>,
}

impl<V> PendingEdit<V> {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner<V> {
    delay: Duration,
    persist: Box<dyn Persist<V>>,
    pending: Mutex<BTreeMap<String, PendingEdit<V>>>,
    next_generation: AtomicU64,
    in_flight: AtomicUsize,
    flushing: AtomicUsize,
    stats: Mutex<SchedulerStats>,
    idle: Notify,
}

/// Decrements the in-flight counter when the commit settles, including on
/// panic or when the commit future is dropped.
struct InFlightGuard<'a, V> {
    inner: &'a Inner<V>,
}

impl<V> Drop for InFlightGuard<'_, V> {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Marks a flush as running. On drop, any edit the flush stopped but never
/// reached gets a fresh timer.
struct FlushGuard<V: Send + 'static> {
    inner: Arc<Inner<V>>,
}

impl<V: Send + 'static> FlushGuard<V> {
    fn enter(inner: &Arc<Inner<V>>) -> Self {
        inner.flushing.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl<V: Send + 'static> Drop for FlushGuard<V> {
    fn drop(&mut self) {
        self.inner.rearm_stopped();
        self.inner.flushing.fetch_sub(1, Ordering::SeqCst);
        self.inner.idle.notify_waiters();
    }
}

impl<V: Send + 'static> Inner<V> {
    fn spawn_timer(self: &Arc<Self>, key: String, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.delay).await;
            let Some((value, guard)) = inner.take_current(&key, generation) else {
                return;
            };
            if let Err(e) = inner.commit_guarded(&key, value, guard).await {
                // Fire-and-forget path: the persist function reports to the user.
                warn!(key = %key, error = %e, "Autosave commit failed");
            }
        })
    }

    /// Restarts the timer of every pending edit that has none.
    fn rearm_stopped(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let mut pending = self.pending.lock();
        for (key, edit) in pending.iter_mut() {
            if edit.timer.is_none() {
                edit.timer = Some(self.spawn_timer(key.clone(), edit.generation));
                debug!(key = %key, "Autosave timer restarted after interrupted flush");
            }
        }
    }

    fn enter_commit(&self) -> InFlightGuard<'_, V> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { inner: self }
    }

    /// Removes the pending edit for `key` if `generation` still owns it and
    /// marks the commit as in flight.
    fn take_current(&self, key: &str, generation: u64) -> Option<(V, InFlightGuard<'_, V>)> {
        let mut pending = self.pending.lock();
        match pending.get(key) {
            Some(edit) if edit.generation == generation => {}
            _ => return None,
        }
        let guard = self.enter_commit();
        let edit = pending.remove(key)?;
        debug!(
            key,
            waited_ms = edit.scheduled_at.elapsed().as_millis() as u64,
            "Autosave quiet period elapsed"
        );
        Some((edit.value, guard))
    }

    /// Removes the pending edit for `key`, whatever its generation, and marks
    /// the commit as in flight.
    fn take_for_flush(&self, key: &str) -> Option<(V, InFlightGuard<'_, V>)> {
        let mut pending = self.pending.lock();
        if !pending.contains_key(key) {
            return None;
        }
        let guard = self.enter_commit();
        let mut edit = pending.remove(key)?;
        edit.stop_timer();
        Some((edit.value, guard))
    }

    async fn commit_guarded(
        &self,
        key: &str,
        value: V,
        _guard: InFlightGuard<'_, V>,
    ) -> Result<(), AutosaveError> {
        debug!(
            key,
            in_flight = self.in_flight.load(Ordering::SeqCst),
            "Autosave commit started"
        );
        let result = self.persist.persist(key, value).await;
        let mut stats = self.stats.lock();
        match &result {
            Ok(()) => stats.committed += 1,
            Err(_) => stats.failed += 1,
        }
        result
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
            && self.flushing.load(Ordering::SeqCst) == 0
            && self.pending.lock().is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Public handle
// ────────────────────────────────────────────────────────────────────────────

/// Cheaply clonable handle over one scheduler instance.
pub struct Scheduler<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Scheduler<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + 'static> Scheduler<V> {
    pub fn new<P>(config: SchedulerConfig, persist: P) -> Self
    where
        P: Persist<V> + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                delay: config.delay,
                persist: Box::new(persist),
                pending: Mutex::new(BTreeMap::new()),
                next_generation: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                flushing: AtomicUsize::new(0),
                stats: Mutex::new(SchedulerStats::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Records `value` as the latest edit for `key` and restarts its timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let timer = self.inner.spawn_timer(key.clone(), generation);

        let replaced = self.inner.pending.lock().insert(
            key.clone(),
            PendingEdit {
                value,
                scheduled_at: Instant::now(),
                generation,
                timer: Some(timer),
            },
        );

        let mut stats = self.inner.stats.lock();
        stats.scheduled += 1;
        if let Some(mut previous) = replaced {
            previous.stop_timer();
            stats.superseded += 1;
        }
        debug!(key = %key, generation, "Autosave scheduled");
    }

    /// Commits every pending edit now, one key at a time in key order.
    ///
    /// All keys pending at call time are attempted even if some fail; the
    /// failures are returned together. Each key commits its latest value when
    /// the flush reaches it. Keys first scheduled while the flush runs stay
    /// pending. Dropping the returned future is safe: the commit already
    /// dispatched still completes and the remaining keys stay pending.
    pub async fn flush(&self) -> Result<(), AutosaveError> {
        let _flushing = FlushGuard::enter(&self.inner);
        let keys: Vec<String> = {
            let mut pending = self.inner.pending.lock();
            for edit in pending.values_mut() {
                edit.stop_timer();
            }
            pending.keys().cloned().collect()
        };

        if !keys.is_empty() {
            info!(keys = keys.len(), "Flushing pending autosaves");
        }

        let mut failures = Vec::new();
        for key in keys {
            let inner = Arc::clone(&self.inner);
            let task_key = key.clone();
            let commit = tokio::spawn(async move {
                let Some((value, guard)) = inner.take_for_flush(&task_key) else {
                    return None;
                };
                Some(inner.commit_guarded(&task_key, value, guard).await)
            });

            let message = match commit.await {
                Ok(None) | Ok(Some(Ok(()))) => continue,
                Ok(Some(Err(e))) => e.to_string(),
                Err(e) => format!("commit task failed: {e}"),
            };
            warn!(key = %key, error = %message, "Autosave flush commit failed");
            failures.push(CommitFailure { key, message });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AutosaveError::FlushFailed { failures })
        }
    }

    /// Discards the pending edit for `key` without committing it.
    /// Returns whether anything was pending.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.inner.pending.lock().remove(key);
        match removed {
            Some(mut edit) => {
                edit.stop_timer();
                self.inner.stats.lock().cancelled += 1;
                debug!(key, "Autosave cancelled");
                self.inner.idle.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Discards every pending edit. Commits already in flight are unaffected.
    pub fn cancel_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.inner.pending.lock());
        let count = drained.len();
        for mut edit in drained.into_values() {
            edit.stop_timer();
        }
        if count > 0 {
            self.inner.stats.lock().cancelled += count as u64;
            debug!(count, "All pending autosaves cancelled");
            self.inner.idle.notify_waiters();
        }
        count
    }

    /// True while at least one commit (timer or flush) has not settled.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight_count() > 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.pending.lock().contains_key(key)
    }

    pub fn stats(&self) -> SchedulerStats {
        *self.inner.stats.lock()
    }

    /// Resolves once nothing is pending, flushing or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }
}
