//! Task record store and completion signal
//!
//! The store is the single owner of every `TaskRecord`. Submission inserts
//! records, completion detectors mark them complete exactly once, and the
//! store fires the `CompletionSignal` when the completed count reaches the
//! expected total.
//!
//! Completions for ids the store has not seen yet are buffered, at most one
//! per expected task, until submission closes. After that an unknown id can
//! no longer belong to this run and is dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, watch};
use tracing::{debug, warn};

/// One submitted task and its timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub id: String,
    pub submit_time: Instant,
    pub complete_time: Option<Instant>,
}

impl TaskRecord {
    pub fn new(id: String, submit_time: Instant) -> Self {
        Self {
            id,
            submit_time,
            complete_time: None,
        }
    }

    /// Submit-to-complete latency, if completed
    pub fn latency(&self) -> Option<Duration> {
        self.complete_time
            .map(|done| done.saturating_duration_since(self.submit_time))
    }

    pub fn is_complete(&self) -> bool {
        self.complete_time.is_some()
    }
}

/// Outcome of reporting a task as complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// First completion for a known task
    Recorded {
        completed: usize,
        expected: usize,
        latency: Duration,
    },
    /// Task had already been completed; nothing changed
    Duplicate,
    /// Task is not (yet) known; remembered in case its record arrives later
    Early,
    /// Task is not known and cannot be buffered; ignored
    Unknown,
}

/// Single-shot gate that opens once every task has completed
///
/// Never closes again once open. Any number of callers may wait on it.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: watch::Sender<bool>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Open the gate. Returns true only for the call that opened it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    records: HashMap<String, TaskRecord>,
    /// Completions that arrived before the task's record was inserted
    early: HashMap<String, Instant>,
    completed: usize,
    /// Set once every task has been submitted
    closed: bool,
}

/// Owner of all task records for one run
#[derive(Debug)]
pub struct RecordStore {
    inner: RwLock<StoreInner>,
    expected: usize,
    signal: CompletionSignal,
}

impl RecordStore {
    /// Create a store expecting `expected` completions. With zero expected
    /// tasks the signal starts open.
    pub fn new(expected: usize) -> Self {
        let signal = CompletionSignal::new();
        if expected == 0 {
            signal.fire();
        }
        Self {
            inner: RwLock::new(StoreInner::default()),
            expected,
            signal,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    /// Insert a freshly submitted task.
    ///
    /// If a completion for this id was already seen, it is applied now and
    /// the resulting `Completion` is returned.
    pub async fn insert(&self, id: String, submit_time: Instant) -> Option<Completion> {
        let mut inner = self.inner.write().await;

        if inner.records.contains_key(&id) {
            warn!("Task {} submitted twice; keeping first record", id);
            return None;
        }

        let mut record = TaskRecord::new(id.clone(), submit_time);
        let outcome = inner.early.remove(&id).map(|seen_at| {
            // A completion cannot precede its own submission
            let done = seen_at.max(submit_time);
            record.complete_time = Some(done);
            inner.completed += 1;
            debug!("Applied early completion for task {}", id);
            Completion::Recorded {
                completed: inner.completed,
                expected: self.expected,
                latency: done - submit_time,
            }
        });

        inner.records.insert(id, record);
        let completed = inner.completed;
        drop(inner);

        if outcome.is_some() {
            self.check_done(completed);
        }
        outcome
    }

    /// Mark a task complete at `at`. Only the first completion for a task
    /// has any effect.
    pub async fn complete(&self, id: &str, at: Instant) -> Completion {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let outcome = match inner.records.get_mut(id) {
            Some(record) if record.is_complete() => Completion::Duplicate,
            Some(record) => {
                let done = at.max(record.submit_time);
                record.complete_time = Some(done);
                let latency = done - record.submit_time;
                inner.completed += 1;
                Completion::Recorded {
                    completed: inner.completed,
                    expected: self.expected,
                    latency,
                }
            }
            None if inner.early.contains_key(id) => Completion::Early,
            None if inner.closed || inner.early.len() >= self.expected => Completion::Unknown,
            None => {
                inner.early.insert(id.to_string(), at);
                Completion::Early
            }
        };

        let completed = inner.completed;
        drop(guard);

        if matches!(outcome, Completion::Recorded { .. }) {
            self.check_done(completed);
        }
        outcome
    }

    /// Stop buffering completions for unknown ids and drop any still
    /// buffered. Called once every task has been submitted.
    pub async fn close_submissions(&self) {
        let mut inner = self.inner.write().await;
        inner.closed = true;
        if !inner.early.is_empty() {
            warn!(
                "Discarding {} completions for tasks never submitted",
                inner.early.len()
            );
            inner.early.clear();
        }
    }

    /// Completions buffered for ids not yet inserted
    pub async fn early_count(&self) -> usize {
        self.inner.read().await.early.len()
    }

    fn check_done(&self, completed: usize) {
        if completed >= self.expected && self.signal.fire() {
            debug!("All {} tasks completed", self.expected);
        }
    }

    pub async fn completed_count(&self) -> usize {
        self.inner.read().await.completed
    }

    pub async fn submitted_count(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Copy of every record, in no particular order
    pub async fn snapshot(&self) -> Vec<TaskRecord> {
        self.inner.read().await.records.values().cloned().collect()
    }
}
