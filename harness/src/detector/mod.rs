//! Completion detection
//!
//! This module provides:
//! - `CompletionDetector` trait shared by both strategies
//! - `PushDetector`, which receives webhook callbacks on a local endpoint
//! - `PollDetector`, which queries each task's status until it completes
//! - `build` to pick the strategy from configuration

mod poll;
mod push;

pub use poll::{PollDetector, poll_until_complete};
pub use push::{CallbackPayload, PushDetector, callback_routes};

use async_trait::async_trait;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::api::TaskApi;
use crate::config::{Config, DetectionMode};
use crate::records::{Completion, RecordStore};

/// Progress is logged every this many completions
const PROGRESS_EVERY: usize = 10;

/// Errors raised while arming a detector
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("failed to bind callback server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Determines when each submitted task completes
///
/// Lifecycle: `arm` before submission, `track` for every submitted task,
/// `await_all_complete` once submission is done, `disarm` at teardown.
#[async_trait]
pub trait CompletionDetector: Send + Sync {
    fn mode(&self) -> DetectionMode;

    /// Store that receives completion timestamps
    fn store(&self) -> &RecordStore;

    /// Acquire whatever the strategy needs before tasks are submitted
    async fn arm(&mut self) -> Result<(), DetectorError>;

    /// Start watching a newly submitted task
    fn track(&self, task_id: &str);

    /// Wait until every task has completed and return the time elapsed
    /// since `started`
    async fn await_all_complete(&self, started: Instant) -> Duration {
        self.store().signal().wait().await;
        started.elapsed()
    }

    /// Release everything acquired by `arm`. Best effort; never fails.
    async fn disarm(&mut self);
}

/// Build the detector selected by `config.mode`
pub fn build(
    config: &Config,
    api: Arc<dyn TaskApi>,
    store: Arc<RecordStore>,
) -> Box<dyn CompletionDetector> {
    match config.mode {
        DetectionMode::Push => Box::new(PushDetector::new(
            api,
            store,
            config.tag.clone(),
            config.callback.clone(),
        )),
        DetectionMode::Poll => Box::new(PollDetector::new(
            api,
            store,
            config.poll.interval,
            config.poll_limit(),
        )),
    }
}

/// Shared bookkeeping after a detector reports a completion
pub(crate) fn note_completion(task_id: &str, outcome: Completion) {
    match outcome {
        Completion::Recorded {
            completed,
            expected,
            latency,
        } => {
            counter!("taskload_tasks_completed_total").increment(1);
            histogram!("taskload_task_latency_seconds").record(latency);
            if completed % PROGRESS_EVERY == 0 || completed == expected {
                info!("Progress: {}/{} tasks completed", completed, expected);
            }
        }
        Completion::Duplicate => {
            debug!("Ignoring repeated completion for task {}", task_id);
        }
        Completion::Early => {
            debug!("Completion for task {} arrived before its record", task_id);
        }
        Completion::Unknown => {
            debug!("Ignoring completion for unknown task {}", task_id);
        }
    }
}
