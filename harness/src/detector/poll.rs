//! Poll detection: one status-query loop per submitted task

use async_trait::async_trait;
use metrics::counter;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use super::{CompletionDetector, DetectorError, note_completion};
use crate::api::TaskApi;
use crate::config::DetectionMode;
use crate::records::RecordStore;

/// Detects completion by polling task status
pub struct PollDetector {
    api: Arc<dyn TaskApi>,
    store: Arc<RecordStore>,
    interval: Duration,
    /// Bounds in-flight status queries across all loops; `None` is unbounded
    limiter: Option<Arc<Semaphore>>,
    loops: Mutex<JoinSet<usize>>,
}

impl PollDetector {
    pub fn new(
        api: Arc<dyn TaskApi>,
        store: Arc<RecordStore>,
        interval: Duration,
        limit: Option<usize>,
    ) -> Self {
        Self {
            api,
            store,
            interval,
            limiter: limit.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            loops: Mutex::new(JoinSet::new()),
        }
    }

    /// Number of poll loops that have not finished yet
    pub fn active_loops(&self) -> usize {
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        while loops.try_join_next().is_some() {}
        loops.len()
    }
}

#[async_trait]
impl CompletionDetector for PollDetector {
    fn mode(&self) -> DetectionMode {
        DetectionMode::Poll
    }

    fn store(&self) -> &RecordStore {
        &self.store
    }

    async fn arm(&mut self) -> Result<(), DetectorError> {
        match self.limiter {
            Some(ref limiter) => info!(
                "Polling every {:?}, at most {} status queries in flight",
                self.interval,
                limiter.available_permits()
            ),
            None => info!("Polling every {:?}, unbounded", self.interval),
        }
        Ok(())
    }

    fn track(&self, task_id: &str) {
        let poll = poll_until_complete(
            self.api.clone(),
            self.store.clone(),
            task_id.to_string(),
            self.interval,
            self.limiter.clone(),
        );

        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished loops so the set only holds live ones
        while loops.try_join_next().is_some() {}
        loops.spawn(poll);
    }

    async fn disarm(&mut self) {
        let loops = self
            .loops
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if !loops.is_empty() {
            debug!("Cancelling {} poll loops", loops.len());
        }
        loops.abort_all();
        while loops.join_next().await.is_some() {}
    }
}

/// Query `task_id` every `interval` until it reports completed, then record
/// the completion. Returns the number of status queries issued.
///
/// Query errors are logged and polling continues.
pub async fn poll_until_complete(
    api: Arc<dyn TaskApi>,
    store: Arc<RecordStore>,
    task_id: String,
    interval: Duration,
    limiter: Option<Arc<Semaphore>>,
) -> usize {
    let mut queries = 0;
    loop {
        let status = {
            let _permit = match limiter {
                Some(ref limiter) => limiter.acquire().await.ok(),
                None => None,
            };
            api.task_status(&task_id).await
        };
        queries += 1;
        counter!("taskload_status_queries_total").increment(1);

        match status {
            Ok(status) if status.is_completed() => {
                let outcome = store.complete(&task_id, Instant::now()).await;
                note_completion(&task_id, outcome);
                return queries;
            }
            Ok(status) => {
                trace!("Task {} status {:?}", task_id, status.status);
            }
            Err(e) => {
                warn!("Status query for task {} failed: {}", task_id, e);
            }
        }

        tokio::time::sleep(interval).await;
    }
}
