//! Bounded-concurrency task submission
//!
//! Tasks are submitted in consecutive batches of at most `concurrency`
//! requests. A batch must finish entirely before the next one starts, which
//! bounds in-flight submissions but not in-flight work on the service.

use futures_util::future::try_join_all;
use metrics::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::api::{ApiError, TaskApi};
use crate::detector::note_completion;
use crate::records::RecordStore;

/// Submission errors. Any one of them ends the run.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submitting task {index} failed: {source}")]
    Failed {
        index: usize,
        #[source]
        source: ApiError,
    },
}

/// Result of a completed submission phase
#[derive(Debug, Clone)]
pub struct SubmitSummary {
    pub task_ids: Vec<String>,
    /// Wall-clock time spent submitting
    pub elapsed: Duration,
    /// Most create requests ever in flight at once
    pub peak_in_flight: usize,
}

/// Issues task-creation calls and records submit timestamps
pub struct TaskSubmitter {
    api: Arc<dyn TaskApi>,
    store: Arc<RecordStore>,
    tag: String,
}

impl TaskSubmitter {
    pub fn new(api: Arc<dyn TaskApi>, store: Arc<RecordStore>, tag: impl Into<String>) -> Self {
        Self {
            api,
            store,
            tag: tag.into(),
        }
    }

    /// Submit `total` tasks, at most `concurrency` at a time.
    ///
    /// `on_submitted` is called with each task id right after its record is
    /// stored. The first failure aborts the rest of its batch and every later
    /// batch; nothing is retried.
    pub async fn submit_all<F>(
        &self,
        total: usize,
        concurrency: usize,
        on_submitted: F,
    ) -> Result<SubmitSummary, SubmitError>
    where
        F: Fn(&str) + Sync,
    {
        let start = Instant::now();
        let concurrency = concurrency.max(1);
        let on_submitted = &on_submitted;
        let mut task_ids = Vec::with_capacity(total);
        let in_flight = &AtomicUsize::new(0);
        let peak = &AtomicUsize::new(0);

        info!("Submitting {} tasks ({} concurrent)", total, concurrency);

        for batch_start in (0..total).step_by(concurrency) {
            let batch_end = (batch_start + concurrency).min(total);
            let batch = (batch_start..batch_end).map(|index| async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let submitted = self.submit_one(index).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);

                let task_id = submitted?;
                on_submitted(&task_id);
                Ok::<_, SubmitError>(task_id)
            });

            let ids = try_join_all(batch).await?;
            debug!("Batch {}..{} submitted", batch_start, batch_end);
            task_ids.extend(ids);
        }

        self.store.close_submissions().await;

        let elapsed = start.elapsed();
        info!("Submitted {} tasks in {:.2}s", total, elapsed.as_secs_f64());
        Ok(SubmitSummary {
            task_ids,
            elapsed,
            peak_in_flight: peak.load(Ordering::SeqCst),
        })
    }

    async fn submit_one(&self, index: usize) -> Result<String, SubmitError> {
        let prompt = format!("Benchmark task {}", index);
        // Taken before the request so a completion can never precede it
        let submit_time = Instant::now();

        let task_id = self
            .api
            .create_task(&prompt, &self.tag)
            .await
            .map_err(|source| SubmitError::Failed { index, source })?;

        if let Some(outcome) = self.store.insert(task_id.clone(), submit_time).await {
            note_completion(&task_id, outcome);
        }
        counter!("taskload_tasks_submitted_total").increment(1);
        Ok(task_id)
    }
}
