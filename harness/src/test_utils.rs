//! Test Utilities Module
//!
//! In-process `TaskApi` double used by the unit tests. Only compiled when
//! running tests.

#![cfg(test)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::api::{ApiError, TaskApi, TaskStatus, WebhookRegistration};

/// Scriptable task service
///
/// - `create_task` sleeps `create_delay`, then fails if the call index equals
///   `fail_create_at`, otherwise returns `task-<n>`
/// - `task_status` reports `running` for the first `running_for` queries of a
///   task and `completed` afterwards
/// - peak concurrency of both calls is tracked
pub struct MockTaskApi {
    pub create_delay: Duration,
    pub fail_create_at: Option<usize>,
    pub running_for: usize,
    pub status_delay: Duration,

    pub creates: AtomicUsize,
    creates_in_flight: AtomicUsize,
    pub creates_peak: AtomicUsize,
    statuses_in_flight: AtomicUsize,
    pub statuses_peak: AtomicUsize,
    pub status_queries: Mutex<HashMap<String, usize>>,
    pub prompts: Mutex<Vec<String>>,
    pub webhooks: Mutex<Vec<String>>,
    pub deleted_webhooks: Mutex<Vec<String>>,
}

impl Default for MockTaskApi {
    fn default() -> Self {
        Self {
            create_delay: Duration::from_millis(5),
            fail_create_at: None,
            running_for: 0,
            status_delay: Duration::from_millis(1),
            creates: AtomicUsize::new(0),
            creates_in_flight: AtomicUsize::new(0),
            creates_peak: AtomicUsize::new(0),
            statuses_in_flight: AtomicUsize::new(0),
            statuses_peak: AtomicUsize::new(0),
            status_queries: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            webhooks: Mutex::new(Vec::new()),
            deleted_webhooks: Mutex::new(Vec::new()),
        }
    }
}

impl MockTaskApi {
    pub fn completing_after(running_for: usize) -> Self {
        Self {
            running_for,
            ..Self::default()
        }
    }

    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_create_at: Some(index),
            ..Self::default()
        }
    }

    pub fn queries_for(&self, task_id: &str) -> usize {
        self.status_queries
            .lock()
            .unwrap()
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }
}

fn enter(in_flight: &AtomicUsize, peak: &AtomicUsize) {
    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    peak.fetch_max(now, Ordering::SeqCst);
}

#[async_trait]
impl TaskApi for MockTaskApi {
    async fn create_task(&self, prompt: &str, _tag: &str) -> Result<String, ApiError> {
        let call = self.creates.fetch_add(1, Ordering::SeqCst);
        enter(&self.creates_in_flight, &self.creates_peak);
        self.prompts.lock().unwrap().push(prompt.to_string());

        tokio::time::sleep(self.create_delay).await;
        self.creates_in_flight.fetch_sub(1, Ordering::SeqCst);

        if Some(call) == self.fail_create_at {
            return Err(ApiError::Status {
                url: "/api/tasks".to_string(),
                status: 500,
                body: "internal error".to_string(),
            });
        }
        Ok(format!("task-{}", call))
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatus, ApiError> {
        enter(&self.statuses_in_flight, &self.statuses_peak);
        tokio::time::sleep(self.status_delay).await;
        self.statuses_in_flight.fetch_sub(1, Ordering::SeqCst);

        let seen = {
            let mut queries = self.status_queries.lock().unwrap();
            let count = queries.entry(task_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let status = if seen > self.running_for {
            "completed"
        } else {
            "running"
        };
        Ok(TaskStatus {
            task_id: Some(task_id.to_string()),
            status: Some(status.to_string()),
            ..Default::default()
        })
    }

    async fn register_webhook(
        &self,
        tag: &str,
        url: &str,
    ) -> Result<WebhookRegistration, ApiError> {
        let mut webhooks = self.webhooks.lock().unwrap();
        webhooks.push(url.to_string());
        Ok(WebhookRegistration {
            id: webhooks.len().to_string(),
            tag: tag.to_string(),
            callback_url: url.to_string(),
        })
    }

    async fn delete_webhook(&self, id: &str) -> Result<(), ApiError> {
        self.deleted_webhooks.lock().unwrap().push(id.to_string());
        Ok(())
    }
}
