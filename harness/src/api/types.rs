//! Task API types and error definitions

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Status value the service reports once a task has finished
pub const STATUS_COMPLETED: &str = "completed";

/// Errors that can occur when talking to the task API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateTaskRequest<'a> {
    pub prompt: &'a str,
    pub tag: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateTaskResponse {
    pub task_id: String,
}

/// Status of a single task as reported by `GET /api/tasks/{id}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub task_id: Option<String>,
    /// Missing when the service does not know the task
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some(STATUS_COMPLETED)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateWebhookRequest<'a> {
    pub tag: &'a str,
    pub url: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateWebhookResponse {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
}

/// A webhook registered for the run's tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRegistration {
    pub id: String,
    pub tag: String,
    pub callback_url: String,
}

/// Accept both numeric and string identifiers
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}
