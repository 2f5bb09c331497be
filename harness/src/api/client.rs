//! TaskApi trait and its HTTP implementation

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::types::{
    ApiError, CreateTaskRequest, CreateTaskResponse, CreateWebhookRequest, CreateWebhookResponse,
    TaskStatus, WebhookRegistration,
};

/// Maximum number of response body characters kept in error messages
const ERROR_BODY_LIMIT: usize = 200;

/// Operations the harness needs from the service under test
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Create a task and return its identifier
    async fn create_task(&self, prompt: &str, tag: &str) -> Result<String, ApiError>;

    /// Get the current status of a task
    async fn task_status(&self, task_id: &str) -> Result<TaskStatus, ApiError>;

    /// Register a completion webhook for `tag`
    async fn register_webhook(
        &self,
        tag: &str,
        url: &str,
    ) -> Result<WebhookRegistration, ApiError>;

    /// Delete a previously registered webhook
    async fn delete_webhook(&self, id: &str) -> Result<(), ApiError>;
}

/// `TaskApi` over HTTP/JSON
///
/// One instance is built per run and shared by every component through an
/// `Arc`, so all requests reuse the same connection pool.
#[derive(Debug, Clone)]
pub struct HttpTaskApi {
    client: Client,
    base_url: String,
}

impl HttpTaskApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ApiError::Transport {
                url: base_url.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and reject non-2xx responses
    async fn send(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await.map_err(|source| ApiError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<T, ApiError> {
        let response = self.send(request, url).await?;
        let body = response.bytes().await.map_err(|source| ApiError::Transport {
            url: url.to_string(),
            source,
        })?;

        serde_json::from_slice(&body).map_err(|e| ApiError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn create_task(&self, prompt: &str, tag: &str) -> Result<String, ApiError> {
        let url = self.url("/api/tasks");
        let request = self
            .client
            .post(&url)
            .json(&CreateTaskRequest { prompt, tag });

        let created: CreateTaskResponse = self.send_json(request, &url).await?;
        debug!("Created task {}", created.task_id);
        Ok(created.task_id)
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatus, ApiError> {
        let url = self.url(&format!("/api/tasks/{}", task_id));
        self.send_json(self.client.get(&url), &url).await
    }

    async fn register_webhook(
        &self,
        tag: &str,
        callback_url: &str,
    ) -> Result<WebhookRegistration, ApiError> {
        let url = self.url("/api/webhooks");
        let request = self.client.post(&url).json(&CreateWebhookRequest {
            tag,
            url: callback_url,
        });

        let created: CreateWebhookResponse = self.send_json(request, &url).await?;
        Ok(WebhookRegistration {
            id: created.id,
            tag: tag.to_string(),
            callback_url: callback_url.to_string(),
        })
    }

    async fn delete_webhook(&self, id: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("/api/webhooks/{}", id));
        self.send(self.client.delete(&url), &url).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = HttpTaskApi::new("http://localhost:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url(), "http://localhost:8000");
        assert_eq!(api.url("/api/tasks"), "http://localhost:8000/api/tasks");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        // Port 9 (discard) is essentially never listening on loopback
        let api = HttpTaskApi::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = api.create_task("p", "benchmark").await.unwrap_err();
        assert!(matches!(err, ApiError::Transport { .. }), "got {err:?}");
    }
}
