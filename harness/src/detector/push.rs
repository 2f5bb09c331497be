//! Push detection: webhook registration plus an ephemeral callback server

use async_trait::async_trait;
use axum::{Json, Router, extract::State, routing::post};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::{CompletionDetector, DetectorError, note_completion};
use crate::api::{TaskApi, WebhookRegistration};
use crate::config::{CallbackConfig, DetectionMode};
use crate::records::RecordStore;

/// Body of `POST /callback`
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    pub task_id: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
struct CallbackAck {
    ok: bool,
}

#[derive(Clone)]
struct CallbackState {
    store: Arc<RecordStore>,
}

/// POST /callback - record a task completion
async fn handle_callback(
    State(state): State<CallbackState>,
    Json(payload): Json<CallbackPayload>,
) -> Json<CallbackAck> {
    counter!("taskload_callbacks_total").increment(1);
    if let Some(status) = payload.status.as_deref() {
        debug!("Callback for task {} (status {})", payload.task_id, status);
    }

    let outcome = state.store.complete(&payload.task_id, Instant::now()).await;
    note_completion(&payload.task_id, outcome);

    Json(CallbackAck { ok: true })
}

/// Build the callback router
pub fn callback_routes(store: Arc<RecordStore>) -> Router {
    Router::new()
        .route("/callback", post(handle_callback))
        .with_state(CallbackState { store })
        .layer(TraceLayer::new_for_http())
}

/// Detects completion through webhook callbacks
pub struct PushDetector {
    api: Arc<dyn TaskApi>,
    store: Arc<RecordStore>,
    tag: String,
    callback: CallbackConfig,
    local_addr: Option<SocketAddr>,
    server: Option<JoinHandle<()>>,
    registration: Option<WebhookRegistration>,
}

impl PushDetector {
    pub fn new(
        api: Arc<dyn TaskApi>,
        store: Arc<RecordStore>,
        tag: String,
        callback: CallbackConfig,
    ) -> Self {
        Self {
            api,
            store,
            tag,
            callback,
            local_addr: None,
            server: None,
            registration: None,
        }
    }

    /// Address the callback server is bound to, once armed
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn registration(&self) -> Option<&WebhookRegistration> {
        self.registration.as_ref()
    }

    /// URL the service should call back
    fn callback_url(&self, bound: SocketAddr) -> String {
        if let Some(ref url) = self.callback.public_url {
            return url.clone();
        }
        let ip = bound.ip();
        let host = if ip.is_loopback() || ip.is_unspecified() {
            "localhost".to_string()
        } else {
            ip.to_string()
        };
        format!("http://{}:{}/callback", host, bound.port())
    }
}

#[async_trait]
impl CompletionDetector for PushDetector {
    fn mode(&self) -> DetectionMode {
        DetectionMode::Push
    }

    fn store(&self) -> &RecordStore {
        &self.store
    }

    async fn arm(&mut self) -> Result<(), DetectorError> {
        let addr = format!("{}:{}", self.callback.host, self.callback.port);
        let bind_error = |source| DetectorError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).await.map_err(bind_error)?;
        let bound = listener.local_addr().map_err(bind_error)?;

        let app = callback_routes(self.store.clone());
        self.server = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Callback server failed: {}", e);
            }
        }));
        self.local_addr = Some(bound);
        info!("Callback server listening on {}", bound);

        let url = self.callback_url(bound);
        match self.api.register_webhook(&self.tag, &url).await {
            Ok(registration) => {
                info!(
                    "Webhook registered (ID: {}) for tag '{}' -> {}",
                    registration.id, registration.tag, registration.callback_url
                );
                self.registration = Some(registration);
            }
            Err(e) => {
                error!("Webhook registration failed; callbacks may never arrive: {}", e);
            }
        }

        Ok(())
    }

    fn track(&self, _task_id: &str) {
        // Callbacks arrive on their own
    }

    async fn disarm(&mut self) {
        if let Some(registration) = self.registration.take() {
            info!("Deleting webhook {}", registration.id);
            if let Err(e) = self.api.delete_webhook(&registration.id).await {
                warn!("Failed to delete webhook {}: {}", registration.id, e);
            }
        }

        if let Some(server) = self.server.take() {
            server.abort();
            let _ = server.await;
            debug!("Callback server stopped");
        }
    }
}
