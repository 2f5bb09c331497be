//! Common Test Utilities for Integration Tests
//!
//! An in-process stand-in for the task service: tasks, status queries and
//! webhook callbacks over real HTTP on an ephemeral port.

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskload::config::{Config, DetectionMode};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Behaviour of the stub service
#[derive(Debug, Clone)]
pub struct StubOptions {
    /// Delay between task creation and its callbacks
    pub callback_delay: Duration,
    /// Status queries answered with `running` before `completed`
    pub running_for: usize,
    /// Reject every task creation with HTTP 500
    pub fail_create: bool,
    /// Deliver each callback twice
    pub duplicate_callbacks: bool,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            callback_delay: Duration::from_millis(20),
            running_for: 2,
            fail_create: false,
            duplicate_callbacks: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Webhook {
    tag: String,
    url: String,
}

struct StubInner {
    options: StubOptions,
    client: reqwest::Client,
    /// Status queries seen per task
    tasks: Mutex<HashMap<String, usize>>,
    webhooks: Mutex<HashMap<u64, Webhook>>,
    deleted_webhooks: Mutex<Vec<u64>>,
    next_webhook: AtomicU64,
    creates: AtomicUsize,
    callbacks_sent: AtomicUsize,
}

/// Shared view of what the stub has seen
#[derive(Clone)]
pub struct StubState {
    inner: Arc<StubInner>,
}

impl StubState {
    fn new(options: StubOptions) -> Self {
        Self {
            inner: Arc::new(StubInner {
                options,
                client: reqwest::Client::new(),
                tasks: Mutex::new(HashMap::new()),
                webhooks: Mutex::new(HashMap::new()),
                deleted_webhooks: Mutex::new(Vec::new()),
                next_webhook: AtomicU64::new(1),
                creates: AtomicUsize::new(0),
                callbacks_sent: AtomicUsize::new(0),
            }),
        }
    }

    pub fn creates(&self) -> usize {
        self.inner.creates.load(Ordering::SeqCst)
    }

    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }

    /// Status queries per task id
    pub fn status_queries(&self) -> HashMap<String, usize> {
        self.inner.tasks.lock().unwrap().clone()
    }

    pub fn registered_webhooks(&self) -> usize {
        self.inner.webhooks.lock().unwrap().len()
    }

    pub fn deleted_webhooks(&self) -> Vec<u64> {
        self.inner.deleted_webhooks.lock().unwrap().clone()
    }

    /// Callback requests issued, counted before each send
    pub fn callbacks_sent(&self) -> usize {
        self.inner.callbacks_sent.load(Ordering::SeqCst)
    }
}

#[derive(Deserialize)]
struct CreateTask {
    prompt: String,
    tag: String,
}

#[derive(Deserialize)]
struct CreateWebhook {
    tag: String,
    url: String,
}

async fn create_task(State(state): State<StubState>, Json(body): Json<CreateTask>) -> Response {
    state.inner.creates.fetch_add(1, Ordering::SeqCst);
    if state.inner.options.fail_create {
        return (StatusCode::INTERNAL_SERVER_ERROR, "task creation disabled").into_response();
    }

    let task_id = uuid::Uuid::new_v4().to_string();
    state
        .inner
        .tasks
        .lock()
        .unwrap()
        .insert(task_id.clone(), 0);

    let targets: Vec<String> = state
        .inner
        .webhooks
        .lock()
        .unwrap()
        .values()
        .filter(|w| w.tag == body.tag)
        .map(|w| w.url.clone())
        .collect();
    if !targets.is_empty() {
        tokio::spawn(deliver_callbacks(
            state.clone(),
            task_id.clone(),
            body.prompt,
            targets,
        ));
    }

    Json(json!({ "task_id": task_id })).into_response()
}

async fn deliver_callbacks(
    state: StubState,
    task_id: String,
    prompt: String,
    targets: Vec<String>,
) {
    tokio::time::sleep(state.inner.options.callback_delay).await;
    let payload = json!({
        "task_id": task_id,
        "result": format!("processed: {}", prompt),
        "status": "completed",
    });
    let deliveries = if state.inner.options.duplicate_callbacks {
        2
    } else {
        1
    };

    for url in targets {
        for _ in 0..deliveries {
            state.inner.callbacks_sent.fetch_add(1, Ordering::SeqCst);
            let _ = state.inner.client.post(&url).json(&payload).send().await;
        }
    }
}

async fn task_status(State(state): State<StubState>, Path(task_id): Path<String>) -> Response {
    let mut tasks = state.inner.tasks.lock().unwrap();
    let Some(queries) = tasks.get_mut(&task_id) else {
        return Json(json!({ "error": "task not found" })).into_response();
    };
    *queries += 1;

    let status = if *queries > state.inner.options.running_for {
        "completed"
    } else {
        "running"
    };
    Json(json!({ "task_id": task_id, "status": status })).into_response()
}

async fn register_webhook(
    State(state): State<StubState>,
    Json(body): Json<CreateWebhook>,
) -> Response {
    let id = state.inner.next_webhook.fetch_add(1, Ordering::SeqCst);
    state.inner.webhooks.lock().unwrap().insert(
        id,
        Webhook {
            tag: body.tag.clone(),
            url: body.url.clone(),
        },
    );
    Json(json!({ "id": id, "tag": body.tag, "url": body.url })).into_response()
}

async fn delete_webhook(State(state): State<StubState>, Path(id): Path<u64>) -> Response {
    if state.inner.webhooks.lock().unwrap().remove(&id).is_none() {
        return (StatusCode::NOT_FOUND, "webhook not found").into_response();
    }
    state.inner.deleted_webhooks.lock().unwrap().push(id);
    Json(json!({ "ok": true })).into_response()
}

fn stub_routes(state: StubState) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/:id", get(task_status))
        .route("/api/webhooks", post(register_webhook))
        .route("/api/webhooks/:id", delete(delete_webhook))
        .with_state(state)
}

/// A running stub service, stopped on drop
pub struct StubService {
    pub addr: SocketAddr,
    pub state: StubState,
    handle: JoinHandle<()>,
}

impl StubService {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for StubService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a stub service on an ephemeral loopback port
pub async fn spawn_stub(options: StubOptions) -> StubService {
    let state = StubState::new(options);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = stub_routes(state.clone());
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubService {
        addr,
        state,
        handle,
    }
}

/// Configuration pointing at `stub` with no workers and fast timings
pub fn test_config(stub: &StubService, mode: DetectionMode) -> Config {
    let mut config = Config {
        api_url: stub.url(),
        workers: 0,
        tasks: 10,
        concurrency: 5,
        mode,
        request_timeout: Duration::from_secs(5),
        completion_timeout: Some(Duration::from_secs(10)),
        ..Config::default()
    };
    config.callback.port = 0;
    config.poll.interval = Duration::from_millis(5);
    config.worker.grace = Duration::from_millis(100);
    config.worker.stop_timeout = Duration::from_secs(2);
    config
}

/// Initialize test logging
pub fn init_test_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskload=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
