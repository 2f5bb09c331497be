//! Harness configuration
//!
//! Values start from defaults, are overridden by `TASKLOAD_*` environment
//! variables, and finally by command-line flags.

use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// How task completion is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// The service calls back an ephemeral local endpoint
    Push,
    /// The harness queries task status at a fixed interval
    Poll,
}

impl DetectionMode {
    pub fn name(&self) -> &'static str {
        match self {
            DetectionMode::Push => "WEBHOOK",
            DetectionMode::Poll => "POLLING",
        }
    }
}

/// Report format written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("worker command is empty but {0} workers were requested")]
    EmptyWorkerCommand(usize),

    #[error("API URL must start with http:// or https://, got {0:?}")]
    InvalidApiUrl(String),

    #[error("task tag must not be empty")]
    EmptyTag,
}

/// Main harness configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the task API
    pub api_url: String,
    /// Number of worker processes to spawn
    pub workers: usize,
    /// Total number of tasks to submit
    pub tasks: usize,
    /// Maximum simultaneous task submissions
    pub concurrency: usize,
    /// Completion detection strategy
    pub mode: DetectionMode,
    /// Tag attached to every submitted task and to the webhook
    pub tag: String,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Upper bound on waiting for completions (unbounded when `None`)
    pub completion_timeout: Option<Duration>,
    /// Report format
    pub output: OutputFormat,
    /// Prometheus listener address
    pub metrics_addr: Option<SocketAddr>,

    /// Worker process configuration
    pub worker: WorkerConfig,

    /// Callback endpoint configuration (push mode)
    pub callback: CallbackConfig,

    /// Status polling configuration (poll mode)
    pub poll: PollConfig,
}

/// Worker process configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Delay between spawning and the liveness check
    pub grace: Duration,
    /// How long a worker may take to exit after SIGTERM
    pub stop_timeout: Duration,
}

/// Callback endpoint configuration
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Bind address
    pub host: String,
    /// Bind port (0 picks an ephemeral port)
    pub port: u16,
    /// URL registered with the webhook instead of the derived local one
    pub public_url: Option<String>,
}

/// Status polling configuration
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between status queries for one task
    pub interval: Duration,
    /// Maximum in-flight status queries; `None` follows `Config::concurrency`,
    /// `Some(0)` means unbounded
    pub concurrency: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            workers: 4,
            tasks: 100,
            concurrency: 50,
            mode: DetectionMode::Push,
            tag: "benchmark".to_string(),
            request_timeout: Duration::from_secs(30),
            completion_timeout: None,
            output: OutputFormat::Text,
            metrics_addr: None,
            worker: WorkerConfig::default(),
            callback: CallbackConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: split_command("python -m absurd_test.worker --test"),
            grace: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            public_url: None,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            concurrency: None,
        }
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("TASKLOAD_API_URL")
            && !url.is_empty()
        {
            config.api_url = url;
        }
        if let Ok(val) = env::var("TASKLOAD_WORKERS")
            && let Ok(v) = val.parse()
        {
            config.workers = v;
        }
        if let Ok(val) = env::var("TASKLOAD_TASKS")
            && let Ok(v) = val.parse()
        {
            config.tasks = v;
        }
        if let Ok(val) = env::var("TASKLOAD_CONCURRENCY")
            && let Ok(v) = val.parse()
        {
            config.concurrency = v;
        }
        if let Ok(val) = env::var("TASKLOAD_MODE")
            && let Ok(mode) = DetectionMode::from_str(&val, true)
        {
            config.mode = mode;
        }
        if let Ok(tag) = env::var("TASKLOAD_TAG")
            && !tag.is_empty()
        {
            config.tag = tag;
        }
        if let Ok(val) = env::var("TASKLOAD_REQUEST_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = env::var("TASKLOAD_COMPLETION_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.completion_timeout = Some(Duration::from_secs(secs));
        }
        if let Ok(val) = env::var("TASKLOAD_METRICS_ADDR")
            && let Ok(addr) = val.parse()
        {
            config.metrics_addr = Some(addr);
        }

        // Worker config
        if let Ok(cmd) = env::var("TASKLOAD_WORKER_CMD")
            && !cmd.trim().is_empty()
        {
            config.worker.command = split_command(&cmd);
        }
        if let Ok(val) = env::var("TASKLOAD_WORKER_GRACE_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            config.worker.grace = Duration::from_millis(ms);
        }
        if let Ok(val) = env::var("TASKLOAD_WORKER_STOP_TIMEOUT_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.worker.stop_timeout = Duration::from_secs(secs);
        }

        // Callback config
        if let Ok(host) = env::var("TASKLOAD_CALLBACK_HOST")
            && !host.is_empty()
        {
            config.callback.host = host;
        }
        if let Ok(val) = env::var("TASKLOAD_CALLBACK_PORT")
            && let Ok(port) = val.parse()
        {
            config.callback.port = port;
        }
        if let Ok(url) = env::var("TASKLOAD_CALLBACK_URL")
            && !url.is_empty()
        {
            config.callback.public_url = Some(url);
        }

        // Poll config
        if let Ok(val) = env::var("TASKLOAD_POLL_INTERVAL_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            config.poll.interval = Duration::from_millis(ms);
        }
        if let Ok(val) = env::var("TASKLOAD_POLL_CONCURRENCY")
            && let Ok(v) = val.parse()
        {
            config.poll.concurrency = Some(v);
        }

        config
    }

    /// Build the effective configuration: defaults, then env, then CLI flags
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let mut config = Self::from_env();
        cli.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.workers > 0 && self.worker.command.is_empty() {
            return Err(ConfigError::EmptyWorkerCommand(self.workers));
        }
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::InvalidApiUrl(self.api_url.clone()));
        }
        if self.tag.trim().is_empty() {
            return Err(ConfigError::EmptyTag);
        }
        Ok(())
    }

    /// Effective bound on in-flight status queries, `None` when unbounded
    pub fn poll_limit(&self) -> Option<usize> {
        match self.poll.concurrency {
            None => Some(self.concurrency),
            Some(0) => None,
            Some(n) => Some(n),
        }
    }
}

/// Command-line flags; anything left unset keeps its env/default value
#[derive(Debug, Default, Parser)]
#[command(name = "taskload")]
#[command(author, version, about = "Stress test an asynchronous task service", long_about = None)]
pub struct Cli {
    /// Number of worker processes to spawn
    #[arg(long)]
    pub workers: Option<usize>,

    /// Number of tasks to submit
    #[arg(long)]
    pub tasks: Option<usize>,

    /// Max concurrent submissions
    #[arg(long)]
    pub concurrent: Option<usize>,

    /// Task API base URL
    #[arg(long)]
    pub api_url: Option<String>,

    /// Completion detection mode
    #[arg(long, value_enum)]
    pub mode: Option<DetectionMode>,

    /// Tag attached to submitted tasks
    #[arg(long)]
    pub tag: Option<String>,

    /// Worker command line (whitespace separated)
    #[arg(long)]
    pub worker_cmd: Option<String>,

    /// Callback server bind host
    #[arg(long)]
    pub callback_host: Option<String>,

    /// Callback server bind port
    #[arg(long)]
    pub callback_port: Option<u16>,

    /// URL to register with the webhook (defaults to the local endpoint)
    #[arg(long)]
    pub callback_url: Option<String>,

    /// Interval between status queries in poll mode
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Max in-flight status queries in poll mode (0 = unbounded)
    #[arg(long)]
    pub poll_concurrency: Option<usize>,

    /// Give up waiting for completions after this many seconds
    #[arg(long)]
    pub completion_timeout_secs: Option<u64>,

    /// Report format
    #[arg(long, value_enum)]
    pub output: Option<OutputFormat>,

    /// Serve Prometheus metrics on this address during the run
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Overlay explicitly given flags onto `config`
    pub fn apply(self, config: &mut Config) {
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.tasks {
            config.tasks = v;
        }
        if let Some(v) = self.concurrent {
            config.concurrency = v;
        }
        if let Some(url) = self.api_url {
            config.api_url = url;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(tag) = self.tag {
            config.tag = tag;
        }
        if let Some(cmd) = self.worker_cmd {
            config.worker.command = split_command(&cmd);
        }
        if let Some(host) = self.callback_host {
            config.callback.host = host;
        }
        if let Some(port) = self.callback_port {
            config.callback.port = port;
        }
        if let Some(url) = self.callback_url {
            config.callback.public_url = Some(url);
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll.interval = Duration::from_millis(ms);
        }
        if let Some(n) = self.poll_concurrency {
            config.poll.concurrency = Some(n);
        }
        if let Some(secs) = self.completion_timeout_secs {
            config.completion_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = Some(addr);
        }
    }
}
