//! Benchmark run lifecycle
//!
//! A run moves strictly forward through its phases:
//!
//! ```text
//! Idle -> WorkersStarted -> DetectorArmed -> Submitting
//!      -> AwaitingCompletion -> Reporting -> TornDown
//! ```
//!
//! Teardown (detector disarm, then worker stop) runs on every exit path,
//! including failures and interruption. Reporting only happens on success.

use chrono::Local;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::api::{ApiError, HttpTaskApi, TaskApi};
use crate::config::Config;
use crate::detector::{self, CompletionDetector, DetectorError};
use crate::records::RecordStore;
use crate::stats::{self, Report};
use crate::submit::{SubmitError, TaskSubmitter};
use crate::workers::{LivenessReport, ProcessOrchestrator, WorkerError, WorkerHandle};

/// Phase of a benchmark run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    Idle,
    WorkersStarted,
    DetectorArmed,
    Submitting,
    AwaitingCompletion,
    Reporting,
    TornDown,
}

/// Errors that end a run
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to build API client: {0}")]
    Client(#[source] ApiError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("only {completed}/{total} tasks completed within {timeout:?}")]
    CompletionTimeout {
        timeout: Duration,
        completed: usize,
        total: usize,
    },

    #[error("run interrupted")]
    Interrupted,

    #[error("worker teardown failed: {0}")]
    Teardown(#[from] WorkerError),

    #[error("{run}; worker teardown also failed: {teardown}")]
    RunAndTeardown {
        run: Box<RunError>,
        teardown: WorkerError,
    },

    #[error("this runner has already been used")]
    AlreadyRun,
}

/// Drives one benchmark run end to end
pub struct BenchmarkRunner {
    config: Config,
    api: Arc<dyn TaskApi>,
    orchestrator: ProcessOrchestrator,
    phase: RunPhase,
    history: Vec<RunPhase>,
    liveness: LivenessReport,
}

impl BenchmarkRunner {
    /// Create a runner talking HTTP to `config.api_url`
    pub fn new(config: Config) -> Result<Self, RunError> {
        let api =
            HttpTaskApi::new(&config.api_url, config.request_timeout).map_err(RunError::Client)?;
        Ok(Self::with_api(config, Arc::new(api)))
    }

    /// Create a runner over an arbitrary task API
    pub fn with_api(config: Config, api: Arc<dyn TaskApi>) -> Self {
        let orchestrator = ProcessOrchestrator::new(config.worker.clone());
        Self {
            config,
            api,
            orchestrator,
            phase: RunPhase::Idle,
            history: Vec::new(),
            liveness: LivenessReport::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Phases entered so far, in order
    pub fn history(&self) -> &[RunPhase] {
        &self.history
    }

    /// Worker liveness observed after the startup grace period
    pub fn liveness(&self) -> &LivenessReport {
        &self.liveness
    }

    /// Run to completion
    pub async fn run(&mut self) -> Result<Report, RunError> {
        self.run_until(std::future::pending()).await
    }

    /// Run until completion or until `shutdown` resolves, whichever comes
    /// first. Teardown happens either way.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<Report, RunError>
    where
        F: Future<Output = ()>,
    {
        if self.phase != RunPhase::Idle {
            return Err(RunError::AlreadyRun);
        }

        let store = Arc::new(RecordStore::new(self.config.tasks));
        let mut detector = detector::build(&self.config, self.api.clone(), store.clone());
        let mut workers = Vec::new();

        let outcome = tokio::select! {
            outcome = self.execute(&store, detector.as_mut(), &mut workers) => outcome,
            _ = shutdown => {
                warn!("Shutdown requested; tearing down");
                Err(RunError::Interrupted)
            }
        };

        let teardown = self.teardown(detector.as_mut(), workers).await;

        match (outcome, teardown) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(teardown)) => Err(RunError::Teardown(teardown)),
            (Err(run), Ok(())) => Err(run),
            (Err(run), Err(teardown)) => Err(RunError::RunAndTeardown {
                run: Box::new(run),
                teardown,
            }),
        }
    }

    async fn execute(
        &mut self,
        store: &Arc<RecordStore>,
        detector: &mut dyn CompletionDetector,
        workers: &mut Vec<WorkerHandle>,
    ) -> Result<Report, RunError> {
        let started_at = Local::now();
        info!(
            "Taskload stress test ({} mode): {} tasks, {} concurrent, {} workers against {}",
            self.config.mode.name(),
            self.config.tasks,
            self.config.concurrency,
            self.config.workers,
            self.config.api_url
        );

        // Handles land in `workers` before the grace period, so an interrupt
        // during startup still stops them through teardown
        self.liveness = self.orchestrator.start(self.config.workers, workers).await;
        self.enter(RunPhase::WorkersStarted);

        detector.arm().await?;
        self.enter(RunPhase::DetectorArmed);

        self.enter(RunPhase::Submitting);
        let detector: &dyn CompletionDetector = detector;
        let submit_start = Instant::now();
        let submitter =
            TaskSubmitter::new(self.api.clone(), store.clone(), self.config.tag.clone());
        let summary = submitter
            .submit_all(self.config.tasks, self.config.concurrency, |id| {
                detector.track(id)
            })
            .await?;

        self.enter(RunPhase::AwaitingCompletion);
        info!("Waiting for {} tasks to complete", self.config.tasks);
        let waiting = detector.await_all_complete(submit_start);
        let total_elapsed = match self.config.completion_timeout {
            None => waiting.await,
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(elapsed) => elapsed,
                Err(_) => {
                    return Err(RunError::CompletionTimeout {
                        timeout: limit,
                        completed: store.completed_count().await,
                        total: self.config.tasks,
                    });
                }
            },
        };
        info!(
            "All {} tasks completed in {:.2}s",
            self.config.tasks,
            total_elapsed.as_secs_f64()
        );

        self.enter(RunPhase::Reporting);
        let records = store.snapshot().await;
        let stats = stats::compute(&records, total_elapsed);
        Ok(Report::new(
            &self.config,
            started_at,
            self.liveness.alive,
            &summary,
            stats,
        ))
    }

    async fn teardown(
        &mut self,
        detector: &mut dyn CompletionDetector,
        workers: Vec<WorkerHandle>,
    ) -> Result<(), WorkerError> {
        detector.disarm().await;
        let result = self.orchestrator.stop(workers).await;
        if let Err(ref e) = result {
            error!("Teardown incomplete: {}", e);
        }
        self.enter(RunPhase::TornDown);
        result
    }

    fn enter(&mut self, next: RunPhase) {
        debug_assert!(
            next > self.phase,
            "phase {:?} cannot follow {:?}",
            next,
            self.phase
        );
        info!("Phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        self.history.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionMode;
    use crate::test_utils::MockTaskApi;

    fn poll_config(tasks: usize) -> Config {
        let mut config = Config {
            workers: 0,
            tasks,
            concurrency: 3,
            mode: DetectionMode::Poll,
            ..Config::default()
        };
        config.poll.interval = Duration::from_millis(1);
        config
    }

    fn push_config(tasks: usize) -> Config {
        let mut config = Config {
            workers: 0,
            tasks,
            concurrency: 3,
            mode: DetectionMode::Push,
            ..Config::default()
        };
        config.callback.port = 0;
        config
    }

    #[tokio::test]
    async fn test_poll_run_reports_every_task() {
        let api = Arc::new(MockTaskApi::completing_after(1));
        let mut runner = BenchmarkRunner::with_api(poll_config(6), api.clone());

        let report = runner.run().await.unwrap();

        assert_eq!(report.stats.completed, 6);
        assert!(report.stats.throughput.is_some());
        assert!(report.stats.latency.is_some());
        assert_eq!(report.tasks_submitted, 6);
        assert_eq!(report.mode, runner.config().mode);
        assert_eq!(
            runner.history(),
            &[
                RunPhase::WorkersStarted,
                RunPhase::DetectorArmed,
                RunPhase::Submitting,
                RunPhase::AwaitingCompletion,
                RunPhase::Reporting,
                RunPhase::TornDown,
            ]
        );
        assert_eq!(api.queries_for("task-0"), 2);
    }

    #[tokio::test]
    async fn test_zero_tasks_reports_no_data() {
        let api = Arc::new(MockTaskApi::default());
        let mut runner = BenchmarkRunner::with_api(poll_config(0), api);

        let report = tokio::time::timeout(Duration::from_secs(2), runner.run())
            .await
            .expect("returns without waiting")
            .unwrap();

        assert_eq!(report.stats.completed, 0);
        assert_eq!(report.stats.throughput, None);
        assert_eq!(report.stats.latency, None);
        assert!(report.to_string().contains("no data"));
        assert_eq!(runner.phase(), RunPhase::TornDown);
    }

    #[tokio::test]
    async fn test_submission_failure_still_tears_down() {
        let api = Arc::new(MockTaskApi::failing_at(0));
        let mut runner = BenchmarkRunner::with_api(push_config(5), api.clone());

        let err = runner.run().await.unwrap_err();

        assert!(matches!(err, RunError::Submit(_)));
        assert_eq!(runner.phase(), RunPhase::TornDown);
        assert!(!runner.history().contains(&RunPhase::Reporting));
        assert_eq!(api.webhooks.lock().unwrap().len(), 1);
        assert_eq!(*api.deleted_webhooks.lock().unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_completion_timeout() {
        let api = Arc::new(MockTaskApi::completing_after(usize::MAX));
        let mut config = poll_config(3);
        config.completion_timeout = Some(Duration::from_millis(50));
        let mut runner = BenchmarkRunner::with_api(config, api);

        let err = runner.run().await.unwrap_err();

        match err {
            RunError::CompletionTimeout {
                completed, total, ..
            } => {
                assert_eq!(completed, 0);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(runner.phase(), RunPhase::TornDown);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_run() {
        let api = Arc::new(MockTaskApi::completing_after(usize::MAX));
        let mut runner = BenchmarkRunner::with_api(poll_config(4), api);

        let err = runner
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Interrupted));
        assert_eq!(runner.phase(), RunPhase::TornDown);
        assert!(!runner.history().contains(&RunPhase::Reporting));
    }

    #[tokio::test]
    async fn test_runner_is_single_use() {
        let api = Arc::new(MockTaskApi::default());
        let mut runner = BenchmarkRunner::with_api(poll_config(0), api);

        runner.run().await.unwrap();
        assert!(matches!(runner.run().await, Err(RunError::AlreadyRun)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_workers_stopped_after_failure() {
        use crate::config::WorkerConfig;

        let api = Arc::new(MockTaskApi::failing_at(0));
        let mut config = poll_config(2);
        config.workers = 2;
        config.worker = WorkerConfig {
            command: vec!["sleep".to_string(), "30".to_string()],
            grace: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
        };
        let mut runner = BenchmarkRunner::with_api(config, api);

        let started = Instant::now();
        let err = runner.run().await.unwrap_err();

        // `sleep` exits on SIGTERM, so teardown itself succeeds
        assert!(matches!(err, RunError::Submit(_)));
        assert_eq!(runner.liveness().alive, 2);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt_during_startup_terminates_workers() {
        use crate::config::WorkerConfig;

        // The worker records that it received SIGTERM rather than SIGKILL
        let marker = std::env::temp_dir().join(format!("taskload-sigterm-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let script = format!(
            "trap 'echo stopped > {}; exit 0' TERM; sleep 30 & wait",
            marker.display()
        );

        let api = Arc::new(MockTaskApi::default());
        let mut config = poll_config(2);
        config.workers = 1;
        config.worker = WorkerConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script],
            grace: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(2),
        };
        let mut runner = BenchmarkRunner::with_api(config, api.clone());

        let err = runner
            .run_until(tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Interrupted));
        assert_eq!(runner.history(), &[RunPhase::TornDown]);
        assert_eq!(api.creates.load(std::sync::atomic::Ordering::SeqCst), 0);
        let written = std::fs::read_to_string(&marker).unwrap_or_default();
        assert_eq!(written.trim(), "stopped");
        let _ = std::fs::remove_file(&marker);
    }
}
