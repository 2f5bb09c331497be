//! Worker process orchestration
//!
//! Spawns the service's worker processes, reports how many survived the
//! startup grace period, and stops them at teardown: SIGTERM first, then
//! SIGKILL once the stop timeout expires.

use futures_util::future::join_all;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;

/// Characters of worker output shown in a diagnostic
const DIAGNOSTIC_CHARS: usize = 200;

/// Bytes of worker stderr kept in memory; the rest is drained and dropped
const STDERR_CAPTURE_BYTES: usize = 4096;

/// How long to wait for a dead worker's output pipe to reach EOF
const OUTPUT_COLLECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Worker teardown errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {index} (pid {pid}) did not exit within {timeout:?} of SIGTERM and was killed")]
    TerminationTimeout {
        index: usize,
        pid: u32,
        timeout: Duration,
    },

    #[error("failed to stop worker {index} (pid {pid}): {source}")]
    Stop {
        index: usize,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// A running worker process
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    pid: u32,
    child: Child,
    output: Option<JoinHandle<String>>,
}

impl WorkerHandle {
    /// 1-based position in spawn order
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status if the process has already exited
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Captured stderr, available once the process has exited
    async fn collect_output(&mut self) -> String {
        let Some(task) = self.output.take() else {
            return String::new();
        };
        match tokio::time::timeout(OUTPUT_COLLECT_TIMEOUT, task).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        }
    }

    fn abort_output(&mut self) {
        if let Some(task) = self.output.take() {
            task.abort();
        }
    }
}

/// Why a worker is not running
#[derive(Debug, Clone)]
pub struct WorkerDiagnostic {
    pub index: usize,
    pub pid: Option<u32>,
    /// Exit status or spawn error
    pub reason: String,
    /// Leading part of the worker's stderr
    pub output: String,
}

impl fmt::Display for WorkerDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "Worker {} (PID {}) died: {}", self.index, pid, self.reason)?,
            None => write!(f, "Worker {} failed to start: {}", self.index, self.reason)?,
        }
        if !self.output.is_empty() {
            write!(f, ": {}", self.output)?;
        }
        Ok(())
    }
}

/// Liveness after the startup grace period
#[derive(Debug, Clone, Default)]
pub struct LivenessReport {
    pub requested: usize,
    pub alive: usize,
    pub diagnostics: Vec<WorkerDiagnostic>,
}

/// Spawns and stops worker processes
#[derive(Debug, Clone)]
pub struct ProcessOrchestrator {
    config: WorkerConfig,
}

impl ProcessOrchestrator {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Spawn `n` workers into `handles`, wait for the grace period, then
    /// report liveness.
    ///
    /// Each worker is pushed into `handles` as soon as it is spawned, so a
    /// caller that stops waiting during the grace period still owns every
    /// process and can `stop` it. Workers found dead after the grace period
    /// are removed again.
    ///
    /// Spawn failures and early exits are reported as diagnostics, never as
    /// errors: the run continues with whatever workers are alive.
    pub async fn start(&self, n: usize, handles: &mut Vec<WorkerHandle>) -> LivenessReport {
        if n == 0 {
            return LivenessReport::default();
        }

        info!("Starting {} workers: {:?}", n, self.config.command);
        handles.reserve(n);
        let mut diagnostics = Vec::new();

        for index in 1..=n {
            match self.spawn(index) {
                Ok(handle) => {
                    info!("Worker {} started (PID {})", index, handle.pid);
                    handles.push(handle);
                }
                Err(e) => {
                    error!("Worker {} failed to spawn: {}", index, e);
                    diagnostics.push(WorkerDiagnostic {
                        index,
                        pid: None,
                        reason: e.to_string(),
                        output: String::new(),
                    });
                }
            }
        }

        tokio::time::sleep(self.config.grace).await;

        let mut alive = Vec::with_capacity(handles.len());
        for mut handle in std::mem::take(handles) {
            match handle.exit_status() {
                None => alive.push(handle),
                Some(status) => {
                    let output = truncate(&handle.collect_output().await);
                    diagnostics.push(WorkerDiagnostic {
                        index: handle.index,
                        pid: Some(handle.pid),
                        reason: status.to_string(),
                        output,
                    });
                }
            }
        }
        *handles = alive;

        info!(
            "{}/{} workers alive after {:?}",
            handles.len(),
            n,
            self.config.grace
        );
        diagnostics.sort_by_key(|d| d.index);
        for diagnostic in &diagnostics {
            warn!("{}", diagnostic);
        }

        LivenessReport {
            requested: n,
            alive: handles.len(),
            diagnostics,
        }
    }

    fn spawn(&self, index: usize) -> std::io::Result<WorkerHandle> {
        let (program, args) = self.config.command.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty worker command")
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().ok_or_else(|| {
            std::io::Error::other("worker exited before its PID could be read")
        })?;
        let output = child.stderr.take().map(|stderr| tokio::spawn(drain(stderr)));

        Ok(WorkerHandle {
            index,
            pid,
            child,
            output,
        })
    }

    /// Stop every worker concurrently.
    ///
    /// All workers are stopped even if some fail; the first failure is
    /// returned so a hung worker is never silently ignored.
    pub async fn stop(&self, handles: Vec<WorkerHandle>) -> Result<(), WorkerError> {
        if handles.is_empty() {
            return Ok(());
        }

        info!("Stopping {} workers", handles.len());
        let timeout = self.config.stop_timeout;
        let results = join_all(handles.into_iter().map(|h| stop_one(h, timeout))).await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn stop_one(mut handle: WorkerHandle, timeout: Duration) -> Result<(), WorkerError> {
    let result = terminate(&mut handle, timeout).await;
    handle.abort_output();
    result
}

async fn terminate(handle: &mut WorkerHandle, timeout: Duration) -> Result<(), WorkerError> {
    let (index, pid) = (handle.index, handle.pid);

    if let Some(status) = handle.exit_status() {
        debug!("Worker {} (PID {}) already exited: {}", index, pid, status);
        return Ok(());
    }

    request_termination(&mut handle.child, pid)
        .map_err(|source| WorkerError::Stop { index, pid, source })?;

    match tokio::time::timeout(timeout, handle.child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Worker {} (PID {}) exited: {}", index, pid, status);
            Ok(())
        }
        Ok(Err(source)) => Err(WorkerError::Stop { index, pid, source }),
        Err(_) => {
            warn!(
                "Worker {} (PID {}) ignored SIGTERM for {:?}; killing",
                index, pid, timeout
            );
            if let Err(e) = handle.child.kill().await {
                error!("Failed to kill worker {} (PID {}): {}", index, pid, e);
            }
            Err(WorkerError::TerminationTimeout {
                index,
                pid,
                timeout,
            })
        }
    }
}

/// Ask the process to exit gracefully
#[cfg(unix)]
fn request_termination(_child: &mut Child, pid: u32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        // Exited between the liveness check and the signal
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child, _pid: u32) -> std::io::Result<()> {
    child.start_kill()
}

/// Read a worker's stderr to EOF, keeping the first few KiB
async fn drain(mut stderr: ChildStderr) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_CAPTURE_BYTES.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

fn truncate(text: &str) -> String {
    text.trim().chars().take(DIAGNOSTIC_CHARS).collect()
}
