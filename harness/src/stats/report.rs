//! Human-readable and JSON run reports

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::{BenchmarkStats, as_secs};
use crate::config::{Config, DetectionMode};
use crate::submit::SubmitSummary;

const RULE: &str = "============================================================";

/// Final report of a run: configuration echo plus statistics
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub mode: DetectionMode,
    pub started_at: DateTime<Local>,
    pub api_url: String,
    pub workers_requested: usize,
    pub workers_alive: usize,
    pub tasks_submitted: usize,
    pub concurrency: usize,
    #[serde(serialize_with = "as_secs")]
    pub submit_elapsed: Duration,
    /// Most create requests observed in flight at once
    pub peak_concurrent: usize,
    pub stats: BenchmarkStats,
}

impl Report {
    pub fn new(
        config: &Config,
        started_at: DateTime<Local>,
        workers_alive: usize,
        submit: &SubmitSummary,
        stats: BenchmarkStats,
    ) -> Self {
        Self {
            mode: config.mode,
            started_at,
            api_url: config.api_url.clone(),
            workers_requested: config.workers,
            workers_alive,
            tasks_submitted: config.tasks,
            concurrency: config.concurrency,
            submit_elapsed: submit.elapsed,
            peak_concurrent: submit.peak_in_flight,
            stats,
        }
    }

    /// Single-line JSON for CI parsing
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn write_latency(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Latency (submit -> complete):")?;
        match self.stats.latency {
            Some(latency) => {
                writeln!(f, "  Min:               {}", secs(latency.min))?;
                writeln!(f, "  Median:            {}", secs(latency.median))?;
                writeln!(f, "  Mean:              {}", secs(latency.mean))?;
                writeln!(f, "  Max:               {}", secs(latency.max))?;
                writeln!(f, "  P95:               {}", secs(latency.p95))?;
                writeln!(f, "  P99:               {}", secs(latency.p99))
            }
            None => writeln!(f, "  no data (no tasks completed)"),
        }
    }
}

fn secs(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE)?;
        writeln!(f, "BENCHMARK RESULTS ({} MODE)", self.mode.name())?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Time: {}", self.started_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "Configuration:")?;
        writeln!(f, "  API URL:           {}", self.api_url)?;
        writeln!(
            f,
            "  Workers:           {} ({} alive)",
            self.workers_requested, self.workers_alive
        )?;
        writeln!(f, "  Tasks submitted:   {}", self.tasks_submitted)?;
        writeln!(f, "  Concurrent batch:  {}", self.concurrency)?;
        writeln!(f)?;
        writeln!(f, "Throughput:")?;
        writeln!(f, "  Total time:        {}", secs(self.stats.total_elapsed))?;
        writeln!(f, "  Submit time:       {}", secs(self.submit_elapsed))?;
        writeln!(f, "  Tasks completed:   {}", self.stats.completed)?;
        match self.stats.throughput {
            Some(rate) => writeln!(f, "  Tasks/second:      {:.2}", rate)?,
            None => writeln!(f, "  Tasks/second:      no data")?,
        }
        writeln!(f)?;
        self.write_latency(f)?;
        writeln!(f)?;
        writeln!(f, "Concurrency:")?;
        writeln!(f, "  Peak concurrent:   {}", self.peak_concurrent)?;
        write!(f, "{}", RULE)
    }
}
