//! Throughput and latency aggregation
//!
//! Percentiles use the "exclusive" quantile definition: the rank of
//! percentile `p` in a sample of `n` is `p * (n + 1)`, interpolated linearly
//! between its neighbours. The outer ranks are clamped to the first and last
//! pair of samples, so small samples extrapolate slightly beyond their
//! extremes at high percentiles. The 50th percentile is the ordinary median.

mod report;

pub use report::Report;

use serde::{Serialize, Serializer};
use std::time::Duration;

use crate::records::TaskRecord;

/// Latency distribution over completed tasks
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    #[serde(serialize_with = "as_secs")]
    pub min: Duration,
    #[serde(serialize_with = "as_secs")]
    pub median: Duration,
    #[serde(serialize_with = "as_secs")]
    pub mean: Duration,
    #[serde(serialize_with = "as_secs")]
    pub max: Duration,
    #[serde(serialize_with = "as_secs")]
    pub p95: Duration,
    #[serde(serialize_with = "as_secs")]
    pub p99: Duration,
}

impl LatencySummary {
    /// Summarise `samples`; `None` when there are none
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort();

        let total: Duration = sorted.iter().sum();
        let mean = total / sorted.len() as u32;

        Some(Self {
            min: sorted[0],
            median: percentile(&sorted, 50.0)?,
            mean,
            max: sorted[sorted.len() - 1],
            p95: percentile(&sorted, 95.0)?,
            p99: percentile(&sorted, 99.0)?,
        })
    }
}

/// Percentile `p` (0-100) of an ascending sample, linearly interpolated
/// on the exclusive rank `p * (n + 1)`
pub fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
    let n = sorted.len();
    match n {
        0 => return None,
        1 => return Some(sorted[0]),
        _ => {}
    }

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n + 1) as f64;
    let j = (rank.floor() as usize).clamp(1, n - 1);
    let weight = rank - j as f64;

    let (a, b) = (sorted[j - 1].as_nanos() as f64, sorted[j].as_nanos() as f64);
    let value = a + (b - a) * weight;
    Some(Duration::from_nanos(value.max(0.0).round() as u64))
}

/// Aggregated run statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkStats {
    pub completed: usize,
    #[serde(serialize_with = "as_secs")]
    pub total_elapsed: Duration,
    /// Completed tasks per second; `None` when nothing completed
    pub throughput: Option<f64>,
    /// `None` when nothing completed
    pub latency: Option<LatencySummary>,
}

/// Compute statistics over every completed record
pub fn compute(records: &[TaskRecord], total_elapsed: Duration) -> BenchmarkStats {
    let latencies: Vec<Duration> = records.iter().filter_map(TaskRecord::latency).collect();
    let completed = latencies.len();

    let secs = total_elapsed.as_secs_f64();
    let throughput = if completed > 0 && secs > 0.0 {
        Some(completed as f64 / secs)
    } else {
        None
    };

    BenchmarkStats {
        completed,
        total_elapsed,
        throughput,
        latency: LatencySummary::from_samples(&latencies),
    }
}

fn as_secs<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64())
}
