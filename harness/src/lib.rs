//! Taskload Harness Library
//!
//! Drives synthetic load against an asynchronous task-processing service,
//! detects task completion by webhook callback or status polling, and
//! summarises throughput and latency.

pub mod api;
pub mod config;
pub mod detector;
pub mod records;
pub mod runner;
pub mod stats;
pub mod submit;
pub mod workers;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use api::{HttpTaskApi, TaskApi};
pub use config::{Cli, Config, DetectionMode};
pub use records::{RecordStore, TaskRecord};
pub use runner::{BenchmarkRunner, RunError, RunPhase};
pub use stats::{BenchmarkStats, Report};
