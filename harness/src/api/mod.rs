//! Client for the task service HTTP API
//!
//! This module provides:
//! - `TaskApi` trait for abstracting the service under test
//! - `HttpTaskApi`, the reqwest-backed implementation
//! - Request/response types for tasks and webhooks

mod client;
mod types;

pub use client::{HttpTaskApi, TaskApi};
pub use types::{ApiError, STATUS_COMPLETED, TaskStatus, WebhookRegistration};
