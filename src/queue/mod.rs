//! Job queue abstraction
//!
//! The minimum queue surface the sync subsystem needs: enqueue named jobs
//! with payloads and retry policy, register recurring cron triggers, and
//! bind one worker per queue. Everything is pluggable behind
//! [`driver::QueueDriver`]; a durable Postgres-backed driver and a
//! synchronous in-process driver are both conforming implementations.

pub mod dispatcher;
pub mod driver;
pub mod pg;
pub mod service;
pub mod sync_driver;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::errors::types::AppError;

pub use dispatcher::JobRegistry;
pub use driver::{CronScheduling, QueueDriver};
pub use pg::PgQueueDriver;
pub use service::MessageQueue;
pub use sync_driver::SyncQueueDriver;

/// Logical queue names. One worker callback is installed per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Default,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Default => "default",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The dispatch surface other parts of the system depend on: the OAuth
/// callback flow enqueues `InitialSync` after a user links an account, the
/// scheduler cron trigger fires `PeriodicSync`, and the scheduler itself
/// fans out `AccountSync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobName {
    AccountSync,
    InitialSync,
    PeriodicSync,
}

impl JobName {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobName::AccountSync => "AccountSync",
            JobName::InitialSync => "InitialSync",
            JobName::PeriodicSync => "PeriodicSync",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "AccountSync" => Some(JobName::AccountSync),
            "InitialSync" => Some(JobName::InitialSync),
            "PeriodicSync" => Some(JobName::PeriodicSync),
            _ => None,
        }
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as delivered to a worker callback.
#[derive(Debug, Clone)]
pub struct JobEnvelope {
    /// Driver-assigned execution id
    pub id: String,
    pub name: JobName,
    pub payload: serde_json::Value,
}

/// Retry backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Exponential { base_delay_ms: u64 },
    Fixed { delay_ms: u64 },
}

impl Backoff {
    /// Delay before the given retry. `attempts_made` counts the failures so
    /// far, so the first retry (after one failure) uses the base delay.
    pub fn delay_ms(&self, attempts_made: u32) -> u64 {
        match self {
            Backoff::Exponential { base_delay_ms } => {
                base_delay_ms.saturating_mul(1u64 << attempts_made.saturating_sub(1).min(20))
            }
            Backoff::Fixed { delay_ms } => *delay_ms,
        }
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Idempotency key: enqueuing twice with the same id and queue must not
    /// create two executions.
    pub job_id: Option<String>,
    /// Total attempts before the job is dead-lettered
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            attempts: 3,
            backoff: Backoff::Exponential { base_delay_ms: 1000 },
        }
    }
}

impl JobOptions {
    pub fn with_job_id<S: Into<String>>(job_id: S) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }
}

/// Worker registration options.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// How many jobs this process executes in parallel for the queue
    pub concurrency: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// The single worker callback installed per queue. Handler failures
/// propagate to the driver so its retry policy applies; the driver consults
/// [`AppError::is_unrecoverable`] to short-circuit retries for permanent
/// failures.
pub type JobHandler =
    Arc<dyn Fn(JobEnvelope) -> BoxFuture<'static, Result<(), AppError>> + Send + Sync>;
