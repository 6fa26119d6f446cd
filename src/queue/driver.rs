use async_trait::async_trait;
use serde_json::Value;

use super::{JobHandler, JobName, JobOptions, QueueName, WorkerOptions};
use crate::errors::types::QueueError;

/// Pluggable queue backend.
///
/// Cron support is an explicitly optional capability surfaced through
/// [`QueueDriver::cron`] and checked at composition time, not probed at
/// runtime.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Idempotent creation of the named queue's backing resource.
    async fn register(&self, queue: QueueName) -> Result<(), QueueError>;

    /// Enqueue one job. Returns once the job is durably accepted, not once
    /// it runs. Enqueuing twice with the same `job_id` and queue must not
    /// create two executions.
    async fn add(
        &self,
        queue: QueueName,
        job: JobName,
        payload: Value,
        options: JobOptions,
    ) -> Result<(), QueueError>;

    /// Register exactly one handler per queue; a second registration for the
    /// same queue is rejected.
    async fn work(
        &self,
        queue: QueueName,
        handler: JobHandler,
        options: WorkerOptions,
    ) -> Result<(), QueueError>;

    /// Release driver resources. Safe to call during process shutdown;
    /// in-flight jobs either finish or return to the queue for another
    /// worker.
    async fn close(&self) -> Result<(), QueueError>;

    /// Cron trigger capability, when the driver supports it.
    fn cron(&self) -> Option<&dyn CronScheduling> {
        None
    }
}

/// Optional extension: recurring triggers that enqueue a job on a cron
/// pattern.
#[async_trait]
pub trait CronScheduling: Send + Sync {
    /// Register (idempotently, keyed by `scheduler_id`) a recurring trigger
    /// that enqueues `job` on the given pattern.
    async fn add_cron(
        &self,
        queue: QueueName,
        scheduler_id: &str,
        pattern: &str,
        job: JobName,
        payload: Value,
    ) -> Result<(), QueueError>;
}
