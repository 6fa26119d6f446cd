use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::driver::QueueDriver;
use super::{JobEnvelope, JobHandler, JobName, JobOptions, QueueName, WorkerOptions};
use crate::errors::types::QueueError;

/// Synchronous in-process driver for deterministic tests.
///
/// `add` executes the registered handler inline before returning; there is
/// no persistence, no retry and no cron capability. Idempotency keys are
/// still honored: a second `add` with an already-seen `job_id` acknowledges
/// without executing.
#[derive(Default)]
pub struct SyncQueueDriver {
    handlers: Mutex<HashMap<QueueName, JobHandler>>,
    seen_job_ids: Mutex<HashSet<(QueueName, String)>>,
    job_counter: AtomicU64,
}

impl SyncQueueDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueDriver for SyncQueueDriver {
    async fn register(&self, _queue: QueueName) -> Result<(), QueueError> {
        // No backing resource to create
        Ok(())
    }

    async fn add(
        &self,
        queue: QueueName,
        job: JobName,
        payload: Value,
        options: JobOptions,
    ) -> Result<(), QueueError> {
        if let Some(job_id) = &options.job_id {
            let mut seen = self
                .seen_job_ids
                .lock()
                .expect("Couldn't lock seen-job-id set");
            if !seen.insert((queue, job_id.clone())) {
                debug!("Skipping duplicate job id \"{}\" on queue \"{}\"", job_id, queue);
                return Ok(());
            }
        }

        let handler = {
            let handlers = self.handlers.lock().expect("Couldn't lock handler map");
            handlers
                .get(&queue)
                .cloned()
                .ok_or_else(|| QueueError::QueueNotRegistered {
                    queue: queue.to_string(),
                })?
        };

        let id = self.job_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = JobEnvelope {
            id: id.to_string(),
            name: job,
            payload,
        };

        handler(envelope)
            .await
            .map_err(|e| QueueError::Handler(Box::new(e)))
    }

    async fn work(
        &self,
        queue: QueueName,
        handler: JobHandler,
        _options: WorkerOptions,
    ) -> Result<(), QueueError> {
        let mut handlers = self.handlers.lock().expect("Couldn't lock handler map");
        if handlers.contains_key(&queue) {
            return Err(QueueError::WorkerAlreadyRegistered {
                queue: queue.to_string(),
            });
        }
        handlers.insert(queue, handler);
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.handlers
            .lock()
            .expect("Couldn't lock handler map")
            .clear();
        Ok(())
    }
}
