//! Job registry and dispatcher
//!
//! An explicit, startup-validated mapping from job name to handler, one
//! worker callback per queue. Registering two handlers for the same job
//! name within a queue is a fatal startup error. A worker receiving a job
//! name with no handler logs a warning and acknowledges it as a no-op: an
//! unroutable job name is a deployment bug, not a transient failure, so it
//! must not be retried.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use cron::Schedule;
use serde_json::Value;
use tracing::{info, warn};

use super::service::MessageQueue;
use super::{JobEnvelope, JobHandler, JobName, QueueName, WorkerOptions};
use crate::errors::types::QueueError;

struct CronTrigger {
    queue: QueueName,
    scheduler_id: String,
    pattern: String,
    job: JobName,
    payload: Value,
}

#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<QueueName, HashMap<JobName, JobHandler>>,
    cron_triggers: Vec<CronTrigger>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a handler with a job name on a queue.
    pub fn register(
        &mut self,
        queue: QueueName,
        job: JobName,
        handler: JobHandler,
    ) -> Result<(), QueueError> {
        let queue_handlers = self.handlers.entry(queue).or_default();
        if queue_handlers.contains_key(&job) {
            return Err(QueueError::DuplicateHandler {
                queue: queue.to_string(),
                job: job.to_string(),
            });
        }
        queue_handlers.insert(job, handler);
        Ok(())
    }

    /// Associate a handler with a job name and declare a recurring cron
    /// trigger for it. The pattern is validated here so a bad expression
    /// fails at startup, not at first fire.
    pub fn register_cron(
        &mut self,
        queue: QueueName,
        job: JobName,
        scheduler_id: &str,
        pattern: &str,
        payload: Value,
        handler: JobHandler,
    ) -> Result<(), QueueError> {
        Schedule::from_str(pattern).map_err(|e| QueueError::InvalidCronPattern {
            pattern: pattern.to_string(),
            source: e,
        })?;

        self.register(queue, job, handler)?;
        self.cron_triggers.push(CronTrigger {
            queue,
            scheduler_id: scheduler_id.to_string(),
            pattern: pattern.to_string(),
            job,
            payload,
        });
        Ok(())
    }

    /// Install one worker per queue that has handlers, then register every
    /// declared cron trigger through the queue service.
    pub async fn install(
        self,
        queues: &HashMap<QueueName, MessageQueue>,
        options: WorkerOptions,
    ) -> Result<(), QueueError> {
        for (queue, handlers) in self.handlers {
            let service = queues
                .get(&queue)
                .ok_or_else(|| QueueError::QueueNotRegistered {
                    queue: queue.to_string(),
                })?;

            service.work(Self::dispatch_handler(handlers), options).await?;
            info!("Worker registered for queue \"{}\"", queue);
        }

        for trigger in self.cron_triggers {
            let service =
                queues
                    .get(&trigger.queue)
                    .ok_or_else(|| QueueError::QueueNotRegistered {
                        queue: trigger.queue.to_string(),
                    })?;
            service
                .add_cron(
                    &trigger.scheduler_id,
                    &trigger.pattern,
                    trigger.job,
                    &trigger.payload,
                )
                .await?;
            info!(
                "Cron trigger \"{}\" ({}) registered for job \"{}\"",
                trigger.scheduler_id, trigger.pattern, trigger.job
            );
        }

        Ok(())
    }

    fn dispatch_handler(handlers: HashMap<JobName, JobHandler>) -> JobHandler {
        let handlers = Arc::new(handlers);
        Arc::new(move |job: JobEnvelope| {
            let handlers = Arc::clone(&handlers);
            Box::pin(async move {
                match handlers.get(&job.name) {
                    Some(handler) => {
                        info!("Processing job \"{}\" (id: {})", job.name, job.id);
                        handler(job).await
                    }
                    None => {
                        warn!(
                            "No handler for job \"{}\" (id: {}); acknowledging as no-op",
                            job.name, job.id
                        );
                        Ok(())
                    }
                }
            })
        })
    }
}
