use std::sync::Arc;

use serde::Serialize;

use super::driver::QueueDriver;
use super::{JobHandler, JobName, JobOptions, QueueName, WorkerOptions};
use crate::errors::types::QueueError;

/// Per-queue facade binding a driver to a logical queue name.
///
/// Pure pass-through: no state beyond the bound driver and queue name. The
/// queue is registered with the driver at construction.
#[derive(Clone)]
pub struct MessageQueue {
    driver: Arc<dyn QueueDriver>,
    queue: QueueName,
}

impl MessageQueue {
    pub async fn new(driver: Arc<dyn QueueDriver>, queue: QueueName) -> Result<Self, QueueError> {
        driver.register(queue).await?;
        Ok(Self { driver, queue })
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub async fn add<T: Serialize>(
        &self,
        job: JobName,
        payload: &T,
        options: JobOptions,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_value(payload)?;
        self.driver.add(self.queue, job, payload, options).await
    }

    pub async fn add_cron<T: Serialize>(
        &self,
        scheduler_id: &str,
        pattern: &str,
        job: JobName,
        payload: &T,
    ) -> Result<(), QueueError> {
        let cron = self.driver.cron().ok_or(QueueError::CronUnsupported)?;
        let payload = serde_json::to_value(payload)?;
        cron.add_cron(self.queue, scheduler_id, pattern, job, payload)
            .await
    }

    pub async fn work(
        &self,
        handler: JobHandler,
        options: WorkerOptions,
    ) -> Result<(), QueueError> {
        self.driver.work(self.queue, handler, options).await
    }
}
