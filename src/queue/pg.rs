//! Durable Postgres-backed queue driver
//!
//! Jobs survive process restart and are claimed with `FOR UPDATE SKIP
//! LOCKED`, so any number of worker processes can poll the same queue.
//! Idempotency keys map onto a unique `(queue, job_key)` index; retries use
//! exponential backoff with jitter up to the configured attempt count,
//! after which the row is dead-lettered for manual inspection. Recurring
//! cron triggers are stored in their own table and fired by a scan loop.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::driver::{CronScheduling, QueueDriver};
use super::{Backoff, JobEnvelope, JobHandler, JobName, JobOptions, QueueName, WorkerOptions};
use crate::config::QueueConfig;
use crate::errors::types::QueueError;

pub struct PgQueueDriver {
    pool: PgPool,
    config: QueueConfig,
    workers: Mutex<HashMap<QueueName, JoinHandle<()>>>,
    cron_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Debug, FromRow)]
struct ClaimedJob {
    id: Uuid,
    job_name: String,
    payload: Value,
    attempts_made: i32,
    max_attempts: i32,
    backoff_kind: String,
    backoff_base_ms: i64,
}

#[derive(Debug, FromRow)]
struct CronTriggerRow {
    scheduler_id: String,
    queue: String,
    pattern: String,
    job_name: String,
    payload: Value,
    last_enqueued_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl PgQueueDriver {
    /// Must be called from within a tokio runtime; the cron trigger scan
    /// loop is spawned immediately.
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let cron_task = tokio::spawn(run_cron_scheduler(
            pool.clone(),
            config.cron_poll_interval_ms,
            shutdown_tx.subscribe(),
        ));

        Self {
            pool,
            config,
            workers: Mutex::new(HashMap::new()),
            cron_task: Mutex::new(Some(cron_task)),
            shutdown_tx,
        }
    }
}

#[async_trait]
impl QueueDriver for PgQueueDriver {
    async fn register(&self, queue: QueueName) -> Result<(), QueueError> {
        // Backing tables are created by the embedded migrations
        debug!("Queue \"{}\" registered", queue);
        Ok(())
    }

    async fn add(
        &self,
        queue: QueueName,
        job: JobName,
        payload: Value,
        options: JobOptions,
    ) -> Result<(), QueueError> {
        insert_job(&self.pool, queue.as_str(), job, payload, &options).await
    }

    async fn work(
        &self,
        queue: QueueName,
        handler: JobHandler,
        options: WorkerOptions,
    ) -> Result<(), QueueError> {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&queue) {
            return Err(QueueError::WorkerAlreadyRegistered {
                queue: queue.to_string(),
            });
        }

        let handle = tokio::spawn(run_worker(
            self.pool.clone(),
            queue,
            handler,
            options,
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        ));
        workers.insert(queue, handle);

        info!(
            "Worker started for queue \"{}\" (concurrency {})",
            queue, options.concurrency
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> =
            self.workers.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(handle) = self.cron_task.lock().await.take() {
            let _ = handle.await;
        }

        info!("Queue driver closed");
        Ok(())
    }

    fn cron(&self) -> Option<&dyn CronScheduling> {
        Some(self)
    }
}

#[async_trait]
impl CronScheduling for PgQueueDriver {
    async fn add_cron(
        &self,
        queue: QueueName,
        scheduler_id: &str,
        pattern: &str,
        job: JobName,
        payload: Value,
    ) -> Result<(), QueueError> {
        Schedule::from_str(pattern).map_err(|e| QueueError::InvalidCronPattern {
            pattern: pattern.to_string(),
            source: e,
        })?;

        sqlx::query(
            "INSERT INTO queue_cron_triggers (scheduler_id, queue, pattern, job_name, payload)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (scheduler_id) DO UPDATE
             SET queue = EXCLUDED.queue, pattern = EXCLUDED.pattern,
                 job_name = EXCLUDED.job_name, payload = EXCLUDED.payload",
        )
        .bind(scheduler_id)
        .bind(queue.as_str())
        .bind(pattern)
        .bind(job.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

async fn insert_job(
    pool: &PgPool,
    queue: &str,
    job: JobName,
    payload: Value,
    options: &JobOptions,
) -> Result<(), QueueError> {
    let id = Uuid::new_v4();
    let job_key = options.job_id.clone().unwrap_or_else(|| id.to_string());
    let (backoff_kind, backoff_base_ms) = match options.backoff {
        Backoff::Exponential { base_delay_ms } => ("exponential", base_delay_ms as i64),
        Backoff::Fixed { delay_ms } => ("fixed", delay_ms as i64),
    };

    // The unique (queue, job_key) index deduplicates repeated enqueue
    // attempts with the same idempotency key.
    sqlx::query(
        "INSERT INTO queue_jobs
             (id, queue, job_key, job_name, payload, status, max_attempts,
              backoff_kind, backoff_base_ms, run_at)
         VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, now())
         ON CONFLICT (queue, job_key) DO NOTHING",
    )
    .bind(id)
    .bind(queue)
    .bind(&job_key)
    .bind(job.as_str())
    .bind(payload)
    .bind(options.attempts as i32)
    .bind(backoff_kind)
    .bind(backoff_base_ms)
    .execute(pool)
    .await?;

    Ok(())
}

async fn run_worker(
    pool: PgPool,
    queue: QueueName,
    handler: JobHandler,
    options: WorkerOptions,
    config: QueueConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut jobs = JoinSet::new();
    let mut poll = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(50)));
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = poll.tick() => {
                while jobs.try_join_next().is_some() {}
                ticks += 1;

                if ticks % 120 == 0 {
                    if let Err(e) =
                        prune_finished(&pool, queue, config.keep_completed, config.keep_failed).await
                    {
                        warn!("Failed to prune finished jobs on queue \"{}\": {}", queue, e);
                    }
                }

                let available = semaphore.available_permits();
                if available == 0 {
                    continue;
                }

                let claimed = match claim_jobs(&pool, queue, available as i64).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        error!("Failed to claim jobs from queue \"{}\": {}", queue, e);
                        continue;
                    }
                };

                for job in claimed {
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        return;
                    };
                    jobs.spawn(run_job(
                        pool.clone(),
                        queue,
                        Arc::clone(&handler),
                        job,
                        permit,
                    ));
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    // Let in-flight jobs finish before the worker exits; anything still
    // pending stays claimable by other workers.
    while jobs.join_next().await.is_some() {}
    debug!("Worker for queue \"{}\" stopped", queue);
}

async fn claim_jobs(
    pool: &PgPool,
    queue: QueueName,
    limit: i64,
) -> Result<Vec<ClaimedJob>, sqlx::Error> {
    sqlx::query_as::<_, ClaimedJob>(
        "UPDATE queue_jobs SET status = 'active', started_at = now()
         WHERE id IN (
             SELECT id FROM queue_jobs
             WHERE queue = $1 AND status = 'pending' AND run_at <= now()
             ORDER BY run_at, id
             FOR UPDATE SKIP LOCKED
             LIMIT $2
         )
         RETURNING id, job_name, payload, attempts_made, max_attempts,
                   backoff_kind, backoff_base_ms",
    )
    .bind(queue.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await
}

async fn run_job(
    pool: PgPool,
    queue: QueueName,
    handler: JobHandler,
    job: ClaimedJob,
    _permit: OwnedSemaphorePermit,
) {
    let Some(name) = JobName::parse(&job.job_name) else {
        error!(
            "Job {} on queue \"{}\" has unknown name \"{}\"; dead-lettering",
            job.id, queue, job.job_name
        );
        if let Err(e) = mark_dead(&pool, job.id, job.attempts_made, "unknown job name").await {
            error!("Failed to dead-letter job {}: {}", job.id, e);
        }
        return;
    };

    let envelope = JobEnvelope {
        id: job.id.to_string(),
        name,
        payload: job.payload.clone(),
    };

    match handler(envelope).await {
        Ok(()) => {
            if let Err(e) = mark_completed(&pool, job.id).await {
                error!("Failed to mark job {} completed: {}", job.id, e);
            }
        }
        Err(err) => {
            let attempts_made = job.attempts_made + 1;

            // Permanent errors short-circuit the retry loop: they require
            // user action and recur with certainty until it happens.
            if err.is_unrecoverable() || attempts_made >= job.max_attempts {
                error!(
                    "Job {} ({}) failed permanently after {} attempt(s): {}",
                    job.id, name, attempts_made, err
                );
                if let Err(e) = mark_dead(&pool, job.id, attempts_made, &err.to_string()).await {
                    error!("Failed to dead-letter job {}: {}", job.id, e);
                }
            } else {
                let backoff = match job.backoff_kind.as_str() {
                    "fixed" => Backoff::Fixed {
                        delay_ms: job.backoff_base_ms as u64,
                    },
                    _ => Backoff::Exponential {
                        base_delay_ms: job.backoff_base_ms as u64,
                    },
                };
                let base_delay = backoff.delay_ms(attempts_made as u32);
                let delay_ms = base_delay + fastrand::u64(0..=base_delay / 10);

                warn!(
                    "Job {} ({}) failed (attempt {}/{}), retrying in {}ms: {}",
                    job.id, name, attempts_made, job.max_attempts, delay_ms, err
                );
                if let Err(e) =
                    schedule_retry(&pool, job.id, attempts_made, delay_ms, &err.to_string()).await
                {
                    error!("Failed to schedule retry for job {}: {}", job.id, e);
                }
            }
        }
    }
}

async fn mark_completed(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE queue_jobs SET status = 'completed', finished_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn mark_dead(
    pool: &PgPool,
    id: Uuid,
    attempts_made: i32,
    last_error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE queue_jobs
         SET status = 'dead', attempts_made = $2, last_error = $3, finished_at = now()
         WHERE id = $1",
    )
    .bind(id)
    .bind(attempts_made)
    .bind(last_error)
    .execute(pool)
    .await?;
    Ok(())
}

async fn schedule_retry(
    pool: &PgPool,
    id: Uuid,
    attempts_made: i32,
    delay_ms: u64,
    last_error: &str,
) -> Result<(), sqlx::Error> {
    let run_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
    sqlx::query(
        "UPDATE queue_jobs
         SET status = 'pending', attempts_made = $2, last_error = $3, run_at = $4
         WHERE id = $1",
    )
    .bind(id)
    .bind(attempts_made)
    .bind(last_error)
    .bind(run_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Retention: keep the most recent completed/dead rows, drop the rest.
async fn prune_finished(
    pool: &PgPool,
    queue: QueueName,
    keep_completed: i64,
    keep_failed: i64,
) -> Result<(), sqlx::Error> {
    for (status, keep) in [("completed", keep_completed), ("dead", keep_failed)] {
        sqlx::query(
            "DELETE FROM queue_jobs
             WHERE queue = $1 AND status = $2 AND id NOT IN (
                 SELECT id FROM queue_jobs
                 WHERE queue = $1 AND status = $2
                 ORDER BY finished_at DESC NULLS LAST
                 LIMIT $3
             )",
        )
        .bind(queue.as_str())
        .bind(status)
        .bind(keep)
        .execute(pool)
        .await?;
    }
    Ok(())
}

async fn run_cron_scheduler(
    pool: PgPool,
    interval_ms: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut poll = tokio::time::interval(Duration::from_millis(interval_ms.max(1000)));

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if let Err(e) = fire_due_triggers(&pool).await {
                    error!("Cron trigger scan failed: {}", e);
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("Cron trigger scheduler stopped");
}

async fn fire_due_triggers(pool: &PgPool) -> Result<(), QueueError> {
    let triggers = sqlx::query_as::<_, CronTriggerRow>(
        "SELECT scheduler_id, queue, pattern, job_name, payload, last_enqueued_at, created_at
         FROM queue_cron_triggers",
    )
    .fetch_all(pool)
    .await?;

    let now = Utc::now();
    for trigger in triggers {
        let schedule = match Schedule::from_str(&trigger.pattern) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    "Cron trigger \"{}\" has invalid pattern \"{}\": {}",
                    trigger.scheduler_id, trigger.pattern, e
                );
                continue;
            }
        };
        let Some(job) = JobName::parse(&trigger.job_name) else {
            warn!(
                "Cron trigger \"{}\" names unknown job \"{}\"",
                trigger.scheduler_id, trigger.job_name
            );
            continue;
        };

        let after = trigger.last_enqueued_at.unwrap_or(trigger.created_at);
        let Some(due) = schedule.after(&after).next() else {
            continue;
        };
        if due > now {
            continue;
        }

        // Deterministic job key per fire time makes the enqueue idempotent
        // across instances scanning the same trigger concurrently.
        let options = JobOptions::with_job_id(format!(
            "cron:{}:{}",
            trigger.scheduler_id,
            due.timestamp()
        ));
        insert_job(pool, &trigger.queue, job, trigger.payload.clone(), &options).await?;

        sqlx::query("UPDATE queue_cron_triggers SET last_enqueued_at = $2 WHERE scheduler_id = $1")
            .bind(&trigger.scheduler_id)
            .bind(due)
            .execute(pool)
            .await?;

        debug!(
            "Cron trigger \"{}\" enqueued \"{}\"",
            trigger.scheduler_id, trigger.job_name
        );
    }

    Ok(())
}
