//! Periodic sync scheduler
//!
//! A cron-triggered job that claims a bounded batch of due accounts under a
//! cross-instance advisory lock and fans out one `AccountSync` job per
//! account with an idempotent job key, so re-dispatching the same claimed
//! batch after a crash cannot create duplicate jobs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::{debug, info, warn};

use super::AccountSyncPayload;
use crate::config::SyncConfig;
use crate::database::stores::SchedulerStore;
use crate::errors::types::SyncError;
use crate::queue::{JobEnvelope, JobHandler, JobName, JobOptions, MessageQueue};

/// Idempotent scheduler id for the recurring trigger.
pub const SCHEDULER_ID: &str = "periodic-transaction-sync";

/// Every 5 minutes.
pub const CRON_PATTERN: &str = "0 */5 * * * *";

/// What one scheduler tick did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeriodicSyncOutcome {
    /// Lock held by another instance; nothing was claimed or dispatched
    pub skipped: bool,
    pub claimed: usize,
    pub dispatched: usize,
    pub failed: usize,
}

pub struct PeriodicSyncJob {
    store: Arc<dyn SchedulerStore>,
    queue: MessageQueue,
    config: SyncConfig,
}

impl PeriodicSyncJob {
    pub fn new(store: Arc<dyn SchedulerStore>, queue: MessageQueue, config: SyncConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub async fn handle(&self) -> Result<PeriodicSyncOutcome, SyncError> {
        info!("Starting periodic transaction sync");

        let now = Utc::now();
        // Truncated to the minute boundary to stay aligned with the cron
        // grid across ticks
        let next_sync_at = truncate_to_minute(now + Duration::minutes(self.config.interval_minutes));

        let Some(claimed) = self
            .store
            .claim_due_accounts(now, next_sync_at, self.config.batch_size)
            .await?
        else {
            debug!("Skipping periodic sync; scheduler lock not acquired");
            return Ok(PeriodicSyncOutcome {
                skipped: true,
                ..Default::default()
            });
        };

        if claimed.is_empty() {
            info!("No accounts due for sync");
            return Ok(PeriodicSyncOutcome::default());
        }

        if claimed.len() as i64 >= self.config.batch_size {
            // Backpressure signal, not a failure: remaining due accounts
            // wait for the next tick
            warn!(
                "Batch limit reached ({}); some accounts may be delayed",
                self.config.batch_size
            );
        }

        let claim_ts = now.timestamp_millis();
        let dispatches = claimed.iter().map(|account| {
            let queue = &self.queue;
            async move {
                queue
                    .add(
                        JobName::AccountSync,
                        &AccountSyncPayload {
                            account_id: account.account_id.clone(),
                            connection_id: account.connection_id,
                        },
                        JobOptions::with_job_id(format!(
                            "account:{}:{}",
                            account.account_id, claim_ts
                        )),
                    )
                    .await
            }
        });

        let results = futures::future::join_all(dispatches).await;

        let mut failed = 0;
        for (account, result) in claimed.iter().zip(&results) {
            if let Err(error) = result {
                failed += 1;
                warn!(
                    "Failed to dispatch sync job for account {}: {}",
                    account.account_id, error
                );
            }
        }
        if failed > 0 {
            warn!("{} jobs failed to dispatch in batch", failed);
        }

        let dispatched = claimed.len() - failed;
        info!(
            "Dispatched {} AccountSync jobs, {} failed",
            dispatched, failed
        );

        Ok(PeriodicSyncOutcome {
            skipped: false,
            claimed: claimed.len(),
            dispatched,
            failed,
        })
    }

    pub fn handler(self: &Arc<Self>) -> JobHandler {
        let job = Arc::clone(self);
        Arc::new(move |_envelope: JobEnvelope| {
            let job = Arc::clone(&job);
            Box::pin(async move {
                job.handle().await?;
                Ok(())
            })
        })
    }
}

fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClaimedAccount;
    use crate::queue::driver::QueueDriver;
    use crate::queue::{QueueName, SyncQueueDriver, WorkerOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct FakeSchedulerStore {
        result: Option<Vec<ClaimedAccount>>,
        seen_next_sync_at: Mutex<Option<DateTime<Utc>>>,
    }

    impl FakeSchedulerStore {
        fn claiming(accounts: Vec<ClaimedAccount>) -> Self {
            Self {
                result: Some(accounts),
                seen_next_sync_at: Mutex::new(None),
            }
        }

        fn locked_out() -> Self {
            Self {
                result: None,
                seen_next_sync_at: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SchedulerStore for FakeSchedulerStore {
        async fn claim_due_accounts(
            &self,
            _now: DateTime<Utc>,
            next_sync_at: DateTime<Utc>,
            _limit: i64,
        ) -> Result<Option<Vec<ClaimedAccount>>, sqlx::Error> {
            *self.seen_next_sync_at.lock().unwrap() = Some(next_sync_at);
            Ok(self.result.clone())
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            interval_minutes: 5,
            batch_size: 2,
            default_lookback_days: 7,
            max_lookback_days: 90,
            initial_lookback_days: 90,
        }
    }

    async fn queue_with_counter() -> (MessageQueue, Arc<AtomicUsize>) {
        let driver = Arc::new(SyncQueueDriver::new());
        let queue = MessageQueue::new(driver as Arc<dyn QueueDriver>, QueueName::Default)
            .await
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler_counter = Arc::clone(&counter);
        queue
            .work(
                Arc::new(move |_job| {
                    let counter = Arc::clone(&handler_counter);
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
                WorkerOptions::default(),
            )
            .await
            .unwrap();
        (queue, counter)
    }

    fn accounts(n: usize) -> Vec<ClaimedAccount> {
        (0..n)
            .map(|i| ClaimedAccount {
                account_id: format!("acc-{i}"),
                connection_id: Uuid::new_v4(),
            })
            .collect()
    }

    #[tokio::test]
    async fn lock_not_acquired_skips_silently() {
        let (queue, counter) = queue_with_counter().await;
        let store = Arc::new(FakeSchedulerStore::locked_out());
        let job = PeriodicSyncJob::new(store, queue, test_config());

        let outcome = job.handle().await.unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.claimed, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_due_accounts_dispatches_nothing() {
        let (queue, counter) = queue_with_counter().await;
        let store = Arc::new(FakeSchedulerStore::claiming(vec![]));
        let job = PeriodicSyncJob::new(store, queue, test_config());

        let outcome = job.handle().await.unwrap();
        assert!(!outcome.skipped);
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatches_one_job_per_claimed_account() {
        let (queue, counter) = queue_with_counter().await;
        let store = Arc::new(FakeSchedulerStore::claiming(accounts(2)));
        let job = PeriodicSyncJob::new(Arc::clone(&store) as Arc<dyn SchedulerStore>, queue, test_config());

        let outcome = job.handle().await.unwrap();
        assert_eq!(outcome.claimed, 2);
        assert_eq!(outcome.dispatched, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        // The claim horizon passed to the store is minute-aligned
        let next = store.seen_next_sync_at.lock().unwrap().unwrap();
        assert_eq!(next.second(), 0);
        assert_eq!(next.nanosecond(), 0);
    }

    #[tokio::test]
    async fn dispatch_failures_are_collected_per_account() {
        let driver = Arc::new(SyncQueueDriver::new());
        let queue = MessageQueue::new(driver as Arc<dyn QueueDriver>, QueueName::Default)
            .await
            .unwrap();
        // Handler fails for one specific account, succeeds for the rest
        queue
            .work(
                Arc::new(move |job: JobEnvelope| {
                    Box::pin(async move {
                        let payload: AccountSyncPayload =
                            serde_json::from_value(job.payload)?;
                        if payload.account_id == "acc-0" {
                            Err(crate::errors::types::AppError::configuration("boom"))
                        } else {
                            Ok(())
                        }
                    })
                }),
                WorkerOptions::default(),
            )
            .await
            .unwrap();

        let store = Arc::new(FakeSchedulerStore::claiming(accounts(2)));
        let job = PeriodicSyncJob::new(store, queue, test_config());

        let outcome = job.handle().await.unwrap();
        assert_eq!(outcome.claimed, 2);
        assert_eq!(outcome.dispatched, 1);
        assert_eq!(outcome.failed, 1);
    }

    #[test]
    fn truncates_to_minute_start() {
        let ts = Utc::now();
        let truncated = truncate_to_minute(ts);
        assert_eq!(truncated.second(), 0);
        assert_eq!(truncated.nanosecond(), 0);
        assert!(truncated <= ts);
    }
}
