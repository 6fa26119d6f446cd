use std::sync::Arc;

use tracing::info;

use super::balance::BalanceSyncService;
use super::transactions::{SyncWindow, TransactionSyncService};
use super::AccountSyncPayload;
use crate::database::stores::AccountStore;
use crate::errors::types::SyncError;
use crate::queue::{JobEnvelope, JobHandler};

/// Handler for the periodic `AccountSync` job.
pub struct AccountSyncJob {
    transactions: Arc<TransactionSyncService>,
    balance: Arc<BalanceSyncService>,
    accounts: Arc<dyn AccountStore>,
}

impl AccountSyncJob {
    pub fn new(
        transactions: Arc<TransactionSyncService>,
        balance: Arc<BalanceSyncService>,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            transactions,
            balance,
            accounts,
        }
    }

    pub async fn handle(&self, payload: AccountSyncPayload) -> Result<(), SyncError> {
        info!("Syncing account {}", payload.account_id);

        let account = self.accounts.find_account(&payload.account_id).await?;
        let window = SyncWindow::SinceLast(account.and_then(|a| a.last_synced_at));

        // Balance and transaction sync run concurrently; a failure in one
        // must not stop the other from completing and recording its state.
        let (balance_result, transactions_result) = tokio::join!(
            self.balance
                .sync_balance(&payload.account_id, payload.connection_id),
            self.transactions
                .sync_transactions(&payload.account_id, payload.connection_id, window),
        );

        transactions_result?;
        balance_result?;
        Ok(())
    }

    pub fn handler(self: &Arc<Self>) -> JobHandler {
        let job = Arc::clone(self);
        Arc::new(move |envelope: JobEnvelope| {
            let job = Arc::clone(&job);
            Box::pin(async move {
                let payload: AccountSyncPayload = serde_json::from_value(envelope.payload)?;
                job.handle(payload).await?;
                Ok(())
            })
        })
    }
}

/// Handler for the `InitialSync` job enqueued when a user links an account:
/// one balance fetch plus a fixed historical transaction backfill.
pub struct InitialSyncJob {
    transactions: Arc<TransactionSyncService>,
    balance: Arc<BalanceSyncService>,
    lookback_days: i64,
}

impl InitialSyncJob {
    pub fn new(
        transactions: Arc<TransactionSyncService>,
        balance: Arc<BalanceSyncService>,
        lookback_days: i64,
    ) -> Self {
        Self {
            transactions,
            balance,
            lookback_days,
        }
    }

    pub async fn handle(&self, payload: AccountSyncPayload) -> Result<(), SyncError> {
        info!("Starting initial sync for account {}", payload.account_id);

        self.balance
            .sync_balance(&payload.account_id, payload.connection_id)
            .await?;

        let count = self
            .transactions
            .sync_transactions(
                &payload.account_id,
                payload.connection_id,
                SyncWindow::Days(self.lookback_days),
            )
            .await?;

        if count > 0 {
            info!("Initial sync completed for account {}", payload.account_id);
        }
        Ok(())
    }

    pub fn handler(self: &Arc<Self>) -> JobHandler {
        let job = Arc::clone(self);
        Arc::new(move |envelope: JobEnvelope| {
            let job = Arc::clone(&job);
            Box::pin(async move {
                let payload: AccountSyncPayload = serde_json::from_value(envelope.payload)?;
                job.handle(payload).await?;
                Ok(())
            })
        })
    }
}
