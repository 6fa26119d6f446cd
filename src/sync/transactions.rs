use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::database::stores::{AccountStore, TransactionStore};
use crate::errors::types::SyncError;
use crate::models::{NewTransaction, SyncStatus};
use crate::provider::types::ProviderTransaction;
use crate::provider::BankProviderClient;
use crate::tokens::ConnectionService;

/// How far back one sync pass asks the provider for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWindow {
    /// Fixed lookback in days, used by the initial historical sync
    Days(i64),
    /// Adaptive lookback derived from the account's last successful sync
    SinceLast(Option<DateTime<Utc>>),
}

pub struct TransactionSyncService {
    connections: Arc<ConnectionService>,
    provider: Arc<dyn BankProviderClient>,
    accounts: Arc<dyn AccountStore>,
    transactions: Arc<dyn TransactionStore>,
    config: SyncConfig,
}

impl TransactionSyncService {
    pub fn new(
        connections: Arc<ConnectionService>,
        provider: Arc<dyn BankProviderClient>,
        accounts: Arc<dyn AccountStore>,
        transactions: Arc<dyn TransactionStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            connections,
            provider,
            accounts,
            transactions,
            config,
        }
    }

    /// Fetch and store transactions for one account, returning the number of
    /// rows actually inserted.
    ///
    /// On failure the account's sync status is set to `NEEDS_REAUTH` for
    /// permanent token conditions and `ERROR` otherwise, and the error is
    /// re-thrown so the queue driver's retry policy stays the single source
    /// of truth for whether this runs again. A failing status write is
    /// logged but never masks the triggering error.
    pub async fn sync_transactions(
        &self,
        account_id: &str,
        connection_id: Uuid,
        window: SyncWindow,
    ) -> Result<u64, SyncError> {
        match self.sync_inner(account_id, connection_id, window).await {
            Ok(inserted) => Ok(inserted),
            Err(error) => {
                error!(
                    "Failed to sync transactions for account {}: {}",
                    account_id, error
                );
                let status = if error.is_unrecoverable() {
                    SyncStatus::NeedsReauth
                } else {
                    SyncStatus::Error
                };
                if let Err(status_error) = self
                    .accounts
                    .update_sync_status(account_id, status, None)
                    .await
                {
                    error!(
                        "Failed to record sync status for account {}: {}",
                        account_id, status_error
                    );
                }
                Err(error)
            }
        }
    }

    async fn sync_inner(
        &self,
        account_id: &str,
        connection_id: Uuid,
        window: SyncWindow,
    ) -> Result<u64, SyncError> {
        let access_token = self.connections.get_access_token(connection_id).await?;

        let to_date = Utc::now();
        let from_date = window_start(&self.config, to_date, window);

        info!(
            "Fetching transactions from {} to {} for account {}",
            from_date.format("%Y-%m-%d"),
            to_date.format("%Y-%m-%d"),
            account_id
        );

        let transactions = self
            .provider
            .get_transactions(
                &access_token,
                account_id,
                from_date.date_naive(),
                to_date.date_naive(),
            )
            .await?;

        info!(
            "Fetched {} transactions for account {}",
            transactions.len(),
            account_id
        );

        if transactions.is_empty() {
            self.accounts
                .update_sync_status(account_id, SyncStatus::Ok, Some(Utc::now()))
                .await?;
            return Ok(0);
        }

        let rows: Vec<NewTransaction> = transactions
            .into_iter()
            .map(|transaction| map_transaction(account_id, transaction))
            .collect();

        let inserted = self.transactions.insert_transactions(&rows).await?;

        self.accounts
            .update_sync_status(account_id, SyncStatus::Ok, Some(Utc::now()))
            .await?;

        if inserted > 0 {
            info!(
                "Inserted {} new transactions for account {}",
                inserted, account_id
            );
        } else {
            info!("No new transactions for account {}", account_id);
        }

        Ok(inserted)
    }
}

fn map_transaction(account_id: &str, transaction: ProviderTransaction) -> NewTransaction {
    NewTransaction {
        id: Uuid::new_v4(),
        transaction_id: transaction.transaction_id,
        account_id: account_id.to_string(),
        normalised_provider_transaction_id: transaction.normalised_provider_transaction_id,
        provider_transaction_id: transaction.provider_transaction_id,
        timestamp: transaction.timestamp,
        description: transaction.description,
        amount: transaction.amount,
        currency: transaction.currency,
        transaction_type: transaction.transaction_type,
        transaction_category: transaction.transaction_category,
        transaction_classification: transaction.transaction_classification,
        merchant_name: transaction.merchant_name,
        running_balance: transaction.running_balance,
        meta: transaction.meta,
    }
}

/// Compute the start of the `[from, to]` window.
///
/// For adaptive windows: a never-synced account gets the default lookback;
/// a last sync older than the maximum cap is clamped to the cap so long
/// outages cannot trigger unbounded backfill; a last sync within the
/// default window keeps the default; anything in between starts at
/// `last_synced_at - 1 day`, the overlap being absorbed by upsert
/// idempotence.
fn window_start(config: &SyncConfig, to_date: DateTime<Utc>, window: SyncWindow) -> DateTime<Utc> {
    match window {
        SyncWindow::Days(days) => to_date - Duration::days(days),
        SyncWindow::SinceLast(last_synced_at) => {
            let default_from = to_date - Duration::days(config.default_lookback_days);
            let max_from = to_date - Duration::days(config.max_lookback_days);

            let Some(last) = last_synced_at else {
                return default_from;
            };

            if last < max_from {
                warn!(
                    "Last sync at {} exceeds max lookback of {} days, capping to {}",
                    last.to_rfc3339(),
                    config.max_lookback_days,
                    max_from.to_rfc3339()
                );
                return max_from;
            }

            if last >= default_from {
                return default_from;
            }

            last - Duration::days(1)
        }
    }
}
