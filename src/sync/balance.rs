use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::database::stores::AccountStore;
use crate::errors::types::SyncError;
use crate::provider::BankProviderClient;
use crate::tokens::ConnectionService;

pub struct BalanceSyncService {
    connections: Arc<ConnectionService>,
    provider: Arc<dyn BankProviderClient>,
    accounts: Arc<dyn AccountStore>,
}

impl BalanceSyncService {
    pub fn new(
        connections: Arc<ConnectionService>,
        provider: Arc<dyn BankProviderClient>,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            connections,
            provider,
            accounts,
        }
    }

    /// Fetch the provider balance for one account and update the account's
    /// balance fields. Runs concurrently with transaction sync for the same
    /// account; the transaction path owns `sync_status`, so this only logs
    /// and re-throws on failure.
    pub async fn sync_balance(
        &self,
        account_id: &str,
        connection_id: Uuid,
    ) -> Result<(), SyncError> {
        let result = self.sync_inner(account_id, connection_id).await;
        if let Err(error) = &result {
            error!(
                "Failed to sync balance for account {}: {}",
                account_id, error
            );
        }
        result
    }

    async fn sync_inner(&self, account_id: &str, connection_id: Uuid) -> Result<(), SyncError> {
        let access_token = self.connections.get_access_token(connection_id).await?;

        info!("Fetching balance for account {}", account_id);

        let balance = self.provider.get_balance(&access_token, account_id).await?;
        let balance_updated_at = balance.update_timestamp.unwrap_or_else(Utc::now);

        self.accounts
            .update_balance(
                account_id,
                balance.current,
                balance.available,
                balance.overdraft,
                balance_updated_at,
            )
            .await?;

        info!(
            "Updated balance for account {}: current={}, available={}",
            account_id,
            balance.current,
            balance
                .available
                .map(|a| a.to_string())
                .unwrap_or_else(|| "N/A".to_string())
        );

        Ok(())
    }
}
