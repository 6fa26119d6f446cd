//! Store traits at the persistence seam
//!
//! The orchestrator, scheduler and token lifecycle manager depend on these
//! traits rather than on [`Database`] directly so tests can install
//! in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::Database;
use crate::models::{Account, ClaimedAccount, Connection, NewAccount, NewTransaction, SyncStatus};

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn find_connection(&self, id: Uuid) -> Result<Option<Connection>, sqlx::Error>;

    async fn insert_connection(&self, connection: &Connection) -> Result<(), sqlx::Error>;

    async fn update_connection_tokens(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_account(&self, account_id: &str) -> Result<Option<Account>, sqlx::Error>;

    async fn upsert_account(&self, account: &NewAccount) -> Result<(), sqlx::Error>;

    async fn update_sync_status(
        &self,
        account_id: &str,
        status: SyncStatus,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error>;

    async fn update_balance(
        &self,
        account_id: &str,
        current: Decimal,
        available: Option<Decimal>,
        overdraft: Option<Decimal>,
        balance_updated_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert-or-ignore; returns the number of rows actually inserted.
    async fn insert_transactions(&self, rows: &[NewTransaction]) -> Result<u64, sqlx::Error>;
}

#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Atomically select-and-claim due accounts under the scheduler advisory
    /// lock. `None` means the lock was not acquired this tick.
    async fn claim_due_accounts(
        &self,
        now: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
        limit: i64,
    ) -> Result<Option<Vec<ClaimedAccount>>, sqlx::Error>;
}

#[async_trait]
impl ConnectionStore for Database {
    async fn find_connection(&self, id: Uuid) -> Result<Option<Connection>, sqlx::Error> {
        Database::find_connection(self, id).await
    }

    async fn insert_connection(&self, connection: &Connection) -> Result<(), sqlx::Error> {
        Database::insert_connection(self, connection).await
    }

    async fn update_connection_tokens(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        Database::update_connection_tokens(self, id, access_token, refresh_token, expires_at).await
    }
}

#[async_trait]
impl AccountStore for Database {
    async fn find_account(&self, account_id: &str) -> Result<Option<Account>, sqlx::Error> {
        Database::find_account(self, account_id).await
    }

    async fn upsert_account(&self, account: &NewAccount) -> Result<(), sqlx::Error> {
        Database::upsert_account(self, account).await
    }

    async fn update_sync_status(
        &self,
        account_id: &str,
        status: SyncStatus,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        Database::update_sync_status(self, account_id, status, last_synced_at).await
    }

    async fn update_balance(
        &self,
        account_id: &str,
        current: Decimal,
        available: Option<Decimal>,
        overdraft: Option<Decimal>,
        balance_updated_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        Database::update_balance(
            self,
            account_id,
            current,
            available,
            overdraft,
            balance_updated_at,
        )
        .await
    }
}

#[async_trait]
impl TransactionStore for Database {
    async fn insert_transactions(&self, rows: &[NewTransaction]) -> Result<u64, sqlx::Error> {
        Database::insert_transactions(self, rows).await
    }
}

#[async_trait]
impl SchedulerStore for Database {
    async fn claim_due_accounts(
        &self,
        now: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
        limit: i64,
    ) -> Result<Option<Vec<ClaimedAccount>>, sqlx::Error> {
        Database::claim_due_accounts(self, now, next_sync_at, limit).await
    }
}
