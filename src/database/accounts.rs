use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::Database;
use crate::models::{Account, ClaimedAccount, NewAccount, SyncStatus};

/// PostgreSQL advisory lock key used to prevent concurrent scheduler runs
/// across multiple server instances. Only one instance can hold this lock
/// at a time within a transaction.
pub const SCHEDULER_LOCK_KEY: i64 = 4242001;

impl Database {
    pub async fn find_account(&self, account_id: &str) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>(
            "SELECT id, account_id, connection_id, user_id, account_type, display_name,
                    currency, current_balance, available_balance, overdraft,
                    balance_updated_at, sync_status, last_synced_at, next_sync_at,
                    created_at, updated_at
             FROM accounts WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool())
        .await
    }

    /// Insert a provider-discovered account, refreshing display metadata when
    /// the external account id is already known.
    pub async fn upsert_account(&self, account: &NewAccount) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO accounts
                 (id, account_id, connection_id, user_id, account_type, display_name,
                  currency, sync_status, next_sync_at, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
             ON CONFLICT (account_id) DO UPDATE
             SET display_name = EXCLUDED.display_name,
                 account_type = EXCLUDED.account_type,
                 currency = EXCLUDED.currency,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(account.id)
        .bind(&account.account_id)
        .bind(account.connection_id)
        .bind(&account.user_id)
        .bind(account.account_type)
        .bind(&account.display_name)
        .bind(account.currency)
        .bind(SyncStatus::Ok)
        .bind(now)
        .bind(now)
        .execute(&self.pool())
        .await?;

        Ok(())
    }

    pub async fn update_sync_status(
        &self,
        account_id: &str,
        status: SyncStatus,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        match last_synced_at {
            Some(ts) => {
                sqlx::query(
                    "UPDATE accounts
                     SET sync_status = $2, last_synced_at = $3, updated_at = $4
                     WHERE account_id = $1",
                )
                .bind(account_id)
                .bind(status)
                .bind(ts)
                .bind(now)
                .execute(&self.pool())
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE accounts SET sync_status = $2, updated_at = $3
                     WHERE account_id = $1",
                )
                .bind(account_id)
                .bind(status)
                .bind(now)
                .execute(&self.pool())
                .await?;
            }
        }

        Ok(())
    }

    pub async fn update_balance(
        &self,
        account_id: &str,
        current: Decimal,
        available: Option<Decimal>,
        overdraft: Option<Decimal>,
        balance_updated_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE accounts
             SET current_balance = $2, available_balance = $3, overdraft = $4,
                 balance_updated_at = $5, updated_at = $6
             WHERE account_id = $1",
        )
        .bind(account_id)
        .bind(current)
        .bind(available)
        .bind(overdraft)
        .bind(balance_updated_at)
        .bind(Utc::now())
        .execute(&self.pool())
        .await?;

        Ok(())
    }

    /// Claim up to `limit` accounts due for sync, advancing their
    /// `next_sync_at` in the same transaction so no concurrent tick can
    /// observe or claim the same rows.
    ///
    /// Returns `None` when the scheduler advisory lock is held by another
    /// instance, `Some(claimed)` otherwise. The advisory lock is
    /// transaction-scoped and released automatically on commit/rollback.
    pub async fn claim_due_accounts(
        &self,
        now: DateTime<Utc>,
        next_sync_at: DateTime<Utc>,
        limit: i64,
    ) -> Result<Option<Vec<ClaimedAccount>>, sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(SCHEDULER_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await?;

        if !locked {
            // Another instance is handling this tick
            tx.rollback().await?;
            return Ok(None);
        }

        let claimed = sqlx::query_as::<_, ClaimedAccount>(
            "SELECT account_id, connection_id FROM accounts
             WHERE sync_status = $1 AND next_sync_at <= $2
             ORDER BY next_sync_at, account_id
             LIMIT $3",
        )
        .bind(SyncStatus::Ok)
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if claimed.is_empty() {
            tx.commit().await?;
            return Ok(Some(claimed));
        }

        let account_ids: Vec<String> = claimed.iter().map(|a| a.account_id.clone()).collect();
        sqlx::query(
            "UPDATE accounts SET next_sync_at = $1, updated_at = $2
             WHERE account_id = ANY($3)",
        )
        .bind(next_sync_at)
        .bind(now)
        .bind(&account_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(claimed))
    }
}
