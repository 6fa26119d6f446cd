use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Per-account scheduling state. Only `Ok` accounts are claimed for
/// periodic sync; `NeedsReauth`/`Error` are excluded until user action
/// (reconnecting the bank) resets them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "sync_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Ok,
    NeedsReauth,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "account_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Transaction,
    Savings,
    BusinessTransaction,
    BusinessSavings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "currency", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eur,
    Gbp,
    Usd,
    Aud,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "transaction_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Debit,
    Credit,
}

/// One OAuth grant for a user against the provider.
///
/// `access_token`/`refresh_token` are stored encrypted in the
/// `iv:ciphertext` string format produced by the token cipher;
/// `token_key_id` names the key they were sealed with. A `refresh_token`
/// of `None` means the connection cannot be silently renewed once expired.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_key_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Whether the stored access token is still valid at `now`.
    pub fn is_token_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at >= now
    }
}

/// One bank account linked to exactly one connection.
///
/// `next_sync_at` is only ever advanced by the scheduler when it claims the
/// account for a tick, never by the sync job itself.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    /// Stable external account id assigned by the provider
    pub account_id: String,
    pub connection_id: Uuid,
    pub user_id: String,
    pub account_type: Option<AccountType>,
    pub display_name: String,
    pub currency: Currency,
    pub current_balance: Option<Decimal>,
    pub available_balance: Option<Decimal>,
    pub overdraft: Option<Decimal>,
    pub balance_updated_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub next_sync_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Running balance attached to a transaction by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunningBalance {
    pub amount: Decimal,
    pub currency: Currency,
}

/// One posted bank transaction.
///
/// `(transaction_id, account_id)` is unique; re-fetching an already-stored
/// transaction is a no-op on insert, never a duplicate row and never an
/// error.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    /// External transaction id assigned by the provider
    pub transaction_id: String,
    pub account_id: String,
    pub normalised_provider_transaction_id: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub transaction_category: String,
    pub transaction_classification: Json<Vec<String>>,
    pub merchant_name: Option<String>,
    pub running_balance: Option<Json<RunningBalance>>,
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert shape for a transaction row, produced by mapping a provider
/// transaction onto a local account.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: Uuid,
    pub transaction_id: String,
    pub account_id: String,
    pub normalised_provider_transaction_id: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub transaction_category: String,
    pub transaction_classification: Vec<String>,
    pub merchant_name: Option<String>,
    pub running_balance: Option<RunningBalance>,
    pub meta: Option<serde_json::Value>,
}

/// Insert/upsert shape for an account discovered through the provider.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: Uuid,
    pub account_id: String,
    pub connection_id: Uuid,
    pub user_id: String,
    pub account_type: Option<AccountType>,
    pub display_name: String,
    pub currency: Currency,
}

/// The identifying pair the scheduler claims per tick and the sync job
/// payloads carry.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct ClaimedAccount {
    pub account_id: String,
    pub connection_id: Uuid,
}
