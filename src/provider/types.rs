//! Provider wire types
//!
//! Field names follow the provider's snake_case wire format so the response
//! bodies deserialize directly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::{AccountType, Currency, RunningBalance, TransactionType};

/// A freshly issued token pair with its computed absolute expiry.
#[derive(Debug, Clone)]
pub struct TokenExchange {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenWire {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorWire {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Envelope wrapping every data endpoint response.
#[derive(Debug, Deserialize)]
pub(crate) struct ResultsEnvelope<T> {
    pub results: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderAccount {
    pub account_id: String,
    #[serde(default)]
    pub account_type: Option<AccountType>,
    pub display_name: String,
    pub currency: Currency,
    pub update_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTransaction {
    /// Provider's identifier of the transaction; unique per account
    pub transaction_id: String,
    #[serde(default)]
    pub normalised_provider_transaction_id: Option<String>,
    #[serde(default)]
    pub provider_transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub transaction_type: TransactionType,
    pub transaction_category: String,
    pub transaction_classification: Vec<String>,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub running_balance: Option<RunningBalance>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderBalance {
    pub currency: Currency,
    #[serde(default)]
    pub available: Option<Decimal>,
    pub current: Decimal,
    #[serde(default)]
    pub overdraft: Option<Decimal>,
    #[serde(default)]
    pub update_timestamp: Option<DateTime<Utc>>,
}
