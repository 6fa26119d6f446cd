//! Open Banking provider client
//!
//! The provider is an opaque remote collaborator: request/response calls
//! for OAuth token exchange/refresh and account/transaction/balance data.
//! The trait seam lets tests install an in-process fake.

pub mod client;
pub mod types;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::errors::types::ProviderError;
pub use client::HttpProviderClient;
pub use types::{ProviderAccount, ProviderBalance, ProviderTransaction, TokenExchange};

#[async_trait]
pub trait BankProviderClient: Send + Sync {
    /// Exchange an OAuth authorization code for an initial token pair.
    async fn exchange_code(&self, code: &str) -> Result<TokenExchange, ProviderError>;

    /// Trade a refresh token for a fresh access/refresh token pair.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenExchange, ProviderError>;

    /// List the accounts visible to the given access token.
    async fn get_accounts(&self, access_token: &str)
        -> Result<Vec<ProviderAccount>, ProviderError>;

    /// Fetch posted transactions for one account within `[from, to]`.
    async fn get_transactions(
        &self,
        access_token: &str,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProviderTransaction>, ProviderError>;

    /// Fetch the current balance for one account.
    async fn get_balance(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<ProviderBalance, ProviderError>;
}
