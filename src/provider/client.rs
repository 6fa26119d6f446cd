use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use reqwest::Response;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::errors::types::ProviderError;

use super::types::{
    ErrorWire, ProviderAccount, ProviderBalance, ProviderTransaction, ResultsEnvelope,
    TokenExchange, TokenWire,
};
use super::BankProviderClient;

/// reqwest-backed provider client.
///
/// Token endpoints live under `auth_url`, data endpoints under `api_url`.
/// Non-success responses are mapped to a structured [`ProviderError::Api`]
/// when the body carries the provider's error shape, otherwise to
/// [`ProviderError::UnexpectedStatus`].
pub struct HttpProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl HttpProviderClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenExchange, ProviderError> {
        let response = self
            .http
            .post(format!("{}/connect/token", self.config.auth_url))
            .form(params)
            .send()
            .await?;

        let wire: TokenWire = Self::parse_response(response).await?;

        Ok(TokenExchange {
            access_token: wire.access_token,
            refresh_token: wire.refresh_token,
            expires_at: Utc::now() + Duration::seconds(wire.expires_in),
        })
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            if let Ok(error) = response.json::<ErrorWire>().await {
                return Err(ProviderError::Api {
                    code: error.error,
                    description: error.error_description,
                });
            }
            return Err(ProviderError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl BankProviderClient for HttpProviderClient {
    async fn exchange_code(&self, code: &str) -> Result<TokenExchange, ProviderError> {
        self.request_token(&[
            ("grant_type", "authorization_code"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("redirect_uri", &self.config.redirect_uri),
            ("code", code),
        ])
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenExchange, ProviderError> {
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn get_accounts(
        &self,
        access_token: &str,
    ) -> Result<Vec<ProviderAccount>, ProviderError> {
        let response = self
            .http
            .get(format!("{}/data/v1/accounts", self.config.api_url))
            .bearer_auth(access_token)
            .send()
            .await?;

        let envelope: ResultsEnvelope<ProviderAccount> = Self::parse_response(response).await?;
        Ok(envelope.results)
    }

    async fn get_transactions(
        &self,
        access_token: &str,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        debug!(
            "Fetching transactions for account {} from {} to {}",
            account_id, from, to
        );

        let response = self
            .http
            .get(format!(
                "{}/data/v1/accounts/{}/transactions",
                self.config.api_url, account_id
            ))
            .bearer_auth(access_token)
            .query(&[
                ("from", from.format("%Y-%m-%d").to_string()),
                ("to", to.format("%Y-%m-%d").to_string()),
            ])
            .send()
            .await?;

        let envelope: ResultsEnvelope<ProviderTransaction> = Self::parse_response(response).await?;
        Ok(envelope.results)
    }

    async fn get_balance(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<ProviderBalance, ProviderError> {
        let response = self
            .http
            .get(format!(
                "{}/data/v1/accounts/{}/balance",
                self.config.api_url, account_id
            ))
            .bearer_auth(access_token)
            .send()
            .await?;

        let envelope: ResultsEnvelope<ProviderBalance> = Self::parse_response(response).await?;
        envelope
            .results
            .into_iter()
            .next()
            .ok_or(ProviderError::MissingBalance)
    }
}
