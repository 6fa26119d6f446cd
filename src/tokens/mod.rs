//! Token lifecycle manager
//!
//! Owns reading/decrypting stored tokens, detecting expiry, calling the
//! provider's refresh endpoint, and persisting newly issued encrypted
//! tokens. Also owns the OAuth code-exchange flow that creates a
//! connection, links its accounts and enqueues their initial sync.
//!
//! Refreshes are serialized per connection id: two parallel jobs for the
//! same account can both observe an expired token, but only one may hit
//! the refresh endpoint; the other re-reads the freshly persisted token.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::database::stores::{AccountStore, ConnectionStore};
use crate::errors::types::{AppError, SyncError};
use crate::models::{Connection, NewAccount};
use crate::provider::BankProviderClient;
use crate::queue::{JobName, JobOptions, MessageQueue};
use crate::sync::AccountSyncPayload;

pub struct ConnectionService {
    connections: Arc<dyn ConnectionStore>,
    accounts: Arc<dyn AccountStore>,
    provider: Arc<dyn BankProviderClient>,
    cipher: Arc<TokenCipher>,
    queue: MessageQueue,
    refresh_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConnectionService {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        accounts: Arc<dyn AccountStore>,
        provider: Arc<dyn BankProviderClient>,
        cipher: Arc<TokenCipher>,
        queue: MessageQueue,
    ) -> Self {
        Self {
            connections,
            accounts,
            provider,
            cipher,
            queue,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Retrieve a connection by id.
    pub async fn get_connection(&self, connection_id: Uuid) -> Result<Connection, SyncError> {
        self.connections
            .find_connection(connection_id)
            .await?
            .ok_or(SyncError::ConnectionNotFound { connection_id })
    }

    /// Return a valid plaintext access token for the given connection,
    /// refreshing through the provider if the stored one has expired.
    ///
    /// Fails permanently with `ConnectionNotFound`/`TokenExpired` (user must
    /// reconnect) and transiently with `TokenRefresh` when the provider
    /// refresh call itself fails.
    pub async fn get_access_token(&self, connection_id: Uuid) -> Result<String, SyncError> {
        let connection = self.get_connection(connection_id).await?;

        if connection.is_token_valid(Utc::now()) {
            return Ok(self
                .cipher
                .decrypt_from_string(&connection.access_token, &connection.token_key_id)?);
        }

        let lock = self.refresh_lock(connection_id).await;
        let _guard = lock.lock().await;

        // Re-read under the lock: a racing job may have refreshed while we
        // waited, in which case its token is the one to use.
        let connection = self.get_connection(connection_id).await?;
        if connection.is_token_valid(Utc::now()) {
            return Ok(self
                .cipher
                .decrypt_from_string(&connection.access_token, &connection.token_key_id)?);
        }

        let Some(encrypted_refresh) = connection.refresh_token.as_deref() else {
            return Err(SyncError::TokenExpired { connection_id });
        };
        let refresh_token = self
            .cipher
            .decrypt_from_string(encrypted_refresh, &connection.token_key_id)?;

        info!("Refreshing token for connection {}", connection_id);

        let tokens = self
            .provider
            .refresh_token(&refresh_token)
            .await
            .map_err(|source| SyncError::TokenRefresh {
                connection_id,
                source,
            })?;

        let access_encrypted = self
            .cipher
            .encrypt_to_string(&tokens.access_token, &connection.token_key_id)?;
        let refresh_encrypted = match tokens.refresh_token.as_deref() {
            Some(token) => Some(
                self.cipher
                    .encrypt_to_string(token, &connection.token_key_id)?,
            ),
            None => None,
        };

        self.connections
            .update_connection_tokens(
                connection_id,
                &access_encrypted,
                refresh_encrypted.as_deref(),
                tokens.expires_at,
            )
            .await?;

        Ok(tokens.access_token)
    }

    /// OAuth callback flow: exchange the authorization code, store the
    /// encrypted token pair as a new connection, link the provider's
    /// accounts and enqueue one `InitialSync` per account.
    pub async fn connect(&self, user_id: &str, code: &str) -> Result<Uuid, AppError> {
        let tokens = self.provider.exchange_code(code).await?;
        let key_id = self.cipher.active_key_id().to_string();
        let now = Utc::now();

        let access_encrypted = self.cipher.encrypt_to_string(&tokens.access_token, &key_id)?;
        let refresh_encrypted = match tokens.refresh_token.as_deref() {
            Some(token) => Some(self.cipher.encrypt_to_string(token, &key_id)?),
            None => None,
        };

        let connection = Connection {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            access_token: access_encrypted,
            refresh_token: refresh_encrypted,
            token_key_id: key_id,
            expires_at: tokens.expires_at,
            created_at: now,
            updated_at: now,
        };
        self.connections.insert_connection(&connection).await?;

        let accounts = self.provider.get_accounts(&tokens.access_token).await?;
        for account in &accounts {
            self.accounts
                .upsert_account(&NewAccount {
                    id: Uuid::new_v4(),
                    account_id: account.account_id.clone(),
                    connection_id: connection.id,
                    user_id: user_id.to_string(),
                    account_type: account.account_type,
                    display_name: account.display_name.clone(),
                    currency: account.currency,
                })
                .await?;

            self.queue
                .add(
                    JobName::InitialSync,
                    &AccountSyncPayload {
                        account_id: account.account_id.clone(),
                        connection_id: connection.id,
                    },
                    JobOptions::default(),
                )
                .await?;
        }

        info!(
            "Linked {} account(s) for connection {}",
            accounts.len(),
            connection.id
        );
        Ok(connection.id)
    }

    async fn refresh_lock(&self, connection_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        Arc::clone(locks.entry(connection_id).or_default())
    }
}
