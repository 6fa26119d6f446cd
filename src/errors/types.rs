//! Error type definitions for the banksync service
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward. The most important contract lives on
//! [`SyncError::is_unrecoverable`]: permanent errors must never be retried
//! by the queue, while transient errors are retried with backoff.

use thiserror::Error;
use uuid::Uuid;

/// Top-level application error type
///
/// This enum represents all possible errors that can occur in the
/// application. It uses `thiserror` to provide automatic error trait
/// implementations and proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Sync orchestration errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Queue layer errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Provider client errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Token encryption errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Create a configuration error with a custom message
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error is permanent and must not be retried by the queue.
    ///
    /// Mirrors the queue driver contract: an unrecoverable failure
    /// short-circuits the retry loop and moves the job straight to the
    /// dead-letter state.
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            Self::Sync(e) => e.is_unrecoverable(),
            Self::Crypto(_) => true,
            _ => false,
        }
    }
}

/// Account sync and token lifecycle errors
///
/// Split into permanent failures (require user action, surface as
/// `NEEDS_REAUTH` on the account) and transient failures (retried with
/// backoff, surface as `ERROR` until a retry succeeds).
#[derive(Error, Debug)]
pub enum SyncError {
    /// Permanent: the connection row does not exist
    #[error("Connection {connection_id} not found")]
    ConnectionNotFound { connection_id: Uuid },

    /// Permanent: access token expired and no refresh token is stored
    #[error("Connection {connection_id} expired and no refresh token available")]
    TokenExpired { connection_id: Uuid },

    /// Transient: the provider refresh call failed
    #[error("Failed to refresh token for connection {connection_id}")]
    TokenRefresh {
        connection_id: Uuid,
        #[source]
        source: ProviderError,
    },

    /// Transient: provider API failure during account/transaction/balance fetch
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Transient: database failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Permanent: stored token cannot be decrypted with the recorded key
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl SyncError {
    /// Permanent errors require user action (reconnecting the bank) and must
    /// never be retried by the queue.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionNotFound { .. } | Self::TokenExpired { .. } | Self::Crypto(_)
        )
    }
}

/// Queue driver and dispatcher errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Enqueue attempted against a queue that was never registered
    #[error("Queue \"{queue}\" not registered")]
    QueueNotRegistered { queue: String },

    /// Second `work` registration for the same queue
    #[error("Worker for queue \"{queue}\" already exists")]
    WorkerAlreadyRegistered { queue: String },

    /// Driver does not support cron triggers
    #[error("Cron triggers are not supported by this driver")]
    CronUnsupported,

    /// Cron pattern failed to parse
    #[error("Invalid cron pattern \"{pattern}\"")]
    InvalidCronPattern {
        pattern: String,
        #[source]
        source: cron::error::Error,
    },

    /// Two handlers registered for the same job name within one queue
    #[error("Duplicate handler for job \"{job}\" on queue \"{queue}\"")]
    DuplicateHandler { queue: String, job: String },

    /// Inline driver only: the handler invoked by `add` failed
    #[error("Job handler failed: {0}")]
    Handler(#[source] Box<AppError>),

    /// Database failure in the durable driver
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job payload could not be serialized/deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Open Banking provider client errors
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Structured error response from the provider
    #[error("Provider returned \"{code}\": {}", .description.as_deref().unwrap_or("no description"))]
    Api {
        code: String,
        description: Option<String>,
    },

    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status with an unparseable body
    #[error("Provider request failed with status {status}")]
    UnexpectedStatus { status: u16 },

    /// Balance endpoint returned no results
    #[error("No balance data returned by provider")]
    MissingBalance,
}

/// Token cipher errors
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key material is not 32 bytes of hex
    #[error("Encryption key \"{key_id}\" must be exactly 64 hex characters (32 bytes)")]
    InvalidKey { key_id: String },

    /// Key id not present in the configured key registry
    #[error("Unknown encryption key id \"{key_id}\"")]
    UnknownKeyId { key_id: String },

    /// Stored ciphertext is not in the expected "iv:ciphertext" format
    #[error("Invalid encrypted string format, expected \"iv:ciphertext\"")]
    MalformedCiphertext,

    /// Authenticated decryption failed
    #[error("Decryption failed")]
    DecryptFailed,

    /// Encryption failed
    #[error("Encryption failed")]
    EncryptFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_not_found_is_unrecoverable() {
        let err = SyncError::ConnectionNotFound {
            connection_id: Uuid::nil(),
        };
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn token_expired_is_unrecoverable() {
        let err = SyncError::TokenExpired {
            connection_id: Uuid::nil(),
        };
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn token_refresh_failure_is_transient() {
        let err = SyncError::TokenRefresh {
            connection_id: Uuid::nil(),
            source: ProviderError::UnexpectedStatus { status: 502 },
        };
        assert!(!err.is_unrecoverable());
    }

    #[test]
    fn provider_failure_is_transient() {
        let err = SyncError::Provider(ProviderError::MissingBalance);
        assert!(!err.is_unrecoverable());
    }

    #[test]
    fn app_error_delegates_to_sync_error() {
        let permanent = AppError::Sync(SyncError::TokenExpired {
            connection_id: Uuid::nil(),
        });
        let transient = AppError::Sync(SyncError::Provider(ProviderError::UnexpectedStatus {
            status: 500,
        }));
        assert!(permanent.is_unrecoverable());
        assert!(!transient.is_unrecoverable());
    }
}
