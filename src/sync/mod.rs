//! Account synchronization jobs and services
//!
//! The scheduler claims due accounts and fans out `AccountSync` jobs; the
//! orchestrator resolves a valid access token, computes a sync window,
//! pulls balance and transactions from the provider and upserts them
//! idempotently, recording per-account sync status.

pub mod account_sync;
pub mod balance;
pub mod scheduler;
pub mod transactions;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use account_sync::{AccountSyncJob, InitialSyncJob};
pub use balance::BalanceSyncService;
pub use scheduler::PeriodicSyncJob;
pub use transactions::{SyncWindow, TransactionSyncService};

/// Payload for both `AccountSync` and `InitialSync` jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountSyncPayload {
    pub account_id: String,
    pub connection_id: Uuid,
}
