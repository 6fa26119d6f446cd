pub mod types;

pub use types::{AppError, CryptoError, ProviderError, QueueError, SyncError};
