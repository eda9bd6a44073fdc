//! Error types for repository operations

use thiserror::Error;

use crate::keys::KeyError;
use crate::store::StoreError;

/// Result type for repository operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the subscription and search result repositories
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store rejected the request or could not be reached
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored key does not follow the prefix convention
    #[error(transparent)]
    MalformedKey(#[from] KeyError),

    /// Failed to convert between an item and its entity
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The subscription a write depends on does not exist
    #[error("Subscription of user {user_id} to channel {channel_id} not found")]
    SubscriptionNotFound {
        /// Channel id
        channel_id: i64,
        /// User id
        user_id: i64,
    },

    /// A concurrent writer kept changing the item between read and write
    #[error("Concurrent update of user {user_id} in channel {channel_id}")]
    VersionConflict {
        /// Channel id
        channel_id: i64,
        /// User id
        user_id: i64,
    },
}

impl From<serde_dynamo::Error> for StorageError {
    fn from(err: serde_dynamo::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
