//! Subscription storage for the channel search bot
//!
//! Users, channels and their subscriptions share one table under a `PK`/`SK` key scheme,
//! search results live in a second table with a TTL, and schema changes are applied by a
//! versioned migrator that records its history in a third table.

#![warn(clippy::all, clippy::pedantic, clippy::nursery, missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
mod error;
pub mod keys;
pub mod migrations;
pub mod models;
pub mod schema;
pub mod search_results;
pub mod store;
pub mod subscriptions;

pub use cache::EntityCache;
pub use error::{StorageError, StorageResult};
pub use schema::TableConfig;
pub use search_results::{MergeOutcome, SearchResultRepository, SearchUpdate};
pub use subscriptions::SubscriptionRepository;
