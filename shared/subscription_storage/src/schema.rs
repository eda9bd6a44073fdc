//! Table names and definitions

use crate::keys::KeyAttribute;
use crate::store::{IndexDefinition, KeySchema, TableDefinition};

/// Default name of the users/channels/subscriptions table
pub const CHANNEL_USERS_TABLE: &str = "ChannelUsers";
/// Default name of the index that re-keys the channel users table on `SK`
pub const CHANNEL_USERS_USER_INDEX: &str = "UserChannelsIndex";
/// Default name of the search results table
pub const SEARCH_RESULTS_TABLE: &str = "SearchResults";
/// Default name of the migration history table
pub const MIGRATION_HISTORY_TABLE: &str = "__MigrationHistory";

/// Table and index names used by the repositories and migrations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// Users, channels and subscriptions
    pub channel_users: String,
    /// Secondary index of `channel_users` keyed by (`SK`, `PK`)
    pub channel_users_user_index: String,
    /// Search results
    pub search_results: String,
    /// Applied migrations
    pub migration_history: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            channel_users: CHANNEL_USERS_TABLE.to_string(),
            channel_users_user_index: CHANNEL_USERS_USER_INDEX.to_string(),
            search_results: SEARCH_RESULTS_TABLE.to_string(),
            migration_history: MIGRATION_HISTORY_TABLE.to_string(),
        }
    }
}

impl TableConfig {
    /// Same names with a prefix on every table, for isolated test tables
    #[must_use]
    pub fn prefixed(prefix: &str) -> Self {
        let defaults = Self::default();
        Self {
            channel_users: format!("{prefix}{}", defaults.channel_users),
            channel_users_user_index: defaults.channel_users_user_index,
            search_results: format!("{prefix}{}", defaults.search_results),
            migration_history: format!("{prefix}{}", defaults.migration_history),
        }
    }

    /// Channel users table, with the index that serves "channels of a user" queries
    #[must_use]
    pub fn channel_users_table(&self) -> TableDefinition {
        TableDefinition {
            name: self.channel_users.clone(),
            partition_key: KeySchema::string(KeyAttribute::Pk.to_string()),
            sort_key: Some(KeySchema::string(KeyAttribute::Sk.to_string())),
            global_secondary_index: Some(IndexDefinition {
                name: self.channel_users_user_index.clone(),
                partition_key: KeySchema::string(KeyAttribute::Sk.to_string()),
                sort_key: Some(KeySchema::string(KeyAttribute::Pk.to_string())),
            }),
        }
    }

    /// Search results table
    #[must_use]
    pub fn search_results_table(&self) -> TableDefinition {
        TableDefinition {
            name: self.search_results.clone(),
            partition_key: KeySchema::string(KeyAttribute::Pk.to_string()),
            sort_key: Some(KeySchema::string(KeyAttribute::Sk.to_string())),
            global_secondary_index: None,
        }
    }

    /// Migration history table, keyed by (`id`, `name`)
    #[must_use]
    pub fn migration_history_table(&self) -> TableDefinition {
        TableDefinition {
            name: self.migration_history.clone(),
            partition_key: KeySchema::number("id"),
            sort_key: Some(KeySchema::string("name")),
            global_secondary_index: None,
        }
    }
}
