//! Versioned schema migrations
//!
//! Migrations are registered in a static list, applied in ascending id order and recorded in
//! the migration history table. A history record is authoritative: a recorded migration is
//! never applied again, even if its operations change.

mod m001_create_channel_users_table;
mod m002_create_search_results_table;
mod m003_enable_search_results_ttl;

use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use m001_create_channel_users_table::CreateChannelUsersTable;
pub use m002_create_search_results_table::CreateSearchResultsTable;
pub use m003_enable_search_results_ttl::EnableSearchResultsTtl;

use crate::schema::TableConfig;
use crate::store::{DocumentStore, Item, KeyCondition, QueryRequest, StoreError, TableDefinition};

/// Name of the id attribute of the history table
const HISTORY_ID_ATTRIBUTE: &str = "id";

/// Errors raised while running migrations
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Two registered migrations share an id; nothing was applied
    #[error("Migration id {id} is used by both {first} and {second}")]
    DuplicateId {
        /// The shared id
        id: u32,
        /// Name of the first migration with this id
        first: &'static str,
        /// Name of the second migration with this id
        second: &'static str,
    },

    /// An operation of a migration failed; the migration was not recorded
    #[error("Migration {id} ({name}) failed: {source}")]
    OperationFailed {
        /// Migration id
        id: u32,
        /// Migration name
        name: &'static str,
        /// Store failure
        #[source]
        source: StoreError,
    },

    /// Reading or writing the history table failed
    #[error(transparent)]
    History(#[from] StoreError),

    /// A history record could not be converted
    #[error("History record error: {0}")]
    SerializationError(String),
}

impl From<serde_dynamo::Error> for MigrationError {
    fn from(err: serde_dynamo::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// One store change applied by a migration. Every operation is safe to re-run.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaOperation {
    /// Create a table unless it exists, waiting until it is usable
    CreateTable(TableDefinition),
    /// Enable TTL on an attribute unless already enabled
    EnableTtl {
        /// Table name
        table: String,
        /// Epoch-seconds attribute
        attribute: String,
    },
    /// Insert an item unless one exists under its key
    Seed {
        /// Table name
        table: String,
        /// Partition key attribute name
        partition_key: String,
        /// Item to insert
        item: Item,
    },
}

/// A versioned unit of schema changes
pub trait Migration: Send + Sync {
    /// Globally unique id, also the apply order
    fn id(&self) -> u32;

    /// Human readable name
    fn name(&self) -> &'static str;

    /// Where the migration is defined, recorded in the history
    fn source(&self) -> &'static str;

    /// Operations to apply, in order
    fn operations(&self, tables: &TableConfig) -> Vec<SchemaOperation>;
}

/// All migrations of this crate, in id order
#[must_use]
pub fn registered_migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(CreateChannelUsersTable),
        Box::new(CreateSearchResultsTable),
        Box::new(EnableSearchResultsTtl),
    ]
}

/// History record of an applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration id
    pub id: u32,
    /// Migration name
    pub name: String,
    /// Where the migration was defined
    pub source: String,
    /// When it was applied
    pub created: DateTime<Utc>,
}

/// Which migrations a run applied and skipped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Ids applied by this run
    pub applied: Vec<u32>,
    /// Ids that already had a history record
    pub skipped: Vec<u32>,
}

/// Applies migrations and maintains their history
pub struct Migrator {
    store: Arc<dyn DocumentStore>,
    tables: TableConfig,
}

impl Migrator {
    /// Creates a migrator for the given tables
    #[must_use]
    pub const fn new(store: Arc<dyn DocumentStore>, tables: TableConfig) -> Self {
        Self { store, tables }
    }

    /// Applies every migration without a history record, in ascending id order.
    ///
    /// Duplicate ids are rejected before anything is touched. The first failing operation stops
    /// the run without recording its migration, so the next run starts it over.
    ///
    /// # Errors
    ///
    /// * `MigrationError::DuplicateId` - Two migrations share an id
    /// * `MigrationError::OperationFailed` - A migration operation failed
    /// * `MigrationError::History` - The history table could not be read or written
    #[instrument(skip(self, migrations), fields(count = migrations.len()))]
    pub async fn run(&self, migrations: &[Box<dyn Migration>]) -> MigrationResult<MigrationReport> {
        check_unique_ids(migrations)?;

        let created = self
            .store
            .create_table_if_absent(&self.tables.migration_history_table())
            .await?;
        if created {
            info!(table = %self.tables.migration_history, "Created migration history table");
        }

        let mut ordered: Vec<&dyn Migration> = migrations.iter().map(|m| &**m).collect();
        ordered.sort_by_key(|m| m.id());

        let mut report = MigrationReport::default();
        for migration in ordered {
            if self.is_applied(migration.id()).await? {
                debug!(id = migration.id(), name = migration.name(), "Migration already applied");
                report.skipped.push(migration.id());
                continue;
            }

            self.apply_operations(migration).await?;
            self.record(migration).await?;

            info!(id = migration.id(), name = migration.name(), "Migration applied");
            report.applied.push(migration.id());
        }

        Ok(report)
    }

    /// Applies the operations of one migration without consulting or writing the history
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::OperationFailed` on the first failing operation
    pub async fn apply_operations(&self, migration: &dyn Migration) -> MigrationResult<()> {
        let failed = |source: StoreError| MigrationError::OperationFailed {
            id: migration.id(),
            name: migration.name(),
            source,
        };

        for operation in migration.operations(&self.tables) {
            match operation {
                SchemaOperation::CreateTable(definition) => {
                    let created = self
                        .store
                        .create_table_if_absent(&definition)
                        .await
                        .map_err(failed)?;
                    debug!(table = %definition.name, created, "Create table");
                }
                SchemaOperation::EnableTtl { table, attribute } => {
                    let changed = self
                        .store
                        .enable_ttl(&table, &attribute)
                        .await
                        .map_err(failed)?;
                    debug!(%table, %attribute, changed, "Enable TTL");
                }
                SchemaOperation::Seed {
                    table,
                    partition_key,
                    item,
                } => {
                    let inserted = self
                        .store
                        .put_if_absent(&table, &partition_key, item)
                        .await
                        .map_err(failed)?;
                    debug!(%table, inserted, "Seed item");
                }
            }
        }

        Ok(())
    }

    /// History records, in id order
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the history table cannot be read
    pub async fn history(&self) -> MigrationResult<Vec<MigrationRecord>> {
        let mut records = self
            .store
            .scan(&self.tables.migration_history, Vec::new())
            .await?
            .into_iter()
            .map(serde_dynamo::from_item)
            .collect::<Result<Vec<MigrationRecord>, _>>()?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn is_applied(&self, id: u32) -> MigrationResult<bool> {
        let records = self
            .store
            .query(QueryRequest {
                table: self.tables.migration_history.clone(),
                index: None,
                key_condition: KeyCondition {
                    partition_attribute: HISTORY_ID_ATTRIBUTE.to_string(),
                    partition_value: AttributeValue::N(id.to_string()),
                    sort_prefix: None,
                },
                projection: Some(vec![HISTORY_ID_ATTRIBUTE.to_string()]),
            })
            .await?;

        Ok(!records.is_empty())
    }

    async fn record(&self, migration: &dyn Migration) -> MigrationResult<()> {
        let record = MigrationRecord {
            id: migration.id(),
            name: migration.name().to_string(),
            source: migration.source().to_string(),
            created: Utc::now(),
        };

        self.store
            .put_if_absent(
                &self.tables.migration_history,
                HISTORY_ID_ATTRIBUTE,
                serde_dynamo::to_item(record)?,
            )
            .await?;
        Ok(())
    }
}

fn check_unique_ids(migrations: &[Box<dyn Migration>]) -> MigrationResult<()> {
    let mut seen: HashMap<u32, &'static str> = HashMap::with_capacity(migrations.len());
    for migration in migrations {
        if let Some(first) = seen.insert(migration.id(), migration.name()) {
            return Err(MigrationError::DuplicateId {
                id: migration.id(),
                first,
                second: migration.name(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::InMemoryStore;

    struct Named(u32, &'static str);

    impl Migration for Named {
        fn id(&self) -> u32 {
            self.0
        }

        fn name(&self) -> &'static str {
            self.1
        }

        fn source(&self) -> &'static str {
            module_path!()
        }

        fn operations(&self, _tables: &TableConfig) -> Vec<SchemaOperation> {
            Vec::new()
        }
    }

    #[test]
    fn test_registered_ids_are_unique_and_ordered() {
        let migrations = registered_migrations();
        check_unique_ids(&migrations).unwrap();

        let ids: Vec<u32> = migrations.iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_id_applies_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let migrator = Migrator::new(store.clone(), TableConfig::default());
        let migrations: Vec<Box<dyn Migration>> = vec![
            Box::new(CreateChannelUsersTable),
            Box::new(Named(1, "shadow")),
        ];

        let result = migrator.run(&migrations).await;

        assert!(matches!(
            result,
            Err(MigrationError::DuplicateId {
                id: 1,
                first: "create_channel_users_table",
                second: "shadow"
            })
        ));
        assert!(store.table_names().is_empty());
    }

    #[tokio::test]
    async fn test_applies_in_id_order() {
        let store = Arc::new(InMemoryStore::new());
        let migrator = Migrator::new(store.clone(), TableConfig::default());
        let migrations: Vec<Box<dyn Migration>> =
            vec![Box::new(Named(20, "later")), Box::new(Named(10, "earlier"))];

        let report = migrator.run(&migrations).await.unwrap();

        assert_eq!(report.applied, vec![10, 20]);
        let history = migrator.history().await.unwrap();
        let names: Vec<&str> = history.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["earlier", "later"]);
        assert_eq!(history[0].source, module_path!());
    }
}
