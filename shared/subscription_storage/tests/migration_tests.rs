use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_dynamodb::types::AttributeValue;
use pretty_assertions::assert_eq;
use subscription_storage::migrations::{
    registered_migrations, Migration, MigrationError, Migrator, SchemaOperation,
};
use subscription_storage::store::InMemoryStore;
use subscription_storage::TableConfig;

struct SeedDefaults;

impl Migration for SeedDefaults {
    fn id(&self) -> u32 {
        4
    }

    fn name(&self) -> &'static str {
        "seed_defaults"
    }

    fn source(&self) -> &'static str {
        module_path!()
    }

    fn operations(&self, tables: &TableConfig) -> Vec<SchemaOperation> {
        vec![SchemaOperation::Seed {
            table: tables.channel_users.clone(),
            partition_key: "PK".to_string(),
            item: HashMap::from([
                ("PK".to_string(), AttributeValue::S("channel#0".to_string())),
                ("SK".to_string(), AttributeValue::S("channel#0".to_string())),
                ("Name".to_string(), AttributeValue::S("announcements".to_string())),
            ]),
        }]
    }
}

struct Duplicate;

impl Migration for Duplicate {
    fn id(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "duplicate"
    }

    fn source(&self) -> &'static str {
        module_path!()
    }

    fn operations(&self, tables: &TableConfig) -> Vec<SchemaOperation> {
        vec![SchemaOperation::CreateTable(tables.search_results_table())]
    }
}

#[tokio::test]
async fn test_fresh_store_gets_every_migration() {
    let store = Arc::new(InMemoryStore::new());
    let tables = TableConfig::default();
    let migrator = Migrator::new(store.clone(), tables.clone());

    let report = migrator.run(&registered_migrations()).await.unwrap();

    assert_eq!(report.applied, vec![1, 2, 3]);
    assert!(report.skipped.is_empty());
    assert_eq!(
        store.table_names(),
        vec![
            "ChannelUsers".to_string(),
            "SearchResults".to_string(),
            "__MigrationHistory".to_string()
        ]
    );
    assert_eq!(
        store.ttl_attribute(&tables.search_results),
        Some("ExpiredAt".to_string())
    );

    let history = migrator.history().await.unwrap();
    let recorded: Vec<(u32, &str)> = history.iter().map(|r| (r.id, r.name.as_str())).collect();
    assert_eq!(
        recorded,
        vec![
            (1, "create_channel_users_table"),
            (2, "create_search_results_table"),
            (3, "enable_search_results_ttl")
        ]
    );
    assert!(history[0].source.ends_with("m001_create_channel_users_table"));
}

#[tokio::test]
async fn test_second_run_applies_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let tables = TableConfig::default();
    let migrator = Migrator::new(store.clone(), tables.clone());
    migrator.run(&registered_migrations()).await.unwrap();

    let report = migrator.run(&registered_migrations()).await.unwrap();

    assert!(report.applied.is_empty());
    assert_eq!(report.skipped, vec![1, 2, 3]);
    assert_eq!(store.item_count(&tables.migration_history), 3);
}

#[tokio::test]
async fn test_replaying_a_migration_body_is_safe() {
    let store = Arc::new(InMemoryStore::new());
    let migrator = Migrator::new(store.clone(), TableConfig::default());
    migrator.run(&registered_migrations()).await.unwrap();

    // A crash after the operations but before the history write replays the body
    for migration in registered_migrations() {
        migrator.apply_operations(migration.as_ref()).await.unwrap();
    }
    migrator.apply_operations(&SeedDefaults).await.unwrap();
    migrator.apply_operations(&SeedDefaults).await.unwrap();

    assert_eq!(store.item_count("ChannelUsers"), 1);
}

#[tokio::test]
async fn test_new_migration_applies_on_top_of_history() {
    let store = Arc::new(InMemoryStore::new());
    let migrator = Migrator::new(store.clone(), TableConfig::default());
    migrator.run(&registered_migrations()).await.unwrap();

    let mut migrations = registered_migrations();
    migrations.push(Box::new(SeedDefaults));
    let report = migrator.run(&migrations).await.unwrap();

    assert_eq!(report.applied, vec![4]);
    assert_eq!(report.skipped, vec![1, 2, 3]);
    assert_eq!(store.item_count("ChannelUsers"), 1);
}

#[tokio::test]
async fn test_failing_operation_is_not_recorded() {
    let store = Arc::new(InMemoryStore::new());
    let migrator = Migrator::new(store.clone(), TableConfig::default());

    // Seeding before the table exists fails
    let migrations: Vec<Box<dyn Migration>> = vec![Box::new(SeedDefaults)];
    let result = migrator.run(&migrations).await;

    assert!(matches!(
        result,
        Err(MigrationError::OperationFailed {
            id: 4,
            name: "seed_defaults",
            ..
        })
    ));
    assert!(migrator.history().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_id_is_fatal_before_any_change() {
    let store = Arc::new(InMemoryStore::new());
    let migrator = Migrator::new(store.clone(), TableConfig::default());
    let mut migrations = registered_migrations();
    migrations.push(Box::new(Duplicate));

    let result = migrator.run(&migrations).await;

    assert!(matches!(result, Err(MigrationError::DuplicateId { id: 2, .. })));
    assert!(store.table_names().is_empty());
}
