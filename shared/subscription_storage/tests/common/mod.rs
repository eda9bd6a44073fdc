//! Shared setup for repository tests

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use subscription_storage::migrations::{registered_migrations, Migrator};
use subscription_storage::models::{Channel, FoundMessage, PhraseMatches, User};
use subscription_storage::store::{
    Condition, DocumentStore, Filter, InMemoryStore, Item, QueryRequest, StoreResult,
    TableDefinition, UpdateAction, WriteOperation, WriteOutcome,
};
use subscription_storage::{EntityCache, SearchResultRepository, SubscriptionRepository, TableConfig};

/// Repositories over one migrated in-memory store
pub struct TestContext {
    pub store: Arc<InMemoryStore>,
    pub tables: TableConfig,
    pub subscriptions: SubscriptionRepository,
    pub search_results: SearchResultRepository,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_cache(EntityCache::new()).await
    }

    pub async fn with_cache(cache: EntityCache) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let tables = TableConfig::default();
        migrate(store.clone(), &tables).await;

        Self {
            subscriptions: SubscriptionRepository::new(store.clone(), Arc::new(cache), &tables),
            search_results: SearchResultRepository::new(store.clone(), &tables),
            store,
            tables,
        }
    }
}

/// Runs the registered migrations against `store`
pub async fn migrate(store: Arc<dyn DocumentStore>, tables: &TableConfig) {
    Migrator::new(store, tables.clone())
        .run(&registered_migrations())
        .await
        .expect("Failed to migrate");
}

pub fn user(id: i64) -> User {
    User {
        id,
        name: format!("user-{id}"),
        created: Utc::now(),
    }
}

pub fn channel(id: i64) -> Channel {
    Channel {
        id,
        name: format!("channel-{id}"),
        created: Utc::now(),
    }
}

pub fn message(id: i64) -> FoundMessage {
    FoundMessage {
        id,
        link: format!("https://t.me/c/100/{id}"),
        date: DateTime::<Utc>::from_timestamp(1_700_000_000 + id, 0).expect("valid timestamp"),
    }
}

pub fn matches(phrase: &str, ids: &[i64]) -> PhraseMatches {
    PhraseMatches {
        phrase: phrase.to_string(),
        messages: ids.iter().copied().map(message).collect(),
    }
}

/// Store that lets a simulated concurrent writer go first.
///
/// Queued writes are applied to the inner store right before the next conditional write
/// (`update_item` or `transact_write`) reaches it, which is exactly the window between a
/// repository's read and its write.
#[derive(Default)]
pub struct InterferingStore {
    pub inner: InMemoryStore,
    pending: Mutex<Vec<Vec<WriteOperation>>>,
}

impl InterferingStore {
    /// Queues a concurrent write; each queued write fires once, in order
    pub fn interfere(&self, operations: Vec<WriteOperation>) {
        self.pending.lock().unwrap().push(operations);
    }

    async fn race(&self) {
        let next = {
            let mut pending = self.pending.lock().unwrap();
            (!pending.is_empty()).then(|| pending.remove(0))
        };
        if let Some(operations) = next {
            let outcome = self.inner.transact_write(operations).await.unwrap();
            assert_eq!(outcome, WriteOutcome::Applied, "Interfering write must apply");
        }
    }
}

#[async_trait]
impl DocumentStore for InterferingStore {
    async fn get_item(
        &self,
        table: &str,
        key: Item,
        projection: Option<Vec<String>>,
    ) -> StoreResult<Option<Item>> {
        self.inner.get_item(table, key, projection).await
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome> {
        self.inner.put_item(table, item, conditions).await
    }

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        actions: Vec<UpdateAction>,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome> {
        self.race().await;
        self.inner.update_item(table, key, actions, conditions).await
    }

    async fn delete_item(&self, table: &str, key: Item) -> StoreResult<()> {
        self.inner.delete_item(table, key).await
    }

    async fn query(&self, request: QueryRequest) -> StoreResult<Vec<Item>> {
        self.inner.query(request).await
    }

    async fn batch_get_items(&self, table: &str, keys: Vec<Item>) -> StoreResult<Vec<Item>> {
        self.inner.batch_get_items(table, keys).await
    }

    async fn scan(&self, table: &str, filters: Vec<Filter>) -> StoreResult<Vec<Item>> {
        self.inner.scan(table, filters).await
    }

    async fn transact_write(&self, operations: Vec<WriteOperation>) -> StoreResult<WriteOutcome> {
        self.race().await;
        self.inner.transact_write(operations).await
    }

    async fn create_table_if_absent(&self, definition: &TableDefinition) -> StoreResult<bool> {
        self.inner.create_table_if_absent(definition).await
    }

    async fn enable_ttl(&self, table: &str, attribute: &str) -> StoreResult<bool> {
        self.inner.enable_ttl(table, attribute).await
    }
}

type Race = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Store that lets a simulated concurrent writer run right after a read returns.
///
/// The queued future runs once, after the next `get_item`, `query` or `batch_get_items` has
/// produced its result and before that result reaches the repository. That is the window
/// between a repository's store read and its cache fill.
pub struct RacingReadStore {
    pub inner: Arc<InMemoryStore>,
    after_read: Mutex<Option<Race>>,
}

impl RacingReadStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            after_read: Mutex::new(None),
        }
    }

    /// Queues `race` to run after the next read
    pub fn after_next_read(&self, race: impl Future<Output = ()> + Send + 'static) {
        *self.after_read.lock().unwrap() = Some(Box::pin(race));
    }

    async fn race(&self) {
        let next = self.after_read.lock().unwrap().take();
        if let Some(race) = next {
            race.await;
        }
    }
}

#[async_trait]
impl DocumentStore for RacingReadStore {
    async fn get_item(
        &self,
        table: &str,
        key: Item,
        projection: Option<Vec<String>>,
    ) -> StoreResult<Option<Item>> {
        let item = self.inner.get_item(table, key, projection).await;
        self.race().await;
        item
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome> {
        self.inner.put_item(table, item, conditions).await
    }

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        actions: Vec<UpdateAction>,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome> {
        self.inner.update_item(table, key, actions, conditions).await
    }

    async fn delete_item(&self, table: &str, key: Item) -> StoreResult<()> {
        self.inner.delete_item(table, key).await
    }

    async fn query(&self, request: QueryRequest) -> StoreResult<Vec<Item>> {
        let items = self.inner.query(request).await;
        self.race().await;
        items
    }

    async fn batch_get_items(&self, table: &str, keys: Vec<Item>) -> StoreResult<Vec<Item>> {
        let items = self.inner.batch_get_items(table, keys).await;
        self.race().await;
        items
    }

    async fn scan(&self, table: &str, filters: Vec<Filter>) -> StoreResult<Vec<Item>> {
        self.inner.scan(table, filters).await
    }

    async fn transact_write(&self, operations: Vec<WriteOperation>) -> StoreResult<WriteOutcome> {
        self.inner.transact_write(operations).await
    }

    async fn create_table_if_absent(&self, definition: &TableDefinition) -> StoreResult<bool> {
        self.inner.create_table_if_absent(definition).await
    }

    async fn enable_ttl(&self, table: &str, attribute: &str) -> StoreResult<bool> {
        self.inner.enable_ttl(table, attribute).await
    }
}
