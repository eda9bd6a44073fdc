//! Document store capability
//!
//! The repositories talk to the store through [`DocumentStore`]. Requests are described with
//! structured conditions, filters and update actions rather than raw expression strings, so the
//! `DynamoDB` adapter and the in-memory fake evaluate exactly the same semantics.

mod dynamodb;
mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;

pub use dynamodb::DynamoDbStore;
pub use error::{StoreError, StoreResult};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryStore;

/// A stored item (attribute name to value)
pub type Item = HashMap<String, AttributeValue>;

/// Precondition evaluated against the currently stored item. Multiple conditions are combined
/// with `AND`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The attribute must be present on the stored item
    AttributeExists(String),
    /// The attribute (or the whole item) must be absent
    AttributeNotExists(String),
    /// The attribute must hold exactly this value
    Equals(String, AttributeValue),
}

/// A single change applied by an update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    /// Overwrite the attribute with a value
    Set(String, AttributeValue),
    /// Drop the attribute from the item
    Remove(String),
}

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied
    Applied,
    /// A precondition did not hold and nothing was written
    ConditionFailed,
}

impl WriteOutcome {
    /// Whether the write went through
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Key condition of a query: partition equality and an optional sort key prefix
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCondition {
    /// Partition attribute name
    pub partition_attribute: String,
    /// Partition attribute value
    pub partition_value: AttributeValue,
    /// Optional `begins_with` on the sort attribute, as (attribute, prefix)
    pub sort_prefix: Option<(String, String)>,
}

/// Query against the table or one of its secondary indexes
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Table name
    pub table: String,
    /// Secondary index to query, if any
    pub index: Option<String>,
    /// Key condition
    pub key_condition: KeyCondition,
    /// Attributes to return; all when `None`
    pub projection: Option<Vec<String>>,
}

/// Filter clause of a scan. Multiple filters are combined with `AND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// String attribute starts with the prefix
    BeginsWith(String, String),
    /// Attribute is present
    AttributeExists(String),
}

/// One member of an all-or-nothing transaction
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    /// Put a whole item
    Put {
        /// Table name
        table: String,
        /// Item to write
        item: Item,
        /// Preconditions against the item currently stored under the same key
        conditions: Vec<Condition>,
    },
    /// Update an item in place
    Update {
        /// Table name
        table: String,
        /// Key attributes
        key: Item,
        /// Changes to apply
        actions: Vec<UpdateAction>,
        /// Preconditions against the stored item
        conditions: Vec<Condition>,
    },
}

/// Scalar type of a key attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// String
    String,
    /// Number
    Number,
}

/// Key attribute of a table or index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    /// Attribute name
    pub name: String,
    /// Attribute type
    pub kind: KeyKind,
}

impl KeySchema {
    /// String key attribute
    #[must_use]
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KeyKind::String,
        }
    }

    /// Number key attribute
    #[must_use]
    pub fn number(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KeyKind::Number,
        }
    }
}

/// Global secondary index definition (all attributes projected)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    /// Index name
    pub name: String,
    /// Partition key of the index
    pub partition_key: KeySchema,
    /// Sort key of the index
    pub sort_key: Option<KeySchema>,
}

/// Table definition used by schema migrations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    /// Table name
    pub name: String,
    /// Partition key
    pub partition_key: KeySchema,
    /// Sort key
    pub sort_key: Option<KeySchema>,
    /// Optional global secondary index
    pub global_secondary_index: Option<IndexDefinition>,
}

/// Capability interface over the managed document store.
///
/// Cancellation follows the usual async contract: dropping a returned future aborts the
/// in-flight request, and nothing is retried on the caller's behalf.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads one item by key
    async fn get_item(
        &self,
        table: &str,
        key: Item,
        projection: Option<Vec<String>>,
    ) -> StoreResult<Option<Item>>;

    /// Writes a whole item if all conditions hold
    async fn put_item(
        &self,
        table: &str,
        item: Item,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome>;

    /// Applies update actions to an item if all conditions hold
    async fn update_item(
        &self,
        table: &str,
        key: Item,
        actions: Vec<UpdateAction>,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome>;

    /// Deletes an item; deleting an absent item is not an error
    async fn delete_item(&self, table: &str, key: Item) -> StoreResult<()>;

    /// Runs a key query, following pagination to the end
    async fn query(&self, request: QueryRequest) -> StoreResult<Vec<Item>>;

    /// Reads many items by key. Store batch limits are handled internally; keys the store
    /// reports as unprocessed are requested again until none remain.
    async fn batch_get_items(&self, table: &str, keys: Vec<Item>) -> StoreResult<Vec<Item>>;

    /// Scans the whole table, following pagination to the end
    async fn scan(&self, table: &str, filters: Vec<Filter>) -> StoreResult<Vec<Item>>;

    /// Applies all operations atomically, or none of them
    async fn transact_write(&self, operations: Vec<WriteOperation>) -> StoreResult<WriteOutcome>;

    /// Creates the table unless it already exists. Returns `true` if it was created.
    async fn create_table_if_absent(&self, definition: &TableDefinition) -> StoreResult<bool>;

    /// Enables TTL on `attribute` unless already enabled. Returns `true` if it was changed.
    async fn enable_ttl(&self, table: &str, attribute: &str) -> StoreResult<bool>;

    /// Inserts the item only if no item exists under its key.
    ///
    /// Losing to an existing item is the expected outcome under concurrent inserts and is
    /// reported as `Ok(false)`, never as an error.
    async fn put_if_absent(
        &self,
        table: &str,
        partition_key: &str,
        item: Item,
    ) -> StoreResult<bool> {
        let outcome = self
            .put_item(
                table,
                item,
                vec![Condition::AttributeNotExists(partition_key.to_string())],
            )
            .await?;

        Ok(outcome.is_applied())
    }
}
