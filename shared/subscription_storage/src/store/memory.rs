//! In-memory document store used by tests
//!
//! Evaluates the same structured conditions, filters and updates as the `DynamoDB` adapter and
//! counts writes per table, so tests can assert that a code path did or did not rewrite an item.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;

use super::{
    Condition, DocumentStore, Filter, Item, KeyCondition, QueryRequest, StoreError, StoreResult,
    TableDefinition, UpdateAction, WriteOperation, WriteOutcome,
};

/// Write counters of one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    /// Applied puts, including transaction members
    pub puts: usize,
    /// Applied updates, including transaction members
    pub updates: usize,
    /// Deletes
    pub deletes: usize,
}

impl WriteCounts {
    /// Total number of applied writes
    #[must_use]
    pub const fn total(&self) -> usize {
        self.puts + self.updates + self.deletes
    }
}

#[derive(Debug)]
struct MemoryTable {
    definition: TableDefinition,
    ttl_attribute: Option<String>,
    items: BTreeMap<(String, String), Item>,
    writes: WriteCounts,
}

impl MemoryTable {
    fn item_id(&self, item: &Item) -> StoreResult<(String, String)> {
        let read = |name: &str| {
            item.get(name).map(scalar_repr).ok_or_else(|| {
                StoreError::InvalidRequest(format!(
                    "Missing key attribute {name} for table {}",
                    self.definition.name
                ))
            })
        };

        let partition = read(&self.definition.partition_key.name)?;
        let sort = match &self.definition.sort_key {
            Some(sort_key) => read(&sort_key.name)?,
            None => String::new(),
        };
        Ok((partition, sort))
    }
}

/// Document store that keeps every table in memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl InMemoryStore {
    /// Creates an empty store without tables
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write counters of a table (all zero for unknown tables)
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned
    #[must_use]
    pub fn writes(&self, table: &str) -> WriteCounts {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.writes)
            .unwrap_or_default()
    }

    /// TTL attribute configured on a table
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned
    #[must_use]
    pub fn ttl_attribute(&self, table: &str) -> Option<String> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|t| t.ttl_attribute.clone())
    }

    /// Names of the existing tables, sorted
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of items stored in a table
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned
    #[must_use]
    pub fn item_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map_or(0, |t| t.items.len())
    }

    fn with_tables<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, MemoryTable>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| StoreError::InvalidRequest("store lock poisoned".to_string()))?;
        f(&mut tables)
    }
}

fn scalar_repr(value: &AttributeValue) -> String {
    match value {
        AttributeValue::S(s) => s.clone(),
        AttributeValue::N(n) => n.clone(),
        other => format!("{other:?}"),
    }
}

/// Sets compare without regard to element order
fn values_equal(left: &AttributeValue, right: &AttributeValue) -> bool {
    match (left, right) {
        (AttributeValue::Ss(l), AttributeValue::Ss(r))
        | (AttributeValue::Ns(l), AttributeValue::Ns(r)) => {
            let mut l = l.clone();
            let mut r = r.clone();
            l.sort();
            r.sort();
            l == r
        }
        _ => left == right,
    }
}

fn conditions_hold(existing: Option<&Item>, conditions: &[Condition]) -> bool {
    conditions.iter().all(|condition| match condition {
        Condition::AttributeExists(name) => existing.is_some_and(|item| item.contains_key(name)),
        Condition::AttributeNotExists(name) => {
            existing.is_none_or(|item| !item.contains_key(name))
        }
        Condition::Equals(name, value) => existing
            .and_then(|item| item.get(name))
            .is_some_and(|stored| values_equal(stored, value)),
    })
}

fn filters_match(item: &Item, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| match filter {
        Filter::BeginsWith(name, prefix) => item
            .get(name)
            .and_then(|value| value.as_s().ok())
            .is_some_and(|s| s.starts_with(prefix.as_str())),
        Filter::AttributeExists(name) => item.contains_key(name),
    })
}

fn key_matches(item: &Item, condition: &KeyCondition) -> bool {
    let partition = item
        .get(&condition.partition_attribute)
        .is_some_and(|value| values_equal(value, &condition.partition_value));

    partition
        && condition.sort_prefix.as_ref().is_none_or(|(name, prefix)| {
            item.get(name)
                .and_then(|value| value.as_s().ok())
                .is_some_and(|s| s.starts_with(prefix.as_str()))
        })
}

fn project(item: &Item, projection: Option<&Vec<String>>) -> Item {
    match projection {
        Some(attributes) => item
            .iter()
            .filter(|(name, _)| attributes.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
        None => item.clone(),
    }
}

fn table_mut<'a>(
    tables: &'a mut HashMap<String, MemoryTable>,
    name: &str,
) -> StoreResult<&'a mut MemoryTable> {
    tables
        .get_mut(name)
        .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
}

/// A write that passed validation and is ready to apply
enum PlannedWrite {
    Put {
        table: String,
        id: (String, String),
        item: Item,
    },
    Update {
        table: String,
        id: (String, String),
        item: Item,
    },
}

fn apply_actions(mut item: Item, actions: Vec<UpdateAction>) -> Item {
    for action in actions {
        match action {
            UpdateAction::Set(name, value) => {
                item.insert(name, value);
            }
            UpdateAction::Remove(name) => {
                item.remove(&name);
            }
        }
    }
    item
}

/// Validates one write against current state without applying it
fn plan(
    tables: &mut HashMap<String, MemoryTable>,
    operation: WriteOperation,
) -> StoreResult<Option<PlannedWrite>> {
    match operation {
        WriteOperation::Put {
            table,
            item,
            conditions,
        } => {
            let memory = table_mut(tables, &table)?;
            let id = memory.item_id(&item)?;
            if !conditions_hold(memory.items.get(&id), &conditions) {
                return Ok(None);
            }
            Ok(Some(PlannedWrite::Put { table, id, item }))
        }
        WriteOperation::Update {
            table,
            key,
            actions,
            conditions,
        } => {
            let memory = table_mut(tables, &table)?;
            let id = memory.item_id(&key)?;
            let existing = memory.items.get(&id);
            if !conditions_hold(existing, &conditions) {
                return Ok(None);
            }
            // Updating an absent item creates it, as the real store does
            let base = existing.cloned().unwrap_or(key);
            Ok(Some(PlannedWrite::Update {
                table,
                id,
                item: apply_actions(base, actions),
            }))
        }
    }
}

fn apply(tables: &mut HashMap<String, MemoryTable>, write: PlannedWrite) -> StoreResult<()> {
    match write {
        PlannedWrite::Put { table, id, item } => {
            let memory = table_mut(tables, &table)?;
            memory.items.insert(id, item);
            memory.writes.puts += 1;
        }
        PlannedWrite::Update { table, id, item } => {
            let memory = table_mut(tables, &table)?;
            memory.items.insert(id, item);
            memory.writes.updates += 1;
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get_item(
        &self,
        table: &str,
        key: Item,
        projection: Option<Vec<String>>,
    ) -> StoreResult<Option<Item>> {
        self.with_tables(|tables| {
            let memory = table_mut(tables, table)?;
            let id = memory.item_id(&key)?;
            Ok(memory
                .items
                .get(&id)
                .map(|item| project(item, projection.as_ref())))
        })
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome> {
        self.with_tables(|tables| {
            let operation = WriteOperation::Put {
                table: table.to_string(),
                item,
                conditions,
            };
            match plan(tables, operation)? {
                Some(write) => {
                    apply(tables, write)?;
                    Ok(WriteOutcome::Applied)
                }
                None => Ok(WriteOutcome::ConditionFailed),
            }
        })
    }

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        actions: Vec<UpdateAction>,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome> {
        self.with_tables(|tables| {
            let operation = WriteOperation::Update {
                table: table.to_string(),
                key,
                actions,
                conditions,
            };
            match plan(tables, operation)? {
                Some(write) => {
                    apply(tables, write)?;
                    Ok(WriteOutcome::Applied)
                }
                None => Ok(WriteOutcome::ConditionFailed),
            }
        })
    }

    async fn delete_item(&self, table: &str, key: Item) -> StoreResult<()> {
        self.with_tables(|tables| {
            let memory = table_mut(tables, table)?;
            let id = memory.item_id(&key)?;
            memory.items.remove(&id);
            memory.writes.deletes += 1;
            Ok(())
        })
    }

    async fn query(&self, request: QueryRequest) -> StoreResult<Vec<Item>> {
        self.with_tables(|tables| {
            let memory = table_mut(tables, &request.table)?;
            if let Some(index) = &request.index {
                let known = memory
                    .definition
                    .global_secondary_index
                    .as_ref()
                    .is_some_and(|gsi| &gsi.name == index);
                if !known {
                    return Err(StoreError::InvalidRequest(format!(
                        "Unknown index {index} on table {}",
                        request.table
                    )));
                }
            }

            Ok(memory
                .items
                .values()
                .filter(|item| key_matches(item, &request.key_condition))
                .map(|item| project(item, request.projection.as_ref()))
                .collect())
        })
    }

    async fn batch_get_items(&self, table: &str, keys: Vec<Item>) -> StoreResult<Vec<Item>> {
        self.with_tables(|tables| {
            let memory = table_mut(tables, table)?;
            keys.iter()
                .map(|key| memory.item_id(key))
                .filter_map(|id| match id {
                    Ok(id) => memory.items.get(&id).cloned().map(Ok),
                    Err(e) => Some(Err(e)),
                })
                .collect()
        })
    }

    async fn scan(&self, table: &str, filters: Vec<Filter>) -> StoreResult<Vec<Item>> {
        self.with_tables(|tables| {
            let memory = table_mut(tables, table)?;
            Ok(memory
                .items
                .values()
                .filter(|item| filters_match(item, &filters))
                .cloned()
                .collect())
        })
    }

    async fn transact_write(&self, operations: Vec<WriteOperation>) -> StoreResult<WriteOutcome> {
        self.with_tables(|tables| {
            let mut planned = Vec::with_capacity(operations.len());
            for operation in operations {
                match plan(tables, operation)? {
                    Some(write) => planned.push(write),
                    None => return Ok(WriteOutcome::ConditionFailed),
                }
            }

            for write in planned {
                apply(tables, write)?;
            }
            Ok(WriteOutcome::Applied)
        })
    }

    async fn create_table_if_absent(&self, definition: &TableDefinition) -> StoreResult<bool> {
        self.with_tables(|tables| {
            if tables.contains_key(&definition.name) {
                return Ok(false);
            }
            tables.insert(
                definition.name.clone(),
                MemoryTable {
                    definition: definition.clone(),
                    ttl_attribute: None,
                    items: BTreeMap::new(),
                    writes: WriteCounts::default(),
                },
            );
            Ok(true)
        })
    }

    async fn enable_ttl(&self, table: &str, attribute: &str) -> StoreResult<bool> {
        self.with_tables(|tables| {
            let memory = table_mut(tables, table)?;
            if memory.ttl_attribute.as_deref() == Some(attribute) {
                return Ok(false);
            }
            memory.ttl_attribute = Some(attribute.to_string());
            Ok(true)
        })
    }
}
