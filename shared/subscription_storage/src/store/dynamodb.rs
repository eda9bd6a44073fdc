//! `DynamoDB` adapter of the document store capability

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::SdkError,
    operation::transact_write_items::TransactWriteItemsError,
    types::{
        AttributeDefinition, AttributeValue, BillingMode, GlobalSecondaryIndex,
        KeySchemaElement, KeyType, KeysAndAttributes, Projection, ProjectionType, Put,
        ScalarAttributeType, TableStatus, TimeToLiveSpecification, TimeToLiveStatus,
        TransactWriteItem, Update,
    },
    Client as DynamoDbClient,
};
use tracing::{debug, info};

use super::{
    Condition, DocumentStore, Filter, Item, KeyKind, KeySchema, QueryRequest, StoreError,
    StoreResult, TableDefinition, UpdateAction, WriteOperation, WriteOutcome,
};

/// `DynamoDB` caps `BatchGetItem` at 100 keys per request
const BATCH_GET_LIMIT: usize = 100;
/// How often to poll a freshly created table for the ACTIVE status
const TABLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How many polls before giving up on a table becoming ACTIVE
const TABLE_POLL_ATTEMPTS: usize = 120;

/// Document store backed by `DynamoDB`.
///
/// Retry and timeout policy come from the `SdkConfig` the client was built with.
#[derive(Clone)]
pub struct DynamoDbStore {
    dynamodb_client: Arc<DynamoDbClient>,
}

impl DynamoDbStore {
    /// Creates a new store adapter
    ///
    /// # Arguments
    ///
    /// * `dynamodb_client` - Pre-configured `DynamoDB` client
    #[must_use]
    pub const fn new(dynamodb_client: Arc<DynamoDbClient>) -> Self {
        Self { dynamodb_client }
    }

    async fn wait_until_active(&self, table: &str) -> StoreResult<()> {
        for _ in 0..TABLE_POLL_ATTEMPTS {
            let response = self
                .dynamodb_client
                .describe_table()
                .table_name(table)
                .send()
                .await?;

            let status = response.table().and_then(|t| t.table_status());
            if matches!(status, Some(TableStatus::Active)) {
                return Ok(());
            }

            debug!(table, ?status, "Waiting for table to become active");
            tokio::time::sleep(TABLE_POLL_INTERVAL).await;
        }

        Err(StoreError::TableNotReady(table.to_string()))
    }

    /// One `BatchGetItem` call; returns the found items and the keys left unprocessed
    async fn batch_get_round(
        &self,
        table: &str,
        keys: Vec<Item>,
    ) -> StoreResult<(Vec<Item>, Vec<Item>)> {
        let response = self
            .dynamodb_client
            .batch_get_item()
            .request_items(
                table,
                KeysAndAttributes::builder().set_keys(Some(keys)).build()?,
            )
            .send()
            .await?;

        let found = response
            .responses
            .and_then(|mut responses| responses.remove(table))
            .unwrap_or_default();
        let unprocessed = response
            .unprocessed_keys
            .and_then(|mut unprocessed| unprocessed.remove(table))
            .map(|keys| keys.keys().to_vec())
            .unwrap_or_default();

        Ok((found, unprocessed))
    }
}

/// Backoff for keys `BatchGetItem` leaves unprocessed, which happens when the table throttles
#[derive(Debug, Clone, Copy)]
struct UnprocessedRetry {
    rounds: u32,
    base_delay: Duration,
    max_delay: Duration,
}

const UNPROCESSED_RETRY: UnprocessedRetry = UnprocessedRetry {
    rounds: 8,
    base_delay: Duration::from_millis(50),
    max_delay: Duration::from_secs(2),
};

impl UnprocessedRetry {
    fn delay(&self, round: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(round))
            .min(self.max_delay)
    }
}

/// Calls `fetch` until no keys are left unprocessed, sleeping with exponential backoff
/// between rounds and giving up after `retry.rounds` calls
async fn fetch_with_retry<F, Fut>(
    table: &str,
    keys: Vec<Item>,
    retry: UnprocessedRetry,
    mut fetch: F,
) -> StoreResult<Vec<Item>>
where
    F: FnMut(Vec<Item>) -> Fut + Send,
    Fut: Future<Output = StoreResult<(Vec<Item>, Vec<Item>)>> + Send,
{
    let mut items = Vec::with_capacity(keys.len());
    let mut pending = keys;
    let mut round = 0;

    loop {
        let (found, unprocessed) = fetch(pending).await?;
        items.extend(found);
        if unprocessed.is_empty() {
            return Ok(items);
        }

        round += 1;
        if round >= retry.rounds {
            return Err(StoreError::UnprocessedKeys {
                table: table.to_string(),
                remaining: unprocessed.len(),
            });
        }

        let delay = retry.delay(round - 1);
        debug!(table, unprocessed = unprocessed.len(), ?delay, "Retrying unprocessed keys");
        tokio::time::sleep(delay).await;
        pending = unprocessed;
    }
}

/// Collects placeholder names and values while rendering an expression
#[derive(Default)]
struct Expression {
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl Expression {
    fn name(&mut self, attribute: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, name)| *name == attribute) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    fn value(&mut self, value: AttributeValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), value);
        placeholder
    }

    fn conditions(&mut self, conditions: &[Condition]) -> Option<String> {
        if conditions.is_empty() {
            return None;
        }

        let clauses: Vec<String> = conditions
            .iter()
            .map(|condition| match condition {
                Condition::AttributeExists(attribute) => {
                    format!("attribute_exists({})", self.name(attribute))
                }
                Condition::AttributeNotExists(attribute) => {
                    format!("attribute_not_exists({})", self.name(attribute))
                }
                Condition::Equals(attribute, value) => {
                    let name = self.name(attribute);
                    let value = self.value(value.clone());
                    format!("{name} = {value}")
                }
            })
            .collect();

        Some(clauses.join(" AND "))
    }

    fn filters(&mut self, filters: &[Filter]) -> Option<String> {
        if filters.is_empty() {
            return None;
        }

        let clauses: Vec<String> = filters
            .iter()
            .map(|filter| match filter {
                Filter::BeginsWith(attribute, prefix) => {
                    let name = self.name(attribute);
                    let value = self.value(AttributeValue::S(prefix.clone()));
                    format!("begins_with({name}, {value})")
                }
                Filter::AttributeExists(attribute) => {
                    format!("attribute_exists({})", self.name(attribute))
                }
            })
            .collect();

        Some(clauses.join(" AND "))
    }

    fn update(&mut self, actions: &[UpdateAction]) -> String {
        let mut sets = Vec::new();
        let mut removes = Vec::new();

        for action in actions {
            match action {
                UpdateAction::Set(attribute, value) => {
                    let name = self.name(attribute);
                    let value = self.value(value.clone());
                    sets.push(format!("{name} = {value}"));
                }
                UpdateAction::Remove(attribute) => removes.push(self.name(attribute)),
            }
        }

        let mut expression = Vec::new();
        if !sets.is_empty() {
            expression.push(format!("SET {}", sets.join(", ")));
        }
        if !removes.is_empty() {
            expression.push(format!("REMOVE {}", removes.join(", ")));
        }
        expression.join(" ")
    }

    fn projection(&mut self, attributes: &[String]) -> String {
        attributes
            .iter()
            .map(|attribute| self.name(attribute))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `DynamoDB` rejects empty placeholder maps, so they are only sent when populated
    fn into_parts(
        self,
    ) -> (
        Option<HashMap<String, String>>,
        Option<HashMap<String, AttributeValue>>,
    ) {
        let names = (!self.names.is_empty()).then_some(self.names);
        let values = (!self.values.is_empty()).then_some(self.values);
        (names, values)
    }
}

fn scalar_type(kind: KeyKind) -> ScalarAttributeType {
    match kind {
        KeyKind::String => ScalarAttributeType::S,
        KeyKind::Number => ScalarAttributeType::N,
    }
}

fn key_schema(
    partition_key: &KeySchema,
    sort_key: Option<&KeySchema>,
) -> StoreResult<Vec<KeySchemaElement>> {
    let mut elements = vec![KeySchemaElement::builder()
        .attribute_name(&partition_key.name)
        .key_type(KeyType::Hash)
        .build()?];

    if let Some(sort_key) = sort_key {
        elements.push(
            KeySchemaElement::builder()
                .attribute_name(&sort_key.name)
                .key_type(KeyType::Range)
                .build()?,
        );
    }

    Ok(elements)
}

fn attribute_definitions(definition: &TableDefinition) -> StoreResult<Vec<AttributeDefinition>> {
    let mut attributes: Vec<&KeySchema> = vec![&definition.partition_key];
    attributes.extend(definition.sort_key.as_ref());
    if let Some(index) = &definition.global_secondary_index {
        attributes.push(&index.partition_key);
        attributes.extend(index.sort_key.as_ref());
    }

    let mut definitions: Vec<AttributeDefinition> = Vec::new();
    for attribute in attributes {
        if definitions
            .iter()
            .any(|d| d.attribute_name() == attribute.name)
        {
            continue;
        }
        definitions.push(
            AttributeDefinition::builder()
                .attribute_name(&attribute.name)
                .attribute_type(scalar_type(attribute.kind))
                .build()?,
        );
    }

    Ok(definitions)
}

fn transact_item(operation: WriteOperation) -> StoreResult<TransactWriteItem> {
    let mut expression = Expression::default();

    let item = match operation {
        WriteOperation::Put {
            table,
            item,
            conditions,
        } => {
            let condition = expression.conditions(&conditions);
            let (names, values) = expression.into_parts();
            TransactWriteItem::builder()
                .put(
                    Put::builder()
                        .table_name(table)
                        .set_item(Some(item))
                        .set_condition_expression(condition)
                        .set_expression_attribute_names(names)
                        .set_expression_attribute_values(values)
                        .build()?,
                )
                .build()
        }
        WriteOperation::Update {
            table,
            key,
            actions,
            conditions,
        } => {
            let update = expression.update(&actions);
            let condition = expression.conditions(&conditions);
            let (names, values) = expression.into_parts();
            TransactWriteItem::builder()
                .update(
                    Update::builder()
                        .table_name(table)
                        .set_key(Some(key))
                        .update_expression(update)
                        .set_condition_expression(condition)
                        .set_expression_attribute_names(names)
                        .set_expression_attribute_values(values)
                        .build()?,
                )
                .build()
        }
    };

    Ok(item)
}

#[async_trait]
impl DocumentStore for DynamoDbStore {
    async fn get_item(
        &self,
        table: &str,
        key: Item,
        projection: Option<Vec<String>>,
    ) -> StoreResult<Option<Item>> {
        let mut expression = Expression::default();
        let projection = projection.map(|attributes| expression.projection(&attributes));
        let (names, _) = expression.into_parts();

        let response = self
            .dynamodb_client
            .get_item()
            .table_name(table)
            .set_key(Some(key))
            .set_projection_expression(projection)
            .set_expression_attribute_names(names)
            .send()
            .await?;

        Ok(response.item)
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome> {
        let mut expression = Expression::default();
        let condition = expression.conditions(&conditions);
        let (names, values) = expression.into_parts();

        let result = self
            .dynamodb_client
            .put_item()
            .table_name(table)
            .set_item(Some(item))
            .set_condition_expression(condition)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(SdkError::ServiceError(ref svc))
                if svc.err().is_conditional_check_failed_exception() =>
            {
                Ok(WriteOutcome::ConditionFailed)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        actions: Vec<UpdateAction>,
        conditions: Vec<Condition>,
    ) -> StoreResult<WriteOutcome> {
        let mut expression = Expression::default();
        let update = expression.update(&actions);
        let condition = expression.conditions(&conditions);
        let (names, values) = expression.into_parts();

        let result = self
            .dynamodb_client
            .update_item()
            .table_name(table)
            .set_key(Some(key))
            .update_expression(update)
            .set_condition_expression(condition)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(SdkError::ServiceError(ref svc))
                if svc.err().is_conditional_check_failed_exception() =>
            {
                Ok(WriteOutcome::ConditionFailed)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_item(&self, table: &str, key: Item) -> StoreResult<()> {
        self.dynamodb_client
            .delete_item()
            .table_name(table)
            .set_key(Some(key))
            .send()
            .await?;

        Ok(())
    }

    async fn query(&self, request: QueryRequest) -> StoreResult<Vec<Item>> {
        let mut expression = Expression::default();
        let condition = &request.key_condition;
        let partition_name = expression.name(&condition.partition_attribute);
        let partition_value = expression.value(condition.partition_value.clone());
        let mut key_condition = format!("{partition_name} = {partition_value}");
        if let Some((attribute, prefix)) = &condition.sort_prefix {
            let name = expression.name(attribute);
            let value = expression.value(AttributeValue::S(prefix.clone()));
            key_condition.push_str(&format!(" AND begins_with({name}, {value})"));
        }
        let projection = request
            .projection
            .as_ref()
            .map(|attributes| expression.projection(attributes));
        let (names, values) = expression.into_parts();

        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let response = self
                .dynamodb_client
                .query()
                .table_name(&request.table)
                .set_index_name(request.index.clone())
                .key_condition_expression(&key_condition)
                .set_projection_expression(projection.clone())
                .set_expression_attribute_names(names.clone())
                .set_expression_attribute_values(values.clone())
                .set_exclusive_start_key(start_key)
                .send()
                .await?;

            items.extend(response.items.unwrap_or_default());
            start_key = response.last_evaluated_key;
            if start_key.is_none() {
                break;
            }
        }

        Ok(items)
    }

    async fn batch_get_items(&self, table: &str, keys: Vec<Item>) -> StoreResult<Vec<Item>> {
        let mut items = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(BATCH_GET_LIMIT) {
            let found = fetch_with_retry(table, chunk.to_vec(), UNPROCESSED_RETRY, |pending| {
                self.batch_get_round(table, pending)
            })
            .await?;
            items.extend(found);
        }

        Ok(items)
    }

    async fn scan(&self, table: &str, filters: Vec<Filter>) -> StoreResult<Vec<Item>> {
        let mut expression = Expression::default();
        let filter = expression.filters(&filters);
        let (names, values) = expression.into_parts();

        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let response = self
                .dynamodb_client
                .scan()
                .table_name(table)
                .set_filter_expression(filter.clone())
                .set_expression_attribute_names(names.clone())
                .set_expression_attribute_values(values.clone())
                .set_exclusive_start_key(start_key)
                .send()
                .await?;

            items.extend(response.items.unwrap_or_default());
            start_key = response.last_evaluated_key;
            if start_key.is_none() {
                break;
            }
        }

        Ok(items)
    }

    async fn transact_write(&self, operations: Vec<WriteOperation>) -> StoreResult<WriteOutcome> {
        let items = operations
            .into_iter()
            .map(transact_item)
            .collect::<StoreResult<Vec<_>>>()?;

        let err = match self
            .dynamodb_client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await
        {
            Ok(_) => return Ok(WriteOutcome::Applied),
            Err(err) => err,
        };

        // A cancelled transaction lists one reason per member; any failed condition means
        // nothing was written and the caller decides what that signals.
        if let SdkError::ServiceError(svc) = &err {
            if let TransactWriteItemsError::TransactionCanceledException(canceled) = svc.err() {
                if canceled
                    .cancellation_reasons()
                    .iter()
                    .any(|reason| reason.code() == Some("ConditionalCheckFailed"))
                {
                    return Ok(WriteOutcome::ConditionFailed);
                }
            }
        }

        Err(err.into())
    }

    async fn create_table_if_absent(&self, definition: &TableDefinition) -> StoreResult<bool> {
        let global_secondary_index = definition
            .global_secondary_index
            .as_ref()
            .map(|index| {
                GlobalSecondaryIndex::builder()
                    .index_name(&index.name)
                    .set_key_schema(Some(key_schema(
                        &index.partition_key,
                        index.sort_key.as_ref(),
                    )?))
                    .projection(
                        Projection::builder()
                            .projection_type(ProjectionType::All)
                            .build(),
                    )
                    .build()
                    .map_err(StoreError::from)
            })
            .transpose()?;

        let result = self
            .dynamodb_client
            .create_table()
            .table_name(&definition.name)
            .set_attribute_definitions(Some(attribute_definitions(definition)?))
            .set_key_schema(Some(key_schema(
                &definition.partition_key,
                definition.sort_key.as_ref(),
            )?))
            .set_global_secondary_indexes(global_secondary_index.map(|index| vec![index]))
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await;

        let created = match result {
            Ok(_) => true,
            Err(SdkError::ServiceError(ref svc)) if svc.err().is_resource_in_use_exception() => {
                false
            }
            Err(err) => return Err(err.into()),
        };

        self.wait_until_active(&definition.name).await?;

        if created {
            info!(table = %definition.name, "Created table");
        }
        Ok(created)
    }

    async fn enable_ttl(&self, table: &str, attribute: &str) -> StoreResult<bool> {
        let current = self
            .dynamodb_client
            .describe_time_to_live()
            .table_name(table)
            .send()
            .await?;

        let already_enabled = current.time_to_live_description().is_some_and(|ttl| {
            matches!(
                ttl.time_to_live_status(),
                Some(TimeToLiveStatus::Enabled | TimeToLiveStatus::Enabling)
            ) && ttl.attribute_name() == Some(attribute)
        });
        if already_enabled {
            return Ok(false);
        }

        self.dynamodb_client
            .update_time_to_live()
            .table_name(table)
            .time_to_live_specification(
                TimeToLiveSpecification::builder()
                    .enabled(true)
                    .attribute_name(attribute)
                    .build()?,
            )
            .send()
            .await?;

        info!(table, attribute, "Enabled TTL");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexDefinition;

    #[test]
    fn test_condition_expression_reuses_names() {
        let mut expression = Expression::default();
        let rendered = expression.conditions(&[
            Condition::AttributeExists("PK".to_string()),
            Condition::Equals("Phrases".to_string(), AttributeValue::Ss(vec!["a".into()])),
            Condition::AttributeNotExists("PK".to_string()),
        ]);

        assert_eq!(
            rendered.as_deref(),
            Some("attribute_exists(#n0) AND #n1 = :v0 AND attribute_not_exists(#n0)")
        );
        let (names, values) = expression.into_parts();
        assert_eq!(names.map(|n| n.len()), Some(2));
        assert_eq!(values.map(|v| v.len()), Some(1));
    }

    #[test]
    fn test_update_expression() {
        let mut expression = Expression::default();
        let rendered = expression.update(&[
            UpdateAction::Set("LastMessage".to_string(), AttributeValue::N("5".into())),
            UpdateAction::Remove("Phrases".to_string()),
        ]);

        assert_eq!(rendered, "SET #n0 = :v0 REMOVE #n1");
    }

    #[test]
    fn test_empty_expression_sends_no_placeholders() {
        let mut expression = Expression::default();
        assert_eq!(expression.conditions(&[]), None);
        assert_eq!(expression.into_parts(), (None, None));
    }

    #[test]
    fn test_attribute_definitions_deduplicate_index_keys() {
        let definition = TableDefinition {
            name: "ChannelUsers".to_string(),
            partition_key: KeySchema::string("PK"),
            sort_key: Some(KeySchema::string("SK")),
            global_secondary_index: Some(IndexDefinition {
                name: "UserIndex".to_string(),
                partition_key: KeySchema::string("SK"),
                sort_key: Some(KeySchema::string("PK")),
            }),
        };

        let definitions = attribute_definitions(&definition).unwrap();
        assert_eq!(definitions.len(), 2);
    }

    fn channel_key(id: i64) -> Item {
        HashMap::from([
            ("PK".to_string(), AttributeValue::S(format!("channel#{id}"))),
            ("SK".to_string(), AttributeValue::S(format!("channel#{id}"))),
        ])
    }

    const FAST_RETRY: UnprocessedRetry = UnprocessedRetry {
        rounds: 4,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };

    #[test]
    fn test_unprocessed_backoff_grows_and_caps() {
        assert_eq!(UNPROCESSED_RETRY.delay(0), Duration::from_millis(50));
        assert_eq!(UNPROCESSED_RETRY.delay(1), Duration::from_millis(100));
        assert_eq!(UNPROCESSED_RETRY.delay(3), Duration::from_millis(400));
        assert_eq!(UNPROCESSED_RETRY.delay(40), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unprocessed_keys_are_fetched_in_later_rounds() {
        let mut calls = 0;
        let items = fetch_with_retry(
            "ChannelUsers",
            vec![channel_key(1), channel_key(2), channel_key(3)],
            FAST_RETRY,
            |pending| {
                calls += 1;
                // One key per round, the rest comes back unprocessed
                let (done, rest) = pending.split_at(1);
                let round = (done.to_vec(), rest.to_vec());
                async move { Ok(round) }
            },
        )
        .await
        .unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_persistent_throttling_gives_up() {
        let mut calls = 0;
        let result = fetch_with_retry(
            "ChannelUsers",
            vec![channel_key(1), channel_key(2)],
            FAST_RETRY,
            |pending| {
                calls += 1;
                async move { Ok((Vec::new(), pending)) }
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(StoreError::UnprocessedKeys { ref table, remaining: 2 }) if table == "ChannelUsers"
        ));
        assert_eq!(calls, FAST_RETRY.rounds);
    }
}
