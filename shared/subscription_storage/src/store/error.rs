//! Error types for document store operations

use aws_sdk_dynamodb::error::{BuildError, SdkError};
use aws_sdk_dynamodb::operation::{
    batch_get_item::BatchGetItemError, create_table::CreateTableError,
    delete_item::DeleteItemError, describe_table::DescribeTableError,
    describe_time_to_live::DescribeTimeToLiveError, get_item::GetItemError,
    put_item::PutItemError, query::QueryError, scan::ScanError,
    transact_write_items::TransactWriteItemsError, update_item::UpdateItemError,
    update_time_to_live::UpdateTimeToLiveError,
};
use thiserror::Error;

/// Result type for document store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the document store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to get an item from `DynamoDB`
    #[error("Failed to get item from DynamoDB: {0:?}")]
    DynamoDbGetError(#[from] SdkError<GetItemError>),

    /// Failed to put an item into `DynamoDB`
    #[error("Failed to put item into DynamoDB: {0:?}")]
    DynamoDbPutError(#[from] SdkError<PutItemError>),

    /// Failed to update an item in `DynamoDB`
    #[error("Failed to update item in DynamoDB: {0:?}")]
    DynamoDbUpdateError(#[from] SdkError<UpdateItemError>),

    /// Failed to delete an item from `DynamoDB`
    #[error("Failed to delete item from DynamoDB: {0:?}")]
    DynamoDbDeleteError(#[from] SdkError<DeleteItemError>),

    /// Failed to query `DynamoDB`
    #[error("Failed to query DynamoDB: {0:?}")]
    DynamoDbQueryError(#[from] SdkError<QueryError>),

    /// Failed to batch get items from `DynamoDB`
    #[error("Failed to batch get items from DynamoDB: {0:?}")]
    DynamoDbBatchGetError(#[from] SdkError<BatchGetItemError>),

    /// Failed to scan `DynamoDB`
    #[error("Failed to scan DynamoDB: {0:?}")]
    DynamoDbScanError(#[from] SdkError<ScanError>),

    /// Failed to write a transaction to `DynamoDB`
    #[error("Failed to write transaction to DynamoDB: {0:?}")]
    DynamoDbTransactWriteError(#[from] SdkError<TransactWriteItemsError>),

    /// Failed to create a `DynamoDB` table
    #[error("Failed to create DynamoDB table: {0:?}")]
    DynamoDbCreateTableError(#[from] SdkError<CreateTableError>),

    /// Failed to describe a `DynamoDB` table
    #[error("Failed to describe DynamoDB table: {0:?}")]
    DynamoDbDescribeTableError(#[from] SdkError<DescribeTableError>),

    /// Failed to read the TTL settings of a `DynamoDB` table
    #[error("Failed to describe DynamoDB TTL: {0:?}")]
    DynamoDbDescribeTtlError(#[from] SdkError<DescribeTimeToLiveError>),

    /// Failed to change the TTL settings of a `DynamoDB` table
    #[error("Failed to update DynamoDB TTL: {0:?}")]
    DynamoDbUpdateTtlError(#[from] SdkError<UpdateTimeToLiveError>),

    /// Failed to build a request
    #[error("Failed to build DynamoDB request: {0}")]
    RequestBuildError(#[from] BuildError),

    /// Table did not become active in time after creation
    #[error("Table {0} did not become active")]
    TableNotReady(String),

    /// Batch get still had unprocessed keys after every retry round
    #[error("{remaining} keys of table {table} stayed unprocessed after retries")]
    UnprocessedKeys {
        /// Table the keys belong to
        table: String,
        /// Keys that were never returned
        remaining: usize,
    },

    /// Table does not exist
    #[error("Table {0} does not exist")]
    TableNotFound(String),

    /// Request is missing key attributes or is otherwise invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
