//! Search result repository
//!
//! Stored results of a subscription are merged with freshly found messages and written in the
//! same transaction that advances the subscription's watermark.

use std::collections::HashSet;
use std::sync::Arc;

use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use crate::keys;
use crate::models::{self, PhraseMatches, SearchResultsAttribute, SearchResultsDocument};
use crate::schema::TableConfig;
use crate::store::{Condition, DocumentStore, WriteOperation, WriteOutcome};
use crate::subscriptions::{advance_watermark, watermark_operation};
use crate::{StorageError, StorageResult};

/// Days a results document is kept after its last write
pub const RESULTS_RETENTION_DAYS: i64 = 7;

/// Output of one search of one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchUpdate {
    /// Channel that was searched
    pub channel_id: i64,
    /// Subscribed user
    pub user_id: i64,
    /// Newest message id the search has seen
    pub last_message_id: i64,
    /// Messages found, grouped by phrase
    pub results: Vec<PhraseMatches>,
}

/// What a merge wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing new was found; only the watermark moved
    WatermarkOnly,
    /// First results document of the subscription
    Created,
    /// New messages were appended to the stored document
    Merged,
}

/// Repository over the search results table
pub struct SearchResultRepository {
    store: Arc<dyn DocumentStore>,
    subscriptions_table: String,
    results_table: String,
}

impl SearchResultRepository {
    /// Creates a new search result repository
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, tables: &TableConfig) -> Self {
        Self {
            store,
            subscriptions_table: tables.channel_users.clone(),
            results_table: tables.search_results.clone(),
        }
    }

    /// Gets the stored results of a subscription; an expired document counts as absent
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store operation fails or the document is malformed
    pub async fn get_search_results(
        &self,
        channel_id: i64,
        user_id: i64,
    ) -> StorageResult<Option<SearchResultsDocument>> {
        let document = self.read_document(channel_id, user_id).await?;
        Ok(document.filter(|document| !document.is_expired(Utc::now())))
    }

    /// The stored document as is, expired or not
    async fn read_document(
        &self,
        channel_id: i64,
        user_id: i64,
    ) -> StorageResult<Option<SearchResultsDocument>> {
        let item = self
            .store
            .get_item(
                &self.results_table,
                keys::subscription_key(channel_id, user_id).to_attributes(),
                None,
            )
            .await?;

        Ok(item.map(serde_dynamo::from_item).transpose()?)
    }

    /// Merges freshly found messages into the stored results and advances the watermark.
    ///
    /// When the document changes, the document write and the watermark advance go out as one
    /// transaction. The document write is conditioned on the version that was read, so a
    /// concurrent merge makes the whole transaction fail instead of overwriting it.
    ///
    /// # Errors
    ///
    /// * `StorageError::SubscriptionNotFound` - The subscription no longer exists
    /// * `StorageError::VersionConflict` - Another writer changed the document since it was read
    /// * `StorageError::Store` - The store operation failed
    #[instrument(skip(self, update), fields(channel_id = update.channel_id, user_id = update.user_id, last_message_id = update.last_message_id))]
    pub async fn merge_search_results(&self, update: SearchUpdate) -> StorageResult<MergeOutcome> {
        let SearchUpdate {
            channel_id,
            user_id,
            last_message_id,
            results,
        } = update;

        let found: Vec<PhraseMatches> = results
            .into_iter()
            .filter(|group| !group.messages.is_empty())
            .collect();
        if found.is_empty() {
            return self
                .watermark_only(channel_id, user_id, last_message_id)
                .await;
        }

        let existing = self.read_document(channel_id, user_id).await?;
        let key = keys::subscription_key(channel_id, user_id);

        // An expired document awaiting TTL deletion is replaced, keeping its version chain
        let (mut search_results, version_condition, version_number, outcome) = match existing {
            None => (
                Vec::new(),
                Condition::AttributeNotExists(models::pk_attribute()),
                0,
                MergeOutcome::Created,
            ),
            Some(document) => {
                let condition = Condition::Equals(
                    SearchResultsAttribute::VersionNumber.to_string(),
                    AttributeValue::N(document.version_number.to_string()),
                );
                if document.is_expired(Utc::now()) {
                    debug!(expired_at = document.expired_at, "Replacing expired results");
                    (Vec::new(), condition, document.version_number, MergeOutcome::Created)
                } else {
                    (
                        document.search_results,
                        condition,
                        document.version_number,
                        MergeOutcome::Merged,
                    )
                }
            }
        };

        if !merge_matches(&mut search_results, found) {
            debug!("No new messages, skipping results rewrite");
            return self
                .watermark_only(channel_id, user_id, last_message_id)
                .await;
        }

        let document = SearchResultsDocument {
            pk: key.pk,
            sk: key.sk,
            expired_at: expiry_timestamp(),
            version_number: version_number + 1,
            search_results,
        };

        let version = document.version_number;
        let operations = vec![
            watermark_operation(
                &self.subscriptions_table,
                channel_id,
                user_id,
                last_message_id,
            ),
            WriteOperation::Put {
                table: self.results_table.clone(),
                item: serde_dynamo::to_item(&document)?,
                conditions: vec![version_condition],
            },
        ];

        match self.store.transact_write(operations).await? {
            WriteOutcome::Applied => {
                info!(version, ?outcome, "Search results written");
                Ok(outcome)
            }
            WriteOutcome::ConditionFailed => {
                Err(self.explain_rejection(channel_id, user_id).await?)
            }
        }
    }

    async fn watermark_only(
        &self,
        channel_id: i64,
        user_id: i64,
        last_message_id: i64,
    ) -> StorageResult<MergeOutcome> {
        advance_watermark(
            self.store.as_ref(),
            &self.subscriptions_table,
            channel_id,
            user_id,
            last_message_id,
        )
        .await?;
        Ok(MergeOutcome::WatermarkOnly)
    }

    /// Works out which precondition of a rejected merge transaction failed
    async fn explain_rejection(&self, channel_id: i64, user_id: i64) -> StorageResult<StorageError> {
        let subscription = self
            .store
            .get_item(
                &self.subscriptions_table,
                keys::subscription_key(channel_id, user_id).to_attributes(),
                Some(vec![models::pk_attribute()]),
            )
            .await?;

        if subscription.is_none() {
            warn!("Merge rejected, subscription is gone");
            return Ok(StorageError::SubscriptionNotFound {
                channel_id,
                user_id,
            });
        }

        warn!("Merge rejected, results were changed concurrently");
        Ok(StorageError::VersionConflict {
            channel_id,
            user_id,
        })
    }
}

fn expiry_timestamp() -> i64 {
    (Utc::now() + TimeDelta::days(RESULTS_RETENTION_DAYS)).timestamp()
}

/// Merges `incoming` groups into `stored`, phrase by phrase.
///
/// New phrases are added with their messages; for known phrases only messages with an unseen
/// id are appended, so an already stored permalink always wins.
///
/// # Returns
///
/// `true` if anything was added
pub fn merge_matches(stored: &mut Vec<PhraseMatches>, incoming: Vec<PhraseMatches>) -> bool {
    let mut changed = false;

    for group in incoming {
        let index = match stored.iter().position(|g| g.phrase == group.phrase) {
            Some(index) => index,
            None => {
                stored.push(PhraseMatches {
                    phrase: group.phrase,
                    messages: Vec::with_capacity(group.messages.len()),
                });
                stored.len() - 1
            }
        };

        let target = &mut stored[index];
        let mut seen: HashSet<i64> = target.messages.iter().map(|m| m.id).collect();
        for message in group.messages {
            if seen.insert(message.id) {
                target.messages.push(message);
                changed = true;
            }
        }
    }

    stored.retain(|group| !group.messages.is_empty());
    changed
}
