//! Subscription repository
//!
//! CRUD over users, channels and their subscriptions in the channel users table, with
//! idempotent inserts, phrase set edits and the full relationship scan used by the search job.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::cache::EntityCache;
use crate::keys::{self, CHANNEL_PREFIX, USER_PREFIX};
use crate::models::{
    self, phrases_value, read_phrases, Channel, ChannelUser, ChannelUserAttribute, Page,
    SubscriptionEntry, User,
};
use crate::schema::TableConfig;
use crate::store::{
    Condition, DocumentStore, Filter, Item, KeyCondition, QueryRequest, UpdateAction,
    WriteOperation, WriteOutcome,
};
use crate::{StorageError, StorageResult};

/// Channels per page of [`SubscriptionRepository::list_channels`]
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// How many times a phrase edit is re-read and retried after a concurrent change
const PHRASE_UPDATE_ATTEMPTS: usize = 5;

/// Repository over the channel users table
pub struct SubscriptionRepository {
    store: Arc<dyn DocumentStore>,
    cache: Arc<EntityCache>,
    table_name: String,
    user_index_name: String,
    page_size: usize,
}

impl SubscriptionRepository {
    /// Creates a new subscription repository
    ///
    /// # Arguments
    ///
    /// * `store` - Document store the table lives in
    /// * `cache` - Cache shared with other repositories of this process
    /// * `tables` - Table and index names
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<EntityCache>, tables: &TableConfig) -> Self {
        Self {
            store,
            cache,
            table_name: tables.channel_users.clone(),
            user_index_name: tables.channel_users_user_index.clone(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Overrides the number of channels per page
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Checks whether `user_id` is subscribed to `channel_id`
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store operation fails
    pub async fn exists(&self, channel_id: i64, user_id: i64) -> StorageResult<bool> {
        let item = self
            .store
            .get_item(
                &self.table_name,
                keys::subscription_key(channel_id, user_id).to_attributes(),
                Some(vec![models::pk_attribute()]),
            )
            .await?;

        Ok(item.is_some())
    }

    /// Subscribes a user to a channel.
    ///
    /// First makes sure the channel and user records exist, then inserts the relationship.
    /// Each step is idempotent on its own, so a crash between them needs no repair.
    ///
    /// # Returns
    ///
    /// `true` if the subscription was created, `false` if it already existed
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if a store operation fails
    #[instrument(skip(self, user, channel), fields(user_id = user.id, channel_id = channel.id))]
    pub async fn subscribe(&self, user: &User, channel: &Channel) -> StorageResult<bool> {
        self.ensure_entities(user, channel).await?;
        let created = self
            .create_relationship(&ChannelUser::new(channel.id, user.id))
            .await?;

        self.cache.invalidate_user_channels(user.id).await;
        self.cache.invalidate_channel(channel.id).await;

        if created {
            info!("Subscription created");
        } else {
            debug!("Subscription already exists");
        }
        Ok(created)
    }

    /// Inserts the channel and user records unless they already exist
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if a store operation fails
    pub async fn ensure_entities(&self, user: &User, channel: &Channel) -> StorageResult<()> {
        let channel_created = self.insert_if_absent(channel.to_item()?).await?;
        let user_created = self.insert_if_absent(user.to_item()?).await?;

        debug!(channel_created, user_created, "Ensured parent records");
        Ok(())
    }

    /// Inserts the relationship record unless it already exists
    ///
    /// # Returns
    ///
    /// `true` if the record was inserted
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store operation fails
    pub async fn create_relationship(&self, subscription: &ChannelUser) -> StorageResult<bool> {
        self.insert_if_absent(subscription.to_item()?).await
    }

    async fn insert_if_absent(&self, item: Item) -> StorageResult<bool> {
        Ok(self
            .store
            .put_if_absent(&self.table_name, &models::pk_attribute(), item)
            .await?)
    }

    /// Lists the channels a user is subscribed to, in subscription order
    ///
    /// # Arguments
    ///
    /// * `user_id` - The subscriber
    /// * `page` - 1-based page number, first page when `None`
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if a store operation fails or a stored key is malformed
    #[instrument(skip(self))]
    pub async fn list_channels(
        &self,
        user_id: i64,
        page: Option<usize>,
    ) -> StorageResult<Page<Channel>> {
        let channels = if let Some(channels) = self.cache.user_channels(user_id).await {
            channels
        } else {
            let generation = self.cache.user_channels_generation(user_id).await;
            let channels = self.load_user_channels(user_id).await?;
            self.cache
                .put_user_channels(user_id, generation, channels.clone())
                .await;
            channels
        };

        Ok(Page::slice(&channels, page.unwrap_or(1), self.page_size))
    }

    async fn load_user_channels(&self, user_id: i64) -> StorageResult<Vec<Channel>> {
        let relationships = self
            .store
            .query(QueryRequest {
                table: self.table_name.clone(),
                index: Some(self.user_index_name.clone()),
                key_condition: KeyCondition {
                    partition_attribute: models::sk_attribute(),
                    partition_value: AttributeValue::S(keys::user_part(user_id)),
                    sort_prefix: Some((models::pk_attribute(), CHANNEL_PREFIX.to_string())),
                },
                projection: Some(vec![
                    models::pk_attribute(),
                    models::sk_attribute(),
                    ChannelUserAttribute::Created.to_string(),
                ]),
            })
            .await?;

        if relationships.is_empty() {
            return Ok(Vec::new());
        }

        let mut subscribed: Vec<(DateTime<Utc>, i64)> = relationships
            .into_iter()
            .map(|item| ChannelUser::from_item(item).map(|s| (s.created, s.channel_id)))
            .collect::<StorageResult<_>>()?;
        subscribed.sort_unstable();

        let channel_ids: BTreeSet<i64> = subscribed.iter().map(|(_, id)| *id).collect();
        let channels = self.fetch_channels(&channel_ids).await?;

        Ok(subscribed
            .into_iter()
            .filter_map(|(_, channel_id)| {
                let channel = channels.get(&channel_id).cloned();
                if channel.is_none() {
                    warn!(channel_id, "Subscription references a missing channel record");
                }
                channel
            })
            .collect())
    }

    async fn fetch_channels(
        &self,
        channel_ids: &BTreeSet<i64>,
    ) -> StorageResult<HashMap<i64, Channel>> {
        if channel_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let channel_keys = channel_ids
            .iter()
            .map(|id| keys::channel_key(*id).to_attributes())
            .collect();

        self.store
            .batch_get_items(&self.table_name, channel_keys)
            .await?
            .into_iter()
            .map(|item| Channel::from_item(item).map(|c| (c.id, c)))
            .collect()
    }

    /// Gets a channel record
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store operation fails or the record is malformed
    pub async fn get_channel(&self, channel_id: i64) -> StorageResult<Option<Channel>> {
        if let Some(channel) = self.cache.channel(channel_id).await {
            return Ok(Some(channel));
        }
        let generation = self.cache.channel_generation(channel_id).await;

        let channel = self
            .store
            .get_item(
                &self.table_name,
                keys::channel_key(channel_id).to_attributes(),
                None,
            )
            .await?
            .map(Channel::from_item)
            .transpose()?;

        if let Some(channel) = &channel {
            self.cache.put_channel(generation, channel.clone()).await;
        }
        Ok(channel)
    }

    /// Adds phrases to an existing subscription; the stored set becomes the union of old and
    /// new phrases. Does nothing if the subscription does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::VersionConflict` if concurrent edits kept winning, or another
    /// `StorageError` if a store operation fails
    #[instrument(skip(self, subscription), fields(channel_id = subscription.channel_id, user_id = subscription.user_id))]
    pub async fn add_phrases(&self, subscription: &ChannelUser) -> StorageResult<()> {
        let result = self
            .rewrite_phrases(subscription.channel_id, subscription.user_id, |phrases| {
                phrases.extend(subscription.phrases.iter().cloned());
            })
            .await;

        self.cache
            .invalidate_phrases(subscription.channel_id, subscription.user_id)
            .await;
        result
    }

    /// Removes one phrase (exact match) from a subscription. Missing phrases and missing
    /// subscriptions are ignored.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::VersionConflict` if concurrent edits kept winning, or another
    /// `StorageError` if a store operation fails
    #[instrument(skip(self))]
    pub async fn remove_phrase(
        &self,
        channel_id: i64,
        user_id: i64,
        phrase: &str,
    ) -> StorageResult<()> {
        let result = self
            .rewrite_phrases(channel_id, user_id, |phrases| {
                phrases.remove(phrase);
            })
            .await;

        self.cache.invalidate_phrases(channel_id, user_id).await;
        result
    }

    /// Read-modify-write of the phrase set, guarded by the value that was read.
    ///
    /// An empty result removes the attribute instead of storing an empty set.
    async fn rewrite_phrases(
        &self,
        channel_id: i64,
        user_id: i64,
        edit: impl Fn(&mut BTreeSet<String>) + Send + Sync,
    ) -> StorageResult<()> {
        let key = keys::subscription_key(channel_id, user_id).to_attributes();
        let phrases_attribute = ChannelUserAttribute::Phrases.to_string();

        for attempt in 1..=PHRASE_UPDATE_ATTEMPTS {
            let Some(item) = self
                .store
                .get_item(
                    &self.table_name,
                    key.clone(),
                    Some(vec![models::pk_attribute(), phrases_attribute.clone()]),
                )
                .await?
            else {
                debug!("Subscription not found, phrases left untouched");
                return Ok(());
            };

            let current = item
                .get(&phrases_attribute)
                .map(read_phrases)
                .transpose()?
                .unwrap_or_default();
            let mut updated = current.clone();
            edit(&mut updated);
            if updated == current {
                return Ok(());
            }

            let action = match phrases_value(&updated) {
                Some(value) => UpdateAction::Set(phrases_attribute.clone(), value),
                None => UpdateAction::Remove(phrases_attribute.clone()),
            };
            let unchanged = match phrases_value(&current) {
                Some(value) => Condition::Equals(phrases_attribute.clone(), value),
                None => Condition::AttributeNotExists(phrases_attribute.clone()),
            };

            let outcome = self
                .store
                .update_item(
                    &self.table_name,
                    key.clone(),
                    vec![action],
                    vec![Condition::AttributeExists(models::pk_attribute()), unchanged],
                )
                .await?;

            if outcome.is_applied() {
                debug!(phrases = updated.len(), "Phrases updated");
                return Ok(());
            }
            debug!(attempt, "Phrases changed concurrently, retrying");
        }

        Err(StorageError::VersionConflict {
            channel_id,
            user_id,
        })
    }

    /// Gets the phrases of a subscription; empty when there are none or the subscription
    /// does not exist
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store operation fails or the record is malformed
    pub async fn get_phrases(&self, channel_id: i64, user_id: i64) -> StorageResult<BTreeSet<String>> {
        if let Some(phrases) = self.cache.phrases(channel_id, user_id).await {
            return Ok(phrases);
        }
        let generation = self.cache.phrases_generation(channel_id, user_id).await;

        let item = self
            .store
            .get_item(
                &self.table_name,
                keys::subscription_key(channel_id, user_id).to_attributes(),
                None,
            )
            .await?;

        let Some(item) = item else {
            return Ok(BTreeSet::new());
        };

        let phrases = ChannelUser::from_item(item)?.phrases;
        self.cache
            .put_phrases(channel_id, user_id, generation, phrases.clone())
            .await;
        Ok(phrases)
    }

    /// Deletes a subscription; deleting a missing subscription is not an error
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store operation fails
    #[instrument(skip(self))]
    pub async fn remove_subscription(&self, channel_id: i64, user_id: i64) -> StorageResult<()> {
        self.store
            .delete_item(
                &self.table_name,
                keys::subscription_key(channel_id, user_id).to_attributes(),
            )
            .await?;

        self.cache.invalidate_user_channels(user_id).await;
        self.cache.invalidate_phrases(channel_id, user_id).await;

        info!("Subscription removed");
        Ok(())
    }

    /// Lists every subscription in the table together with its channel record.
    ///
    /// The listing is a scan, so it is consistent per item but not a point-in-time snapshot.
    ///
    /// # Arguments
    ///
    /// * `only_with_phrases` - Skip subscriptions without phrases
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if a store operation fails or a stored key is malformed
    #[instrument(skip(self))]
    pub async fn list_all_subscriptions(
        &self,
        only_with_phrases: bool,
    ) -> StorageResult<Vec<SubscriptionEntry>> {
        let mut filters = vec![
            Filter::BeginsWith(models::pk_attribute(), CHANNEL_PREFIX.to_string()),
            Filter::BeginsWith(models::sk_attribute(), USER_PREFIX.to_string()),
        ];
        if only_with_phrases {
            filters.push(Filter::AttributeExists(
                ChannelUserAttribute::Phrases.to_string(),
            ));
        }

        let subscriptions = self
            .store
            .scan(&self.table_name, filters)
            .await?
            .into_iter()
            .map(ChannelUser::from_item)
            .collect::<StorageResult<Vec<_>>>()?;

        let channel_ids: BTreeSet<i64> = subscriptions.iter().map(|s| s.channel_id).collect();
        let channels = self.resolve_channels(&channel_ids).await?;

        let entries: Vec<SubscriptionEntry> = subscriptions
            .into_iter()
            .filter(|s| !only_with_phrases || !s.phrases.is_empty())
            .filter_map(|s| {
                let Some(channel) = channels.get(&s.channel_id).cloned() else {
                    warn!(
                        channel_id = s.channel_id,
                        user_id = s.user_id,
                        "Subscription references a missing channel record"
                    );
                    return None;
                };
                Some(SubscriptionEntry {
                    user_id: s.user_id,
                    channel,
                    phrases: s.phrases,
                    last_message: s.last_message,
                })
            })
            .collect();

        debug!(count = entries.len(), "Listed subscriptions");
        Ok(entries)
    }

    /// Channel records by id, served from the cache where possible
    async fn resolve_channels(
        &self,
        channel_ids: &BTreeSet<i64>,
    ) -> StorageResult<HashMap<i64, Channel>> {
        let mut resolved = HashMap::with_capacity(channel_ids.len());
        let mut missing = BTreeMap::new();

        for channel_id in channel_ids {
            match self.cache.channel(*channel_id).await {
                Some(channel) => {
                    resolved.insert(*channel_id, channel);
                }
                None => {
                    let generation = self.cache.channel_generation(*channel_id).await;
                    missing.insert(*channel_id, generation);
                }
            }
        }

        let missing_ids: BTreeSet<i64> = missing.keys().copied().collect();
        for (channel_id, channel) in self.fetch_channels(&missing_ids).await? {
            if let Some(generation) = missing.get(&channel_id) {
                self.cache.put_channel(*generation, channel.clone()).await;
            }
            resolved.insert(channel_id, channel);
        }

        Ok(resolved)
    }

    /// Moves the watermark of a subscription to `last_message_id`
    ///
    /// # Errors
    ///
    /// Returns `StorageError::SubscriptionNotFound` if the subscription does not exist, since
    /// that means the caller is working from stale membership data
    #[instrument(skip(self))]
    pub async fn advance_watermark(
        &self,
        channel_id: i64,
        user_id: i64,
        last_message_id: i64,
    ) -> StorageResult<()> {
        advance_watermark(
            self.store.as_ref(),
            &self.table_name,
            channel_id,
            user_id,
            last_message_id,
        )
        .await
    }
}

/// Update actions and preconditions that move a subscription's watermark. The subscription
/// must still exist.
fn watermark_change(last_message_id: i64) -> (Vec<UpdateAction>, Vec<Condition>) {
    (
        vec![UpdateAction::Set(
            ChannelUserAttribute::LastMessage.to_string(),
            AttributeValue::N(last_message_id.to_string()),
        )],
        vec![Condition::AttributeExists(models::pk_attribute())],
    )
}

/// The watermark move as a transaction member
pub(crate) fn watermark_operation(
    table: &str,
    channel_id: i64,
    user_id: i64,
    last_message_id: i64,
) -> WriteOperation {
    let (actions, conditions) = watermark_change(last_message_id);
    WriteOperation::Update {
        table: table.to_string(),
        key: keys::subscription_key(channel_id, user_id).to_attributes(),
        actions,
        conditions,
    }
}

pub(crate) async fn advance_watermark(
    store: &dyn DocumentStore,
    table: &str,
    channel_id: i64,
    user_id: i64,
    last_message_id: i64,
) -> StorageResult<()> {
    let (actions, conditions) = watermark_change(last_message_id);
    let outcome = store
        .update_item(
            table,
            keys::subscription_key(channel_id, user_id).to_attributes(),
            actions,
            conditions,
        )
        .await?;

    match outcome {
        WriteOutcome::Applied => {
            debug!(channel_id, user_id, last_message_id, "Watermark advanced");
            Ok(())
        }
        WriteOutcome::ConditionFailed => Err(StorageError::SubscriptionNotFound {
            channel_id,
            user_id,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::InMemoryStore;

    async fn setup(cache: EntityCache) -> (Arc<InMemoryStore>, SubscriptionRepository) {
        let tables = TableConfig::default();
        let store = Arc::new(InMemoryStore::new());
        store
            .create_table_if_absent(&tables.channel_users_table())
            .await
            .unwrap();
        let repository = SubscriptionRepository::new(store.clone(), Arc::new(cache), &tables);
        (store, repository)
    }

    fn user(id: i64) -> User {
        User {
            id,
            name: format!("user-{id}"),
            created: Utc::now(),
        }
    }

    fn channel(id: i64) -> Channel {
        Channel {
            id,
            name: format!("channel-{id}"),
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let (store, repository) = setup(EntityCache::new()).await;

        assert!(repository.subscribe(&user(1), &channel(10)).await.unwrap());
        assert!(!repository.subscribe(&user(1), &channel(10)).await.unwrap());

        // channel, user and one relationship
        assert_eq!(store.item_count("ChannelUsers"), 3);
        assert!(repository.exists(10, 1).await.unwrap());
        assert!(!repository.exists(10, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_channels_in_subscription_order() {
        let (_, repository) = setup(EntityCache::new()).await;
        for channel_id in [30, 10, 20] {
            repository
                .subscribe(&user(1), &channel(channel_id))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        repository.subscribe(&user(2), &channel(40)).await.unwrap();

        let page = repository.list_channels(1, None).await.unwrap();
        let ids: Vec<i64> = page.items.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![30, 10, 20]);
        assert_eq!(page.page_number, 1);
        assert_eq!(page.pages_count, 1);
    }

    #[tokio::test]
    async fn test_list_channels_without_subscriptions() {
        let (_, repository) = setup(EntityCache::new()).await;
        repository.subscribe(&user(1), &channel(10)).await.unwrap();

        let page = repository.list_channels(99, Some(1)).await.unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.pages_count, 0);
    }

    #[tokio::test]
    async fn test_subscribe_invalidates_channel_list() {
        let (_, repository) = setup(EntityCache::new()).await;
        repository.subscribe(&user(1), &channel(10)).await.unwrap();
        assert_eq!(repository.list_channels(1, None).await.unwrap().items.len(), 1);

        repository.subscribe(&user(1), &channel(11)).await.unwrap();
        assert_eq!(repository.list_channels(1, None).await.unwrap().items.len(), 2);

        repository.remove_subscription(10, 1).await.unwrap();
        let ids: Vec<i64> = repository
            .list_channels(1, None)
            .await
            .unwrap()
            .items
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![11]);
    }

    #[tokio::test]
    async fn test_get_channel() {
        let (_, repository) = setup(EntityCache::new()).await;
        repository.subscribe(&user(1), &channel(10)).await.unwrap();

        let found = repository.get_channel(10).await.unwrap().unwrap();
        assert_eq!(found.name, "channel-10");
        assert!(repository.get_channel(11).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_phrases_requires_subscription() {
        let (store, repository) = setup(EntityCache::new()).await;

        repository
            .add_phrases(&ChannelUser::new(10, 1).with_phrases(["rust"]))
            .await
            .unwrap();

        assert_eq!(store.item_count("ChannelUsers"), 0);
        assert!(repository.get_phrases(10, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_phrase_union_and_removal() {
        let (store, repository) = setup(EntityCache::new()).await;
        repository.subscribe(&user(1), &channel(10)).await.unwrap();

        repository
            .add_phrases(&ChannelUser::new(10, 1).with_phrases(["a", "b"]))
            .await
            .unwrap();
        repository
            .add_phrases(&ChannelUser::new(10, 1).with_phrases(["b", "c"]))
            .await
            .unwrap();
        assert_eq!(
            repository.get_phrases(10, 1).await.unwrap(),
            BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );

        for phrase in ["a", "b", "missing", "c"] {
            repository.remove_phrase(10, 1, phrase).await.unwrap();
        }
        assert!(repository.get_phrases(10, 1).await.unwrap().is_empty());

        let item = store
            .get_item(
                "ChannelUsers",
                keys::subscription_key(10, 1).to_attributes(),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert!(!item.contains_key("Phrases"));
    }

    #[tokio::test]
    async fn test_add_empty_phrases_keeps_attribute_absent() {
        let (store, repository) = setup(EntityCache::new()).await;
        repository.subscribe(&user(1), &channel(10)).await.unwrap();
        let writes_before = store.writes("ChannelUsers");

        repository
            .add_phrases(&ChannelUser::new(10, 1))
            .await
            .unwrap();

        assert_eq!(store.writes("ChannelUsers"), writes_before);
    }

    #[tokio::test]
    async fn test_list_all_subscriptions() {
        let (_, repository) = setup(EntityCache::new()).await;
        repository.subscribe(&user(1), &channel(10)).await.unwrap();
        repository.subscribe(&user(2), &channel(10)).await.unwrap();
        repository.subscribe(&user(1), &channel(20)).await.unwrap();
        repository
            .add_phrases(&ChannelUser::new(10, 2).with_phrases(["rust"]))
            .await
            .unwrap();

        let all = repository.list_all_subscriptions(false).await.unwrap();
        assert_eq!(all.len(), 3);

        let with_phrases = repository.list_all_subscriptions(true).await.unwrap();
        assert_eq!(with_phrases.len(), 1);
        assert_eq!(with_phrases[0].user_id, 2);
        assert_eq!(with_phrases[0].channel.id, 10);
        assert_eq!(with_phrases[0].channel.name, "channel-10");
        assert_eq!(
            with_phrases[0].phrases,
            BTreeSet::from(["rust".to_string()])
        );
        assert_eq!(with_phrases[0].last_message, None);
    }

    #[tokio::test]
    async fn test_advance_watermark() {
        let (_, repository) = setup(EntityCache::new()).await;
        repository.subscribe(&user(1), &channel(10)).await.unwrap();

        repository.advance_watermark(10, 1, 500).await.unwrap();
        let all = repository.list_all_subscriptions(false).await.unwrap();
        assert_eq!(all[0].last_message, Some(500));

        let missing = repository.advance_watermark(10, 2, 500).await;
        assert!(matches!(
            missing,
            Err(StorageError::SubscriptionNotFound {
                channel_id: 10,
                user_id: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_disabled_cache_gives_same_answers() {
        let (_, cached) = setup(EntityCache::new()).await;
        let (_, uncached) = setup(EntityCache::disabled()).await;

        for repository in [&cached, &uncached] {
            repository.subscribe(&user(1), &channel(10)).await.unwrap();
            repository
                .add_phrases(&ChannelUser::new(10, 1).with_phrases(["x"]))
                .await
                .unwrap();
            repository.remove_phrase(10, 1, "x").await.unwrap();
        }

        assert_eq!(
            cached.get_phrases(10, 1).await.unwrap(),
            uncached.get_phrases(10, 1).await.unwrap()
        );
        assert_eq!(
            cached.list_channels(1, None).await.unwrap().items.len(),
            uncached.list_channels(1, None).await.unwrap().items.len()
        );
    }
}
