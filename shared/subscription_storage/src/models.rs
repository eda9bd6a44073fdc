//! Entities stored in the channel users and search results tables

use std::collections::BTreeSet;

use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::keys::{self, ItemKey, KeyAttribute};
use crate::store::Item;
use crate::{StorageError, StorageResult};

/// Attribute names of the channel users table (besides `PK`/`SK`)
#[derive(Debug, Clone, Copy, Display)]
#[strum(serialize_all = "PascalCase")]
pub enum ChannelUserAttribute {
    /// Display name of a user or channel
    Name,
    /// ISO-8601 creation timestamp
    Created,
    /// String set of phrases, omitted when empty
    Phrases,
    /// Watermark message id, omitted until the first search
    LastMessage,
}

/// Attribute names of the search results table (besides `PK`/`SK`)
#[derive(Debug, Clone, Copy, Display)]
#[strum(serialize_all = "PascalCase")]
pub enum SearchResultsAttribute {
    /// Expiry in epoch seconds (TTL attribute)
    ExpiredAt,
    /// Write counter used for optimistic checks
    VersionNumber,
    /// Matches grouped by phrase
    SearchResults,
}

/// A chat user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// User id
    pub id: i64,
    /// Display name
    pub name: String,
    /// When the record was first written
    pub created: DateTime<Utc>,
}

/// A public broadcast channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Channel id
    pub id: i64,
    /// Channel name
    pub name: String,
    /// When the record was first written
    pub created: DateTime<Utc>,
}

/// Subscription of a user to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUser {
    /// Channel id
    pub channel_id: i64,
    /// User id
    pub user_id: i64,
    /// When the subscription was created
    pub created: DateTime<Utc>,
    /// Phrases the user watches for in this channel
    pub phrases: BTreeSet<String>,
    /// Highest message id already searched
    pub last_message: Option<i64>,
}

impl ChannelUser {
    /// A fresh subscription without phrases or watermark
    #[must_use]
    pub fn new(channel_id: i64, user_id: i64) -> Self {
        Self {
            channel_id,
            user_id,
            created: Utc::now(),
            phrases: BTreeSet::new(),
            last_message: None,
        }
    }

    /// Same subscription with the given phrases
    #[must_use]
    pub fn with_phrases<I, S>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phrases = phrases.into_iter().map(Into::into).collect();
        self
    }
}

/// One row of the full subscription listing consumed by the search job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    /// Subscribed user
    pub user_id: i64,
    /// Channel record
    pub channel: Channel,
    /// Phrases of the subscription
    pub phrases: BTreeSet<String>,
    /// Watermark of the subscription
    pub last_message: Option<i64>,
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// 1-based page number
    pub page_number: usize,
    /// Total number of pages
    pub pages_count: usize,
}

impl<T: Clone> Page<T> {
    /// Cuts page `page_number` (1-based, clamped to at least 1) out of `all`
    #[must_use]
    pub fn slice(all: &[T], page_number: usize, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let page_number = page_number.max(1);
        let start = (page_number - 1).saturating_mul(page_size);

        Self {
            items: all.iter().skip(start).take(page_size).cloned().collect(),
            page_number,
            pages_count: all.len().div_ceil(page_size),
        }
    }
}

/// A message found for a phrase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FoundMessage {
    /// Message id, the deduplication key
    pub id: i64,
    /// Permalink to the message
    pub link: String,
    /// Message timestamp
    pub date: DateTime<Utc>,
}

/// Messages found for one phrase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhraseMatches {
    /// The phrase
    pub phrase: String,
    /// Messages containing it
    pub messages: Vec<FoundMessage>,
}

/// Stored search results of one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultsDocument {
    /// `channel#<id>`
    #[serde(rename = "PK")]
    pub pk: String,
    /// `user#<id>`
    #[serde(rename = "SK")]
    pub sk: String,
    /// Expiry in epoch seconds
    #[serde(rename = "ExpiredAt")]
    pub expired_at: i64,
    /// Incremented on every write
    #[serde(rename = "VersionNumber")]
    pub version_number: i64,
    /// Matches grouped by phrase
    #[serde(rename = "SearchResults", default)]
    pub search_results: Vec<PhraseMatches>,
}

impl SearchResultsDocument {
    /// Whether the document is past its expiry. TTL deletion lags behind, so an expired
    /// document can still be returned by the store.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at <= now.timestamp()
    }
}

/// Shape of user and channel records on the wire
#[derive(Debug, Serialize, Deserialize)]
struct EntityRecord {
    #[serde(rename = "PK")]
    pk: String,
    #[serde(rename = "SK")]
    sk: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Created")]
    created: DateTime<Utc>,
}

/// Shape of subscription records on the wire; `Phrases` is written as a string set separately
#[derive(Debug, Serialize, Deserialize)]
struct ChannelUserRecord {
    #[serde(rename = "PK")]
    pk: String,
    #[serde(rename = "SK")]
    sk: String,
    #[serde(rename = "Created")]
    created: DateTime<Utc>,
    #[serde(rename = "LastMessage", skip_serializing_if = "Option::is_none", default)]
    last_message: Option<i64>,
}

impl User {
    /// Converts the user into its stored item
    ///
    /// # Errors
    ///
    /// Returns `StorageError::SerializationError` if conversion fails
    pub fn to_item(&self) -> StorageResult<Item> {
        let key = keys::user_key(self.id);
        entity_item(key, &self.name, self.created)
    }

    /// Reads a user back from its stored item
    ///
    /// # Errors
    ///
    /// Returns an error if the item is not a user record
    pub fn from_item(item: Item) -> StorageResult<Self> {
        let record: EntityRecord = serde_dynamo::from_item(item)?;
        Ok(Self {
            id: keys::parse_user_id(&record.pk)?,
            name: record.name,
            created: record.created,
        })
    }
}

impl Channel {
    /// Converts the channel into its stored item
    ///
    /// # Errors
    ///
    /// Returns `StorageError::SerializationError` if conversion fails
    pub fn to_item(&self) -> StorageResult<Item> {
        let key = keys::channel_key(self.id);
        entity_item(key, &self.name, self.created)
    }

    /// Reads a channel back from its stored item
    ///
    /// # Errors
    ///
    /// Returns an error if the item is not a channel record
    pub fn from_item(item: Item) -> StorageResult<Self> {
        let record: EntityRecord = serde_dynamo::from_item(item)?;
        Ok(Self {
            id: keys::parse_channel_id(&record.pk)?,
            name: record.name,
            created: record.created,
        })
    }
}

fn entity_item(key: ItemKey, name: &str, created: DateTime<Utc>) -> StorageResult<Item> {
    let record = EntityRecord {
        pk: key.pk,
        sk: key.sk,
        name: name.to_string(),
        created,
    };
    Ok(serde_dynamo::to_item(record)?)
}

impl ChannelUser {
    /// Converts the subscription into its stored item. Empty phrase sets are omitted.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::SerializationError` if conversion fails
    pub fn to_item(&self) -> StorageResult<Item> {
        let key = keys::subscription_key(self.channel_id, self.user_id);
        let record = ChannelUserRecord {
            pk: key.pk,
            sk: key.sk,
            created: self.created,
            last_message: self.last_message,
        };

        let mut item: Item = serde_dynamo::to_item(record)?;
        if let Some(phrases) = phrases_value(&self.phrases) {
            item.insert(ChannelUserAttribute::Phrases.to_string(), phrases);
        }
        Ok(item)
    }

    /// Reads a subscription back from its stored item
    ///
    /// # Errors
    ///
    /// Returns an error if the item is not a subscription record
    pub fn from_item(mut item: Item) -> StorageResult<Self> {
        let phrases = item
            .remove(&ChannelUserAttribute::Phrases.to_string())
            .map(|value| read_phrases(&value))
            .transpose()?
            .unwrap_or_default();

        let record: ChannelUserRecord = serde_dynamo::from_item(item)?;
        Ok(Self {
            channel_id: keys::parse_channel_id(&record.pk)?,
            user_id: keys::parse_user_id(&record.sk)?,
            created: record.created,
            phrases,
            last_message: record.last_message,
        })
    }
}

/// String set value of a phrase set, or `None` when the set is empty. The store cannot hold
/// empty sets, and an absent attribute is the canonical empty state.
#[must_use]
pub fn phrases_value(phrases: &BTreeSet<String>) -> Option<AttributeValue> {
    (!phrases.is_empty()).then(|| AttributeValue::Ss(phrases.iter().cloned().collect()))
}

/// Reads a phrase set out of a stored attribute value
///
/// # Errors
///
/// Returns `StorageError::SerializationError` if the value is not a string set or list
pub fn read_phrases(value: &AttributeValue) -> StorageResult<BTreeSet<String>> {
    match value {
        AttributeValue::Ss(phrases) => Ok(phrases.iter().cloned().collect()),
        AttributeValue::L(values) => values
            .iter()
            .map(|v| {
                v.as_s().cloned().map_err(|_| {
                    StorageError::SerializationError(format!("Phrase is not a string: {v:?}"))
                })
            })
            .collect(),
        other => Err(StorageError::SerializationError(format!(
            "Unexpected {} value: {other:?}",
            ChannelUserAttribute::Phrases
        ))),
    }
}

/// Name of the `PK` attribute
pub(crate) fn pk_attribute() -> String {
    KeyAttribute::Pk.to_string()
}

/// Name of the `SK` attribute
pub(crate) fn sk_attribute() -> String {
    KeyAttribute::Sk.to_string()
}
