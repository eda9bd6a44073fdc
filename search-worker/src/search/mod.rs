//! Client of the channel search service

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use subscription_storage::models::{FoundMessage, PhraseMatches};
use thiserror::Error;
use tracing::{debug, instrument};

/// Default request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
/// Maximum number of idle connections to maintain per host
const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 10;

/// Errors returned by the channel search client
#[derive(Debug, Error)]
pub enum ChannelSearchError {
    /// The request could not be sent or the response not read
    #[error("Channel search request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with an error status
    #[error("Channel search service returned {0}")]
    UnexpectedStatus(StatusCode),
}

/// Result type for channel search operations
pub type ChannelSearchResult<T> = Result<T, ChannelSearchError>;

/// A public channel as known to the search service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel id
    pub id: i64,
    /// Channel name
    pub name: String,
}

/// Outcome of searching one channel for a set of phrases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSearch {
    /// Newest message id the search looked at
    pub last_message_id: i64,
    /// Matching messages grouped by phrase
    pub results: Vec<PhraseMatches>,
}

/// Trait for the channel search service
#[async_trait::async_trait]
pub trait ChannelSearch: Send + Sync {
    /// Looks a channel up by its public name
    async fn find_channel_by_name(&self, name: &str) -> ChannelSearchResult<Option<ChannelInfo>>;

    /// Searches messages of a channel newer than `since_message_id` for the given phrases
    async fn search_messages(
        &self,
        channel_id: i64,
        phrases: &BTreeSet<String>,
        since_message_id: Option<i64>,
    ) -> ChannelSearchResult<MessageSearch>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchMessagesRequest<'a> {
    phrases: &'a BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    since_message_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchMessagesResponse {
    last_message_id: i64,
    #[serde(default)]
    results: Vec<PhraseResponse>,
}

#[derive(Debug, Deserialize)]
struct PhraseResponse {
    phrase: String,
    #[serde(default)]
    messages: Vec<MessageResponse>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: i64,
    link: String,
    date: DateTime<Utc>,
}

impl From<SearchMessagesResponse> for MessageSearch {
    fn from(response: SearchMessagesResponse) -> Self {
        Self {
            last_message_id: response.last_message_id,
            results: response
                .results
                .into_iter()
                .map(|group| PhraseMatches {
                    phrase: group.phrase,
                    messages: group
                        .messages
                        .into_iter()
                        .map(|m| FoundMessage {
                            id: m.id,
                            link: m.link,
                            date: m.date,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// HTTP client of the channel search service
pub struct HttpChannelSearchClient {
    base_url: String,
    http_client: Client,
}

impl HttpChannelSearchClient {
    /// Creates a new channel search client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>) -> ChannelSearchResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS_PER_HOST)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }
}

#[async_trait::async_trait]
impl ChannelSearch for HttpChannelSearchClient {
    #[instrument(skip(self))]
    async fn find_channel_by_name(&self, name: &str) -> ChannelSearchResult<Option<ChannelInfo>> {
        let url = format!("{}/v1/channels", self.base_url);
        let response = self
            .http_client
            .get(url)
            .query(&[("name", name)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Channel not found");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ChannelSearchError::UnexpectedStatus(response.status()));
        }

        Ok(Some(response.json::<ChannelInfo>().await?))
    }

    #[instrument(skip(self, phrases), fields(phrases = phrases.len()))]
    async fn search_messages(
        &self,
        channel_id: i64,
        phrases: &BTreeSet<String>,
        since_message_id: Option<i64>,
    ) -> ChannelSearchResult<MessageSearch> {
        let url = format!("{}/v1/channels/{channel_id}/search", self.base_url);
        let response = self
            .http_client
            .post(url)
            .json(&SearchMessagesRequest {
                phrases,
                since_message_id,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ChannelSearchError::UnexpectedStatus(response.status()));
        }

        Ok(response.json::<SearchMessagesResponse>().await?.into())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;

    use subscription_storage::models::PhraseMatches;

    use super::{ChannelInfo, ChannelSearch, ChannelSearchError, ChannelSearchResult, MessageSearch};

    /// One recorded `search_messages` call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SearchCall {
        pub channel_id: i64,
        pub phrases: BTreeSet<String>,
        pub since_message_id: Option<i64>,
    }

    /// Channel search returning canned answers per channel
    #[derive(Default)]
    pub struct MockChannelSearch {
        channels: Vec<ChannelInfo>,
        answers: Mutex<HashMap<i64, MessageSearch>>,
        failing: Mutex<Vec<i64>>,
        calls: Mutex<Vec<SearchCall>>,
    }

    impl MockChannelSearch {
        #[must_use]
        pub fn new(channels: Vec<ChannelInfo>) -> Self {
            Self {
                channels,
                ..Self::default()
            }
        }

        /// Sets what searching `channel_id` returns from now on
        pub fn answer(&self, channel_id: i64, last_message_id: i64, results: Vec<PhraseMatches>) {
            self.answers.lock().unwrap().insert(
                channel_id,
                MessageSearch {
                    last_message_id,
                    results,
                },
            );
        }

        /// Makes searching `channel_id` fail
        pub fn fail(&self, channel_id: i64) {
            self.failing.lock().unwrap().push(channel_id);
        }

        /// Recorded searches, in call order
        pub fn calls(&self) -> Vec<SearchCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ChannelSearch for MockChannelSearch {
        async fn find_channel_by_name(
            &self,
            name: &str,
        ) -> ChannelSearchResult<Option<ChannelInfo>> {
            Ok(self.channels.iter().find(|c| c.name == name).cloned())
        }

        async fn search_messages(
            &self,
            channel_id: i64,
            phrases: &BTreeSet<String>,
            since_message_id: Option<i64>,
        ) -> ChannelSearchResult<MessageSearch> {
            self.calls.lock().unwrap().push(SearchCall {
                channel_id,
                phrases: phrases.clone(),
                since_message_id,
            });

            if self.failing.lock().unwrap().contains(&channel_id) {
                return Err(ChannelSearchError::UnexpectedStatus(
                    reqwest::StatusCode::SERVICE_UNAVAILABLE,
                ));
            }

            Ok(self
                .answers
                .lock()
                .unwrap()
                .get(&channel_id)
                .cloned()
                .unwrap_or(MessageSearch {
                    last_message_id: since_message_id.unwrap_or_default(),
                    results: Vec::new(),
                }))
        }
    }
}
