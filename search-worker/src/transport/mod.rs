//! Chat transport used to notify users

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

/// Default request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Errors returned by the chat transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or the response not read
    #[error("Bot API request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The bot API rejected the call
    #[error("Bot API rejected {method}: {description}")]
    Rejected {
        /// API method that was called
        method: &'static str,
        /// Reason given by the API
        description: String,
    },
}

/// Result type for chat transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Trait for the chat transport
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    /// Sends a text message to a chat
    async fn send_message(&self, chat_id: i64, text: &str) -> TransportResult<()>;

    /// Answers a pressed inline button, optionally with a short notice
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> TransportResult<()>;
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Serialize)]
struct AnswerCallbackRequest<'a> {
    callback_query_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Chat transport over the Telegram-style bot HTTP API
pub struct BotApiTransport {
    api_url: String,
    token: String,
    http_client: Client,
}

impl BotApiTransport {
    /// Creates a new bot API transport
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> TransportResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http_client,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_url, self.token)
    }

    async fn call<T: Serialize + Sync>(&self, method: &'static str, body: &T) -> TransportResult<()> {
        let response = self
            .http_client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await?
            .json::<BotApiResponse>()
            .await?;

        if response.ok {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                method,
                description: response.description.unwrap_or_default(),
            })
        }
    }
}

#[async_trait::async_trait]
impl ChatTransport for BotApiTransport {
    #[instrument(skip(self, text), fields(length = text.len()))]
    async fn send_message(&self, chat_id: i64, text: &str) -> TransportResult<()> {
        self.call(
            "sendMessage",
            &SendMessageRequest {
                chat_id,
                text,
                disable_web_page_preview: true,
            },
        )
        .await
    }

    #[instrument(skip(self, text))]
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> TransportResult<()> {
        self.call(
            "answerCallbackQuery",
            &AnswerCallbackRequest {
                callback_query_id: callback_id,
                text,
            },
        )
        .await
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::sync::Mutex;

    use super::{ChatTransport, TransportError, TransportResult};

    /// Transport that records messages instead of sending them
    #[derive(Default)]
    pub struct MockChatTransport {
        sent: Mutex<Vec<(i64, String)>>,
        answered: Mutex<Vec<String>>,
        unreachable_chats: Mutex<Vec<i64>>,
    }

    impl MockChatTransport {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes sending to `chat_id` fail
        pub fn block(&self, chat_id: i64) {
            self.unreachable_chats.lock().unwrap().push(chat_id);
        }

        /// Sent messages as (chat id, text), in send order
        pub fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }

        /// Answered callback ids
        pub fn answered(&self) -> Vec<String> {
            self.answered.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ChatTransport for MockChatTransport {
        async fn send_message(&self, chat_id: i64, text: &str) -> TransportResult<()> {
            if self.unreachable_chats.lock().unwrap().contains(&chat_id) {
                return Err(TransportError::Rejected {
                    method: "sendMessage",
                    description: "Forbidden: bot was blocked by the user".to_string(),
                });
            }
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn answer_callback(
            &self,
            callback_id: &str,
            _text: Option<&str>,
        ) -> TransportResult<()> {
            self.answered.lock().unwrap().push(callback_id.to_string());
            Ok(())
        }
    }
}
