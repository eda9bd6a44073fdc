//! Environment configuration for different deployment stages

use std::env;
use std::time::Duration;

use aws_config::{retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion};
use subscription_storage::TableConfig;
use tracing::Level;

/// Default interval between search cycles
const DEFAULT_SEARCH_INTERVAL_SECS: u64 = 60;
/// Default wait after a failed search cycle
const DEFAULT_SEARCH_BACKOFF_SECS: u64 = 10;

/// Application environment configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    /// Production environment
    Production,
    /// Staging environment
    Staging,
    /// Development environment (uses `LocalStack`)
    Development,
}

impl Environment {
    /// Creates an Environment from the `APP_ENV` environment variable
    ///
    /// # Panics
    ///
    /// Panics if `APP_ENV` contains an invalid value
    #[must_use]
    pub fn from_env() -> Self {
        let env = env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .trim()
            .to_lowercase();

        match env.as_str() {
            "production" => Self::Production,
            "staging" => Self::Staging,
            "development" => Self::Development,
            _ => panic!("Invalid environment: {env}"),
        }
    }

    /// Table and index names, each overridable through its own variable
    #[must_use]
    pub fn table_config(&self) -> TableConfig {
        let defaults = TableConfig::default();
        let read = |name: &str, default: String| env::var(name).unwrap_or(default);

        TableConfig {
            channel_users: read("CHANNEL_USERS_TABLE", defaults.channel_users),
            channel_users_user_index: read(
                "CHANNEL_USERS_USER_INDEX",
                defaults.channel_users_user_index,
            ),
            search_results: read("SEARCH_RESULTS_TABLE", defaults.search_results),
            migration_history: read("MIGRATION_HISTORY_TABLE", defaults.migration_history),
        }
    }

    /// Interval between search cycles
    #[must_use]
    pub fn search_interval(&self) -> Duration {
        Duration::from_secs(secs_from_env(
            "SEARCH_INTERVAL_SECS",
            DEFAULT_SEARCH_INTERVAL_SECS,
        ))
    }

    /// Wait after a failed search cycle before trying again
    #[must_use]
    pub fn search_backoff(&self) -> Duration {
        Duration::from_secs(secs_from_env(
            "SEARCH_BACKOFF_SECS",
            DEFAULT_SEARCH_BACKOFF_SECS,
        ))
    }

    /// Base URL of the channel search service
    ///
    /// # Panics
    ///
    /// Panics if the `CHANNEL_SEARCH_URL` environment variable is not set outside development
    #[must_use]
    pub fn channel_search_url(&self) -> String {
        match self {
            Self::Production | Self::Staging => env::var("CHANNEL_SEARCH_URL")
                .expect("CHANNEL_SEARCH_URL environment variable is not set"),
            Self::Development => env::var("CHANNEL_SEARCH_URL")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
        }
    }

    /// Base URL of the chat bot API
    #[must_use]
    pub fn bot_api_url(&self) -> String {
        env::var("BOT_API_URL").unwrap_or_else(|_| "https://api.telegram.org".to_string())
    }

    /// Bot token used by the chat transport
    ///
    /// # Panics
    ///
    /// Panics if the `BOT_TOKEN` environment variable is not set outside development
    #[must_use]
    pub fn bot_token(&self) -> String {
        match self {
            Self::Production | Self::Staging => {
                env::var("BOT_TOKEN").expect("BOT_TOKEN environment variable is not set")
            }
            Self::Development => env::var("BOT_TOKEN").unwrap_or_default(),
        }
    }

    /// Returns the endpoint URL to use for AWS services
    #[must_use]
    pub const fn override_aws_endpoint_url(&self) -> Option<&str> {
        match self {
            // Regular AWS endpoints for production and staging
            Self::Production | Self::Staging => None,
            // LocalStack endpoint for development
            Self::Development => Some("http://localhost:4566"),
        }
    }

    /// AWS configuration with retry and timeout settings
    pub async fn aws_config(&self) -> aws_config::SdkConfig {
        let retry_config = RetryConfig::standard()
            .with_max_attempts(3)
            .with_initial_backoff(Duration::from_millis(50));

        let timeout_config = TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(30))
            .build();

        let mut config_builder = aws_config::load_defaults(BehaviorVersion::latest())
            .await
            .to_builder()
            .retry_config(retry_config)
            .timeout_config(timeout_config);

        if let Some(endpoint_url) = self.override_aws_endpoint_url() {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }

        config_builder.build()
    }

    /// Log level, `TRACING_LEVEL` wins over the per-environment default
    #[must_use]
    pub fn tracing_level(&self) -> Level {
        env::var("TRACING_LEVEL")
            .ok()
            .and_then(|val| val.parse::<Level>().ok())
            .unwrap_or(match self {
                Self::Production | Self::Staging => Level::INFO,
                Self::Development => Level::DEBUG,
            })
    }
}

fn secs_from_env(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(default)
}
