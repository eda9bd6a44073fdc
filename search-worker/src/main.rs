use std::sync::Arc;

use anyhow::Context;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use search_worker::job::{SearchJob, SearchJobConfig};
use search_worker::search::HttpChannelSearchClient;
use search_worker::transport::BotApiTransport;
use search_worker::types::Environment;
use subscription_storage::migrations::{registered_migrations, Migrator};
use subscription_storage::store::DynamoDbStore;
use subscription_storage::{EntityCache, SearchResultRepository, SubscriptionRepository};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let environment = Environment::from_env();

    // Use JSON format for staging/production, regular format for development
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(environment.tracing_level()).into())
        .from_env_lossy();
    match environment {
        Environment::Production | Environment::Staging => {
            fmt().json().with_env_filter(env_filter).init();
        }
        Environment::Development => {
            fmt().with_env_filter(env_filter).init();
        }
    }

    info!("Starting search worker in {:?} environment", environment);

    let tables = environment.table_config();
    let dynamodb_client = Arc::new(DynamoDbClient::new(&environment.aws_config().await));
    let store = Arc::new(DynamoDbStore::new(dynamodb_client));

    // An ambiguous or half-applied schema history must stop the process
    let report = Migrator::new(store.clone(), tables.clone())
        .run(&registered_migrations())
        .await
        .context("Failed to run migrations")?;
    info!(applied = ?report.applied, skipped = ?report.skipped, "✅ Migrations up to date");

    let cache = Arc::new(EntityCache::new());
    let subscriptions = Arc::new(SubscriptionRepository::new(store.clone(), cache, &tables));
    let search_results = Arc::new(SearchResultRepository::new(store, &tables));

    let channel_search = Arc::new(
        HttpChannelSearchClient::new(environment.channel_search_url())
            .context("Failed to create channel search client")?,
    );
    let transport = Arc::new(
        BotApiTransport::new(environment.bot_api_url(), environment.bot_token())
            .context("Failed to create bot API transport")?,
    );

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
                signal_token.cancel();
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
    });

    let config = SearchJobConfig {
        interval: environment.search_interval(),
        backoff: environment.search_backoff(),
        ..SearchJobConfig::default()
    };
    SearchJob::new(
        subscriptions,
        search_results,
        channel_search,
        transport,
        config,
        shutdown_token,
    )
    .start()
    .await;

    info!("✅ Search worker shutdown complete");
    Ok(())
}
