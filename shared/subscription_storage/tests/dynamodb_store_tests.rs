//! Runs the repositories against `DynamoDB` on LocalStack.
//!
//! The tests run when `LOCALSTACK_ENDPOINT` is set (CI sets it to `http://localhost:4566`)
//! and return early otherwise.

mod common;

use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use common::{channel, matches, user};
use pretty_assertions::assert_eq;
use subscription_storage::migrations::{registered_migrations, Migrator};
use subscription_storage::models::ChannelUser;
use subscription_storage::store::DynamoDbStore;
use subscription_storage::{
    EntityCache, MergeOutcome, SearchResultRepository, SearchUpdate, SubscriptionRepository,
    TableConfig,
};
use uuid::Uuid;

/// Test configuration for LocalStack
const LOCALSTACK_ENDPOINT_VAR: &str = "LOCALSTACK_ENDPOINT";
const TEST_REGION: &str = "us-east-1";

/// Test context that deletes its tables on drop
struct TestContext {
    dynamodb_client: Arc<DynamoDbClient>,
    tables: TableConfig,
    subscriptions: SubscriptionRepository,
    search_results: SearchResultRepository,
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let client = self.dynamodb_client.clone();
        let tables = [
            self.tables.channel_users.clone(),
            self.tables.search_results.clone(),
            self.tables.migration_history.clone(),
        ];

        let handle = tokio::runtime::Handle::try_current();
        if let Ok(handle) = handle {
            handle.spawn(async move {
                for table in tables {
                    let _ = client.delete_table().table_name(&table).send().await;
                }
            });
        }
    }
}

async fn setup_test() -> Option<TestContext> {
    let Ok(endpoint) = std::env::var(LOCALSTACK_ENDPOINT_VAR) else {
        eprintln!("{LOCALSTACK_ENDPOINT_VAR} is not set, skipping LocalStack test");
        return None;
    };

    let credentials = Credentials::from_keys(
        "test", // AWS_ACCESS_KEY_ID
        "test", // AWS_SECRET_ACCESS_KEY
        None,   // no session token
    );
    let config = aws_config::defaults(BehaviorVersion::latest())
        .endpoint_url(endpoint)
        .region(Region::new(TEST_REGION))
        .credentials_provider(credentials)
        .load()
        .await;

    let dynamodb_client = Arc::new(DynamoDbClient::new(&config));
    let store = Arc::new(DynamoDbStore::new(dynamodb_client.clone()));
    let tables = TableConfig::prefixed(&format!("test-{}-", Uuid::new_v4()));

    Migrator::new(store.clone(), tables.clone())
        .run(&registered_migrations())
        .await
        .expect("Failed to migrate");

    Some(TestContext {
        subscriptions: SubscriptionRepository::new(
            store.clone(),
            Arc::new(EntityCache::disabled()),
            &tables,
        )
        .with_page_size(2),
        search_results: SearchResultRepository::new(store, &tables),
        dynamodb_client,
        tables,
    })
}

#[tokio::test]
async fn test_subscription_lifecycle() {
    let Some(ctx) = setup_test().await else {
        return;
    };

    for channel_id in [30, 10, 20] {
        assert!(ctx
            .subscriptions
            .subscribe(&user(1), &channel(channel_id))
            .await
            .unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(!ctx.subscriptions.subscribe(&user(1), &channel(10)).await.unwrap());

    let first = ctx.subscriptions.list_channels(1, None).await.unwrap();
    let ids: Vec<i64> = first.items.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![30, 10]);
    assert_eq!(first.pages_count, 2);

    ctx.subscriptions
        .add_phrases(&ChannelUser::new(10, 1).with_phrases(["a", "b"]))
        .await
        .unwrap();
    ctx.subscriptions.remove_phrase(10, 1, "a").await.unwrap();
    let with_phrases = ctx.subscriptions.list_all_subscriptions(true).await.unwrap();
    assert_eq!(with_phrases.len(), 1);
    assert_eq!(with_phrases[0].channel.id, 10);

    ctx.subscriptions.remove_phrase(10, 1, "b").await.unwrap();
    assert!(ctx.subscriptions.list_all_subscriptions(true).await.unwrap().is_empty());

    ctx.subscriptions.remove_subscription(30, 1).await.unwrap();
    assert!(!ctx.subscriptions.exists(30, 1).await.unwrap());
}

#[tokio::test]
async fn test_merge_transaction() {
    let Some(ctx) = setup_test().await else {
        return;
    };
    ctx.subscriptions.subscribe(&user(1), &channel(7)).await.unwrap();

    let update = |last_message_id, ids: &[i64]| SearchUpdate {
        channel_id: 7,
        user_id: 1,
        last_message_id,
        results: vec![matches("rust", ids)],
    };

    assert_eq!(
        ctx.search_results
            .merge_search_results(update(2, &[1, 2]))
            .await
            .unwrap(),
        MergeOutcome::Created
    );
    assert_eq!(
        ctx.search_results
            .merge_search_results(update(3, &[2, 3]))
            .await
            .unwrap(),
        MergeOutcome::Merged
    );
    assert_eq!(
        ctx.search_results
            .merge_search_results(update(4, &[3]))
            .await
            .unwrap(),
        MergeOutcome::WatermarkOnly
    );

    let document = ctx
        .search_results
        .get_search_results(7, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.version_number, 2);
    assert_eq!(document.search_results, vec![matches("rust", &[1, 2, 3])]);

    let entries = ctx.subscriptions.list_all_subscriptions(false).await.unwrap();
    assert_eq!(entries[0].last_message, Some(4));
}
