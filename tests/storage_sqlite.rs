//! SQLite storage integration tests.
//!
//! Run with: cargo test --test storage_sqlite --features sqlite
//!
//! Each test works on fresh on-disk databases in a temp directory, so shards
//! are real separate files. No external dependencies required.

use sqlx::AnyPool;
use sqlx::Row;
use tempfile::TempDir;
use tessera::config::PoolConfig;
use tessera::shard::{with_shard_key, ResourceHandle, Selector, ShardSet};
use tessera::sql::{connect, SqlClient};
use tessera::transactor::{atomic, Transactor};
use tessera::{Context, StorageError};

const CREATE_KV: &str = "CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT NOT NULL)";

async fn open(dir: &TempDir, name: &str) -> AnyPool {
    let path = dir.path().join(format!("{name}.db"));
    connect(
        &format!("sqlite://{}?mode=rwc", path.display()),
        &PoolConfig::default(),
    )
    .await
    .expect("Failed to open SQLite database")
}

async fn single_client(dir: &TempDir) -> SqlClient {
    let client = SqlClient::single(open(dir, "single").await);
    client
        .execute(&Context::background(), sqlx::query(CREATE_KV))
        .await
        .expect("Failed to create table");
    client
}

async fn sharded_client(dir: &TempDir, keys: &[&str]) -> SqlClient {
    let mut handles = Vec::new();
    for key in keys {
        handles.push(ResourceHandle::new(*key, open(dir, key).await));
    }
    let set = ShardSet::new(handles, Selector::by_shard_key()).expect("Failed to build shard set");
    SqlClient::sharded(set).with_query_log(true)
}

async fn insert(client: &SqlClient, ctx: &Context, k: &str, v: &str) -> tessera::Result<()> {
    client
        .execute(
            ctx,
            sqlx::query("INSERT INTO kv (k, v) VALUES (?, ?)")
                .bind(k.to_string())
                .bind(v.to_string()),
        )
        .await
        .map(|_| ())
}

async fn count(client: &SqlClient, ctx: &Context) -> i64 {
    let (n,): (i64,) = client
        .fetch_one_as(ctx, sqlx::query_as("SELECT COUNT(*) FROM kv"))
        .await
        .expect("Failed to count rows");
    n
}

#[tokio::test]
async fn test_commit_makes_rows_visible() {
    let dir = TempDir::new().unwrap();
    let client = single_client(&dir).await;
    let transactor = client.transactor();
    let ctx = Context::background();

    let tx_ctx = transactor.begin_ctx(&ctx).await.unwrap();
    insert(&client, &tx_ctx, "a", "1").await.unwrap();
    insert(&client, &tx_ctx, "b", "2").await.unwrap();
    assert_eq!(count(&client, &tx_ctx).await, 2);

    transactor.commit_ctx(&tx_ctx).await.unwrap();
    assert_eq!(count(&client, &ctx).await, 2);
}

#[tokio::test]
async fn test_rollback_discards_rows() {
    let dir = TempDir::new().unwrap();
    let client = single_client(&dir).await;
    let transactor = client.transactor();
    let ctx = Context::background();

    let tx_ctx = transactor.begin_ctx(&ctx).await.unwrap();
    insert(&client, &tx_ctx, "a", "1").await.unwrap();
    transactor.rollback_ctx(&tx_ctx).await.unwrap();

    assert_eq!(count(&client, &ctx).await, 0);
}

#[tokio::test]
async fn test_statement_after_commit_reports_done() {
    let dir = TempDir::new().unwrap();
    let client = single_client(&dir).await;
    let transactor = client.transactor();

    let tx_ctx = transactor.begin_ctx(&Context::background()).await.unwrap();
    transactor.commit_ctx(&tx_ctx).await.unwrap();

    let err = insert(&client, &tx_ctx, "late", "x").await.unwrap_err();
    assert!(matches!(err, StorageError::TransactionDone));
    let err = transactor.rollback_ctx(&tx_ctx).await.unwrap_err();
    assert!(matches!(err, StorageError::TransactionDone));
}

#[tokio::test]
async fn test_atomic_rolls_back_failed_unit() {
    let dir = TempDir::new().unwrap();
    let client = single_client(&dir).await;
    let transactor = client.transactor();
    let ctx = Context::background();

    let result = atomic(&transactor, &ctx, |tx_ctx| {
        let client = client.clone();
        async move {
            insert(&client, &tx_ctx, "a", "1").await?;
            // Primary key violation.
            insert(&client, &tx_ctx, "a", "2").await
        }
    })
    .await;

    assert!(matches!(result, Err(StorageError::Database(_))));
    assert_eq!(count(&client, &ctx).await, 0);
}

#[tokio::test]
async fn test_nested_atomic_joins_outer_transaction() {
    let dir = TempDir::new().unwrap();
    let client = single_client(&dir).await;
    let transactor = client.transactor();
    let ctx = Context::background();

    let outer = transactor.begin_ctx(&ctx).await.unwrap();
    atomic(&transactor, &outer, |tx_ctx| {
        let client = client.clone();
        async move { insert(&client, &tx_ctx, "inner", "1").await }
    })
    .await
    .unwrap();

    // The inner unit did not commit; rolling back the outer one drops its row.
    transactor.rollback_ctx(&outer).await.unwrap();
    assert_eq!(count(&client, &ctx).await, 0);
}

#[tokio::test]
async fn test_missing_row_is_not_found() {
    let dir = TempDir::new().unwrap();
    let client = single_client(&dir).await;

    let err = client
        .fetch_one(
            &Context::background(),
            sqlx::query("SELECT v FROM kv WHERE k = ?").bind("absent".to_string()),
        )
        .await
        .err()
        .expect("Missing row should fail");
    assert!(err.is_not_found());

    let row = client
        .fetch_optional(
            &Context::background(),
            sqlx::query("SELECT v FROM kv WHERE k = ?").bind("absent".to_string()),
        )
        .await
        .unwrap();
    assert!(row.is_none());
}

#[tokio::test]
async fn test_fetch_all_reads_rows() {
    let dir = TempDir::new().unwrap();
    let client = single_client(&dir).await;
    let ctx = Context::background();
    insert(&client, &ctx, "a", "1").await.unwrap();
    insert(&client, &ctx, "b", "2").await.unwrap();

    let rows = client
        .fetch_all(&ctx, sqlx::query("SELECT k, v FROM kv ORDER BY k"))
        .await
        .unwrap();
    let values: Vec<String> = rows.iter().map(|r| r.get::<String, _>("v")).collect();
    assert_eq!(values, ["1", "2"]);
}

#[tokio::test]
async fn test_cancelled_context_fails_without_io() {
    let dir = TempDir::new().unwrap();
    let client = single_client(&dir).await;
    let (ctx, cancel) = Context::background().with_cancel();
    cancel.cancel();

    let err = insert(&client, &ctx, "a", "1").await.unwrap_err();
    assert!(matches!(err, StorageError::Cancelled));
    assert_eq!(count(&client, &Context::background()).await, 0);
}

#[tokio::test]
async fn test_sharded_calls_follow_shard_key() {
    let dir = TempDir::new().unwrap();
    let client = sharded_client(&dir, &["eu", "us"]).await;
    client
        .each_shard(|shard| async move {
            shard
                .execute(&Context::background(), sqlx::query(CREATE_KV))
                .await
                .map(|_| ())
        })
        .await
        .unwrap();

    let eu = with_shard_key(&Context::background(), "eu");
    let us = with_shard_key(&Context::background(), "us");
    insert(&client, &eu, "a", "1").await.unwrap();
    insert(&client, &eu, "b", "2").await.unwrap();
    insert(&client, &us, "c", "3").await.unwrap();

    assert_eq!(count(&client, &eu).await, 2);
    assert_eq!(count(&client, &us).await, 1);
}

#[tokio::test]
async fn test_sharded_call_without_route_is_not_selected() {
    let dir = TempDir::new().unwrap();
    let client = sharded_client(&dir, &["eu", "us"]).await;

    let err = client
        .execute(&Context::background(), sqlx::query(CREATE_KV))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ConnectionNotSelected));
}

#[tokio::test]
async fn test_sharded_transaction_stays_on_its_shard() {
    let dir = TempDir::new().unwrap();
    let client = sharded_client(&dir, &["eu", "us"]).await;
    client
        .each_shard_async(
            |shard| async move {
                shard
                    .execute(&Context::background(), sqlx::query(CREATE_KV))
                    .await
                    .map(|_| ())
            },
            None,
        )
        .await
        .unwrap();

    let transactor = client.transactor();
    let us = with_shard_key(&Context::background(), "us");
    let tx_ctx = transactor.begin_ctx(&us).await.unwrap();
    insert(&client, &tx_ctx, "a", "1").await.unwrap();
    transactor.commit_ctx(&tx_ctx).await.unwrap();

    let eu = with_shard_key(&Context::background(), "eu");
    assert_eq!(count(&client, &us).await, 1);
    assert_eq!(count(&client, &eu).await, 0);
}

#[tokio::test]
async fn test_each_shard_stops_after_failure() {
    let dir = TempDir::new().unwrap();
    let client = sharded_client(&dir, &["a", "b", "c"]).await;

    // Only shard "a" gets the table, so the insert fails on "b".
    let a = with_shard_key(&Context::background(), "a");
    client.execute(&a, sqlx::query(CREATE_KV)).await.unwrap();

    let result = client
        .each_shard(|shard| async move { insert(&shard, &Context::background(), "k", "v").await })
        .await;
    assert!(matches!(result, Err(StorageError::Database(_))));

    // "c" was never reached, so creating its table now leaves it empty.
    let c = with_shard_key(&Context::background(), "c");
    client.execute(&c, sqlx::query(CREATE_KV)).await.unwrap();
    assert_eq!(count(&client, &c).await, 0);
    assert_eq!(count(&client, &a).await, 1);
}

#[tokio::test]
async fn test_each_shard_async_reaches_every_shard() {
    let dir = TempDir::new().unwrap();
    let client = sharded_client(&dir, &["a", "b", "c"]).await;

    let b = with_shard_key(&Context::background(), "b");
    let c = with_shard_key(&Context::background(), "c");
    client.execute(&b, sqlx::query(CREATE_KV)).await.unwrap();
    client.execute(&c, sqlx::query(CREATE_KV)).await.unwrap();

    // "a" has no table and fails; "b" and "c" still get their rows.
    let err = client
        .each_shard_async(
            |shard| async move { insert(&shard, &Context::background(), "k", "v").await },
            Some(1),
        )
        .await
        .unwrap_err();
    assert_eq!(err.errors().len(), 1);

    assert_eq!(count(&client, &b).await, 1);
    assert_eq!(count(&client, &c).await, 1);
}

#[tokio::test]
async fn test_single_client_rejects_fan_out() {
    let dir = TempDir::new().unwrap();
    let client = single_client(&dir).await;

    let result = client.each_shard(|_| async { Ok(()) }).await;
    assert!(matches!(result, Err(StorageError::NotSharded)));
}

#[tokio::test]
async fn test_close_is_repeatable() {
    let dir = TempDir::new().unwrap();
    let client = sharded_client(&dir, &["a", "b"]).await;
    client.close().await.unwrap();
    client.close().await.unwrap();
}
