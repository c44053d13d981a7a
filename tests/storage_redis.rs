//! Redis storage integration tests.
//!
//! Run with: cargo test --test storage_redis --features redis -- --ignored --nocapture
//!
//! Requires: REDIS_HOST / REDIS_PORT env vars or Redis on localhost:6379
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tempfile::TempDir;
use tessera::config::{PoolConfig, RedisEndpoint, RedisShardConfig};
use tessera::redis::{connect, connect_shards, RedisClient};
use tessera::shard::{with_shard_key, Selector};
use tessera::sql::SqlClient;
use tessera::transactor::{CompositeTransactor, Transactor};
use tessera::{Context, StorageError};

fn endpoint() -> RedisEndpoint {
    RedisEndpoint {
        address: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: std::env::var("REDIS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379),
        ..Default::default()
    }
}

fn test_prefix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("test_{nanos}")
}

async fn client() -> RedisClient {
    let conn = connect(&endpoint(), Duration::from_secs(5))
        .await
        .expect("Failed to connect to Redis");
    RedisClient::single(conn)
}

/// Two shards on the same server, split by logical database.
async fn sharded_client() -> RedisClient {
    let shards = [("hot", 0), ("cold", 1)].map(|(key, db)| RedisShardConfig {
        key: key.to_string(),
        endpoint: RedisEndpoint { db, ..endpoint() },
        conditions: Vec::new(),
    });
    let set = connect_shards(&shards, Selector::by_shard_key(), Duration::from_secs(5))
        .await
        .expect("Failed to connect Redis shards");
    RedisClient::sharded(set)
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_string_commands() {
    let redis = client().await;
    let ctx = Context::background();
    let key = format!("{}:greeting", test_prefix());

    redis.set(&ctx, &key, "hello", None).await.unwrap();
    assert_eq!(redis.get(&ctx, &key).await.unwrap(), "hello");
    assert!(redis.exists(&ctx, &key).await.unwrap());
    assert_eq!(redis.ttl(&ctx, &key).await.unwrap(), None);

    assert!(!redis.set_nx(&ctx, &key, "again", None).await.unwrap());

    redis.delete(&ctx, &[key.as_str(), ""]).await.unwrap();
    assert!(redis.get(&ctx, &key).await.unwrap_err().is_not_found());
    assert!(redis.ttl(&ctx, &key).await.unwrap_err().is_not_found());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_expiry_and_rename() {
    let redis = client().await;
    let ctx = Context::background();
    let prefix = test_prefix();
    let old = format!("{prefix}:old");
    let new = format!("{prefix}:new");

    redis
        .set(&ctx, &old, 7, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    let ttl = redis.ttl(&ctx, &old).await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(60));

    redis.rename(&ctx, &old, &new).await.unwrap();
    assert_eq!(redis.get_int(&ctx, &new).await.unwrap(), 7);

    redis
        .refresh(&ctx, &new, Duration::from_secs(120))
        .await
        .unwrap();
    assert!(redis.ttl(&ctx, &new).await.unwrap().unwrap() > Duration::from_secs(60));

    let err = redis.rename(&ctx, "", &new).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidKey { which: "old" }));

    redis.delete(&ctx, &[new.as_str()]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_hash_commands() {
    let redis = client().await;
    let ctx = Context::background();
    let key = format!("{}:user", test_prefix());

    redis
        .hset(&ctx, &key, &[("name", "ada"), ("visits", "1")])
        .await
        .unwrap();
    assert_eq!(redis.hget(&ctx, &key, "name").await.unwrap(), "ada");
    assert_eq!(redis.hincr_by(&ctx, &key, "visits", 2).await.unwrap(), 3);
    assert_eq!(redis.hlen(&ctx, &key).await.unwrap(), 2);
    assert!(redis.hexists(&ctx, &key, "visits").await.unwrap());

    redis.hdel(&ctx, &key, &["visits"]).await.unwrap();
    let all = redis.hget_all(&ctx, &key).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(redis
        .hget(&ctx, &key, "visits")
        .await
        .unwrap_err()
        .is_not_found());

    redis.delete(&ctx, &[key.as_str()]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_parse_json() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Session {
        user: String,
        active: bool,
    }

    let redis = client().await;
    let ctx = Context::background();
    let key = format!("{}:session", test_prefix());

    redis
        .set(&ctx, &key, r#"{"user":"ada","active":true}"#, None)
        .await
        .unwrap();
    let session: Session = redis.parse(&ctx, &key).await.unwrap();
    assert_eq!(
        session,
        Session {
            user: "ada".to_string(),
            active: true
        }
    );

    redis.delete(&ctx, &[key.as_str()]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_tx_commit_applies_queued_writes() {
    let redis = client().await;
    let transactor = redis.transactor();
    let ctx = Context::background();
    let prefix = test_prefix();
    let a = format!("{prefix}:a");
    let b = format!("{prefix}:b");

    let tx_ctx = transactor.begin_ctx(&ctx).await.unwrap();
    redis.set(&tx_ctx, &a, "1", None).await.unwrap();
    redis.set(&tx_ctx, &b, "2", None).await.unwrap();

    // Queued, not yet sent.
    assert!(redis.get(&ctx, &a).await.unwrap_err().is_not_found());

    transactor.commit_ctx(&tx_ctx).await.unwrap();
    assert_eq!(redis.get(&ctx, &a).await.unwrap(), "1");
    assert_eq!(redis.get(&ctx, &b).await.unwrap(), "2");

    let keys = redis.scan(&ctx, &format!("{prefix}:*")).await.unwrap();
    assert_eq!(keys.len(), 2);

    redis.delete(&ctx, &[a.as_str(), b.as_str()]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_tx_rollback_discards_queue() {
    let redis = client().await;
    let transactor = redis.transactor();
    let ctx = Context::background();
    let key = format!("{}:discarded", test_prefix());

    let tx_ctx = transactor.begin_ctx(&ctx).await.unwrap();
    redis.set(&tx_ctx, &key, "1", None).await.unwrap();
    transactor.rollback_ctx(&tx_ctx).await.unwrap();

    assert!(redis.get(&ctx, &key).await.unwrap_err().is_not_found());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_empty_tx_commits() {
    let redis = client().await;
    let transactor = redis.transactor();
    let tx_ctx = transactor.begin_ctx(&Context::background()).await.unwrap();
    transactor.commit_ctx(&tx_ctx).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_composite_sql_and_redis() {
    let redis = client().await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("composite.db");
    let pool = tessera::sql::connect(
        &format!("sqlite://{}?mode=rwc", path.display()),
        &PoolConfig::default(),
    )
    .await
    .unwrap();
    let sql = SqlClient::single(pool);
    let ctx = Context::background();
    sql.execute(&ctx, sqlx::query("CREATE TABLE orders (id TEXT PRIMARY KEY)"))
        .await
        .unwrap();

    let transactor = CompositeTransactor::new(vec![
        Arc::new(sql.transactor()) as Arc<dyn Transactor>,
        Arc::new(redis.transactor()),
    ]);
    assert_eq!(transactor.key(), "sql_tx,redis_tx");

    let key = format!("{}:order", test_prefix());
    let tx_ctx = transactor.begin_ctx(&ctx).await.unwrap();
    sql.execute(
        &tx_ctx,
        sqlx::query("INSERT INTO orders (id) VALUES (?)").bind("o-1".to_string()),
    )
    .await
    .unwrap();
    redis.set(&tx_ctx, &key, "o-1", None).await.unwrap();
    transactor.commit_ctx(&tx_ctx).await.unwrap();

    let (n,): (i64,) = sql
        .fetch_one_as(&ctx, sqlx::query_as("SELECT COUNT(*) FROM orders"))
        .await
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(redis.get(&ctx, &key).await.unwrap(), "o-1");

    redis.delete(&ctx, &[key.as_str()]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_sharded_writes_follow_shard_key() {
    let redis = sharded_client().await;
    let hot = with_shard_key(&Context::background(), "hot");
    let cold = with_shard_key(&Context::background(), "cold");
    let key = format!("{}:routed", test_prefix());

    redis.set(&hot, &key, "hot-value", None).await.unwrap();
    assert_eq!(redis.get(&hot, &key).await.unwrap(), "hot-value");
    assert!(redis.get(&cold, &key).await.unwrap_err().is_not_found());

    let err = redis.get(&Context::background(), &key).await.unwrap_err();
    assert!(matches!(err, StorageError::ConnectionNotSelected));

    redis.delete(&hot, &[key.as_str()]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_sharded_tx_commits_on_its_own_shard() {
    let redis = sharded_client().await;
    let transactor = redis.transactor();
    let hot = with_shard_key(&Context::background(), "hot");
    let cold = with_shard_key(&Context::background(), "cold");
    let prefix = test_prefix();
    let a = format!("{prefix}:a");
    let b = format!("{prefix}:b");

    let tx_ctx = transactor.begin_ctx(&cold).await.unwrap();
    redis.set(&tx_ctx, &a, "1", None).await.unwrap();
    redis.set(&tx_ctx, &b, "2", None).await.unwrap();
    assert!(redis.get(&cold, &a).await.unwrap_err().is_not_found());
    transactor.commit_ctx(&tx_ctx).await.unwrap();

    assert_eq!(redis.get(&cold, &a).await.unwrap(), "1");
    assert_eq!(redis.get(&cold, &b).await.unwrap(), "2");
    assert!(!redis.exists(&hot, &a).await.unwrap());
    assert!(!redis.exists(&hot, &b).await.unwrap());

    redis.delete(&cold, &[a.as_str(), b.as_str()]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_sharded_fan_out_reaches_every_shard() {
    let redis = sharded_client().await;
    let key = format!("{}:everywhere", test_prefix());

    let fan_key = key.clone();
    redis
        .each_shard_async(
            move |shard| {
                let key = fan_key.clone();
                async move { shard.set(&Context::background(), &key, "x", None).await }
            },
            Some(2),
        )
        .await
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    redis
        .each_shard(|shard| {
            let key = key.clone();
            let seen = seen.clone();
            async move {
                let ctx = Context::background();
                if shard.exists(&ctx, &key).await? {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                shard.delete(&ctx, &[key.as_str()]).await
            }
        })
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_connect_shards_fails_when_later_shard_unreachable() {
    let shards = [
        RedisShardConfig {
            key: "up".to_string(),
            endpoint: endpoint(),
            conditions: Vec::new(),
        },
        RedisShardConfig {
            key: "down".to_string(),
            endpoint: RedisEndpoint {
                port: 1,
                ..endpoint()
            },
            conditions: Vec::new(),
        },
    ];
    let result = connect_shards(&shards, Selector::by_shard_key(), Duration::from_secs(2)).await;
    assert!(result.is_err());
}
