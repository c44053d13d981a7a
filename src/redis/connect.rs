//! Opening Redis connections and shard sets.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use futures::future::join_all;
use tracing::{info, warn};

use super::RedisClient;
use crate::config::{RedisConfig, RedisEndpoint, RedisShardConfig};
use crate::error::{Result, StorageError};
use crate::shard::{
    validate_keys, Connection, ResourceHandle, Selector, ShardSet, SINGLE_KEY,
};

fn validate_endpoint(key: &str, endpoint: &RedisEndpoint) -> Result<()> {
    let missing = |field| StorageError::MissingConnectionParam {
        key: key.to_string(),
        field,
    };
    if endpoint.address.is_empty() {
        return Err(missing("address"));
    }
    if endpoint.port == 0 {
        return Err(missing("port"));
    }
    Ok(())
}

fn connection_info(endpoint: &RedisEndpoint) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(endpoint.address.clone(), endpoint.port),
        redis: RedisConnectionInfo {
            db: endpoint.db,
            password: endpoint.password.clone(),
            ..Default::default()
        },
    }
}

async fn open(key: &str, endpoint: &RedisEndpoint, timeout: Duration) -> Result<ConnectionManager> {
    validate_endpoint(key, endpoint)?;

    let client = Client::open(connection_info(endpoint))?;
    let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| StorageError::DeadlineExceeded)??;

    let _: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut conn))
        .await
        .map_err(|_| StorageError::DeadlineExceeded)??;

    info!(
        shard = %key,
        address = %endpoint.address,
        port = endpoint.port,
        db = endpoint.db,
        "Connected to Redis"
    );
    Ok(conn)
}

/// Open a single connection and check it with `PING`.
pub async fn connect(endpoint: &RedisEndpoint, timeout: Duration) -> Result<ConnectionManager> {
    open(SINGLE_KEY, endpoint, timeout).await
}

/// Open one connection per shard.
///
/// Keys and endpoints are validated before any connection attempt. If a
/// later shard fails to connect, the connections already opened are closed.
pub async fn connect_shards(
    shards: &[RedisShardConfig],
    selector: Selector<ConnectionManager>,
    timeout: Duration,
) -> Result<ShardSet<ConnectionManager>> {
    validate_keys(shards.iter().map(|s| s.key.as_str()))?;
    for shard in shards {
        validate_endpoint(&shard.key, &shard.endpoint)?;
    }

    let mut handles = Vec::with_capacity(shards.len());
    for shard in shards {
        match open(&shard.key, &shard.endpoint, timeout).await {
            Ok(conn) => handles.push(
                ResourceHandle::new(shard.key.clone(), conn)
                    .with_conditions(shard.conditions.iter().cloned()),
            ),
            Err(e) => {
                for result in join_all(handles.iter().map(|h| Connection::close(h.conn()))).await {
                    if let Err(close_err) = result {
                        warn!(error = %close_err, "Failed to close shard connection");
                    }
                }
                return Err(e);
            }
        }
    }

    ShardSet::new(handles, selector)
}

/// Build a client from configuration.
pub async fn connect_from_config(config: &RedisConfig) -> Result<RedisClient> {
    let timeout = config.connect_timeout();
    if config.shards.is_empty() {
        Ok(RedisClient::single(connect(&config.endpoint, timeout).await?))
    } else {
        let selector = Selector::from_kind(config.selector);
        Ok(RedisClient::sharded(
            connect_shards(&config.shards, selector, timeout).await?,
        ))
    }
}
