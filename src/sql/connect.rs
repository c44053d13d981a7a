//! Opening SQL pools and shard sets.

use futures::future::join_all;
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;
use tracing::{info, warn};

use super::SqlClient;
use crate::config::{PoolConfig, SqlConfig, SqlShardConfig};
use crate::error::{Result, StorageError};
use crate::shard::{
    validate_keys, Connection, ResourceHandle, Selector, ShardSet, SINGLE_KEY,
};

/// Scheme of a connection URL, safe to log.
fn driver(url: &str) -> &str {
    url.split(':').next().unwrap_or_default()
}

async fn open_pool(key: &str, url: &str, pool: &PoolConfig) -> Result<AnyPool> {
    if url.is_empty() {
        return Err(StorageError::MissingConnectionParam {
            key: key.to_string(),
            field: "url",
        });
    }

    install_default_drivers();
    let options = AnyPoolOptions::new()
        .max_connections(pool.max_connections)
        .min_connections(pool.min_connections)
        .max_lifetime(pool.max_lifetime())
        .idle_timeout(pool.idle_timeout())
        .acquire_timeout(pool.connect_timeout());

    let conn = tokio::time::timeout(pool.connect_timeout(), options.connect(url))
        .await
        .map_err(|_| StorageError::DeadlineExceeded)??;

    info!(shard = %key, driver = %driver(url), "Connected to SQL database");
    Ok(conn)
}

/// Open a single pool.
pub async fn connect(url: &str, pool: &PoolConfig) -> Result<AnyPool> {
    open_pool(SINGLE_KEY, url, pool).await
}

/// Open one pool per shard.
///
/// Keys and URLs are validated before any connection attempt. If a later
/// shard fails to connect, the pools already opened are closed.
pub async fn connect_shards(
    shards: &[SqlShardConfig],
    selector: Selector<AnyPool>,
    pool: &PoolConfig,
) -> Result<ShardSet<AnyPool>> {
    validate_keys(shards.iter().map(|s| s.key.as_str()))?;
    if let Some(shard) = shards.iter().find(|s| s.url.is_empty()) {
        return Err(StorageError::MissingConnectionParam {
            key: shard.key.clone(),
            field: "url",
        });
    }

    let mut handles = Vec::with_capacity(shards.len());
    for shard in shards {
        match open_pool(&shard.key, &shard.url, pool).await {
            Ok(conn) => handles.push(
                ResourceHandle::new(shard.key.clone(), conn)
                    .with_conditions(shard.conditions.iter().cloned()),
            ),
            Err(e) => {
                for result in join_all(handles.iter().map(|h| Connection::close(h.conn()))).await {
                    if let Err(close_err) = result {
                        warn!(error = %close_err, "Failed to close shard pool");
                    }
                }
                return Err(e);
            }
        }
    }

    ShardSet::new(handles, selector)
}

/// Build a client from configuration.
pub async fn connect_from_config(config: &SqlConfig) -> Result<SqlClient> {
    let client = if config.shards.is_empty() {
        SqlClient::single(connect(&config.url, &config.pool).await?)
    } else {
        let selector = Selector::from_kind(config.selector);
        SqlClient::sharded(connect_shards(&config.shards, selector, &config.pool).await?)
    };

    Ok(client
        .with_query_log(config.log_queries)
        .with_tx_options(config.transaction.clone()))
}
