//! Redis client.
//!
//! Writes join the ambient Redis transaction when the context carries one;
//! reads and commands whose reply is needed right away always go straight
//! to the shard.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue, Pipeline, ToRedisArgs};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::context::{is_no_log, Context};
use crate::error::{Result, StorageError};
use crate::shard::{self, Connection, ResourceHandle, ShardSet, Topology};
use crate::transactor::{lookup_transaction, AmbientTransactor};

pub mod connect;
pub mod transaction;

pub use connect::{connect, connect_from_config, connect_shards};
pub use transaction::{RedisTx, RedisTxKind};

const SCAN_BATCH: usize = 1000;

#[async_trait]
impl Connection for ConnectionManager {
    /// The multiplexed connection closes once its last clone is dropped.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn require_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::EmptyKey);
    }
    Ok(())
}

/// Milliseconds for an expiry argument, saturating on overflow.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Relative expiries round up to 1ms, since Redis rejects `PX 0`.
fn expiry_millis(ttl: Duration) -> u64 {
    millis(ttl).max(1)
}

/// Redis client, single or sharded.
#[derive(Clone)]
pub struct RedisClient {
    topology: Topology<ConnectionManager>,
}

impl RedisClient {
    pub fn single(conn: ConnectionManager) -> Self {
        Self::from_topology(Topology::single(conn))
    }

    pub fn sharded(set: ShardSet<ConnectionManager>) -> Self {
        Self::from_topology(Topology::sharded(set))
    }

    pub fn from_topology(topology: Topology<ConnectionManager>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Topology<ConnectionManager> {
        &self.topology
    }

    pub fn is_sharded(&self) -> bool {
        self.topology.is_sharded()
    }

    /// Connection of the shard serving `ctx`, for commands the client
    /// doesn't wrap.
    pub fn connection(&self, ctx: &Context) -> Result<ConnectionManager> {
        ctx.check()?;
        Ok(self.topology.resolve(ctx)?.conn().clone())
    }

    /// A fresh pipeline with the connection to run it on.
    pub fn pipeline(&self, ctx: &Context) -> Result<(ConnectionManager, Pipeline)> {
        Ok((self.connection(ctx)?, redis::pipe()))
    }

    /// Like [`pipeline`](Self::pipeline), wrapped in `MULTI`/`EXEC`.
    pub fn tx_pipeline(&self, ctx: &Context) -> Result<(ConnectionManager, Pipeline)> {
        let (conn, mut pipe) = self.pipeline(ctx)?;
        pipe.atomic();
        Ok((conn, pipe))
    }

    pub fn transactor(&self) -> AmbientTransactor<RedisClient> {
        AmbientTransactor::new(self.clone())
    }

    pub async fn close(&self) -> Result<()> {
        self.topology.close().await
    }

    /// Run a read command on the shard serving `ctx`.
    async fn read<T: FromRedisValue>(&self, ctx: &Context, cmd: Cmd) -> Result<T> {
        let mut conn = self.route(ctx, &cmd)?;
        ctx.run(async move { cmd.query_async(&mut conn).await.map_err(StorageError::from) })
            .await
    }

    /// Run a write command, or queue it on the ambient transaction.
    async fn write(&self, ctx: &Context, cmd: Cmd) -> Result<()> {
        let mut conn = self.route(ctx, &cmd)?;
        if let Some(tx) = lookup_transaction::<RedisTxKind>(ctx) {
            return tx.push(cmd).await;
        }
        ctx.run(async move {
            let _: () = cmd.query_async(&mut conn).await?;
            Ok::<_, StorageError>(())
        })
        .await
    }

    fn route(&self, ctx: &Context, cmd: &Cmd) -> Result<ConnectionManager> {
        ctx.check()?;
        let handle = self.topology.resolve(ctx)?;
        if !is_no_log(ctx) {
            let name = cmd
                .args_iter()
                .next()
                .map(|arg| match arg {
                    redis::Arg::Simple(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    redis::Arg::Cursor => "CURSOR".to_string(),
                })
                .unwrap_or_default();
            debug!(shard = %handle.key(), command = %name, "Executing Redis command");
        }
        Ok(handle.conn().clone())
    }

    /// All keys matching `pattern` (`KEYS`).
    pub async fn keys(&self, ctx: &Context, pattern: &str) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("KEYS");
        cmd.arg(pattern);
        self.read(ctx, cmd).await
    }

    /// All keys matching `pattern`, iterated with `SCAN` instead of `KEYS`.
    pub async fn scan(&self, ctx: &Context, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) = self.read(ctx, cmd).await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    /// Delete keys. Empty names are skipped; nothing left is a no-op.
    pub async fn delete(&self, ctx: &Context, keys: &[&str]) -> Result<()> {
        let keys: Vec<&str> = keys.iter().copied().filter(|k| !k.is_empty()).collect();
        if keys.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.write(ctx, cmd).await
    }

    pub async fn rename(&self, ctx: &Context, old: &str, new: &str) -> Result<()> {
        if old.is_empty() {
            return Err(StorageError::InvalidKey { which: "old" });
        }
        if new.is_empty() {
            return Err(StorageError::InvalidKey { which: "new" });
        }
        let mut cmd = redis::cmd("RENAME");
        cmd.arg(old).arg(new);
        self.write(ctx, cmd).await
    }

    /// Reset the time to live of `key`.
    pub async fn refresh(&self, ctx: &Context, key: &str, ttl: Duration) -> Result<()> {
        require_key(key)?;
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(expiry_millis(ttl));
        self.write(ctx, cmd).await
    }

    /// Expire `key` at an absolute time.
    pub async fn refresh_at(&self, ctx: &Context, key: &str, at: SystemTime) -> Result<()> {
        require_key(key)?;
        let at = millis(at.duration_since(UNIX_EPOCH).unwrap_or_default());
        let mut cmd = redis::cmd("PEXPIREAT");
        cmd.arg(key).arg(at);
        self.write(ctx, cmd).await
    }

    /// Remaining time to live; `None` for a key without expiry.
    pub async fn ttl(&self, ctx: &Context, key: &str) -> Result<Option<Duration>> {
        require_key(key)?;
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let millis: i64 = self.read(ctx, cmd).await?;
        match millis {
            -2 => Err(StorageError::NotFound(key.to_string())),
            ms if ms < 0 => Ok(None),
            ms => Ok(Some(Duration::from_millis(ms as u64))),
        }
    }

    /// Set `key`, with an expiry when `ttl` is given.
    pub async fn set<V>(&self, ctx: &Context, key: &str, value: V, ttl: Option<Duration>) -> Result<()>
    where
        V: ToRedisArgs,
    {
        require_key(key)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl.filter(|t| !t.is_zero()) {
            cmd.arg("PX").arg(expiry_millis(ttl));
        }
        self.write(ctx, cmd).await
    }

    /// Set `key` only if it doesn't exist. Returns whether it was set.
    ///
    /// Never queued, since the caller needs the reply.
    pub async fn set_nx<V>(
        &self,
        ctx: &Context,
        key: &str,
        value: V,
        ttl: Option<Duration>,
    ) -> Result<bool>
    where
        V: ToRedisArgs,
    {
        require_key(key)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl.filter(|t| !t.is_zero()) {
            cmd.arg("PX").arg(expiry_millis(ttl));
        }
        let reply: Option<String> = self.read(ctx, cmd).await?;
        Ok(reply.is_some())
    }

    pub async fn get(&self, ctx: &Context, key: &str) -> Result<String> {
        self.get_value::<String>(ctx, key).await
    }

    pub async fn get_bytes(&self, ctx: &Context, key: &str) -> Result<Vec<u8>> {
        self.get_value::<Vec<u8>>(ctx, key).await
    }

    pub async fn get_int(&self, ctx: &Context, key: &str) -> Result<i64> {
        self.get_value::<i64>(ctx, key).await
    }

    /// Decode the JSON stored at `key`.
    pub async fn parse<T: DeserializeOwned>(&self, ctx: &Context, key: &str) -> Result<T> {
        let raw = self.get_bytes(ctx, key).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn get_value<T: FromRedisValue>(&self, ctx: &Context, key: &str) -> Result<T> {
        require_key(key)?;
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<T> = self.read(ctx, cmd).await?;
        value.ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    /// Values for `keys` in order, `None` where a key is missing.
    pub async fn mget(&self, ctx: &Context, keys: &[&str]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("MGET");
        cmd.arg(keys);
        self.read(ctx, cmd).await
    }

    pub async fn exists(&self, ctx: &Context, key: &str) -> Result<bool> {
        require_key(key)?;
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.read(ctx, cmd).await
    }

    /// Set hash fields. An empty field list is a no-op.
    pub async fn hset<F, V>(&self, ctx: &Context, key: &str, fields: &[(F, V)]) -> Result<()>
    where
        F: ToRedisArgs,
        V: ToRedisArgs,
    {
        require_key(key)?;
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        self.write(ctx, cmd).await
    }

    pub async fn hget(&self, ctx: &Context, key: &str, field: &str) -> Result<String> {
        require_key(key)?;
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        let value: Option<String> = self.read(ctx, cmd).await?;
        value.ok_or_else(|| StorageError::NotFound(format!("{key}.{field}")))
    }

    pub async fn hget_all(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<std::collections::HashMap<String, String>> {
        require_key(key)?;
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.read(ctx, cmd).await
    }

    /// Delete hash fields. An empty field list is a no-op.
    pub async fn hdel(&self, ctx: &Context, key: &str, fields: &[&str]) -> Result<()> {
        require_key(key)?;
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(fields);
        self.write(ctx, cmd).await
    }

    pub async fn hexists(&self, ctx: &Context, key: &str, field: &str) -> Result<bool> {
        require_key(key)?;
        let mut cmd = redis::cmd("HEXISTS");
        cmd.arg(key).arg(field);
        self.read(ctx, cmd).await
    }

    /// Increment a hash field and return the new value. Never queued.
    pub async fn hincr_by(&self, ctx: &Context, key: &str, field: &str, delta: i64) -> Result<i64> {
        require_key(key)?;
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(key).arg(field).arg(delta);
        self.read(ctx, cmd).await
    }

    pub async fn hkeys(&self, ctx: &Context, key: &str) -> Result<Vec<String>> {
        require_key(key)?;
        let mut cmd = redis::cmd("HKEYS");
        cmd.arg(key);
        self.read(ctx, cmd).await
    }

    pub async fn hlen(&self, ctx: &Context, key: &str) -> Result<usize> {
        require_key(key)?;
        let mut cmd = redis::cmd("HLEN");
        cmd.arg(key);
        self.read(ctx, cmd).await
    }

    fn for_shard(handle: ResourceHandle<ConnectionManager>) -> Self {
        Self::from_topology(Topology::Single(handle))
    }

    /// Run `f` against each shard in order, stopping at the first error.
    pub async fn each_shard<F, Fut>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(RedisClient) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let shards = self.topology.shards()?;
        shard::each_shard(shards, |handle| f(Self::for_shard(handle))).await
    }

    /// Run `f` against every shard concurrently, at most `limit` at a time.
    pub async fn each_shard_async<F, Fut>(&self, f: F, limit: Option<usize>) -> Result<()>
    where
        F: Fn(RedisClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let shards = self.topology.shards()?;
        shard::each_shard_async(shards, move |handle| f(Self::for_shard(handle)), limit).await
    }
}
