//! Redis transactions as atomic pipelines.
//!
//! Writes made under an open Redis transaction are queued and sent as one
//! `MULTI`/`EXEC` block on commit. Rollback discards the queue.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, Pipeline};
use tokio::sync::Mutex;
use tracing::debug;

use super::RedisClient;
use crate::context::Context;
use crate::error::{Result, StorageError};
use crate::transactor::{TxHandle, TxKind, TxProvider};

struct Queue {
    pipe: Pipeline,
    len: usize,
}

/// Open Redis transaction bound to one shard.
#[derive(Clone)]
pub struct RedisTx {
    shard: String,
    conn: ConnectionManager,
    queue: Arc<Mutex<Option<Queue>>>,
}

impl fmt::Debug for RedisTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTx").field("shard", &self.shard).finish()
    }
}

impl RedisTx {
    fn new(shard: &str, conn: ConnectionManager) -> Self {
        let mut pipe = redis::pipe();
        pipe.atomic();
        Self {
            shard: shard.to_string(),
            conn,
            queue: Arc::new(Mutex::new(Some(Queue { pipe, len: 0 }))),
        }
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Number of queued commands, or `None` once finished.
    pub async fn queued(&self) -> Option<usize> {
        self.queue.lock().await.as_ref().map(|q| q.len)
    }

    pub(crate) async fn push(&self, cmd: Cmd) -> Result<()> {
        let mut queue = self.queue.lock().await;
        let queue = queue.as_mut().ok_or(StorageError::TransactionDone)?;
        queue.pipe.add_command(cmd).ignore();
        queue.len += 1;
        Ok(())
    }

    async fn take(&self) -> Result<Queue> {
        self.queue
            .lock()
            .await
            .take()
            .ok_or(StorageError::TransactionDone)
    }
}

#[async_trait]
impl TxHandle for RedisTx {
    async fn commit(&self, ctx: &Context) -> Result<()> {
        let queue = self.take().await?;
        if queue.len == 0 {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let len = queue.len;
        ctx.run(async move {
            let _: () = queue.pipe.query_async(&mut conn).await?;
            Ok::<_, StorageError>(())
        })
        .await?;

        debug!(shard = %self.shard, commands = len, "Redis transaction committed");
        Ok(())
    }

    async fn rollback(&self, _ctx: &Context) -> Result<()> {
        let queue = self.take().await?;
        debug!(shard = %self.shard, discarded = queue.len, "Redis transaction rolled back");
        Ok(())
    }
}

pub struct RedisTxKind;

impl TxKind for RedisTxKind {
    const KEY: &'static str = "redis_tx";

    type Handle = RedisTx;
}

impl RedisClient {
    /// Open a transaction on the shard serving `ctx`.
    pub async fn begin_tx(&self, ctx: &Context) -> Result<RedisTx> {
        ctx.check()?;
        let handle = self.topology.resolve(ctx)?;
        Ok(RedisTx::new(handle.key(), handle.conn().clone()))
    }
}

#[async_trait]
impl TxProvider for RedisClient {
    type Kind = RedisTxKind;

    async fn open(&self, ctx: &Context) -> Result<RedisTx> {
        self.begin_tx(ctx).await
    }
}
