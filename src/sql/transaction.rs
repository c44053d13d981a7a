//! SQL transactions as ambient handles.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{Any, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::SqlClient;
use crate::context::Context;
use crate::error::{Result, StorageError};
use crate::transactor::{TxHandle, TxKind, TxProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        })
    }
}

/// Options for transactions opened by a [`SqlClient`].
///
/// Applied with `SET TRANSACTION` right after `BEGIN`, so they only work on
/// backends that accept that statement (Postgres, MySQL). Leave them unset
/// for SQLite.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TxOptions {
    /// The `SET TRANSACTION` statement, or `None` for driver defaults.
    pub fn statement(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(level) = self.isolation {
            parts.push(format!("ISOLATION LEVEL {level}"));
        }
        if self.read_only {
            parts.push("READ ONLY".to_string());
        }
        if parts.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", parts.join(", ")))
        }
    }
}

/// Open SQL transaction bound to one shard.
///
/// Clones share the transaction. Statements through any clone are
/// serialized on the single underlying connection.
#[derive(Clone)]
pub struct SqlTx {
    shard: String,
    inner: Arc<Mutex<Option<Transaction<'static, Any>>>>,
}

impl fmt::Debug for SqlTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlTx").field("shard", &self.shard).finish()
    }
}

impl SqlTx {
    fn new(shard: &str, tx: Transaction<'static, Any>) -> Self {
        Self {
            shard: shard.to_string(),
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Key of the shard the transaction was opened on.
    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<Transaction<'static, Any>>> {
        self.inner.lock().await
    }

    async fn take(&self) -> Result<Transaction<'static, Any>> {
        self.inner
            .lock()
            .await
            .take()
            .ok_or(StorageError::TransactionDone)
    }
}

#[async_trait]
impl TxHandle for SqlTx {
    /// A commit aborted by the context drops the transaction, which rolls
    /// it back.
    async fn commit(&self, ctx: &Context) -> Result<()> {
        let tx = self.take().await?;
        ctx.run(async move { tx.commit().await.map_err(StorageError::from) })
            .await?;
        debug!(shard = %self.shard, "SQL transaction committed");
        Ok(())
    }

    async fn rollback(&self, ctx: &Context) -> Result<()> {
        let tx = self.take().await?;
        ctx.run(async move { tx.rollback().await.map_err(StorageError::from) })
            .await?;
        debug!(shard = %self.shard, "SQL transaction rolled back");
        Ok(())
    }
}

pub struct SqlTxKind;

impl TxKind for SqlTxKind {
    const KEY: &'static str = "sql_tx";

    type Handle = SqlTx;
}

impl SqlClient {
    /// Open a transaction on the shard serving `ctx`.
    pub async fn begin_tx(&self, ctx: &Context) -> Result<SqlTx> {
        ctx.check()?;
        let handle = self.topology.resolve(ctx)?;
        let pool = handle.conn().clone();
        let statement = self.tx_options.statement();

        let tx = ctx
            .run(async move {
                let mut tx = pool.begin().await?;
                if let Some(statement) = statement {
                    sqlx::query(&statement).execute(&mut *tx).await?;
                }
                Ok::<_, StorageError>(tx)
            })
            .await?;

        Ok(SqlTx::new(handle.key(), tx))
    }
}

#[async_trait]
impl TxProvider for SqlClient {
    type Kind = SqlTxKind;

    async fn open(&self, ctx: &Context) -> Result<SqlTx> {
        self.begin_tx(ctx).await
    }
}
