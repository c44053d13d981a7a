//! SQL client over sqlx's `Any` driver.
//!
//! Every call resolves its shard from the context first, then runs inside
//! the ambient SQL transaction when the context carries one, else on the
//! shard's pool.

use std::future::Future;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyQueryResult, AnyRow};
use sqlx::query::{Query, QueryAs};
use sqlx::{Any, AnyPool, Execute, FromRow};
use tracing::debug;

use crate::context::{is_no_log, Context};
use crate::error::{Result, StorageError};
use crate::shard::{self, Connection, ResourceHandle, ShardSet, Topology};
use crate::transactor::{lookup_transaction, AmbientTransactor};

pub mod connect;
pub mod transaction;

pub use connect::{connect, connect_from_config, connect_shards};
pub use transaction::{IsolationLevel, SqlTx, SqlTxKind, TxOptions};

#[async_trait]
impl Connection for AnyPool {
    async fn close(&self) -> Result<()> {
        sqlx::Pool::close(self).await;
        Ok(())
    }
}

enum Target {
    Pool(AnyPool),
    Tx(SqlTx),
}

/// Run `$query.$method(executor)` against the resolved target.
macro_rules! dispatch {
    ($self:ident, $ctx:ident, $query:ident, $op:literal, $method:ident) => {{
        let target = $self.target($ctx, $op, $query.sql())?;
        $ctx.run(async move {
            match target {
                Target::Pool(pool) => $query.$method(&pool).await.map_err(StorageError::from),
                Target::Tx(tx) => {
                    let mut guard = tx.lock().await;
                    let conn = guard.as_mut().ok_or(StorageError::TransactionDone)?;
                    $query.$method(&mut **conn).await.map_err(StorageError::from)
                }
            }
        })
        .await
    }};
}

/// SQL client, single or sharded.
#[derive(Clone)]
pub struct SqlClient {
    topology: Topology<AnyPool>,
    log_queries: bool,
    tx_options: TxOptions,
}

impl SqlClient {
    pub fn single(pool: AnyPool) -> Self {
        Self::from_topology(Topology::single(pool))
    }

    pub fn sharded(set: ShardSet<AnyPool>) -> Self {
        Self::from_topology(Topology::sharded(set))
    }

    pub fn from_topology(topology: Topology<AnyPool>) -> Self {
        Self {
            topology,
            log_queries: false,
            tx_options: TxOptions::default(),
        }
    }

    /// Log every statement at debug level.
    pub fn with_query_log(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    /// Options applied to every transaction this client opens.
    pub fn with_tx_options(mut self, options: TxOptions) -> Self {
        self.tx_options = options;
        self
    }

    pub fn topology(&self) -> &Topology<AnyPool> {
        &self.topology
    }

    pub fn is_sharded(&self) -> bool {
        self.topology.is_sharded()
    }

    /// Pool of the shard serving `ctx`, for access the client doesn't wrap.
    pub fn connection(&self, ctx: &Context) -> Result<AnyPool> {
        ctx.check()?;
        Ok(self.topology.resolve(ctx)?.conn().clone())
    }

    pub fn transactor(&self) -> AmbientTransactor<SqlClient> {
        AmbientTransactor::new(self.clone())
    }

    pub async fn close(&self) -> Result<()> {
        self.topology.close().await
    }

    fn target(&self, ctx: &Context, op: &'static str, sql: &str) -> Result<Target> {
        ctx.check()?;
        let handle = self.topology.resolve(ctx)?;
        let tx = lookup_transaction::<SqlTxKind>(ctx);

        if self.log_queries && !is_no_log(ctx) {
            debug!(
                shard = %handle.key(),
                op,
                in_tx = tx.is_some(),
                query = %sql,
                "Executing SQL"
            );
        }

        Ok(match tx {
            Some(tx) => Target::Tx(tx),
            None => Target::Pool(handle.conn().clone()),
        })
    }

    pub async fn execute<'q>(
        &self,
        ctx: &Context,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<AnyQueryResult> {
        dispatch!(self, ctx, query, "execute", execute)
    }

    pub async fn fetch_all<'q>(
        &self,
        ctx: &Context,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<Vec<AnyRow>> {
        dispatch!(self, ctx, query, "fetch_all", fetch_all)
    }

    /// Exactly one row; no row is `NotFound`.
    pub async fn fetch_one<'q>(
        &self,
        ctx: &Context,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<AnyRow> {
        dispatch!(self, ctx, query, "fetch_one", fetch_one)
    }

    pub async fn fetch_optional<'q>(
        &self,
        ctx: &Context,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<Option<AnyRow>> {
        dispatch!(self, ctx, query, "fetch_optional", fetch_optional)
    }

    pub async fn fetch_all_as<'q, O>(
        &self,
        ctx: &Context,
        query: QueryAs<'q, Any, O, AnyArguments<'q>>,
    ) -> Result<Vec<O>>
    where
        O: Send + Unpin + for<'r> FromRow<'r, AnyRow> + 'static,
    {
        dispatch!(self, ctx, query, "fetch_all", fetch_all)
    }

    pub async fn fetch_one_as<'q, O>(
        &self,
        ctx: &Context,
        query: QueryAs<'q, Any, O, AnyArguments<'q>>,
    ) -> Result<O>
    where
        O: Send + Unpin + for<'r> FromRow<'r, AnyRow> + 'static,
    {
        dispatch!(self, ctx, query, "fetch_one", fetch_one)
    }

    pub async fn fetch_optional_as<'q, O>(
        &self,
        ctx: &Context,
        query: QueryAs<'q, Any, O, AnyArguments<'q>>,
    ) -> Result<Option<O>>
    where
        O: Send + Unpin + for<'r> FromRow<'r, AnyRow> + 'static,
    {
        dispatch!(self, ctx, query, "fetch_optional", fetch_optional)
    }

    fn for_shard(&self, handle: ResourceHandle<AnyPool>) -> Self {
        Self {
            topology: Topology::Single(handle),
            log_queries: self.log_queries,
            tx_options: self.tx_options.clone(),
        }
    }

    /// Run `f` against each shard in order, stopping at the first error.
    ///
    /// `f` receives a client bound to that one shard.
    pub async fn each_shard<F, Fut>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(SqlClient) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let shards = self.topology.shards()?;
        shard::each_shard(shards, |handle| f(self.for_shard(handle))).await
    }

    /// Run `f` against every shard concurrently, at most `limit` at a time.
    pub async fn each_shard_async<F, Fut>(&self, f: F, limit: Option<usize>) -> Result<()>
    where
        F: Fn(SqlClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let shards = self.topology.shards()?;
        let template = self.clone();
        shard::each_shard_async(shards, move |handle| f(template.for_shard(handle)), limit).await
    }
}
