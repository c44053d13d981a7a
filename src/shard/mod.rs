//! Shard routing.
//!
//! A logical resource is backed either by one connection or by a
//! [`ShardSet`]: an ordered list of keyed [`ResourceHandle`]s plus a
//! [`Selector`] that picks the handle serving each call. Clients hold a
//! [`Topology`] so the same code path serves both shapes.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{collect_errors, Result, StorageError};

pub mod fanout;
pub mod selector;

pub use fanout::{each_shard, each_shard_async};
pub use selector::{with_shard_condition, with_shard_key, Selector, SelectorKind};

/// Key reported for the handle of a single (unsharded) client.
pub const SINGLE_KEY: &str = "single";

/// A physical connection owned by a [`ResourceHandle`].
///
/// `close` must be idempotent.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// One physical connection with its shard identity.
#[derive(Debug, Clone)]
pub struct ResourceHandle<C> {
    key: String,
    conditions: Vec<String>,
    conn: C,
}

impl<C> ResourceHandle<C> {
    pub fn new(key: impl Into<String>, conn: C) -> Self {
        Self {
            key: key.into(),
            conditions: Vec::new(),
            conn,
        }
    }

    /// Attach routing conditions (selector input only).
    pub fn with_conditions<I, S>(mut self, conditions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions = conditions.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    pub fn conn(&self) -> &C {
        &self.conn
    }
}

/// Check shard keys for emptiness and duplicates.
///
/// Run before any connection attempt so configuration mistakes fail at
/// construction time.
pub fn validate_keys<'a, I>(keys: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut count = 0usize;
    for key in keys {
        count += 1;
        if key.is_empty() {
            return Err(StorageError::EmptyShardKey);
        }
        if !seen.insert(key) {
            return Err(StorageError::DuplicateShardKey(key.to_string()));
        }
    }
    if count == 0 {
        return Err(StorageError::NoShards);
    }
    Ok(())
}

/// Ordered set of shard handles with a selection policy.
pub struct ShardSet<C> {
    handles: Vec<ResourceHandle<C>>,
    selector: Selector<C>,
}

impl<C> ShardSet<C> {
    /// Build a shard set from already-connected handles.
    pub fn new(handles: Vec<ResourceHandle<C>>, selector: Selector<C>) -> Result<Self> {
        validate_keys(handles.iter().map(ResourceHandle::key))?;
        Ok(Self { handles, selector })
    }

    /// Pick the handle serving the current call.
    pub fn resolve(&self, ctx: &Context) -> Result<&ResourceHandle<C>> {
        self.selector
            .select(ctx, &self.handles)
            .ok_or(StorageError::ConnectionNotSelected)
    }

    pub fn handles(&self) -> &[ResourceHandle<C>] {
        &self.handles
    }

    pub fn get(&self, key: &str) -> Option<&ResourceHandle<C>> {
        self.handles.iter().find(|h| h.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(ResourceHandle::key)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<C: Connection> ShardSet<C> {
    /// Close every handle concurrently.
    ///
    /// All closes are attempted; failures are aggregated.
    pub async fn close_all(&self) -> Result<()> {
        let results = join_all(self.handles.iter().map(|handle| async move {
            let res = handle.conn.close().await;
            if let Err(e) = &res {
                warn!(shard = %handle.key, error = %e, "Failed to close shard connection");
            }
            res
        }))
        .await;

        debug!(shards = self.handles.len(), "Closed shard set");
        collect_errors(results.into_iter().filter_map(|r| r.err()).collect())
    }
}

/// Backing of a client: one connection or a shard set.
pub enum Topology<C> {
    Single(ResourceHandle<C>),
    Sharded(Arc<ShardSet<C>>),
}

impl<C> Clone for Topology<C>
where
    C: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Topology::Single(handle) => Topology::Single(handle.clone()),
            Topology::Sharded(set) => Topology::Sharded(Arc::clone(set)),
        }
    }
}

impl<C> Topology<C> {
    pub fn single(conn: C) -> Self {
        Topology::Single(ResourceHandle::new(SINGLE_KEY, conn))
    }

    pub fn sharded(set: ShardSet<C>) -> Self {
        Topology::Sharded(Arc::new(set))
    }

    pub fn resolve(&self, ctx: &Context) -> Result<&ResourceHandle<C>> {
        match self {
            Topology::Single(handle) => Ok(handle),
            Topology::Sharded(set) => set.resolve(ctx),
        }
    }

    /// All shards, for fan-out. Single topologies have none.
    pub fn shards(&self) -> Result<&[ResourceHandle<C>]> {
        match self {
            Topology::Single(_) => Err(StorageError::NotSharded),
            Topology::Sharded(set) => Ok(set.handles()),
        }
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self, Topology::Sharded(_))
    }
}

impl<C: Connection> Topology<C> {
    pub async fn close(&self) -> Result<()> {
        match self {
            Topology::Single(handle) => handle.conn.close().await,
            Topology::Sharded(set) => set.close_all().await,
        }
    }
}
