//! Transactor for a single resource kind.

use async_trait::async_trait;
use tracing::debug;

use super::ambient::{lookup_transaction, rewrite_tx, with_transaction, TxHandle, TxKind};
use super::{Transaction, Transactor};
use crate::context::Context;
use crate::error::Result;

/// Opens physical transactions for one resource kind.
///
/// Implementations resolve the shard from the context, so a transaction is
/// always bound to exactly one shard.
#[async_trait]
pub trait TxProvider: Send + Sync {
    type Kind: TxKind;

    async fn open(&self, ctx: &Context) -> Result<<Self::Kind as TxKind>::Handle>;
}

/// Begin/commit/rollback protocol over the ambient store for one kind.
pub struct AmbientTransactor<P> {
    provider: P,
}

impl<P: TxProvider> AmbientTransactor<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

#[async_trait]
impl<P: TxProvider> Transactor for AmbientTransactor<P> {
    fn key(&self) -> String {
        <P::Kind as TxKind>::KEY.to_string()
    }

    fn is_tx(&self, ctx: &Context) -> bool {
        lookup_transaction::<P::Kind>(ctx).is_some()
    }

    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>> {
        let handle = self.provider.open(ctx).await?;
        debug!(kind = <P::Kind as TxKind>::KEY, "Transaction opened");
        Ok(Box::new(AmbientTransaction::<P::Kind> {
            handle,
            parent: ctx.clone(),
        }))
    }

    async fn begin_ctx(&self, ctx: &Context) -> Result<Context> {
        let handle = self.provider.open(ctx).await?;
        debug!(kind = <P::Kind as TxKind>::KEY, "Ambient transaction opened");
        Ok(with_transaction::<P::Kind>(ctx, handle))
    }

    async fn commit_ctx(&self, ctx: &Context) -> Result<()> {
        match lookup_transaction::<P::Kind>(ctx) {
            Some(handle) => handle.commit(ctx).await,
            None => Ok(()),
        }
    }

    async fn rollback_ctx(&self, ctx: &Context) -> Result<()> {
        match lookup_transaction::<P::Kind>(ctx) {
            Some(handle) => handle.rollback(ctx).await,
            None => Ok(()),
        }
    }

    fn rewrite(&self, original: &Context, to_copy: Context) -> Context {
        rewrite_tx::<P::Kind>(original, to_copy)
    }
}

/// Transaction returned by [`AmbientTransactor::begin`].
pub struct AmbientTransaction<K: TxKind> {
    handle: K::Handle,
    parent: Context,
}

impl<K: TxKind> AmbientTransaction<K> {
    pub fn handle(&self) -> &K::Handle {
        &self.handle
    }
}

#[async_trait]
impl<K: TxKind> Transaction for AmbientTransaction<K> {
    fn context(&self) -> Context {
        self.attach(&self.parent)
    }

    fn attach(&self, ctx: &Context) -> Context {
        with_transaction::<K>(ctx, self.handle.clone())
    }

    async fn commit(&self, ctx: &Context) -> Result<()> {
        self.handle.commit(ctx).await
    }

    async fn rollback(&self, ctx: &Context) -> Result<()> {
        self.handle.rollback(ctx).await
    }
}
