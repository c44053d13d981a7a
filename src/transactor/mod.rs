//! Ambient transaction coordination.
//!
//! A [`Transactor`] opens a transaction for one resource kind (or several,
//! see [`CompositeTransactor`]) and records it in a derived [`Context`].
//! Every client call made with that context, or a context derived from it,
//! runs inside the open transaction without the transaction being passed
//! around explicitly.

use std::future::Future;

use async_trait::async_trait;
use tracing::warn;

use crate::context::Context;
use crate::error::Result;

pub mod ambient;
pub mod composite;
pub mod single;

pub use ambient::{lookup_transaction, rewrite_tx, with_transaction, TxHandle, TxKind};
pub use composite::CompositeTransactor;
pub use single::{AmbientTransaction, AmbientTransactor, TxProvider};

/// An explicitly held transaction.
///
/// Terminal calls are single-shot: after the first commit or rollback the
/// next one fails with `TransactionDone`.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// The context this transaction was begun from, with the transaction
    /// attached.
    fn context(&self) -> Context;

    /// `ctx` with this transaction attached.
    fn attach(&self, ctx: &Context) -> Context;

    async fn commit(&self, ctx: &Context) -> Result<()>;

    async fn rollback(&self, ctx: &Context) -> Result<()>;
}

/// Begin/commit/rollback protocol over ambient transactions.
///
/// `commit_ctx` and `rollback_ctx` on a context without an open transaction
/// are no-ops.
#[async_trait]
pub trait Transactor: Send + Sync {
    /// Identifier of the resource kind(s) this transactor drives.
    fn key(&self) -> String;

    /// Whether `ctx` carries an open transaction of this kind.
    fn is_tx(&self, ctx: &Context) -> bool;

    /// Open a transaction without attaching it to any context.
    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>>;

    /// Open a transaction and return a context carrying it.
    async fn begin_ctx(&self, ctx: &Context) -> Result<Context>;

    async fn commit_ctx(&self, ctx: &Context) -> Result<()>;

    async fn rollback_ctx(&self, ctx: &Context) -> Result<()>;

    /// Copy the open transaction of `original` into `to_copy`.
    fn rewrite(&self, original: &Context, to_copy: Context) -> Context;
}

/// Run `f` inside a transaction.
///
/// If `ctx` already carries a transaction of this kind, `f` joins it and the
/// outer owner keeps responsibility for commit. Otherwise a transaction is
/// begun, committed when `f` succeeds and rolled back when it fails; a
/// rollback failure is logged and the error from `f` is returned.
///
/// For a [`CompositeTransactor`] the join check passes as soon as one child
/// is open. Children missing from `ctx` are not begun, so their writes go
/// straight to the resource. Begin the composite up front when every kind
/// must be covered.
pub async fn atomic<X, T, F, Fut>(transactor: &X, ctx: &Context, f: F) -> Result<T>
where
    X: Transactor + ?Sized,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if transactor.is_tx(ctx) {
        return f(ctx.clone()).await;
    }

    let tx_ctx = transactor.begin_ctx(ctx).await?;
    match f(tx_ctx.clone()).await {
        Ok(value) => {
            transactor.commit_ctx(&tx_ctx).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = transactor.rollback_ctx(&tx_ctx).await {
                warn!(
                    kind = %transactor.key(),
                    error = %rollback_err,
                    "Rollback failed after unit of work error"
                );
            }
            Err(err)
        }
    }
}
