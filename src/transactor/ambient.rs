//! Context-scoped storage of open transactions.
//!
//! Each resource kind gets its own slot, so one context can carry an open
//! SQL transaction and an open Redis pipeline at the same time. Nested calls
//! only read the slot.

use std::marker::PhantomData;

use async_trait::async_trait;

use crate::context::{Context, ContextKey};
use crate::error::Result;

/// Physical transaction (or transactional pipeline) of one resource kind.
///
/// Clones share the same physical transaction. The first terminal call wins;
/// later commits or rollbacks through any clone fail with `TransactionDone`.
#[async_trait]
pub trait TxHandle: Clone + Send + Sync + 'static {
    async fn commit(&self, ctx: &Context) -> Result<()>;
    async fn rollback(&self, ctx: &Context) -> Result<()>;
}

/// A transactional resource kind.
pub trait TxKind: Send + Sync + 'static {
    /// Identifier used in transactor keys and logs.
    const KEY: &'static str;

    type Handle: TxHandle;
}

struct Ambient<K>(PhantomData<fn() -> K>);

impl<K: TxKind> ContextKey for Ambient<K> {
    type Value = K::Handle;
}

/// Derive a context carrying `handle` as the open transaction of kind `K`.
pub fn with_transaction<K: TxKind>(ctx: &Context, handle: K::Handle) -> Context {
    ctx.with_value::<Ambient<K>>(handle)
}

/// The open transaction of kind `K`, if the context carries one.
pub fn lookup_transaction<K: TxKind>(ctx: &Context) -> Option<K::Handle> {
    ctx.value::<Ambient<K>>()
}

/// Copy the open transaction of kind `K` from `original` into `to_copy`.
///
/// Returns `to_copy` untouched when `original` carries none.
pub fn rewrite_tx<K: TxKind>(original: &Context, to_copy: Context) -> Context {
    match lookup_transaction::<K>(original) {
        Some(handle) => with_transaction::<K>(&to_copy, handle),
        None => to_copy,
    }
}
