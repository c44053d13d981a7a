//! Test utilities and mock implementations.
//!
//! In-memory stand-ins for shard connections and transactional resources,
//! for exercising routing and transaction coordination without a database.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::context::Context;
use crate::error::{Result, StorageError};
use crate::shard::Connection;
use crate::transactor::{lookup_transaction, AmbientTransactor, TxHandle, TxKind, TxProvider};

fn injected(what: &str) -> StorageError {
    StorageError::Database(sqlx::Error::Protocol(format!("injected {what} failure")))
}

/// Connection that only counts closes.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    closes: Arc<AtomicUsize>,
    fail_close: bool,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            closes: Arc::default(),
            fail_close: true,
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(injected("close"));
        }
        Ok(())
    }
}

/// Distinguishes memory store kinds so several can share one context.
pub trait MemoryLabel: Clone + Send + Sync + 'static {
    const KEY: &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Primary;

impl MemoryLabel for Primary {
    const KEY: &'static str = "memory_primary_tx";
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Secondary;

impl MemoryLabel for Secondary {
    const KEY: &'static str = "memory_secondary_tx";
}

#[derive(Default)]
struct MemoryState {
    data: RwLock<HashMap<String, String>>,
    fail_on_begin: RwLock<bool>,
    fail_on_commit: RwLock<bool>,
    fail_on_rollback: RwLock<bool>,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// Key/value store with buffered transactional writes.
///
/// Writes made under an ambient transaction of this store's kind become
/// visible only on commit.
pub struct MemoryStore<L = Primary> {
    state: Arc<MemoryState>,
    _label: PhantomData<L>,
}

impl<L> Clone for MemoryStore<L> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            _label: PhantomData,
        }
    }
}

impl<L> Default for MemoryStore<L> {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            _label: PhantomData,
        }
    }
}

impl<L: MemoryLabel> MemoryStore<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactor(&self) -> AmbientTransactor<Self> {
        AmbientTransactor::new(self.clone())
    }

    pub async fn set_fail_on_begin(&self, fail: bool) {
        *self.state.fail_on_begin.write().await = fail;
    }

    pub async fn set_fail_on_commit(&self, fail: bool) {
        *self.state.fail_on_commit.write().await = fail;
    }

    pub async fn set_fail_on_rollback(&self, fail: bool) {
        *self.state.fail_on_rollback.write().await = fail;
    }

    pub async fn put(&self, ctx: &Context, key: &str, value: &str) -> Result<()> {
        ctx.check()?;
        match lookup_transaction::<MemoryTxKind<L>>(ctx) {
            Some(tx) => {
                let mut writes = tx.writes.lock().await;
                let writes = writes.as_mut().ok_or(StorageError::TransactionDone)?;
                writes.push((key.to_string(), value.to_string()));
            }
            None => {
                self.state
                    .data
                    .write()
                    .await
                    .insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.state.data.read().await.get(key).cloned()
    }

    pub fn begin_count(&self) -> usize {
        self.state.begins.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }
}

/// Open transaction of a [`MemoryStore`].
pub struct MemoryTx<L> {
    store: MemoryStore<L>,
    writes: Arc<Mutex<Option<Vec<(String, String)>>>>,
}

impl<L> Clone for MemoryTx<L> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            writes: Arc::clone(&self.writes),
        }
    }
}

#[async_trait]
impl<L: MemoryLabel> TxHandle for MemoryTx<L> {
    async fn commit(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        let writes = self
            .writes
            .lock()
            .await
            .take()
            .ok_or(StorageError::TransactionDone)?;
        self.store.state.commits.fetch_add(1, Ordering::SeqCst);
        if *self.store.state.fail_on_commit.read().await {
            return Err(injected("commit"));
        }
        let mut data = self.store.state.data.write().await;
        data.extend(writes);
        Ok(())
    }

    async fn rollback(&self, _ctx: &Context) -> Result<()> {
        self.writes
            .lock()
            .await
            .take()
            .ok_or(StorageError::TransactionDone)?;
        self.store.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        if *self.store.state.fail_on_rollback.read().await {
            return Err(injected("rollback"));
        }
        Ok(())
    }
}

pub struct MemoryTxKind<L>(PhantomData<fn() -> L>);

impl<L: MemoryLabel> TxKind for MemoryTxKind<L> {
    const KEY: &'static str = L::KEY;

    type Handle = MemoryTx<L>;
}

#[async_trait]
impl<L: MemoryLabel> TxProvider for MemoryStore<L> {
    type Kind = MemoryTxKind<L>;

    async fn open(&self, ctx: &Context) -> Result<MemoryTx<L>> {
        ctx.check()?;
        if *self.state.fail_on_begin.read().await {
            return Err(injected("begin"));
        }
        self.state.begins.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTx {
            store: self.clone(),
            writes: Arc::new(Mutex::new(Some(Vec::new()))),
        })
    }
}
