//! Several transactors driven as one unit.
//!
//! Best-effort all-or-nothing: commits and rollbacks run on every child in
//! parallel, but there is no cross-resource atomicity.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::warn;

use super::{Transaction, Transactor};
use crate::context::Context;
use crate::error::{collect_errors, Result};

pub struct CompositeTransactor {
    transactors: Vec<Arc<dyn Transactor>>,
}

impl CompositeTransactor {
    pub fn new(transactors: Vec<Arc<dyn Transactor>>) -> Self {
        Self { transactors }
    }

    pub fn transactors(&self) -> &[Arc<dyn Transactor>] {
        &self.transactors
    }
}

#[async_trait]
impl Transactor for CompositeTransactor {
    fn key(&self) -> String {
        self.transactors
            .iter()
            .map(|t| t.key())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// True when any child has an open transaction in `ctx`.
    fn is_tx(&self, ctx: &Context) -> bool {
        self.transactors.iter().any(|t| t.is_tx(ctx))
    }

    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>> {
        let mut opened: Vec<Box<dyn Transaction>> = Vec::with_capacity(self.transactors.len());
        for transactor in &self.transactors {
            match transactor.begin(ctx).await {
                Ok(tx) => opened.push(tx),
                Err(err) => {
                    let results = join_all(opened.iter().map(|tx| tx.rollback(ctx))).await;
                    log_rollback_failures(&self.transactors[..opened.len()], results);
                    return Err(err);
                }
            }
        }

        Ok(Box::new(CompositeTransaction {
            transactions: opened,
            parent: ctx.clone(),
        }))
    }

    async fn begin_ctx(&self, ctx: &Context) -> Result<Context> {
        let mut current = ctx.clone();
        for (idx, transactor) in self.transactors.iter().enumerate() {
            match transactor.begin_ctx(&current).await {
                Ok(next) => current = next,
                Err(err) => {
                    let opened = &self.transactors[..idx];
                    let results = join_all(opened.iter().map(|t| t.rollback_ctx(&current))).await;
                    log_rollback_failures(opened, results);
                    return Err(err);
                }
            }
        }
        Ok(current)
    }

    async fn commit_ctx(&self, ctx: &Context) -> Result<()> {
        let results = join_all(self.transactors.iter().map(|t| t.commit_ctx(ctx))).await;
        collect_errors(results.into_iter().filter_map(|r| r.err()).collect())
    }

    async fn rollback_ctx(&self, ctx: &Context) -> Result<()> {
        let results = join_all(self.transactors.iter().map(|t| t.rollback_ctx(ctx))).await;
        collect_errors(results.into_iter().filter_map(|r| r.err()).collect())
    }

    fn rewrite(&self, original: &Context, to_copy: Context) -> Context {
        self.transactors
            .iter()
            .fold(to_copy, |ctx, t| t.rewrite(original, ctx))
    }
}

fn log_rollback_failures(transactors: &[Arc<dyn Transactor>], results: Vec<Result<()>>) {
    for (transactor, result) in transactors.iter().zip(results) {
        if let Err(e) = result {
            warn!(
                kind = %transactor.key(),
                error = %e,
                "Failed to roll back partially opened transaction"
            );
        }
    }
}

struct CompositeTransaction {
    transactions: Vec<Box<dyn Transaction>>,
    parent: Context,
}

#[async_trait]
impl Transaction for CompositeTransaction {
    fn context(&self) -> Context {
        self.attach(&self.parent)
    }

    fn attach(&self, ctx: &Context) -> Context {
        self.transactions
            .iter()
            .fold(ctx.clone(), |ctx, tx| tx.attach(&ctx))
    }

    async fn commit(&self, ctx: &Context) -> Result<()> {
        let results = join_all(self.transactions.iter().map(|tx| tx.commit(ctx))).await;
        collect_errors(results.into_iter().filter_map(|r| r.err()).collect())
    }

    async fn rollback(&self, ctx: &Context) -> Result<()> {
        let results = join_all(self.transactions.iter().map(|tx| tx.rollback(ctx))).await;
        collect_errors(results.into_iter().filter_map(|r| r.err()).collect())
    }
}
