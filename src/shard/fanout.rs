//! Apply one operation to every shard.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

use super::ResourceHandle;
use crate::error::{collect_errors, Result, StorageError};

/// Run `f` for each shard in order, stopping at the first error.
///
/// Shard `i + 1` is never touched once shard `i` has failed.
pub async fn each_shard<C, F, Fut>(shards: &[ResourceHandle<C>], mut f: F) -> Result<()>
where
    C: Clone,
    F: FnMut(ResourceHandle<C>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    for shard in shards {
        f(shard.clone()).await?;
    }
    Ok(())
}

/// Run `f` for every shard on its own task and wait for all of them.
///
/// With `limit > 0` at most `limit` tasks are in flight; a task is launched
/// only once it holds an admission permit. Every shard is attempted
/// regardless of failures elsewhere, and all failures are aggregated in
/// shard order.
pub async fn each_shard_async<C, F, Fut>(
    shards: &[ResourceHandle<C>],
    f: F,
    limit: Option<usize>,
) -> Result<()>
where
    C: Clone + Send + Sync + 'static,
    F: Fn(ResourceHandle<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    let gate = limit
        .filter(|n| *n > 0)
        .map(|n| Arc::new(Semaphore::new(n)));

    let mut tasks = Vec::with_capacity(shards.len());
    for shard in shards.iter().cloned() {
        let permit = match &gate {
            Some(gate) => Some(
                Arc::clone(gate)
                    .acquire_owned()
                    .await
                    .map_err(|_| StorageError::GateClosed)?,
            ),
            None => None,
        };

        let f = Arc::clone(&f);
        let key = shard.key().to_string();
        let task = tokio::spawn(async move {
            let res = f(shard).await;
            drop(permit);
            res
        });
        tasks.push((key, task));
    }

    let mut errors = Vec::new();
    for (key, task) in tasks {
        let outcome = match task.await {
            Ok(res) => res,
            Err(join_err) => Err(StorageError::from(join_err)),
        };
        if let Err(e) = outcome {
            warn!(shard = %key, error = %e, "Shard operation failed");
            errors.push(e);
        }
    }

    collect_errors(errors)
}
