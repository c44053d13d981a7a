//! Execution context.
//!
//! A `Context` is an immutable value chain that travels with every storage
//! call. It carries typed values (ambient transactions, routing keys, flags),
//! a cancellation token and an optional deadline. Deriving a context never
//! mutates its parent; values attached to a child are invisible to the parent
//! and to siblings.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StorageError};

/// Typed key for a value stored in a [`Context`].
///
/// The key type itself is only an identity; the stored data is `Value`.
pub trait ContextKey: 'static {
    type Value: Clone + Send + Sync + 'static;
}

struct Entry {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<Entry>>,
}

/// Immutable execution context.
#[derive(Clone)]
pub struct Context {
    values: Option<Arc<Entry>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

/// Cancels the context returned alongside it by [`Context::with_cancel`]
/// and every context derived from that one.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Root context: no values, never cancelled, no deadline.
    pub fn background() -> Self {
        Self {
            values: None,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a context carrying `value` under key `K`.
    ///
    /// An existing value for `K` further up the chain is shadowed, not replaced.
    pub fn with_value<K: ContextKey>(&self, value: K::Value) -> Self {
        Self {
            values: Some(Arc::new(Entry {
                key: TypeId::of::<K>(),
                value: Arc::new(value),
                parent: self.values.clone(),
            })),
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }

    /// Nearest value stored under key `K`, if any.
    pub fn value<K: ContextKey>(&self) -> Option<K::Value> {
        let wanted = TypeId::of::<K>();
        let mut current = self.values.as_deref();
        while let Some(entry) = current {
            if entry.key == wanted {
                return entry.value.downcast_ref::<K::Value>().cloned();
            }
            current = entry.parent.as_deref();
        }
        None
    }

    /// Derive a cancellable context.
    ///
    /// Cancelling the parent still cancels the child.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let token = self.cancel.child_token();
        let ctx = Self {
            values: self.values.clone(),
            cancel: token.clone(),
            deadline: self.deadline,
        };
        (ctx, CancelHandle { token })
    }

    /// Derive a context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that expires at `deadline`, or at the parent's
    /// deadline if that one is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self {
            values: self.values.clone(),
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    /// Same values, fresh cancellation and no deadline.
    pub fn detached(&self) -> Self {
        Self {
            values: self.values.clone(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails if the context was cancelled or its deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StorageError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run one I/O future under this context.
    ///
    /// The future is not polled at all if the context is already done, and is
    /// dropped (aborting the in-flight call) as soon as the context is
    /// cancelled or expires.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            res = fut => res,
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            _ = expired => Err(StorageError::DeadlineExceeded),
        }
    }
}

struct NoLog;

impl ContextKey for NoLog {
    type Value = bool;
}

/// Derive a context with per-statement logging turned off.
pub fn no_log(ctx: &Context) -> Context {
    ctx.with_value::<NoLog>(true)
}

/// Whether statement logging is turned off for this context.
pub fn is_no_log(ctx: &Context) -> bool {
    ctx.value::<NoLog>().unwrap_or(false)
}
