//! Shard selection policies.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use super::ResourceHandle;
use crate::context::{Context, ContextKey};

type SelectFn<C> = dyn for<'a> Fn(&Context, &'a [ResourceHandle<C>]) -> Option<&'a ResourceHandle<C>>
    + Send
    + Sync;

/// Picks the handle that serves a call.
///
/// A selector only reads the context and the handles. Returning `None`
/// makes resolution fail with `ConnectionNotSelected`; it is never replaced
/// by a default shard.
pub struct Selector<C> {
    inner: Arc<SelectFn<C>>,
}

impl<C> Clone for Selector<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for Selector<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Selector")
    }
}

impl<C> Selector<C> {
    pub fn select<'a>(
        &self,
        ctx: &Context,
        handles: &'a [ResourceHandle<C>],
    ) -> Option<&'a ResourceHandle<C>> {
        (self.inner)(ctx, handles)
    }
}

impl<C: 'static> Selector<C> {
    /// Custom selection function.
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&Context, &'a [ResourceHandle<C>]) -> Option<&'a ResourceHandle<C>>
            + Send
            + Sync
            + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Route on the shard key stored with [`with_shard_key`].
    pub fn by_shard_key() -> Self {
        Self::new(|ctx, handles| {
            let key = ctx.value::<ShardKeyRoute>()?;
            handles.iter().find(|h| h.key() == key)
        })
    }

    /// First handle whose conditions contain the condition stored with
    /// [`with_shard_condition`].
    pub fn by_condition() -> Self {
        Self::new(|ctx, handles| {
            let condition = ctx.value::<ShardConditionRoute>()?;
            handles
                .iter()
                .find(|h| h.conditions().iter().any(|c| *c == condition))
        })
    }

    /// Always the handle with `key`.
    pub fn fixed(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(move |_, handles| handles.iter().find(|h| h.key() == key))
    }

    /// Rotate through the handles in construction order.
    pub fn round_robin() -> Self {
        let next = AtomicUsize::new(0);
        Self::new(move |_, handles| {
            if handles.is_empty() {
                return None;
            }
            let idx = next.fetch_add(1, Ordering::Relaxed) % handles.len();
            handles.get(idx)
        })
    }

    pub fn from_kind(kind: SelectorKind) -> Self {
        match kind {
            SelectorKind::ShardKey => Self::by_shard_key(),
            SelectorKind::Condition => Self::by_condition(),
            SelectorKind::RoundRobin => Self::round_robin(),
        }
    }
}

/// Built-in selector named in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    ShardKey,
    Condition,
    RoundRobin,
}

struct ShardKeyRoute;

impl ContextKey for ShardKeyRoute {
    type Value = String;
}

struct ShardConditionRoute;

impl ContextKey for ShardConditionRoute {
    type Value = String;
}

/// Derive a context routed to the shard with `key`.
pub fn with_shard_key(ctx: &Context, key: impl Into<String>) -> Context {
    ctx.with_value::<ShardKeyRoute>(key.into())
}

/// Derive a context routed by a shard condition tag.
pub fn with_shard_condition(ctx: &Context, condition: impl Into<String>) -> Context {
    ctx.with_value::<ShardConditionRoute>(condition.into())
}
