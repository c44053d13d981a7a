//! Tessera - shard routing and ambient transactions for SQL and Redis
//!
//! Clients are backed by one connection or by a set of shards. Each call
//! picks its shard from the [`Context`](context::Context) it is given, and
//! joins whatever transaction that context carries for its resource kind.
//! A [`CompositeTransactor`](transactor::CompositeTransactor) opens, commits
//! and rolls back SQL and Redis transactions together.
//!
//! ```no_run
//! # async fn demo(sql: tessera::sql::SqlClient) -> tessera::error::Result<()> {
//! use tessera::context::Context;
//! use tessera::transactor::atomic;
//!
//! let transactor = sql.transactor();
//! atomic(&transactor, &Context::background(), |ctx| {
//!     let sql = sql.clone();
//!     async move {
//!         sql.execute(&ctx, sqlx::query("UPDATE accounts SET balance = balance - 10"))
//!             .await?;
//!         Ok(())
//!     }
//! })
//! .await
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
#[cfg(feature = "redis")]
pub mod redis;
pub mod shard;
pub mod sql;
pub mod transactor;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use context::Context;
pub use error::{Result, StorageError};
