//! Database layer for herald.
//!
//! Provides the SQLite connection pool (via `r2d2`) and the embedded SQL
//! migrations that create the `notifications` audit table. The notification
//! core only ever sees a [`DbPool`]; it never opens files itself.
//!
//! WAL mode is enabled on every pooled connection so the read endpoints can
//! page through the audit log while request handlers keep inserting.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
