//! Client-side transaction broker for embedded SQL engines reached over an
//! asynchronous bridge.
//!
//! The broker guarantees that at most one transaction is in flight against a
//! given database at a time, admits queued transactions in FIFO order,
//! pipelines the statements of one transaction round into a single batched
//! engine call, and sequences BEGIN/COMMIT/ROLLBACK around user statement
//! sequences with automatic rollback on partial failure.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sqlite_broker::prelude::*;
//! use sqlite_broker::rusqlite_engine::RusqliteEngine;
//!
//! # async fn demo() -> Result<(), SqlBrokerError> {
//! let broker = SqliteBroker::new(Arc::new(RusqliteEngine::in_memory()));
//! let db = broker.open_database(OpenArgs::new("app.db")).await?;
//!
//! db.execute_sql("CREATE TABLE t(id INTEGER)", vec![]).await?;
//! db.transaction(|tx| {
//!     tx.execute_sql("INSERT INTO t VALUES (?)", vec![SqlParam::Integer(1)])?;
//!     tx.execute_sql("INSERT INTO t VALUES (?)", vec![SqlParam::Integer(2)])
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

mod batch;
pub mod broker;
pub mod database;
pub mod engine;
pub mod error;
pub mod prelude;
#[cfg(feature = "rusqlite-engine")]
pub mod rusqlite_engine;
mod scheduler;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transaction;
pub mod types;

pub use broker::SqliteBroker;
pub use database::Database;
pub use engine::{
    AttachArgs, BatchEntry, BatchEntryResult, BatchOutcome, BatchRequest, DbLocation, EngineError,
    OpenArgs, SqlEngine,
};
pub use error::SqlBrokerError;
pub use transaction::{FailureHandler, SuccessHandler, Transaction};
pub use types::{SqlParam, SqlRow, SqlValue, StatementResult};
