//! Convenience re-exports for the common broker surface.
//!
//! ```rust
//! use sqlite_broker::prelude::*;
//! ```

pub use crate::broker::SqliteBroker;
pub use crate::database::Database;
pub use crate::engine::{DbLocation, EngineError, OpenArgs, SqlEngine};
pub use crate::error::SqlBrokerError;
pub use crate::transaction::Transaction;
pub use crate::types::{SqlParam, SqlRow, SqlValue, StatementResult};
