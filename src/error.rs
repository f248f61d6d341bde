use thiserror::Error;

use crate::engine::EngineError;

/// Every failure surfaced by the broker.
#[derive(Debug, Error)]
pub enum SqlBrokerError {
    /// The named database is not in the open registry.
    #[error("database not open: {0}")]
    NotOpen(String),

    /// The engine refused to open the database; any transactions queued
    /// behind the open have been failed with [`SqlBrokerError::InvalidHandle`].
    #[error("Could not open database {name}: {source}")]
    OpenFailed {
        name: String,
        #[source]
        source: EngineError,
    },

    /// A structural operation was requested while a transaction holds the
    /// database.
    #[error("database {name} cannot be {operation} while a transaction is in progress")]
    Busy {
        name: String,
        operation: &'static str,
    },

    /// Issued to queued transactions when their handle's open attempt fails.
    #[error("invalid database handle")]
    InvalidHandle,

    /// A statement failed inside the engine.
    #[error(transparent)]
    Statement(#[from] EngineError),

    /// A statement failed and no failure continuation was registered for it.
    #[error("a statement with no error handler failed: {0}")]
    UnhandledStatement(#[source] Box<SqlBrokerError>),

    /// A parameter value has no wire representation.
    #[error("parameter conversion error: {0}")]
    Parameter(String),

    /// A mutating statement was issued inside a read-only transaction.
    #[error("invalid sql for a read-only transaction: {0}")]
    ReadOnlyViolation(String),

    /// A statement was added after COMMIT/ROLLBACK had been issued.
    #[error("transaction is already finalized; statements are not accepted after commit/rollback")]
    TransactionFinalized,

    /// A statement was added before the transaction was started.
    #[error("transaction not started yet")]
    TransactionNotStarted,

    /// BEGIN itself failed; none of the body's statements reached the engine.
    #[error("unable to begin transaction: {0}")]
    BeginFailed(#[source] Box<SqlBrokerError>),

    /// COMMIT failed after every statement succeeded.
    #[error("error while trying to commit: {0}")]
    CommitFailed(#[source] Box<SqlBrokerError>),

    /// ROLLBACK failed while aborting; carries both the rollback error and
    /// the failure that triggered the abort.
    #[error("error while trying to roll back: {rollback} (original failure: {original})")]
    RollbackFailed {
        original: Box<SqlBrokerError>,
        rollback: Box<SqlBrokerError>,
    },

    /// The bridge to the engine broke down (channel closed, worker gone).
    #[error("connection error: {0}")]
    Connection(String),

    /// Anything that does not fit the variants above.
    #[error("execution error: {0}")]
    Execution(String),
}

impl SqlBrokerError {
    /// The numeric engine code for statement failures, `0` otherwise.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            SqlBrokerError::Statement(err) => err.code,
            SqlBrokerError::UnhandledStatement(inner) => inner.code(),
            SqlBrokerError::BeginFailed(inner) | SqlBrokerError::CommitFailed(inner) => {
                inner.code()
            }
            SqlBrokerError::RollbackFailed { rollback, .. } => rollback.code(),
            _ => 0,
        }
    }
}
