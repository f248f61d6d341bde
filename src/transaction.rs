//! Transactions: an ordered statement queue wrapped in BEGIN/COMMIT/ROLLBACK.
//!
//! A transaction is driven entirely by the scheduler. For a locking
//! transaction the driver first runs a BEGIN-only round; only when BEGIN
//! succeeds does the caller's body run, synchronously enqueueing statements.
//! The queued statements then execute in batch rounds until the queue drains
//! or a failure is recorded, and the driver closes with a COMMIT or ROLLBACK
//! round. Non-locking transactions (bare statement execution) skip all three
//! control rounds.

use std::sync::LazyLock;

use regex::Regex;

use crate::batch;
use crate::engine::SqlEngine;
use crate::error::SqlBrokerError;
use crate::types::{SqlParam, SqlValue, StatementResult};

// Second capture group intentionally omits a trailing word boundary; the
// original contract treats any statement whose first token starts with one of
// these keywords as mutating.
static MUTATING_SQL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\s|;)*(alter|create|delete|drop|insert|reindex|replace|update)")
        .expect("mutating-statement pattern is a valid regex")
});

/// The body of a transaction; runs synchronously and populates the statement
/// queue by calling back into the [`Transaction`].
pub type TxBody = Box<dyn FnOnce(&mut Transaction) -> Result<(), SqlBrokerError> + Send>;

/// Per-statement success continuation. May enqueue follow-up statements,
/// which run in the next round. An `Err` becomes the transaction failure
/// (first failure wins).
pub type SuccessHandler =
    Box<dyn FnOnce(&mut Transaction, &StatementResult) -> Result<(), SqlBrokerError> + Send>;

/// Per-statement failure continuation. Returning `Ok(())` acknowledges the
/// failure and lets the transaction proceed; returning an `Err` escalates it
/// to the transaction.
pub type FailureHandler =
    Box<dyn FnOnce(&mut Transaction, &SqlBrokerError) -> Result<(), SqlBrokerError> + Send>;

/// A statement waiting in the queue for the next batch round.
pub(crate) struct QueuedStatement {
    pub(crate) sql: String,
    pub(crate) params: Vec<SqlValue>,
    pub(crate) on_success: Option<SuccessHandler>,
    pub(crate) on_failure: Option<FailureHandler>,
}

/// A transaction request as it sits in the per-database queue.
pub(crate) struct TransactionWork {
    pub(crate) dbname: String,
    pub(crate) body: TxBody,
    pub(crate) txlock: bool,
    pub(crate) read_only: bool,
}

/// An in-flight transaction, handed to the body and to statement
/// continuations.
pub struct Transaction {
    dbname: String,
    txlock: bool,
    read_only: bool,
    started: bool,
    finalized: bool,
    pub(crate) queue: Vec<QueuedStatement>,
    next_qid: u64,
}

impl Transaction {
    fn new(dbname: String, txlock: bool, read_only: bool) -> Self {
        Self {
            dbname,
            txlock,
            read_only,
            started: false,
            finalized: false,
            queue: Vec::new(),
            next_qid: 1,
        }
    }

    /// The name of the database this transaction runs against.
    #[must_use]
    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Whether this transaction is wrapped in BEGIN/COMMIT/ROLLBACK.
    #[must_use]
    pub fn is_locking(&self) -> bool {
        self.txlock
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Queue a statement with no per-statement continuations.
    ///
    /// # Errors
    /// See [`Transaction::execute_sql_with`].
    pub fn execute_sql(
        &mut self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<(), SqlBrokerError> {
        self.execute_sql_with(sql, params, None, None)
    }

    /// Queue a statement for the next batch round.
    ///
    /// Rejections happen here, before anything is dispatched: the transaction
    /// must be started and not finalized, a read-only transaction refuses
    /// mutating SQL, and every parameter must have a wire representation.
    /// When a rejected statement carries a failure continuation the error is
    /// routed there instead; the continuation acknowledging it (returning
    /// `Ok`) drops the statement without failing the transaction.
    ///
    /// # Errors
    /// [`SqlBrokerError::TransactionFinalized`],
    /// [`SqlBrokerError::TransactionNotStarted`],
    /// [`SqlBrokerError::ReadOnlyViolation`], or
    /// [`SqlBrokerError::Parameter`].
    pub fn execute_sql_with(
        &mut self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
        on_success: Option<SuccessHandler>,
        on_failure: Option<FailureHandler>,
    ) -> Result<(), SqlBrokerError> {
        if self.finalized {
            return Err(SqlBrokerError::TransactionFinalized);
        }
        if !self.started {
            return Err(SqlBrokerError::TransactionNotStarted);
        }
        let sql = sql.into();
        if self.read_only && MUTATING_SQL.is_match(&sql) {
            return self.reject_statement(SqlBrokerError::ReadOnlyViolation(sql), on_failure);
        }
        let mut normalized = Vec::with_capacity(params.len());
        for param in params {
            match param.normalize() {
                Ok(value) => normalized.push(value),
                Err(err) => return self.reject_statement(err, on_failure),
            }
        }
        self.add_statement(sql, normalized, on_success, on_failure);
        Ok(())
    }

    /// Route a pre-dispatch rejection to the statement's failure continuation
    /// when one exists.
    fn reject_statement(
        &mut self,
        failure: SqlBrokerError,
        on_failure: Option<FailureHandler>,
    ) -> Result<(), SqlBrokerError> {
        tracing::debug!(db = %self.dbname, error = %failure, "statement rejected without dispatch");
        match on_failure {
            Some(handler) => handler(self, &failure),
            None => Err(failure),
        }
    }

    pub(crate) fn add_statement(
        &mut self,
        sql: String,
        params: Vec<SqlValue>,
        on_success: Option<SuccessHandler>,
        on_failure: Option<FailureHandler>,
    ) {
        self.queue.push(QueuedStatement {
            sql,
            params,
            on_success,
            on_failure,
        });
    }

    pub(crate) fn take_queue(&mut self) -> Vec<QueuedStatement> {
        std::mem::take(&mut self.queue)
    }

    pub(crate) fn take_qid(&mut self) -> u64 {
        let qid = self.next_qid;
        self.next_qid += 1;
        qid
    }
}

/// Drive one admitted transaction to its terminal state.
///
/// This is the only place a transaction executes; the scheduler guarantees at
/// most one invocation per database at a time.
pub(crate) async fn run(engine: &dyn SqlEngine, work: TransactionWork) -> Result<(), SqlBrokerError> {
    let mut tx = Transaction::new(work.dbname, work.txlock, work.read_only);
    tx.started = true;

    if tx.txlock {
        // BEGIN gets its own round: if it fails, the body never runs and none
        // of its statements reach the engine.
        if let Err(err) = batch::run_control(engine, &mut tx, "BEGIN").await {
            tx.finalized = true;
            tracing::warn!(db = %tx.dbname, error = %err, "BEGIN failed");
            return Err(SqlBrokerError::BeginFailed(Box::new(err)));
        }
    }

    let failure = match (work.body)(&mut tx) {
        Err(err) => Some(err),
        Ok(()) => {
            let mut first_failure = None;
            while first_failure.is_none() && !tx.queue.is_empty() {
                first_failure = batch::run_round(engine, &mut tx).await;
            }
            first_failure
        }
    };

    match failure {
        None => finish(engine, &mut tx).await,
        Some(err) => abort(engine, &mut tx, err).await,
    }
}

/// Commit path. Single-shot; a COMMIT failure surfaces as
/// [`SqlBrokerError::CommitFailed`] even though every statement succeeded.
async fn finish(engine: &dyn SqlEngine, tx: &mut Transaction) -> Result<(), SqlBrokerError> {
    if tx.finalized {
        return Ok(());
    }
    tx.finalized = true;
    if tx.txlock {
        batch::run_control(engine, tx, "COMMIT")
            .await
            .map_err(|err| SqlBrokerError::CommitFailed(Box::new(err)))?;
    }
    tracing::debug!(db = %tx.dbname, "transaction finished");
    Ok(())
}

/// Rollback path. The original failure is reported when ROLLBACK succeeds;
/// a rollback failure wraps both errors.
async fn abort(
    engine: &dyn SqlEngine,
    tx: &mut Transaction,
    failure: SqlBrokerError,
) -> Result<(), SqlBrokerError> {
    if tx.finalized {
        return Err(failure);
    }
    tx.finalized = true;
    tx.queue.clear();
    if tx.txlock {
        if let Err(rollback) = batch::run_control(engine, tx, "ROLLBACK").await {
            tracing::warn!(db = %tx.dbname, error = %rollback, "ROLLBACK failed");
            return Err(SqlBrokerError::RollbackFailed {
                original: Box::new(failure),
                rollback: Box::new(rollback),
            });
        }
    }
    tracing::debug!(db = %tx.dbname, error = %failure, "transaction aborted");
    Err(failure)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_tx(read_only: bool) -> Transaction {
        let mut tx = Transaction::new("test.db".into(), true, read_only);
        tx.started = true;
        tx
    }

    #[test]
    fn mutating_pattern_matches_all_keywords() {
        for sql in [
            "ALTER TABLE t ADD COLUMN c",
            "create table t(id integer)",
            "DELETE FROM t",
            "drop table t",
            "Insert into t values (1)",
            "REINDEX t",
            "replace into t values (1)",
            "update t set id = 2",
        ] {
            assert!(MUTATING_SQL.is_match(sql), "expected match: {sql}");
        }
    }

    #[test]
    fn mutating_pattern_allows_leading_whitespace_and_semicolons() {
        assert!(MUTATING_SQL.is_match(" ;\n\t ; INSERT INTO t VALUES (1)"));
        assert!(!MUTATING_SQL.is_match("SELECT * FROM t"));
        assert!(!MUTATING_SQL.is_match(" ;; select insert_count from t"));
    }

    #[test]
    fn read_only_transaction_rejects_mutations_without_queueing() {
        let mut tx = started_tx(true);
        let err = tx
            .execute_sql("INSERT INTO t VALUES (1)", vec![])
            .unwrap_err();
        assert!(matches!(err, SqlBrokerError::ReadOnlyViolation(_)));
        assert!(tx.queue.is_empty());

        tx.execute_sql("SELECT 1", vec![]).unwrap();
        assert_eq!(tx.queue.len(), 1);
    }

    #[test]
    fn rejection_routes_to_failure_handler() {
        let mut tx = started_tx(true);
        // Handler acknowledges the failure; the transaction is untouched.
        tx.execute_sql_with(
            "DROP TABLE t",
            vec![],
            None,
            Some(Box::new(|_, err| {
                assert!(matches!(err, SqlBrokerError::ReadOnlyViolation(_)));
                Ok(())
            })),
        )
        .unwrap();
        assert!(tx.queue.is_empty());
    }

    #[test]
    fn finalized_transaction_refuses_statements() {
        let mut tx = started_tx(false);
        tx.finalized = true;
        let err = tx.execute_sql("SELECT 1", vec![]).unwrap_err();
        assert!(matches!(err, SqlBrokerError::TransactionFinalized));
    }

    #[test]
    fn unstarted_transaction_refuses_statements() {
        let mut tx = Transaction::new("test.db".into(), true, false);
        let err = tx.execute_sql("SELECT 1", vec![]).unwrap_err();
        assert!(matches!(err, SqlBrokerError::TransactionNotStarted));
    }

    #[test]
    fn params_normalize_on_enqueue() {
        let mut tx = started_tx(false);
        tx.execute_sql(
            "INSERT INTO t VALUES (?, ?)",
            vec![SqlParam::Bool(true), SqlParam::Null],
        )
        .unwrap();
        assert_eq!(
            tx.queue[0].params,
            vec![SqlValue::Integer(1), SqlValue::Null]
        );
    }
}
