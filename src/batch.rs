//! Batch rounds: one `execute-batch` call per snapshot of the statement
//! queue, with results demultiplexed back to each statement's continuation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::{trace_exec, BatchEntry, BatchOutcome, BatchRequest, SqlEngine};
use crate::error::SqlBrokerError;
use crate::transaction::{QueuedStatement, Transaction};
use crate::types::{SqlRow, StatementResult};

/// Dispatch one batch and hand back the per-entry outcomes keyed by qid.
///
/// A transport-level failure of the bridge call itself is reported as an
/// error; per-statement failures come back inside the map.
async fn dispatch(
    engine: &dyn SqlEngine,
    dbname: &str,
    executes: Vec<BatchEntry>,
) -> Result<HashMap<u64, BatchOutcome>, SqlBrokerError> {
    let request = BatchRequest {
        dbname: dbname.to_owned(),
        executes,
    };
    trace_exec("execute-batch", &request);
    let results = engine
        .execute_batch(request)
        .await
        .map_err(|err| SqlBrokerError::Execution(format!("batch execution error: {err}")))?;
    Ok(results
        .into_iter()
        .map(|entry| (entry.qid, entry.outcome))
        .collect())
}

/// Run a single control statement (BEGIN/COMMIT/ROLLBACK) as its own round.
pub(crate) async fn run_control(
    engine: &dyn SqlEngine,
    tx: &mut Transaction,
    sql: &str,
) -> Result<(), SqlBrokerError> {
    let qid = tx.take_qid();
    let entry = BatchEntry {
        qid,
        sql: sql.to_owned(),
        params: Vec::new(),
    };
    let mut outcomes = dispatch(engine, tx.dbname(), vec![entry]).await?;
    match outcomes.remove(&qid) {
        Some(BatchOutcome::Rows { .. }) => Ok(()),
        Some(BatchOutcome::Error(err)) => Err(SqlBrokerError::Statement(err)),
        None => Err(missing_result(qid)),
    }
}

/// Execute one round of the transaction's queued statements.
///
/// The queue is snapshotted and cleared up front, so statements enqueued by
/// continuations during routing belong to the next round. Every outcome is
/// routed to its statement's continuation even after a failure has been
/// recorded; the first failure (statement failure without an acknowledging
/// handler, or a continuation's own error) is returned and takes the
/// rollback path.
pub(crate) async fn run_round(
    engine: &dyn SqlEngine,
    tx: &mut Transaction,
) -> Option<SqlBrokerError> {
    let snapshot = tx.take_queue();
    if snapshot.is_empty() {
        return None;
    }

    let mut tagged: Vec<(u64, QueuedStatement)> = Vec::with_capacity(snapshot.len());
    let mut executes = Vec::with_capacity(snapshot.len());
    for statement in snapshot {
        let qid = tx.take_qid();
        executes.push(BatchEntry {
            qid,
            sql: statement.sql.clone(),
            params: statement.params.clone(),
        });
        tagged.push((qid, statement));
    }

    let mut outcomes = match dispatch(engine, tx.dbname(), executes).await {
        Ok(outcomes) => outcomes,
        Err(err) => return Some(err),
    };

    let mut first_failure: Option<SqlBrokerError> = None;
    let mut record = |failure: SqlBrokerError| {
        if first_failure.is_none() {
            first_failure = Some(failure);
        }
    };

    for (qid, statement) in tagged {
        match outcomes.remove(&qid) {
            Some(BatchOutcome::Rows {
                columns,
                rows,
                rows_affected,
                insert_id,
            }) => {
                let result = build_statement_result(columns, rows, rows_affected, insert_id);
                if let Some(handler) = statement.on_success {
                    if let Err(err) = handler(tx, &result) {
                        record(err);
                    }
                }
            }
            Some(BatchOutcome::Error(err)) => {
                route_failure(tx, statement, SqlBrokerError::Statement(err), &mut record);
            }
            None => {
                route_failure(tx, statement, missing_result(qid), &mut record);
            }
        }
    }
    first_failure
}

fn route_failure(
    tx: &mut Transaction,
    statement: QueuedStatement,
    failure: SqlBrokerError,
    record: &mut impl FnMut(SqlBrokerError),
) {
    match statement.on_failure {
        Some(handler) => {
            if let Err(err) = handler(tx, &failure) {
                record(err);
            }
        }
        None => record(SqlBrokerError::UnhandledStatement(Box::new(failure))),
    }
}

fn missing_result(qid: u64) -> SqlBrokerError {
    SqlBrokerError::Execution(format!("engine returned no result for statement qid {qid}"))
}

fn build_statement_result(
    columns: Vec<String>,
    rows: Vec<Vec<crate::types::SqlValue>>,
    rows_affected: u64,
    insert_id: Option<i64>,
) -> StatementResult {
    let columns = Arc::new(columns);
    let rows = rows
        .into_iter()
        .map(|values| SqlRow::new(Arc::clone(&columns), values))
        .collect();
    StatementResult::new(rows, rows_affected, insert_id)
}
