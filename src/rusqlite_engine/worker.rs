use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, ToSql};
use tokio::sync::oneshot;

use crate::engine::{BatchEntry, BatchEntryResult, BatchOutcome, EngineError};
use crate::types::SqlValue;

/// Where the worker's connection lives.
pub(super) enum ConnectionTarget {
    Memory,
    File { path: PathBuf, read_only: bool },
}

/// Handle to the worker thread owning one database connection.
pub(super) struct DbWorker {
    sender: Sender<Command>,
}

pub(super) enum Command {
    ExecuteBatch {
        entries: Vec<BatchEntry>,
        respond_to: oneshot::Sender<Vec<BatchEntryResult>>,
    },
    Attach {
        path: String,
        alias: String,
        respond_to: oneshot::Sender<Result<(), EngineError>>,
    },
    Shutdown,
}

impl DbWorker {
    /// Spawn the worker thread and wait for it to open its connection.
    pub(super) async fn spawn(name: &str, target: ConnectionTarget) -> Result<Self, EngineError> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();
        thread::Builder::new()
            .name(format!("sqlite-db-{name}"))
            .spawn(move || {
                let conn = match open_connection(&target) {
                    Ok(conn) => {
                        let _ = ready_tx.send(Ok(()));
                        conn
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                run_worker(&conn, &receiver);
            })
            .map_err(|err| {
                EngineError::new(format!("failed to spawn database worker thread: {err}"), 0)
            })?;

        ready_rx
            .await
            .map_err(|_| EngineError::new("database worker exited before reporting ready", 0))??;
        Ok(Self { sender })
    }

    pub(super) fn command_sender(&self) -> Sender<Command> {
        self.sender.clone()
    }

    pub(super) async fn execute_batch(
        sender: &Sender<Command>,
        entries: Vec<BatchEntry>,
    ) -> Result<Vec<BatchEntryResult>, EngineError> {
        let (respond_to, response) = oneshot::channel();
        sender
            .send(Command::ExecuteBatch {
                entries,
                respond_to,
            })
            .map_err(|_| worker_gone())?;
        response.await.map_err(|_| worker_gone())
    }

    pub(super) async fn attach(
        sender: &Sender<Command>,
        path: String,
        alias: String,
    ) -> Result<(), EngineError> {
        let (respond_to, response) = oneshot::channel();
        sender
            .send(Command::Attach {
                path,
                alias,
                respond_to,
            })
            .map_err(|_| worker_gone())?;
        response.await.map_err(|_| worker_gone())?
    }
}

impl Drop for DbWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

fn worker_gone() -> EngineError {
    EngineError::new("database worker is gone", 0)
}

fn open_connection(target: &ConnectionTarget) -> Result<Connection, EngineError> {
    let result = match target {
        ConnectionTarget::Memory => Connection::open_in_memory(),
        ConnectionTarget::File { path, read_only } => {
            if *read_only {
                Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
            } else {
                Connection::open(path)
            }
        }
    };
    result.map_err(|err| engine_error(&err))
}

fn run_worker(conn: &Connection, receiver: &Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::ExecuteBatch {
                entries,
                respond_to,
            } => {
                let results = entries
                    .iter()
                    .map(|entry| BatchEntryResult {
                        qid: entry.qid,
                        outcome: execute_entry(conn, entry),
                    })
                    .collect();
                let _ = respond_to.send(results);
            }
            Command::Attach {
                path,
                alias,
                respond_to,
            } => {
                // The alias cannot be bound as a parameter, so it must be a
                // bare identifier before it is spliced into the statement.
                let outcome = if is_bare_identifier(&alias) {
                    conn.execute(&format!("ATTACH DATABASE ?1 AS {alias}"), [&path])
                        .map(|_| ())
                        .map_err(|err| engine_error(&err))
                } else {
                    Err(EngineError::new(format!("invalid attach alias: {alias}"), 0))
                };
                let _ = respond_to.send(outcome);
            }
            Command::Shutdown => break,
        }
    }
}

/// Run one batch entry and report its outcome; a failure here never stops
/// later entries in the same batch.
fn execute_entry(conn: &Connection, entry: &BatchEntry) -> BatchOutcome {
    match run_statement(conn, entry) {
        Ok(outcome) => outcome,
        Err(err) => BatchOutcome::Error(engine_error(&err)),
    }
}

fn run_statement(conn: &Connection, entry: &BatchEntry) -> rusqlite::Result<BatchOutcome> {
    let mut stmt = conn.prepare(&entry.sql)?;
    let params = wire_params(&entry.params);
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|value| value as &dyn ToSql).collect();

    if stmt.column_count() > 0 {
        let columns: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
        let column_count = columns.len();
        let mut out_rows = Vec::new();
        let mut rows = stmt.query(&param_refs[..])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                values.push(row_value(row.get_ref(idx)?));
            }
            out_rows.push(values);
        }
        Ok(BatchOutcome::Rows {
            columns,
            rows: out_rows,
            rows_affected: 0,
            insert_id: None,
        })
    } else {
        let rows_affected = stmt.execute(&param_refs[..])? as u64;
        let insert_id = if is_insert(&entry.sql) && rows_affected > 0 {
            Some(conn.last_insert_rowid())
        } else {
            None
        };
        Ok(BatchOutcome::Rows {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected,
            insert_id,
        })
    }
}

fn is_bare_identifier(alias: &str) -> bool {
    let mut chars = alias.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_insert(sql: &str) -> bool {
    sql.trim_start_matches(|c: char| c.is_whitespace() || c == ';')
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("insert"))
}

fn wire_params(params: &[SqlValue]) -> Vec<rusqlite::types::Value> {
    params
        .iter()
        .map(|value| match value {
            SqlValue::Null => rusqlite::types::Value::Null,
            SqlValue::Integer(v) => rusqlite::types::Value::Integer(*v),
            SqlValue::Real(v) => rusqlite::types::Value::Real(*v),
            SqlValue::Text(v) => rusqlite::types::Value::Text(v.clone()),
        })
        .collect()
}

fn row_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        // The wire format has no blob representation; carry bytes as lossy
        // text rather than dropping the column.
        ValueRef::Blob(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn engine_error(err: &rusqlite::Error) -> EngineError {
    let code = match err {
        rusqlite::Error::SqliteFailure(inner, _) => inner.extended_code,
        _ => 0,
    };
    EngineError::new(err.to_string(), code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_alias_must_be_a_bare_identifier() {
        assert!(is_bare_identifier("aux"));
        assert!(is_bare_identifier("_shadow2"));
        assert!(!is_bare_identifier(""));
        assert!(!is_bare_identifier("2aux"));
        assert!(!is_bare_identifier("aux; DROP TABLE t"));
        assert!(!is_bare_identifier("aux\"evil"));
    }
}
