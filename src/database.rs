//! A named, stateful handle to one database.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tokio::sync::oneshot;

use crate::broker::{OpenState, SqliteBroker};
use crate::engine::{trace_exec, AttachArgs, OpenArgs};
use crate::error::SqlBrokerError;
use crate::scheduler::PendingTransaction;
use crate::transaction::{Transaction, TransactionWork, TxBody};
use crate::types::{SqlParam, StatementResult};

/// A handle to one named database.
///
/// Handles are cheap to clone; all of them share the broker's registry, so
/// two handles with the same name observe the same open-state and the same
/// transaction lock.
#[derive(Clone)]
pub struct Database {
    broker: SqliteBroker,
    open_args: OpenArgs,
}

impl Database {
    pub(crate) fn new(broker: SqliteBroker, open_args: OpenArgs) -> Self {
        Self { broker, open_args }
    }

    /// The database name; the identity key in the registry.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.open_args.name
    }

    /// Open the database. Idempotent: a name that is already open (or whose
    /// open is in flight) succeeds immediately.
    ///
    /// On success, queued work waiting on the open is scheduled. On failure
    /// the name is deregistered, every queued transaction fails with
    /// [`SqlBrokerError::InvalidHandle`], and
    /// [`SqlBrokerError::OpenFailed`] is returned.
    ///
    /// # Errors
    /// [`SqlBrokerError::OpenFailed`].
    pub async fn open(&self) -> Result<(), SqlBrokerError> {
        {
            let mut state = self.broker.state();
            if state.open_dbs.contains_key(self.name()) {
                tracing::debug!(db = %self.name(), "database already open");
                return Ok(());
            }
            state
                .open_dbs
                .insert(self.name().to_owned(), OpenState::Opening);
        }
        tracing::debug!(db = %self.name(), "OPEN database");
        trace_exec("open", &self.open_args);

        match self.broker.engine().open(&self.open_args).await {
            Ok(()) => {
                let schedule = {
                    let mut state = self.broker.state();
                    if let Some(entry) = state.open_dbs.get_mut(self.name()) {
                        *entry = OpenState::Open;
                        state
                            .tx_locks
                            .get(self.name())
                            .is_some_and(|lock| !lock.queue.is_empty() && !lock.in_progress)
                    } else {
                        tracing::warn!(db = %self.name(), "database was closed during open operation");
                        false
                    }
                };
                if schedule {
                    self.broker.schedule_next(self.name());
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(db = %self.name(), error = %err, "OPEN database failed, aborting any pending transactions");
                {
                    let mut state = self.broker.state();
                    state.open_dbs.remove(self.name());
                }
                self.broker.abort_all_pending(self.name());
                Err(SqlBrokerError::OpenFailed {
                    name: self.name().to_owned(),
                    source: err,
                })
            }
        }
    }

    /// Close the database.
    ///
    /// The transaction lock for the name survives the close: work enqueued
    /// before the close runs when the name is reopened.
    ///
    /// # Errors
    /// [`SqlBrokerError::Busy`] while a transaction is in progress;
    /// [`SqlBrokerError::NotOpen`] when the name is not registered; otherwise
    /// the engine's close failure.
    pub async fn close(&self) -> Result<(), SqlBrokerError> {
        {
            let mut state = self.broker.state();
            if !state.open_dbs.contains_key(self.name()) {
                tracing::debug!(db = %self.name(), "cannot close: database is not open");
                return Err(SqlBrokerError::NotOpen(self.name().to_owned()));
            }
            if state
                .tx_locks
                .get(self.name())
                .is_some_and(|lock| lock.in_progress)
            {
                tracing::debug!(db = %self.name(), "cannot close: transaction is in progress");
                return Err(SqlBrokerError::Busy {
                    name: self.name().to_owned(),
                    operation: "closed",
                });
            }
            state.open_dbs.remove(self.name());
            let queued = state
                .tx_locks
                .get(self.name())
                .map_or(0, |lock| lock.queue.len());
            tracing::debug!(db = %self.name(), queued, "CLOSE database");
        }
        trace_exec("close", &json!({ "path": self.name() }));
        self.broker
            .engine()
            .close(self.name())
            .await
            .map_err(SqlBrokerError::from)
    }

    /// Attach another database file under an alias for cross-database
    /// queries. A direct engine call, gated only by open-state and
    /// in-progress checks.
    ///
    /// # Errors
    /// [`SqlBrokerError::NotOpen`], [`SqlBrokerError::Busy`], or the engine's
    /// attach failure.
    pub async fn attach(
        &self,
        db_name: impl Into<String>,
        alias: impl Into<String>,
    ) -> Result<(), SqlBrokerError> {
        self.ensure_idle("attached")?;
        let args = AttachArgs {
            path: self.name().to_owned(),
            db_name: db_name.into(),
            db_alias: alias.into(),
        };
        tracing::debug!(db = %self.name(), attach = %args.db_name, alias = %args.db_alias, "ATTACH database");
        trace_exec("attach", &args);
        self.broker
            .engine()
            .attach(&args)
            .await
            .map_err(SqlBrokerError::from)
    }

    /// Detach a previously attached alias. Routed as a `DETACH DATABASE`
    /// statement through the normal transaction path.
    ///
    /// # Errors
    /// [`SqlBrokerError::NotOpen`], [`SqlBrokerError::Busy`], or the
    /// statement's failure.
    pub async fn detach(&self, alias: impl Into<String>) -> Result<StatementResult, SqlBrokerError> {
        self.ensure_idle("detached")?;
        let alias = alias.into();
        tracing::debug!(db = %self.name(), alias = %alias, "DETACH database");
        self.execute_sql(format!("DETACH DATABASE {alias}"), Vec::new())
            .await
    }

    /// Execute one statement inside an implicit non-locking transaction.
    ///
    /// No BEGIN/COMMIT/ROLLBACK round-trips are made; the statement is
    /// admitted through the transaction lock like any other transaction.
    ///
    /// # Errors
    /// [`SqlBrokerError::NotOpen`] or the statement's failure.
    pub async fn execute_sql(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<StatementResult, SqlBrokerError> {
        let sql = sql.into();
        let slot: Arc<Mutex<Option<StatementResult>>> = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&slot);
        let body: TxBody = Box::new(move |tx| {
            tx.execute_sql_with(
                sql,
                params,
                Some(Box::new(move |_tx, result| {
                    *captured.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(result.clone());
                    Ok(())
                })),
                None,
            )
        });
        self.run_transaction(body, false, false).await?;
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SqlBrokerError::Execution("statement produced no result".into()))
    }

    /// Run a read-write transaction.
    ///
    /// The body executes synchronously once BEGIN has succeeded and
    /// populates the statement queue by calling back into the
    /// [`Transaction`]; it does not run statements itself.
    ///
    /// # Errors
    /// [`SqlBrokerError::NotOpen`] when the handle is unregistered, otherwise
    /// the transaction's terminal failure.
    pub async fn transaction<F>(&self, body: F) -> Result<(), SqlBrokerError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), SqlBrokerError> + Send + 'static,
    {
        self.run_transaction(Box::new(body), true, false).await
    }

    /// Run a read-only transaction: statements matching the mutating pattern
    /// are rejected without dispatch.
    ///
    /// # Errors
    /// As [`Database::transaction`].
    pub async fn read_transaction<F>(&self, body: F) -> Result<(), SqlBrokerError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), SqlBrokerError> + Send + 'static,
    {
        self.run_transaction(Box::new(body), true, true).await
    }

    async fn run_transaction(
        &self,
        body: TxBody,
        txlock: bool,
        read_only: bool,
    ) -> Result<(), SqlBrokerError> {
        let (done, outcome) = oneshot::channel();
        let pending = PendingTransaction {
            work: TransactionWork {
                dbname: self.name().to_owned(),
                body,
                txlock,
                read_only,
            },
            done,
        };
        self.broker.enqueue_transaction(self.name(), pending)?;
        outcome.await.map_err(|_| {
            SqlBrokerError::Connection("transaction was dropped before completion".into())
        })?
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<(), SqlBrokerError> {
        let state = self.broker.state();
        if !state.open_dbs.contains_key(self.name()) {
            return Err(SqlBrokerError::NotOpen(self.name().to_owned()));
        }
        if state
            .tx_locks
            .get(self.name())
            .is_some_and(|lock| lock.in_progress)
        {
            return Err(SqlBrokerError::Busy {
                name: self.name().to_owned(),
                operation,
            });
        }
        Ok(())
    }
}
