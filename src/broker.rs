//! The process-scoped coordinating service.
//!
//! `SqliteBroker` owns the open-handle registry and the per-name transaction
//! lock table; both live behind one mutex with short critical sections that
//! never span an await. The engine is injected at construction, so tests run
//! against fully isolated broker instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;

use crate::database::Database;
use crate::engine::{trace_exec, OpenArgs, SqlEngine};
use crate::error::SqlBrokerError;
use crate::scheduler::TxLock;

const ECHO_CANARY: &str = "test-string";

/// Open-state of a registered database name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenState {
    /// The engine open call is in flight; transactions queue but do not run.
    Opening,
    /// Fully open; statements and transactions may execute.
    Open,
}

pub(crate) struct BrokerState {
    pub(crate) open_dbs: HashMap<String, OpenState>,
    pub(crate) tx_locks: HashMap<String, TxLock>,
}

struct BrokerInner {
    engine: Arc<dyn SqlEngine>,
    state: Mutex<BrokerState>,
}

/// Client-side transaction broker in front of an asynchronous SQL engine.
///
/// Cheap to clone; every clone shares the same registry and lock table.
#[derive(Clone)]
pub struct SqliteBroker {
    inner: Arc<BrokerInner>,
}

impl SqliteBroker {
    /// Build a broker around the given engine.
    #[must_use]
    pub fn new(engine: Arc<dyn SqlEngine>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                engine,
                state: Mutex::new(BrokerState {
                    open_dbs: HashMap::new(),
                    tx_locks: HashMap::new(),
                }),
            }),
        }
    }

    pub(crate) fn engine(&self) -> &dyn SqlEngine {
        self.inner.engine.as_ref()
    }

    // A poisoned mutex only means another task panicked mid-update of plain
    // registry maps; recover the guard rather than propagating the panic.
    pub(crate) fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Construct a handle without touching the engine; call
    /// [`Database::open`] before use.
    #[must_use]
    pub fn database(&self, args: OpenArgs) -> Database {
        Database::new(self.clone(), args)
    }

    /// Construct and open a handle in one step.
    ///
    /// # Errors
    /// Returns [`SqlBrokerError::OpenFailed`] when the engine refuses the
    /// open; any transactions already queued against the name are failed with
    /// [`SqlBrokerError::InvalidHandle`].
    pub async fn open_database(&self, args: OpenArgs) -> Result<Database, SqlBrokerError> {
        let db = self.database(args);
        db.open().await?;
        Ok(db)
    }

    /// Remove the name from the registry and delete the database through the
    /// engine.
    ///
    /// # Errors
    /// Propagates the engine's delete failure.
    pub async fn delete_database(&self, name: &str) -> Result<(), SqlBrokerError> {
        {
            let mut state = self.state();
            state.open_dbs.remove(name);
        }
        trace_exec("delete", &json!({ "path": name }));
        self.engine().delete(name).await.map_err(SqlBrokerError::from)
    }

    /// Round-trip a canary value through the engine's echo operation.
    ///
    /// # Errors
    /// Returns [`SqlBrokerError::Execution`] on a mismatched echo, or the
    /// engine's own failure.
    pub async fn echo_test(&self) -> Result<(), SqlBrokerError> {
        trace_exec("echo", &json!({ "value": ECHO_CANARY }));
        let echoed = self.engine().echo(ECHO_CANARY).await?;
        if echoed == ECHO_CANARY {
            Ok(())
        } else {
            Err(SqlBrokerError::Execution(format!(
                "echo mismatch: got {echoed}, expected {ECHO_CANARY}"
            )))
        }
    }
}
