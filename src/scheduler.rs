//! Per-database transaction admission: a FIFO queue plus an in-progress
//! flag, shared between the database handle and the scheduler.
//!
//! Scheduling decisions happen at exactly three trigger points: a
//! transaction finishing or aborting, a handle finishing its open, and a new
//! transaction being enqueued against an already-open handle. Admission
//! always runs on a freshly spawned task so it is never synchronously
//! re-entrant with the caller.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::broker::{OpenState, SqliteBroker};
use crate::error::SqlBrokerError;
use crate::transaction::{self, TransactionWork};

/// A transaction waiting for admission, paired with the channel its final
/// outcome is reported on.
pub(crate) struct PendingTransaction {
    pub(crate) work: TransactionWork,
    pub(crate) done: oneshot::Sender<Result<(), SqlBrokerError>>,
}

/// Transaction lock for one database name.
///
/// Created lazily on the first transaction request and kept across
/// close/reopen cycles of the name, so work enqueued before a close runs when
/// the database comes back.
#[derive(Default)]
pub(crate) struct TxLock {
    pub(crate) queue: VecDeque<PendingTransaction>,
    pub(crate) in_progress: bool,
}

impl SqliteBroker {
    /// Append a transaction to the lock's queue and, when the handle is fully
    /// open, kick the scheduler. A handle still opening leaves the entry
    /// queued; open completion triggers scheduling.
    ///
    /// The open-state is read in the same critical section as the push: a
    /// concurrent open completing between the two would otherwise see an
    /// empty queue while the enqueue sees a stale `Opening`, and the entry
    /// would never be admitted.
    ///
    /// # Errors
    /// [`SqlBrokerError::NotOpen`] when the name is unregistered; the entry
    /// is not queued.
    pub(crate) fn enqueue_transaction(
        &self,
        name: &str,
        pending: PendingTransaction,
    ) -> Result<(), SqlBrokerError> {
        let open_state = {
            let mut state = self.state();
            let Some(open_state) = state.open_dbs.get(name).copied() else {
                return Err(SqlBrokerError::NotOpen(name.to_owned()));
            };
            state
                .tx_locks
                .entry(name.to_owned())
                .or_default()
                .queue
                .push_back(pending);
            open_state
        };
        match open_state {
            OpenState::Open => self.schedule_next(name),
            OpenState::Opening => {
                tracing::debug!(db = name, "new transaction is waiting for open operation");
            }
        }
        Ok(())
    }

    /// Admit the next queued transaction from a fresh task.
    pub(crate) fn schedule_next(&self, name: &str) {
        let broker = self.clone();
        let name = name.to_owned();
        tokio::spawn(async move {
            broker.admit_loop(&name).await;
        });
    }

    /// Pop and run queued transactions one at a time until the queue drains
    /// or the handle stops being open.
    async fn admit_loop(&self, name: &str) {
        loop {
            let pending = {
                let mut state = self.state();
                if state.open_dbs.get(name) != Some(&OpenState::Open) {
                    tracing::debug!(db = name, "cannot start next transaction: database not open");
                    return;
                }
                let Some(lock) = state.tx_locks.get_mut(name) else {
                    tracing::debug!(
                        db = name,
                        "cannot start next transaction: database connection is lost"
                    );
                    return;
                };
                if lock.in_progress {
                    return;
                }
                let Some(pending) = lock.queue.pop_front() else {
                    return;
                };
                lock.in_progress = true;
                pending
            };

            let result = transaction::run(self.engine(), pending.work).await;

            {
                let mut state = self.state();
                if let Some(lock) = state.tx_locks.get_mut(name) {
                    lock.in_progress = false;
                }
            }
            // Receiver may have been dropped; the transaction still ran to
            // completion either way.
            let _ = pending.done.send(result);
        }
    }

    /// Fail every queued transaction with an invalid-handle error; used when
    /// the handle's open attempt fails and cannot be resumed.
    pub(crate) fn abort_all_pending(&self, name: &str) {
        let drained: Vec<PendingTransaction> = {
            let mut state = self.state();
            match state.tx_locks.get_mut(name) {
                Some(lock) => {
                    lock.in_progress = false;
                    lock.queue.drain(..).collect()
                }
                None => Vec::new(),
            }
        };
        if !drained.is_empty() {
            tracing::warn!(
                db = name,
                count = drained.len(),
                "aborting pending transactions"
            );
        }
        for pending in drained {
            let _ = pending.done.send(Err(SqlBrokerError::InvalidHandle));
        }
    }
}
