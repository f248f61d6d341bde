//! Scriptable stub engine for exercising the broker without a real database.
//!
//! The stub records every bridge call, can fail opens or individual
//! statements on demand, serves canned rows, and tracks how many batches are
//! in flight at once so tests can assert single-flight execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{
    AttachArgs, BatchEntryResult, BatchOutcome, BatchRequest, EngineError, OpenArgs, SqlEngine,
};
use crate::types::SqlValue;

#[derive(Default)]
struct StubScript {
    fail_sql: Vec<String>,
    canned_rows: HashMap<String, (Vec<String>, Vec<Vec<SqlValue>>)>,
    calls: Vec<String>,
    batches: Vec<Vec<String>>,
}

/// An engine whose behavior is scripted by the test.
#[derive(Default)]
pub struct StubEngine {
    script: Mutex<StubScript>,
    fail_open: AtomicBool,
    open_delay_ms: AtomicU64,
    batch_delay_ms: AtomicU64,
    batches_in_flight: AtomicUsize,
    max_batches_in_flight: AtomicUsize,
}

impl StubEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, StubScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent `open` calls fail.
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Fail any statement whose SQL contains `pattern`.
    pub fn fail_sql_containing(&self, pattern: impl Into<String>) {
        self.script().fail_sql.push(pattern.into());
    }

    /// Serve the given rows for an exact SQL text.
    pub fn respond_with_rows(
        &self,
        sql: impl Into<String>,
        columns: Vec<&str>,
        rows: Vec<Vec<SqlValue>>,
    ) {
        let columns = columns.into_iter().map(str::to_owned).collect();
        self.script()
            .canned_rows
            .insert(sql.into(), (columns, rows));
    }

    /// Delay every `open` call; widens the window where a handle is opening.
    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every batch; widens the window where a transaction is in
    /// progress.
    pub fn set_batch_delay(&self, delay: Duration) {
        self.batch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every bridge call so far, as `method:detail` strings.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    /// The SQL of every batch round dispatched so far, in dispatch order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.script().batches.clone()
    }

    /// Every statement dispatched so far, flattened across rounds.
    #[must_use]
    pub fn dispatched_sql(&self) -> Vec<String> {
        self.script().batches.iter().flatten().cloned().collect()
    }

    /// The largest number of batches that were ever in flight at once.
    #[must_use]
    pub fn max_concurrent_batches(&self) -> usize {
        self.max_batches_in_flight.load(Ordering::SeqCst)
    }

    fn record_call(&self, method: &str, detail: &str) {
        self.script().calls.push(format!("{method}:{detail}"));
    }

    async fn delay(&self, ms: &AtomicU64) {
        let ms = ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl SqlEngine for StubEngine {
    async fn open(&self, args: &OpenArgs) -> Result<(), EngineError> {
        self.record_call("open", &args.name);
        self.delay(&self.open_delay_ms).await;
        if self.fail_open.load(Ordering::SeqCst) {
            Err(EngineError::new("forced open failure", 14))
        } else {
            Ok(())
        }
    }

    async fn close(&self, path: &str) -> Result<(), EngineError> {
        self.record_call("close", path);
        Ok(())
    }

    async fn attach(&self, args: &AttachArgs) -> Result<(), EngineError> {
        self.record_call("attach", &format!("{} as {}", args.db_name, args.db_alias));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), EngineError> {
        self.record_call("delete", path);
        Ok(())
    }

    async fn echo(&self, value: &str) -> Result<String, EngineError> {
        self.record_call("echo", value);
        Ok(value.to_owned())
    }

    async fn execute_batch(
        &self,
        request: BatchRequest,
    ) -> Result<Vec<BatchEntryResult>, EngineError> {
        let in_flight = self.batches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_batches_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        {
            let mut script = self.script();
            script.calls.push(format!("execute-batch:{}", request.dbname));
            script
                .batches
                .push(request.executes.iter().map(|e| e.sql.clone()).collect());
        }
        self.delay(&self.batch_delay_ms).await;

        let results = {
            let script = self.script();
            request
                .executes
                .iter()
                .map(|entry| {
                    let failed = script
                        .fail_sql
                        .iter()
                        .any(|pattern| entry.sql.contains(pattern));
                    let outcome = if failed {
                        BatchOutcome::Error(EngineError::new(
                            format!("forced failure: {}", entry.sql),
                            1,
                        ))
                    } else if let Some((columns, rows)) = script.canned_rows.get(&entry.sql) {
                        BatchOutcome::Rows {
                            columns: columns.clone(),
                            rows: rows.clone(),
                            rows_affected: 0,
                            insert_id: None,
                        }
                    } else {
                        BatchOutcome::Rows {
                            columns: Vec::new(),
                            rows: Vec::new(),
                            rows_affected: 0,
                            insert_id: None,
                        }
                    };
                    BatchEntryResult {
                        qid: entry.qid,
                        outcome,
                    }
                })
                .collect()
        };

        self.batches_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(results)
    }
}
