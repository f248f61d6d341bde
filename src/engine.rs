//! The opaque engine boundary.
//!
//! Everything below the broker is reached through [`SqlEngine`]: a named
//! operation, a structured payload, and an asynchronous success or failure
//! result. The broker never inspects SQL beyond the read-only pattern check;
//! preparation, binding, and row production all happen behind this trait.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::types::SqlValue;

/// A failure reported by the engine, normalized to a message and a numeric
/// code.
#[derive(Debug, Clone, Error)]
#[error("sql error (code {code}): {message}")]
pub struct EngineError {
    pub message: String,
    pub code: i32,
}

impl EngineError {
    #[must_use]
    pub fn new(message: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

/// Storage location classes understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbLocation {
    /// Backed-up-excluded default location (`nosync`)
    #[default]
    #[serde(rename = "nosync")]
    Default,
    /// User-visible documents directory
    #[serde(rename = "docs")]
    Documents,
    /// Application library directory
    #[serde(rename = "libs")]
    Library,
    /// App-group shared container
    #[serde(rename = "shared")]
    Shared,
}

/// Options for the engine `open` operation.
#[derive(Debug, Clone, Serialize)]
pub struct OpenArgs {
    /// Database name; the identity key for the handle registry and the
    /// transaction lock table.
    pub name: String,
    #[serde(rename = "dblocation")]
    pub location: DbLocation,
    /// Seed the database from a bundled asset on first open.
    #[serde(rename = "assetFilename", skip_serializing_if = "Option::is_none")]
    pub asset_filename: Option<String>,
    #[serde(rename = "readOnly", skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

impl OpenArgs {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: DbLocation::Default,
            asset_filename: None,
            read_only: false,
        }
    }

    #[must_use]
    pub fn location(mut self, location: DbLocation) -> Self {
        self.location = location;
        self
    }

    #[must_use]
    pub fn asset_filename(mut self, filename: impl Into<String>) -> Self {
        self.asset_filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Options for the engine `attach` operation.
#[derive(Debug, Clone, Serialize)]
pub struct AttachArgs {
    /// Database the attachment is made on
    pub path: String,
    /// File to attach
    #[serde(rename = "dbName")]
    pub db_name: String,
    /// Schema alias the attached file becomes visible under
    #[serde(rename = "dbAlias")]
    pub db_alias: String,
}

/// One statement of a batch, tagged for result correlation.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub qid: u64,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// One round of statements dispatched against a single database.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    pub dbname: String,
    pub executes: Vec<BatchEntry>,
}

/// Per-statement outcome of a batch.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
        rows_affected: u64,
        insert_id: Option<i64>,
    },
    Error(EngineError),
}

/// A batch outcome correlated back to its request entry.
///
/// Results are matched by `qid`, never by list position; engines are free to
/// report completions in any order.
#[derive(Debug, Clone)]
pub struct BatchEntryResult {
    pub qid: u64,
    pub outcome: BatchOutcome,
}

/// The asynchronous native bridge to the SQL engine.
///
/// Implementations execute statements; they make no ordering or atomicity
/// promises beyond running one batch's entries in order. Serialization of
/// transactions and BEGIN/COMMIT/ROLLBACK sequencing are the broker's job.
#[async_trait]
pub trait SqlEngine: Send + Sync {
    /// Open (and create if needed) the named database.
    async fn open(&self, args: &OpenArgs) -> Result<(), EngineError>;

    /// Close the named database.
    async fn close(&self, path: &str) -> Result<(), EngineError>;

    /// Attach another database file under an alias for cross-database
    /// queries.
    async fn attach(&self, args: &AttachArgs) -> Result<(), EngineError>;

    /// Delete the named database.
    async fn delete(&self, path: &str) -> Result<(), EngineError>;

    /// Echo a value back; used as a liveness self-test of the bridge.
    async fn echo(&self, value: &str) -> Result<String, EngineError>;

    /// Execute a batch of statements against one database and report one
    /// outcome per entry.
    async fn execute_batch(
        &self,
        request: BatchRequest,
    ) -> Result<Vec<BatchEntryResult>, EngineError>;
}

/// Trace an engine invocation with its serialized payload.
pub(crate) fn trace_exec<T: Serialize>(method: &str, options: &T) {
    if tracing::enabled!(tracing::Level::DEBUG) {
        let payload = serde_json::to_string(options).unwrap_or_else(|_| "<unserializable>".into());
        tracing::debug!(method, payload, "engine call");
    }
}
