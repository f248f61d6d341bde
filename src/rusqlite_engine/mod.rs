//! A real [`SqlEngine`] backed by `rusqlite`.
//!
//! Each open database name gets a dedicated worker thread owning the
//! `rusqlite::Connection`; commands travel over an mpsc channel and results
//! come back on oneshot channels, so the blocking SQLite calls never run on
//! the async runtime.

mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::engine::{
    AttachArgs, BatchEntryResult, BatchRequest, EngineError, OpenArgs, SqlEngine,
};

use worker::{ConnectionTarget, DbWorker};

/// Engine storing databases either in per-name memory connections or as
/// files under a base directory.
pub struct RusqliteEngine {
    base_dir: Option<PathBuf>,
    workers: Mutex<HashMap<String, DbWorker>>,
}

impl RusqliteEngine {
    /// Every database name gets its own private in-memory connection;
    /// contents vanish on close.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            base_dir: None,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Databases live as files named after their handle under `dir`.
    #[must_use]
    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(dir.into()),
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn target_for(&self, name: &str, read_only: bool) -> ConnectionTarget {
        match &self.base_dir {
            Some(dir) => ConnectionTarget::File {
                path: dir.join(name),
                read_only,
            },
            None => ConnectionTarget::Memory,
        }
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, DbWorker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker_sender(&self, name: &str) -> Result<std::sync::mpsc::Sender<worker::Command>, EngineError> {
        self.workers()
            .get(name)
            .map(DbWorker::command_sender)
            .ok_or_else(|| EngineError::new(format!("database not open: {name}"), 0))
    }
}

#[async_trait]
impl SqlEngine for RusqliteEngine {
    async fn open(&self, args: &OpenArgs) -> Result<(), EngineError> {
        if self.workers().contains_key(&args.name) {
            return Ok(());
        }
        let target = self.target_for(&args.name, args.read_only);
        let worker = DbWorker::spawn(&args.name, target).await?;
        self.workers().insert(args.name.clone(), worker);
        Ok(())
    }

    async fn close(&self, path: &str) -> Result<(), EngineError> {
        // Dropping the worker sends it a shutdown command.
        match self.workers().remove(path) {
            Some(_worker) => Ok(()),
            None => Err(EngineError::new(format!("database not open: {path}"), 0)),
        }
    }

    async fn attach(&self, args: &AttachArgs) -> Result<(), EngineError> {
        let attach_path = match &self.base_dir {
            Some(dir) => dir.join(&args.db_name).to_string_lossy().into_owned(),
            None => args.db_name.clone(),
        };
        let sender = self.worker_sender(&args.path)?;
        DbWorker::attach(&sender, attach_path, args.db_alias.clone()).await
    }

    async fn delete(&self, path: &str) -> Result<(), EngineError> {
        self.workers().remove(path);
        if let Some(dir) = &self.base_dir {
            let file = dir.join(path);
            match std::fs::remove_file(&file) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(EngineError::new(
                    format!("could not delete {}: {err}", file.display()),
                    0,
                )),
            }
        } else {
            Ok(())
        }
    }

    async fn echo(&self, value: &str) -> Result<String, EngineError> {
        Ok(value.to_owned())
    }

    async fn execute_batch(
        &self,
        request: BatchRequest,
    ) -> Result<Vec<BatchEntryResult>, EngineError> {
        let sender = self.worker_sender(&request.dbname)?;
        DbWorker::execute_batch(&sender, request.executes).await
    }
}
