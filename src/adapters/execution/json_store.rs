//! JSON-file execution store.
//!
//! One pretty-printed record per execution at `<dir>/<id>.json` with its
//! checkpoints next to it at `<dir>/<id>.checkpoints.json`. Nothing is
//! cached; every call goes to disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::adapters::fs_lock::write_atomic;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Checkpoint, ExecutionId, ExecutionRecord};
use crate::domain::ports::ExecutionStore;

const CHECKPOINT_SUFFIX: &str = ".checkpoints.json";

#[derive(Debug, Clone)]
pub struct JsonExecutionStore {
    dir: PathBuf,
}

impl JsonExecutionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &ExecutionId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn checkpoint_path(&self, id: &ExecutionId) -> PathBuf {
        self.dir.join(format!("{id}{CHECKPOINT_SUFFIX}"))
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> DomainResult<Option<T>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn list_sync(&self) -> DomainResult<Vec<ExecutionRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || name.ends_with(CHECKPOINT_SUFFIX) || name.starts_with('.')
            {
                continue;
            }
            match Self::read_json::<ExecutionRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

#[async_trait]
impl ExecutionStore for JsonExecutionStore {
    async fn save(&self, record: &ExecutionRecord) -> DomainResult<()> {
        let path = self.record_path(&record.execution_id);
        let body = serde_json::to_vec_pretty(record)?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .map_err(|e| DomainError::Io(format!("record write aborted: {e}")))??;
        debug!(execution_id = %record.execution_id, status = %record.status, "execution record saved");
        Ok(())
    }

    async fn load(&self, id: &ExecutionId) -> DomainResult<Option<ExecutionRecord>> {
        let path = self.record_path(id);
        tokio::task::spawn_blocking(move || Self::read_json(&path))
            .await
            .map_err(|e| DomainError::Io(format!("record read aborted: {e}")))?
    }

    async fn exists(&self, id: &ExecutionId) -> DomainResult<bool> {
        Ok(tokio::fs::try_exists(self.record_path(id)).await?)
    }

    async fn list(&self) -> DomainResult<Vec<ExecutionRecord>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_sync())
            .await
            .map_err(|e| DomainError::Io(format!("record listing aborted: {e}")))?
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> DomainResult<()> {
        let path = self.checkpoint_path(&checkpoint.execution_id);
        let checkpoint = checkpoint.clone();
        tokio::task::spawn_blocking(move || -> DomainResult<()> {
            let mut list: Vec<Checkpoint> = Self::read_json(&path)?.unwrap_or_default();
            if let Some(last) = list.last() {
                if checkpoint.sequence <= last.sequence {
                    return Err(DomainError::ValidationFailed(format!(
                        "checkpoint sequence {} does not follow {}",
                        checkpoint.sequence, last.sequence
                    )));
                }
            }
            list.push(checkpoint);
            write_atomic(&path, &serde_json::to_vec_pretty(&list)?)?;
            Ok(())
        })
        .await
        .map_err(|e| DomainError::Io(format!("checkpoint write aborted: {e}")))?
    }

    async fn checkpoints(&self, id: &ExecutionId) -> DomainResult<Vec<Checkpoint>> {
        let path = self.checkpoint_path(id);
        let mut list: Vec<Checkpoint> =
            tokio::task::spawn_blocking(move || Self::read_json(&path))
                .await
                .map_err(|e| DomainError::Io(format!("checkpoint read aborted: {e}")))??
                .unwrap_or_default();
        list.sort_by_key(|c| c.sequence);
        Ok(list)
    }
}
