//! Execution store port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Checkpoint, ExecutionId, ExecutionRecord};

/// Persistence for execution records and their checkpoints.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace a record.
    async fn save(&self, record: &ExecutionRecord) -> DomainResult<()>;

    async fn load(&self, id: &ExecutionId) -> DomainResult<Option<ExecutionRecord>>;

    async fn exists(&self, id: &ExecutionId) -> DomainResult<bool>;

    /// All records, newest first.
    async fn list(&self) -> DomainResult<Vec<ExecutionRecord>>;

    /// Append a checkpoint; sequences must increase.
    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> DomainResult<()>;

    /// Checkpoints of one execution in sequence order.
    async fn checkpoints(&self, id: &ExecutionId) -> DomainResult<Vec<Checkpoint>>;
}
