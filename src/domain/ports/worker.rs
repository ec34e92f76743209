//! Worker port - interface for the external coding agent.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::models::{WorkerError, WorkerEvent, WorkerExit, WorkerInvocation};

/// A process that performs one phase of a task.
///
/// Implementations stream parsed progress events through `events` while the
/// worker runs and stop promptly when `invocation.cancel` fires, returning
/// [`WorkerError::Cancelled`].
#[async_trait]
pub trait Worker: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    async fn invoke(
        &self,
        invocation: WorkerInvocation,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerExit, WorkerError>;
}
