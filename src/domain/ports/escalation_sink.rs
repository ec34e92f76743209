//! Escalation sink port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::EscalationReport;

/// Destination for escalation reports (chat, tracker, log).
///
/// Delivery is best effort; the scheduler never waits on a human.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn deliver(&self, report: &EscalationReport) -> DomainResult<()>;
}
