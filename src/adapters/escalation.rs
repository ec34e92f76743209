//! Escalation sinks.

use async_trait::async_trait;
use tracing::warn;

use crate::domain::errors::DomainResult;
use crate::domain::models::EscalationReport;
use crate::domain::ports::EscalationSink;

/// Delivers escalation reports as `warn` events on the tracing pipeline.
#[derive(Debug, Clone, Default)]
pub struct LogEscalationSink;

impl LogEscalationSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EscalationSink for LogEscalationSink {
    async fn deliver(&self, report: &EscalationReport) -> DomainResult<()> {
        warn!(
            escalation_id = %report.id,
            execution_id = %report.execution_id,
            task = %report.task,
            group = %report.group,
            failure_kind = %report.failure_kind,
            "{}",
            report.to_message()
        );
        Ok(())
    }
}
