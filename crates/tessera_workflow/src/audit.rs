//! Audit recorder collaborator.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use tessera_protocol::AuditEvent;

use crate::error::{Result, WorkflowError};
use crate::store::MetadataStore;

/// Receives an event after each state transition.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Persists events in the metadata store.
pub struct DbAuditRecorder {
    store: Arc<dyn MetadataStore>,
}

impl DbAuditRecorder {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditRecorder for DbAuditRecorder {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        self.store
            .insert_audit_event(&event)
            .await
            .map(|_| ())
            .map_err(|e| WorkflowError::Audit(e.to_string()))
    }
}

/// Writes events to the `tessera::audit` tracing target only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditRecorder;

#[async_trait]
impl AuditRecorder for TracingAuditRecorder {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        info!(
            target: "tessera::audit",
            kind = %event.kind,
            dataset_id = %event.dataset_id,
            change_request_id = ?event.change_request_id.as_ref().map(|id| id.as_str()),
            actor = %event.actor,
            detail = %event.detail,
            "Audit event"
        );
        Ok(())
    }
}

/// Record an event after a transition has already been committed.
///
/// The transition stands even if the recorder fails; the failure is logged.
pub(crate) async fn emit(recorder: &dyn AuditRecorder, event: AuditEvent) {
    let kind = event.kind;
    if let Err(e) = recorder.record(event).await {
        error!(kind = %kind, "Failed to record audit event: {}", e);
    }
}
