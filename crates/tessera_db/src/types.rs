//! Query filters.

use tessera_protocol::{AuditKind, ChangeRequestId, ChangeRequestStatus, DatasetId};

/// Filter for [`crate::TesseraDb::list_change_requests`].
#[derive(Debug, Clone, Default)]
pub struct ChangeRequestFilter {
    pub dataset_id: Option<DatasetId>,
    pub status: Option<ChangeRequestStatus>,
    pub limit: Option<u32>,
}

impl ChangeRequestFilter {
    pub fn for_dataset(dataset_id: DatasetId) -> Self {
        Self {
            dataset_id: Some(dataset_id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ChangeRequestStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Filter for [`crate::TesseraDb::list_audit_events`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub dataset_id: Option<DatasetId>,
    pub change_request_id: Option<ChangeRequestId>,
    pub kind: Option<AuditKind>,
    pub limit: Option<u32>,
}

impl AuditFilter {
    pub fn for_change_request(id: ChangeRequestId) -> Self {
        Self {
            change_request_id: Some(id),
            ..Self::default()
        }
    }

    pub fn for_dataset(dataset_id: DatasetId) -> Self {
        Self {
            dataset_id: Some(dataset_id),
            ..Self::default()
        }
    }
}
