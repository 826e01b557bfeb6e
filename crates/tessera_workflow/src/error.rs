//! Error taxonomy for the workflow.

use std::time::Duration;
use thiserror::Error;

use tessera_db::DbError;
use tessera_protocol::{
    ChangeRequestId, DatasetId, ProjectId, SessionId, StagingId, TableVersion, UserId,
};
use tessera_validation::{RuleError, ValidationSummary};

use crate::authz::Action;

/// Errors reported by a [`crate::TableStore`].
#[derive(Debug, Clone, Error)]
pub enum TableStoreError {
    #[error("Table store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Table store unavailable: {0}")]
    Unavailable(String),

    #[error("Table {dataset} is at {actual}, expected {expected}")]
    VersionAdvanced {
        dataset: DatasetId,
        expected: TableVersion,
        actual: TableVersion,
    },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Rows already exist for keys: {}", .0.join(", "))]
    DuplicateKeys(Vec<String>),

    #[error("Unknown dataset: {0}")]
    UnknownDataset(DatasetId),

    #[error("Dataset already exists: {0}")]
    DatasetExists(DatasetId),

    #[error("Unknown staging area: {0}")]
    UnknownStaging(StagingId),

    #[error("Unknown version {version} of {dataset}")]
    UnknownVersion {
        dataset: DatasetId,
        version: TableVersion,
    },
}

impl TableStoreError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, TableStoreError::Timeout(_) | TableStoreError::Unavailable(_))
    }
}

/// Typed errors returned by workflow operations.
///
/// Nothing is persisted when an operation returns one of these, except where
/// noted on the operation itself.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Error or fatal findings. The summary carries every finding.
    #[error("Validation failed: {summary}")]
    Validation { summary: ValidationSummary },

    #[error("Column '{column}' is not editable in this session")]
    ForbiddenColumn { column: String },

    #[error("{user} may not {action} in project {project}")]
    Forbidden {
        user: UserId,
        project: ProjectId,
        action: Action,
    },

    #[error("Session {0} has expired")]
    SessionExpired(SessionId),

    /// The change request is terminal, in the wrong state, or was modified
    /// concurrently. Re-fetch before acting again.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The table advanced past the change's base version.
    #[error("Merge conflict for {change_request_id}: {detail}")]
    MergeConflict {
        change_request_id: ChangeRequestId,
        detail: String,
    },

    /// Payload and table schema could not be aligned.
    #[error("Schema mismatch for {change_request_id}: {detail}")]
    SchemaMismatch {
        change_request_id: ChangeRequestId,
        detail: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Metadata store error: {0}")]
    Store(#[from] DbError),

    #[error("Table store error: {0}")]
    Table(#[from] TableStoreError),

    #[error("Invalid rules: {0}")]
    Rules(#[from] RuleError),

    #[error("Audit recorder error: {0}")]
    Audit(String),
}

impl WorkflowError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn validation(summary: ValidationSummary) -> Self {
        Self::Validation { summary }
    }

    /// Retrying the same call later may succeed without anyone changing
    /// data, rules or permissions.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::MergeConflict { .. } => true,
            WorkflowError::Table(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Status code a service layer would map this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            WorkflowError::Validation { .. } | WorkflowError::SchemaMismatch { .. } => 422,
            WorkflowError::ForbiddenColumn { .. } | WorkflowError::Forbidden { .. } => 403,
            WorkflowError::Conflict(_) | WorkflowError::MergeConflict { .. } => 409,
            WorkflowError::SessionExpired(_) => 410,
            WorkflowError::NotFound(_) => 404,
            WorkflowError::InvalidRequest(_) | WorkflowError::Rules(_) => 400,
            WorkflowError::Table(err) if err.is_transient() => 503,
            WorkflowError::Store(_) | WorkflowError::Table(_) | WorkflowError::Audit(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
