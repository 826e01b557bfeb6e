//! Shared data model for the Tessera change workflow.
//!
//! Every crate in the workspace speaks these types: the validation engine
//! consumes [`Rule`]s and produces [`Finding`]s, the metadata store persists
//! [`ChangeRequest`]s and [`MergeOutcome`]s, and the table store moves
//! [`Row`]s between versions.
//!
//! # Modules
//!
//! - [`types`]: cell values, rows, table schemas and versions
//! - [`rules`]: severities, validation rules and findings
//! - [`change`]: edits, payloads, change requests, merge outcomes, audit events
//! - [`session`]: live edit session records
//! - [`defaults`]: canonical default values
//! - [`config`]: workflow configuration
//! - [`idempotency`]: stable digests for payloads and staging areas

pub mod change;
pub mod config;
pub mod defaults;
pub mod error;
pub mod idempotency;
pub mod rules;
pub mod session;
pub mod types;

pub use change::{
    AuditEvent, AuditKind, CellChange, CellEdit, ChangePayload, ChangeRequest,
    ChangeRequestStatus, ChangeType, ConflictKind, MergeConflict, MergeDisposition,
    MergeOutcome, ReviewStatus, ReviewerState,
};
pub use config::{ConfigError, RetryPolicy, WorkflowConfig};
pub use error::ParseError;
pub use rules::{Finding, Rule, RuleKind, RuleSet, Severity};
pub use session::{LiveEditSession, StagedRows};
pub use types::{
    row_key, CellValue, ColumnSpec, ColumnType, Row, TableSchema, TableVersion,
    VersionInfo, VersionOperation,
};

pub use tessera_ids::{
    ChangeRequestId, DatasetId, IdParseError, MergeOutcomeId, ProjectId, SessionId,
    StagingId, UserId,
};
