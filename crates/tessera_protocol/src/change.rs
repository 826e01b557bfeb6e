//! Edits, change requests, merge outcomes and audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ParseError;
use crate::rules::Severity;
use crate::types::{CellValue, Row, TableVersion};
use crate::{ChangeRequestId, DatasetId, MergeOutcomeId, ProjectId, SessionId, UserId};

// ============================================================================
// Cell edits
// ============================================================================

/// A staged cell edit inside a live edit session.
///
/// Unique per `(session_id, row_key, column)`; a later edit to the same key
/// replaces the earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellEdit {
    pub session_id: SessionId,
    pub row_key: String,
    pub column: String,
    pub old_value: CellValue,
    pub new_value: CellValue,
    pub client_timestamp: DateTime<Utc>,
    pub is_valid: bool,
    pub severity: Option<Severity>,
    pub messages: Vec<String>,
}

impl CellEdit {
    pub fn key(&self) -> (String, String) {
        (self.row_key.clone(), self.column.clone())
    }

    pub fn to_change(&self) -> CellChange {
        CellChange {
            row_key: self.row_key.clone(),
            column: self.column.clone(),
            old_value: self.old_value.clone(),
            new_value: self.new_value.clone(),
        }
    }
}

/// One cell of an edit payload, as submitted for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellChange {
    pub row_key: String,
    pub column: String,
    pub old_value: CellValue,
    pub new_value: CellValue,
}

// ============================================================================
// Payloads
// ============================================================================

/// Kind of mutation a session stages and a change request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Append,
    Edit,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Append => "append",
            ChangeType::Edit => "edit",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(ChangeType::Append),
            "edit" => Ok(ChangeType::Edit),
            _ => Err(ParseError::new("change type", s)),
        }
    }
}

/// The proposed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangePayload {
    /// New rows appended to the table.
    Append { rows: Vec<Row> },
    /// Cell-level updates to existing rows.
    Edit { changes: Vec<CellChange> },
}

impl ChangePayload {
    pub fn change_type(&self) -> ChangeType {
        match self {
            ChangePayload::Append { .. } => ChangeType::Append,
            ChangePayload::Edit { .. } => ChangeType::Edit,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ChangePayload::Append { rows } => rows.is_empty(),
            ChangePayload::Edit { changes } => changes.is_empty(),
        }
    }

    /// Number of cells the payload writes.
    pub fn cell_count(&self) -> usize {
        match self {
            ChangePayload::Append { rows } => rows.iter().map(|r| r.len()).sum(),
            ChangePayload::Edit { changes } => changes.len(),
        }
    }
}

// ============================================================================
// Change requests
// ============================================================================

/// A single reviewer's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerState {
    pub status: ReviewStatus,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ReviewerState {
    pub fn pending() -> Self {
        Self {
            status: ReviewStatus::Pending,
            decided_at: None,
        }
    }

    pub fn decide(status: ReviewStatus) -> Self {
        Self {
            status,
            decided_at: Some(Utc::now()),
        }
    }
}

/// Lifecycle state of a change request.
///
/// `Merged`, `Rejected` and `Withdrawn` are terminal. `Pending` and
/// `PendingReview` accept reviewer decisions. `MergeFail` only leaves via an
/// explicit retry or a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequestStatus {
    Pending,
    Approved,
    Rejected,
    Withdrawn,
    MergeFail,
    PendingReview,
    Merged,
}

impl ChangeRequestStatus {
    pub const ALL: [ChangeRequestStatus; 7] = [
        ChangeRequestStatus::Pending,
        ChangeRequestStatus::Approved,
        ChangeRequestStatus::Rejected,
        ChangeRequestStatus::Withdrawn,
        ChangeRequestStatus::MergeFail,
        ChangeRequestStatus::PendingReview,
        ChangeRequestStatus::Merged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeRequestStatus::Pending => "pending",
            ChangeRequestStatus::Approved => "approved",
            ChangeRequestStatus::Rejected => "rejected",
            ChangeRequestStatus::Withdrawn => "withdrawn",
            ChangeRequestStatus::MergeFail => "merge_fail",
            ChangeRequestStatus::PendingReview => "pending_review",
            ChangeRequestStatus::Merged => "merged",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangeRequestStatus::Merged | ChangeRequestStatus::Rejected | ChangeRequestStatus::Withdrawn
        )
    }

    /// States in which `approve` and `reject` are legal.
    pub fn accepts_review(&self) -> bool {
        matches!(self, ChangeRequestStatus::Pending | ChangeRequestStatus::PendingReview)
    }
}

impl fmt::Display for ChangeRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeRequestStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseError::new("change request status", s))
    }
}

/// Where the most recent merge attempt left the change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum MergeDisposition {
    /// Applied; the table is at `result_version`.
    Merged { result_version: TableVersion },
    /// Failed for a reason a retry can fix (version conflict, timeout).
    Recoverable,
    /// Failed for a reason that needs a human (validation, schema).
    Failed,
}

/// The reviewable unit representing a proposed dataset mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: ChangeRequestId,
    pub project_id: ProjectId,
    pub dataset_id: DatasetId,
    pub author_id: UserId,
    pub title: String,
    pub change_type: ChangeType,
    /// `None` once the request is withdrawn.
    pub payload: Option<ChangePayload>,
    /// Digest of the payload at submission time.
    pub payload_digest: String,
    /// Fixed at creation.
    pub reviewers: Vec<UserId>,
    pub reviewer_states: BTreeMap<UserId, ReviewerState>,
    pub status: ChangeRequestStatus,
    /// Table version the payload was prepared against.
    pub base_version: TableVersion,
    /// Rule set version the payload was validated against at submission.
    pub rules_version: u32,
    /// Set when review-time validation found new fatal findings.
    pub flagged: bool,
    pub withdrawn: bool,
    pub merge_disposition: Option<MergeDisposition>,
    /// Incremented on every persisted transition; used for conditional updates.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeRequest {
    /// All listed reviewers approved. Unanimous quorum.
    pub fn quorum_reached(&self) -> bool {
        !self.reviewers.is_empty()
            && self.reviewers.iter().all(|r| {
                self.reviewer_states
                    .get(r)
                    .map(|s| s.status == ReviewStatus::Approved)
                    .unwrap_or(false)
            })
    }

    pub fn any_rejected(&self) -> bool {
        self.reviewer_states
            .values()
            .any(|s| s.status == ReviewStatus::Rejected)
    }

    pub fn is_reviewer(&self, user: &UserId) -> bool {
        self.reviewers.contains(user)
    }

    /// Reviewers who approved, in reviewer order.
    pub fn approvers(&self) -> Vec<UserId> {
        self.reviewers
            .iter()
            .filter(|r| {
                self.reviewer_states
                    .get(*r)
                    .map(|s| s.status == ReviewStatus::Approved)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Status as a pure function of reviewer states, the withdrawn marker and
    /// the latest merge disposition.
    pub fn derive_status(&self) -> ChangeRequestStatus {
        if self.withdrawn {
            return ChangeRequestStatus::Withdrawn;
        }
        if self.any_rejected() {
            return ChangeRequestStatus::Rejected;
        }
        match self.merge_disposition {
            Some(MergeDisposition::Merged { .. }) => ChangeRequestStatus::Merged,
            Some(MergeDisposition::Failed) => ChangeRequestStatus::MergeFail,
            Some(MergeDisposition::Recoverable) => ChangeRequestStatus::PendingReview,
            None if self.quorum_reached() => ChangeRequestStatus::Approved,
            None => ChangeRequestStatus::Pending,
        }
    }

    /// Recompute `status` and bump `updated_at`.
    pub fn refresh_status(&mut self) {
        self.status = self.derive_status();
        self.updated_at = Utc::now();
    }

    pub fn result_version(&self) -> Option<TableVersion> {
        match self.merge_disposition {
            Some(MergeDisposition::Merged { result_version }) => Some(result_version),
            _ => None,
        }
    }
}

// ============================================================================
// Merge outcomes
// ============================================================================

/// Why a merge attempt did not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The table advanced past the base version.
    VersionAdvanced,
    /// Merge-level validation found blocking findings.
    ValidationFailed,
    /// Payload and table schema could not be aligned.
    SchemaMismatch,
    /// A table-store call exceeded its deadline.
    Timeout,
    /// The table store stayed unavailable through every retry.
    StoreUnavailable,
    /// The payload no longer matches the digest recorded at submission.
    PayloadTampered,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::VersionAdvanced => "version_advanced",
            ConflictKind::ValidationFailed => "validation_failed",
            ConflictKind::SchemaMismatch => "schema_mismatch",
            ConflictKind::Timeout => "timeout",
            ConflictKind::StoreUnavailable => "store_unavailable",
            ConflictKind::PayloadTampered => "payload_tampered",
        }
    }

    /// Recoverable kinds send the change request to `pending_review`; the rest
    /// to `merge_fail`.
    pub fn disposition(&self) -> MergeDisposition {
        match self {
            ConflictKind::VersionAdvanced | ConflictKind::Timeout => MergeDisposition::Recoverable,
            ConflictKind::ValidationFailed
            | ConflictKind::SchemaMismatch
            | ConflictKind::StoreUnavailable
            | ConflictKind::PayloadTampered => MergeDisposition::Failed,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "version_advanced" => Ok(ConflictKind::VersionAdvanced),
            "validation_failed" => Ok(ConflictKind::ValidationFailed),
            "schema_mismatch" => Ok(ConflictKind::SchemaMismatch),
            "timeout" => Ok(ConflictKind::Timeout),
            "store_unavailable" => Ok(ConflictKind::StoreUnavailable),
            "payload_tampered" => Ok(ConflictKind::PayloadTampered),
            _ => Err(ParseError::new("conflict kind", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub kind: ConflictKind,
    pub detail: String,
}

/// Record of one merge attempt. Append-only: retries create new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub id: MergeOutcomeId,
    pub change_request_id: ChangeRequestId,
    /// 1-based attempt number for this change request.
    pub attempt: u32,
    pub base_version: TableVersion,
    pub result_version: Option<TableVersion>,
    pub conflict: Option<MergeConflict>,
    pub rows_added: u64,
    pub rows_updated: u64,
    pub cells_changed: u64,
    pub actors: Vec<UserId>,
    pub recorded_at: DateTime<Utc>,
}

impl MergeOutcome {
    pub fn is_success(&self) -> bool {
        self.result_version.is_some() && self.conflict.is_none()
    }

    pub fn disposition(&self) -> MergeDisposition {
        match (&self.conflict, self.result_version) {
            (Some(conflict), _) => conflict.kind.disposition(),
            (None, Some(result_version)) => MergeDisposition::Merged { result_version },
            (None, None) => MergeDisposition::Failed,
        }
    }
}

// ============================================================================
// Audit events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ChangeRequestCreated,
    ChangeRequestApproved,
    ChangeRequestRejected,
    ChangeRequestWithdrawn,
    ChangeRequestFlagged,
    ChangeRequestRevalidated,
    MergeAttempted,
    Merged,
    MergeFailed,
    RetryRequested,
    SessionStarted,
    SessionEnded,
}

impl AuditKind {
    pub const ALL: [AuditKind; 12] = [
        AuditKind::ChangeRequestCreated,
        AuditKind::ChangeRequestApproved,
        AuditKind::ChangeRequestRejected,
        AuditKind::ChangeRequestWithdrawn,
        AuditKind::ChangeRequestFlagged,
        AuditKind::ChangeRequestRevalidated,
        AuditKind::MergeAttempted,
        AuditKind::Merged,
        AuditKind::MergeFailed,
        AuditKind::RetryRequested,
        AuditKind::SessionStarted,
        AuditKind::SessionEnded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ChangeRequestCreated => "change_request.created",
            AuditKind::ChangeRequestApproved => "change_request.approved",
            AuditKind::ChangeRequestRejected => "change_request.rejected",
            AuditKind::ChangeRequestWithdrawn => "change_request.withdrawn",
            AuditKind::ChangeRequestFlagged => "change_request.flagged",
            AuditKind::ChangeRequestRevalidated => "change_request.revalidated",
            AuditKind::MergeAttempted => "change_request.merge_attempted",
            AuditKind::Merged => "change_request.merged",
            AuditKind::MergeFailed => "change_request.merge_failed",
            AuditKind::RetryRequested => "change_request.retry_requested",
            AuditKind::SessionStarted => "session.started",
            AuditKind::SessionEnded => "session.ended",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseError::new("audit kind", s))
    }
}

/// An entry in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Assigned by the store.
    pub id: Option<i64>,
    pub kind: AuditKind,
    pub dataset_id: DatasetId,
    pub change_request_id: Option<ChangeRequestId>,
    pub actor: UserId,
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, dataset_id: DatasetId, actor: UserId) -> Self {
        Self {
            id: None,
            kind,
            dataset_id,
            change_request_id: None,
            actor,
            detail: serde_json::Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn for_change_request(mut self, id: ChangeRequestId) -> Self {
        self.change_request_id = Some(id);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(reviewers: &[&str]) -> ChangeRequest {
        let reviewers: Vec<UserId> = reviewers.iter().map(|r| UserId::new(*r)).collect();
        let reviewer_states = reviewers
            .iter()
            .map(|r| (r.clone(), ReviewerState::pending()))
            .collect();
        ChangeRequest {
            id: ChangeRequestId::new(),
            project_id: ProjectId::new("p"),
            dataset_id: DatasetId::new("d"),
            author_id: UserId::new("author"),
            title: "t".into(),
            change_type: ChangeType::Append,
            payload: Some(ChangePayload::Append { rows: vec![] }),
            payload_digest: String::new(),
            reviewers,
            reviewer_states,
            status: ChangeRequestStatus::Pending,
            base_version: TableVersion(1),
            rules_version: 0,
            flagged: false,
            withdrawn: false,
            merge_disposition: None,
            revision: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_derive_status_quorum_is_unanimous() {
        let mut cr = sample_request(&["a", "b"]);
        cr.reviewer_states
            .insert(UserId::new("a"), ReviewerState::decide(ReviewStatus::Approved));
        assert_eq!(cr.derive_status(), ChangeRequestStatus::Pending);

        cr.reviewer_states
            .insert(UserId::new("b"), ReviewerState::decide(ReviewStatus::Approved));
        assert_eq!(cr.derive_status(), ChangeRequestStatus::Approved);
    }

    #[test]
    fn test_derive_status_rejection_and_withdrawal_take_precedence() {
        let mut cr = sample_request(&["a", "b"]);
        cr.reviewer_states
            .insert(UserId::new("a"), ReviewerState::decide(ReviewStatus::Approved));
        cr.reviewer_states
            .insert(UserId::new("b"), ReviewerState::decide(ReviewStatus::Rejected));
        cr.merge_disposition = Some(MergeDisposition::Recoverable);
        assert_eq!(cr.derive_status(), ChangeRequestStatus::Rejected);

        cr.withdrawn = true;
        assert_eq!(cr.derive_status(), ChangeRequestStatus::Withdrawn);
    }

    #[test]
    fn test_derive_status_follows_merge_disposition() {
        let mut cr = sample_request(&["a"]);
        cr.reviewer_states
            .insert(UserId::new("a"), ReviewerState::decide(ReviewStatus::Approved));
        cr.merge_disposition = Some(MergeDisposition::Recoverable);
        assert_eq!(cr.derive_status(), ChangeRequestStatus::PendingReview);
        cr.merge_disposition = Some(MergeDisposition::Failed);
        assert_eq!(cr.derive_status(), ChangeRequestStatus::MergeFail);
        cr.merge_disposition = Some(MergeDisposition::Merged {
            result_version: TableVersion(2),
        });
        assert_eq!(cr.derive_status(), ChangeRequestStatus::Merged);
        assert_eq!(cr.result_version(), Some(TableVersion(2)));
    }

    #[test]
    fn test_status_strings_roundtrip() {
        for status in ChangeRequestStatus::ALL {
            assert_eq!(status.as_str().parse::<ChangeRequestStatus>().unwrap(), status);
        }
        for kind in AuditKind::ALL {
            assert_eq!(kind.as_str().parse::<AuditKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_conflict_dispositions() {
        assert_eq!(
            ConflictKind::VersionAdvanced.disposition(),
            MergeDisposition::Recoverable
        );
        assert_eq!(ConflictKind::Timeout.disposition(), MergeDisposition::Recoverable);
        assert_eq!(ConflictKind::SchemaMismatch.disposition(), MergeDisposition::Failed);
        assert_eq!(ConflictKind::ValidationFailed.disposition(), MergeDisposition::Failed);
    }
}
