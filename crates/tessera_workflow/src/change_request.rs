//! Change request state machine.
//!
//! Every mutation takes the change request's lock, reloads the record,
//! checks the transition, and persists it with a conditional update. The
//! lock serializes callers in this process; the conditional update catches
//! writers elsewhere. Quorum detection and merge dispatch happen under the
//! same lock, so concurrent approvals dispatch at most one merge.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use tessera_db::ChangeRequestFilter;
use tessera_protocol::{
    idempotency::payload_digest, AuditEvent, AuditKind, ChangePayload, ChangeRequest,
    ChangeRequestId, ChangeRequestStatus, ConflictKind, DatasetId, Finding, MergeDisposition,
    MergeOutcome, ProjectId, ReviewStatus, ReviewerState, Severity, TableVersion, UserId,
};
use tessera_validation::{
    Checkpoint, CheckpointReport, PriorValues, ValidationCoordinator, ValidationSummary,
};

use crate::audit::{emit, AuditRecorder};
use crate::authz::{Action, Authorizer};
use crate::error::{Result, TableStoreError, WorkflowError};
use crate::locks::KeyedLocks;
use crate::merge::{BaseCheck, MergeAttempt, MergeExecutor};
use crate::rules::RuleRegistry;
use crate::store::MetadataStore;
use crate::table::TableStore;

/// Everything needed to create a change request from a submitted session.
#[derive(Debug, Clone)]
pub struct NewChangeRequest {
    pub project_id: ProjectId,
    pub dataset_id: DatasetId,
    pub author_id: UserId,
    pub title: String,
    pub payload: ChangePayload,
    pub reviewers: Vec<UserId>,
    pub base_version: TableVersion,
    pub rules_version: u32,
}

/// Result of a reviewer decision.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub change_request: ChangeRequest,
    /// Set when this decision completed the quorum and a merge was attempted.
    pub merge: Option<MergeAttempt>,
    /// Set when the dispatched merge could not run at all. The approval
    /// stands; [`ChangeRequestService::retry_merge`] picks the merge up again.
    pub merge_error: Option<String>,
}

pub struct ChangeRequestService {
    store: Arc<dyn MetadataStore>,
    tables: Arc<dyn TableStore>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditRecorder>,
    rules: Arc<RuleRegistry>,
    executor: Arc<MergeExecutor>,
    coordinator: ValidationCoordinator,
    locks: KeyedLocks<ChangeRequestId>,
}

impl ChangeRequestService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        tables: Arc<dyn TableStore>,
        authorizer: Arc<dyn Authorizer>,
        audit: Arc<dyn AuditRecorder>,
        rules: Arc<RuleRegistry>,
        executor: Arc<MergeExecutor>,
    ) -> Self {
        Self {
            store,
            tables,
            authorizer,
            audit,
            rules,
            executor,
            coordinator: ValidationCoordinator::new(),
            locks: KeyedLocks::new(),
        }
    }

    // ========================================================================
    // Creation and queries
    // ========================================================================

    /// Create a change request in `pending`.
    ///
    /// `report` must be a passed session-level checkpoint over `new.payload`.
    pub(crate) async fn create(
        &self,
        new: NewChangeRequest,
        report: &CheckpointReport,
    ) -> Result<ChangeRequest> {
        if report.checkpoint != Checkpoint::Session || !report.passed {
            return Err(WorkflowError::validation(report.summary.clone()));
        }
        if new.payload.is_empty() {
            return Err(WorkflowError::invalid("change request has no changes"));
        }
        if new.reviewers.is_empty() {
            return Err(WorkflowError::invalid("at least one reviewer is required"));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = new.reviewers.iter().find(|r| !seen.insert(*r)) {
            return Err(WorkflowError::invalid(format!(
                "reviewer {} is listed more than once",
                duplicate
            )));
        }

        let now = Utc::now();
        let reviewer_states: BTreeMap<UserId, ReviewerState> = new
            .reviewers
            .iter()
            .map(|r| (r.clone(), ReviewerState::pending()))
            .collect();
        let cr = ChangeRequest {
            id: ChangeRequestId::new(),
            project_id: new.project_id,
            dataset_id: new.dataset_id,
            author_id: new.author_id,
            title: new.title,
            change_type: new.payload.change_type(),
            payload_digest: payload_digest(&new.payload),
            payload: Some(new.payload),
            reviewers: new.reviewers,
            reviewer_states,
            status: ChangeRequestStatus::Pending,
            base_version: new.base_version,
            rules_version: new.rules_version,
            flagged: false,
            withdrawn: false,
            merge_disposition: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_change_request(&cr).await?;

        info!(
            change_request_id = %cr.id,
            dataset_id = %cr.dataset_id,
            author = %cr.author_id,
            reviewers = cr.reviewers.len(),
            requires_review = report.summary.requires_review,
            "Change request created"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditKind::ChangeRequestCreated,
                cr.dataset_id.clone(),
                cr.author_id.clone(),
            )
            .for_change_request(cr.id.clone())
            .with_detail(json!({
                "title": cr.title,
                "change_type": cr.change_type,
                "reviewers": cr.reviewers,
                "base_version": cr.base_version,
                "rules_version": cr.rules_version,
                "warnings": report.summary.warning_count,
                "requires_review": report.summary.requires_review,
            })),
        )
        .await;
        Ok(cr)
    }

    pub async fn get(&self, id: &ChangeRequestId) -> Result<ChangeRequest> {
        self.store
            .get_change_request(id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(format!("change request {}", id)))
    }

    pub async fn list(&self, filter: ChangeRequestFilter) -> Result<Vec<ChangeRequest>> {
        Ok(self.store.list_change_requests(filter).await?)
    }

    /// Every merge attempt for a change request, oldest first.
    pub async fn merge_history(&self, id: &ChangeRequestId) -> Result<Vec<MergeOutcome>> {
        Ok(self.store.list_merge_outcomes(id).await?)
    }

    // ========================================================================
    // Reviewer decisions
    // ========================================================================

    /// Record an approval. Completing the quorum dispatches the merge.
    ///
    /// The approval is committed before the merge runs, so a merge that
    /// errors is reported in the outcome rather than failing the call.
    pub async fn approve(&self, id: &ChangeRequestId, reviewer: &UserId) -> Result<ReviewOutcome> {
        let _guard = self.locks.lock(id).await;
        let mut cr = self.get(id).await?;
        self.authorize(&cr, reviewer, Action::Approve).await?;
        self.check_reviewable(&cr, reviewer, Action::Approve)?;

        if cr.flagged {
            let (report, rules_version) = self.review_check(&cr).await?;
            if !report.passed {
                return Err(WorkflowError::validation(report.summary));
            }
            cr.flagged = false;
            cr.rules_version = rules_version;
        }

        cr.reviewer_states
            .insert(reviewer.clone(), ReviewerState::decide(ReviewStatus::Approved));
        cr.refresh_status();
        self.persist(&mut cr).await?;

        info!(
            change_request_id = %cr.id,
            reviewer = %reviewer,
            approvals = cr.approvers().len(),
            required = cr.reviewers.len(),
            "Change request approved by reviewer"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditKind::ChangeRequestApproved,
                cr.dataset_id.clone(),
                reviewer.clone(),
            )
            .for_change_request(cr.id.clone())
            .with_detail(json!({ "status": cr.status })),
        )
        .await;

        let mut merge = None;
        let mut merge_error = None;
        if cr.status == ChangeRequestStatus::Approved {
            let approved = cr.clone();
            match self.executor.merge(&mut cr, reviewer, BaseCheck::Exact).await {
                Ok(attempt) => merge = Some(attempt),
                Err(e) => {
                    error!(change_request_id = %cr.id, "Merge after approval failed: {}", e);
                    merge_error = Some(e.to_string());
                    cr = match self.get(id).await {
                        Ok(stored) => stored,
                        Err(_) => approved,
                    };
                }
            }
        }

        Ok(ReviewOutcome {
            change_request: cr,
            merge,
            merge_error,
        })
    }

    /// Record a rejection. One rejection is terminal.
    pub async fn reject(
        &self,
        id: &ChangeRequestId,
        reviewer: &UserId,
        reason: Option<String>,
    ) -> Result<ChangeRequest> {
        let _guard = self.locks.lock(id).await;
        let mut cr = self.get(id).await?;
        self.authorize(&cr, reviewer, Action::Reject).await?;
        self.check_reviewable(&cr, reviewer, Action::Reject)?;

        cr.reviewer_states
            .insert(reviewer.clone(), ReviewerState::decide(ReviewStatus::Rejected));
        cr.refresh_status();
        self.persist(&mut cr).await?;

        info!(change_request_id = %cr.id, reviewer = %reviewer, "Change request rejected");
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditKind::ChangeRequestRejected,
                cr.dataset_id.clone(),
                reviewer.clone(),
            )
            .for_change_request(cr.id.clone())
            .with_detail(json!({ "reason": reason })),
        )
        .await;
        Ok(cr)
    }

    /// Withdraw a change request. Only its author may, and only while it is
    /// not terminal. The staged payload is discarded.
    pub async fn withdraw(&self, id: &ChangeRequestId, author: &UserId) -> Result<ChangeRequest> {
        let _guard = self.locks.lock(id).await;
        let mut cr = self.get(id).await?;
        self.authorize(&cr, author, Action::Withdraw).await?;
        if cr.status.is_terminal() {
            return Err(terminal(&cr));
        }
        if &cr.author_id != author {
            return Err(WorkflowError::Forbidden {
                user: author.clone(),
                project: cr.project_id.clone(),
                action: Action::Withdraw,
            });
        }

        let previous = cr.status;
        cr.withdrawn = true;
        cr.payload = None;
        cr.refresh_status();
        self.persist(&mut cr).await?;

        info!(change_request_id = %cr.id, from = %previous, "Change request withdrawn");
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditKind::ChangeRequestWithdrawn,
                cr.dataset_id.clone(),
                author.clone(),
            )
            .for_change_request(cr.id.clone())
            .with_detail(json!({ "previous_status": previous })),
        )
        .await;
        Ok(cr)
    }

    // ========================================================================
    // Change-request checkpoint
    // ========================================================================

    /// Re-run validation against the current rules as a reviewer opens the
    /// change request. Fatal findings flag it until [`Self::revalidate`]
    /// succeeds.
    pub async fn open_for_review(
        &self,
        id: &ChangeRequestId,
        reviewer: &UserId,
    ) -> Result<CheckpointReport> {
        let _guard = self.locks.lock(id).await;
        let mut cr = self.get(id).await?;
        self.authorize(&cr, reviewer, Action::Approve).await?;
        if !cr.is_reviewer(reviewer) {
            return Err(WorkflowError::Forbidden {
                user: reviewer.clone(),
                project: cr.project_id.clone(),
                action: Action::Approve,
            });
        }
        let (report, rules_version) = self.review_check(&cr).await?;

        if !report.passed && !cr.flagged && !cr.status.is_terminal() {
            cr.flagged = true;
            self.persist(&mut cr).await?;
            warn!(
                change_request_id = %cr.id,
                rules_version,
                fatal = report.summary.fatal_count,
                "Change request flagged by current rules"
            );
            emit(
                self.audit.as_ref(),
                AuditEvent::new(
                    AuditKind::ChangeRequestFlagged,
                    cr.dataset_id.clone(),
                    reviewer.clone(),
                )
                .for_change_request(cr.id.clone())
                .with_detail(json!({
                    "rules_version": rules_version,
                    "fatal": report.summary.fatal_count,
                    "rows": report.summary.blocking_rows(),
                })),
            )
            .await;
        }
        Ok(report)
    }

    /// Clear the review flag once the payload passes the current rules.
    pub async fn revalidate(
        &self,
        id: &ChangeRequestId,
        actor: &UserId,
    ) -> Result<CheckpointReport> {
        let _guard = self.locks.lock(id).await;
        let mut cr = self.get(id).await?;
        self.authorize(&cr, actor, Action::Revalidate).await?;
        if cr.status.is_terminal() {
            return Err(terminal(&cr));
        }

        let (report, rules_version) = self.review_check(&cr).await?;
        if !report.passed {
            return Err(WorkflowError::validation(report.summary));
        }

        cr.flagged = false;
        cr.rules_version = rules_version;
        cr.updated_at = Utc::now();
        self.persist(&mut cr).await?;

        info!(change_request_id = %cr.id, rules_version, "Change request revalidated");
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditKind::ChangeRequestRevalidated,
                cr.dataset_id.clone(),
                actor.clone(),
            )
            .for_change_request(cr.id.clone())
            .with_detail(json!({
                "rules_version": rules_version,
                "warnings": report.summary.warning_count,
            })),
        )
        .await;
        Ok(report)
    }

    // ========================================================================
    // Merge retry
    // ========================================================================

    /// Retry the merge of an approved change request.
    ///
    /// A `merge_fail` request re-enters `pending_review` first. Retries
    /// rebase onto the current table version when the cells the change was
    /// based on are unchanged. Calling this on a merged request returns the
    /// recorded outcome without touching the table.
    pub async fn retry_merge(&self, id: &ChangeRequestId, actor: &UserId) -> Result<MergeOutcome> {
        let _guard = self.locks.lock(id).await;
        let mut cr = self.get(id).await?;
        self.authorize(&cr, actor, Action::RetryMerge).await?;

        match cr.status {
            ChangeRequestStatus::Merged
            | ChangeRequestStatus::Approved
            | ChangeRequestStatus::PendingReview => {}
            ChangeRequestStatus::MergeFail => {
                cr.merge_disposition = Some(MergeDisposition::Recoverable);
                cr.refresh_status();
                self.persist(&mut cr).await?;
                info!(change_request_id = %cr.id, actor = %actor, "Failed merge re-armed for retry");
                emit(
                    self.audit.as_ref(),
                    AuditEvent::new(AuditKind::RetryRequested, cr.dataset_id.clone(), actor.clone())
                        .for_change_request(cr.id.clone()),
                )
                .await;
            }
            ChangeRequestStatus::Pending => {
                return Err(WorkflowError::conflict(format!(
                    "change request {} has not reached quorum",
                    cr.id
                )));
            }
            ChangeRequestStatus::Rejected | ChangeRequestStatus::Withdrawn => {
                return Err(terminal(&cr));
            }
        }

        let attempt = self.executor.merge(&mut cr, actor, BaseCheck::Rebase).await?;
        outcome_result(&cr, attempt)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn authorize(&self, cr: &ChangeRequest, user: &UserId, action: Action) -> Result<()> {
        if self
            .authorizer
            .can_perform(user, &cr.project_id, action)
            .await
        {
            Ok(())
        } else {
            warn!(change_request_id = %cr.id, user = %user, action = %action, "Action denied");
            Err(WorkflowError::Forbidden {
                user: user.clone(),
                project: cr.project_id.clone(),
                action,
            })
        }
    }

    /// A reviewer may decide once, while the request accepts reviews.
    fn check_reviewable(&self, cr: &ChangeRequest, reviewer: &UserId, action: Action) -> Result<()> {
        if cr.status.is_terminal() {
            return Err(terminal(cr));
        }
        if !cr.status.accepts_review() {
            return Err(WorkflowError::conflict(format!(
                "change request {} is {} and does not accept reviews",
                cr.id, cr.status
            )));
        }
        if !cr.is_reviewer(reviewer) {
            return Err(WorkflowError::Forbidden {
                user: reviewer.clone(),
                project: cr.project_id.clone(),
                action,
            });
        }
        match cr.reviewer_states.get(reviewer).map(|s| s.status) {
            Some(ReviewStatus::Pending) | None => Ok(()),
            Some(decided) => Err(WorkflowError::conflict(format!(
                "{} already decided {:?} on change request {}",
                reviewer, decided, cr.id
            ))),
        }
    }

    /// Change-request checkpoint with the dataset's current rules.
    async fn review_check(&self, cr: &ChangeRequest) -> Result<(CheckpointReport, u32)> {
        let rules = self.rules.current(&cr.dataset_id).await?;
        let report = match &cr.payload {
            Some(payload) => {
                let schema = self.tables.schema(&cr.dataset_id).await?;
                self.coordinator.validate_payload(
                    Checkpoint::ChangeRequest,
                    &rules,
                    payload,
                    &schema.key_columns,
                    &PriorValues::new(),
                )
            }
            None => CheckpointReport {
                checkpoint: Checkpoint::ChangeRequest,
                passed: true,
                summary: ValidationSummary::default(),
            },
        };
        Ok((report, rules.version()))
    }

    async fn persist(&self, cr: &mut ChangeRequest) -> Result<()> {
        if self.store.update_change_request(cr).await? {
            Ok(())
        } else {
            Err(WorkflowError::conflict(format!(
                "change request {} was modified concurrently; re-fetch and retry",
                cr.id
            )))
        }
    }
}

fn terminal(cr: &ChangeRequest) -> WorkflowError {
    WorkflowError::conflict(format!(
        "change request {} is already {}",
        cr.id, cr.status
    ))
}

/// Turn an unsuccessful merge outcome into the matching typed error.
fn outcome_result(cr: &ChangeRequest, attempt: MergeAttempt) -> Result<MergeOutcome> {
    let Some(conflict) = attempt.outcome.conflict.clone() else {
        return Ok(attempt.outcome);
    };
    Err(match conflict.kind {
        ConflictKind::VersionAdvanced | ConflictKind::Timeout => WorkflowError::MergeConflict {
            change_request_id: cr.id.clone(),
            detail: conflict.detail,
        },
        ConflictKind::SchemaMismatch => WorkflowError::SchemaMismatch {
            change_request_id: cr.id.clone(),
            detail: conflict.detail,
        },
        ConflictKind::ValidationFailed => match attempt.validation {
            Some(summary) if !summary.can_submit => WorkflowError::validation(summary),
            _ => WorkflowError::validation(ValidationSummary::from_findings(vec![Finding {
                severity: Severity::Error,
                message: conflict.detail,
                column: String::new(),
                row_key: None,
                rule: "merge".into(),
            }])),
        },
        ConflictKind::StoreUnavailable => {
            WorkflowError::Table(TableStoreError::Unavailable(conflict.detail))
        }
        ConflictKind::PayloadTampered => WorkflowError::conflict(conflict.detail),
    })
}
