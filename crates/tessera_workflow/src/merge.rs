//! Merge executor: applies an approved change request to the main table.
//!
//! # Algorithm
//!
//! 1. Short-circuit when the change request is already merged.
//! 2. Recover a merge that reached the table but was never recorded.
//! 3. Verify the payload digest and the table version the change is based on.
//! 4. Re-run merge-level validation against the *current* rules.
//! 5. Write the rows to a staging area, aligning types once on a schema mismatch.
//! 6. Merge staging into the main table, conditioned on the expected version.
//! 7. Record the outcome and the resulting transition atomically, then audit.
//!
//! Every table-store call carries a deadline and is retried with bounded
//! backoff while the failure is transient.

use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use tessera_protocol::{
    idempotency::payload_digest, row_key, AuditEvent, AuditKind, CellValue, ChangePayload,
    ChangeRequest, ChangeType, ConflictKind, DatasetId, MergeConflict, MergeOutcome,
    MergeOutcomeId, Row, TableSchema, TableVersion, UserId, WorkflowConfig,
};
use tessera_validation::{Checkpoint, PriorValues, ValidationCoordinator, ValidationSummary};

use crate::audit::{emit, AuditRecorder};
use crate::error::{Result, TableStoreError, WorkflowError};
use crate::rules::RuleRegistry;
use crate::schema_align::align_rows;
use crate::store::MetadataStore;
use crate::table::{MergeReceipt, MergeRequest, RowFilter, StagingRef, TableResult, TableStore};

/// How the executor treats a table that advanced past the change's base version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseCheck {
    /// The table must still be at the base version.
    Exact,
    /// Accept the current version if every cell the change was based on is
    /// unchanged (edits) or every appended key is still free (appends).
    Rebase,
}

/// Result of [`MergeExecutor::merge`].
#[derive(Debug, Clone)]
pub struct MergeAttempt {
    pub outcome: MergeOutcome,
    /// Merge-level findings, when validation ran.
    pub validation: Option<ValidationSummary>,
    /// The change request was already merged; nothing was attempted.
    pub replayed: bool,
}

enum Step {
    Applied {
        base: TableVersion,
        receipt: MergeReceipt,
        validation: Option<ValidationSummary>,
    },
    Rejected {
        base: TableVersion,
        conflict: MergeConflict,
        validation: Option<ValidationSummary>,
    },
}

impl Step {
    fn rejected(base: TableVersion, kind: ConflictKind, detail: impl Into<String>) -> Self {
        Step::Rejected {
            base,
            conflict: MergeConflict {
                kind,
                detail: detail.into(),
            },
            validation: None,
        }
    }

    fn from_table(base: TableVersion, err: TableStoreError) -> Self {
        Step::rejected(base, conflict_kind(&err), err.to_string())
    }
}

fn conflict_kind(err: &TableStoreError) -> ConflictKind {
    match err {
        TableStoreError::Timeout(_) => ConflictKind::Timeout,
        TableStoreError::VersionAdvanced { .. } => ConflictKind::VersionAdvanced,
        TableStoreError::DuplicateKeys(_) => ConflictKind::ValidationFailed,
        TableStoreError::SchemaMismatch(_)
        | TableStoreError::UnknownDataset(_)
        | TableStoreError::UnknownVersion { .. }
        | TableStoreError::DatasetExists(_) => ConflictKind::SchemaMismatch,
        TableStoreError::Unavailable(_) | TableStoreError::UnknownStaging(_) => {
            ConflictKind::StoreUnavailable
        }
    }
}

pub struct MergeExecutor {
    store: Arc<dyn MetadataStore>,
    tables: Arc<dyn TableStore>,
    audit: Arc<dyn AuditRecorder>,
    rules: Arc<RuleRegistry>,
    coordinator: ValidationCoordinator,
    config: WorkflowConfig,
}

impl MergeExecutor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        tables: Arc<dyn TableStore>,
        audit: Arc<dyn AuditRecorder>,
        rules: Arc<RuleRegistry>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            tables,
            audit,
            rules,
            coordinator: ValidationCoordinator::new(),
            config,
        }
    }

    /// Attempt to merge `cr`. The caller holds the change request's lock.
    ///
    /// On return `cr` reflects the recorded transition. An unsuccessful
    /// attempt is still `Ok`: the outcome carries the conflict.
    pub async fn merge(
        &self,
        cr: &mut ChangeRequest,
        actor: &UserId,
        base_check: BaseCheck,
    ) -> Result<MergeAttempt> {
        if cr.result_version().is_some() {
            let outcome = self
                .store
                .list_merge_outcomes(&cr.id)
                .await?
                .into_iter()
                .rev()
                .find(MergeOutcome::is_success)
                .ok_or_else(|| {
                    WorkflowError::not_found(format!("merge outcome for {}", cr.id))
                })?;
            debug!(change_request_id = %cr.id, "Change request already merged, replaying outcome");
            return Ok(MergeAttempt {
                outcome,
                validation: None,
                replayed: true,
            });
        }

        if cr.withdrawn || cr.any_rejected() {
            return Err(WorkflowError::conflict(format!(
                "change request {} is {} and cannot be merged",
                cr.id, cr.status
            )));
        }
        if !cr.quorum_reached() {
            return Err(WorkflowError::conflict(format!(
                "change request {} has not reached quorum",
                cr.id
            )));
        }
        let payload = cr.payload.clone().ok_or_else(|| {
            WorkflowError::conflict(format!("change request {} has no payload", cr.id))
        })?;

        let attempt = self.store.next_merge_attempt(&cr.id).await?;
        info!(
            change_request_id = %cr.id,
            dataset_id = %cr.dataset_id,
            attempt,
            base_version = %cr.base_version,
            "Merge attempt started"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::new(AuditKind::MergeAttempted, cr.dataset_id.clone(), actor.clone())
                .for_change_request(cr.id.clone())
                .with_detail(json!({ "attempt": attempt, "base_version": cr.base_version })),
        )
        .await;

        let step = self.run(cr, &payload, base_check).await?;

        let actors = cr.approvers();
        let (outcome, validation) = match step {
            Step::Applied {
                base,
                receipt,
                validation,
            } => (
                MergeOutcome {
                    id: MergeOutcomeId::new(),
                    change_request_id: cr.id.clone(),
                    attempt,
                    base_version: base,
                    result_version: Some(receipt.version),
                    conflict: None,
                    rows_added: receipt.rows_added,
                    rows_updated: receipt.rows_updated,
                    cells_changed: receipt.cells_changed,
                    actors,
                    recorded_at: Utc::now(),
                },
                validation,
            ),
            Step::Rejected {
                base,
                conflict,
                validation,
            } => (
                MergeOutcome {
                    id: MergeOutcomeId::new(),
                    change_request_id: cr.id.clone(),
                    attempt,
                    base_version: base,
                    result_version: None,
                    conflict: Some(conflict),
                    rows_added: 0,
                    rows_updated: 0,
                    cells_changed: 0,
                    actors,
                    recorded_at: Utc::now(),
                },
                validation,
            ),
        };

        cr.merge_disposition = Some(outcome.disposition());
        cr.refresh_status();
        if !self.store.record_merge_attempt(cr, &outcome).await? {
            return Err(WorkflowError::conflict(format!(
                "change request {} was modified during merge",
                cr.id
            )));
        }

        match (&outcome.result_version, &outcome.conflict) {
            (Some(version), _) => {
                info!(
                    change_request_id = %cr.id,
                    attempt,
                    result_version = %version,
                    rows_added = outcome.rows_added,
                    rows_updated = outcome.rows_updated,
                    cells_changed = outcome.cells_changed,
                    "Change request merged"
                );
                emit(
                    self.audit.as_ref(),
                    AuditEvent::new(AuditKind::Merged, cr.dataset_id.clone(), actor.clone())
                        .for_change_request(cr.id.clone())
                        .with_detail(json!({
                            "attempt": attempt,
                            "base_version": outcome.base_version,
                            "result_version": version,
                            "rows_added": outcome.rows_added,
                            "rows_updated": outcome.rows_updated,
                            "cells_changed": outcome.cells_changed,
                            "actors": outcome.actors,
                        })),
                )
                .await;
            }
            (None, conflict) => {
                let (kind, detail) = conflict
                    .as_ref()
                    .map(|c| (c.kind.as_str(), c.detail.as_str()))
                    .unwrap_or(("unknown", ""));
                warn!(
                    change_request_id = %cr.id,
                    attempt,
                    conflict = kind,
                    status = %cr.status,
                    "Merge attempt failed: {}",
                    detail
                );
                emit(
                    self.audit.as_ref(),
                    AuditEvent::new(AuditKind::MergeFailed, cr.dataset_id.clone(), actor.clone())
                        .for_change_request(cr.id.clone())
                        .with_detail(json!({
                            "attempt": attempt,
                            "base_version": outcome.base_version,
                            "conflict": kind,
                            "detail": detail,
                            "status": cr.status,
                        })),
                )
                .await;
            }
        }

        Ok(MergeAttempt {
            outcome,
            validation,
            replayed: false,
        })
    }

    async fn run(
        &self,
        cr: &mut ChangeRequest,
        payload: &ChangePayload,
        base_check: BaseCheck,
    ) -> Result<Step> {
        let dataset_id = cr.dataset_id.clone();
        let base = cr.base_version;

        match self.applied_version(&dataset_id, cr).await {
            Ok(Some(receipt)) => {
                warn!(change_request_id = %cr.id, version = %receipt.version, "Recovered merge that was applied but not recorded");
                return Ok(Step::Applied {
                    base,
                    receipt,
                    validation: None,
                });
            }
            Ok(None) => {}
            Err(e) => return Ok(Step::from_table(base, e)),
        }

        if payload_digest(payload) != cr.payload_digest {
            return Ok(Step::rejected(
                base,
                ConflictKind::PayloadTampered,
                "payload does not match the digest recorded at submission",
            ));
        }

        let schema = match self.call("schema", || self.tables.schema(&dataset_id)).await {
            Ok(schema) => schema,
            Err(e) => return Ok(Step::from_table(base, e)),
        };
        let current = match self
            .call("current_version", || self.tables.current_version(&dataset_id))
            .await
        {
            Ok(version) => version,
            Err(e) => return Ok(Step::from_table(base, e)),
        };

        let filter = RowFilter::keys(payload_keys(payload, &schema));
        let current_rows = match self
            .call("query", || self.tables.query_at(&dataset_id, current, &filter))
            .await
        {
            Ok(rows) => index_rows(rows, &schema),
            Err(e) => return Ok(Step::from_table(base, e)),
        };

        let expected = if current == base {
            base
        } else {
            match base_check {
                BaseCheck::Exact => {
                    return Ok(Step::rejected(
                        base,
                        ConflictKind::VersionAdvanced,
                        format!("table is at {}, change is based on {}", current, base),
                    ));
                }
                BaseCheck::Rebase => {
                    let stale = stale_cells(payload, &current_rows);
                    if !stale.is_empty() {
                        return Ok(Step::rejected(
                            base,
                            ConflictKind::VersionAdvanced,
                            format!(
                                "table is at {}, changed since {}: {}",
                                current,
                                base,
                                stale.join(", ")
                            ),
                        ));
                    }
                    info!(change_request_id = %cr.id, from = %base, to = %current, "Change rebased onto current table version");
                    cr.base_version = current;
                    current
                }
            }
        };

        let rules = self.rules.current(&dataset_id).await?;
        let priors = prior_values(payload, &current_rows);
        let report = self.coordinator.validate_payload(
            Checkpoint::Merge,
            &rules,
            payload,
            &schema.key_columns,
            &priors,
        );
        if !report.passed {
            return Ok(Step::Rejected {
                base: expected,
                conflict: MergeConflict {
                    kind: ConflictKind::ValidationFailed,
                    detail: report.summary.to_string(),
                },
                validation: Some(report.summary),
            });
        }
        let validation = Some(report.summary);

        let rows = match build_rows(payload, &current_rows) {
            Ok(rows) => rows,
            Err(detail) => {
                return Ok(Step::rejected(expected, ConflictKind::VersionAdvanced, detail));
            }
        };

        // Aligned values are validated again before they are staged.
        let revalidate = |aligned: &[Row]| {
            let aligned = aligned_payload(payload, aligned, &schema.key_columns);
            let report = self.coordinator.validate_payload(
                Checkpoint::Merge,
                &rules,
                &aligned,
                &schema.key_columns,
                &priors,
            );
            if report.passed {
                Ok(())
            } else {
                Err(report.summary)
            }
        };
        let staging = match self
            .stage_aligned(&dataset_id, rows, &schema, expected, revalidate)
            .await
        {
            Ok(staging) => staging,
            Err(step) => return Ok(step),
        };

        let request = MergeRequest {
            staging: staging.clone(),
            key_columns: schema.key_columns.clone(),
            expected_version: expected,
            change_request_id: Some(cr.id.clone()),
            allow_update: payload.change_type() == ChangeType::Edit,
        };
        match self.call("merge", || self.tables.merge(request.clone())).await {
            Ok(receipt) => Ok(Step::Applied {
                base: expected,
                receipt,
                validation,
            }),
            Err(e) => {
                if let Err(discard) = self.tables.discard_staging(&staging).await {
                    debug!(staging_id = %staging.id, "Failed to discard staging: {}", discard);
                }
                // An earlier try may have been applied before it failed or timed out.
                if let Ok(Some(receipt)) = self.applied_version(&dataset_id, cr).await {
                    return Ok(Step::Applied {
                        base: expected,
                        receipt,
                        validation,
                    });
                }
                Ok(Step::from_table(expected, e))
            }
        }
    }

    /// Stage rows, with bounded type alignment after a schema mismatch.
    ///
    /// Aligned rows must pass `revalidate` before they are staged.
    async fn stage_aligned<V>(
        &self,
        dataset_id: &DatasetId,
        rows: Vec<Row>,
        schema: &TableSchema,
        base: TableVersion,
        revalidate: V,
    ) -> std::result::Result<StagingRef, Step>
    where
        V: Fn(&[Row]) -> std::result::Result<(), ValidationSummary>,
    {
        let mut rows = rows;
        let mut alignments = 0;
        loop {
            match self
                .call("stage", || self.tables.stage(dataset_id, rows.clone()))
                .await
            {
                Ok(staging) => return Ok(staging),
                Err(TableStoreError::SchemaMismatch(detail))
                    if alignments < self.config.schema_alignment_attempts =>
                {
                    alignments += 1;
                    warn!(dataset_id = %dataset_id, alignments, "Schema mismatch while staging, aligning types: {}", detail);
                    rows = align_rows(&rows, schema).map_err(|reason| {
                        Step::rejected(
                            base,
                            ConflictKind::SchemaMismatch,
                            format!("{}; alignment failed: {}", detail, reason),
                        )
                    })?;
                    if let Err(summary) = revalidate(&rows) {
                        info!(dataset_id = %dataset_id, "Aligned values failed merge validation");
                        return Err(Step::Rejected {
                            base,
                            conflict: MergeConflict {
                                kind: ConflictKind::ValidationFailed,
                                detail: summary.to_string(),
                            },
                            validation: Some(summary),
                        });
                    }
                }
                Err(e) => return Err(Step::from_table(base, e)),
            }
        }
    }

    /// A table version already produced by merging `cr`, if any.
    async fn applied_version(
        &self,
        dataset_id: &DatasetId,
        cr: &ChangeRequest,
    ) -> TableResult<Option<MergeReceipt>> {
        let history = self.call("history", || self.tables.history(dataset_id)).await?;
        Ok(history
            .into_iter()
            .find(|info| info.change_request_id.as_ref() == Some(&cr.id))
            .map(|info| MergeReceipt {
                version: info.version,
                rows_added: 0,
                rows_updated: 0,
                cells_changed: 0,
            }))
    }

    /// Run a table-store call with a deadline, retrying transient failures.
    async fn call<T, F, Fut>(&self, operation: &'static str, mut f: F) -> TableResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TableResult<T>>,
    {
        let policy = self.config.retry;
        let deadline = self.config.merge_timeout();
        let attempts = policy.max_attempts.max(1);
        let mut retry = 0;
        loop {
            let result = match tokio::time::timeout(deadline, f()).await {
                Ok(result) => result,
                Err(_) => Err(TableStoreError::Timeout(deadline)),
            };
            match result {
                Err(e) if e.is_transient() && retry + 1 < attempts => {
                    retry += 1;
                    let delay = policy.delay_for(retry);
                    warn!(
                        operation,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "Transient table store failure, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Row keys a payload touches.
fn payload_keys(payload: &ChangePayload, schema: &TableSchema) -> Vec<String> {
    let mut keys: Vec<String> = match payload {
        ChangePayload::Append { rows } => rows
            .iter()
            .filter_map(|row| row_key(row, &schema.key_columns))
            .collect(),
        ChangePayload::Edit { changes } => changes.iter().map(|c| c.row_key.clone()).collect(),
    };
    keys.sort();
    keys.dedup();
    keys
}

fn index_rows(rows: Vec<Row>, schema: &TableSchema) -> HashMap<String, Row> {
    rows.into_iter()
        .filter_map(|row| row_key(&row, &schema.key_columns).map(|key| (key, row)))
        .collect()
}

/// Cells whose stored value moved away from what the change was based on.
fn stale_cells(payload: &ChangePayload, current: &HashMap<String, Row>) -> Vec<String> {
    match payload {
        ChangePayload::Append { .. } => current
            .keys()
            .map(|key| format!("row {} already exists", key))
            .collect(),
        ChangePayload::Edit { changes } => changes
            .iter()
            .filter_map(|change| match current.get(&change.row_key) {
                None => Some(format!("row {} no longer exists", change.row_key)),
                Some(row) => {
                    let stored = row.get(&change.column).cloned().unwrap_or_default();
                    (!stored.same_value(&change.old_value)).then(|| {
                        format!(
                            "{}.{} is now {} (was {})",
                            change.row_key, change.column, stored, change.old_value
                        )
                    })
                }
            })
            .collect(),
    }
}

/// Stored values the merge-level checkpoint compares edits against.
fn prior_values(payload: &ChangePayload, current: &HashMap<String, Row>) -> PriorValues {
    match payload {
        ChangePayload::Append { .. } => PriorValues::new(),
        ChangePayload::Edit { changes } => changes
            .iter()
            .filter_map(|change| {
                current.get(&change.row_key).map(|row| {
                    (
                        (change.row_key.clone(), change.column.clone()),
                        row.get(&change.column).cloned().unwrap_or(CellValue::Null),
                    )
                })
            })
            .collect(),
    }
}

/// The payload with its values replaced by their aligned forms.
fn aligned_payload(
    payload: &ChangePayload,
    aligned: &[Row],
    key_columns: &[String],
) -> ChangePayload {
    match payload {
        ChangePayload::Append { .. } => ChangePayload::Append {
            rows: aligned.to_vec(),
        },
        ChangePayload::Edit { changes } => {
            let by_key: HashMap<String, &Row> = aligned
                .iter()
                .filter_map(|row| row_key(row, key_columns).map(|key| (key, row)))
                .collect();
            let changes = changes
                .iter()
                .map(|change| {
                    let mut change = change.clone();
                    if let Some(value) = by_key
                        .get(&change.row_key)
                        .and_then(|row| row.get(&change.column))
                    {
                        change.new_value = value.clone();
                    }
                    change
                })
                .collect();
            ChangePayload::Edit { changes }
        }
    }
}

/// Rows to stage: appended rows as-is, edited rows as the stored row with
/// the changes applied.
fn build_rows(
    payload: &ChangePayload,
    current: &HashMap<String, Row>,
) -> std::result::Result<Vec<Row>, String> {
    match payload {
        ChangePayload::Append { rows } => Ok(rows.clone()),
        ChangePayload::Edit { changes } => {
            let mut edited: BTreeMap<&str, Row> = BTreeMap::new();
            for change in changes {
                let key = change.row_key.as_str();
                if !edited.contains_key(key) {
                    let stored = current
                        .get(key)
                        .ok_or_else(|| format!("row {} no longer exists", key))?;
                    edited.insert(key, stored.clone());
                }
                if let Some(row) = edited.get_mut(key) {
                    row.insert(change.column.clone(), change.new_value.clone());
                }
            }
            Ok(edited.into_values().collect())
        }
    }
}
