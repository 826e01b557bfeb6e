//! Live edit sessions.
//!
//! A session is one user's private staging area for one dataset. Edits are
//! validated per cell as they arrive, kept even when invalid so the user can
//! fix them, and turned into a change request on submit.
//!
//! The metadata store holds the only copy of a session, so several managers
//! over one store see the same sessions. Writes only update a record that
//! still exists: a session replaced by a newer one, or ended elsewhere, is
//! gone for good. Expiry is checked lazily on access: an expired session can
//! still be inspected and ended, but accepts no new edits and cannot be
//! submitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use tessera_protocol::{
    row_key, AuditEvent, AuditKind, CellChange, CellEdit, CellValue, ChangePayload, ChangeRequest,
    ChangeType, DatasetId, LiveEditSession, ProjectId, Row, SessionId, StagedRows, UserId,
    WorkflowConfig,
};
use tessera_validation::{
    CellOutcome, Checkpoint, CompiledRuleSet, PriorValues, ValidationCoordinator,
    ValidationSummary,
};

use crate::audit::{emit, AuditRecorder};
use crate::authz::{Action, Authorizer};
use crate::change_request::{ChangeRequestService, NewChangeRequest};
use crate::error::{Result, TableStoreError, WorkflowError};
use crate::locks::KeyedLocks;
use crate::store::MetadataStore;
use crate::table::{RowFilter, TableStore};

/// Arguments for [`SessionManager::start_session`].
#[derive(Debug, Clone)]
pub struct StartSession {
    pub project_id: ProjectId,
    pub dataset_id: DatasetId,
    pub user_id: UserId,
    pub mode: ChangeType,
    /// Edit mode: rows to edit, identified by their key columns; empty means
    /// the whole table. Append mode: the rows to append.
    pub rows: Vec<Row>,
}

/// One cell edit as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditInput {
    pub row_key: String,
    pub column: String,
    pub new_value: CellValue,
    #[serde(default)]
    pub client_timestamp: Option<DateTime<Utc>>,
}

impl EditInput {
    pub fn new(row_key: impl Into<String>, column: impl Into<String>, new_value: CellValue) -> Self {
        Self {
            row_key: row_key.into(),
            column: column.into(),
            new_value,
            client_timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    Ok,
    Error,
}

/// Result of saving one edit. The edit is stored either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub status: SaveStatus,
    pub validation: CellOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewSummary {
    pub rows_changed: usize,
    pub cells_changed: usize,
    /// Appended rows show every non-null cell as a change from null.
    pub diffs: Vec<CellChange>,
    pub validation_summary: ValidationSummary,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub title: String,
    pub reviewers: Vec<UserId>,
}

pub struct SessionManager {
    store: Arc<dyn MetadataStore>,
    tables: Arc<dyn TableStore>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditRecorder>,
    change_requests: Arc<ChangeRequestService>,
    coordinator: ValidationCoordinator,
    config: WorkflowConfig,
    locks: KeyedLocks<SessionId>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        tables: Arc<dyn TableStore>,
        authorizer: Arc<dyn Authorizer>,
        audit: Arc<dyn AuditRecorder>,
        change_requests: Arc<ChangeRequestService>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            tables,
            authorizer,
            audit,
            change_requests,
            coordinator: ValidationCoordinator::new(),
            config,
            locks: KeyedLocks::new(),
        }
    }

    /// Start a session, invalidating any session the user already holds on
    /// the dataset.
    pub async fn start_session(&self, request: StartSession) -> Result<LiveEditSession> {
        let StartSession {
            project_id,
            dataset_id,
            user_id,
            mode,
            rows,
        } = request;

        if !self
            .authorizer
            .can_perform(&user_id, &project_id, Action::Edit)
            .await
        {
            return Err(WorkflowError::Forbidden {
                user: user_id,
                project: project_id,
                action: Action::Edit,
            });
        }

        let schema = self
            .tables
            .schema(&dataset_id)
            .await
            .map_err(|e| table_error(&dataset_id, e))?;
        let base_version = self
            .tables
            .current_version(&dataset_id)
            .await
            .map_err(|e| table_error(&dataset_id, e))?;
        let rules_snapshot = self.store.current_rules(&dataset_id).await?;
        CompiledRuleSet::compile(&rules_snapshot)?;

        let key_columns = schema.key_columns.clone();
        let mut keyed = StagedRows::new();
        for (index, row) in rows.into_iter().enumerate() {
            let key = row_key(&row, &key_columns).ok_or_else(|| {
                WorkflowError::invalid(format!(
                    "row #{} has no value for key columns [{}]",
                    index + 1,
                    key_columns.join(", ")
                ))
            })?;
            if keyed.insert(key.clone(), row).is_some() {
                return Err(WorkflowError::invalid(format!("row {} is listed more than once", key)));
            }
        }

        let staged = match mode {
            ChangeType::Edit => {
                let filter = if keyed.is_empty() {
                    RowFilter::All
                } else {
                    RowFilter::keys(keyed.keys().cloned())
                };
                let stored = self
                    .tables
                    .query_at(&dataset_id, base_version, &filter)
                    .await
                    .map_err(|e| table_error(&dataset_id, e))?;
                let stored: StagedRows = stored
                    .into_iter()
                    .filter_map(|row| row_key(&row, &key_columns).map(|key| (key, row)))
                    .collect();
                if let Some(missing) = keyed.keys().find(|k| !stored.contains_key(*k)) {
                    return Err(WorkflowError::not_found(format!(
                        "row {} in dataset {}",
                        missing, dataset_id
                    )));
                }
                stored
            }
            ChangeType::Append => {
                if keyed.is_empty() {
                    return Err(WorkflowError::invalid("an append session needs at least one row"));
                }
                let existing = self
                    .tables
                    .query_at(&dataset_id, base_version, &RowFilter::keys(keyed.keys().cloned()))
                    .await
                    .map_err(|e| table_error(&dataset_id, e))?;
                if let Some(key) = existing.first().and_then(|row| row_key(row, &key_columns)) {
                    return Err(WorkflowError::invalid(format!(
                        "row {} already exists in dataset {}",
                        key, dataset_id
                    )));
                }
                keyed
            }
        };

        let editable_columns: Vec<String> = schema
            .column_names()
            .filter(|c| !key_columns.iter().any(|k| k.as_str() == *c))
            .map(str::to_string)
            .collect();

        let now = Utc::now();
        let session = LiveEditSession {
            session_id: SessionId::new(),
            project_id,
            dataset_id,
            user_id,
            mode,
            key_columns,
            editable_columns,
            rules_snapshot,
            base_version,
            rows: staged,
            edits: Vec::new(),
            created_at: now,
            expires_at: now + self.config.session_ttl(),
        };

        let replaced = self.store.create_session(&session).await?;

        info!(
            session_id = %session.session_id,
            dataset_id = %session.dataset_id,
            user = %session.user_id,
            mode = %session.mode,
            rows = session.rows.len(),
            base_version = %session.base_version,
            "Edit session started"
        );
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditKind::SessionStarted,
                session.dataset_id.clone(),
                session.user_id.clone(),
            )
            .with_detail(json!({
                "session_id": session.session_id,
                "mode": session.mode,
                "rows": session.rows.len(),
                "base_version": session.base_version,
                "rules_version": session.rules_snapshot.version,
                "replaced": replaced,
            })),
        )
        .await;
        Ok(session)
    }

    /// Current state of a session. Allowed after expiry.
    pub async fn get_session(&self, session_id: &SessionId, user: &UserId) -> Result<LiveEditSession> {
        self.load_owned(session_id, user).await
    }

    /// Stage one cell edit.
    ///
    /// Runs the cell checkpoint and stores the edit whatever the outcome. A
    /// later edit to the same cell replaces the earlier one.
    pub async fn save_edit(
        &self,
        session_id: &SessionId,
        user: &UserId,
        input: EditInput,
    ) -> Result<SaveOutcome> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.load_active(session_id, user).await?;
        let rules = CompiledRuleSet::compile(&session.rules_snapshot)?;

        check_target(&session, &input)?;
        let outcome = self.apply_edit(&mut session, &rules, input);
        self.save(&session).await?;

        debug!(session_id = %session_id, edits = session.edits.len(), status = ?outcome.status, "Edit saved");
        Ok(outcome)
    }

    /// Stage several edits at once. Either every edit is stored or none is.
    pub async fn batch_save(
        &self,
        session_id: &SessionId,
        user: &UserId,
        inputs: Vec<EditInput>,
    ) -> Result<Vec<SaveOutcome>> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.load_active(session_id, user).await?;
        let rules = CompiledRuleSet::compile(&session.rules_snapshot)?;

        for input in &inputs {
            check_target(&session, input)?;
        }
        let outcomes: Vec<SaveOutcome> = inputs
            .into_iter()
            .map(|input| self.apply_edit(&mut session, &rules, input))
            .collect();
        self.save(&session).await?;

        debug!(session_id = %session_id, saved = outcomes.len(), edits = session.edits.len(), "Batch saved");
        Ok(outcomes)
    }

    /// What submitting now would propose, with the session-level findings.
    /// Allowed after expiry.
    pub async fn preview(&self, session_id: &SessionId, user: &UserId) -> Result<PreviewSummary> {
        let session = self.load_owned(session_id, user).await?;
        let rules = CompiledRuleSet::compile(&session.rules_snapshot)?;
        let payload = session.payload();

        let diffs: Vec<CellChange> = match &payload {
            ChangePayload::Edit { changes } => changes.clone(),
            ChangePayload::Append { rows } => rows
                .iter()
                .enumerate()
                .flat_map(|(index, row)| {
                    let key = row_key(row, &session.key_columns)
                        .unwrap_or_else(|| format!("#{}", index + 1));
                    row.iter()
                        .filter(|(_, value)| !value.is_null())
                        .map(move |(column, value)| CellChange {
                            row_key: key.clone(),
                            column: column.clone(),
                            old_value: CellValue::Null,
                            new_value: value.clone(),
                        })
                        .collect::<Vec<_>>()
                })
                .collect(),
        };
        let rows_changed = diffs
            .iter()
            .map(|d| d.row_key.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        let report = self.coordinator.validate_payload(
            Checkpoint::Session,
            &rules,
            &payload,
            &session.key_columns,
            &PriorValues::new(),
        );
        Ok(PreviewSummary {
            rows_changed,
            cells_changed: diffs.len(),
            diffs,
            validation_summary: report.summary,
        })
    }

    /// Turn the session into a change request.
    ///
    /// Runs the session checkpoint; on error or fatal findings nothing is
    /// created and the full summary is returned. On success the session ends.
    pub async fn submit_change_request(
        &self,
        session_id: &SessionId,
        user: &UserId,
        request: SubmitRequest,
    ) -> Result<ChangeRequest> {
        let _guard = self.locks.lock(session_id).await;
        let session = self.load_active(session_id, user).await?;

        if !self
            .authorizer
            .can_perform(user, &session.project_id, Action::Submit)
            .await
        {
            return Err(WorkflowError::Forbidden {
                user: user.clone(),
                project: session.project_id.clone(),
                action: Action::Submit,
            });
        }

        let payload = session.payload();
        if payload.is_empty() {
            return Err(WorkflowError::invalid("the session has no changes to submit"));
        }

        let rules = CompiledRuleSet::compile(&session.rules_snapshot)?;
        let report = self.coordinator.validate_payload(
            Checkpoint::Session,
            &rules,
            &payload,
            &session.key_columns,
            &PriorValues::new(),
        );
        if !report.passed {
            info!(
                session_id = %session_id,
                errors = report.summary.error_count,
                fatal = report.summary.fatal_count,
                "Submission blocked by validation"
            );
            return Err(WorkflowError::validation(report.summary));
        }

        // A session replaced or ended since it was loaded must not submit.
        self.save(&session).await?;

        let cr = self
            .change_requests
            .create(
                NewChangeRequest {
                    project_id: session.project_id.clone(),
                    dataset_id: session.dataset_id.clone(),
                    author_id: session.user_id.clone(),
                    title: request.title,
                    payload,
                    reviewers: request.reviewers,
                    base_version: session.base_version,
                    rules_version: session.rules_snapshot.version,
                },
                &report,
            )
            .await?;

        self.close(&session, "submitted").await?;
        Ok(cr)
    }

    /// Discard a session and its staged edits. Allowed after expiry.
    pub async fn end_session(&self, session_id: &SessionId, user: &UserId) -> Result<()> {
        let _guard = self.locks.lock(session_id).await;
        let session = self.load_owned(session_id, user).await?;
        self.close(&session, "ended").await
    }

    /// Delete the records of expired sessions. Returns the reclaimed ids.
    pub async fn reclaim_expired_sessions(&self) -> Result<Vec<SessionId>> {
        let reclaimed = self
            .store
            .delete_expired_sessions(Utc::now().timestamp_millis())
            .await?;
        Ok(reclaimed)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn apply_edit(
        &self,
        session: &mut LiveEditSession,
        rules: &CompiledRuleSet,
        input: EditInput,
    ) -> SaveOutcome {
        let old_value = session
            .edit(&input.row_key, &input.column)
            .map(|e| e.old_value.clone())
            .or_else(|| session.original_value(&input.row_key, &input.column))
            .unwrap_or_default();
        let prior = match session.mode {
            ChangeType::Edit => Some(&old_value),
            ChangeType::Append => None,
        };

        let outcome = self.coordinator.validate_cell(
            rules,
            &input.row_key,
            &input.column,
            &input.new_value,
            prior,
        );

        session.upsert_edit(CellEdit {
            session_id: session.session_id.clone(),
            row_key: input.row_key,
            column: input.column,
            old_value,
            new_value: input.new_value,
            client_timestamp: input.client_timestamp.unwrap_or_else(Utc::now),
            is_valid: outcome.valid,
            severity: outcome.severity,
            messages: outcome.messages(),
        });

        SaveOutcome {
            status: if outcome.valid {
                SaveStatus::Ok
            } else {
                SaveStatus::Error
            },
            validation: outcome,
        }
    }

    async fn load(&self, session_id: &SessionId) -> Result<LiveEditSession> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(format!("session {}", session_id)))
    }

    async fn load_owned(&self, session_id: &SessionId, user: &UserId) -> Result<LiveEditSession> {
        let session = self.load(session_id).await?;
        if &session.user_id != user {
            return Err(WorkflowError::Forbidden {
                user: user.clone(),
                project: session.project_id.clone(),
                action: Action::Edit,
            });
        }
        Ok(session)
    }

    async fn load_active(&self, session_id: &SessionId, user: &UserId) -> Result<LiveEditSession> {
        let session = self.load_owned(session_id, user).await?;
        if session.is_expired() {
            return Err(WorkflowError::SessionExpired(session_id.clone()));
        }
        Ok(session)
    }

    /// Write the session back. Fails with `NotFound` once its record is gone.
    async fn save(&self, session: &LiveEditSession) -> Result<()> {
        if self.store.update_session(session).await? {
            Ok(())
        } else {
            Err(WorkflowError::not_found(format!(
                "session {}",
                session.session_id
            )))
        }
    }

    async fn close(&self, session: &LiveEditSession, reason: &str) -> Result<()> {
        self.store.delete_session(&session.session_id).await?;
        info!(session_id = %session.session_id, reason, "Edit session closed");
        emit(
            self.audit.as_ref(),
            AuditEvent::new(
                AuditKind::SessionEnded,
                session.dataset_id.clone(),
                session.user_id.clone(),
            )
            .with_detail(json!({
                "session_id": session.session_id,
                "reason": reason,
                "edits": session.edits.len(),
                "expired": session.is_expired(),
            })),
        )
        .await;
        Ok(())
    }
}

/// Reject edits to non-editable columns and rows outside the session.
fn check_target(session: &LiveEditSession, input: &EditInput) -> Result<()> {
    if !session.is_editable(&input.column) {
        return Err(WorkflowError::ForbiddenColumn {
            column: input.column.clone(),
        });
    }
    if !session.rows.contains_key(&input.row_key) {
        return Err(WorkflowError::not_found(format!(
            "row {} in session {}",
            input.row_key, session.session_id
        )));
    }
    Ok(())
}

fn table_error(dataset_id: &DatasetId, err: TableStoreError) -> WorkflowError {
    match err {
        TableStoreError::UnknownDataset(_) => {
            WorkflowError::not_found(format!("dataset {}", dataset_id))
        }
        other => WorkflowError::Table(other),
    }
}
