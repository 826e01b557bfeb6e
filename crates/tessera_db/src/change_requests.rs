//! Change requests and their merge outcomes.

use sqlx::Row;
use std::collections::BTreeMap;
use tessera_protocol::{
    ChangePayload, ChangeRequest, ChangeRequestId, ChangeRequestStatus, ChangeType,
    ConflictKind, DatasetId, MergeConflict, MergeDisposition, MergeOutcome, MergeOutcomeId,
    ProjectId, ReviewerState, TableVersion, UserId,
};
use tracing::debug;

use crate::error::{DbError, Result};
use crate::types::ChangeRequestFilter;
use crate::TesseraDb;

impl TesseraDb {
    // ========================================================================
    // Change Requests
    // ========================================================================

    pub async fn insert_change_request(&self, cr: &ChangeRequest) -> Result<()> {
        let columns = CrColumns::encode(cr)?;
        sqlx::query(
            r#"
            INSERT INTO ts_change_requests (
                id, project_id, dataset_id, author_id, title, change_type, status,
                payload_json, payload_digest, reviewers_json, reviewer_states_json,
                base_version, rules_version, flagged, withdrawn, merge_disposition_json,
                revision, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(cr.id.as_str())
        .bind(cr.project_id.as_str())
        .bind(cr.dataset_id.as_str())
        .bind(cr.author_id.as_str())
        .bind(&cr.title)
        .bind(cr.change_type.as_str())
        .bind(cr.status.as_str())
        .bind(&columns.payload)
        .bind(&cr.payload_digest)
        .bind(&columns.reviewers)
        .bind(&columns.reviewer_states)
        .bind(cr.base_version.get() as i64)
        .bind(cr.rules_version as i64)
        .bind(cr.flagged)
        .bind(cr.withdrawn)
        .bind(&columns.disposition)
        .bind(cr.revision)
        .bind(cr.created_at.timestamp_millis())
        .bind(cr.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(DbError::from_write)?;

        Ok(())
    }

    pub async fn get_change_request(&self, id: &ChangeRequestId) -> Result<Option<ChangeRequest>> {
        let row = sqlx::query("SELECT * FROM ts_change_requests WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| self.row_to_change_request(&row)).transpose()
    }

    /// Persist `cr` if the stored revision still equals `cr.revision`.
    ///
    /// On success the stored and in-memory revisions are both incremented.
    /// Returns `false` when another writer got there first; nothing is
    /// written in that case.
    pub async fn update_change_request(&self, cr: &mut ChangeRequest) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let applied = Self::update_change_request_in(&mut tx, cr).await?;
        if !applied {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        cr.revision += 1;
        Ok(true)
    }

    /// Persist a merge attempt: the outcome row and the change request
    /// transition it caused, in one transaction.
    ///
    /// Same conditional semantics as [`Self::update_change_request`]; the
    /// outcome is not stored when the update loses.
    pub async fn record_merge_attempt(
        &self,
        cr: &mut ChangeRequest,
        outcome: &MergeOutcome,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !Self::update_change_request_in(&mut tx, cr).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        let actors = serde_json::to_string(&outcome.actors)?;
        sqlx::query(
            r#"
            INSERT INTO ts_merge_outcomes (
                id, change_request_id, attempt, base_version, result_version,
                conflict_kind, conflict_detail, rows_added, rows_updated, cells_changed,
                actors_json, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(outcome.id.as_str())
        .bind(outcome.change_request_id.as_str())
        .bind(outcome.attempt as i64)
        .bind(outcome.base_version.get() as i64)
        .bind(outcome.result_version.map(|v| v.get() as i64))
        .bind(outcome.conflict.as_ref().map(|c| c.kind.as_str()))
        .bind(outcome.conflict.as_ref().map(|c| c.detail.as_str()))
        .bind(outcome.rows_added as i64)
        .bind(outcome.rows_updated as i64)
        .bind(outcome.cells_changed as i64)
        .bind(&actors)
        .bind(outcome.recorded_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from_write)?;

        tx.commit().await?;
        cr.revision += 1;

        debug!(
            change_request_id = %cr.id,
            attempt = outcome.attempt,
            success = outcome.is_success(),
            "Merge attempt recorded"
        );
        Ok(true)
    }

    async fn update_change_request_in(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        cr: &ChangeRequest,
    ) -> Result<bool> {
        let columns = CrColumns::encode(cr)?;
        let result = sqlx::query(
            r#"
            UPDATE ts_change_requests SET
                status = ?,
                payload_json = ?,
                reviewer_states_json = ?,
                base_version = ?,
                rules_version = ?,
                flagged = ?,
                withdrawn = ?,
                merge_disposition_json = ?,
                revision = revision + 1,
                updated_at = ?
            WHERE id = ? AND revision = ?
            "#,
        )
        .bind(cr.status.as_str())
        .bind(&columns.payload)
        .bind(&columns.reviewer_states)
        .bind(cr.base_version.get() as i64)
        .bind(cr.rules_version as i64)
        .bind(cr.flagged)
        .bind(cr.withdrawn)
        .bind(&columns.disposition)
        .bind(cr.updated_at.timestamp_millis())
        .bind(cr.id.as_str())
        .bind(cr.revision)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from_write)?;

        Ok(result.rows_affected() == 1)
    }

    /// List change requests, newest first.
    pub async fn list_change_requests(&self, filter: ChangeRequestFilter) -> Result<Vec<ChangeRequest>> {
        let mut sql = String::from("SELECT * FROM ts_change_requests WHERE 1=1");
        if filter.dataset_id.is_some() {
            sql.push_str(" AND dataset_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut query = sqlx::query(&sql);
        if let Some(dataset_id) = &filter.dataset_id {
            query = query.bind(dataset_id.as_str());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.row_to_change_request(row)).collect()
    }

    fn row_to_change_request(&self, row: &sqlx::sqlite::SqliteRow) -> Result<ChangeRequest> {
        let id: String = row.get("id");
        let change_type: String = row.get("change_type");
        let status: String = row.get("status");
        let payload: Option<String> = row.get("payload_json");
        let reviewers: String = row.get("reviewers_json");
        let reviewer_states: String = row.get("reviewer_states_json");
        let disposition: Option<String> = row.get("merge_disposition_json");

        Ok(ChangeRequest {
            id: ChangeRequestId::parse(&id).map_err(|e| DbError::invalid_state(e.to_string()))?,
            project_id: ProjectId::new(row.get::<String, _>("project_id")),
            dataset_id: DatasetId::new(row.get::<String, _>("dataset_id")),
            author_id: UserId::new(row.get::<String, _>("author_id")),
            title: row.get("title"),
            change_type: change_type
                .parse::<ChangeType>()
                .map_err(|e| DbError::invalid_state(e.to_string()))?,
            payload: payload
                .map(|p| serde_json::from_str::<ChangePayload>(&p))
                .transpose()?,
            payload_digest: row.get("payload_digest"),
            reviewers: serde_json::from_str(&reviewers)?,
            reviewer_states: serde_json::from_str::<BTreeMap<UserId, ReviewerState>>(&reviewer_states)?,
            status: status
                .parse::<ChangeRequestStatus>()
                .map_err(|e| DbError::invalid_state(e.to_string()))?,
            base_version: TableVersion(row.get::<i64, _>("base_version") as u64),
            rules_version: row.get::<i64, _>("rules_version") as u32,
            flagged: row.get("flagged"),
            withdrawn: row.get("withdrawn"),
            merge_disposition: disposition
                .map(|d| serde_json::from_str::<MergeDisposition>(&d))
                .transpose()?,
            revision: row.get("revision"),
            created_at: Self::millis_to_datetime(row.get("created_at")),
            updated_at: Self::millis_to_datetime(row.get("updated_at")),
        })
    }

    // ========================================================================
    // Merge Outcomes
    // ========================================================================

    /// All merge attempts for a change request, oldest first.
    pub async fn list_merge_outcomes(&self, id: &ChangeRequestId) -> Result<Vec<MergeOutcome>> {
        let rows = sqlx::query(
            "SELECT * FROM ts_merge_outcomes WHERE change_request_id = ? ORDER BY attempt ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.row_to_merge_outcome(row)).collect()
    }

    pub async fn latest_merge_outcome(&self, id: &ChangeRequestId) -> Result<Option<MergeOutcome>> {
        let row = sqlx::query(
            "SELECT * FROM ts_merge_outcomes WHERE change_request_id = ? ORDER BY attempt DESC LIMIT 1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.row_to_merge_outcome(&row)).transpose()
    }

    /// Attempt number the next merge of this change request should use.
    pub async fn next_merge_attempt(&self, id: &ChangeRequestId) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(attempt), 0) AS attempt FROM ts_merge_outcomes WHERE change_request_id = ?",
        )
        .bind(id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("attempt") as u32 + 1)
    }

    fn row_to_merge_outcome(&self, row: &sqlx::sqlite::SqliteRow) -> Result<MergeOutcome> {
        let id: String = row.get("id");
        let cr_id: String = row.get("change_request_id");
        let conflict_kind: Option<String> = row.get("conflict_kind");
        let conflict_detail: Option<String> = row.get("conflict_detail");
        let actors: String = row.get("actors_json");

        let conflict = match conflict_kind {
            Some(kind) => Some(MergeConflict {
                kind: kind
                    .parse::<ConflictKind>()
                    .map_err(|e| DbError::invalid_state(e.to_string()))?,
                detail: conflict_detail.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(MergeOutcome {
            id: MergeOutcomeId::parse(&id).map_err(|e| DbError::invalid_state(e.to_string()))?,
            change_request_id: ChangeRequestId::parse(&cr_id)
                .map_err(|e| DbError::invalid_state(e.to_string()))?,
            attempt: row.get::<i64, _>("attempt") as u32,
            base_version: TableVersion(row.get::<i64, _>("base_version") as u64),
            result_version: row
                .get::<Option<i64>, _>("result_version")
                .map(|v| TableVersion(v as u64)),
            conflict,
            rows_added: row.get::<i64, _>("rows_added") as u64,
            rows_updated: row.get::<i64, _>("rows_updated") as u64,
            cells_changed: row.get::<i64, _>("cells_changed") as u64,
            actors: serde_json::from_str(&actors)?,
            recorded_at: Self::millis_to_datetime(row.get("recorded_at")),
        })
    }
}

/// JSON-encoded columns of a change request row.
struct CrColumns {
    payload: Option<String>,
    reviewers: String,
    reviewer_states: String,
    disposition: Option<String>,
}

impl CrColumns {
    fn encode(cr: &ChangeRequest) -> Result<Self> {
        Ok(Self {
            payload: cr.payload.as_ref().map(serde_json::to_string).transpose()?,
            reviewers: serde_json::to_string(&cr.reviewers)?,
            reviewer_states: serde_json::to_string(&cr.reviewer_states)?,
            disposition: cr
                .merge_disposition
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        })
    }
}
