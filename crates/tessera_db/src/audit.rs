//! Audit trail.

use sqlx::Row;
use tessera_protocol::{AuditEvent, AuditKind, ChangeRequestId, DatasetId, UserId};

use crate::error::{DbError, Result};
use crate::types::AuditFilter;
use crate::TesseraDb;

impl TesseraDb {
    /// Append an audit event. Returns the assigned id.
    pub async fn insert_audit_event(&self, event: &AuditEvent) -> Result<i64> {
        let detail = serde_json::to_string(&event.detail)?;
        let result = sqlx::query(
            r#"
            INSERT INTO ts_audit_events (kind, dataset_id, change_request_id, actor, detail_json, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.kind.as_str())
        .bind(event.dataset_id.as_str())
        .bind(event.change_request_id.as_ref().map(|id| id.as_str()))
        .bind(event.actor.as_str())
        .bind(&detail)
        .bind(event.recorded_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// List audit events in the order they were recorded.
    pub async fn list_audit_events(&self, filter: AuditFilter) -> Result<Vec<AuditEvent>> {
        let mut sql = String::from("SELECT * FROM ts_audit_events WHERE 1=1");
        if filter.dataset_id.is_some() {
            sql.push_str(" AND dataset_id = ?");
        }
        if filter.change_request_id.is_some() {
            sql.push_str(" AND change_request_id = ?");
        }
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        sql.push_str(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut query = sqlx::query(&sql);
        if let Some(dataset_id) = &filter.dataset_id {
            query = query.bind(dataset_id.as_str());
        }
        if let Some(id) = &filter.change_request_id {
            query = query.bind(id.as_str());
        }
        if let Some(kind) = filter.kind {
            query = query.bind(kind.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.row_to_audit_event(row)).collect()
    }

    fn row_to_audit_event(&self, row: &sqlx::sqlite::SqliteRow) -> Result<AuditEvent> {
        let kind: String = row.get("kind");
        let cr_id: Option<String> = row.get("change_request_id");
        let detail: String = row.get("detail_json");

        Ok(AuditEvent {
            id: Some(row.get("id")),
            kind: kind
                .parse::<AuditKind>()
                .map_err(|e| DbError::invalid_state(e.to_string()))?,
            dataset_id: DatasetId::new(row.get::<String, _>("dataset_id")),
            change_request_id: cr_id
                .map(|id| ChangeRequestId::parse(&id))
                .transpose()
                .map_err(|e| DbError::invalid_state(e.to_string()))?,
            actor: UserId::new(row.get::<String, _>("actor")),
            detail: serde_json::from_str(&detail)?,
            recorded_at: Self::millis_to_datetime(row.get("recorded_at")),
        })
    }
}
