//! Recovery records for live edit sessions.

use sqlx::Row;
use tessera_protocol::{DatasetId, LiveEditSession, SessionId, UserId};
use tracing::info;

use crate::error::Result;
use crate::TesseraDb;

impl TesseraDb {
    /// Insert the record of a newly started session.
    ///
    /// Any other session held by the same `(dataset, user)` is deleted in the
    /// same transaction, so at most one record per owner exists. Returns the
    /// ids of the replaced sessions.
    pub async fn create_session(&self, session: &LiveEditSession) -> Result<Vec<SessionId>> {
        let record = serde_json::to_string(session)?;
        let now = Self::now_millis();

        let mut tx = self.pool.begin().await?;

        let replaced = sqlx::query(
            "SELECT session_id FROM ts_edit_sessions WHERE dataset_id = ? AND user_id = ? AND session_id != ?",
        )
        .bind(session.dataset_id.as_str())
        .bind(session.user_id.as_str())
        .bind(session.session_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM ts_edit_sessions WHERE dataset_id = ? AND user_id = ? AND session_id != ?",
        )
        .bind(session.dataset_id.as_str())
        .bind(session.user_id.as_str())
        .bind(session.session_id.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ts_edit_sessions (
                session_id, dataset_id, user_id, record_json, created_at, expires_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.session_id.as_str())
        .bind(session.dataset_id.as_str())
        .bind(session.user_id.as_str())
        .bind(&record)
        .bind(session.created_at.timestamp_millis())
        .bind(session.expires_at.timestamp_millis())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(replaced
            .iter()
            .filter_map(|row| SessionId::parse(&row.get::<String, _>("session_id")).ok())
            .collect())
    }

    /// Overwrite an existing session record.
    ///
    /// Returns `false` when the record is gone (ended, submitted, reclaimed
    /// or replaced by a newer session); nothing is written then.
    pub async fn update_session(&self, session: &LiveEditSession) -> Result<bool> {
        let record = serde_json::to_string(session)?;
        let result = sqlx::query(
            r#"
            UPDATE ts_edit_sessions
            SET record_json = ?, expires_at = ?, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(&record)
        .bind(session.expires_at.timestamp_millis())
        .bind(Self::now_millis())
        .bind(session.session_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_session(&self, id: &SessionId) -> Result<Option<LiveEditSession>> {
        let row = sqlx::query("SELECT record_json FROM ts_edit_sessions WHERE session_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| Self::decode_session(&row)).transpose()
    }

    pub async fn session_for_owner(
        &self,
        dataset_id: &DatasetId,
        user_id: &UserId,
    ) -> Result<Option<LiveEditSession>> {
        let row = sqlx::query(
            "SELECT record_json FROM ts_edit_sessions WHERE dataset_id = ? AND user_id = ?",
        )
        .bind(dataset_id.as_str())
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::decode_session(&row)).transpose()
    }

    /// Returns `true` if a record was deleted.
    pub async fn delete_session(&self, id: &SessionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ts_edit_sessions WHERE session_id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every record whose expiry is at or before `now_millis`.
    pub async fn delete_expired_sessions(&self, now_millis: i64) -> Result<Vec<SessionId>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("SELECT session_id FROM ts_edit_sessions WHERE expires_at <= ?")
            .bind(now_millis)
            .fetch_all(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM ts_edit_sessions WHERE expires_at <= ?")
            .bind(now_millis)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let ids: Vec<SessionId> = rows
            .iter()
            .filter_map(|row| SessionId::parse(&row.get::<String, _>("session_id")).ok())
            .collect();

        if !ids.is_empty() {
            info!(count = ids.len(), "Expired edit sessions reclaimed");
        }
        Ok(ids)
    }

    fn decode_session(row: &sqlx::sqlite::SqliteRow) -> Result<LiveEditSession> {
        let record: String = row.get("record_json");
        Ok(serde_json::from_str(&record)?)
    }
}
