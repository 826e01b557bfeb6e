//! All CREATE TABLE statements for the metadata store.

use crate::error::Result;
use crate::TesseraDb;
use tracing::debug;

impl TesseraDb {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;

        self.create_rule_tables().await?;
        self.create_change_request_tables().await?;
        self.create_audit_tables().await?;
        self.create_session_tables().await?;

        debug!("Metadata schema verified");
        Ok(())
    }

    async fn create_rule_tables(&self) -> Result<()> {
        // Immutable, numbered rule sets per dataset.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ts_rule_sets (
                dataset_id TEXT NOT NULL,
                version INTEGER NOT NULL CHECK (version > 0),
                rules_json TEXT NOT NULL,
                created_by TEXT,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, version)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_change_request_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ts_change_requests (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                dataset_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                title TEXT NOT NULL,
                change_type TEXT NOT NULL CHECK (change_type IN ('append', 'edit')),
                status TEXT NOT NULL CHECK (status IN (
                    'pending', 'approved', 'rejected', 'withdrawn',
                    'merge_fail', 'pending_review', 'merged'
                )),
                payload_json TEXT,
                payload_digest TEXT NOT NULL,
                reviewers_json TEXT NOT NULL,
                reviewer_states_json TEXT NOT NULL,
                base_version INTEGER NOT NULL,
                rules_version INTEGER NOT NULL,
                flagged INTEGER NOT NULL DEFAULT 0,
                withdrawn INTEGER NOT NULL DEFAULT 0,
                merge_disposition_json TEXT,
                revision INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ts_change_requests_dataset ON ts_change_requests(dataset_id, status)",
        )
        .execute(&self.pool)
        .await?;

        // Append-only: one row per merge attempt.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ts_merge_outcomes (
                id TEXT PRIMARY KEY,
                change_request_id TEXT NOT NULL REFERENCES ts_change_requests(id),
                attempt INTEGER NOT NULL,
                base_version INTEGER NOT NULL,
                result_version INTEGER,
                conflict_kind TEXT CHECK (conflict_kind IS NULL OR conflict_kind IN (
                    'version_advanced', 'validation_failed', 'schema_mismatch',
                    'timeout', 'store_unavailable', 'payload_tampered'
                )),
                conflict_detail TEXT,
                rows_added INTEGER NOT NULL DEFAULT 0,
                rows_updated INTEGER NOT NULL DEFAULT 0,
                cells_changed INTEGER NOT NULL DEFAULT 0,
                actors_json TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                UNIQUE (change_request_id, attempt)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_audit_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ts_audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                dataset_id TEXT NOT NULL,
                change_request_id TEXT,
                actor TEXT NOT NULL,
                detail_json TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ts_audit_events_cr ON ts_audit_events(change_request_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_session_tables(&self) -> Result<()> {
        // Recovery records for live edit sessions. One per (dataset, user).
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ts_edit_sessions (
                session_id TEXT PRIMARY KEY,
                dataset_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                record_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (dataset_id, user_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
