//! Versioned rule sets.

use sqlx::Row;
use tessera_protocol::{DatasetId, Rule, RuleSet, UserId};
use tracing::info;

use crate::error::{DbError, Result};
use crate::TesseraDb;

impl TesseraDb {
    /// Store `rules` as the next version of the dataset's rule set.
    ///
    /// Existing versions are never modified. Callers are expected to have
    /// compiled the rules already.
    pub async fn attach_rules(
        &self,
        dataset_id: &DatasetId,
        rules: Vec<Rule>,
        created_by: Option<&UserId>,
    ) -> Result<RuleSet> {
        let rules_json = serde_json::to_string(&rules)?;
        let now = Self::now_millis();

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS version FROM ts_rule_sets WHERE dataset_id = ?",
        )
        .bind(dataset_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let version = row.get::<i64, _>("version") + 1;

        sqlx::query(
            r#"
            INSERT INTO ts_rule_sets (dataset_id, version, rules_json, created_by, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(dataset_id.as_str())
        .bind(version)
        .bind(&rules_json)
        .bind(created_by.map(|u| u.as_str()))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from_write)?;

        tx.commit().await?;

        info!(
            dataset_id = %dataset_id,
            version,
            rules = rules.len(),
            "Rule set attached"
        );

        Ok(RuleSet {
            dataset_id: dataset_id.clone(),
            version: version as u32,
            rules,
            created_at: Self::millis_to_datetime(now),
            created_by: created_by.cloned(),
        })
    }

    /// Latest rule set, or an empty version-0 set when none is attached.
    pub async fn current_rules(&self, dataset_id: &DatasetId) -> Result<RuleSet> {
        let row = sqlx::query(
            r#"
            SELECT * FROM ts_rule_sets
            WHERE dataset_id = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(dataset_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.row_to_rule_set(&row),
            None => Ok(RuleSet::empty(dataset_id.clone())),
        }
    }

    pub async fn rules_at(&self, dataset_id: &DatasetId, version: u32) -> Result<Option<RuleSet>> {
        let row = sqlx::query("SELECT * FROM ts_rule_sets WHERE dataset_id = ? AND version = ?")
            .bind(dataset_id.as_str())
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| self.row_to_rule_set(&row)).transpose()
    }

    /// All versions, oldest first.
    pub async fn rule_history(&self, dataset_id: &DatasetId) -> Result<Vec<RuleSet>> {
        let rows = sqlx::query("SELECT * FROM ts_rule_sets WHERE dataset_id = ? ORDER BY version ASC")
            .bind(dataset_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| self.row_to_rule_set(row)).collect()
    }

    fn row_to_rule_set(&self, row: &sqlx::sqlite::SqliteRow) -> Result<RuleSet> {
        let rules_json: String = row.get("rules_json");
        let created_by: Option<String> = row.get("created_by");
        Ok(RuleSet {
            dataset_id: DatasetId::new(row.get::<String, _>("dataset_id")),
            version: row.get::<i64, _>("version") as u32,
            rules: serde_json::from_str(&rules_json)?,
            created_at: Self::millis_to_datetime(row.get("created_at")),
            created_by: created_by.map(UserId::new),
        })
    }
}
