//! Live edit sessions: a user's private staging area for one dataset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::change::{CellChange, CellEdit, ChangePayload, ChangeType};
use crate::rules::RuleSet;
use crate::types::{CellValue, Row, TableVersion};
use crate::{DatasetId, ProjectId, SessionId, UserId};

/// Rows staged in a session, keyed by row key.
pub type StagedRows = BTreeMap<String, Row>;

/// Durable record of a live edit session.
///
/// `rows` holds the rows being edited: the current table rows in edit mode,
/// or the rows to be appended in append mode. `edits` holds one entry per
/// `(row_key, column)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEditSession {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub dataset_id: DatasetId,
    pub user_id: UserId,
    pub mode: ChangeType,
    pub key_columns: Vec<String>,
    pub editable_columns: Vec<String>,
    /// Rules current when the session started.
    pub rules_snapshot: RuleSet,
    /// Table version the rows were read at.
    pub base_version: TableVersion,
    pub rows: StagedRows,
    pub edits: Vec<CellEdit>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LiveEditSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_editable(&self, column: &str) -> bool {
        self.editable_columns.iter().any(|c| c == column)
    }

    pub fn edit(&self, row_key: &str, column: &str) -> Option<&CellEdit> {
        self.edits
            .iter()
            .find(|e| e.row_key == row_key && e.column == column)
    }

    /// Value of a cell as first read into the session.
    pub fn original_value(&self, row_key: &str, column: &str) -> Option<CellValue> {
        self.rows
            .get(row_key)
            .map(|row| row.get(column).cloned().unwrap_or_default())
    }

    /// Insert or replace the edit for its `(row_key, column)`.
    ///
    /// In append mode the staged row is updated in place as well.
    pub fn upsert_edit(&mut self, edit: CellEdit) {
        if self.mode == ChangeType::Append {
            if let Some(row) = self.rows.get_mut(&edit.row_key) {
                row.insert(edit.column.clone(), edit.new_value.clone());
            }
        }
        match self
            .edits
            .iter_mut()
            .find(|e| e.row_key == edit.row_key && e.column == edit.column)
        {
            Some(existing) => *existing = edit,
            None => self.edits.push(edit),
        }
    }

    /// Edits that actually change a value.
    pub fn effective_changes(&self) -> Vec<CellChange> {
        self.edits
            .iter()
            .filter(|e| !e.old_value.same_value(&e.new_value))
            .map(CellEdit::to_change)
            .collect()
    }

    /// Payload a change request would carry if submitted now.
    pub fn payload(&self) -> ChangePayload {
        match self.mode {
            ChangeType::Append => ChangePayload::Append {
                rows: self.rows.values().cloned().collect(),
            },
            ChangeType::Edit => ChangePayload::Edit {
                changes: self.effective_changes(),
            },
        }
    }
}
