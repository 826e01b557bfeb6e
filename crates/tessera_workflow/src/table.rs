//! Table store collaborator.
//!
//! The versioned tabular store that holds each dataset's main table. Writes
//! never touch the main table directly: payloads land in an isolated staging
//! area first and are then merged under an optimistic version check.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tessera_protocol::{
    CellValue, ChangeRequestId, DatasetId, Row, StagingId, TableSchema, TableVersion, VersionInfo,
};

use crate::error::TableStoreError;

pub type TableResult<T> = std::result::Result<T, TableStoreError>;

/// Row selection for [`TableStore::query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowFilter {
    All,
    /// Rows whose rendered key is in the list.
    Keys { keys: Vec<String> },
    /// Rows where `column` has exactly `value`.
    Equals { column: String, value: CellValue },
}

impl RowFilter {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RowFilter::Keys {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, key: &str, row: &Row) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Keys { keys } => keys.iter().any(|k| k == key),
            RowFilter::Equals { column, value } => row
                .get(column)
                .map(|v| v.same_value(value))
                .unwrap_or_else(|| value.is_null()),
        }
    }
}

/// Handle to rows written to an isolated staging area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRef {
    pub id: StagingId,
    pub dataset_id: DatasetId,
    pub row_count: usize,
}

/// Keyed merge of a staging area into the main table.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub staging: StagingRef,
    pub key_columns: Vec<String>,
    /// The merge applies only if the table is still at this version.
    pub expected_version: TableVersion,
    pub change_request_id: Option<ChangeRequestId>,
    /// Whether staged rows may overwrite existing rows with the same key.
    /// Appends set this to `false` so a duplicate key is rejected.
    pub allow_update: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReceipt {
    pub version: TableVersion,
    pub rows_added: u64,
    pub rows_updated: u64,
    pub cells_changed: u64,
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create a dataset's main table at version 1.
    async fn create_table(
        &self,
        dataset_id: &DatasetId,
        schema: TableSchema,
        rows: Vec<Row>,
    ) -> TableResult<TableVersion>;

    async fn schema(&self, dataset_id: &DatasetId) -> TableResult<TableSchema>;

    async fn current_version(&self, dataset_id: &DatasetId) -> TableResult<TableVersion>;

    /// Rows at the current version, in key order.
    async fn query(&self, dataset_id: &DatasetId, filter: &RowFilter) -> TableResult<Vec<Row>>;

    async fn query_at(
        &self,
        dataset_id: &DatasetId,
        version: TableVersion,
        filter: &RowFilter,
    ) -> TableResult<Vec<Row>>;

    /// Unconditional append of new rows.
    async fn append(&self, dataset_id: &DatasetId, rows: Vec<Row>) -> TableResult<TableVersion>;

    /// Write rows to an isolated staging area. The main table is not touched.
    async fn stage(&self, dataset_id: &DatasetId, rows: Vec<Row>) -> TableResult<StagingRef>;

    async fn discard_staging(&self, staging: &StagingRef) -> TableResult<()>;

    /// Atomically merge a staging area into the main table.
    ///
    /// Fails with [`TableStoreError::VersionAdvanced`] and applies nothing
    /// when the table is no longer at `expected_version`.
    async fn merge(&self, request: MergeRequest) -> TableResult<MergeReceipt>;

    /// Every version of the table, oldest first.
    async fn history(&self, dataset_id: &DatasetId) -> TableResult<Vec<VersionInfo>>;

    /// Create a new version whose content equals `version`.
    async fn restore(&self, dataset_id: &DatasetId, version: TableVersion) -> TableResult<TableVersion>;
}
