//! In-memory versioned table store.
//!
//! Every write produces a new immutable snapshot; older versions stay
//! queryable. Snapshots share rows through `Arc`, so `restore` is cheap.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use tessera_protocol::{
    row_key, CellValue, ChangeRequestId, DatasetId, Row, StagingId, TableSchema, TableVersion,
    VersionInfo, VersionOperation,
};

use crate::error::TableStoreError;
use crate::table::{MergeReceipt, MergeRequest, RowFilter, StagingRef, TableResult, TableStore};

type KeyedRows = BTreeMap<String, Row>;

#[derive(Debug)]
struct Snapshot {
    info: VersionInfo,
    rows: Arc<KeyedRows>,
}

#[derive(Debug)]
struct Table {
    schema: TableSchema,
    versions: Vec<Snapshot>,
}

impl Table {
    fn head(&self) -> Option<&Snapshot> {
        self.versions.last()
    }

    fn current_version(&self) -> TableVersion {
        self.head()
            .map(|s| s.info.version)
            .unwrap_or(TableVersion(0))
    }

    fn current_rows(&self) -> Arc<KeyedRows> {
        self.head()
            .map(|s| Arc::clone(&s.rows))
            .unwrap_or_default()
    }

    fn at(&self, version: TableVersion) -> Option<&Snapshot> {
        self.versions.iter().find(|s| s.info.version == version)
    }

    fn push(
        &mut self,
        operation: VersionOperation,
        rows: Arc<KeyedRows>,
        change_request_id: Option<ChangeRequestId>,
    ) -> TableVersion {
        let version = self.current_version().next();
        self.versions.push(Snapshot {
            info: VersionInfo {
                version,
                operation,
                created_at: Utc::now(),
                row_count: rows.len(),
                change_request_id,
            },
            rows,
        });
        version
    }
}

#[derive(Debug)]
struct Staged {
    dataset_id: DatasetId,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<DatasetId, Table>,
    staging: HashMap<StagingId, Staged>,
}

impl Inner {
    fn table(&self, dataset_id: &DatasetId) -> TableResult<&Table> {
        self.tables
            .get(dataset_id)
            .ok_or_else(|| TableStoreError::UnknownDataset(dataset_id.clone()))
    }

    fn table_mut(&mut self, dataset_id: &DatasetId) -> TableResult<&mut Table> {
        self.tables
            .get_mut(dataset_id)
            .ok_or_else(|| TableStoreError::UnknownDataset(dataset_id.clone()))
    }
}

/// Versioned table store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    inner: RwLock<Inner>,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> TableResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| TableStoreError::Unavailable("table store lock poisoned".into()))
    }

    fn write(&self) -> TableResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| TableStoreError::Unavailable("table store lock poisoned".into()))
    }
}

/// Check a row against the schema and fill absent nullable columns with null.
/// Returns the row's key alongside the normalized row.
fn conform_row(schema: &TableSchema, row: Row) -> TableResult<(String, Row)> {
    if let Some(unknown) = row.keys().find(|c| schema.column(c).is_none()) {
        return Err(TableStoreError::SchemaMismatch(format!(
            "column '{}' does not exist in the table",
            unknown
        )));
    }

    let mut conformed = Row::new();
    for spec in &schema.columns {
        let value = row.get(&spec.name).cloned().unwrap_or_default();
        if !value.fits(spec.column_type) {
            return Err(TableStoreError::SchemaMismatch(format!(
                "column '{}' expects {}, got {} ({})",
                spec.name,
                spec.column_type,
                value.type_name(),
                value
            )));
        }
        if value.is_null() && !spec.nullable {
            return Err(TableStoreError::SchemaMismatch(format!(
                "column '{}' is not nullable",
                spec.name
            )));
        }
        conformed.insert(spec.name.clone(), value);
    }

    let key = row_key(&conformed, &schema.key_columns).ok_or_else(|| {
        TableStoreError::SchemaMismatch(format!(
            "row is missing a value for key columns [{}]",
            schema.key_columns.join(", ")
        ))
    })?;
    Ok((key, conformed))
}

fn conform_rows(schema: &TableSchema, rows: Vec<Row>) -> TableResult<Vec<(String, Row)>> {
    let conformed = rows
        .into_iter()
        .map(|row| conform_row(schema, row))
        .collect::<TableResult<Vec<_>>>()?;

    let mut seen = std::collections::HashSet::new();
    let duplicates: Vec<String> = conformed
        .iter()
        .filter(|(key, _)| !seen.insert(key.clone()))
        .map(|(key, _)| key.clone())
        .collect();
    if !duplicates.is_empty() {
        return Err(TableStoreError::DuplicateKeys(duplicates));
    }
    Ok(conformed)
}

fn changed_cells(existing: &Row, incoming: &Row) -> u64 {
    incoming
        .iter()
        .filter(|(column, value)| {
            !existing
                .get(*column)
                .unwrap_or(&CellValue::Null)
                .same_value(value)
        })
        .count() as u64
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn create_table(
        &self,
        dataset_id: &DatasetId,
        schema: TableSchema,
        rows: Vec<Row>,
    ) -> TableResult<TableVersion> {
        if schema.key_columns.is_empty() {
            return Err(TableStoreError::SchemaMismatch(
                "a table needs at least one key column".into(),
            ));
        }
        if let Some(missing) = schema
            .key_columns
            .iter()
            .find(|k| schema.column(k).is_none())
        {
            return Err(TableStoreError::SchemaMismatch(format!(
                "key column '{}' is not a table column",
                missing
            )));
        }

        let mut inner = self.write()?;
        if inner.tables.contains_key(dataset_id) {
            return Err(TableStoreError::DatasetExists(dataset_id.clone()));
        }

        let rows: KeyedRows = conform_rows(&schema, rows)?.into_iter().collect();
        let mut table = Table {
            schema,
            versions: Vec::new(),
        };
        let version = table.push(VersionOperation::Create, Arc::new(rows), None);
        inner.tables.insert(dataset_id.clone(), table);

        info!(dataset_id = %dataset_id, version = %version, "Table created");
        Ok(version)
    }

    async fn schema(&self, dataset_id: &DatasetId) -> TableResult<TableSchema> {
        Ok(self.read()?.table(dataset_id)?.schema.clone())
    }

    async fn current_version(&self, dataset_id: &DatasetId) -> TableResult<TableVersion> {
        Ok(self.read()?.table(dataset_id)?.current_version())
    }

    async fn query(&self, dataset_id: &DatasetId, filter: &RowFilter) -> TableResult<Vec<Row>> {
        let rows = self.read()?.table(dataset_id)?.current_rows();
        Ok(rows
            .iter()
            .filter(|(key, row)| filter.matches(key, row))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn query_at(
        &self,
        dataset_id: &DatasetId,
        version: TableVersion,
        filter: &RowFilter,
    ) -> TableResult<Vec<Row>> {
        let inner = self.read()?;
        let snapshot = inner.table(dataset_id)?.at(version).ok_or_else(|| {
            TableStoreError::UnknownVersion {
                dataset: dataset_id.clone(),
                version,
            }
        })?;
        Ok(snapshot
            .rows
            .iter()
            .filter(|(key, row)| filter.matches(key, row))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn append(&self, dataset_id: &DatasetId, rows: Vec<Row>) -> TableResult<TableVersion> {
        let mut inner = self.write()?;
        let table = inner.table_mut(dataset_id)?;
        let incoming = conform_rows(&table.schema, rows)?;

        let current = table.current_rows();
        let existing: Vec<String> = incoming
            .iter()
            .filter(|(key, _)| current.contains_key(key))
            .map(|(key, _)| key.clone())
            .collect();
        if !existing.is_empty() {
            return Err(TableStoreError::DuplicateKeys(existing));
        }

        let mut next = (*current).clone();
        next.extend(incoming);
        let version = table.push(VersionOperation::Append, Arc::new(next), None);
        debug!(dataset_id = %dataset_id, version = %version, "Rows appended");
        Ok(version)
    }

    async fn stage(&self, dataset_id: &DatasetId, rows: Vec<Row>) -> TableResult<StagingRef> {
        let mut inner = self.write()?;
        let schema = inner.table(dataset_id)?.schema.clone();
        let conformed: Vec<Row> = conform_rows(&schema, rows)?
            .into_iter()
            .map(|(_, row)| row)
            .collect();

        let staging = StagingRef {
            id: StagingId::new(),
            dataset_id: dataset_id.clone(),
            row_count: conformed.len(),
        };
        inner.staging.insert(
            staging.id.clone(),
            Staged {
                dataset_id: dataset_id.clone(),
                rows: conformed,
            },
        );
        debug!(dataset_id = %dataset_id, staging_id = %staging.id, rows = staging.row_count, "Rows staged");
        Ok(staging)
    }

    async fn discard_staging(&self, staging: &StagingRef) -> TableResult<()> {
        self.write()?.staging.remove(&staging.id);
        Ok(())
    }

    async fn merge(&self, request: MergeRequest) -> TableResult<MergeReceipt> {
        let mut inner = self.write()?;
        let dataset_id = request.staging.dataset_id.clone();

        match inner.staging.get(&request.staging.id) {
            Some(staged) if staged.dataset_id == dataset_id => {}
            _ => return Err(TableStoreError::UnknownStaging(request.staging.id.clone())),
        }

        let table = inner.table(&dataset_id)?;
        let actual = table.current_version();
        if actual != request.expected_version {
            return Err(TableStoreError::VersionAdvanced {
                dataset: dataset_id,
                expected: request.expected_version,
                actual,
            });
        }

        let current = table.current_rows();
        let mut next = (*current).clone();
        let mut receipt = MergeReceipt {
            version: actual,
            rows_added: 0,
            rows_updated: 0,
            cells_changed: 0,
        };
        let mut duplicates = Vec::new();

        if let Some(staged) = inner.staging.get(&request.staging.id) {
            for row in &staged.rows {
                let Some(key) = row_key(row, &request.key_columns) else {
                    return Err(TableStoreError::SchemaMismatch(format!(
                        "staged row is missing a value for key columns [{}]",
                        request.key_columns.join(", ")
                    )));
                };
                match next.get_mut(&key) {
                    Some(_) if !request.allow_update => duplicates.push(key),
                    Some(existing) => {
                        let changed = changed_cells(existing, row);
                        if changed > 0 {
                            receipt.rows_updated += 1;
                            receipt.cells_changed += changed;
                            existing.extend(row.iter().map(|(c, v)| (c.clone(), v.clone())));
                        }
                    }
                    None => {
                        receipt.rows_added += 1;
                        receipt.cells_changed +=
                            row.values().filter(|v| !v.is_null()).count() as u64;
                        next.insert(key, row.clone());
                    }
                }
            }
        }

        if !duplicates.is_empty() {
            return Err(TableStoreError::DuplicateKeys(duplicates));
        }

        let table = inner.table_mut(&dataset_id)?;
        receipt.version = table.push(
            VersionOperation::Merge,
            Arc::new(next),
            request.change_request_id.clone(),
        );
        inner.staging.remove(&request.staging.id);

        info!(
            dataset_id = %dataset_id,
            version = %receipt.version,
            rows_added = receipt.rows_added,
            rows_updated = receipt.rows_updated,
            cells_changed = receipt.cells_changed,
            "Staging merged into main table"
        );
        Ok(receipt)
    }

    async fn history(&self, dataset_id: &DatasetId) -> TableResult<Vec<VersionInfo>> {
        Ok(self
            .read()?
            .table(dataset_id)?
            .versions
            .iter()
            .map(|s| s.info.clone())
            .collect())
    }

    async fn restore(&self, dataset_id: &DatasetId, version: TableVersion) -> TableResult<TableVersion> {
        let mut inner = self.write()?;
        let table = inner.table_mut(dataset_id)?;
        let rows = table
            .at(version)
            .map(|s| Arc::clone(&s.rows))
            .ok_or_else(|| TableStoreError::UnknownVersion {
                dataset: dataset_id.clone(),
                version,
            })?;
        let restored = table.push(VersionOperation::Restore, rows, None);
        info!(dataset_id = %dataset_id, from = %version, version = %restored, "Table restored");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::{ColumnSpec, ColumnType};

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSpec::required("id", ColumnType::Int64),
                ColumnSpec::optional("name", ColumnType::String),
                ColumnSpec::optional("age", ColumnType::Int64),
            ],
            vec!["id".into()],
        )
    }

    fn row(id: i64, name: &str, age: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), CellValue::Int(id));
        row.insert("name".into(), CellValue::Text(name.into()));
        row.insert("age".into(), CellValue::Int(age));
        row
    }

    async fn seeded() -> (InMemoryTableStore, DatasetId) {
        let store = InMemoryTableStore::new();
        let ds = DatasetId::new("people");
        store
            .create_table(&ds, schema(), vec![row(1, "ann", 30)])
            .await
            .unwrap();
        (store, ds)
    }

    #[tokio::test]
    async fn test_staging_does_not_touch_main_table() {
        let (store, ds) = seeded().await;
        let staging = store.stage(&ds, vec![row(2, "bo", 40)]).await.unwrap();

        assert_eq!(store.query(&ds, &RowFilter::All).await.unwrap().len(), 1);
        assert_eq!(store.current_version(&ds).await.unwrap(), TableVersion(1));

        let receipt = store
            .merge(MergeRequest {
                staging,
                key_columns: vec!["id".into()],
                expected_version: TableVersion(1),
                change_request_id: None,
                allow_update: false,
            })
            .await
            .unwrap();
        assert_eq!(receipt.version, TableVersion(2));
        assert_eq!(receipt.rows_added, 1);
        assert_eq!(receipt.cells_changed, 3);
        assert_eq!(store.query(&ds, &RowFilter::All).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_merge_rejects_advanced_version() {
        let (store, ds) = seeded().await;
        let staging = store.stage(&ds, vec![row(2, "bo", 40)]).await.unwrap();
        store.append(&ds, vec![row(3, "cy", 50)]).await.unwrap();

        let err = store
            .merge(MergeRequest {
                staging,
                key_columns: vec!["id".into()],
                expected_version: TableVersion(1),
                change_request_id: None,
                allow_update: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TableStoreError::VersionAdvanced {
                actual: TableVersion(2),
                ..
            }
        ));
        let keys: Vec<i64> = store
            .query(&ds, &RowFilter::All)
            .await
            .unwrap()
            .iter()
            .filter_map(|r| match r["id"] {
                CellValue::Int(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_update_counts_changed_cells_only() {
        let (store, ds) = seeded().await;
        let staging = store.stage(&ds, vec![row(1, "ann", 31)]).await.unwrap();
        let receipt = store
            .merge(MergeRequest {
                staging,
                key_columns: vec!["id".into()],
                expected_version: TableVersion(1),
                change_request_id: Some(ChangeRequestId::new()),
                allow_update: true,
            })
            .await
            .unwrap();
        assert_eq!(receipt.rows_added, 0);
        assert_eq!(receipt.rows_updated, 1);
        assert_eq!(receipt.cells_changed, 1);

        let history = store.history(&ds).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].operation, VersionOperation::Merge);
        assert!(history[1].change_request_id.is_some());
    }

    #[tokio::test]
    async fn test_append_merge_rejects_existing_key() {
        let (store, ds) = seeded().await;
        let staging = store.stage(&ds, vec![row(1, "dup", 1)]).await.unwrap();
        let err = store
            .merge(MergeRequest {
                staging,
                key_columns: vec!["id".into()],
                expected_version: TableVersion(1),
                change_request_id: None,
                allow_update: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TableStoreError::DuplicateKeys(keys) if keys == vec!["1".to_string()]));
    }

    #[tokio::test]
    async fn test_stage_rejects_type_mismatch() {
        let (store, ds) = seeded().await;
        let mut bad = row(2, "bo", 40);
        bad.insert("age".into(), CellValue::Text("forty".into()));
        let err = store.stage(&ds, vec![bad]).await.unwrap_err();
        assert!(matches!(err, TableStoreError::SchemaMismatch(_)));

        let mut unknown = row(2, "bo", 40);
        unknown.insert("email".into(), CellValue::Text("x".into()));
        assert!(matches!(
            store.stage(&ds, vec![unknown]).await.unwrap_err(),
            TableStoreError::SchemaMismatch(_)
        ));
    }

    #[tokio::test]
    async fn test_restore_and_query_at() {
        let (store, ds) = seeded().await;
        store.append(&ds, vec![row(2, "bo", 40)]).await.unwrap();

        let restored = store.restore(&ds, TableVersion(1)).await.unwrap();
        assert_eq!(restored, TableVersion(3));
        assert_eq!(store.query(&ds, &RowFilter::All).await.unwrap().len(), 1);
        assert_eq!(
            store
                .query_at(&ds, TableVersion(2), &RowFilter::All)
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(matches!(
            store.restore(&ds, TableVersion(9)).await.unwrap_err(),
            TableStoreError::UnknownVersion { .. }
        ));
    }
}
