//! Test harness for workflow integration tests.
//!
//! Wires a [`Workflow`] over a real in-memory SQLite metadata store and an
//! in-memory table store wrapped in [`FaultyTableStore`], which can inject
//! failures and stalls per operation and counts calls.
//!
//! # Example
//!
//! ```ignore
//! let h = TestHarness::new().await;
//! h.seed_people().await;
//! let cr = h.submit_edit("carol", &[("1", "age", 31.into())], &["alice"]).await;
//! h.workflow.change_requests.approve(&cr.id, &user("alice")).await?;
//! ```

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_db::{AuditFilter, TesseraDb};
use tessera_protocol::{
    AuditKind, CellValue, ChangeRequest, ChangeRequestId, ChangeType, ColumnSpec, ColumnType,
    DatasetId, ProjectId, RetryPolicy, Row, Rule, TableSchema, TableVersion, UserId,
    VersionInfo, WorkflowConfig,
};
use tessera_workflow::{
    AllowAll, Authorizer, EditInput, InMemoryTableStore, MergeReceipt, MergeRequest, RowFilter,
    StagingRef, StartSession, SubmitRequest, TableStore, TableStoreError, Workflow,
};

pub const PROJECT: &str = "census";
pub const DATASET: &str = "people";

pub fn user(name: &str) -> UserId {
    UserId::new(name)
}

pub fn person(id: i64, name: &str, age: i64) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), CellValue::Int(id));
    row.insert("name".into(), CellValue::Text(name.into()));
    row.insert("age".into(), CellValue::Int(age));
    row
}

pub fn people_schema() -> TableSchema {
    TableSchema::new(
        vec![
            ColumnSpec::required("id", ColumnType::Int64),
            ColumnSpec::optional("name", ColumnType::String),
            ColumnSpec::optional("age", ColumnType::Int64),
        ],
        vec!["id".into()],
    )
}

/// Retries without waiting and a short per-call deadline.
pub fn test_config() -> WorkflowConfig {
    WorkflowConfig {
        merge_timeout_ms: 200,
        retry: RetryPolicy::immediate(3),
        ..WorkflowConfig::default()
    }
}

// ============================================================================
// Fault injection
// ============================================================================

#[derive(Debug, Clone)]
pub enum Fault {
    /// Return the error without calling the inner store.
    Fail(TableStoreError),
    /// Sleep before calling the inner store.
    Stall(Duration),
    /// Call the inner store, then return the error anyway.
    ApplyThenFail(TableStoreError),
}

/// Table store wrapper that injects faults per operation name.
pub struct FaultyTableStore {
    inner: InMemoryTableStore,
    faults: Mutex<HashMap<&'static str, VecDeque<Fault>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FaultyTableStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryTableStore::new(),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Queue `fault` for the next `times` calls of `operation`.
    pub fn inject(&self, operation: &'static str, fault: Fault, times: usize) {
        let mut faults = self.faults.lock().unwrap();
        let queue = faults.entry(operation).or_default();
        for _ in 0..times {
            queue.push_back(fault.clone());
        }
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }

    fn next_fault(&self, operation: &'static str) -> Option<Fault> {
        *self.calls.lock().unwrap().entry(operation).or_default() += 1;
        self.faults
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
    }

    async fn around<T, F>(&self, operation: &'static str, call: F) -> Result<T, TableStoreError>
    where
        F: std::future::Future<Output = Result<T, TableStoreError>>,
    {
        match self.next_fault(operation) {
            None => call.await,
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                call.await
            }
            Some(Fault::ApplyThenFail(err)) => {
                call.await?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl TableStore for FaultyTableStore {
    async fn create_table(
        &self,
        dataset_id: &DatasetId,
        schema: TableSchema,
        rows: Vec<Row>,
    ) -> Result<TableVersion, TableStoreError> {
        self.inner.create_table(dataset_id, schema, rows).await
    }

    async fn schema(&self, dataset_id: &DatasetId) -> Result<TableSchema, TableStoreError> {
        self.around("schema", self.inner.schema(dataset_id)).await
    }

    async fn current_version(&self, dataset_id: &DatasetId) -> Result<TableVersion, TableStoreError> {
        self.around("current_version", self.inner.current_version(dataset_id))
            .await
    }

    async fn query(
        &self,
        dataset_id: &DatasetId,
        filter: &RowFilter,
    ) -> Result<Vec<Row>, TableStoreError> {
        self.around("query", self.inner.query(dataset_id, filter)).await
    }

    async fn query_at(
        &self,
        dataset_id: &DatasetId,
        version: TableVersion,
        filter: &RowFilter,
    ) -> Result<Vec<Row>, TableStoreError> {
        self.around("query_at", self.inner.query_at(dataset_id, version, filter))
            .await
    }

    async fn append(
        &self,
        dataset_id: &DatasetId,
        rows: Vec<Row>,
    ) -> Result<TableVersion, TableStoreError> {
        self.around("append", self.inner.append(dataset_id, rows)).await
    }

    async fn stage(
        &self,
        dataset_id: &DatasetId,
        rows: Vec<Row>,
    ) -> Result<StagingRef, TableStoreError> {
        self.around("stage", self.inner.stage(dataset_id, rows)).await
    }

    async fn discard_staging(&self, staging: &StagingRef) -> Result<(), TableStoreError> {
        self.inner.discard_staging(staging).await
    }

    async fn merge(&self, request: MergeRequest) -> Result<MergeReceipt, TableStoreError> {
        self.around("merge", self.inner.merge(request)).await
    }

    async fn history(&self, dataset_id: &DatasetId) -> Result<Vec<VersionInfo>, TableStoreError> {
        self.around("history", self.inner.history(dataset_id)).await
    }

    async fn restore(
        &self,
        dataset_id: &DatasetId,
        version: TableVersion,
    ) -> Result<TableVersion, TableStoreError> {
        self.inner.restore(dataset_id, version).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct TestHarness {
    pub db: Arc<TesseraDb>,
    pub tables: Arc<FaultyTableStore>,
    pub workflow: Workflow,
    pub project: ProjectId,
    pub dataset: DatasetId,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(test_config(), Arc::new(AllowAll)).await
    }

    pub async fn with_config(config: WorkflowConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        let db = Arc::new(TesseraDb::open_in_memory().await.unwrap());
        let tables = Arc::new(FaultyTableStore::new());
        Self::over(db, tables, config, authorizer)
    }

    /// A second workflow instance over the same stores.
    pub fn reopen(&self) -> Self {
        Self::over(
            Arc::clone(&self.db),
            Arc::clone(&self.tables),
            test_config(),
            Arc::new(AllowAll),
        )
    }

    fn over(
        db: Arc<TesseraDb>,
        tables: Arc<FaultyTableStore>,
        config: WorkflowConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let table_store: Arc<dyn TableStore> = tables.clone();
        let workflow = Workflow::with_db(Arc::clone(&db), table_store, authorizer, config);
        Self {
            db,
            tables,
            workflow,
            project: ProjectId::new(PROJECT),
            dataset: DatasetId::new(DATASET),
        }
    }

    /// People table at version 1 with ids 1..=3.
    pub async fn seed_people(&self) -> TableVersion {
        self.tables
            .create_table(
                &self.dataset,
                people_schema(),
                vec![person(1, "ann", 30), person(2, "bo", 40), person(3, "cy", 50)],
            )
            .await
            .unwrap()
    }

    pub async fn attach_rules(&self, rules: Vec<Rule>) {
        self.workflow
            .rules
            .attach(&self.project, &self.dataset, rules, &user("admin"))
            .await
            .unwrap();
    }

    pub fn start(&self, author: &str, mode: ChangeType, rows: Vec<Row>) -> StartSession {
        StartSession {
            project_id: self.project.clone(),
            dataset_id: self.dataset.clone(),
            user_id: user(author),
            mode,
            rows,
        }
    }

    /// Stage cell edits in a fresh edit session and submit them.
    pub async fn submit_edit(
        &self,
        author: &str,
        edits: &[(&str, &str, CellValue)],
        reviewers: &[&str],
    ) -> ChangeRequest {
        let sessions = &self.workflow.sessions;
        let session = sessions
            .start_session(self.start(author, ChangeType::Edit, Vec::new()))
            .await
            .unwrap();
        let inputs = edits
            .iter()
            .map(|(row, column, value)| EditInput::new(*row, *column, value.clone()))
            .collect();
        sessions
            .batch_save(&session.session_id, &user(author), inputs)
            .await
            .unwrap();
        sessions
            .submit_change_request(
                &session.session_id,
                &user(author),
                SubmitRequest {
                    title: format!("{} edits", author),
                    reviewers: reviewers.iter().map(|r| user(r)).collect(),
                },
            )
            .await
            .unwrap()
    }

    /// Submit an append change request for `rows`.
    pub async fn submit_append(&self, author: &str, rows: Vec<Row>, reviewers: &[&str]) -> ChangeRequest {
        let sessions = &self.workflow.sessions;
        let session = sessions
            .start_session(self.start(author, ChangeType::Append, rows))
            .await
            .unwrap();
        sessions
            .submit_change_request(
                &session.session_id,
                &user(author),
                SubmitRequest {
                    title: format!("{} appends", author),
                    reviewers: reviewers.iter().map(|r| user(r)).collect(),
                },
            )
            .await
            .unwrap()
    }

    pub async fn rows(&self) -> Vec<Row> {
        self.tables.query(&self.dataset, &RowFilter::All).await.unwrap()
    }

    pub async fn cell(&self, id: i64, column: &str) -> CellValue {
        self.rows()
            .await
            .into_iter()
            .find(|row| row.get("id") == Some(&CellValue::Int(id)))
            .and_then(|row| row.get(column).cloned())
            .unwrap_or_default()
    }

    pub async fn version(&self) -> TableVersion {
        self.tables.current_version(&self.dataset).await.unwrap()
    }

    pub async fn audit_kinds(&self, id: &ChangeRequestId) -> Vec<AuditKind> {
        self.db
            .list_audit_events(AuditFilter::for_change_request(id.clone()))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }
}
