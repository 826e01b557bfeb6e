//! Validation, approval and merge pipeline for versioned tables.
//!
//! Users stage edits in a [`SessionManager`] session, submit them as a
//! change request, reviewers approve or reject through the
//! [`ChangeRequestService`], and the [`MergeExecutor`] applies approved
//! changes to the main table under an optimistic version check.
//!
//! # Collaborators
//!
//! The core owns no storage. It talks to four traits:
//!
//! - [`MetadataStore`]: change requests, merge outcomes, sessions, rules, audit
//!   (implemented by [`tessera_db::TesseraDb`])
//! - [`TableStore`]: versioned main tables with staging and keyed merge
//!   (implemented by [`InMemoryTableStore`])
//! - [`Authorizer`]: `can_perform(user, project, action)`
//! - [`AuditRecorder`]: receives an event after each transition
//!
//! # Concurrency
//!
//! Operations on one change request are serialized by a keyed lock and
//! persisted with a conditional update; operations on one session are
//! serialized the same way. Merges of different change requests race
//! freely: the table store's version check picks the winner and the loser
//! records a conflict.

pub mod audit;
pub mod authz;
pub mod change_request;
pub mod error;
pub mod locks;
pub mod memory_table;
pub mod merge;
pub mod rules;
pub mod schema_align;
pub mod session;
pub mod store;
pub mod table;

use std::sync::Arc;

use tessera_protocol::WorkflowConfig;

pub use audit::{AuditRecorder, DbAuditRecorder, TracingAuditRecorder};
pub use authz::{Action, AllowAll, Authorizer, StaticPolicy};
pub use change_request::{ChangeRequestService, NewChangeRequest, ReviewOutcome};
pub use error::{Result, TableStoreError, WorkflowError};
pub use locks::KeyedLocks;
pub use memory_table::InMemoryTableStore;
pub use merge::{BaseCheck, MergeAttempt, MergeExecutor};
pub use rules::RuleRegistry;
pub use session::{
    EditInput, PreviewSummary, SaveOutcome, SaveStatus, SessionManager, StartSession,
    SubmitRequest,
};
pub use store::MetadataStore;
pub use table::{MergeReceipt, MergeRequest, RowFilter, StagingRef, TableStore};

/// The assembled pipeline.
pub struct Workflow {
    pub rules: Arc<RuleRegistry>,
    pub sessions: Arc<SessionManager>,
    pub change_requests: Arc<ChangeRequestService>,
    pub executor: Arc<MergeExecutor>,
}

impl Workflow {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        tables: Arc<dyn TableStore>,
        authorizer: Arc<dyn Authorizer>,
        audit: Arc<dyn AuditRecorder>,
        config: WorkflowConfig,
    ) -> Self {
        let rules = Arc::new(RuleRegistry::new(Arc::clone(&store), Arc::clone(&authorizer)));
        let executor = Arc::new(MergeExecutor::new(
            Arc::clone(&store),
            Arc::clone(&tables),
            Arc::clone(&audit),
            Arc::clone(&rules),
            config.clone(),
        ));
        let change_requests = Arc::new(ChangeRequestService::new(
            Arc::clone(&store),
            Arc::clone(&tables),
            Arc::clone(&authorizer),
            Arc::clone(&audit),
            Arc::clone(&rules),
            Arc::clone(&executor),
        ));
        let sessions = Arc::new(SessionManager::new(
            store,
            tables,
            authorizer,
            audit,
            Arc::clone(&change_requests),
            config,
        ));
        Self {
            rules,
            sessions,
            change_requests,
            executor,
        }
    }

    /// Metadata store, durable audit trail, and the given table store.
    pub fn with_db(
        db: Arc<tessera_db::TesseraDb>,
        tables: Arc<dyn TableStore>,
        authorizer: Arc<dyn Authorizer>,
        config: WorkflowConfig,
    ) -> Self {
        let store: Arc<dyn MetadataStore> = db;
        let audit: Arc<dyn AuditRecorder> = Arc::new(DbAuditRecorder::new(Arc::clone(&store)));
        Self::new(store, tables, authorizer, audit, config)
    }
}
