//! Metadata store collaborator.
//!
//! The narrow, transactional record store the workflow reads and writes.
//! [`TesseraDb`] is the production implementation.

use async_trait::async_trait;

use tessera_db::{ChangeRequestFilter, DbError, TesseraDb};
use tessera_protocol::{
    AuditEvent, ChangeRequest, ChangeRequestId, DatasetId, LiveEditSession, MergeOutcome, Rule,
    RuleSet, SessionId, UserId,
};

type DbResult<T> = std::result::Result<T, DbError>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Rules
    async fn attach_rules(
        &self,
        dataset_id: &DatasetId,
        rules: Vec<Rule>,
        created_by: Option<&UserId>,
    ) -> DbResult<RuleSet>;
    async fn current_rules(&self, dataset_id: &DatasetId) -> DbResult<RuleSet>;

    // Change requests
    async fn insert_change_request(&self, cr: &ChangeRequest) -> DbResult<()>;
    async fn get_change_request(&self, id: &ChangeRequestId) -> DbResult<Option<ChangeRequest>>;
    /// Conditional on `cr.revision`; bumps it on success.
    async fn update_change_request(&self, cr: &mut ChangeRequest) -> DbResult<bool>;
    async fn list_change_requests(&self, filter: ChangeRequestFilter) -> DbResult<Vec<ChangeRequest>>;

    // Merge outcomes
    /// Store the outcome and the transition it caused atomically.
    async fn record_merge_attempt(&self, cr: &mut ChangeRequest, outcome: &MergeOutcome) -> DbResult<bool>;
    async fn list_merge_outcomes(&self, id: &ChangeRequestId) -> DbResult<Vec<MergeOutcome>>;
    async fn next_merge_attempt(&self, id: &ChangeRequestId) -> DbResult<u32>;

    // Sessions
    /// Replaces the owner's other sessions. Returns their ids.
    async fn create_session(&self, session: &LiveEditSession) -> DbResult<Vec<SessionId>>;
    /// `false` when the record no longer exists.
    async fn update_session(&self, session: &LiveEditSession) -> DbResult<bool>;
    async fn get_session(&self, id: &SessionId) -> DbResult<Option<LiveEditSession>>;
    async fn delete_session(&self, id: &SessionId) -> DbResult<bool>;
    async fn delete_expired_sessions(&self, now_millis: i64) -> DbResult<Vec<SessionId>>;

    // Audit
    async fn insert_audit_event(&self, event: &AuditEvent) -> DbResult<i64>;
}

#[async_trait]
impl MetadataStore for TesseraDb {
    async fn attach_rules(
        &self,
        dataset_id: &DatasetId,
        rules: Vec<Rule>,
        created_by: Option<&UserId>,
    ) -> DbResult<RuleSet> {
        TesseraDb::attach_rules(self, dataset_id, rules, created_by).await
    }

    async fn current_rules(&self, dataset_id: &DatasetId) -> DbResult<RuleSet> {
        TesseraDb::current_rules(self, dataset_id).await
    }

    async fn insert_change_request(&self, cr: &ChangeRequest) -> DbResult<()> {
        TesseraDb::insert_change_request(self, cr).await
    }

    async fn get_change_request(&self, id: &ChangeRequestId) -> DbResult<Option<ChangeRequest>> {
        TesseraDb::get_change_request(self, id).await
    }

    async fn update_change_request(&self, cr: &mut ChangeRequest) -> DbResult<bool> {
        TesseraDb::update_change_request(self, cr).await
    }

    async fn list_change_requests(&self, filter: ChangeRequestFilter) -> DbResult<Vec<ChangeRequest>> {
        TesseraDb::list_change_requests(self, filter).await
    }

    async fn record_merge_attempt(&self, cr: &mut ChangeRequest, outcome: &MergeOutcome) -> DbResult<bool> {
        TesseraDb::record_merge_attempt(self, cr, outcome).await
    }

    async fn list_merge_outcomes(&self, id: &ChangeRequestId) -> DbResult<Vec<MergeOutcome>> {
        TesseraDb::list_merge_outcomes(self, id).await
    }

    async fn next_merge_attempt(&self, id: &ChangeRequestId) -> DbResult<u32> {
        TesseraDb::next_merge_attempt(self, id).await
    }

    async fn create_session(&self, session: &LiveEditSession) -> DbResult<Vec<SessionId>> {
        TesseraDb::create_session(self, session).await
    }

    async fn update_session(&self, session: &LiveEditSession) -> DbResult<bool> {
        TesseraDb::update_session(self, session).await
    }

    async fn get_session(&self, id: &SessionId) -> DbResult<Option<LiveEditSession>> {
        TesseraDb::get_session(self, id).await
    }

    async fn delete_session(&self, id: &SessionId) -> DbResult<bool> {
        TesseraDb::delete_session(self, id).await
    }

    async fn delete_expired_sessions(&self, now_millis: i64) -> DbResult<Vec<SessionId>> {
        TesseraDb::delete_expired_sessions(self, now_millis).await
    }

    async fn insert_audit_event(&self, event: &AuditEvent) -> DbResult<i64> {
        TesseraDb::insert_audit_event(self, event).await
    }
}
