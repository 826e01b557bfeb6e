//! Merge execution: version conflicts, rebasing retries, store failures and
//! recovery.

mod harness;

use std::time::Duration;

use harness::{person, user, Fault, TestHarness};
use tessera_protocol::{
    AuditKind, CellValue, ChangeRequestStatus, ConflictKind, Rule, RuleKind, Severity,
    TableVersion,
};
use tessera_workflow::{TableStoreError, WorkflowError};

fn unavailable() -> TableStoreError {
    TableStoreError::Unavailable("connection reset".into())
}

#[tokio::test]
async fn test_second_merge_on_stale_base_goes_back_to_review() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let crs = &h.workflow.change_requests;

    let cr1 = h
        .submit_edit("carol", &[("1", "age", 31.into())], &["alice"])
        .await;
    let cr2 = h
        .submit_edit("dave", &[("2", "age", 41.into())], &["alice"])
        .await;
    assert_eq!(cr1.base_version, cr2.base_version);

    let merged = crs.approve(&cr1.id, &user("alice")).await.unwrap();
    assert_eq!(merged.change_request.status, ChangeRequestStatus::Merged);

    let stale = crs.approve(&cr2.id, &user("alice")).await.unwrap();
    let attempt = stale.merge.unwrap();
    let conflict = attempt.outcome.conflict.unwrap();
    assert_eq!(conflict.kind, ConflictKind::VersionAdvanced);
    assert_eq!(stale.change_request.status, ChangeRequestStatus::PendingReview);

    // The first merge is untouched and the loser wrote nothing.
    assert_eq!(h.version().await, TableVersion(2));
    assert_eq!(h.cell(1, "age").await, CellValue::Int(31));
    assert_eq!(h.cell(2, "age").await, CellValue::Int(40));
    assert_eq!(
        h.audit_kinds(&cr2.id).await.last(),
        Some(&AuditKind::MergeFailed)
    );
}

#[tokio::test]
async fn test_retry_rebases_when_cells_are_untouched() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let crs = &h.workflow.change_requests;

    let cr1 = h
        .submit_edit("carol", &[("1", "age", 31.into())], &["alice"])
        .await;
    let cr2 = h
        .submit_edit("dave", &[("2", "age", 41.into())], &["alice"])
        .await;
    crs.approve(&cr1.id, &user("alice")).await.unwrap();
    crs.approve(&cr2.id, &user("alice")).await.unwrap();

    let outcome = crs.retry_merge(&cr2.id, &user("dave")).await.unwrap();
    assert_eq!(outcome.attempt, 2);
    assert_eq!(outcome.base_version, TableVersion(2));
    assert_eq!(outcome.result_version, Some(TableVersion(3)));

    assert_eq!(h.cell(1, "age").await, CellValue::Int(31));
    assert_eq!(h.cell(2, "age").await, CellValue::Int(41));
    let stored = crs.get(&cr2.id).await.unwrap();
    assert_eq!(stored.status, ChangeRequestStatus::Merged);
    assert_eq!(stored.base_version, TableVersion(2));

    let history = crs.merge_history(&cr2.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(!history[0].is_success());
    assert!(history[1].is_success());
}

#[tokio::test]
async fn test_retry_on_changed_cell_is_a_merge_conflict() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let crs = &h.workflow.change_requests;

    let cr1 = h
        .submit_edit("carol", &[("1", "age", 31.into())], &["alice"])
        .await;
    let cr2 = h
        .submit_edit("dave", &[("1", "age", 99.into())], &["alice"])
        .await;
    crs.approve(&cr1.id, &user("alice")).await.unwrap();
    crs.approve(&cr2.id, &user("alice")).await.unwrap();

    let err = crs.retry_merge(&cr2.id, &user("dave")).await.unwrap_err();
    match &err {
        WorkflowError::MergeConflict { detail, .. } => {
            assert!(detail.contains("1.age is now 31"), "{detail}")
        }
        other => panic!("expected MergeConflict, got {other}"),
    }
    assert!(err.is_retryable());
    assert_eq!(h.cell(1, "age").await, CellValue::Int(31));
    assert_eq!(
        crs.get(&cr2.id).await.unwrap().status,
        ChangeRequestStatus::PendingReview
    );
    assert_eq!(crs.merge_history(&cr2.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_appending_a_taken_key_cannot_rebase() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let crs = &h.workflow.change_requests;

    let cr1 = h
        .submit_append("carol", vec![person(4, "di", 20)], &["alice"])
        .await;
    let cr2 = h
        .submit_append("dave", vec![person(4, "ed", 25)], &["alice"])
        .await;

    let first = crs.approve(&cr1.id, &user("alice")).await.unwrap();
    let outcome = first.merge.unwrap().outcome;
    assert_eq!(outcome.rows_added, 1);
    assert_eq!(outcome.rows_updated, 0);

    crs.approve(&cr2.id, &user("alice")).await.unwrap();
    let err = crs.retry_merge(&cr2.id, &user("dave")).await.unwrap_err();
    assert!(matches!(err, WorkflowError::MergeConflict { .. }), "{err}");
    assert_eq!(h.cell(4, "name").await, CellValue::Text("di".into()));
}

#[tokio::test]
async fn test_rules_tightened_before_merge_fail_the_merge() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let crs = &h.workflow.change_requests;
    let cr = h
        .submit_edit("carol", &[("1", "age", 31.into())], &["alice"])
        .await;

    h.attach_rules(vec![Rule::new(
        "age",
        RuleKind::Min { min: 35.0 },
        Severity::Error,
    )])
    .await;

    let outcome = crs.approve(&cr.id, &user("alice")).await.unwrap();
    let attempt = outcome.merge.unwrap();
    assert_eq!(
        attempt.outcome.conflict.unwrap().kind,
        ConflictKind::ValidationFailed
    );
    let summary = attempt.validation.unwrap();
    assert_eq!(summary.error_count, 1);
    assert_eq!(summary.blocking_rows(), vec!["1".to_string()]);
    assert_eq!(outcome.change_request.status, ChangeRequestStatus::MergeFail);
    assert_eq!(h.tables.calls("stage"), 0);
    assert_eq!(h.cell(1, "age").await, CellValue::Int(30));

    // Retrying without fixing the rules fails validation again.
    let err = crs.retry_merge(&cr.id, &user("carol")).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation { .. }), "{err}");
    assert_eq!(
        crs.get(&cr.id).await.unwrap().status,
        ChangeRequestStatus::MergeFail
    );
}

#[tokio::test]
async fn test_timed_out_merge_is_recoverable() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let crs = &h.workflow.change_requests;
    let cr = h
        .submit_edit("carol", &[("1", "age", 31.into())], &["alice"])
        .await;

    h.tables
        .inject("merge", Fault::Stall(Duration::from_millis(600)), 3);
    let outcome = crs.approve(&cr.id, &user("alice")).await.unwrap();
    let conflict = outcome.merge.unwrap().outcome.conflict.unwrap();
    assert_eq!(conflict.kind, ConflictKind::Timeout);
    assert_eq!(outcome.change_request.status, ChangeRequestStatus::PendingReview);
    assert_eq!(h.tables.calls("merge"), 3);
    assert_eq!(h.version().await, TableVersion(1));

    let retried = crs.retry_merge(&cr.id, &user("alice")).await.unwrap();
    assert_eq!(retried.result_version, Some(TableVersion(2)));
    assert_eq!(h.cell(1, "age").await, CellValue::Int(31));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let cr = h
        .submit_edit("carol", &[("1", "age", 31.into())], &["alice"])
        .await;

    h.tables.inject("merge", Fault::Fail(unavailable()), 2);
    let outcome = h
        .workflow
        .change_requests
        .approve(&cr.id, &user("alice"))
        .await
        .unwrap();
    assert!(outcome.merge.unwrap().outcome.is_success());
    assert_eq!(h.tables.calls("merge"), 3);
    assert_eq!(h.cell(1, "age").await, CellValue::Int(31));
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_merge_until_retried() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let crs = &h.workflow.change_requests;
    let cr = h
        .submit_edit("carol", &[("1", "age", 31.into())], &["alice"])
        .await;

    h.tables.inject("merge", Fault::Fail(unavailable()), 3);
    let outcome = crs.approve(&cr.id, &user("alice")).await.unwrap();
    let conflict = outcome.merge.unwrap().outcome.conflict.unwrap();
    assert_eq!(conflict.kind, ConflictKind::StoreUnavailable);
    assert_eq!(outcome.change_request.status, ChangeRequestStatus::MergeFail);

    // merge_fail does not accept reviews, only an explicit retry.
    assert!(matches!(
        crs.approve(&cr.id, &user("alice")).await,
        Err(WorkflowError::Conflict(_))
    ));

    let retried = crs.retry_merge(&cr.id, &user("carol")).await.unwrap();
    assert!(retried.is_success());
    let kinds = h.audit_kinds(&cr.id).await;
    assert!(kinds.contains(&AuditKind::RetryRequested));
    assert_eq!(kinds.last(), Some(&AuditKind::Merged));
}

#[tokio::test]
async fn test_merge_applied_before_failure_is_recovered() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let cr = h
        .submit_edit("carol", &[("1", "age", 31.into())], &["alice"])
        .await;

    h.tables
        .inject("merge", Fault::ApplyThenFail(unavailable()), 1);
    let outcome = h
        .workflow
        .change_requests
        .approve(&cr.id, &user("alice"))
        .await
        .unwrap();

    let merged = outcome.merge.unwrap().outcome;
    assert!(merged.is_success());
    assert_eq!(merged.result_version, Some(TableVersion(2)));
    assert_eq!(outcome.change_request.status, ChangeRequestStatus::Merged);
    // Applied exactly once.
    assert_eq!(h.version().await, TableVersion(2));
    assert_eq!(h.cell(1, "age").await, CellValue::Int(31));
}

#[tokio::test]
async fn test_text_values_are_aligned_to_column_types() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    let crs = &h.workflow.change_requests;

    let cr = h
        .submit_edit("carol", &[("1", "age", "42".into())], &["alice"])
        .await;
    let outcome = crs.approve(&cr.id, &user("alice")).await.unwrap();
    assert_eq!(outcome.change_request.status, ChangeRequestStatus::Merged);
    assert_eq!(h.cell(1, "age").await, CellValue::Int(42));
    assert_eq!(h.tables.calls("stage"), 2);

    let cr = h
        .submit_edit("carol", &[("2", "age", "forty".into())], &["alice"])
        .await;
    let outcome = crs.approve(&cr.id, &user("alice")).await.unwrap();
    let conflict = outcome.merge.unwrap().outcome.conflict.unwrap();
    assert_eq!(conflict.kind, ConflictKind::SchemaMismatch);
    assert!(conflict.detail.contains("forty"), "{}", conflict.detail);
    assert_eq!(outcome.change_request.status, ChangeRequestStatus::MergeFail);
    assert_eq!(h.cell(2, "age").await, CellValue::Int(40));

    let err = crs.retry_merge(&cr.id, &user("carol")).await.unwrap_err();
    assert!(matches!(err, WorkflowError::SchemaMismatch { .. }), "{err}");
}

#[tokio::test]
async fn test_aligned_values_are_validated_before_merge() {
    let h = TestHarness::new().await;
    h.seed_people().await;
    h.attach_rules(vec![Rule::new(
        "age",
        RuleKind::Range {
            min: 18.0,
            max: 100.0,
        },
        Severity::Error,
    )])
    .await;
    let crs = &h.workflow.change_requests;

    // Text is not numeric until aligned, so only the merge sees the range breach.
    let cr = h
        .submit_edit("carol", &[("1", "age", "5".into())], &["alice"])
        .await;
    let outcome = crs.approve(&cr.id, &user("alice")).await.unwrap();
    let attempt = outcome.merge.unwrap();
    assert_eq!(
        attempt.outcome.conflict.unwrap().kind,
        ConflictKind::ValidationFailed
    );
    assert_eq!(attempt.validation.unwrap().blocking_rows(), vec!["1".to_string()]);
    assert_eq!(outcome.change_request.status, ChangeRequestStatus::MergeFail);
    assert_eq!(h.tables.calls("stage"), 1);
    assert_eq!(h.cell(1, "age").await, CellValue::Int(30));
    assert_eq!(h.version().await, TableVersion(1));

    // In range once aligned: merged as an integer.
    let cr = h
        .submit_edit("carol", &[("2", "age", "45".into())], &["alice"])
        .await;
    let outcome = crs.approve(&cr.id, &user("alice")).await.unwrap();
    assert_eq!(outcome.change_request.status, ChangeRequestStatus::Merged);
    assert_eq!(h.cell(2, "age").await, CellValue::Int(45));
}
