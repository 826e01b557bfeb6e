//! Change request command - Inspect change requests and their merge history
//!
//! Read-only. Reviews and merges go through the workflow service, not the CLI.

use chrono::Utc;
use clap::Subcommand;
use serde::Serialize;
use tessera_db::{ChangeRequestFilter, TesseraDb};
use tessera_protocol::{
    ChangeRequest, ChangeRequestId, ChangeRequestStatus, MergeOutcome, ReviewStatus,
};

use crate::cli::config::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::{
    color_for_status, format_ago, format_time_absolute, print_json, print_table,
    print_table_colored, short_id, truncate,
};
use crate::cli::validate::parse_dataset;

/// Subcommands for change requests
#[derive(Subcommand, Debug, Clone)]
pub enum CrAction {
    /// List change requests, newest first
    List {
        #[arg(long)]
        dataset: Option<String>,
        /// pending, approved, rejected, withdrawn, merge_fail, pending_review, merged
        #[arg(long)]
        status: Option<ChangeRequestStatus>,
        #[arg(long, default_value = "50")]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Show one change request with reviewers and merge attempts
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct ChangeRequestDetail<'a> {
    change_request: &'a ChangeRequest,
    merge_outcomes: &'a [MergeOutcome],
}

/// Execute the cr command
pub async fn run(ctx: &CliContext, action: CrAction) -> anyhow::Result<()> {
    let db = ctx.open_db().await?;

    match action {
        CrAction::List {
            dataset,
            status,
            limit,
            json,
        } => {
            let filter = ChangeRequestFilter {
                dataset_id: dataset.as_deref().map(parse_dataset).transpose()?,
                status,
                limit: Some(limit),
            };
            list_change_requests(&db, filter, json).await
        }
        CrAction::Show { id, json } => show_change_request(&db, &id, json).await,
    }
}

async fn list_change_requests(
    db: &TesseraDb,
    filter: ChangeRequestFilter,
    json: bool,
) -> anyhow::Result<()> {
    let crs = db.list_change_requests(filter).await.map_err(|e| {
        HelpfulError::new(format!("Failed to list change requests: {}", e))
    })?;

    if json {
        return print_json(&crs);
    }

    if crs.is_empty() {
        println!("No change requests found.");
        return Ok(());
    }

    let now = Utc::now();
    let rows = crs
        .iter()
        .map(|cr| {
            vec![
                (short_id(cr.id.as_str()), None),
                (cr.dataset_id.to_string(), None),
                (cr.change_type.to_string(), None),
                (cr.status.to_string(), color_for_status(cr.status)),
                (cr.author_id.to_string(), None),
                (truncate(&cr.title, 40), None),
                (format_ago(cr.updated_at, now), None),
            ]
        })
        .collect();
    print_table_colored(
        &["ID", "DATASET", "TYPE", "STATUS", "AUTHOR", "TITLE", "UPDATED"],
        rows,
    );
    Ok(())
}

async fn show_change_request(db: &TesseraDb, id: &str, json: bool) -> anyhow::Result<()> {
    let cr_id = ChangeRequestId::parse(id).map_err(|e| {
        HelpfulError::new(e.to_string())
            .with_suggestion("TRY: Copy the full id from: tessera cr list --json")
    })?;
    let cr = db
        .get_change_request(&cr_id)
        .await?
        .ok_or_else(|| HelpfulError::not_found("Change request", id))?;
    let outcomes = db.list_merge_outcomes(&cr_id).await?;

    if json {
        return print_json(&ChangeRequestDetail {
            change_request: &cr,
            merge_outcomes: &outcomes,
        });
    }

    println!("{}  {}", cr.id, cr.title);
    println!(
        "  {} {} on {} (project {})",
        cr.author_id, cr.change_type, cr.dataset_id, cr.project_id
    );
    println!(
        "  status {}  base {}  rules v{}{}",
        cr.status,
        cr.base_version,
        cr.rules_version,
        if cr.flagged { "  FLAGGED for revalidation" } else { "" }
    );
    println!("  created {}", format_time_absolute(cr.created_at));
    println!();

    print_table(&["REVIEWER", "DECISION", "AT"], reviewer_rows(&cr));

    if outcomes.is_empty() {
        println!("No merge attempts yet.");
    } else {
        println!();
        print_table(
            &["ATTEMPT", "BASE", "RESULT", "ADDED", "UPDATED", "CELLS", "CONFLICT"],
            outcome_rows(&outcomes),
        );
    }
    Ok(())
}

fn reviewer_rows(cr: &ChangeRequest) -> Vec<Vec<String>> {
    cr.reviewers
        .iter()
        .map(|reviewer| {
            let state = cr.reviewer_states.get(reviewer);
            let decision = match state.map(|s| s.status) {
                Some(ReviewStatus::Approved) => "approved",
                Some(ReviewStatus::Rejected) => "rejected",
                Some(ReviewStatus::Pending) | None => "pending",
            };
            vec![
                reviewer.to_string(),
                decision.to_string(),
                state
                    .and_then(|s| s.decided_at)
                    .map(format_time_absolute)
                    .unwrap_or_default(),
            ]
        })
        .collect()
}

fn outcome_rows(outcomes: &[MergeOutcome]) -> Vec<Vec<String>> {
    outcomes
        .iter()
        .map(|o| {
            vec![
                o.attempt.to_string(),
                o.base_version.to_string(),
                o.result_version
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                o.rows_added.to_string(),
                o.rows_updated.to_string(),
                o.cells_changed.to_string(),
                o.conflict
                    .as_ref()
                    .map(|c| format!("{}: {}", c.kind, c.detail))
                    .unwrap_or_default(),
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tessera_protocol::{
        ChangeType, ConflictKind, DatasetId, MergeConflict, MergeOutcomeId, ProjectId,
        ReviewerState, TableVersion, UserId,
    };

    fn change_request() -> ChangeRequest {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let mut states = BTreeMap::new();
        states.insert(alice.clone(), ReviewerState::decide(ReviewStatus::Approved));
        states.insert(bob.clone(), ReviewerState::pending());
        let now = Utc::now();
        ChangeRequest {
            id: ChangeRequestId::new(),
            project_id: ProjectId::new("census"),
            dataset_id: DatasetId::new("people"),
            author_id: UserId::new("carol"),
            title: "Fix ages".into(),
            change_type: ChangeType::Edit,
            payload: None,
            payload_digest: "digest".into(),
            reviewers: vec![alice, bob],
            reviewer_states: states,
            status: ChangeRequestStatus::Pending,
            base_version: TableVersion(1),
            rules_version: 1,
            flagged: false,
            withdrawn: false,
            merge_disposition: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_reviewer_rows_follow_reviewer_order() {
        let rows = reviewer_rows(&change_request());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "alice");
        assert_eq!(rows[0][1], "approved");
        assert!(!rows[0][2].is_empty());
        assert_eq!(rows[1][1], "pending");
        assert_eq!(rows[1][2], "");
    }

    #[test]
    fn test_outcome_rows_show_conflicts() {
        let cr = change_request();
        let outcome = MergeOutcome {
            id: MergeOutcomeId::new(),
            change_request_id: cr.id.clone(),
            attempt: 1,
            base_version: TableVersion(1),
            result_version: None,
            conflict: Some(MergeConflict {
                kind: ConflictKind::VersionAdvanced,
                detail: "table is at v2".into(),
            }),
            rows_added: 0,
            rows_updated: 0,
            cells_changed: 0,
            actors: vec![UserId::new("alice")],
            recorded_at: Utc::now(),
        };
        let rows = outcome_rows(&[outcome]);
        assert_eq!(rows[0][1], "v1");
        assert_eq!(rows[0][2], "-");
        assert!(rows[0][6].ends_with("table is at v2"), "{}", rows[0][6]);
    }
}
