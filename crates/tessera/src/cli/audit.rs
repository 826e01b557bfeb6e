//! Audit command - Browse the durable audit trail

use clap::{Args, Subcommand};
use tessera_db::AuditFilter;
use tessera_protocol::{AuditEvent, AuditKind, ChangeRequestId};

use crate::cli::config::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_time_absolute, print_json, print_table, short_id, truncate};
use crate::cli::validate::parse_dataset;

/// Subcommands for the audit trail
#[derive(Subcommand, Debug, Clone)]
pub enum AuditAction {
    /// List events, oldest first
    List(AuditListArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AuditListArgs {
    #[arg(long)]
    pub dataset: Option<String>,
    /// Only events of one change request
    #[arg(long = "cr")]
    pub change_request: Option<String>,
    /// Event kind, e.g. change_request.approved
    #[arg(long)]
    pub kind: Option<AuditKind>,
    #[arg(long, default_value = "100")]
    pub limit: u32,
    #[arg(long)]
    pub json: bool,
}

/// Execute the audit command
pub async fn run(ctx: &CliContext, action: AuditAction) -> anyhow::Result<()> {
    match action {
        AuditAction::List(args) => list_events(ctx, args).await,
    }
}

async fn list_events(ctx: &CliContext, args: AuditListArgs) -> anyhow::Result<()> {
    let filter = AuditFilter {
        dataset_id: args.dataset.as_deref().map(parse_dataset).transpose()?,
        change_request_id: args
            .change_request
            .as_deref()
            .map(ChangeRequestId::parse)
            .transpose()
            .map_err(|e| HelpfulError::new(e.to_string()))?,
        kind: args.kind,
        limit: Some(args.limit),
    };

    let db = ctx.open_db().await?;
    let events = db
        .list_audit_events(filter)
        .await
        .map_err(|e| HelpfulError::new(format!("Failed to read audit trail: {}", e)))?;

    if args.json {
        return print_json(&events);
    }

    if events.is_empty() {
        println!("No audit events found.");
        return Ok(());
    }
    print_table(&["AT", "EVENT", "DATASET", "CR", "ACTOR", "DETAIL"], event_rows(&events));
    Ok(())
}

fn event_rows(events: &[AuditEvent]) -> Vec<Vec<String>> {
    events
        .iter()
        .map(|e| {
            vec![
                format_time_absolute(e.recorded_at),
                e.kind.to_string(),
                e.dataset_id.to_string(),
                e.change_request_id
                    .as_ref()
                    .map(|id| short_id(id.as_str()))
                    .unwrap_or_default(),
                e.actor.to_string(),
                if e.detail.is_null() {
                    String::new()
                } else {
                    truncate(&e.detail.to_string(), 60)
                },
            ]
        })
        .collect()
}
