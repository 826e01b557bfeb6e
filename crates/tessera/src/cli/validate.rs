//! Validate command - Dry-run a rule set over a rows file
//!
//! Runs the same session checkpoint a live edit session runs before a change
//! request may be submitted. Nothing is written.

use std::path::PathBuf;

use clap::Args;
use tessera_protocol::{ChangePayload, DatasetId, Row, Rule, RuleSet};
use tessera_validation::{
    Checkpoint, CheckpointReport, CompiledRuleSet, PriorValues, ValidationCoordinator,
};

use crate::cli::config::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::{color_for_severity, print_json, print_table_colored};
use crate::cli::read_json_file;

/// Arguments for the validate command
#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// JSON file holding an array of rows
    #[arg(long)]
    pub rows: PathBuf,

    /// Dataset whose attached rules to apply (unless --rules is given)
    #[arg(long)]
    pub dataset: String,

    /// JSON file holding an array of rules, instead of the stored rule set
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Key column identifying rows (repeat for composite keys)
    #[arg(long = "key-column", default_value = "id")]
    pub key_columns: Vec<String>,

    #[arg(long)]
    pub json: bool,
}

/// Execute the validate command. Returns whether the rows could be submitted.
pub async fn run(ctx: &CliContext, args: ValidateArgs) -> anyhow::Result<bool> {
    let dataset = parse_dataset(&args.dataset)?;
    let rows: Vec<Row> = read_json_file(&args.rows)?;

    let rule_set = match &args.rules {
        Some(path) => {
            let rules: Vec<Rule> = read_json_file(path)?;
            RuleSet {
                rules,
                ..RuleSet::empty(dataset)
            }
        }
        None => {
            let db = ctx.open_db().await?;
            let set = db.current_rules(&dataset).await.map_err(|e| {
                HelpfulError::new(format!("Failed to load rules: {}", e))
                    .with_context(format!("Dataset: {}", dataset))
            })?;
            db.close().await;
            set
        }
    };

    let report = check_rows(&rule_set, rows, &args.key_columns)?;
    tracing::info!(
        dataset_id = %rule_set.dataset_id,
        rules_version = rule_set.version,
        passed = report.passed,
        "Dry-run validation finished"
    );

    if args.json {
        print_json(&report)?;
    } else {
        print_report(&rule_set, &report);
    }
    Ok(report.passed)
}

pub(crate) fn parse_dataset(raw: &str) -> Result<DatasetId, HelpfulError> {
    DatasetId::parse(raw).map_err(|e| HelpfulError::new(e.to_string()))
}

/// Compile `rule_set` and run the session checkpoint over `rows` as an append.
pub fn check_rows(
    rule_set: &RuleSet,
    rows: Vec<Row>,
    key_columns: &[String],
) -> Result<CheckpointReport, HelpfulError> {
    let compiled =
        CompiledRuleSet::compile(rule_set).map_err(|e| HelpfulError::invalid_rule(&e.to_string()))?;
    let payload = ChangePayload::Append { rows };
    Ok(ValidationCoordinator::new().validate_payload(
        Checkpoint::Session,
        &compiled,
        &payload,
        key_columns,
        &PriorValues::new(),
    ))
}

fn print_report(rule_set: &RuleSet, report: &CheckpointReport) {
    let summary = &report.summary;
    println!(
        "Dataset {} (rules v{}): {}",
        rule_set.dataset_id, rule_set.version, summary
    );

    if !summary.findings.is_empty() {
        let rows = summary
            .findings
            .iter()
            .map(|f| {
                vec![
                    (f.row_key.clone().unwrap_or_default(), None),
                    (f.column.clone(), None),
                    (f.severity.to_string(), Some(color_for_severity(f.severity))),
                    (f.rule.clone(), None),
                    (f.message.clone(), None),
                ]
            })
            .collect();
        print_table_colored(&["ROW", "COLUMN", "SEVERITY", "RULE", "MESSAGE"], rows);
    }

    if report.passed {
        if summary.requires_review {
            println!("Submittable; warnings will be shown to reviewers.");
        } else {
            println!("Submittable.");
        }
    } else {
        println!("Blocked: fix the error and fatal findings before submitting.");
    }
}
