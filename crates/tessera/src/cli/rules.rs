//! Rules command - Attach and inspect versioned rule sets

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Subcommand;
use tessera_db::TesseraDb;
use tessera_protocol::{ProjectId, Rule, RuleKind, RuleSet, UserId};
use tessera_workflow::{AllowAll, MetadataStore, RuleRegistry, WorkflowError};

use crate::cli::config::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_time_absolute, print_json, print_table};
use crate::cli::read_json_file;
use crate::cli::validate::parse_dataset;

/// Subcommands for rule management
#[derive(Subcommand, Debug, Clone)]
pub enum RulesAction {
    /// Attach a rules file as the dataset's next rule-set version
    Attach {
        dataset: String,
        /// JSON file holding an array of rules
        file: PathBuf,
        /// Project the dataset belongs to
        #[arg(long)]
        project: String,
        /// Who is attaching the rules
        #[arg(long = "by", env = "TESSERA_USER")]
        by: String,
    },
    /// Show the current (or a specific) rule-set version
    Show {
        dataset: String,
        #[arg(long)]
        version: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// List every rule-set version of a dataset
    History {
        dataset: String,
        #[arg(long)]
        json: bool,
    },
}

/// Execute the rules command
pub async fn run(ctx: &CliContext, action: RulesAction) -> anyhow::Result<()> {
    let db = Arc::new(ctx.open_db().await?);

    match action {
        RulesAction::Attach {
            dataset,
            file,
            project,
            by,
        } => attach_rules(db, &dataset, &file, &project, &by).await,
        RulesAction::Show {
            dataset,
            version,
            json,
        } => show_rules(&db, &dataset, version, json).await,
        RulesAction::History { dataset, json } => rule_history(&db, &dataset, json).await,
    }
}

async fn attach_rules(
    db: Arc<TesseraDb>,
    dataset: &str,
    file: &Path,
    project: &str,
    by: &str,
) -> anyhow::Result<()> {
    let dataset_id = parse_dataset(dataset)?;
    let project_id = ProjectId::parse(project).map_err(|e| HelpfulError::new(e.to_string()))?;
    let actor = UserId::parse(by).map_err(|e| HelpfulError::new(e.to_string()))?;
    let rules: Vec<Rule> = read_json_file(file)?;

    let store: Arc<dyn MetadataStore> = db;
    let registry = RuleRegistry::new(store, Arc::new(AllowAll));
    let stored = registry
        .attach(&project_id, &dataset_id, rules, &actor)
        .await
        .map_err(|e| match e {
            WorkflowError::Rules(inner) => HelpfulError::invalid_rule(&inner.to_string()),
            other => HelpfulError::new(format!("Failed to attach rules: {}", other))
                .with_context(format!("Dataset: {}", dataset_id)),
        })?;

    println!(
        "Attached {} rule(s) to {} as version {}",
        stored.rules.len(),
        stored.dataset_id,
        stored.version
    );
    Ok(())
}

async fn show_rules(
    db: &TesseraDb,
    dataset: &str,
    version: Option<u32>,
    json: bool,
) -> anyhow::Result<()> {
    let dataset_id = parse_dataset(dataset)?;
    let set = match version {
        Some(v) => db.rules_at(&dataset_id, v).await?.ok_or_else(|| {
            HelpfulError::not_found("Rule set version", &format!("{} v{}", dataset_id, v))
                .with_suggestion(format!("TRY: List versions: tessera rules history {}", dataset_id))
        })?,
        None => db.current_rules(&dataset_id).await?,
    };

    if json {
        return print_json(&set);
    }

    if set.version == 0 {
        println!("No rules attached to {}.", dataset_id);
        println!();
        println!("Attach a rule set with:");
        println!(
            "  tessera rules attach {} rules.json --project PROJECT --by USER",
            dataset_id
        );
        return Ok(());
    }

    print_rule_set(&set);
    Ok(())
}

async fn rule_history(db: &TesseraDb, dataset: &str, json: bool) -> anyhow::Result<()> {
    let dataset_id = parse_dataset(dataset)?;
    let history = db.rule_history(&dataset_id).await?;

    if json {
        return print_json(&history);
    }

    if history.is_empty() {
        println!("No rules attached to {}.", dataset_id);
        return Ok(());
    }

    let rows = history
        .iter()
        .map(|set| {
            vec![
                format!("v{}", set.version),
                set.rules.len().to_string(),
                set.created_by
                    .as_ref()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                format_time_absolute(set.created_at),
            ]
        })
        .collect();
    print_table(&["VERSION", "RULES", "BY", "CREATED"], rows);
    Ok(())
}

fn print_rule_set(set: &RuleSet) {
    println!(
        "{} rules v{} ({} rule(s))",
        set.dataset_id,
        set.version,
        set.rules.len()
    );
    let rows = set
        .rules
        .iter()
        .map(|rule| {
            vec![
                rule.column.clone(),
                rule.kind.name().to_string(),
                describe_kind(&rule.kind),
                rule.effective_severity().to_string(),
                rule.message.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["COLUMN", "RULE", "PARAMETERS", "SEVERITY", "MESSAGE"], rows);
}

/// Human-readable rule parameters.
pub fn describe_kind(kind: &RuleKind) -> String {
    match kind {
        RuleKind::Required | RuleKind::Readonly => String::new(),
        RuleKind::Min { min } => format!(">= {}", min),
        RuleKind::Max { max } => format!("<= {}", max),
        RuleKind::Range { min, max } => format!("{} ..= {}", min, max),
        RuleKind::AllowedValues { values } => values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", "),
        RuleKind::Regex { pattern } => format!("/{}/", pattern),
    }
}
