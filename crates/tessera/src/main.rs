//! Tessera operator CLI
//!
//! Inspects and maintains the metadata store behind the change workflow:
//! - **validate**: dry-run rules over a rows file
//! - **rules**: attach and inspect versioned rule sets
//! - **cr**: list and show change requests with their merge attempts
//! - **audit**: browse the audit trail
//! - **sessions**: reclaim expired edit sessions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

use cli::audit::AuditAction;
use cli::cr::CrAction;
use cli::error::HelpfulError;
use cli::rules::RulesAction;
use cli::sessions::SessionsAction;
use cli::validate::ValidateArgs;
use cli::CliContext;

/// Exit code when validation finds blocking rows.
const EXIT_VALIDATION_BLOCKED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "tessera", about = "Validation, approval and merge pipeline for tabular datasets")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Metadata database path
    #[arg(long, global = true, env = "TESSERA_DB")]
    db: Option<PathBuf>,

    /// Workflow config file (JSON)
    #[arg(long, global = true, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check rows against rules without writing anything
    Validate(ValidateArgs),

    /// Manage rule sets
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Inspect change requests
    Cr {
        #[command(subcommand)]
        action: CrAction,
    },

    /// Browse the audit trail
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Maintain live edit sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Show resolved paths and workflow settings
    Config {
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn wants_json(&self) -> bool {
        match self {
            Commands::Validate(args) => args.json,
            Commands::Audit { action } => match action {
                AuditAction::List(args) => args.json,
            },
            Commands::Config { json } => *json,
            Commands::Rules { action } => match action {
                RulesAction::Attach { .. } => false,
                RulesAction::Show { json, .. } | RulesAction::History { json, .. } => *json,
            },
            Commands::Cr { action } => match action {
                CrAction::List { json, .. } | CrAction::Show { json, .. } => *json,
            },
            Commands::Sessions { action } => match action {
                SessionsAction::Reclaim { json } => *json,
            },
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.command.wants_json();

    if let Err(e) = tessera_logging::init_logging(tessera_logging::LogConfig {
        app_name: "tessera",
        verbose: cli.verbose,
        quiet: json,
    }) {
        eprintln!("WARNING: logging disabled: {:#}", e);
    }

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            if json {
                print_json_error(&e);
            } else {
                eprint!("{}", render_error(&e));
            }
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run_command(cli))
}

async fn run_command(cli: Cli) -> Result<ExitCode> {
    let ctx = CliContext::new(cli.db, cli.config);
    tracing::debug!(db = %ctx.db_path.display(), "Resolved metadata database");

    match cli.command {
        Commands::Validate(args) => {
            if cli::validate::run(&ctx, args).await? {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_VALIDATION_BLOCKED))
            }
        }
        Commands::Rules { action } => cli::rules::run(&ctx, action).await.map(|_| ExitCode::SUCCESS),
        Commands::Cr { action } => cli::cr::run(&ctx, action).await.map(|_| ExitCode::SUCCESS),
        Commands::Audit { action } => cli::audit::run(&ctx, action).await.map(|_| ExitCode::SUCCESS),
        Commands::Sessions { action } => {
            cli::sessions::run(&ctx, action).await.map(|_| ExitCode::SUCCESS)
        }
        Commands::Config { json } => cli::config::run(&ctx, json).map(|_| ExitCode::SUCCESS),
    }
}

/// Helpful errors print as-is; anything else gets its cause chain.
fn render_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<HelpfulError>() {
        Some(helpful) => helpful.to_string(),
        None => format!("ERROR: {:#}\n", err),
    }
}

fn print_json_error(err: &anyhow::Error) {
    let body = match err.downcast_ref::<HelpfulError>() {
        Some(helpful) => serde_json::json!({ "error": helpful }),
        None => serde_json::json!({ "error": { "message": format!("{:#}", err) } }),
    };
    println!("{}", body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_json_flag_detection() {
        let cli = Cli::parse_from(["tessera", "cr", "list", "--json"]);
        assert!(cli.command.wants_json());
        let cli = Cli::parse_from(["tessera", "audit", "list", "--kind", "change_request.merged"]);
        assert!(!cli.command.wants_json());
    }

    #[test]
    fn test_render_error_keeps_suggestions() {
        let err: anyhow::Error = HelpfulError::new("boom").with_suggestion("TRY: again").into();
        let text = render_error(&err);
        assert!(text.starts_with("ERROR: boom"));
        assert!(text.contains("TRY: again"));

        let plain = anyhow::anyhow!("inner").context("outer");
        assert_eq!(render_error(&plain), "ERROR: outer: inner\n");
    }
}
