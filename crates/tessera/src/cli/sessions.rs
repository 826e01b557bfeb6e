//! Sessions command - Reclaim expired live edit sessions

use chrono::Utc;
use clap::Subcommand;
use serde::Serialize;
use tessera_protocol::SessionId;

use crate::cli::config::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::print_json;

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsAction {
    /// Delete sessions whose expiry has passed, with their staged edits
    Reclaim {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct ReclaimReport {
    reclaimed: Vec<SessionId>,
}

/// Execute the sessions command
pub async fn run(ctx: &CliContext, action: SessionsAction) -> anyhow::Result<()> {
    match action {
        SessionsAction::Reclaim { json } => {
            let db = ctx.open_db().await?;
            let reclaimed = db
                .delete_expired_sessions(Utc::now().timestamp_millis())
                .await
                .map_err(|e| HelpfulError::new(format!("Failed to reclaim sessions: {}", e)))?;
            tracing::info!(count = reclaimed.len(), "Reclaimed expired sessions");

            if json {
                return print_json(&ReclaimReport { reclaimed });
            }
            match reclaimed.len() {
                0 => println!("No expired sessions."),
                n => println!("Reclaimed {} expired session(s).", n),
            }
            Ok(())
        }
    }
}
