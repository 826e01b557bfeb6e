//! Path and configuration resolution
//!
//! Everything lives under `$TESSERA_HOME` (default `~/.tessera`). Command-line
//! flags win over environment variables, which win over defaults.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tessera_db::TesseraDb;
use tessera_protocol::{defaults::DEFAULT_DB_FILE, WorkflowConfig};

use crate::cli::error::HelpfulError;
use crate::cli::output::{print_json, print_table};

/// Paths every command resolves before it runs.
#[derive(Debug, Clone)]
pub struct CliContext {
    pub db_path: PathBuf,
    pub config_path: Option<PathBuf>,
}

impl CliContext {
    pub fn new(db_path: Option<PathBuf>, config_path: Option<PathBuf>) -> Self {
        Self {
            db_path: db_path.unwrap_or_else(default_db_path),
            config_path,
        }
    }

    /// Open (or create) the metadata database.
    pub async fn open_db(&self) -> Result<TesseraDb, HelpfulError> {
        TesseraDb::open(&self.db_path)
            .await
            .map_err(|e| HelpfulError::database_unavailable(&self.db_path, &e.to_string()))
    }

    /// Workflow settings from `--config`, or defaults.
    pub fn workflow_config(&self) -> Result<WorkflowConfig, HelpfulError> {
        match &self.config_path {
            Some(path) => load_workflow_config(path),
            None => Ok(WorkflowConfig::default()),
        }
    }
}

/// Default database: `$TESSERA_HOME/tessera.sqlite3`
pub fn default_db_path() -> PathBuf {
    tessera_logging::tessera_home().join(DEFAULT_DB_FILE)
}

fn load_workflow_config(path: &Path) -> Result<WorkflowConfig, HelpfulError> {
    if !path.exists() {
        return Err(HelpfulError::file_not_found(path));
    }
    WorkflowConfig::from_json_file(path).map_err(|e| {
        HelpfulError::new(format!("Invalid workflow config: {}", e))
            .with_context(format!("Config path: {}", path.display()))
            .with_suggestion("TRY: Show the resolved defaults: tessera config --json")
    })
}

#[derive(Debug, Serialize)]
struct ConfigReport {
    home: PathBuf,
    db_path: PathBuf,
    logs_dir: PathBuf,
    config_path: Option<PathBuf>,
    workflow: WorkflowConfig,
}

/// Show resolved paths and workflow settings.
pub fn run(ctx: &CliContext, json: bool) -> anyhow::Result<()> {
    let report = ConfigReport {
        home: tessera_logging::tessera_home(),
        db_path: ctx.db_path.clone(),
        logs_dir: tessera_logging::logs_dir(),
        config_path: ctx.config_path.clone(),
        workflow: ctx.workflow_config()?,
    };

    if json {
        return print_json(&report);
    }

    let config_source = report
        .config_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".to_string());
    let workflow = &report.workflow;
    print_table(
        &["SETTING", "VALUE"],
        vec![
            vec!["home".into(), report.home.display().to_string()],
            vec!["database".into(), report.db_path.display().to_string()],
            vec!["logs".into(), report.logs_dir.display().to_string()],
            vec!["config".into(), config_source],
            vec!["session_ttl_hours".into(), workflow.session_ttl_hours.to_string()],
            vec!["merge_timeout_ms".into(), workflow.merge_timeout_ms.to_string()],
            vec![
                "retry.max_attempts".into(),
                workflow.retry.max_attempts.to_string(),
            ],
            vec![
                "retry.base_delay_ms".into(),
                workflow.retry.base_delay_ms.to_string(),
            ],
            vec![
                "retry.max_delay_ms".into(),
                workflow.retry.max_delay_ms.to_string(),
            ],
            vec![
                "schema_alignment_attempts".into(),
                workflow.schema_alignment_attempts.to_string(),
            ],
        ],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_db_path_wins() {
        let ctx = CliContext::new(Some(PathBuf::from("/tmp/x.sqlite3")), None);
        assert_eq!(ctx.db_path, PathBuf::from("/tmp/x.sqlite3"));
    }

    #[test]
    fn test_default_db_file_name() {
        assert!(default_db_path().ends_with(DEFAULT_DB_FILE));
    }

    #[test]
    fn test_workflow_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"merge_timeout_ms": 500}}"#).unwrap();

        let ctx = CliContext::new(None, Some(file.path().to_path_buf()));
        let config = ctx.workflow_config().unwrap();
        assert_eq!(config.merge_timeout_ms, 500);
        assert_eq!(
            config.session_ttl_hours,
            WorkflowConfig::default().session_ttl_hours
        );
    }

    #[test]
    fn test_missing_config_file_is_helpful() {
        let ctx = CliContext::new(None, Some(PathBuf::from("/nonexistent/tessera.json")));
        let err = ctx.workflow_config().unwrap_err();
        assert!(err.message.contains("/nonexistent/tessera.json"));
    }
}
