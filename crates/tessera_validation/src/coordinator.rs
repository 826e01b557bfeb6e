//! Validation checkpoints and their gates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use tessera_protocol::{
    row_key, CellChange, CellValue, ChangePayload, Finding, Row, Severity,
};

use crate::compiled::CompiledRuleSet;
use crate::engine::RuleEngine;

/// Stored values an edit is compared against, keyed by `(row_key, column)`.
pub type PriorValues = HashMap<(String, String), CellValue>;

/// Where in the workflow validation runs. Same engine, different gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// One changed value while editing. Advisory only.
    Cell,
    /// All staged edits, before a change request may be created.
    Session,
    /// Re-run against the current rules when a reviewer opens a change request.
    ChangeRequest,
    /// Final, authoritative run right before a merge is applied.
    Merge,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::Cell => "cell",
            Checkpoint::Session => "session",
            Checkpoint::ChangeRequest => "change_request",
            Checkpoint::Merge => "merge",
        }
    }

    /// Gate decision for this checkpoint.
    ///
    /// The change-request checkpoint only fails on fatal findings; those flag
    /// the request for revalidation.
    pub fn passes(&self, summary: &ValidationSummary) -> bool {
        match self {
            Checkpoint::Cell => true,
            Checkpoint::Session | Checkpoint::Merge => summary.can_submit,
            Checkpoint::ChangeRequest => summary.fatal_count == 0,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated findings with per-severity counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub info_count: usize,
    pub warning_count: usize,
    pub error_count: usize,
    pub fatal_count: usize,
    /// No error or fatal findings.
    pub can_submit: bool,
    /// At least one warning that reviewers must see.
    pub requires_review: bool,
    pub findings: Vec<Finding>,
}

impl Default for ValidationSummary {
    fn default() -> Self {
        Self {
            info_count: 0,
            warning_count: 0,
            error_count: 0,
            fatal_count: 0,
            can_submit: true,
            requires_review: false,
            findings: Vec::new(),
        }
    }
}

impl ValidationSummary {
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let mut summary = Self::default();
        summary.extend(findings);
        summary
    }

    /// Add findings and recompute the gate flags.
    pub fn extend(&mut self, findings: impl IntoIterator<Item = Finding>) {
        for finding in findings {
            match finding.severity {
                Severity::Info => self.info_count += 1,
                Severity::Warning => self.warning_count += 1,
                Severity::Error => self.error_count += 1,
                Severity::Fatal => self.fatal_count += 1,
            }
            self.findings.push(finding);
        }
        self.can_submit = self.error_count == 0 && self.fatal_count == 0;
        self.requires_review = self.warning_count > 0;
    }

    pub fn count(&self, severity: Severity) -> usize {
        match severity {
            Severity::Info => self.info_count,
            Severity::Warning => self.warning_count,
            Severity::Error => self.error_count,
            Severity::Fatal => self.fatal_count,
        }
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn blocking_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity.is_blocking())
    }

    /// Keys of rows with at least one error or fatal finding, in first-seen order.
    pub fn blocking_rows(&self) -> Vec<String> {
        let mut rows: Vec<String> = Vec::new();
        for finding in self.blocking_findings() {
            if let Some(key) = &finding.row_key {
                if !rows.contains(key) {
                    rows.push(key.clone());
                }
            }
        }
        rows
    }
}

impl fmt::Display for ValidationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fatal, {} error, {} warning, {} info",
            self.fatal_count, self.error_count, self.warning_count, self.info_count
        )?;
        let rows = self.blocking_rows();
        if !rows.is_empty() {
            write!(f, " (rows: {})", rows.join(", "))?;
        }
        Ok(())
    }
}

/// Immediate feedback for one saved cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutcome {
    pub valid: bool,
    /// Highest severity found, if any.
    pub severity: Option<Severity>,
    pub findings: Vec<Finding>,
}

impl CellOutcome {
    pub fn messages(&self) -> Vec<String> {
        self.findings.iter().map(|f| f.message.clone()).collect()
    }
}

/// A checkpoint run and its gate decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointReport {
    pub checkpoint: Checkpoint,
    pub passed: bool,
    pub summary: ValidationSummary,
}

/// Runs the rule engine at each checkpoint and aggregates the results.
#[derive(Debug, Clone, Default)]
pub struct ValidationCoordinator {
    engine: RuleEngine,
}

impl ValidationCoordinator {
    pub fn new() -> Self {
        Self {
            engine: RuleEngine::new(),
        }
    }

    /// Cell checkpoint. Never blocks; the caller records the outcome on the edit.
    pub fn validate_cell(
        &self,
        rules: &CompiledRuleSet,
        row_key: &str,
        column: &str,
        value: &CellValue,
        prior: Option<&CellValue>,
    ) -> CellOutcome {
        let evaluation = self.engine.evaluate_cell(rules, column, value, prior);
        let severity = evaluation.max_severity();
        CellOutcome {
            valid: evaluation.valid,
            severity,
            findings: evaluation
                .findings
                .into_iter()
                .map(|f| f.with_row(row_key))
                .collect(),
        }
    }

    /// Validate whole rows being appended.
    ///
    /// Rows are identified by their key columns; rows without a usable key
    /// fall back to their 1-based position (`#3`).
    pub fn validate_rows(
        &self,
        rules: &CompiledRuleSet,
        rows: &[Row],
        key_columns: &[String],
    ) -> ValidationSummary {
        let mut summary = ValidationSummary::default();
        for (index, row) in rows.iter().enumerate() {
            let key = row_key(row, key_columns).unwrap_or_else(|| format!("#{}", index + 1));
            summary.extend(self.engine.evaluate_row(rules, row, None, &key));
        }
        summary
    }

    /// Validate cell-level changes to existing rows.
    ///
    /// Each change is compared against `priors` when present, otherwise
    /// against the `old_value` captured when the edit was staged.
    pub fn validate_changes(
        &self,
        rules: &CompiledRuleSet,
        changes: &[CellChange],
        priors: &PriorValues,
    ) -> ValidationSummary {
        let mut summary = ValidationSummary::default();
        for change in changes {
            let prior = priors
                .get(&(change.row_key.clone(), change.column.clone()))
                .unwrap_or(&change.old_value);
            let evaluation =
                self.engine
                    .evaluate_cell(rules, &change.column, &change.new_value, Some(prior));
            summary.extend(
                evaluation
                    .findings
                    .into_iter()
                    .map(|f| f.with_row(change.row_key.clone())),
            );
        }
        summary
    }

    /// Run a checkpoint over a full change payload.
    pub fn validate_payload(
        &self,
        checkpoint: Checkpoint,
        rules: &CompiledRuleSet,
        payload: &ChangePayload,
        key_columns: &[String],
        priors: &PriorValues,
    ) -> CheckpointReport {
        let summary = match payload {
            ChangePayload::Append { rows } => self.validate_rows(rules, rows, key_columns),
            ChangePayload::Edit { changes } => self.validate_changes(rules, changes, priors),
        };
        let passed = checkpoint.passes(&summary);
        debug!(
            checkpoint = %checkpoint,
            dataset_id = %rules.dataset_id(),
            rules_version = rules.version(),
            errors = summary.error_count,
            fatal = summary.fatal_count,
            warnings = summary.warning_count,
            passed,
            "Validation checkpoint evaluated"
        );
        CheckpointReport {
            checkpoint,
            passed,
            summary,
        }
    }
}
