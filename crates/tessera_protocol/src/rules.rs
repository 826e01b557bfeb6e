//! Validation rules, severities and findings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ParseError;
use crate::types::CellValue;
use crate::{DatasetId, UserId};

/// Ordered classification of a finding: `Info < Warning < Error < Fatal`.
///
/// Only `Error` and `Fatal` block an operation. `Warning` is surfaced to
/// reviewers; `Info` is purely informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }

    pub fn is_blocking(&self) -> bool {
        *self >= Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "fatal" => Ok(Severity::Fatal),
            _ => Err(ParseError::new("severity", s)),
        }
    }
}

/// What a rule checks, with its parameters.
///
/// Flattened into [`Rule`] so a rule reads as
/// `{"column": "age", "kind": "range", "min": 18, "max": 100, "severity": "error"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    Required,
    Min { min: f64 },
    Max { max: f64 },
    Range { min: f64, max: f64 },
    AllowedValues { values: Vec<CellValue> },
    Regex { pattern: String },
    Readonly,
}

impl RuleKind {
    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::Required => "required",
            RuleKind::Min { .. } => "min",
            RuleKind::Max { .. } => "max",
            RuleKind::Range { .. } => "range",
            RuleKind::AllowedValues { .. } => "allowed_values",
            RuleKind::Regex { .. } => "regex",
            RuleKind::Readonly => "readonly",
        }
    }
}

/// A typed validation rule bound to one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub column: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    pub severity: Severity,
    /// Overrides the generated finding message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Rule {
    pub fn new(column: impl Into<String>, kind: RuleKind, severity: Severity) -> Self {
        Self {
            column: column.into(),
            kind,
            severity,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Severity actually reported. `readonly` is always fatal, whatever was configured.
    pub fn effective_severity(&self) -> Severity {
        match self.kind {
            RuleKind::Readonly => Severity::Fatal,
            _ => self.severity,
        }
    }
}

/// An immutable, numbered set of rules attached to a dataset.
///
/// Rule order is evaluation order. Blocking is decided by severity alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub dataset_id: DatasetId,
    /// 0 means "no rules attached yet".
    pub version: u32,
    pub rules: Vec<Rule>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<UserId>,
}

impl RuleSet {
    pub fn empty(dataset_id: DatasetId) -> Self {
        Self {
            dataset_id,
            version: 0,
            rules: Vec::new(),
            created_at: Utc::now(),
            created_by: None,
        }
    }

    pub fn rules_for<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules.iter().filter(move |r| r.column == column)
    }
}

/// One rule violation (or note) produced by the rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    pub column: String,
    /// Identity of the offending row, when the finding came from a row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_key: Option<String>,
    /// Name of the rule kind that produced the finding.
    pub rule: String,
}

impl Finding {
    pub fn with_row(mut self, row_key: impl Into<String>) -> Self {
        self.row_key = Some(row_key.into());
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.row_key {
            Some(row) => write!(f, "[{}] row {} {}: {}", self.severity, row, self.column, self.message),
            None => write!(f, "[{}] {}: {}", self.severity, self.column, self.message),
        }
    }
}
