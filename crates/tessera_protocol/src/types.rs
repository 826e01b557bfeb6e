//! Tabular values, rows, schemas and table versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ParseError;
use crate::ChangeRequestId;

// ============================================================================
// Cell values
// ============================================================================

/// A single cell.
///
/// Serialized untagged so JSON rows read naturally: `{"id": 1, "age": 30}`.
/// Integral JSON numbers deserialize as [`CellValue::Int`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    /// Null or the empty string. This is what the `required` rule rejects.
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Numeric view of the value. Text is never parsed here: numeric rules
    /// only apply to values that are already typed as numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String representation used by `regex` rules and row keys.
    pub fn render(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Bool(v) => v.to_string(),
            CellValue::Int(v) => v.to_string(),
            CellValue::Float(v) => v.to_string(),
            CellValue::Text(v) => v.clone(),
        }
    }

    /// Equality where integers and floats compare numerically.
    pub fn same_value(&self, other: &CellValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CellValue::Null => "null",
            CellValue::Bool(_) => "boolean",
            CellValue::Int(_) => "int64",
            CellValue::Float(_) => "float64",
            CellValue::Text(_) => "string",
        }
    }

    /// Whether the value can be stored in a column of the given type without
    /// conversion. Nulls fit every type; nullability is checked separately.
    pub fn fits(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (CellValue::Null, _)
                | (CellValue::Bool(_), ColumnType::Boolean)
                | (CellValue::Int(_), ColumnType::Int64)
                | (CellValue::Float(_), ColumnType::Float64)
                | (CellValue::Text(_), ColumnType::String)
        )
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "null"),
            other => write!(f, "{}", other.render()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Text(v)
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Bool(v)
    }
}

/// A table row keyed by column name.
pub type Row = BTreeMap<String, CellValue>;

/// Render the identity of a row from its key columns.
///
/// Returns `None` when any key column is missing or blank. Composite keys are
/// joined with `|`.
pub fn row_key(row: &Row, key_columns: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        let value = row.get(column)?;
        if value.is_blank() {
            return None;
        }
        parts.push(value.render());
    }
    Some(parts.join("|"))
}

// ============================================================================
// Schemas
// ============================================================================

/// Column types understood by the table store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Int64,
    Float64,
    String,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::String => "string",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int64 | ColumnType::Float64)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ColumnType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "int64" | "int" | "integer" => Ok(ColumnType::Int64),
            "float64" | "float" | "double" => Ok(ColumnType::Float64),
            "string" | "text" | "utf8" => Ok(ColumnType::String),
            _ => Err(ParseError::new("column type", s)),
        }
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn optional(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

/// Schema of a main table: ordered columns plus the key used to match rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
    pub key_columns: Vec<String>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSpec>, key_columns: Vec<String>) -> Self {
        Self {
            columns,
            key_columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

// ============================================================================
// Versions
// ============================================================================

/// Monotonic version number of a table. Every successful write produces a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableVersion(pub u64);

impl TableVersion {
    pub fn next(self) -> Self {
        TableVersion(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The write that produced a table version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOperation {
    Create,
    Append,
    Merge,
    Restore,
}

impl VersionOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionOperation::Create => "create",
            VersionOperation::Append => "append",
            VersionOperation::Merge => "merge",
            VersionOperation::Restore => "restore",
        }
    }
}

/// History entry for a table version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: TableVersion,
    pub operation: VersionOperation,
    pub created_at: DateTime<Utc>,
    /// Number of rows in the table at this version.
    pub row_count: usize,
    /// Set when the version was produced by merging a change request.
    pub change_request_id: Option<ChangeRequestId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_value_deserializes_untagged() {
        let row: Row = serde_json::from_str(r#"{"id": 1, "score": 2.5, "name": "x", "ok": true, "gone": null}"#).unwrap();
        assert_eq!(row["id"], CellValue::Int(1));
        assert_eq!(row["score"], CellValue::Float(2.5));
        assert_eq!(row["name"], CellValue::Text("x".into()));
        assert_eq!(row["ok"], CellValue::Bool(true));
        assert_eq!(row["gone"], CellValue::Null);
    }

    #[test]
    fn test_blank_and_numeric_views() {
        assert!(CellValue::Null.is_blank());
        assert!(CellValue::Text(String::new()).is_blank());
        assert!(!CellValue::Int(0).is_blank());
        assert_eq!(CellValue::Text("5".into()).as_f64(), None);
        assert!(CellValue::Int(3).same_value(&CellValue::Float(3.0)));
    }

    #[test]
    fn test_row_key_composite_and_missing() {
        let mut row = Row::new();
        row.insert("region".into(), "eu".into());
        row.insert("id".into(), CellValue::Int(7));
        let keys = vec!["region".to_string(), "id".to_string()];
        assert_eq!(row_key(&row, &keys).as_deref(), Some("eu|7"));

        row.insert("id".into(), CellValue::Null);
        assert_eq!(row_key(&row, &keys), None);
    }

    #[test]
    fn test_fits_column_type() {
        assert!(CellValue::Null.fits(ColumnType::Int64));
        assert!(CellValue::Int(1).fits(ColumnType::Int64));
        assert!(!CellValue::Int(1).fits(ColumnType::Float64));
        assert!(!CellValue::Text("1".into()).fits(ColumnType::Int64));
    }
}
