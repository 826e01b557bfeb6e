//! Bounded type coercion of payload rows against a table schema.
//!
//! Used once by the merge executor after the table store reports a schema
//! mismatch. Only lossless conversions are applied; anything else is
//! reported and the merge fails.

use tessera_protocol::{CellValue, ColumnType, Row, TableSchema};

/// Coerce a single value to `target`. `None` when no lossless conversion exists.
pub fn coerce(value: &CellValue, target: ColumnType) -> Option<CellValue> {
    if value.fits(target) {
        return Some(value.clone());
    }
    match (value, target) {
        (CellValue::Int(v), ColumnType::Float64) => Some(CellValue::Float(*v as f64)),
        (CellValue::Float(v), ColumnType::Int64) => {
            let truncated = v.trunc();
            if truncated == *v && truncated.abs() < i64::MAX as f64 {
                Some(CellValue::Int(truncated as i64))
            } else {
                None
            }
        }
        (CellValue::Text(s), ColumnType::Int64) => s.trim().parse::<i64>().ok().map(CellValue::Int),
        (CellValue::Text(s), ColumnType::Float64) => {
            s.trim().parse::<f64>().ok().map(CellValue::Float)
        }
        (CellValue::Text(s), ColumnType::Boolean) => match s.trim().to_lowercase().as_str() {
            "true" => Some(CellValue::Bool(true)),
            "false" => Some(CellValue::Bool(false)),
            _ => None,
        },
        (CellValue::Int(_) | CellValue::Float(_) | CellValue::Bool(_), ColumnType::String) => {
            Some(CellValue::Text(value.render()))
        }
        _ => None,
    }
}

/// Align every row to the schema's column types.
///
/// Fails on the first column that is missing from the table or holds a
/// value with no lossless conversion.
pub fn align_rows(rows: &[Row], schema: &TableSchema) -> Result<Vec<Row>, String> {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|(column, value)| {
                    let spec = schema
                        .column(column)
                        .ok_or_else(|| format!("column '{}' does not exist in the table", column))?;
                    let aligned = coerce(value, spec.column_type).ok_or_else(|| {
                        format!(
                            "column '{}': cannot convert {} '{}' to {}",
                            column,
                            value.type_name(),
                            value,
                            spec.column_type
                        )
                    })?;
                    Ok((column.clone(), aligned))
                })
                .collect::<Result<Row, String>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::ColumnSpec;

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSpec::required("id", ColumnType::Int64),
                ColumnSpec::optional("score", ColumnType::Float64),
                ColumnSpec::optional("active", ColumnType::Boolean),
                ColumnSpec::optional("label", ColumnType::String),
            ],
            vec!["id".into()],
        )
    }

    #[test]
    fn test_widening_and_text_parsing() {
        let mut row = Row::new();
        row.insert("id".into(), CellValue::Text("7".into()));
        row.insert("score".into(), CellValue::Int(3));
        row.insert("active".into(), CellValue::Text("TRUE".into()));
        row.insert("label".into(), CellValue::Int(42));

        let aligned = align_rows(&[row], &schema()).unwrap();
        assert_eq!(aligned[0]["id"], CellValue::Int(7));
        assert_eq!(aligned[0]["score"], CellValue::Float(3.0));
        assert_eq!(aligned[0]["active"], CellValue::Bool(true));
        assert_eq!(aligned[0]["label"], CellValue::Text("42".into()));
    }

    #[test]
    fn test_lossy_float_to_int_is_refused() {
        assert_eq!(coerce(&CellValue::Float(2.0), ColumnType::Int64), Some(CellValue::Int(2)));
        assert_eq!(coerce(&CellValue::Float(2.5), ColumnType::Int64), None);
    }

    #[test]
    fn test_unknown_column_and_bad_text_fail() {
        let mut row = Row::new();
        row.insert("email".into(), CellValue::Text("a@b".into()));
        let err = align_rows(&[row], &schema()).unwrap_err();
        assert!(err.contains("email"));

        let mut row = Row::new();
        row.insert("id".into(), CellValue::Text("seven".into()));
        let err = align_rows(&[row], &schema()).unwrap_err();
        assert!(err.contains("cannot convert"));
    }
}
