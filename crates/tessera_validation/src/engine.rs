//! Rule evaluation against single values and whole rows.

use tessera_protocol::{CellValue, Finding, Row, RuleKind, Severity};

use crate::compiled::{CompiledRule, CompiledRuleSet};

/// Result of evaluating rules against one value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// No error or fatal finding was produced.
    pub valid: bool,
    pub findings: Vec<Finding>,
}

impl Evaluation {
    fn from_findings(findings: Vec<Finding>) -> Self {
        let valid = !findings.iter().any(|f| f.severity.is_blocking());
        Self { valid, findings }
    }

    /// Highest severity among the findings.
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Stateless evaluator for compiled rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `value` against every rule in `rules`.
    ///
    /// `prior` is the value currently stored for this cell; `readonly` rules
    /// only fire when a prior value exists and differs from `value`.
    pub fn evaluate<'a>(
        &self,
        value: &CellValue,
        prior: Option<&CellValue>,
        rules: impl IntoIterator<Item = &'a CompiledRule>,
    ) -> Evaluation {
        let findings = rules
            .into_iter()
            .filter_map(|rule| check(rule, value, prior))
            .collect();
        Evaluation::from_findings(findings)
    }

    /// Evaluate the rules for one column.
    pub fn evaluate_cell(
        &self,
        rules: &CompiledRuleSet,
        column: &str,
        value: &CellValue,
        prior: Option<&CellValue>,
    ) -> Evaluation {
        self.evaluate(value, prior, rules.for_column(column))
    }

    /// Evaluate every rule against a full row. Columns absent from the row are
    /// treated as null, so `required` catches them. Findings are tagged with
    /// `row_key`.
    pub fn evaluate_row(
        &self,
        rules: &CompiledRuleSet,
        row: &Row,
        prior: Option<&Row>,
        row_key: &str,
    ) -> Vec<Finding> {
        let null = CellValue::Null;
        rules
            .rules()
            .iter()
            .filter_map(|rule| {
                let column = rule.rule.column.as_str();
                let value = row.get(column).unwrap_or(&null);
                let prior_value = prior.and_then(|p| p.get(column));
                check(rule, value, prior_value)
            })
            .map(|finding| finding.with_row(row_key))
            .collect()
    }
}

fn check(compiled: &CompiledRule, value: &CellValue, prior: Option<&CellValue>) -> Option<Finding> {
    let rule = &compiled.rule;
    let violation = match &rule.kind {
        RuleKind::Required => value.is_blank().then(|| "value is required".to_string()),
        RuleKind::Min { min } => value
            .as_f64()
            .filter(|v| v < min)
            .map(|v| format!("value {} is below minimum {}", v, min)),
        RuleKind::Max { max } => value
            .as_f64()
            .filter(|v| v > max)
            .map(|v| format!("value {} is above maximum {}", v, max)),
        RuleKind::Range { min, max } => value
            .as_f64()
            .filter(|v| v < min || v > max)
            .map(|v| format!("value {} is outside range [{}, {}]", v, min, max)),
        RuleKind::AllowedValues { values } => {
            if value.is_null() || values.iter().any(|allowed| allowed == value) {
                None
            } else {
                let allowed: Vec<String> = values.iter().map(|v| v.render()).collect();
                Some(format!(
                    "value '{}' is not one of [{}]",
                    value.render(),
                    allowed.join(", ")
                ))
            }
        }
        RuleKind::Regex { pattern } => {
            let rendered = value.render();
            match &compiled.pattern {
                Some(regex) if !value.is_null() && !regex.is_match(&rendered) => Some(format!(
                    "value '{}' does not match pattern '{}'",
                    rendered, pattern
                )),
                _ => None,
            }
        }
        RuleKind::Readonly => prior
            .filter(|p| !p.same_value(value))
            .map(|p| format!("column is read-only (stored {}, got {})", p, value)),
    }?;

    Some(Finding {
        severity: rule.effective_severity(),
        message: rule.message.clone().unwrap_or(violation),
        column: rule.column.clone(),
        row_key: None,
        rule: rule.kind.name().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::{DatasetId, Rule, RuleSet};

    fn compile(rules: Vec<Rule>) -> CompiledRuleSet {
        let mut set = RuleSet::empty(DatasetId::new("ds"));
        set.version = 1;
        set.rules = rules;
        CompiledRuleSet::compile(&set).unwrap()
    }

    #[test]
    fn test_required_rejects_null_and_empty() {
        let rules = compile(vec![Rule::new("name", RuleKind::Required, Severity::Error)]);
        let engine = RuleEngine::new();
        assert!(!engine.evaluate_cell(&rules, "name", &CellValue::Null, None).valid);
        assert!(!engine.evaluate_cell(&rules, "name", &"".into(), None).valid);
        assert!(engine.evaluate_cell(&rules, "name", &"x".into(), None).valid);
    }

    #[test]
    fn test_numeric_rules_skip_non_numeric() {
        let rules = compile(vec![
            Rule::new("age", RuleKind::Min { min: 18.0 }, Severity::Error),
            Rule::new("age", RuleKind::Max { max: 100.0 }, Severity::Error),
        ]);
        let engine = RuleEngine::new();
        let eval = engine.evaluate_cell(&rules, "age", &"five".into(), None);
        assert!(eval.valid);
        assert!(eval.findings.is_empty());

        let eval = engine.evaluate_cell(&rules, "age", &CellValue::Int(5), None);
        assert!(!eval.valid);
        assert_eq!(eval.findings.len(), 1);
        assert_eq!(eval.findings[0].rule, "min");

        let eval = engine.evaluate_cell(&rules, "age", &CellValue::Float(100.5), None);
        assert_eq!(eval.findings[0].rule, "max");
    }

    #[test]
    fn test_range_produces_single_finding() {
        let rules = compile(vec![Rule::new(
            "age",
            RuleKind::Range { min: 18.0, max: 100.0 },
            Severity::Error,
        )]);
        let eval = RuleEngine::new().evaluate_cell(&rules, "age", &CellValue::Int(5), None);
        assert_eq!(eval.findings.len(), 1);
        assert!(eval.findings[0].message.contains("outside range"));
    }

    #[test]
    fn test_allowed_values_exact_membership() {
        let rules = compile(vec![Rule::new(
            "status",
            RuleKind::AllowedValues {
                values: vec!["open".into(), "closed".into()],
            },
            Severity::Warning,
        )]);
        let engine = RuleEngine::new();
        assert!(engine
            .evaluate_cell(&rules, "status", &"open".into(), None)
            .findings
            .is_empty());
        let eval = engine.evaluate_cell(&rules, "status", &"Open".into(), None);
        assert_eq!(eval.findings.len(), 1);
        // Warnings never invalidate.
        assert!(eval.valid);
    }

    #[test]
    fn test_allowed_values_do_not_mix_numeric_types() {
        let rules = compile(vec![Rule::new(
            "tier",
            RuleKind::AllowedValues {
                values: vec![CellValue::Float(1.0), CellValue::Int(2)],
            },
            Severity::Error,
        )]);
        let engine = RuleEngine::new();
        assert!(engine.evaluate_cell(&rules, "tier", &CellValue::Float(1.0), None).valid);
        assert!(engine.evaluate_cell(&rules, "tier", &CellValue::Int(2), None).valid);
        assert!(!engine.evaluate_cell(&rules, "tier", &CellValue::Int(1), None).valid);
        assert!(!engine.evaluate_cell(&rules, "tier", &CellValue::Float(2.0), None).valid);
    }

    #[test]
    fn test_regex_is_anchored() {
        let rules = compile(vec![Rule::new(
            "code",
            RuleKind::Regex {
                pattern: "[A-Z]{3}".into(),
            },
            Severity::Error,
        )]);
        let engine = RuleEngine::new();
        assert!(engine.evaluate_cell(&rules, "code", &"ABC".into(), None).valid);
        assert!(!engine.evaluate_cell(&rules, "code", &"xABCx".into(), None).valid);
        assert!(!engine.evaluate_cell(&rules, "code", &CellValue::Int(123), None).valid);
    }

    #[test]
    fn test_readonly_is_always_fatal() {
        let rules = compile(vec![Rule::new("id", RuleKind::Readonly, Severity::Info)]);
        let engine = RuleEngine::new();

        let eval = engine.evaluate_cell(&rules, "id", &CellValue::Int(2), Some(&CellValue::Int(1)));
        assert_eq!(eval.max_severity(), Some(Severity::Fatal));
        assert!(!eval.valid);

        // Unchanged value, or no stored value at all, is fine.
        assert!(engine
            .evaluate_cell(&rules, "id", &CellValue::Int(1), Some(&CellValue::Int(1)))
            .findings
            .is_empty());
        assert!(engine
            .evaluate_cell(&rules, "id", &CellValue::Int(1), None)
            .findings
            .is_empty());
    }

    #[test]
    fn test_evaluate_row_treats_missing_as_null() {
        let rules = compile(vec![Rule::new("email", RuleKind::Required, Severity::Error)]);
        let mut row = Row::new();
        row.insert("id".into(), CellValue::Int(9));
        let findings = RuleEngine::new().evaluate_row(&rules, &row, None, "9");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].row_key.as_deref(), Some("9"));
    }

    #[test]
    fn test_custom_message_overrides_default() {
        let rules = compile(vec![Rule::new("age", RuleKind::Min { min: 0.0 }, Severity::Error)
            .with_message("age must be positive")]);
        let eval = RuleEngine::new().evaluate_cell(&rules, "age", &CellValue::Int(-1), None);
        assert_eq!(eval.findings[0].message, "age must be positive");
    }
}
