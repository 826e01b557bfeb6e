//! Rule sets prepared for evaluation.
//!
//! Compiling checks rule parameters once, when rules are attached to a
//! dataset, so evaluation itself cannot fail.

use regex::Regex;
use thiserror::Error;

use tessera_protocol::{DatasetId, Rule, RuleKind, RuleSet};

/// Errors raised while compiling a rule set.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Invalid regex for column '{column}': {source}")]
    InvalidPattern {
        column: String,
        #[source]
        source: regex::Error,
    },

    #[error("Range for column '{column}' is inverted: min {min} > max {max}")]
    InvertedRange { column: String, min: f64, max: f64 },

    #[error("Bound for column '{column}' is not a finite number")]
    NonFiniteBound { column: String },

    #[error("allowed_values for column '{column}' is empty")]
    EmptyAllowedValues { column: String },

    #[error("Rule has an empty column name")]
    EmptyColumn,
}

/// A rule plus its compiled regex, when it has one.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    pub(crate) pattern: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: Rule) -> Result<Self, RuleError> {
        if rule.column.trim().is_empty() {
            return Err(RuleError::EmptyColumn);
        }

        let column = rule.column.clone();
        let finite = |v: f64| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(RuleError::NonFiniteBound {
                    column: column.clone(),
                })
            }
        };

        let pattern = match &rule.kind {
            RuleKind::Min { min } => {
                finite(*min)?;
                None
            }
            RuleKind::Max { max } => {
                finite(*max)?;
                None
            }
            RuleKind::Range { min, max } => {
                finite(*min)?;
                finite(*max)?;
                if min > max {
                    return Err(RuleError::InvertedRange {
                        column: rule.column.clone(),
                        min: *min,
                        max: *max,
                    });
                }
                None
            }
            RuleKind::AllowedValues { values } => {
                if values.is_empty() {
                    return Err(RuleError::EmptyAllowedValues {
                        column: rule.column.clone(),
                    });
                }
                None
            }
            RuleKind::Regex { pattern } => {
                // Anchored: the whole rendered value must match.
                let anchored = format!("^(?:{})$", pattern);
                let regex = Regex::new(&anchored).map_err(|source| RuleError::InvalidPattern {
                    column: rule.column.clone(),
                    source,
                })?;
                Some(regex)
            }
            RuleKind::Required | RuleKind::Readonly => None,
        };

        Ok(Self { rule, pattern })
    }
}

/// A [`RuleSet`] ready for the engine.
#[derive(Debug, Clone)]
pub struct CompiledRuleSet {
    dataset_id: DatasetId,
    version: u32,
    rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    pub fn compile(set: &RuleSet) -> Result<Self, RuleError> {
        let rules = set
            .rules
            .iter()
            .cloned()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            dataset_id: set.dataset_id.clone(),
            version: set.version,
            rules,
        })
    }

    /// Rule set that accepts everything. Used when a dataset has no rules yet.
    pub fn empty(dataset_id: DatasetId) -> Self {
        Self {
            dataset_id,
            version: 0,
            rules: Vec::new(),
        }
    }

    pub fn dataset_id(&self) -> &DatasetId {
        &self.dataset_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules bound to `column`, in attachment order.
    pub fn for_column<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a CompiledRule> + 'a {
        self.rules.iter().filter(move |r| r.rule.column == column)
    }

    /// Columns that carry at least one rule, deduplicated, in first-seen order.
    pub fn columns(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for rule in &self.rules {
            if !seen.contains(&rule.rule.column.as_str()) {
                seen.push(rule.rule.column.as_str());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::Severity;

    fn set(rules: Vec<Rule>) -> RuleSet {
        let mut set = RuleSet::empty(DatasetId::new("ds"));
        set.version = 1;
        set.rules = rules;
        set
    }

    #[test]
    fn test_rejects_bad_regex() {
        let rules = set(vec![Rule::new(
            "code",
            RuleKind::Regex {
                pattern: "([a-z".into(),
            },
            Severity::Error,
        )]);
        let err = CompiledRuleSet::compile(&rules).unwrap_err();
        assert!(matches!(err, RuleError::InvalidPattern { .. }));
    }

    #[test]
    fn test_rejects_inverted_range_and_empty_set() {
        let inverted = set(vec![Rule::new(
            "age",
            RuleKind::Range { min: 10.0, max: 1.0 },
            Severity::Error,
        )]);
        assert!(matches!(
            CompiledRuleSet::compile(&inverted).unwrap_err(),
            RuleError::InvertedRange { .. }
        ));

        let empty = set(vec![Rule::new(
            "status",
            RuleKind::AllowedValues { values: vec![] },
            Severity::Warning,
        )]);
        assert!(matches!(
            CompiledRuleSet::compile(&empty).unwrap_err(),
            RuleError::EmptyAllowedValues { .. }
        ));
    }

    #[test]
    fn test_columns_are_deduplicated_in_order() {
        let rules = set(vec![
            Rule::new("b", RuleKind::Required, Severity::Error),
            Rule::new("a", RuleKind::Required, Severity::Error),
            Rule::new("b", RuleKind::Min { min: 0.0 }, Severity::Warning),
        ]);
        let compiled = CompiledRuleSet::compile(&rules).unwrap();
        assert_eq!(compiled.columns(), vec!["b", "a"]);
        assert_eq!(compiled.for_column("b").count(), 2);
        assert_eq!(compiled.version(), 1);
    }
}
