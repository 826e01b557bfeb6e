//! Validation for staged dataset changes.
//!
//! # Philosophy: severity decides, order does not
//!
//! Rules are evaluated in the order they were attached, but whether a finding
//! blocks anything depends only on its [`Severity`]:
//!
//! - `info`: recorded, never blocks
//! - `warning`: recorded and surfaced to reviewers (`requires_review`)
//! - `error` / `fatal`: block submission and merge
//!
//! The same engine runs at four checkpoints (see [`Checkpoint`]); each one
//! applies its own gate to the resulting [`ValidationSummary`].
//!
//! # Modules
//!
//! - [`compiled`]: rule sets with regexes compiled and parameters checked
//! - [`engine`]: per-value and per-row rule evaluation
//! - [`coordinator`]: checkpoints, summaries and gate decisions

pub mod compiled;
pub mod coordinator;
pub mod engine;

pub use compiled::{CompiledRule, CompiledRuleSet, RuleError};
pub use coordinator::{
    CellOutcome, Checkpoint, CheckpointReport, PriorValues, ValidationCoordinator,
    ValidationSummary,
};
pub use engine::{Evaluation, RuleEngine};

pub use tessera_protocol::{Finding, Rule, RuleKind, RuleSet, Severity};
