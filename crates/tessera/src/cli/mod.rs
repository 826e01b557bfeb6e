//! CLI command implementations
//!
//! Each submodule owns one command family: argument types, a `run` entry
//! point, and its own rendering. Shared helpers live in `output`, `error`
//! and `config`.

pub mod audit;
pub mod config;
pub mod cr;
pub mod error;
pub mod output;
pub mod rules;
pub mod sessions;
pub mod validate;

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;

pub use config::CliContext;
use error::HelpfulError;

/// Read and parse a JSON input file, with file-specific errors.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, HelpfulError> {
    if !path.exists() {
        return Err(HelpfulError::file_not_found(path));
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| HelpfulError::cannot_read_file(path, &e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| HelpfulError::json_parse_error(path, &e.to_string()))
}
