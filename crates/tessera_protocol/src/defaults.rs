//! Canonical default values shared across the workflow crates.

/// Live edit sessions expire this many hours after they start.
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// Upper bound for a single table-store call made by the merge executor.
pub const DEFAULT_MERGE_TIMEOUT_MS: u64 = 30_000;

/// Attempts made for transient table-store failures before giving up.
pub const DEFAULT_TRANSIENT_RETRY_ATTEMPTS: u32 = 3;

/// First backoff delay between transient retries; doubles per attempt.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

/// Ceiling for the exponential backoff delay.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;

/// Schema alignment (type coercion) passes attempted after a schema mismatch.
pub const DEFAULT_SCHEMA_ALIGNMENT_ATTEMPTS: u32 = 1;

/// Column used to identify rows when a table declares no key columns.
pub const DEFAULT_KEY_COLUMN: &str = "id";

/// Metadata store location used by the CLI when nothing else is configured.
pub const DEFAULT_DB_FILE: &str = "tessera.sqlite3";
