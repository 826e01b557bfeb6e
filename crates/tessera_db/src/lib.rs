//! Metadata store for the Tessera change workflow.
//!
//! Holds everything the workflow must not lose: versioned rule sets, change
//! requests, merge outcomes, the audit trail and live edit session records.
//! Table data itself lives in the table store, never here.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tessera_db::TesseraDb;
//!
//! let db = TesseraDb::open("~/.tessera/tessera.sqlite3").await?;
//! let rules = db.current_rules(&dataset_id).await?;
//! let open = db.list_change_requests(ChangeRequestFilter::default()).await?;
//! ```

mod error;
mod schema;
mod types;

mod audit;
mod change_requests;
mod rules;
mod sessions;

pub use error::{DbError, Result};
pub use types::{AuditFilter, ChangeRequestFilter};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Handle to the metadata database. Cheap to clone.
#[derive(Clone)]
pub struct TesseraDb {
    pool: SqlitePool,
}

impl TesseraDb {
    /// Open or create a database at the given path. Creates tables as needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "Metadata store opened");
        Ok(db)
    }

    /// Open a private in-memory database.
    ///
    /// Pinned to a single connection that never idles out; a second
    /// connection would see an empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Escape hatch for ad-hoc queries. Prefer the typed methods.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl TesseraDb {
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}
