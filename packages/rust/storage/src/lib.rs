//! libSQL storage layer for kbingest.
//!
//! The [`Storage`] struct wraps a libSQL database holding URL lifecycle rows,
//! the tag taxonomy, knowledge entries, original-file records, persisted
//! scraper parameters, and a full-text index over entries.
//!
//! Components built on top of it:
//! - [`UrlRepository`] — URL lifecycle, content hash history, URL↔tag links
//! - [`TagManager`] — hierarchical tags
//! - [`ScraperParamStore`] — TTL-cached scraper overrides
//! - `Storage` itself implements [`KnowledgeStore`] and [`OriginalFileTracker`]
//!
//! [`KnowledgeStore`]: kbingest_shared::KnowledgeStore
//! [`OriginalFileTracker`]: kbingest_shared::OriginalFileTracker

mod knowledge;
mod migrations;
mod param_store;
mod tags;
mod urls;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kbingest_shared::{IngestError, Metadata, Result};
use libsql::{Connection, Database, Transaction, params};

pub use knowledge::EntrySearchHit;
pub use param_store::{ScraperParamStore, ScraperParams};
pub use tags::{MAX_TAG_DEPTH, TagManager};
pub use urls::UrlRepository;

/// Primary storage handle wrapping a libSQL database.
///
/// Cloning is cheap; clones share the same connection. Transactions run on
/// a connection of their own (see [`Storage::begin`]).
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IngestError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;
        configure(&conn).await?;

        let storage = Self {
            db: Arc::new(db),
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(IngestError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        IngestError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(IngestError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a transaction on a dedicated connection, so statements issued
    /// through other clones never join it or roll back with it.
    pub(crate) async fn begin(&self) -> Result<Transaction> {
        self.check_writable()?;
        let conn = self.db.connect().map_err(db_err)?;
        configure(&conn).await?;
        conn.transaction().await.map_err(db_err)
    }

    /// Whether this handle rejects writes.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }
}

/// Per-connection settings. Writers on separate connections wait for each
/// other instead of failing with SQLITE_BUSY.
async fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .await
        .map_err(db_err)?;
    conn.query("PRAGMA busy_timeout = 5000", ())
        .await
        .map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub(crate) fn db_err(e: libsql::Error) -> IngestError {
    IngestError::Storage(e.to_string())
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IngestError::Storage(format!("invalid date '{s}': {e}")))
}

pub(crate) fn parse_metadata(s: &str) -> Result<Metadata> {
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Ok(Metadata::new()),
        Err(e) => Err(IngestError::Storage(format!("invalid metadata json: {e}"))),
    }
}

pub(crate) fn metadata_json(metadata: &Metadata) -> Result<String> {
    serde_json::to_string(metadata)
        .map_err(|e| IngestError::Storage(format!("metadata serialization failed: {e}")))
}

pub(crate) fn col_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

pub(crate) fn col_opt_string(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Storage;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("kbingest_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }
}
