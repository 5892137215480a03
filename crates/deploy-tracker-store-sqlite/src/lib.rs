use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

mod diagnostics;
mod location;
mod migrations;
mod tracker;

pub use diagnostics::{ColumnInfo, DiagnosticReport, ForeignKeyViolation, IndexInfo, TableInfo};
pub use location::{
    resolve_database_path, DATABASE_PATH_ENV, DEFAULT_DATABASE_FILE, DEFAULT_DATA_DIR,
};
pub use migrations::{
    Migration, MigrationError, MigrationRegistry, MigrationReport, SchemaStatus,
    SchemaVersionRecord,
};

/// One open connection to the tracker database.
///
/// Callers are expected to open a store per operation and drop it when the
/// operation is done; nothing here caches rows between calls.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a SQLite-backed tracker store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Run several reads against one snapshot of the database.
    ///
    /// Writers on other connections may commit meanwhile; `read` does not see
    /// their changes.
    ///
    /// # Errors
    /// Returns an error from `read`, or when the read transaction cannot be
    /// started or closed.
    pub fn read_snapshot<T>(&self, read: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction().context("failed to start read transaction")?;
        let value = read(self)?;
        tx.commit().context("failed to close read transaction")?;
        Ok(value)
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table_name],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

/// Fixed-width UTC text so that lexical order in SQL matches chronological order.
fn format_timestamp(value: OffsetDateTime) -> Result<String, time::error::Format> {
    value.to_offset(UtcOffset::UTC).format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
    ))
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    if let Ok(value) = PrimitiveDateTime::parse(
        raw,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"),
    ) {
        return Ok(value.assume_utc());
    }

    // Rows written through a column's CURRENT_TIMESTAMP default.
    PrimitiveDateTime::parse(
        raw,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .with_context(|| format!("invalid stored timestamp: {raw}"))
}
