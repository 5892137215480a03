use anyhow::{Context, Result};
use deploy_tracker_core::DeploymentRecord;
use serde::{Deserialize, Serialize};

use crate::{SchemaVersionRecord, SqliteStore};

const RECENT_DEPLOYMENT_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub primary_key: bool,
    pub not_null: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub rows: u64,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
}

/// Point-in-time inspection of a tracker database, used by `deployctl db check`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticReport {
    pub sqlite_version: String,
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub tables: Vec<TableInfo>,
    pub indexes: Vec<IndexInfo>,
    pub schema_history: Vec<SchemaVersionRecord>,
    pub recent_deployments: Vec<DeploymentRecord>,
}

impl SqliteStore {
    /// Run integrity checks and describe every user table, index and applied
    /// schema version.
    ///
    /// # Errors
    /// Returns an error when any pragma or catalog query fails.
    pub fn diagnose(&self) -> Result<DiagnosticReport> {
        let sqlite_version: String = self
            .conn
            .query_row("SELECT sqlite_version()", [], |row| row.get(0))
            .context("failed to read sqlite version")?;

        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        Ok(DiagnosticReport {
            sqlite_version,
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            tables: self.describe_tables()?,
            indexes: self.list_indexes()?,
            schema_history: self.schema_history()?,
            recent_deployments: self.history(RECENT_DEPLOYMENT_LIMIT)?,
        })
    }

    fn describe_tables(&self) -> Result<Vec<TableInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC",
        )?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tables = Vec::new();
        for name in names {
            let name = name?;
            let quoted = quote_identifier(&name);

            let rows: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {quoted}"), [], |row| row.get(0))
                .with_context(|| format!("failed to count rows in {name}"))?;

            let mut info = self.conn.prepare(&format!("PRAGMA table_info({quoted})"))?;
            let columns = info
                .query_map([], |row| {
                    Ok(ColumnInfo {
                        name: row.get(1)?,
                        decl_type: row.get(2)?,
                        not_null: row.get::<_, i64>(3)? != 0,
                        primary_key: row.get::<_, i64>(5)? != 0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("failed to read columns of {name}"))?;

            tables.push(TableInfo { name, rows: u64::try_from(rows).unwrap_or_default(), columns });
        }

        Ok(tables)
    }

    fn list_indexes(&self) -> Result<Vec<IndexInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, tbl_name FROM sqlite_master
             WHERE type = 'index' AND name NOT LIKE 'sqlite_%'
             ORDER BY tbl_name ASC, name ASC",
        )?;
        let indexes = stmt
            .query_map([], |row| Ok(IndexInfo { name: row.get(0)?, table: row.get(1)? }))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list indexes")?;
        Ok(indexes)
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
