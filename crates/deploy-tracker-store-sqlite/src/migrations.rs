use std::fmt::{Debug, Formatter};

use anyhow::Context;
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{format_timestamp, parse_timestamp, table_exists, SqliteStore};

const CREATE_SCHEMA_VERSION_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
  version INTEGER PRIMARY KEY,
  description TEXT NOT NULL,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS dicom_studies (
  study_instance_uid TEXT PRIMARY KEY,
  patient_id TEXT,
  patient_name TEXT,
  study_date TEXT,
  study_description TEXT,
  received_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS gateway_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
  level TEXT NOT NULL,
  message TEXT NOT NULL,
  study_instance_uid TEXT,
  FOREIGN KEY (study_instance_uid) REFERENCES dicom_studies(study_instance_uid)
);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS performance_metrics (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
  metric_name TEXT NOT NULL,
  metric_value REAL NOT NULL,
  study_instance_uid TEXT,
  FOREIGN KEY (study_instance_uid) REFERENCES dicom_studies(study_instance_uid)
);

CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON performance_metrics(timestamp);
";

const MIGRATION_003_SQL: &str = r"
CREATE TABLE IF NOT EXISTS deployment_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  version TEXT NOT NULL,
  deployed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
  deployment_method TEXT DEFAULT 'manual',
  notes TEXT
);

CREATE INDEX IF NOT EXISTS idx_deployment_version ON deployment_history(version);
CREATE INDEX IF NOT EXISTS idx_deployment_date ON deployment_history(deployed_at);
";

const MIGRATION_004_SQL: &str = r"
CREATE TABLE IF NOT EXISTS deployment_tracking (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  version TEXT NOT NULL,
  previous_version TEXT,
  hostname TEXT,
  os_version TEXT,
  runtime_version TEXT,
  started_at TEXT NOT NULL,
  completed_at TEXT,
  extract_duration REAL CHECK (extract_duration IS NULL OR extract_duration >= 0),
  rebuild_duration REAL CHECK (rebuild_duration IS NULL OR rebuild_duration >= 0),
  migration_duration REAL CHECK (migration_duration IS NULL OR migration_duration >= 0),
  cutover_duration REAL CHECK (cutover_duration IS NULL OR cutover_duration >= 0),
  total_duration REAL CHECK (total_duration IS NULL OR total_duration >= 0),
  downtime_duration REAL CHECK (downtime_duration IS NULL OR downtime_duration >= 0),
  health_check_success INTEGER NOT NULL DEFAULT 0 CHECK (health_check_success IN (0, 1)),
  health_check_duration REAL CHECK (health_check_duration IS NULL OR health_check_duration >= 0),
  time_to_healthy REAL CHECK (time_to_healthy IS NULL OR time_to_healthy >= 0),
  deployment_method TEXT NOT NULL DEFAULT 'manual',
  deployment_status TEXT NOT NULL DEFAULT 'in-progress'
    CHECK (deployment_status IN ('in-progress','success','failed')),
  error_message TEXT,
  notes TEXT,
  UNIQUE(version, started_at)
);

CREATE INDEX IF NOT EXISTS idx_deployment_tracking_started_at ON deployment_tracking(started_at);
CREATE INDEX IF NOT EXISTS idx_deployment_tracking_status ON deployment_tracking(deployment_status);
";

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("migration registry is empty")]
    EmptyRegistry,
    #[error("migration registry is not contiguous: expected version {expected}, found {found}")]
    NonContiguousRegistry { expected: i64, found: i64 },
    #[error("target schema version {target} is not registered; latest known version is {latest}")]
    UnknownTarget { target: i64, latest: i64 },
    #[error("migration v{version} ({description}) failed: {source}")]
    StepFailed {
        version: i64,
        description: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("schema version bookkeeping failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to format migration timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// One versioned schema step. `apply` runs inside the step's transaction and
/// must tolerate an already-migrated structure (`IF NOT EXISTS`).
#[derive(Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub apply: fn(&Transaction<'_>) -> rusqlite::Result<()>,
}

impl Debug for Migration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Ordered set of migration steps, validated to run 1, 2, 3, ... without gaps.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    steps: Vec<Migration>,
}

impl MigrationRegistry {
    /// # Errors
    /// Returns an error when `steps` is empty or its versions are not exactly `1..=n` in order.
    pub fn new(steps: Vec<Migration>) -> Result<Self, MigrationError> {
        if steps.is_empty() {
            return Err(MigrationError::EmptyRegistry);
        }

        for (expected, step) in (1_i64..).zip(&steps) {
            if step.version != expected {
                return Err(MigrationError::NonContiguousRegistry {
                    expected,
                    found: step.version,
                });
            }
        }

        Ok(Self { steps })
    }

    /// The steps shipped with the tracker.
    ///
    /// # Errors
    /// Only fails if the built-in list itself is malformed.
    pub fn builtin() -> Result<Self, MigrationError> {
        Self::new(vec![
            Migration {
                version: 1,
                description: "Initial schema - DICOM studies and logs",
                apply: |tx| tx.execute_batch(MIGRATION_001_SQL),
            },
            Migration {
                version: 2,
                description: "Added performance metrics table",
                apply: |tx| tx.execute_batch(MIGRATION_002_SQL),
            },
            Migration {
                version: 3,
                description: "Added deployment history tracking",
                apply: |tx| tx.execute_batch(MIGRATION_003_SQL),
            },
            Migration {
                version: 4,
                description: "Added deployment tracking with phase timings",
                apply: |tx| tx.execute_batch(MIGRATION_004_SQL),
            },
        ])
    }

    #[must_use]
    pub fn latest_version(&self) -> i64 {
        self.steps.last().map_or(0, |step| step.version)
    }

    fn pending(&self, current: i64, target: i64) -> impl Iterator<Item = &Migration> {
        self.steps.iter().filter(move |step| step.version > current && step.version <= target)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaVersionRecord {
    pub version: i64,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub before_version: i64,
    pub after_version: i64,
    pub target_version: i64,
    pub applied_versions: Vec<i64>,
}

impl MigrationReport {
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.applied_versions.len()
    }

    #[must_use]
    pub fn up_to_date(&self) -> bool {
        self.after_version >= self.target_version
    }
}

impl SqliteStore {
    /// Highest applied schema version, or `0` when `schema_version` does not exist yet.
    ///
    /// # Errors
    /// Returns an error when the version table exists but cannot be read.
    pub fn current_version(&self) -> Result<i64, MigrationError> {
        Ok(read_current_version(&self.conn)?)
    }

    /// Report the current and target versions plus the versions still to apply.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(
        &self,
        registry: &MigrationRegistry,
    ) -> Result<SchemaStatus, MigrationError> {
        let current_version = read_current_version(&self.conn)?;
        let target_version = registry.latest_version();
        let pending_versions =
            registry.pending(current_version, target_version).map(|step| step.version).collect();

        Ok(SchemaStatus { current_version, target_version, pending_versions })
    }

    /// Every applied migration, oldest first. Empty before the first migration.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn schema_history(&self) -> anyhow::Result<Vec<SchemaVersionRecord>> {
        if !table_exists(&self.conn, "schema_version")? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT version, description, applied_at FROM schema_version ORDER BY version ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut history = Vec::new();

        while let Some(row) = rows.next()? {
            let applied_at: String = row.get(2)?;
            history.push(SchemaVersionRecord {
                version: row.get(0)?,
                description: row.get(1)?,
                applied_at: parse_timestamp(&applied_at)
                    .context("failed to decode schema_version.applied_at")?,
            });
        }

        Ok(history)
    }

    /// Apply every registered step up to the registry's latest version.
    ///
    /// # Errors
    /// See [`SqliteStore::migrate_to`].
    pub fn migrate(
        &mut self,
        registry: &MigrationRegistry,
    ) -> Result<MigrationReport, MigrationError> {
        self.migrate_to(registry, registry.latest_version())
    }

    /// Apply steps in `(current_version, target]` in ascending order, one
    /// transaction per step. A failing step is rolled back and stops the run;
    /// steps committed before it stay applied.
    ///
    /// # Errors
    /// Returns [`MigrationError::UnknownTarget`] when `target` is past the registry,
    /// [`MigrationError::StepFailed`] when a step body fails, or a bookkeeping error.
    pub fn migrate_to(
        &mut self,
        registry: &MigrationRegistry,
        target: i64,
    ) -> Result<MigrationReport, MigrationError> {
        let latest = registry.latest_version();
        if target > latest {
            return Err(MigrationError::UnknownTarget { target, latest });
        }

        self.conn.execute_batch(CREATE_SCHEMA_VERSION_SQL)?;
        let before_version = read_current_version(&self.conn)?;

        if before_version >= target {
            tracing::info!(
                current_version = before_version,
                target_version = target,
                "schema is up to date"
            );
            return Ok(MigrationReport {
                before_version,
                after_version: before_version,
                target_version: target,
                applied_versions: Vec::new(),
            });
        }

        tracing::info!(
            current_version = before_version,
            target_version = target,
            "applying schema migrations"
        );

        let mut applied_versions = Vec::new();
        let mut last_applied_at = None;
        for step in registry.pending(before_version, target) {
            let applied_at = next_applied_at(last_applied_at);
            apply_step(&mut self.conn, step, applied_at).inspect_err(|err| {
                tracing::error!(version = step.version, error = %err, "migration failed");
            })?;
            last_applied_at = Some(applied_at);
            applied_versions.push(step.version);
        }

        let after_version = read_current_version(&self.conn)?;
        tracing::info!(version = after_version, "schema migrated");

        Ok(MigrationReport {
            before_version,
            after_version,
            target_version: target,
            applied_versions,
        })
    }
}

fn apply_step(
    conn: &mut Connection,
    step: &Migration,
    applied_at: OffsetDateTime,
) -> Result<(), MigrationError> {
    tracing::info!(version = step.version, description = step.description, "applying migration");

    let tx = conn.transaction()?;
    (step.apply)(&tx).map_err(|source| MigrationError::StepFailed {
        version: step.version,
        description: step.description,
        source,
    })?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_version(version, description, applied_at) VALUES (?1, ?2, ?3)",
        params![step.version, step.description, format_timestamp(applied_at)?],
    )?;
    tx.commit()?;

    tracing::info!(version = step.version, "migration applied");
    Ok(())
}

fn read_current_version(conn: &Connection) -> rusqlite::Result<i64> {
    if !table_exists(conn, "schema_version")? {
        return Ok(0);
    }
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
}

/// Keep `applied_at` strictly increasing across the steps of one run even when
/// the clock does not advance between them.
fn next_applied_at(previous: Option<OffsetDateTime>) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    match previous {
        Some(previous) if now <= previous => previous + Duration::nanoseconds(1),
        _ => now,
    }
}
