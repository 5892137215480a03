use std::path::{Path, PathBuf};

use anyhow::Result;
use deploy_tracker_core::{
    CompleteDeployment, DeploymentId, DeploymentRecord, DeploymentStatistics, LegacyDeployment,
    PhaseUpdate, StartDeployment, TrackerError,
};
use deploy_tracker_store_sqlite::{
    DiagnosticReport, MigrationError, MigrationRegistry, SchemaStatus, SchemaVersionRecord,
    SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const HEALTH_RECENT_DEPLOYMENTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartDeploymentResult {
    pub deployment_id: DeploymentId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordLegacyRequest {
    pub version: String,
    #[serde(default = "default_legacy_method")]
    pub method: String,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_legacy_method() -> String {
    deploy_tracker_core::DEFAULT_DEPLOYMENT_METHOD.to_string()
}

/// Static identity the running service reports on its liveness endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub service: String,
    pub version: String,
    pub runtime_version: String,
}

/// Deployment data attached to a health report. A store failure never turns
/// into an error here; it becomes [`DeploymentSnapshot::Unavailable`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DeploymentSnapshot {
    Available {
        recent_deployments: Vec<DeploymentRecord>,
        latest_deployment: Option<Box<DeploymentRecord>>,
        deployment_statistics: DeploymentStatistics,
    },
    Unavailable {
        deployment_error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub status: String,
    #[serde(flatten)]
    pub identity: ServiceIdentity,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(flatten)]
    pub deployments: DeploymentSnapshot,
}

#[derive(Debug, Clone)]
pub struct DeployTrackerApi {
    db_path: PathBuf,
}

impl DeployTrackerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Open the store and bring it to the latest schema before a write.
    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate(&MigrationRegistry::builtin()?)?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        Ok(store.schema_status(&MigrationRegistry::builtin()?)?)
    }

    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_history(&self) -> Result<Vec<SchemaVersionRecord>> {
        self.open_store()?.schema_history()
    }

    /// Apply pending migrations up to `target` (latest when `None`), or return
    /// the planned versions in dry-run mode.
    ///
    /// # Errors
    /// Returns an error when `target` is past the latest known migration, or
    /// when planning or a migration step fails.
    pub fn migrate(&self, dry_run: bool, target: Option<i64>) -> Result<MigrateResult> {
        let registry = MigrationRegistry::builtin()?;
        let latest = registry.latest_version();
        let target_version = target.unwrap_or(latest);
        if target_version > latest {
            return Err(MigrationError::UnknownTarget { target: target_version, latest }.into());
        }

        let mut store = self.open_store()?;
        let before = store.schema_status(&registry)?;
        let would_apply_versions = before
            .pending_versions
            .into_iter()
            .filter(|version| *version <= target_version)
            .collect::<Vec<_>>();

        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version,
                would_apply_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let report = store.migrate_to(&registry, target_version)?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: report.before_version,
            target_version,
            would_apply_versions,
            after_version: Some(report.after_version),
            up_to_date: Some(report.after_version >= latest),
        })
    }

    /// Record the start of a deployment attempt.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn start_deployment(&self, request: &StartDeployment) -> Result<StartDeploymentResult> {
        let mut store = self.open_migrated_store()?;
        let deployment_id = store.start_deployment(request)?;
        Ok(StartDeploymentResult { deployment_id })
    }

    /// # Errors
    /// Returns an error when the deployment is unknown or already completed,
    /// or persistence fails.
    pub fn report_phase(&self, id: DeploymentId, update: &PhaseUpdate) -> Result<()> {
        self.open_migrated_store()?.report_phase(id, update)
    }

    /// # Errors
    /// Returns an error when the deployment is unknown or already completed,
    /// or persistence fails.
    pub fn complete_deployment(
        &self,
        id: DeploymentId,
        request: &CompleteDeployment,
    ) -> Result<()> {
        self.open_migrated_store()?.complete_deployment(id, request)
    }

    /// Fetch one deployment record.
    ///
    /// # Errors
    /// Returns [`TrackerError::NotFound`] when no record has this id.
    pub fn deployment(&self, id: DeploymentId) -> Result<DeploymentRecord> {
        self.open_store()?.deployment(id)?.ok_or_else(|| TrackerError::NotFound(id).into())
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn history(&self, limit: usize) -> Result<Vec<DeploymentRecord>> {
        self.open_store()?.history(limit)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn latest(&self) -> Result<Option<DeploymentRecord>> {
        self.open_store()?.latest()
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn statistics(&self) -> Result<DeploymentStatistics> {
        self.open_store()?.statistics()
    }

    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn record_legacy_deployment(&self, request: &RecordLegacyRequest) -> Result<i64> {
        self.open_migrated_store()?.record_legacy_deployment(
            &request.version,
            &request.method,
            request.notes.as_deref(),
        )
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn legacy_history(&self, limit: usize) -> Result<Vec<LegacyDeployment>> {
        self.open_store()?.legacy_history(limit)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn current_legacy_deployment(&self) -> Result<Option<LegacyDeployment>> {
        self.open_store()?.current_legacy_deployment()
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or inspected.
    pub fn diagnose(&self) -> Result<DiagnosticReport> {
        self.open_store()?.diagnose()
    }

    /// Build the liveness payload. Always succeeds; deployment data that
    /// cannot be read is reported through `deployment_error`.
    #[must_use]
    pub fn health_report(&self, identity: &ServiceIdentity) -> HealthReport {
        let deployments = self.deployment_snapshot().unwrap_or_else(|err| {
            let message = format!("{err:#}");
            tracing::warn!(error = %message, "deployment data unavailable for health report");
            DeploymentSnapshot::Unavailable { deployment_error: message }
        });

        HealthReport {
            status: "healthy".to_string(),
            identity: identity.clone(),
            timestamp: OffsetDateTime::now_utc(),
            deployments,
        }
    }

    fn deployment_snapshot(&self) -> Result<DeploymentSnapshot> {
        self.open_store()?.read_snapshot(|store| {
            let recent_deployments = store.history(HEALTH_RECENT_DEPLOYMENTS)?;
            let latest_deployment = store.latest()?.map(Box::new);
            let deployment_statistics = store.statistics()?;
            Ok(DeploymentSnapshot::Available {
                recent_deployments,
                latest_deployment,
                deployment_statistics,
            })
        })
    }
}
