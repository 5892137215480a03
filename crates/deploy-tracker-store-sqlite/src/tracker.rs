use anyhow::{anyhow, Context, Result};
use deploy_tracker_core::{
    CompleteDeployment, DeploymentId, DeploymentRecord, DeploymentStatistics, DeploymentStatus,
    LegacyDeployment, PhaseUpdate, StartDeployment, TrackerError,
};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use time::OffsetDateTime;

use crate::{format_timestamp, parse_timestamp, table_exists, SqliteStore};

const DEPLOYMENT_COLUMNS: &str = "id, version, previous_version, hostname, os_version, \
     runtime_version, started_at, completed_at, extract_duration, rebuild_duration, \
     migration_duration, cutover_duration, total_duration, downtime_duration, \
     health_check_success, health_check_duration, time_to_healthy, deployment_method, \
     deployment_status, error_message, notes";

impl SqliteStore {
    /// Create an `in-progress` deployment record and return its identifier.
    ///
    /// # Errors
    /// Returns [`TrackerError::Validation`] for an invalid request,
    /// [`TrackerError::DuplicateStart`] when the same version already started at
    /// the same instant, or an error when the insert fails.
    pub fn start_deployment(&mut self, request: &StartDeployment) -> Result<DeploymentId> {
        request.validate()?;

        let started_at = request.started_at.unwrap_or_else(OffsetDateTime::now_utc);
        let started_at_raw =
            format_timestamp(started_at).context("failed to format deployment start time")?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let inserted = tx.execute(
            "INSERT INTO deployment_tracking(
                version, previous_version, hostname, os_version, runtime_version,
                started_at, deployment_method, deployment_status, notes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                request.version,
                request.previous_version,
                request.host.hostname,
                request.host.os_version,
                request.host.runtime_version,
                started_at_raw,
                request.method,
                DeploymentStatus::InProgress.as_str(),
                request.notes,
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(TrackerError::DuplicateStart {
                    version: request.version.clone(),
                    started_at: started_at_raw,
                }
                .into());
            }
            Err(err) => {
                return Err(anyhow::Error::new(err).context("failed to insert deployment record"))
            }
        }

        let id = DeploymentId(tx.last_insert_rowid());
        tx.commit().context("failed to commit deployment start")?;

        tracing::info!(deployment_id = %id, version = %request.version, "deployment started");
        Ok(id)
    }

    /// Apply the supplied phase fields to an in-progress deployment. An empty
    /// update does nothing.
    ///
    /// # Errors
    /// Returns [`TrackerError::NotFound`] for an unknown id,
    /// [`TrackerError::AlreadyCompleted`] for a finished deployment, or a
    /// validation/persistence error.
    pub fn report_phase(&mut self, id: DeploymentId, update: &PhaseUpdate) -> Result<()> {
        update.validate()?;
        if update.is_empty() {
            tracing::debug!(deployment_id = %id, "empty phase update ignored");
            return Ok(());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        ensure_in_progress(&tx, id)?;
        tx.execute(
            "UPDATE deployment_tracking SET
                extract_duration = COALESCE(?2, extract_duration),
                rebuild_duration = COALESCE(?3, rebuild_duration),
                migration_duration = COALESCE(?4, migration_duration),
                cutover_duration = COALESCE(?5, cutover_duration),
                total_duration = COALESCE(?6, total_duration),
                downtime_duration = COALESCE(?7, downtime_duration),
                notes = COALESCE(?8, notes)
             WHERE id = ?1",
            params![
                id.0,
                update.extract_duration,
                update.rebuild_duration,
                update.migration_duration,
                update.cutover_duration,
                update.total_duration,
                update.downtime_duration,
                update.notes,
            ],
        )
        .context("failed to update deployment phases")?;
        tx.commit().context("failed to commit phase update")?;

        tracing::debug!(deployment_id = %id, "deployment phases updated");
        Ok(())
    }

    /// Move an in-progress deployment to its terminal status and stamp
    /// `completed_at`. Totals reported earlier through [`Self::report_phase`]
    /// are kept when the completion leaves them unset.
    ///
    /// # Errors
    /// Returns [`TrackerError::NotFound`] for an unknown id,
    /// [`TrackerError::AlreadyCompleted`] when it was already completed, or a
    /// validation/persistence error.
    pub fn complete_deployment(
        &mut self,
        id: DeploymentId,
        request: &CompleteDeployment,
    ) -> Result<()> {
        request.validate()?;
        let status = DeploymentStatus::from(request.status);
        let completed_at = format_timestamp(OffsetDateTime::now_utc())
            .context("failed to format deployment completion time")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        ensure_in_progress(&tx, id)?;
        tx.execute(
            "UPDATE deployment_tracking SET
                completed_at = ?2,
                deployment_status = ?3,
                error_message = COALESCE(?4, error_message),
                total_duration = COALESCE(?5, total_duration),
                downtime_duration = COALESCE(?6, downtime_duration),
                health_check_success = ?7,
                health_check_duration = ?8,
                time_to_healthy = ?9
             WHERE id = ?1",
            params![
                id.0,
                completed_at,
                status.as_str(),
                request.error_message,
                request.total_duration,
                request.downtime_duration,
                request.health_check_success,
                request.health_check_duration,
                request.time_to_healthy,
            ],
        )
        .context("failed to complete deployment")?;
        tx.commit().context("failed to commit deployment completion")?;

        match status {
            DeploymentStatus::Failed => tracing::warn!(
                deployment_id = %id,
                error = request.error_message.as_deref().unwrap_or_default(),
                "deployment failed"
            ),
            _ => tracing::info!(
                deployment_id = %id,
                health_check_success = request.health_check_success,
                "deployment completed"
            ),
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn deployment(&self, id: DeploymentId) -> Result<Option<DeploymentRecord>> {
        if !self.has_tracking_table()? {
            return Ok(None);
        }

        let query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployment_tracking WHERE id = ?1");
        let mut stmt = self.conn.prepare(&query)?;
        let mut rows = stmt.query(params![id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_deployment(row)?)),
            None => Ok(None),
        }
    }

    /// Deployments ordered newest `started_at` first, at most `limit` of them.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn history(&self, limit: usize) -> Result<Vec<DeploymentRecord>> {
        if !self.has_tracking_table()? {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployment_tracking
             ORDER BY started_at DESC, id DESC
             LIMIT ?1"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let mut rows = stmt.query(params![i64::try_from(limit).unwrap_or(i64::MAX)])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            records.push(read_deployment(row)?);
        }

        Ok(records)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn latest(&self) -> Result<Option<DeploymentRecord>> {
        Ok(self.history(1)?.into_iter().next())
    }

    /// Aggregate statistics over completed deployments. In-progress rows are
    /// ignored and NULL durations do not count towards averages.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn statistics(&self) -> Result<DeploymentStatistics> {
        if !self.has_tracking_table()? {
            return Ok(DeploymentStatistics::default());
        }

        let stats = self
            .conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN deployment_status = 'success' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN deployment_status = 'failed' THEN 1 ELSE 0 END), 0),
                    AVG(total_duration),
                    MIN(total_duration),
                    MAX(total_duration),
                    AVG(downtime_duration),
                    AVG(CASE WHEN health_check_success = 1 THEN health_check_duration END)
                 FROM deployment_tracking
                 WHERE deployment_status != 'in-progress'",
                [],
                |row| {
                    Ok(DeploymentStatistics {
                        total_deployments: count(row.get(0)?),
                        successful_deployments: count(row.get(1)?),
                        failed_deployments: count(row.get(2)?),
                        avg_duration: row.get(3)?,
                        min_duration: row.get(4)?,
                        max_duration: row.get(5)?,
                        avg_downtime: row.get(6)?,
                        avg_health_check_time: row.get(7)?,
                    })
                },
            )
            .context("failed to aggregate deployment statistics")?;

        Ok(stats)
    }

    /// Append one row to the legacy `deployment_history` log.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn record_legacy_deployment(
        &mut self,
        version: &str,
        method: &str,
        notes: Option<&str>,
    ) -> Result<i64> {
        if version.trim().is_empty() {
            return Err(TrackerError::Validation("version MUST be non-empty".to_string()).into());
        }

        let deployed_at = format_timestamp(OffsetDateTime::now_utc())
            .context("failed to format deployment time")?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO deployment_history(version, deployed_at, deployment_method, notes)
             VALUES (?1, ?2, ?3, ?4)",
            params![version, deployed_at, method, notes],
        )
        .context("failed to insert legacy deployment")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit legacy deployment")?;
        Ok(id)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn legacy_history(&self, limit: usize) -> Result<Vec<LegacyDeployment>> {
        if !table_exists(&self.conn, "deployment_history")? {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, version, deployed_at, deployment_method, notes
             FROM deployment_history
             ORDER BY julianday(deployed_at) DESC, id DESC
             LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![i64::try_from(limit).unwrap_or(i64::MAX)])?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            let deployed_at: String = row.get(2)?;
            entries.push(LegacyDeployment {
                id: row.get(0)?,
                version: row.get(1)?,
                deployed_at: parse_timestamp(&deployed_at)?,
                deployment_method: row
                    .get::<_, Option<String>>(3)?
                    .unwrap_or_else(|| deploy_tracker_core::DEFAULT_DEPLOYMENT_METHOD.to_string()),
                notes: row.get(4)?,
            });
        }

        Ok(entries)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn current_legacy_deployment(&self) -> Result<Option<LegacyDeployment>> {
        Ok(self.legacy_history(1)?.into_iter().next())
    }

    fn has_tracking_table(&self) -> Result<bool> {
        table_exists(&self.conn, "deployment_tracking")
            .context("failed to check for deployment_tracking table")
    }
}

fn ensure_in_progress(tx: &Transaction<'_>, id: DeploymentId) -> Result<()> {
    let status_raw = tx
        .query_row(
            "SELECT deployment_status FROM deployment_tracking WHERE id = ?1",
            params![id.0],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to look up deployment status")?;

    let Some(status_raw) = status_raw else {
        return Err(TrackerError::NotFound(id).into());
    };
    let status = DeploymentStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("unknown deployment_status: {status_raw}"))?;
    if status.is_terminal() {
        return Err(TrackerError::AlreadyCompleted { id, status }.into());
    }

    Ok(())
}

fn read_deployment(row: &Row<'_>) -> Result<DeploymentRecord> {
    let started_at: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;
    let status_raw: String = row.get(18)?;

    Ok(DeploymentRecord {
        id: DeploymentId(row.get(0)?),
        version: row.get(1)?,
        previous_version: row.get(2)?,
        hostname: row.get(3)?,
        os_version: row.get(4)?,
        runtime_version: row.get(5)?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        extract_duration: row.get(8)?,
        rebuild_duration: row.get(9)?,
        migration_duration: row.get(10)?,
        cutover_duration: row.get(11)?,
        total_duration: row.get(12)?,
        downtime_duration: row.get(13)?,
        health_check_success: row.get(14)?,
        health_check_duration: row.get(15)?,
        time_to_healthy: row.get(16)?,
        deployment_method: row.get(17)?,
        status: DeploymentStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown deployment_status: {status_raw}"))?,
        error_message: row.get(19)?,
        notes: row.get(20)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::thread;

    use anyhow::{anyhow, Result};
    use deploy_tracker_core::{FinalStatus, HostInfo, Phase};
    use proptest::prelude::*;
    use time::Duration;
    use ulid::Ulid;

    use super::*;
    use crate::MigrationRegistry;

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate(&MigrationRegistry::builtin()?)?;
        Ok(store)
    }

    fn start_at(version: &str, started_at: OffsetDateTime) -> StartDeployment {
        StartDeployment { started_at: Some(started_at), ..StartDeployment::new(version) }
    }

    fn tracker_error(err: &anyhow::Error) -> Option<&TrackerError> {
        err.downcast_ref::<TrackerError>()
    }

    fn base_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
    }

    // Test IDs: TTRK-001
    #[test]
    fn full_lifecycle_records_phases_and_outcome() -> Result<()> {
        let mut store = migrated_store()?;
        let request = StartDeployment {
            previous_version: Some("2.2.0".to_string()),
            host: HostInfo {
                hostname: Some("gw-01".to_string()),
                os_version: Some("Linux 6.1".to_string()),
                runtime_version: Some("3.11.4".to_string()),
            },
            notes: Some("quarterly release".to_string()),
            ..StartDeployment::new("2.3.0")
        };

        let id = store.start_deployment(&request)?;
        let started = store.deployment(id)?.ok_or_else(|| anyhow!("deployment missing"))?;
        assert_eq!(started.status, DeploymentStatus::InProgress);
        assert!(started.completed_at.is_none());
        assert_eq!(started.deployment_method, "manual");
        assert_eq!(started.hostname.as_deref(), Some("gw-01"));

        store.report_phase(id, &PhaseUpdate::phase(Phase::Extract, 1.5))?;
        store.report_phase(id, &PhaseUpdate::phase(Phase::Rebuild, 40.0))?;
        store.report_phase(
            id,
            &PhaseUpdate::phase(Phase::Migration, 2.0).with_phase(Phase::Cutover, 0.5),
        )?;
        store.complete_deployment(
            id,
            &CompleteDeployment {
                total_duration: Some(44.0),
                downtime_duration: Some(0.5),
                health_check_success: true,
                health_check_duration: Some(3.0),
                time_to_healthy: Some(3.5),
                ..CompleteDeployment::success()
            },
        )?;

        let record = store.deployment(id)?.ok_or_else(|| anyhow!("deployment missing"))?;
        assert_eq!(record.status, DeploymentStatus::Success);
        assert_eq!(record.extract_duration, Some(1.5));
        assert_eq!(record.rebuild_duration, Some(40.0));
        assert_eq!(record.migration_duration, Some(2.0));
        assert_eq!(record.cutover_duration, Some(0.5));
        assert_eq!(record.total_duration, Some(44.0));
        assert!(record.health_check_success);
        assert_eq!(record.notes.as_deref(), Some("quarterly release"));
        let completed_at = record.completed_at.ok_or_else(|| anyhow!("completed_at missing"))?;
        assert!(completed_at >= record.started_at);
        Ok(())
    }

    // Test IDs: TTRK-002
    #[test]
    fn failed_completion_keeps_error_and_phase_totals() -> Result<()> {
        let mut store = migrated_store()?;
        let id = store.start_deployment(&StartDeployment::new("2.4.0"))?;
        store.report_phase(
            id,
            &PhaseUpdate {
                total_duration: Some(12.0),
                downtime_duration: Some(4.0),
                ..PhaseUpdate::default()
            },
        )?;

        store.complete_deployment(id, &CompleteDeployment::failed("health check timeout"))?;

        let record = store.deployment(id)?.ok_or_else(|| anyhow!("deployment missing"))?;
        assert_eq!(record.status, DeploymentStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("health check timeout"));
        assert_eq!(record.total_duration, Some(12.0));
        assert_eq!(record.downtime_duration, Some(4.0));
        assert!(!record.health_check_success);
        Ok(())
    }

    // Test IDs: TTRK-003
    #[test]
    fn completed_deployments_are_frozen() -> Result<()> {
        let mut store = migrated_store()?;
        let id = store.start_deployment(&StartDeployment::new("2.5.0"))?;
        store.complete_deployment(id, &CompleteDeployment::success())?;

        let phase_err = store
            .report_phase(id, &PhaseUpdate::phase(Phase::Cutover, 1.0))
            .err()
            .ok_or_else(|| anyhow!("phase report on completed deployment must fail"))?;
        assert_eq!(
            tracker_error(&phase_err),
            Some(&TrackerError::AlreadyCompleted { id, status: DeploymentStatus::Success })
        );

        let complete_err = store
            .complete_deployment(id, &CompleteDeployment::failed("late failure"))
            .err()
            .ok_or_else(|| anyhow!("second completion must fail"))?;
        assert!(matches!(
            tracker_error(&complete_err),
            Some(TrackerError::AlreadyCompleted { .. })
        ));

        let record = store.deployment(id)?.ok_or_else(|| anyhow!("deployment missing"))?;
        assert_eq!(record.status, DeploymentStatus::Success);
        assert!(record.cutover_duration.is_none());
        assert!(record.error_message.is_none());
        Ok(())
    }

    // Test IDs: TTRK-004
    #[test]
    fn unknown_deployment_is_reported_as_not_found() -> Result<()> {
        let mut store = migrated_store()?;
        let missing = DeploymentId(404);

        let err = store
            .report_phase(missing, &PhaseUpdate::phase(Phase::Extract, 1.0))
            .err()
            .ok_or_else(|| anyhow!("phase report on unknown id must fail"))?;
        assert_eq!(tracker_error(&err), Some(&TrackerError::NotFound(missing)));

        let err = store
            .complete_deployment(missing, &CompleteDeployment::success())
            .err()
            .ok_or_else(|| anyhow!("completion of unknown id must fail"))?;
        assert_eq!(tracker_error(&err), Some(&TrackerError::NotFound(missing)));

        assert!(store.deployment(missing)?.is_none());
        Ok(())
    }

    // Test IDs: TTRK-005
    #[test]
    fn duplicate_start_instant_is_rejected() -> Result<()> {
        let mut store = migrated_store()?;
        let at = base_time();
        store.start_deployment(&start_at("3.0.0", at))?;

        let err = store
            .start_deployment(&start_at("3.0.0", at))
            .err()
            .ok_or_else(|| anyhow!("duplicate start must fail"))?;
        assert!(matches!(
            tracker_error(&err),
            Some(TrackerError::DuplicateStart { version, .. }) if version == "3.0.0"
        ));

        store.start_deployment(&start_at("3.0.0", at + Duration::nanoseconds(1)))?;
        store.start_deployment(&start_at("3.0.1", at))?;
        assert_eq!(store.history(10)?.len(), 3);
        Ok(())
    }

    // Test IDs: TTRK-006
    #[test]
    fn invalid_requests_are_rejected_before_writing() -> Result<()> {
        let mut store = migrated_store()?;
        let err = store
            .start_deployment(&StartDeployment::new(""))
            .err()
            .ok_or_else(|| anyhow!("blank version must fail"))?;
        assert!(matches!(tracker_error(&err), Some(TrackerError::Validation(_))));

        let id = store.start_deployment(&StartDeployment::new("3.1.0"))?;
        let err = store
            .report_phase(id, &PhaseUpdate::phase(Phase::Rebuild, -1.0))
            .err()
            .ok_or_else(|| anyhow!("negative duration must fail"))?;
        assert!(matches!(tracker_error(&err), Some(TrackerError::Validation(_))));

        let record = store.deployment(id)?.ok_or_else(|| anyhow!("deployment missing"))?;
        assert!(record.rebuild_duration.is_none());
        assert_eq!(store.history(10)?.len(), 1);
        Ok(())
    }

    // Test IDs: TTRK-007
    #[test]
    fn empty_phase_update_changes_nothing() -> Result<()> {
        let mut store = migrated_store()?;
        let id = store.start_deployment(&StartDeployment::new("3.2.0"))?;
        let before = store.deployment(id)?;

        store.report_phase(id, &PhaseUpdate::default())?;
        assert_eq!(store.deployment(id)?, before);
        Ok(())
    }

    // Test IDs: TTRK-008
    #[test]
    fn history_is_newest_first_and_limited() -> Result<()> {
        let mut store = migrated_store()?;
        let at = base_time();
        let oldest = store.start_deployment(&start_at("1.0.0", at))?;
        let newest = store.start_deployment(&start_at("1.2.0", at + Duration::hours(2)))?;
        let middle = store.start_deployment(&start_at("1.1.0", at + Duration::hours(1)))?;

        let ids = store.history(10)?.into_iter().map(|record| record.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![newest, middle, oldest]);

        let limited = store.history(2)?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].version, "1.2.0");
        assert!(store.history(0)?.is_empty());

        let latest = store.latest()?.ok_or_else(|| anyhow!("latest missing"))?;
        assert_eq!(latest.id, newest);
        Ok(())
    }

    // Test IDs: TTRK-009
    #[test]
    fn history_breaks_start_ties_by_insertion_order() -> Result<()> {
        let mut store = migrated_store()?;
        let at = base_time();
        let first = store.start_deployment(&start_at("4.0.0", at))?;
        let second = store.start_deployment(&start_at("4.0.1", at))?;

        let ids = store.history(10)?.into_iter().map(|record| record.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![second, first]);
        Ok(())
    }

    // Test IDs: TTRK-010
    #[test]
    fn statistics_cover_only_completed_deployments() -> Result<()> {
        let mut store = migrated_store()?;

        let ok = store.start_deployment(&StartDeployment::new("5.0.0"))?;
        store.complete_deployment(
            ok,
            &CompleteDeployment {
                total_duration: Some(30.0),
                downtime_duration: Some(2.0),
                health_check_success: true,
                health_check_duration: Some(4.0),
                ..CompleteDeployment::success()
            },
        )?;

        let failed = store.start_deployment(&StartDeployment::new("5.0.1"))?;
        store.complete_deployment(
            failed,
            &CompleteDeployment {
                total_duration: Some(10.0),
                health_check_duration: Some(60.0),
                ..CompleteDeployment::failed("rebuild failed")
            },
        )?;

        let running = store.start_deployment(&StartDeployment::new("5.0.2"))?;
        store.report_phase(
            running,
            &PhaseUpdate { total_duration: Some(999.0), ..PhaseUpdate::default() },
        )?;

        let stats = store.statistics()?;
        assert_eq!(stats.total_deployments, 2);
        assert_eq!(stats.successful_deployments, 1);
        assert_eq!(stats.failed_deployments, 1);
        assert_eq!(stats.avg_duration, Some(20.0));
        assert_eq!(stats.min_duration, Some(10.0));
        assert_eq!(stats.max_duration, Some(30.0));
        assert_eq!(stats.avg_downtime, Some(2.0));
        assert_eq!(stats.avg_health_check_time, Some(4.0));
        Ok(())
    }

    // Test IDs: TTRK-011
    #[test]
    fn statistics_are_empty_without_completed_deployments() -> Result<()> {
        let mut store = migrated_store()?;
        assert_eq!(store.statistics()?, DeploymentStatistics::default());

        store.start_deployment(&StartDeployment::new("6.0.0"))?;
        let stats = store.statistics()?;
        assert_eq!(stats.total_deployments, 0);
        assert!(stats.avg_duration.is_none());
        Ok(())
    }

    // Test IDs: TTRK-012
    #[test]
    fn reads_before_tracking_migration_are_empty() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        assert!(store.history(10)?.is_empty());
        assert!(store.latest()?.is_none());
        assert!(store.deployment(DeploymentId(1))?.is_none());
        assert_eq!(store.statistics()?, DeploymentStatistics::default());
        assert!(store.legacy_history(10)?.is_empty());

        store.migrate_to(&MigrationRegistry::builtin()?, 3)?;
        assert!(store.history(10)?.is_empty());
        assert!(store.start_deployment(&StartDeployment::new("7.0.0")).is_err());
        Ok(())
    }

    // Test IDs: TTRK-013
    #[test]
    fn legacy_log_returns_most_recent_first() -> Result<()> {
        let mut store = migrated_store()?;
        assert!(store.current_legacy_deployment()?.is_none());

        store.record_legacy_deployment("1.0.0", "manual", None)?;
        let second = store.record_legacy_deployment("1.1.0", "automated", Some("nightly"))?;

        let current =
            store.current_legacy_deployment()?.ok_or_else(|| anyhow!("legacy entry missing"))?;
        assert_eq!(current.id, second);
        assert_eq!(current.deployment_method, "automated");
        assert_eq!(current.notes.as_deref(), Some("nightly"));

        let versions = store
            .legacy_history(10)?
            .into_iter()
            .map(|entry| entry.version)
            .collect::<Vec<_>>();
        assert_eq!(versions, vec!["1.1.0".to_string(), "1.0.0".to_string()]);
        assert!(store.record_legacy_deployment(" ", "manual", None).is_err());
        Ok(())
    }

    // Test IDs: TTRK-014
    #[test]
    fn legacy_rows_with_sqlite_default_timestamp_are_readable() -> Result<()> {
        let store = migrated_store()?;
        store.conn.execute(
            "INSERT INTO deployment_history(version, notes) VALUES ('0.9.0', 'imported')",
            [],
        )?;

        let entry =
            store.current_legacy_deployment()?.ok_or_else(|| anyhow!("legacy entry missing"))?;
        assert_eq!(entry.version, "0.9.0");
        assert_eq!(entry.deployment_method, "manual");
        Ok(())
    }

    // Test IDs: TTRK-015
    #[test]
    fn legacy_log_orders_mixed_timestamp_formats_chronologically() -> Result<()> {
        let store = migrated_store()?;
        store.conn.execute(
            "INSERT INTO deployment_history(version, deployed_at)
             VALUES ('1.0.0', '2026-10-18T01:00:00.000000000Z')",
            [],
        )?;
        store.conn.execute(
            "INSERT INTO deployment_history(version, deployed_at)
             VALUES ('2.0.0', '2026-10-18 23:00:00')",
            [],
        )?;
        store.conn.execute(
            "INSERT INTO deployment_history(version, deployed_at)
             VALUES ('1.5.0', '2026-10-18T12:30:00.000000000Z')",
            [],
        )?;

        let current =
            store.current_legacy_deployment()?.ok_or_else(|| anyhow!("legacy entry missing"))?;
        assert_eq!(current.version, "2.0.0");

        let versions = store
            .legacy_history(10)?
            .into_iter()
            .map(|entry| entry.version)
            .collect::<Vec<_>>();
        assert_eq!(versions, vec!["2.0.0", "1.5.0", "1.0.0"]);
        Ok(())
    }

    // Test IDs: TCONC-002
    #[test]
    fn read_snapshot_hides_concurrent_commits() -> Result<()> {
        let db_path: PathBuf =
            std::env::temp_dir().join(format!("deploy-tracker-snapshot-{}.sqlite3", Ulid::new()));
        let mut writer = SqliteStore::open(&db_path)?;
        writer.migrate(&MigrationRegistry::builtin()?)?;
        writer.start_deployment(&StartDeployment::new("1.0.0"))?;

        let reader = SqliteStore::open(&db_path)?;
        let (before, after) = reader.read_snapshot(|store| {
            let before = store.history(10)?;
            writer.start_deployment(&StartDeployment::new("1.1.0"))?;
            let after = store.history(10)?;
            Ok((before, after))
        })?;
        assert_eq!(before.len(), 1);
        assert_eq!(after, before);
        assert_eq!(reader.history(10)?.len(), 2);

        drop(reader);
        drop(writer);
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_lifecycles_preserve_every_record() -> Result<()> {
        let db_path: PathBuf =
            std::env::temp_dir().join(format!("deploy-tracker-conc-{}.sqlite3", Ulid::new()));
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate(&MigrationRegistry::builtin()?)?;
        }

        let writer_threads = 4;
        let deployments_per_thread = 10;
        let reader_threads = 2;
        let read_iterations = 20;

        let mut handles = Vec::new();

        for writer in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteStore::open(&writer_path)?;
                for n in 0..deployments_per_thread {
                    let request = StartDeployment::new(format!("{writer}.{n}.0"));
                    let id = store.start_deployment(&request)?;
                    store.report_phase(id, &PhaseUpdate::phase(Phase::Extract, 1.0))?;
                    let done = CompleteDeployment {
                        total_duration: Some(5.0),
                        ..CompleteDeployment::success()
                    };
                    store.complete_deployment(id, &done)?;
                }
                Ok(())
            }));
        }

        for _ in 0..reader_threads {
            let reader_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let store = SqliteStore::open(&reader_path)?;
                for _ in 0..read_iterations {
                    let _ = store.history(10)?;
                    let _ = store.statistics()?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let stats = store.statistics()?;
        let expected = u64::try_from(writer_threads * deployments_per_thread)?;
        assert_eq!(stats.total_deployments, expected);
        assert_eq!(stats.successful_deployments, expected);
        assert_eq!(stats.avg_duration, Some(5.0));
        drop(store);

        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{suffix}", db_path.display()));
            if path.exists() {
                fs::remove_file(&path).with_context(|| {
                    format!("failed to cleanup sqlite file {}", path.display())
                })?;
            }
        }

        Ok(())
    }

    fn completed_outcomes() -> impl Strategy<Value = Vec<(bool, Option<f64>)>> {
        prop::collection::vec((any::<bool>(), prop::option::of(0.0_f64..10_000.0)), 0..12)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn statistics_match_completed_outcomes(
            outcomes in completed_outcomes(),
            running in 0_usize..3
        ) {
            let fail = |err: anyhow::Error| TestCaseError::fail(err.to_string());
            let mut store = migrated_store().map_err(fail)?;

            for (success, total) in &outcomes {
                let id = store.start_deployment(&StartDeployment::new("9.9.9")).map_err(fail)?;
                let status = if *success { FinalStatus::Success } else { FinalStatus::Failed };
                let request = CompleteDeployment {
                    status,
                    total_duration: *total,
                    ..CompleteDeployment::success()
                };
                store.complete_deployment(id, &request).map_err(fail)?;
            }
            for _ in 0..running {
                store.start_deployment(&StartDeployment::new("10.0.0")).map_err(fail)?;
            }

            let stats = store.statistics().map_err(fail)?;
            let successes = outcomes.iter().filter(|(success, _)| *success).count();
            prop_assert_eq!(stats.total_deployments, outcomes.len() as u64);
            prop_assert_eq!(stats.successful_deployments, successes as u64);
            prop_assert_eq!(stats.failed_deployments, (outcomes.len() - successes) as u64);

            let totals = outcomes.iter().filter_map(|(_, total)| *total).collect::<Vec<_>>();
            match stats.avg_duration {
                None => prop_assert!(totals.is_empty()),
                Some(avg) => {
                    let expected = totals.iter().sum::<f64>() / totals.len() as f64;
                    prop_assert!((avg - expected).abs() < 1e-6, "avg {} != {}", avg, expected);
                    let min = totals.iter().copied().fold(f64::INFINITY, f64::min);
                    let max = totals.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    prop_assert_eq!(stats.min_duration, Some(min));
                    prop_assert_eq!(stats.max_duration, Some(max));
                }
            }
        }
    }
}
