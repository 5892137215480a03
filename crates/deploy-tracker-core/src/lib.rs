use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const DEFAULT_DEPLOYMENT_METHOD: &str = "manual";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TrackerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("deployment {0} not found")]
    NotFound(DeploymentId),
    #[error("deployment {id} is already {status} and can no longer be modified")]
    AlreadyCompleted { id: DeploymentId, status: DeploymentStatus },
    #[error("deployment of version {version} already started at {started_at}")]
    DuplicateStart { version: String, started_at: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DeploymentId(pub i64);

impl Display for DeploymentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    InProgress,
    Success,
    Failed,
}

impl DeploymentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in-progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl Display for DeploymentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome a deployment can be completed with. `in-progress` is not a valid
/// completion status, so it has no variant here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FinalStatus {
    Success,
    Failed,
}

impl From<FinalStatus> for DeploymentStatus {
    fn from(value: FinalStatus) -> Self {
        match value {
            FinalStatus::Success => Self::Success,
            FinalStatus::Failed => Self::Failed,
        }
    }
}

/// Named sub-step of a deployment attempt whose duration is reported separately.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extract,
    Rebuild,
    Migration,
    Cutover,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub os_version: Option<String>,
    pub runtime_version: Option<String>,
}

fn default_deployment_method() -> String {
    DEFAULT_DEPLOYMENT_METHOD.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StartDeployment {
    pub version: String,
    #[serde(default)]
    pub previous_version: Option<String>,
    #[serde(default, flatten)]
    pub host: HostInfo,
    #[serde(default = "default_deployment_method")]
    pub method: String,
    #[serde(default)]
    pub notes: Option<String>,
    /// Start time override for imports and tests. Never read from request
    /// bodies; the tracker stamps new deployments with the current time.
    #[serde(skip)]
    pub started_at: Option<OffsetDateTime>,
}

impl StartDeployment {
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            previous_version: None,
            host: HostInfo::default(),
            method: default_deployment_method(),
            notes: None,
            started_at: None,
        }
    }

    /// # Errors
    /// Returns [`TrackerError::Validation`] when the version or method is blank.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.version.trim().is_empty() {
            return Err(TrackerError::Validation("version MUST be non-empty".to_string()));
        }
        if self.method.trim().is_empty() {
            return Err(TrackerError::Validation(
                "deployment method MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial update of an in-progress deployment. Only `Some` fields are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PhaseUpdate {
    pub extract_duration: Option<f64>,
    pub rebuild_duration: Option<f64>,
    pub migration_duration: Option<f64>,
    pub cutover_duration: Option<f64>,
    pub total_duration: Option<f64>,
    pub downtime_duration: Option<f64>,
    pub notes: Option<String>,
}

impl PhaseUpdate {
    #[must_use]
    pub fn phase(phase: Phase, seconds: f64) -> Self {
        Self::default().with_phase(phase, seconds)
    }

    #[must_use]
    pub fn with_phase(mut self, phase: Phase, seconds: f64) -> Self {
        let slot = match phase {
            Phase::Extract => &mut self.extract_duration,
            Phase::Rebuild => &mut self.rebuild_duration,
            Phase::Migration => &mut self.migration_duration,
            Phase::Cutover => &mut self.cutover_duration,
        };
        *slot = Some(seconds);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extract_duration.is_none()
            && self.rebuild_duration.is_none()
            && self.migration_duration.is_none()
            && self.cutover_duration.is_none()
            && self.total_duration.is_none()
            && self.downtime_duration.is_none()
            && self.notes.is_none()
    }

    /// # Errors
    /// Returns [`TrackerError::Validation`] when any supplied duration is negative or not finite.
    pub fn validate(&self) -> Result<(), TrackerError> {
        check_duration("extract_duration", self.extract_duration)?;
        check_duration("rebuild_duration", self.rebuild_duration)?;
        check_duration("migration_duration", self.migration_duration)?;
        check_duration("cutover_duration", self.cutover_duration)?;
        check_duration("total_duration", self.total_duration)?;
        check_duration("downtime_duration", self.downtime_duration)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompleteDeployment {
    pub status: FinalStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub total_duration: Option<f64>,
    #[serde(default)]
    pub downtime_duration: Option<f64>,
    #[serde(default)]
    pub health_check_success: bool,
    #[serde(default)]
    pub health_check_duration: Option<f64>,
    #[serde(default)]
    pub time_to_healthy: Option<f64>,
}

impl CompleteDeployment {
    #[must_use]
    pub fn success() -> Self {
        Self::with_status(FinalStatus::Success)
    }

    #[must_use]
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self { error_message: Some(error_message.into()), ..Self::with_status(FinalStatus::Failed) }
    }

    fn with_status(status: FinalStatus) -> Self {
        Self {
            status,
            error_message: None,
            total_duration: None,
            downtime_duration: None,
            health_check_success: false,
            health_check_duration: None,
            time_to_healthy: None,
        }
    }

    /// # Errors
    /// Returns [`TrackerError::Validation`] when any supplied duration is negative or not finite.
    pub fn validate(&self) -> Result<(), TrackerError> {
        check_duration("total_duration", self.total_duration)?;
        check_duration("downtime_duration", self.downtime_duration)?;
        check_duration("health_check_duration", self.health_check_duration)?;
        check_duration("time_to_healthy", self.time_to_healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub version: String,
    pub previous_version: Option<String>,
    pub hostname: Option<String>,
    pub os_version: Option<String>,
    pub runtime_version: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub extract_duration: Option<f64>,
    pub rebuild_duration: Option<f64>,
    pub migration_duration: Option<f64>,
    pub cutover_duration: Option<f64>,
    pub total_duration: Option<f64>,
    pub downtime_duration: Option<f64>,
    pub health_check_success: bool,
    pub health_check_duration: Option<f64>,
    pub time_to_healthy: Option<f64>,
    pub deployment_method: String,
    pub status: DeploymentStatus,
    pub error_message: Option<String>,
    pub notes: Option<String>,
}

/// Aggregates over completed (`success` or `failed`) deployments.
///
/// Averages, minimum and maximum are `None` when no completed deployment
/// carries the underlying value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStatistics {
    pub total_deployments: u64,
    pub successful_deployments: u64,
    pub failed_deployments: u64,
    pub avg_duration: Option<f64>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub avg_downtime: Option<f64>,
    pub avg_health_check_time: Option<f64>,
}

/// Row of the append-only `deployment_history` log kept for older tooling.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LegacyDeployment {
    pub id: i64,
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub deployed_at: OffsetDateTime,
    pub deployment_method: String,
    pub notes: Option<String>,
}

fn check_duration(field: &str, value: Option<f64>) -> Result<(), TrackerError> {
    match value {
        Some(seconds) if !seconds.is_finite() || seconds < 0.0 => Err(TrackerError::Validation(
            format!("{field} MUST be a non-negative number of seconds, got {seconds}"),
        )),
        _ => Ok(()),
    }
}
