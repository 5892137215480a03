use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use deploy_tracker_api::{
    DeployTrackerApi, HealthReport, MigrateResult, ServiceIdentity, StartDeploymentResult,
    API_CONTRACT_VERSION, DEFAULT_HISTORY_LIMIT,
};
use deploy_tracker_core::{
    CompleteDeployment, DeploymentId, DeploymentRecord, DeploymentStatistics, PhaseUpdate,
    StartDeployment, TrackerError,
};
use deploy_tracker_store_sqlite::{
    resolve_database_path, MigrationError, SchemaStatus, DATABASE_PATH_ENV,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServiceConfig;

mod config;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: DeployTrackerApi,
    identity: ServiceIdentity,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    target: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct Acknowledged {
    deployment_id: DeploymentId,
}

#[derive(Debug, Parser)]
#[command(name = "deploy-tracker-service")]
#[command(about = "Health endpoint and deployment tracking API")]
struct Args {
    #[arg(long, env = DATABASE_PATH_ENV)]
    db: Option<PathBuf>,
    #[arg(long)]
    bind: Option<SocketAddr>,
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<TrackerError>() {
            Some(TrackerError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(TrackerError::AlreadyCompleted { .. } | TrackerError::DuplicateStart { .. }) => {
                StatusCode::CONFLICT
            }
            Some(TrackerError::Validation(_)) => StatusCode::BAD_REQUEST,
            None => match err.downcast_ref::<MigrationError>() {
                Some(MigrationError::UnknownTarget { .. }) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        let message = format!("{err:#}");
        if status.is_server_error() {
            tracing::error!(error = %message, "request failed");
        }
        Self::new(status, message)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a store operation on the blocking pool so `SQLite` I/O stays off the
/// async workers.
async fn run_api<T, F>(state: &ServiceState, op: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&DeployTrackerApi) -> Result<T> + Send + 'static,
{
    let api = state.api.clone();
    let outcome = tokio::task::spawn_blocking(move || op(&api)).await.map_err(|err| {
        ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("worker task failed: {err}"))
    })?;
    outcome.map_err(ServiceError::from)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/deployments", post(deployment_start).get(deployment_history))
        .route("/v1/deployments/latest", get(deployment_latest))
        .route("/v1/deployments/stats", get(deployment_stats))
        .route("/v1/deployments/:id", get(deployment_show))
        .route("/v1/deployments/:id/phases", post(deployment_phase))
        .route("/v1/deployments/:id/complete", post(deployment_complete))
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn spawn_heartbeat(interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut count: u64 = 0;
        loop {
            ticker.tick().await;
            count += 1;
            tracing::info!(count, "heartbeat");
        }
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = ServiceConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        bind = %config.bind,
        "service starting"
    );

    let db_path = resolve_database_path(args.db.as_deref())?;
    let api = DeployTrackerApi::new(db_path);
    let migrated = tokio::task::spawn_blocking({
        let api = api.clone();
        move || api.migrate(false, None)
    })
    .await
    .context("migration task failed")??;
    tracing::info!(
        db = %api.db_path().display(),
        schema_version = migrated.after_version.unwrap_or(migrated.current_version),
        "database ready"
    );

    let state = ServiceState {
        api,
        identity: ServiceIdentity {
            service: config.service_name.clone(),
            version: config.service_version.clone(),
            runtime_version: config.runtime_version.clone(),
        },
    };

    let heartbeat = spawn_heartbeat(config.heartbeat_interval());
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let served = axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await;

    heartbeat.abort();
    tracing::info!("service stopping");
    served?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthReport> {
    let identity = state.identity.clone();
    let api = state.api.clone();
    let report = match tokio::task::spawn_blocking(move || api.health_report(&identity)).await {
        Ok(report) => report,
        Err(err) => {
            tracing::warn!(error = %err, "health report task failed");
            HealthReport {
                status: "healthy".to_string(),
                identity: state.identity.clone(),
                timestamp: time::OffsetDateTime::now_utc(),
                deployments: deploy_tracker_api::DeploymentSnapshot::Unavailable {
                    deployment_error: format!("health report task failed: {err}"),
                },
            }
        }
    };
    Json(report)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = run_api(&state, DeployTrackerApi::schema_status).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = run_api(&state, move |api| api.migrate(request.dry_run, request.target)).await?;
    Ok(Json(envelope(result)))
}

async fn deployment_start(
    State(state): State<ServiceState>,
    Json(request): Json<StartDeployment>,
) -> Result<(StatusCode, Json<ServiceEnvelope<StartDeploymentResult>>), ServiceError> {
    let started = run_api(&state, move |api| api.start_deployment(&request)).await?;
    Ok((StatusCode::CREATED, Json(envelope(started))))
}

async fn deployment_phase(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Json(update): Json<PhaseUpdate>,
) -> Result<Json<ServiceEnvelope<Acknowledged>>, ServiceError> {
    let deployment_id = DeploymentId(id);
    run_api(&state, move |api| api.report_phase(deployment_id, &update)).await?;
    Ok(Json(envelope(Acknowledged { deployment_id })))
}

async fn deployment_complete(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Json(request): Json<CompleteDeployment>,
) -> Result<Json<ServiceEnvelope<Acknowledged>>, ServiceError> {
    let deployment_id = DeploymentId(id);
    run_api(&state, move |api| api.complete_deployment(deployment_id, &request)).await?;
    Ok(Json(envelope(Acknowledged { deployment_id })))
}

async fn deployment_history(
    State(state): State<ServiceState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ServiceEnvelope<Vec<DeploymentRecord>>>, ServiceError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let records = run_api(&state, move |api| api.history(limit)).await?;
    Ok(Json(envelope(records)))
}

async fn deployment_latest(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Option<DeploymentRecord>>>, ServiceError> {
    let latest = run_api(&state, DeployTrackerApi::latest).await?;
    Ok(Json(envelope(latest)))
}

async fn deployment_stats(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<DeploymentStatistics>>, ServiceError> {
    let stats = run_api(&state, DeployTrackerApi::statistics).await?;
    Ok(Json(envelope(stats)))
}

async fn deployment_show(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<ServiceEnvelope<DeploymentRecord>>, ServiceError> {
    let record = run_api(&state, move |api| api.deployment(DeploymentId(id))).await?;
    Ok(Json(envelope(record)))
}
