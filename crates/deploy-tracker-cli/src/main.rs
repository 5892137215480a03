use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use deploy_tracker_api::{DeployTrackerApi, RecordLegacyRequest, DEFAULT_HISTORY_LIMIT};
use deploy_tracker_core::{
    CompleteDeployment, DeploymentId, FinalStatus, HostInfo, Phase, PhaseUpdate, StartDeployment,
};
use deploy_tracker_store_sqlite::{
    resolve_database_path, DATABASE_PATH_ENV, DEFAULT_DATABASE_FILE, DEFAULT_DATA_DIR,
};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "deployctl")]
#[command(about = "Deployment tracker and schema migration CLI")]
struct Cli {
    /// Database file. Falls back to `DATABASE_PATH`, then `data/gateway.db`.
    #[arg(long, env = DATABASE_PATH_ENV)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Deploy {
        #[command(subcommand)]
        command: Box<DeployCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    /// Integrity checks plus a description of tables, indexes and recent deployments.
    Check,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[arg(long)]
    target: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum DeployCommand {
    Start(StartArgs),
    Phase(PhaseArgs),
    Complete(CompleteArgs),
    Show(ShowArgs),
    History(LimitArgs),
    Latest,
    Stats,
    /// Append an entry to the legacy deployment log.
    Record(RecordArgs),
    LegacyHistory(LimitArgs),
}

#[derive(Debug, Args)]
struct StartArgs {
    #[arg(long)]
    version: String,
    #[arg(long)]
    previous_version: Option<String>,
    #[arg(long)]
    hostname: Option<String>,
    #[arg(long)]
    os_version: Option<String>,
    #[arg(long)]
    runtime_version: Option<String>,
    #[arg(long, default_value = deploy_tracker_core::DEFAULT_DEPLOYMENT_METHOD)]
    method: String,
    #[arg(long)]
    notes: Option<String>,
    /// RFC 3339 start time; defaults to now.
    #[arg(long)]
    started_at: Option<String>,
}

#[derive(Debug, Args)]
struct PhaseArgs {
    #[arg(long)]
    id: i64,
    #[arg(long, value_enum, requires = "duration")]
    phase: Option<PhaseArg>,
    #[arg(long, requires = "phase")]
    duration: Option<f64>,
    #[arg(long)]
    total_duration: Option<f64>,
    #[arg(long)]
    downtime_duration: Option<f64>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
struct CompleteArgs {
    #[arg(long)]
    id: i64,
    #[arg(long, value_enum)]
    status: StatusArg,
    #[arg(long)]
    error_message: Option<String>,
    #[arg(long)]
    total_duration: Option<f64>,
    #[arg(long)]
    downtime_duration: Option<f64>,
    #[arg(long, default_value_t = false)]
    health_check_success: bool,
    #[arg(long)]
    health_check_duration: Option<f64>,
    #[arg(long)]
    time_to_healthy: Option<f64>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct LimitArgs {
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
struct RecordArgs {
    #[arg(long)]
    version: String,
    #[arg(long, default_value = deploy_tracker_core::DEFAULT_DEPLOYMENT_METHOD)]
    method: String,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PhaseArg {
    Extract,
    Rebuild,
    Migration,
    Cutover,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Success,
    Failed,
}

impl From<PhaseArg> for Phase {
    fn from(value: PhaseArg) -> Self {
        match value {
            PhaseArg::Extract => Self::Extract,
            PhaseArg::Rebuild => Self::Rebuild,
            PhaseArg::Migration => Self::Migration,
            PhaseArg::Cutover => Self::Cutover,
        }
    }
}

impl From<StatusArg> for FinalStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Success => Self::Success,
            StatusArg::Failed => Self::Failed,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => run_db(*command, cli.db.as_deref()),
        Command::Deploy { command } => {
            let api = DeployTrackerApi::new(resolve_database_path(cli.db.as_deref())?);
            run_deploy(*command, &api)
        }
    }
}

fn run_db(command: DbCommand, db: Option<&Path>) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            run_db_schema_version(&DeployTrackerApi::new(resolve_database_path(db)?))
        }
        DbCommand::Migrate(args) => {
            run_db_migrate(&args, &DeployTrackerApi::new(resolve_database_path(db)?))
        }
        DbCommand::Check => run_db_check(db),
    }
}

fn run_db_schema_version(api: &DeployTrackerApi) -> Result<()> {
    let status = api.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "history": api.schema_history()?
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, api: &DeployTrackerApi) -> Result<()> {
    let result = api.migrate(args.dry_run, args.target)?;
    emit(&result)
}

fn run_db_check(db: Option<&Path>) -> Result<()> {
    // Opening a missing file would create it, so the path is checked as given.
    let path = db.map_or_else(
        || Path::new(DEFAULT_DATA_DIR).join(DEFAULT_DATABASE_FILE),
        Path::to_path_buf,
    );
    if !path.exists() {
        bail!("database file not found: {}", path.display());
    }

    let report = DeployTrackerApi::new(path).diagnose()?;
    if !report.quick_check_ok {
        tracing::warn!(message = %report.quick_check_message, "quick_check reported problems");
    }
    emit(&report)
}

fn run_deploy(command: DeployCommand, api: &DeployTrackerApi) -> Result<()> {
    match command {
        DeployCommand::Start(args) => {
            let started_at = args
                .started_at
                .as_deref()
                .map(|raw| {
                    OffsetDateTime::parse(raw, &Rfc3339)
                        .with_context(|| format!("invalid --started-at timestamp: {raw}"))
                })
                .transpose()?;
            let request = StartDeployment {
                version: args.version,
                previous_version: args.previous_version,
                host: HostInfo {
                    hostname: args.hostname,
                    os_version: args.os_version,
                    runtime_version: args.runtime_version,
                },
                method: args.method,
                notes: args.notes,
                started_at,
            };
            emit(&api.start_deployment(&request)?)
        }
        DeployCommand::Phase(args) => {
            let mut update = PhaseUpdate {
                total_duration: args.total_duration,
                downtime_duration: args.downtime_duration,
                notes: args.notes,
                ..PhaseUpdate::default()
            };
            if let (Some(phase), Some(seconds)) = (args.phase, args.duration) {
                update = update.with_phase(phase.into(), seconds);
            }
            let id = DeploymentId(args.id);
            api.report_phase(id, &update)?;
            emit(&api.deployment(id)?)
        }
        DeployCommand::Complete(args) => {
            let request = CompleteDeployment {
                status: args.status.into(),
                error_message: args.error_message,
                total_duration: args.total_duration,
                downtime_duration: args.downtime_duration,
                health_check_success: args.health_check_success,
                health_check_duration: args.health_check_duration,
                time_to_healthy: args.time_to_healthy,
            };
            let id = DeploymentId(args.id);
            api.complete_deployment(id, &request)?;
            emit(&api.deployment(id)?)
        }
        DeployCommand::Show(args) => emit(&api.deployment(DeploymentId(args.id))?),
        DeployCommand::History(args) => emit(&api.history(args.limit)?),
        DeployCommand::Latest => emit(&api.latest()?),
        DeployCommand::Stats => emit(&api.statistics()?),
        DeployCommand::Record(args) => {
            let id = api.record_legacy_deployment(&RecordLegacyRequest {
                version: args.version,
                method: args.method,
                notes: args.notes,
            })?;
            emit_json(serde_json::json!({ "id": id }))
        }
        DeployCommand::LegacyHistory(args) => emit(&api.legacy_history(args.limit)?),
    }
}
