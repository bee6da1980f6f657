use super::cli::Commands;
use anyhow::Result;
use gsched::config::Config;
use gsched::core::db::Database;
use gsched::core::executor::ExecutionMode;
use gsched::core::gpu::NvmlTelemetry;
use gsched::core::logs::LogStore;
use gsched::core::scheduler::Scheduler;
use std::sync::Arc;

pub mod cancel;
pub mod gpus;
pub mod run;

pub async fn handle_commands(config: &Config, command: Option<Commands>) -> Result<()> {
    match command.unwrap_or(Commands::Run) {
        Commands::Run => run::handle_run(config).await,
        Commands::Once => run::handle_once(config).await,
        Commands::Cancel { id } => cancel::handle_cancel(config, id),
        Commands::Gpus => gpus::handle_gpus(),
    }
}

pub fn open_database(config: &Config) -> Result<Arc<Database>> {
    let db = Database::new(config.scheduler.database_path()?)?;
    db.health_check()?;
    tracing::info!("Using database at {}", db.path().display());
    Ok(Arc::new(db))
}

pub fn build_scheduler(
    config: &Config,
    db: Arc<Database>,
    mode: ExecutionMode,
) -> Result<Scheduler> {
    let telemetry = NvmlTelemetry::init();
    if !telemetry.is_available() {
        tracing::warn!("No GPU telemetry, only CPU jobs can be launched");
    }
    let log_store = LogStore::new(config.scheduler.log_dir()?);
    tracing::info!("Writing job output to {}", log_store.dir().display());

    Scheduler::builder()
        .with_repository(db.clone())
        .with_permissions(db)
        .with_telemetry(Arc::new(telemetry))
        .with_log_store(log_store)
        .with_container_runtime(config.scheduler.container_runtime.clone())
        .with_execution_mode(mode)
        .build()
}
