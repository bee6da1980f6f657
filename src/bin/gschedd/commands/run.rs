use super::{build_scheduler, open_database};
use anyhow::Result;
use gsched::config::Config;
use gsched::core::executor::ExecutionMode;
use gsched::core::scheduler::recover_orphans;

pub async fn handle_run(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let recovered = recover_orphans(&*db)?;
    if recovered > 0 {
        tracing::warn!("Recovered {} orphaned job(s)", recovered);
    }

    let scheduler = build_scheduler(config, db, config.scheduler.execution)?;
    scheduler
        .run(config.scheduler.poll_interval()?, shutdown_signal())
        .await;
    Ok(())
}

pub async fn handle_once(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let scheduler = build_scheduler(config, db, ExecutionMode::Blocking)?;
    let summary = scheduler.run_pass().await?;
    println!(
        "considered {}, launched {}, skipped {}, errors {}",
        summary.considered, summary.launched, summary.skipped, summary.errors
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
