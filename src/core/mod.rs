pub mod db;
pub mod executor;
pub mod gpu;
pub mod job;
pub mod logs;
pub mod permission;
pub mod repository;
pub mod reservation;
pub mod resources;
pub mod scheduler;

use std::path::PathBuf;

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("gsched"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("gsched"))
}

/// Daemon logs, as opposed to job output
pub fn get_log_dir() -> anyhow::Result<PathBuf> {
    get_data_dir().map(|d| d.join("logs"))
}

pub fn get_job_log_dir() -> anyhow::Result<PathBuf> {
    get_data_dir().map(|d| d.join("job-logs"))
}
