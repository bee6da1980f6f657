use crate::core::executor::ExecutionMode;
use crate::core::{get_config_dir, get_data_dir, get_job_log_dir};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    /// Seconds between scheduling passes, must be positive
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,
    /// `sqlite:///relative.db`, `sqlite:////abs/path.db` or a plain file
    /// path. Defaults to
    /// `<data_dir>/gsched/gsched.db`.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Where full job output is written
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    #[serde(default)]
    pub execution: ExecutionMode,
}

fn default_poll_interval_secs() -> f64 {
    2.0
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            database_url: None,
            log_dir: None,
            container_runtime: default_container_runtime(),
            execution: ExecutionMode::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        self.poll_interval()?;
        if self.container_runtime.trim().is_empty() {
            bail!("scheduler.container_runtime must not be empty");
        }
        self.database_path()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        let secs = self.poll_interval_secs;
        if !secs.is_finite() || secs <= 0.0 {
            bail!("scheduler.poll_interval_secs must be > 0, got {secs}");
        }
        Duration::try_from_secs_f64(secs)
            .with_context(|| format!("scheduler.poll_interval_secs {secs} is out of range"))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        let Some(url) = self.database_url.as_deref().map(str::trim) else {
            return Ok(get_data_dir()?.join("gsched.db"));
        };
        // sqlite:///rel.db is relative, sqlite:////abs.db is absolute
        if let Some(rest) = url.strip_prefix("sqlite://") {
            let Some(path) = rest.strip_prefix('/') else {
                bail!("Database URL '{url}' must start with sqlite:///");
            };
            if path.is_empty() {
                bail!("Database URL '{url}' has no path");
            }
            return Ok(PathBuf::from(path));
        }
        if url.contains("://") {
            bail!("Unsupported database URL '{url}': only sqlite is supported");
        }
        if url.is_empty() {
            bail!("scheduler.database_url must not be empty");
        }
        Ok(PathBuf::from(url))
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_job_log_dir(),
        }
    }
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            eprintln!("Warning: Config file {config_path:?} not found.");
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("gsched.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    let config: Config = settings
        .add_source(
            config::Environment::with_prefix("GSCHED")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")?;

    config.scheduler.validate()?;
    Ok(config)
}
