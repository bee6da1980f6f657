use crate::core::job::{Job, JobState, StateFields};
use crate::core::logs::{LogStore, SavedLogs};
use crate::core::repository::JobRepository;
use crate::core::reservation::Reservation;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Whether the scheduler waits for a job before moving to the next candidate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionMode {
    Blocking,
    #[default]
    Background,
}

/// GPU visibility variables for the selected ids, in a fixed order.
///
/// Empty when no GPUs were selected so host defaults are not masked.
pub fn gpu_env(gpu_ids: &[u32]) -> Vec<(String, String)> {
    if gpu_ids.is_empty() {
        return Vec::new();
    }
    let list = gpu_ids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    vec![
        ("CUDA_DEVICE_ORDER".to_string(), "PCI_BUS_ID".to_string()),
        ("CUDA_VISIBLE_DEVICES".to_string(), list.clone()),
        ("NVIDIA_VISIBLE_DEVICES".to_string(), list),
    ]
}

/// Fully resolved process invocation for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the daemon's own environment
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
}

pub fn build_launch_plan(job: &Job, gpu_ids: &[u32], container_runtime: &str) -> LaunchPlan {
    let gpu_vars = gpu_env(gpu_ids);

    let Some(image) = job.image.as_deref().filter(|_| job.is_containerized()) else {
        let env = job
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(gpu_vars)
            .collect();
        return LaunchPlan {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), job.command.clone()],
            env,
            working_dir: job.working_dir.clone(),
        };
    };

    let wd = job.working_dir.to_string_lossy();
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        format!("gsched-job-{}", job.id),
        "-v".to_string(),
        format!("{wd}:{wd}"),
        "-w".to_string(),
        wd.to_string(),
    ];
    for (key, value) in job.env.iter().map(|(k, v)| (k.as_str(), v.as_str())).chain(
        gpu_vars.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    ) {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    if !gpu_ids.is_empty() {
        let devices = gpu_ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        args.push("--gpus".to_string());
        args.push(format!("\"device={devices}\""));
    }
    args.extend(job.container_args.iter().cloned());
    args.push(image.trim().to_string());
    args.extend(["sh".to_string(), "-c".to_string(), job.command.clone()]);

    LaunchPlan {
        program: container_runtime.to_string(),
        args,
        env: Vec::new(),
        working_dir: job.working_dir.clone(),
    }
}

/// Result of handing a job to the executor
#[derive(Debug)]
pub enum Launch {
    /// Blocking mode: the job already ran and was written back
    Completed(JobState),
    /// Background mode: write-back happens when the task finishes
    Detached(JoinHandle<()>),
}

/// Spawns job processes and writes their outcome back to the repository.
#[derive(Clone)]
pub struct ProcessExecutor {
    repo: Arc<dyn JobRepository>,
    logs: LogStore,
    container_runtime: String,
    mode: ExecutionMode,
}

impl ProcessExecutor {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        logs: LogStore,
        container_runtime: impl Into<String>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            repo,
            logs,
            container_runtime: container_runtime.into(),
            mode,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Start a job that has already been moved to RUNNING.
    ///
    /// `reservation` is held until the job has been written back. A spawn
    /// failure marks the job FAILED and is returned as an error.
    pub async fn launch(
        &self,
        job: &Job,
        gpu_ids: &[u32],
        reservation: Reservation,
    ) -> Result<Launch> {
        let plan = build_launch_plan(job, gpu_ids, &self.container_runtime);
        tracing::debug!("Job {} launch plan: {:?}", job.id, plan);

        let mut std_command = std::process::Command::new(&plan.program);
        std_command
            .args(&plan.args)
            .envs(plan.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&plan.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut command = Command::from(std_command);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to spawn '{}': {e}", plan.program);
                tracing::error!("Job {}: {}", job.id, message);
                if let Err(write_err) =
                    record_exit(&*self.repo, &self.logs, job.id, None, b"", message.as_bytes())
                        .await
                {
                    tracing::error!("Job {}: failed to record spawn failure: {:#}", job.id, write_err);
                }
                drop(reservation);
                return Err(e).with_context(|| format!("Failed to spawn job {}", job.id));
            }
        };

        if let Some(pid) = child.id() {
            if let Err(e) = self.repo.set_pid(job.id, pid) {
                signal_process_group(pid, libc::SIGKILL);
                let _ = child.wait_with_output().await;
                let message = format!("Failed to record pid {pid}: {e:#}");
                if let Err(write_err) =
                    record_exit(&*self.repo, &self.logs, job.id, None, b"", message.as_bytes())
                        .await
                {
                    tracing::error!("Job {}: {:#}", job.id, write_err);
                }
                return Err(e).context(format!("Failed to record pid for job {}", job.id));
            }
            tracing::info!("Job {} started (pid {}, GPUs {:?})", job.id, pid, gpu_ids);
        }

        let repo = self.repo.clone();
        let logs = self.logs.clone();
        let job_id = job.id;
        let run = async move {
            let _reservation = reservation;
            let (code, stdout, stderr) = match child.wait_with_output().await {
                Ok(output) => (output.status.code(), output.stdout, output.stderr),
                Err(e) => (None, Vec::new(), format!("Failed to wait for job: {e}").into_bytes()),
            };
            record_exit(&*repo, &logs, job_id, code, &stdout, &stderr).await
        };

        match self.mode {
            ExecutionMode::Blocking => Ok(Launch::Completed(run.await?)),
            ExecutionMode::Background => Ok(Launch::Detached(tokio::spawn(async move {
                if let Err(e) = run.await {
                    tracing::error!("Job {}: write-back failed: {:#}", job_id, e);
                }
            }))),
        }
    }
}

/// Persist logs and move a RUNNING job to its terminal state.
///
/// `exit_code` is `None` when the process never ran or was killed by a
/// signal; that counts as failure. If the job left RUNNING in the meantime
/// (cancelled), only the logs are attached and the current state is returned.
pub async fn record_exit(
    repo: &dyn JobRepository,
    logs: &LogStore,
    job_id: u32,
    exit_code: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<JobState> {
    let saved = match logs.save(job_id, stdout, stderr).await {
        Ok(saved) => saved,
        Err(e) => {
            tracing::warn!("Job {}: keeping snippets only: {:#}", job_id, e);
            SavedLogs::in_memory(stdout, stderr)
        }
    };

    let new_state = if exit_code == Some(0) {
        JobState::Success
    } else {
        JobState::Failed
    };
    let reason = match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    };

    let fields = StateFields::finished(Utc::now(), saved.clone()).with_reason(reason);
    let rows = repo
        .compare_and_set_state(job_id, JobState::Running, new_state, &fields)
        .with_context(|| format!("Failed to record exit of job {job_id}"))?;
    if rows == 1 {
        tracing::info!("Job {} finished: {}", job_id, new_state);
        return Ok(new_state);
    }

    let mut job = repo
        .get(job_id)?
        .with_context(|| format!("Job {job_id} disappeared during write-back"))?;
    job.apply_logs(&saved);
    repo.save(&job)?;
    tracing::info!("Job {} exited after leaving RUNNING ({})", job_id, job.state);
    Ok(job.state)
}

/// Send `signal` to every process in the group led by `pid`.
pub fn signal_process_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with a negative pid targets a process group
    unsafe { libc::kill(-pgid, signal) == 0 }
}

pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs existence and permission checks
    unsafe { libc::kill(pid, 0) == 0 }
}
