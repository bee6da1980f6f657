use crate::core::executor::{
    process_alive, signal_process_group, ExecutionMode, Launch, ProcessExecutor,
};
use crate::core::gpu::{GpuSnapshot, GpuTelemetry};
use crate::core::job::{Job, JobState, StateFields};
use crate::core::logs::LogStore;
use crate::core::permission::PermissionOracle;
use crate::core::repository::JobRepository;
use crate::core::reservation::{Reservation, ReservationTable};
use crate::core::resources::{
    check_availability, check_visibility, select_for_request, ResourceRequest, SkipReason,
};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of the allocation half of an attempt
#[derive(Debug)]
pub enum Allocation {
    Granted {
        gpu_ids: Vec<u32>,
        reservation: Reservation,
    },
    Denied(SkipReason),
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Launched {
        job_id: u32,
        gpu_ids: Vec<u32>,
        launch: Launch,
    },
    /// Job stays PENDING and is retried next pass
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub considered: usize,
    pub launched: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct Scheduler {
    repo: Arc<dyn JobRepository>,
    permissions: Arc<dyn PermissionOracle>,
    telemetry: Arc<dyn GpuTelemetry>,
    reservations: ReservationTable,
    executor: ProcessExecutor,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn reservations(&self) -> &ReservationTable {
        &self.reservations
    }

    /// Select, check and reserve GPUs for `job` without touching its state.
    pub fn allocate(&self, job: &Job) -> Result<Allocation> {
        let request = match job.requested_gpus.parse::<ResourceRequest>() {
            Ok(request) => request,
            Err(msg) => return Ok(Allocation::Denied(SkipReason::InvalidRequest(msg))),
        };

        if request == ResourceRequest::Cpu {
            return self.claim(Vec::new());
        }

        let is_admin = self
            .permissions
            .is_admin(job.user_id)
            .with_context(|| format!("Failed to look up role of user {}", job.user_id))?;
        let visible = self
            .permissions
            .visible_gpu_ids(job.user_id)
            .with_context(|| format!("Failed to look up GPUs of user {}", job.user_id))?;

        // GPUs held by in-flight launches are never candidates
        let unreserved: Vec<GpuSnapshot> = self
            .telemetry
            .snapshot()
            .into_iter()
            .filter(|g| !self.reservations.is_reserved(g.id))
            .collect();

        let floor = job.gpu_memory_limit_mb;
        let gpu_ids = match select_for_request(&request, floor, &unreserved, is_admin, &visible) {
            Ok(ids) => ids,
            Err(reason) => return Ok(Allocation::Denied(reason)),
        };
        if let Err(reason) = check_visibility(&gpu_ids, is_admin, &visible) {
            return Ok(Allocation::Denied(reason));
        }
        if let Err(reason) = check_availability(&gpu_ids, floor, &self.telemetry.snapshot()) {
            return Ok(Allocation::Denied(reason));
        }

        self.claim(gpu_ids)
    }

    fn claim(&self, gpu_ids: Vec<u32>) -> Result<Allocation> {
        Ok(match self.reservations.claim(&gpu_ids) {
            Some(reservation) => Allocation::Granted {
                gpu_ids,
                reservation,
            },
            None => Allocation::Denied(SkipReason::ReservationBusy(gpu_ids)),
        })
    }

    /// Try to move one pending job to RUNNING and launch it.
    pub async fn attempt(&self, job: &Job) -> Result<AttemptOutcome> {
        let (gpu_ids, reservation) = match self.allocate(job)? {
            Allocation::Granted {
                gpu_ids,
                reservation,
            } => (gpu_ids, reservation),
            Allocation::Denied(reason) => {
                tracing::debug!("Job {} stays pending: {}", job.id, reason);
                return Ok(AttemptOutcome::Skipped(reason));
            }
        };

        let fields = StateFields::started(Utc::now(), gpu_ids.clone());
        let rows = self
            .repo
            .compare_and_set_state(job.id, JobState::Pending, JobState::Running, &fields)
            .with_context(|| format!("Failed to mark job {} running", job.id))?;
        if rows == 0 {
            tracing::debug!("Job {} changed concurrently, skipping", job.id);
            return Ok(AttemptOutcome::Skipped(SkipReason::StateChanged));
        }

        let launch = self.executor.launch(job, &gpu_ids, reservation).await?;
        Ok(AttemptOutcome::Launched {
            job_id: job.id,
            gpu_ids,
            launch,
        })
    }

    /// One sweep over the pending queue in priority order.
    ///
    /// Errors on individual jobs are logged and counted; only failing to
    /// read the queue aborts the pass.
    pub async fn run_pass(&self) -> Result<PassSummary> {
        let pending = self
            .repo
            .list_pending()
            .context("Failed to list pending jobs")?;

        let mut summary = PassSummary {
            considered: pending.len(),
            ..Default::default()
        };
        for job in &pending {
            match self.attempt(job).await {
                Ok(AttemptOutcome::Launched { .. }) => summary.launched += 1,
                Ok(AttemptOutcome::Skipped(_)) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!("Failed to schedule job {}: {:#}", job.id, e);
                    summary.errors += 1;
                }
            }
        }

        if summary.considered > 0 {
            tracing::debug!("Scheduling pass: {:?}", summary);
        }
        Ok(summary)
    }

    /// Run passes every `poll_interval` until `shutdown` resolves.
    pub async fn run<F>(&self, poll_interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(
            "Scheduler loop started (interval {:?}, {} execution)",
            poll_interval,
            self.executor.mode()
        );

        loop {
            if let Err(e) = self.run_pass().await {
                tracing::error!("Scheduling pass failed: {:#}", e);
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        tracing::info!("Scheduler loop stopped");
    }
}

pub struct SchedulerBuilder {
    repo: Option<Arc<dyn JobRepository>>,
    permissions: Option<Arc<dyn PermissionOracle>>,
    telemetry: Option<Arc<dyn GpuTelemetry>>,
    reservations: ReservationTable,
    log_store: Option<LogStore>,
    container_runtime: String,
    mode: ExecutionMode,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            repo: None,
            permissions: None,
            telemetry: None,
            reservations: ReservationTable::new(),
            log_store: None,
            container_runtime: "docker".to_string(),
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_repository(mut self, repo: Arc<dyn JobRepository>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionOracle>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn GpuTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_reservations(mut self, reservations: ReservationTable) -> Self {
        self.reservations = reservations;
        self
    }

    pub fn with_log_store(mut self, log_store: LogStore) -> Self {
        self.log_store = Some(log_store);
        self
    }

    pub fn with_container_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.container_runtime = runtime.into();
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        let repo = self
            .repo
            .ok_or_else(|| anyhow!("Scheduler requires a job repository"))?;
        let permissions = self
            .permissions
            .ok_or_else(|| anyhow!("Scheduler requires a permission oracle"))?;
        let telemetry = self
            .telemetry
            .ok_or_else(|| anyhow!("Scheduler requires GPU telemetry"))?;
        let log_store = match self.log_store {
            Some(store) => store,
            None => LogStore::new(crate::core::get_job_log_dir()?),
        };

        let executor =
            ProcessExecutor::new(repo.clone(), log_store, self.container_runtime, self.mode);
        Ok(Scheduler {
            repo,
            permissions,
            telemetry,
            reservations: self.reservations,
            executor,
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled { previous: JobState, signalled: bool },
    AlreadyFinished(JobState),
    NotFound,
}

/// Cancel a pending or running job.
///
/// Running jobs get SIGTERM on their process group once the state change
/// has been committed.
pub fn cancel_job(repo: &dyn JobRepository, id: u32) -> Result<CancelOutcome> {
    if repo.get(id)?.is_none() {
        return Ok(CancelOutcome::NotFound);
    }

    // finished_at stays empty: only SUCCESS and FAILED carry a finish time
    let fields = StateFields {
        reason: Some("cancelled".to_string()),
        ..Default::default()
    };

    if repo.compare_and_set_state(id, JobState::Pending, JobState::Cancelled, &fields)? == 1 {
        tracing::info!("Cancelled pending job {}", id);
        return Ok(CancelOutcome::Cancelled {
            previous: JobState::Pending,
            signalled: false,
        });
    }

    if repo.compare_and_set_state(id, JobState::Running, JobState::Cancelled, &fields)? == 1 {
        let pid = repo.get(id)?.and_then(|job| job.pid);
        let signalled = pid.is_some_and(|pid| signal_process_group(pid, libc::SIGTERM));
        tracing::info!("Cancelled running job {} (pid {:?}, signalled: {})", id, pid, signalled);
        return Ok(CancelOutcome::Cancelled {
            previous: JobState::Running,
            signalled,
        });
    }

    let state = repo
        .get(id)?
        .map(|job| job.state)
        .ok_or_else(|| anyhow!("Job {} disappeared while cancelling", id))?;
    Ok(CancelOutcome::AlreadyFinished(state))
}

/// Fail RUNNING jobs whose process no longer exists.
///
/// Called once at daemon start; a previous daemon that died mid-job never
/// wrote those jobs back. Jobs whose process is still alive are left alone.
pub fn recover_orphans(repo: &dyn JobRepository) -> Result<usize> {
    let mut recovered = 0;
    for job in repo.list_running()? {
        match job.pid {
            Some(pid) if process_alive(pid) => {
                tracing::warn!(
                    "Job {} is still running as pid {} from a previous daemon; it will not be written back",
                    job.id,
                    pid
                );
            }
            _ => {
                let fields = StateFields {
                    finished_at: Some(Utc::now()),
                    reason: Some("orphaned: process not found after restart".to_string()),
                    ..Default::default()
                };
                if repo.compare_and_set_state(job.id, JobState::Running, JobState::Failed, &fields)? == 1 {
                    tracing::warn!("Marked orphaned job {} as failed", job.id);
                    recovered += 1;
                }
            }
        }
    }
    Ok(recovered)
}
