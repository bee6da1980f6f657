use gsched::core::db::Database;
use gsched::core::executor::ExecutionMode;
use gsched::core::gpu::{GpuSnapshot, GpuTelemetry};
use gsched::core::job::{EventType, Job, JobState};
use gsched::core::logs::LogStore;
use gsched::core::permission::{Role, User};
use gsched::core::repository::JobRepository;
use gsched::core::scheduler::{PassSummary, Scheduler};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const GIB: u64 = 1024 * 1024 * 1024;
const ADMIN: u32 = 1;
const ALICE: u32 = 2;

/// Fixed telemetry for a pretend machine
struct FakeTelemetry(Vec<GpuSnapshot>);

impl FakeTelemetry {
    fn with_free(frees: &[u64]) -> Self {
        Self(
            frees
                .iter()
                .enumerate()
                .map(|(i, &free)| GpuSnapshot {
                    id: i as u32,
                    memory_total_bytes: 16 * GIB,
                    memory_free_bytes: free,
                    memory_used_bytes: 16 * GIB - free,
                    ..Default::default()
                })
                .collect(),
        )
    }
}

impl GpuTelemetry for FakeTelemetry {
    fn snapshot(&self) -> Vec<GpuSnapshot> {
        self.0.clone()
    }
}

struct Harness {
    db: Arc<Database>,
    scheduler: Scheduler,
    temp: TempDir,
}

impl Harness {
    fn new(telemetry: FakeTelemetry, mode: ExecutionMode) -> Self {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(temp.path().join("gsched.db")).unwrap());
        db.insert_user(&User::new(ADMIN, "root", Role::Admin)).unwrap();
        db.insert_user(&User::new(ALICE, "alice", Role::User).with_visible_gpus([0]))
            .unwrap();

        let scheduler = Scheduler::builder()
            .with_repository(db.clone())
            .with_permissions(db.clone())
            .with_telemetry(Arc::new(telemetry))
            .with_log_store(LogStore::new(temp.path().join("job-logs")))
            .with_execution_mode(mode)
            .build()
            .unwrap();

        Self {
            db,
            scheduler,
            temp,
        }
    }

    fn submit(&self, user_id: u32, command: &str, request: &str, floor_mb: Option<u64>) -> u32 {
        let job = Job::builder()
            .user_id(user_id)
            .name("e2e")
            .command(command)
            .working_dir(self.temp.path())
            .requested_gpus(request)
            .gpu_memory_limit_mb(floor_mb)
            .build();
        self.db.insert(&job).unwrap()
    }

    fn job(&self, id: u32) -> Job {
        self.db.get(id).unwrap().unwrap()
    }

    async fn wait_terminal(&self, id: u32) -> Job {
        for _ in 0..200 {
            let job = self.job(id);
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {id} did not finish");
    }
}

#[tokio::test]
async fn auto_request_runs_on_the_freest_gpu() {
    let h = Harness::new(
        FakeTelemetry::with_free(&[8 * GIB, 2 * GIB]),
        ExecutionMode::Blocking,
    );
    let id = h.submit(ADMIN, "echo $CUDA_VISIBLE_DEVICES; echo hello", "AUTO:1", None);

    let summary = h.scheduler.run_pass().await.unwrap();
    assert_eq!(summary.launched, 1);

    let job = h.job(id);
    assert_eq!(job.state, JobState::Success);
    assert_eq!(job.gpu_ids, vec![0]);
    assert_eq!(job.stdout_snippet.as_deref(), Some("0\nhello\n"));
    assert!(job.started_at.is_some());
    assert!(job.finished_at >= job.started_at);
    assert!(job.stdout_path.unwrap().exists());
    assert!(h.scheduler.reservations().reserved().is_empty());
}

#[tokio::test]
async fn invisible_gpu_keeps_job_pending() {
    let h = Harness::new(
        FakeTelemetry::with_free(&[8 * GIB, 8 * GIB]),
        ExecutionMode::Blocking,
    );
    let id = h.submit(ALICE, "true", "1", None);

    let summary = h.scheduler.run_pass().await.unwrap();
    assert_eq!(summary.skipped, 1);

    let job = h.job(id);
    assert_eq!(job.state, JobState::Pending);
    assert!(job.started_at.is_none());
    assert!(job.gpu_ids.is_empty());
}

#[tokio::test]
async fn too_few_eligible_gpus_keeps_job_pending() {
    let h = Harness::new(
        FakeTelemetry::with_free(&[10 * GIB, GIB]),
        ExecutionMode::Blocking,
    );
    let id = h.submit(ADMIN, "true", "AUTO:2", Some(4000));

    h.scheduler.run_pass().await.unwrap();
    assert_eq!(h.job(id).state, JobState::Pending);

    // Retried, and still pending, on the next pass
    h.scheduler.run_pass().await.unwrap();
    assert_eq!(h.job(id).state, JobState::Pending);
}

#[tokio::test]
async fn non_zero_exit_is_failed() {
    let h = Harness::new(FakeTelemetry::with_free(&[]), ExecutionMode::Blocking);
    let id = h.submit(ADMIN, "echo broken >&2; exit 1", "CPU", None);

    h.scheduler.run_pass().await.unwrap();

    let job = h.job(id);
    assert_eq!(job.state, JobState::Failed);
    assert!(job.finished_at.is_some());
    assert_eq!(job.stderr_snippet.as_deref(), Some("broken\n"));

    let events = h.db.get_job_events(id).unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::StateTransition);
    assert_eq!(last.new_state, Some(JobState::Failed));
    assert_eq!(last.reason.as_deref(), Some("exit code 1"));
}

#[tokio::test]
async fn higher_priority_starts_first() {
    let h = Harness::new(FakeTelemetry::with_free(&[]), ExecutionMode::Blocking);
    let low = h.submit(ADMIN, "true", "CPU", None);
    let high = {
        let job = Job::builder()
            .user_id(ADMIN)
            .command("true")
            .working_dir(h.temp.path())
            .priority(500)
            .build();
        h.db.insert(&job).unwrap()
    };

    h.scheduler.run_pass().await.unwrap();

    let started = |id: u32| {
        h.db.get_job_events(id)
            .unwrap()
            .into_iter()
            .find(|e| e.new_state == Some(JobState::Running))
            .and_then(|e| e.id)
            .unwrap()
    };
    assert!(started(high) < started(low));
}

#[tokio::test]
async fn single_gpu_is_never_double_allocated() {
    let h = Harness::new(
        FakeTelemetry::with_free(&[8 * GIB]),
        ExecutionMode::Background,
    );
    let first = h.submit(ADMIN, "sleep 0.5", "AUTO:1", None);
    let second = h.submit(ADMIN, "true", "AUTO:1", None);

    let summary = h.scheduler.run_pass().await.unwrap();
    assert_eq!(
        summary,
        PassSummary {
            considered: 2,
            launched: 1,
            skipped: 1,
            errors: 0
        }
    );
    assert_eq!(h.job(second).state, JobState::Pending);
    assert_eq!(h.scheduler.reservations().reserved(), vec![0]);

    let done = h.wait_terminal(first).await;
    assert_eq!(done.state, JobState::Success);

    // Write-back released the GPU, so the next pass can use it
    for _ in 0..100 {
        if h.scheduler.reservations().reserved().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    h.scheduler.run_pass().await.unwrap();
    assert_eq!(h.wait_terminal(second).await.state, JobState::Success);
}
