use crate::core::logs::SavedLogs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use strum::{Display, EnumIter, EnumString};

/// Default scheduling priority for new jobs. Higher runs first.
pub const DEFAULT_PRIORITY: i32 = 100;

#[derive(
    Debug,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Display,
    EnumIter,
    EnumString,
)]
pub enum JobState {
    #[default]
    #[strum(to_string = "Pending")]
    Pending,
    #[strum(to_string = "Running")]
    Running,
    #[strum(to_string = "Success")]
    Success,
    #[strum(to_string = "Failed")]
    Failed,
    #[strum(to_string = "Cancelled")]
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal lifecycle edge.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Job {
    /// Assigned by the repository on insert
    pub id: u32,
    pub user_id: u32,
    pub name: String,

    // Request
    pub command: String,
    pub working_dir: PathBuf,
    pub image: Option<String>,
    pub container_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub requested_gpus: String,
    pub gpu_memory_limit_mb: Option<u64>,
    pub priority: i32,

    // Lifecycle
    pub state: JobState,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub gpu_ids: Vec<u32>,

    // Result
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub stdout_snippet: Option<String>,
    pub stderr_snippet: Option<String>,
}

impl Job {
    pub fn builder() -> JobBuilder {
        JobBuilder::new()
    }

    pub fn is_containerized(&self) -> bool {
        self.image.as_deref().is_some_and(|i| !i.trim().is_empty())
    }

    pub fn apply_logs(&mut self, logs: &SavedLogs) {
        self.stdout_path = logs.stdout_path.clone();
        self.stderr_path = logs.stderr_path.clone();
        self.stdout_snippet = Some(logs.stdout_snippet.clone());
        self.stderr_snippet = Some(logs.stderr_snippet.clone());
    }
}

#[derive(Default)]
pub struct JobBuilder {
    user_id: u32,
    name: String,
    command: String,
    working_dir: PathBuf,
    image: Option<String>,
    container_args: Vec<String>,
    env: BTreeMap<String, String>,
    requested_gpus: String,
    gpu_memory_limit_mb: Option<u64>,
    priority: i32,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            requested_gpus: "CPU".to_string(),
            ..Default::default()
        }
    }

    pub fn user_id(mut self, user_id: u32) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }

    pub fn container_args(mut self, args: Vec<String>) -> Self {
        self.container_args = args;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn requested_gpus(mut self, requested_gpus: impl Into<String>) -> Self {
        self.requested_gpus = requested_gpus.into();
        self
    }

    pub fn gpu_memory_limit_mb(mut self, limit: Option<u64>) -> Self {
        self.gpu_memory_limit_mb = limit;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn build(self) -> Job {
        Job {
            id: 0,
            user_id: self.user_id,
            name: self.name,
            command: self.command,
            working_dir: self.working_dir,
            image: self.image,
            container_args: self.container_args,
            env: self.env,
            requested_gpus: self.requested_gpus,
            gpu_memory_limit_mb: self.gpu_memory_limit_mb,
            priority: self.priority,
            state: JobState::Pending,
            ..Default::default()
        }
    }
}

/// Fields written alongside a conditional state change.
///
/// Only `Some` fields are touched; everything else keeps its persisted value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFields {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub gpu_ids: Option<Vec<u32>>,
    pub logs: Option<SavedLogs>,
    /// Recorded on the audit event, not on the job row
    pub reason: Option<String>,
}

impl StateFields {
    pub fn started(at: DateTime<Utc>, gpu_ids: Vec<u32>) -> Self {
        Self {
            started_at: Some(at),
            gpu_ids: Some(gpu_ids),
            ..Default::default()
        }
    }

    pub fn finished(at: DateTime<Utc>, logs: SavedLogs) -> Self {
        Self {
            finished_at: Some(at),
            logs: Some(logs),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Display, EnumString)]
pub enum EventType {
    Created,
    StateTransition,
}

/// Append-only audit record of a job lifecycle change
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobEvent {
    pub id: Option<i64>,
    pub job_id: u32,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub old_state: Option<JobState>,
    pub new_state: Option<JobState>,
    pub reason: Option<String>,
    pub gpu_ids: Option<Vec<u32>>,
}

impl JobEvent {
    pub fn created(job_id: u32) -> Self {
        Self {
            id: None,
            job_id,
            event_type: EventType::Created,
            timestamp: Utc::now(),
            old_state: None,
            new_state: Some(JobState::Pending),
            reason: None,
            gpu_ids: None,
        }
    }

    pub fn state_transition(
        job_id: u32,
        old_state: JobState,
        new_state: JobState,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: None,
            job_id,
            event_type: EventType::StateTransition,
            timestamp: Utc::now(),
            old_state: Some(old_state),
            new_state: Some(new_state),
            reason,
            gpu_ids: None,
        }
    }

    pub fn with_gpus(mut self, gpu_ids: Option<Vec<u32>>) -> Self {
        self.gpu_ids = gpu_ids;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_terminal_states_never_transition() {
        for from in JobState::iter().filter(|s| s.is_terminal()) {
            for to in JobState::iter() {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_lifecycle_edges() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Pending.can_transition_to(JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Pending.can_transition_to(JobState::Success));
        assert!(!JobState::Running.can_transition_to(JobState::Pending));
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in JobState::iter() {
            assert_eq!(JobState::from_str(&state.to_string()).unwrap(), state);
        }
    }

    #[test]
    fn test_builder_defaults() {
        let job = Job::builder().command("echo hi").build();
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.requested_gpus, "CPU");
        assert_eq!(job.state, JobState::Pending);
        assert!(job.started_at.is_none());
        assert!(!job.is_containerized());
    }

    #[test]
    fn test_blank_image_is_host_mode() {
        let job = Job::builder().image(Some("  ".into())).build();
        assert!(!job.is_containerized());
        let job = Job::builder().image(Some("pytorch:latest".into())).build();
        assert!(job.is_containerized());
    }
}
