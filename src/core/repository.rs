use crate::core::job::{Job, JobState, StateFields};
use anyhow::Result;

/// Durable job storage used by the scheduler and executor.
///
/// `compare_and_set_state` is how every state change is written: it applies
/// `fields` and the new state only when the stored state still equals
/// `expected`, and returns the number of rows changed (0 or 1).
#[cfg_attr(test, mockall::automock)]
pub trait JobRepository: Send + Sync {
    /// Persist a new job and return its id. State is always stored as PENDING.
    fn insert(&self, job: &Job) -> Result<u32>;

    fn get(&self, id: u32) -> Result<Option<Job>>;

    /// Pending jobs, highest priority first, then oldest submission, then id.
    fn list_pending(&self) -> Result<Vec<Job>>;

    fn list_running(&self) -> Result<Vec<Job>>;

    fn compare_and_set_state(
        &self,
        id: u32,
        expected: JobState,
        new: JobState,
        fields: &StateFields,
    ) -> Result<usize>;

    fn set_pid(&self, id: u32, pid: u32) -> Result<()>;

    /// Unconditionally overwrite every mutable column of an existing job.
    ///
    /// State changes must go through `compare_and_set_state`; this is for
    /// attaching results to a job whose state is already final.
    fn save(&self, job: &Job) -> Result<()>;
}
